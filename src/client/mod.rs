//! Asynchronous kernel client.
//!
//! The client owns the five channel sockets and runs one receive loop per
//! channel. Requests return a [`RequestHandle`] that resolves with the
//! correlated reply; iopub is a bounded broadcast; a `watch` carries the
//! authoritative execution state. Blocking conveniences (`kernel_info`,
//! `execute_interactive`, `wait_for_idle`, `wait_for_ready`) are layered on
//! top and every one takes an explicit timeout.
//!
//! Correlation works by parent id: each outbound request registers a
//! completion slot keyed by its message id; a reply whose parent id matches
//! fills the slot. Replies with an unknown parent are logged, counted, and
//! dropped. A timed-out request leaves its slot in place so the late reply
//! is recognized and discarded rather than misdelivered.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::{
    Channel, ChannelReceiver, ChannelSender, ChannelSocket, HeartbeatSocket,
};
use crate::connection::ConnectionInfo;
use crate::session::{version_supported, DigestHistory, Message, Session};
use crate::types::{ClientConfig, Error, Result, SessionConfig};

pub mod requests;
pub mod state;

pub use requests::{
    ExecuteOptions, ExecuteReply, InputRequestContent, KernelInfoReply, ShutdownReply,
};
pub use state::{
    Diagnostics, DiagnosticsSnapshot, ExecutionState, IopubSubscriber, StatusEvent,
};

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<Message>>>>;

/// A kernel-initiated input request awaiting an answer.
///
/// Send the answer through `reply`; dropping it tells the kernel input is
/// unavailable.
#[derive(Debug)]
pub struct InputPrompt {
    pub content: InputRequestContent,
    pub reply: oneshot::Sender<String>,
}

struct Shared {
    session: Session,
    config: ClientConfig,
    diagnostics: Arc<Diagnostics>,
    pending_shell: PendingMap,
    pending_control: PendingMap,
    last_shell_request: Mutex<Option<String>>,
    status_tx: watch::Sender<StatusEvent>,
    hb_alive_tx: watch::Sender<bool>,
    iopub_tx: broadcast::Sender<Message>,
    stdin_handler: Mutex<Option<mpsc::Sender<InputPrompt>>>,
}

impl Shared {
    fn pending(&self, channel: Channel) -> &PendingMap {
        match channel {
            Channel::Control => &self.pending_control,
            _ => &self.pending_shell,
        }
    }

    /// Fail every pending slot. Used on kernel death and client shutdown.
    fn fail_all_pending(&self, mk: impl Fn(&str) -> Error) {
        for map in [&self.pending_shell, &self.pending_control] {
            let drained: Vec<_> = {
                let mut guard = map.lock().expect("pending map poisoned");
                guard.drain().collect()
            };
            for (msg_id, tx) in drained {
                let _ = tx.send(Err(mk(&msg_id)));
            }
        }
    }
}

/// The five connected sockets handed to [`KernelClient::from_sockets`].
#[derive(Debug)]
pub struct ClientSockets {
    pub shell: ChannelSocket,
    pub iopub: ChannelSocket,
    pub stdin: ChannelSocket,
    pub control: ChannelSocket,
    pub heartbeat: HeartbeatSocket,
}

impl ClientSockets {
    /// Connect all five channels described by a connection descriptor.
    pub async fn connect(info: &ConnectionInfo, config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            shell: ChannelSocket::connect(info, Channel::Shell, config).await?,
            iopub: ChannelSocket::connect(info, Channel::Iopub, config).await?,
            stdin: ChannelSocket::connect(info, Channel::Stdin, config).await?,
            control: ChannelSocket::connect(info, Channel::Control, config).await?,
            heartbeat: HeartbeatSocket::connect(info, config).await?,
        })
    }
}

/// Multi-channel asynchronous client for one kernel.
pub struct KernelClient {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<StatusEvent>,
    hb_alive_rx: watch::Receiver<bool>,
    shell_tx: Arc<tokio::sync::Mutex<ChannelSender>>,
    control_tx: Arc<tokio::sync::Mutex<ChannelSender>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClient")
            .field("session", &self.shared.session.id())
            .field("state", &self.status_rx.borrow().state)
            .finish()
    }
}

impl KernelClient {
    /// Connect to the kernel described by `info` and start the channel loops.
    pub async fn connect(
        info: &ConnectionInfo,
        config: ClientConfig,
        session_config: SessionConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let session = Session::new(&info.key, &info.signature_scheme, &session_config)?;
        let sockets = ClientSockets::connect(info, &config).await?;
        Ok(Self::from_sockets(
            sockets,
            session,
            config,
            session_config,
            cancel,
        ))
    }

    /// Build a client over pre-connected sockets.
    pub fn from_sockets(
        sockets: ClientSockets,
        session: Session,
        config: ClientConfig,
        session_config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(StatusEvent::starting());
        let (hb_alive_tx, hb_alive_rx) = watch::channel(false);
        let (iopub_tx, _) = broadcast::channel(config.iopub_buffer);

        let shared = Arc::new(Shared {
            session,
            config: config.clone(),
            diagnostics: Arc::new(Diagnostics::default()),
            pending_shell: Mutex::new(HashMap::new()),
            pending_control: Mutex::new(HashMap::new()),
            last_shell_request: Mutex::new(None),
            status_tx,
            hb_alive_tx,
            iopub_tx,
            stdin_handler: Mutex::new(None),
        });

        let (shell_tx, shell_rx) = sockets.shell.into_split();
        let (control_tx, control_rx) = sockets.control.into_split();
        let (stdin_tx, stdin_rx) = sockets.stdin.into_split();
        let (_iopub_tx_half, iopub_rx) = sockets.iopub.into_split();

        let mut tasks = Vec::new();
        let digest_history = DigestHistory::with_config(&session_config);

        tasks.push(tokio::spawn(run_reply_loop(
            shell_rx,
            Some(digest_history),
            shared.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_reply_loop(
            control_rx,
            None,
            shared.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_iopub_loop(
            iopub_rx,
            shared.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_stdin_loop(
            stdin_rx,
            stdin_tx,
            shared.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_heartbeat_loop(
            sockets.heartbeat,
            shared.clone(),
            cancel.clone(),
        )));

        Self {
            shared,
            status_rx,
            hb_alive_rx,
            shell_tx: Arc::new(tokio::sync::Mutex::new(shell_tx)),
            control_tx: Arc::new(tokio::sync::Mutex::new(control_tx)),
            cancel,
            tasks,
        }
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Current kernel execution state.
    pub fn execution_state(&self) -> ExecutionState {
        self.status_rx.borrow().state
    }

    /// A receiver observing every status transition.
    pub fn status_receiver(&self) -> watch::Receiver<StatusEvent> {
        self.status_rx.clone()
    }

    /// Last heartbeat verdict. Advisory: heartbeat never drives restarts.
    pub fn heartbeat_alive(&self) -> bool {
        *self.hb_alive_rx.borrow()
    }

    /// Drop counters for every message class the client discarded.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// Subscribe to the iopub broadcast. The subscription is bounded:
    /// a slow consumer loses the oldest messages and sees a lag count.
    pub fn subscribe_iopub(&self) -> IopubSubscriber {
        IopubSubscriber {
            rx: self.shared.iopub_tx.subscribe(),
            dropped: 0,
            shared_lag: self.shared.diagnostics.clone(),
        }
    }

    /// Register as the stdin consumer, replacing any previous one.
    ///
    /// Exactly one consumer serves input requests; if the prompt is not
    /// answered within `stdin_timeout` the kernel is told input is
    /// unavailable.
    pub fn serve_stdin(&self) -> mpsc::Receiver<InputPrompt> {
        let (tx, rx) = mpsc::channel(4);
        *self
            .shared
            .stdin_handler
            .lock()
            .expect("stdin handler poisoned") = Some(tx);
        rx
    }

    /// Send a request on the shell channel.
    pub async fn send_shell(&self, msg_type: &str, content: Value) -> Result<RequestHandle> {
        self.send_request(Channel::Shell, msg_type, content).await
    }

    /// Send a request on the control channel.
    pub async fn send_control(&self, msg_type: &str, content: Value) -> Result<RequestHandle> {
        self.send_request(Channel::Control, msg_type, content).await
    }

    async fn send_request(
        &self,
        channel: Channel,
        msg_type: &str,
        content: Value,
    ) -> Result<RequestHandle> {
        let msg = self.shared.session.msg(msg_type, content);
        let msg_id = msg.msg_id().to_string();
        let parts = self.shared.session.serialize(&msg)?;

        let (slot_tx, slot_rx) = oneshot::channel();
        self.shared
            .pending(channel)
            .lock()
            .expect("pending map poisoned")
            .insert(msg_id.clone(), slot_tx);

        if channel == Channel::Shell {
            *self
                .shared
                .last_shell_request
                .lock()
                .expect("last request poisoned") = Some(msg_id.clone());
        }

        let writer = match channel {
            Channel::Control => &self.control_tx,
            _ => &self.shell_tx,
        };
        let send_result = writer.lock().await.send(&parts).await;
        if let Err(e) = send_result {
            self.shared
                .pending(channel)
                .lock()
                .expect("pending map poisoned")
                .remove(&msg_id);
            return Err(e);
        }

        tracing::debug!(channel = %channel, msg_type, msg_id = %msg_id, "request sent");
        Ok(RequestHandle {
            msg_id,
            channel,
            rx: slot_rx,
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
        })
    }

    // ── Blocking conveniences ────────────────────────────────────────────

    /// Fetch kernel info, validating the protocol version is 5.x.
    pub async fn kernel_info(&self, timeout: Duration) -> Result<KernelInfoReply> {
        let handle = self.send_shell("kernel_info_request", json!({})).await?;
        let request_id = handle.msg_id().to_string();
        let reply = handle.await_reply(timeout).await?;
        let info = KernelInfoReply::from_message(&reply)?;
        if !version_supported(&info.protocol_version) {
            return Err(Error::ProtocolMismatch {
                msg_id: Some(request_id),
                version: info.protocol_version,
            });
        }
        Ok(info)
    }

    /// Send an `execute_request`; the handle resolves with the reply.
    pub async fn execute(&self, code: &str, opts: &ExecuteOptions) -> Result<RequestHandle> {
        let (msg_type, content) = requests::execute_request(code, opts);
        self.send_shell(msg_type, content).await
    }

    /// Execute and wait until both the reply and the matching idle arrive.
    pub async fn execute_interactive(
        &self,
        code: &str,
        opts: &ExecuteOptions,
        timeout: Duration,
    ) -> Result<Message> {
        let started = Instant::now();
        let handle = self.execute(code, opts).await?;
        let request_id = handle.msg_id().to_string();
        let reply = handle.await_reply(timeout).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        self.wait_for_idle(Some(&request_id), remaining).await?;
        Ok(reply)
    }

    pub async fn inspect(
        &self,
        code: &str,
        cursor_pos: usize,
        detail_level: u8,
        timeout: Duration,
    ) -> Result<Message> {
        let (t, c) = requests::inspect_request(code, cursor_pos, detail_level);
        self.shell_round_trip(t, c, timeout).await
    }

    pub async fn complete(&self, code: &str, cursor_pos: usize, timeout: Duration) -> Result<Message> {
        let (t, c) = requests::complete_request(code, cursor_pos);
        self.shell_round_trip(t, c, timeout).await
    }

    pub async fn is_complete(&self, code: &str, timeout: Duration) -> Result<Message> {
        let (t, c) = requests::is_complete_request(code);
        self.shell_round_trip(t, c, timeout).await
    }

    pub async fn history(&self, n: usize, timeout: Duration) -> Result<Message> {
        let (t, c) = requests::history_request(n, true, false);
        self.shell_round_trip(t, c, timeout).await
    }

    pub async fn comm_info(&self, target_name: Option<&str>, timeout: Duration) -> Result<Message> {
        let (t, c) = requests::comm_info_request(target_name);
        self.shell_round_trip(t, c, timeout).await
    }

    async fn shell_round_trip(
        &self,
        msg_type: &str,
        content: Value,
        timeout: Duration,
    ) -> Result<Message> {
        let handle = self.send_shell(msg_type, content).await?;
        handle.await_reply(timeout).await
    }

    /// Ask the kernel to shut down, on the control channel.
    pub async fn shutdown_request(&self, restart: bool, timeout: Duration) -> Result<ShutdownReply> {
        let (t, c) = requests::shutdown_request(restart);
        let handle = self.send_control(t, c).await?;
        let reply = handle.await_reply(timeout).await?;
        ShutdownReply::from_message(&reply)
    }

    /// Message-mode interrupt, on the control channel.
    pub async fn interrupt_request(&self, timeout: Duration) -> Result<Message> {
        let (t, c) = requests::interrupt_request();
        let handle = self.send_control(t, c).await?;
        handle.await_reply(timeout).await
    }

    /// Block until the kernel answers a `kernel_info_request`.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let attempt_timeout = Duration::from_secs(1).min(timeout.max(Duration::from_millis(10)));
        loop {
            match self.kernel_info(attempt_timeout).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_timeout() => {}
                Err(e @ Error::Cancelled(_)) => return Err(e),
                Err(e @ Error::ProtocolMismatch { .. }) => return Err(e),
                Err(e @ Error::KernelDied { .. }) => return Err(e),
                Err(e) => {
                    tracing::debug!(error = %e, "kernel not ready yet");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(
                    Channel::Shell,
                    None,
                    "kernel did not become ready",
                ));
            }
        }
    }

    /// Block until the kernel reports idle for `msg_id` (or, if `None`, for
    /// the most recently issued shell request).
    pub async fn wait_for_idle(&self, msg_id: Option<&str>, timeout: Duration) -> Result<()> {
        let target: Option<String> = match msg_id {
            Some(id) => Some(id.to_string()),
            None => self
                .shared
                .last_shell_request
                .lock()
                .expect("last request poisoned")
                .clone(),
        };

        let deadline = Instant::now() + timeout;
        let mut rx = self.status_rx.clone();
        loop {
            {
                let event = rx.borrow_and_update();
                if event.state == ExecutionState::Dead {
                    return Err(Error::kernel_died(
                        target.clone(),
                        "kernel died while waiting for idle",
                    ));
                }
                if event.state == ExecutionState::Idle {
                    let matches = match (&target, &event.parent_msg_id) {
                        (None, _) => true,
                        (Some(want), Some(got)) => want == got,
                        (Some(_), None) => false,
                    };
                    if matches {
                        return Ok(());
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(Channel::Iopub, target, "no matching idle"));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::cancelled("wait_for_idle"));
                }
                changed = tokio::time::timeout(remaining, rx.changed()) => {
                    match changed {
                        Err(_) => {
                            return Err(Error::timeout(Channel::Iopub, target, "no matching idle"));
                        }
                        Ok(Err(_)) => {
                            return Err(Error::channel_closed(Channel::Iopub, "status stream ended"));
                        }
                        Ok(Ok(())) => {}
                    }
                }
            }
        }
    }

    /// Fail every pending request with `KernelDied` and mark the state dead.
    ///
    /// Called by the owning manager when the provisioner reports an
    /// unexpected exit; the client never infers death from heartbeat alone.
    pub fn notify_kernel_died(&self, detail: &str) {
        self.death_notifier().notify(detail);
    }

    /// A cloneable handle that can mark this client's kernel dead.
    ///
    /// Lets the owning manager push death notifications without holding the
    /// client itself (no strong manager↔client cycle).
    pub fn death_notifier(&self) -> DeathNotifier {
        DeathNotifier {
            shared: self.shared.clone(),
        }
    }

    /// Stop the channel loops and fail anything still pending.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.shared.fail_all_pending(|msg_id| {
            Error::cancelled(format!("client closed with request {} pending", msg_id))
        });
        self.shell_tx.lock().await.close().await.ok();
        self.control_tx.lock().await.close().await.ok();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Cloneable death-notification handle for one client.
#[derive(Clone)]
pub struct DeathNotifier {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DeathNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeathNotifier")
            .field("session", &self.shared.session.id())
            .finish()
    }
}

impl DeathNotifier {
    /// Fail every pending request with `KernelDied` and mark the client's
    /// execution state dead.
    pub fn notify(&self, detail: &str) {
        tracing::warn!(detail, "kernel died; failing pending requests");
        let detail = detail.to_string();
        self.shared.fail_all_pending(move |msg_id| {
            Error::kernel_died(Some(msg_id.to_string()), detail.clone())
        });
        self.shared.status_tx.send_replace(StatusEvent::dead());
        self.shared.hb_alive_tx.send_replace(false);
    }
}

/// Handle to an in-flight request.
pub struct RequestHandle {
    msg_id: String,
    channel: Channel,
    rx: oneshot::Receiver<Result<Message>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("msg_id", &self.msg_id)
            .field("channel", &self.channel)
            .finish()
    }
}

impl RequestHandle {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Wait for the correlated reply.
    ///
    /// On timeout the slot stays registered so a late reply is recognized
    /// and discarded instead of surfacing to anyone else. A zero timeout
    /// polls without waiting.
    pub async fn await_reply(mut self, timeout: Duration) -> Result<Message> {
        if timeout.is_zero() {
            return match self.rx.try_recv() {
                Ok(result) => result,
                Err(oneshot::error::TryRecvError::Empty) => Err(Error::timeout(
                    self.channel,
                    Some(self.msg_id.clone()),
                    "no reply yet (zero timeout)",
                )),
                Err(oneshot::error::TryRecvError::Closed) => Err(Error::channel_closed(
                    self.channel,
                    "client stopped before reply",
                )),
            };
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled(format!(
                "request {} cancelled while awaiting reply", self.msg_id
            ))),
            _ = tokio::time::sleep(timeout) => Err(Error::timeout(
                self.channel,
                Some(self.msg_id.clone()),
                format!("no reply within {:?}", timeout),
            )),
            result = &mut self.rx => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::channel_closed(self.channel, "client stopped before reply")),
            },
        }
    }

    /// Withdraw the request. The slot is removed and a late reply is
    /// discarded; the kernel is NOT informed. Callers wanting real
    /// cancellation interrupt the kernel on the control channel.
    pub fn cancel(self) {
        self.shared
            .pending(self.channel)
            .lock()
            .expect("pending map poisoned")
            .remove(&self.msg_id);
        tracing::debug!(msg_id = %self.msg_id, "request cancelled by caller");
    }
}

// ── Channel loops ────────────────────────────────────────────────────────

/// Shell/control receive loop: parse, verify, correlate by parent id.
async fn run_reply_loop(
    mut rx: ChannelReceiver,
    mut history: Option<DigestHistory>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let channel = rx.channel();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };

        let parts = match frame {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                tracing::debug!(channel = %channel, "peer closed");
                break;
            }
            Err(e @ Error::MalformedFrame { .. }) => {
                shared.diagnostics.count_parse_error(&e);
                tracing::warn!(channel = %channel, error = %e, "dropping malformed frame");
                continue;
            }
            Err(e) => {
                tracing::debug!(channel = %channel, error = %e, "receive loop stopped");
                break;
            }
        };

        let msg = match shared.session.deserialize(parts, channel, history.as_mut()) {
            Ok(msg) => msg,
            Err(e) => {
                shared.diagnostics.count_parse_error(&e);
                tracing::warn!(channel = %channel, error = %e, "dropping unverifiable message");
                continue;
            }
        };

        let parent_id = match msg.parent_msg_id() {
            Some(id) => id.to_string(),
            None => {
                shared
                    .diagnostics
                    .unknown_parent
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    channel = %channel,
                    msg_type = msg.msg_type(),
                    "dropping reply without parent header"
                );
                continue;
            }
        };

        let slot = shared
            .pending(channel)
            .lock()
            .expect("pending map poisoned")
            .remove(&parent_id);
        match slot {
            Some(tx) => {
                if tx.send(Ok(msg)).is_err() {
                    // Requester timed out and dropped the receiver.
                    shared
                        .diagnostics
                        .late_replies
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(channel = %channel, parent_id = %parent_id, "discarding late reply");
                }
            }
            None => {
                shared
                    .diagnostics
                    .unknown_parent
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    channel = %channel,
                    parent_id = %parent_id,
                    msg_type = msg.msg_type(),
                    "dropping reply with unknown parent id"
                );
            }
        }
    }

    // The stream is gone; nothing left in flight can complete.
    let drained: Vec<_> = {
        let mut guard = shared
            .pending(channel)
            .lock()
            .expect("pending map poisoned");
        guard.drain().collect()
    };
    for (msg_id, tx) in drained {
        let _ = tx.send(Err(Error::channel_closed(
            channel,
            format!("receive loop ended with request {} pending", msg_id),
        )));
    }
}

/// Iopub loop: track execution state from `status`, broadcast everything.
async fn run_iopub_loop(
    mut rx: ChannelReceiver,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };

        let parts = match frame {
            Ok(Some(parts)) => parts,
            Ok(None) => break,
            Err(e @ Error::MalformedFrame { .. }) => {
                shared.diagnostics.count_parse_error(&e);
                tracing::warn!(error = %e, "dropping malformed iopub frame");
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, "iopub loop stopped");
                break;
            }
        };

        // Broadcast channel: never deduplicated.
        let msg = match shared.session.deserialize(parts, Channel::Iopub, None) {
            Ok(msg) => msg,
            Err(e) => {
                shared.diagnostics.count_parse_error(&e);
                tracing::warn!(error = %e, "dropping unverifiable iopub message");
                continue;
            }
        };

        if msg.msg_type() == "status" {
            let raw_state = msg
                .content
                .get("execution_state")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match ExecutionState::parse(raw_state) {
                Some(state) => {
                    shared.status_tx.send_replace(StatusEvent {
                        state,
                        parent_msg_id: msg.parent_msg_id().map(str::to_string),
                    });
                }
                None => {
                    tracing::warn!(raw_state, "status message with unknown execution_state");
                }
            }
        }

        // No subscribers is fine; the state watch above is authoritative.
        let _ = shared.iopub_tx.send(msg);
    }
}

/// Stdin loop: forward `input_request` to the registered consumer and send
/// the answer back; abort to the kernel when nobody answers in time.
async fn run_stdin_loop(
    mut rx: ChannelReceiver,
    mut tx: ChannelSender,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };

        let parts = match frame {
            Ok(Some(parts)) => parts,
            Ok(None) => break,
            Err(e @ Error::MalformedFrame { .. }) => {
                shared.diagnostics.count_parse_error(&e);
                continue;
            }
            Err(_) => break,
        };

        let msg = match shared.session.deserialize(parts, Channel::Stdin, None) {
            Ok(msg) => msg,
            Err(e) => {
                shared.diagnostics.count_parse_error(&e);
                tracing::warn!(error = %e, "dropping unverifiable stdin message");
                continue;
            }
        };

        if msg.msg_type() != "input_request" {
            tracing::warn!(msg_type = msg.msg_type(), "unexpected stdin message type");
            continue;
        }

        let content: InputRequestContent =
            serde_json::from_value(msg.content.clone()).unwrap_or(InputRequestContent {
                prompt: String::new(),
                password: false,
            });

        let handler = shared
            .stdin_handler
            .lock()
            .expect("stdin handler poisoned")
            .clone();

        let answer = match handler {
            Some(handler) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let prompt = InputPrompt {
                    content,
                    reply: reply_tx,
                };
                if handler.send(prompt).await.is_ok() {
                    match tokio::time::timeout(shared.config.stdin_timeout, reply_rx).await {
                        Ok(Ok(value)) => Some(value),
                        _ => None,
                    }
                } else {
                    None
                }
            }
            None => None,
        };

        let (reply_type, reply_content) = match answer {
            Some(value) => requests::input_reply(&value),
            None => {
                shared
                    .diagnostics
                    .stdin_aborted
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!("input request unanswered; telling kernel input is unavailable");
                requests::input_abort_reply()
            }
        };

        let reply = shared
            .session
            .reply(&msg.header, reply_type, reply_content);
        match shared.session.serialize(&reply) {
            Ok(parts) => {
                if let Err(e) = tx.send(&parts).await {
                    tracing::debug!(error = %e, "stdin reply send failed");
                    break;
                }
            }
            Err(e) => tracing::error!(error = %e, "stdin reply serialization failed"),
        }
    }
}

/// Heartbeat loop: periodic echo, advisory liveness only.
async fn run_heartbeat_loop(
    mut hb: HeartbeatSocket,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match hb.ping(b"ping", shared.config.heartbeat_timeout).await {
            Ok(_) => {
                shared.hb_alive_tx.send_replace(true);
            }
            Err(e @ Error::ChannelClosed { .. }) => {
                tracing::debug!(error = %e, "heartbeat socket closed");
                shared.hb_alive_tx.send_replace(false);
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "heartbeat missed");
                shared.hb_alive_tx.send_replace(false);
            }
        }
    }
}
