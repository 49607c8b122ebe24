//! Kernel manager - lifecycle orchestration.
//!
//! Implements the kernel lifecycle state machine:
//! Unstarted → Starting → Running → (Restarting | Shuttingdown) → Dead
//!
//! One lifecycle operation runs at a time per manager; concurrent callers
//! wait on a per-manager async mutex. State transitions are published on a
//! `watch` channel that any listener (including clients) can observe
//! without creating a strong manager↔client cycle.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::{Channel, ChannelSocket, HeartbeatSocket};
use crate::client::{requests, KernelClient};
use crate::connection::{connection_file_path, ConnectionInfo};
use crate::kernelspec::{InterruptMode, KernelSpec};
use crate::provisioning::KernelProvisioner;
use crate::session::{Message, Session};
use crate::types::{ClientConfig, Error, KernelId, ManagerConfig, Result, SessionConfig};
use crate::Context;

#[cfg(test)]
pub(crate) mod testing;

/// Lifecycle states of a managed kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unstarted,
    Starting,
    Running,
    Restarting,
    Shuttingdown,
    Dead,
}

impl LifecycleState {
    /// Validate a transition edge of the state machine.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Unstarted, Starting)
                | (Dead, Starting)
                | (Starting, Running)
                | (Starting, Dead)
                | (Running, Restarting)
                | (Running, Shuttingdown)
                | (Running, Dead)
                | (Restarting, Running)
                | (Restarting, Dead)
                | (Shuttingdown, Dead)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Dead)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unstarted => "unstarted",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Restarting => "restarting",
            LifecycleState::Shuttingdown => "shuttingdown",
            LifecycleState::Dead => "dead",
        };
        f.write_str(name)
    }
}

struct ManagerShared {
    kernel_id: KernelId,
    spec: KernelSpec,
    config: ManagerConfig,
    client_config: ClientConfig,
    session_config: SessionConfig,
    state_tx: watch::Sender<LifecycleState>,
    cancel: CancellationToken,
}

impl ManagerShared {
    fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// Publish a transition after validating the edge.
    fn transition(&self, next: LifecycleState) -> Result<()> {
        let current = self.state();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "kernel {}: cannot go {} -> {}",
                self.kernel_id, current, next
            )));
        }
        tracing::info!(kernel_id = %self.kernel_id, from = %current, to = %next, "lifecycle transition");
        self.state_tx.send_replace(next);
        Ok(())
    }
}

struct Inner {
    provisioner: Box<dyn KernelProvisioner>,
    connection_info: Option<ConnectionInfo>,
    /// Path of the connection file we wrote; `None` in ephemeral mode.
    connection_file: Option<PathBuf>,
    ephemeral: bool,
    monitor: Option<JoinHandle<()>>,
    /// Instants of recent automatic restarts, pruned to the sliding window.
    restart_times: VecDeque<Instant>,
}

/// Owns the connection descriptor, the provisioner, and the lifecycle of
/// one kernel.
pub struct KernelManager {
    shared: Arc<ManagerShared>,
    inner: Arc<Mutex<Inner>>,
    state_rx: watch::Receiver<LifecycleState>,
}

impl fmt::Debug for KernelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManager")
            .field("kernel_id", &self.shared.kernel_id)
            .field("kernel", &self.shared.spec.display_name)
            .field("state", &self.state())
            .finish()
    }
}

/// Provisioner name selected by a spec's metadata, defaulting to "local".
fn provisioner_name(spec: &KernelSpec) -> &str {
    spec.metadata
        .get("kernel_provisioner")
        .and_then(|v| v.get("provisioner_name"))
        .and_then(|v| v.as_str())
        .unwrap_or(crate::provisioning::LOCAL_PROVISIONER)
}

impl KernelManager {
    /// Build a manager for a spec, resolving its provisioner from the
    /// context. Ephemeral mode never writes a connection file.
    pub fn new(
        context: &Context,
        spec: KernelSpec,
        config: ManagerConfig,
        client_config: ClientConfig,
        session_config: SessionConfig,
        ephemeral: bool,
    ) -> Result<Self> {
        let provisioner = context.provisioners.create(provisioner_name(&spec))?;
        let (state_tx, state_rx) = watch::channel(LifecycleState::Unstarted);
        let shared = Arc::new(ManagerShared {
            kernel_id: KernelId::new(),
            spec,
            config,
            client_config,
            session_config,
            state_tx,
            cancel: CancellationToken::new(),
        });
        Ok(Self {
            shared,
            inner: Arc::new(Mutex::new(Inner {
                provisioner,
                connection_info: None,
                connection_file: None,
                ephemeral,
                monitor: None,
                restart_times: VecDeque::new(),
            })),
            state_rx,
        })
    }

    /// Resolve `name` through the context's spec manager and build a
    /// manager for it.
    pub fn from_kernel_name(
        context: &Context,
        name: &str,
        config: ManagerConfig,
        client_config: ClientConfig,
        session_config: SessionConfig,
    ) -> Result<Self> {
        let spec = context.kernelspecs.get_kernel_spec(name)?;
        Self::new(
            context,
            spec,
            config,
            client_config,
            session_config,
            false,
        )
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.shared.kernel_id
    }

    pub fn kernel_spec(&self) -> &KernelSpec {
        &self.shared.spec
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Observe every lifecycle transition.
    pub fn state_receiver(&self) -> watch::Receiver<LifecycleState> {
        self.state_rx.clone()
    }

    /// Connection descriptor, available once started.
    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner.lock().await.connection_info.clone()
    }

    /// Connect a client to the running kernel. The client's cancellation
    /// token is a child of the manager's, so manager shutdown unwinds
    /// client operations too. While the manager lives, lifecycle deaths
    /// and restarts fail the client's pending requests with `KernelDied`.
    pub async fn client(&self) -> Result<KernelClient> {
        let info = self
            .connection_info()
            .await
            .ok_or_else(|| Error::state_transition("kernel has no connection info yet"))?;
        let client = KernelClient::connect(
            &info,
            self.shared.client_config.clone(),
            self.shared.session_config.clone(),
            self.shared.cancel.child_token(),
        )
        .await?;

        // Bridge lifecycle transitions into the client without a strong
        // cycle: the task holds only a watch receiver and a notifier.
        let notifier = client.death_notifier();
        let mut state_rx = self.state_receiver();
        let cancel = self.shared.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                match *state_rx.borrow() {
                    LifecycleState::Dead => {
                        notifier.notify("kernel manager reports kernel dead");
                        return;
                    }
                    LifecycleState::Restarting => {
                        // The old process is going away; in-flight requests
                        // against it can never complete.
                        notifier.notify("kernel restarting");
                    }
                    _ => {}
                }
            }
        });

        Ok(client)
    }

    /// Non-blocking liveness check against the provisioner.
    pub async fn is_alive(&self) -> bool {
        if self.state() != LifecycleState::Running {
            return false;
        }
        let mut inner = self.inner.lock().await;
        matches!(inner.provisioner.poll().await, Ok(None))
    }

    // ── Lifecycle operations ─────────────────────────────────────────────

    /// Launch the kernel and block until it is provably up: the
    /// provisioner reports alive and the heartbeat echoes one round trip.
    pub async fn start_kernel(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.shared.transition(LifecycleState::Starting)?;

        match start_inner(&self.shared, &mut inner).await {
            Ok(()) => {
                self.shared.transition(LifecycleState::Running)?;
                start_monitor(&self.shared, &self.inner, &mut inner);
                Ok(())
            }
            Err(e) => {
                inner.provisioner.cleanup(false).await.ok();
                self.shared.transition(LifecycleState::Dead)?;
                Err(Error::start_failed(format!(
                    "kernel {} failed to start: {}",
                    self.shared.kernel_id, e
                )))
            }
        }
    }

    /// Interrupt the running kernel, by signal or control message per the
    /// spec's `interrupt_mode`. Does not change lifecycle state.
    pub async fn interrupt_kernel(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.shared.state() != LifecycleState::Running {
            return Err(Error::state_transition(format!(
                "cannot interrupt kernel in state {}",
                self.shared.state()
            )));
        }
        match self.shared.spec.interrupt_mode() {
            InterruptMode::Signal => {
                #[cfg(unix)]
                {
                    inner
                        .provisioner
                        .send_signal(nix::sys::signal::Signal::SIGINT as i32)
                        .await
                }
                #[cfg(not(unix))]
                {
                    // No signals: fall through to the message path.
                    send_control_once(
                        &self.shared,
                        inner.connection_info.as_ref(),
                        requests::interrupt_request(),
                        self.shared.config.shutdown_timeout,
                    )
                    .await
                    .map(|_| ())
                }
            }
            InterruptMode::Message => send_control_once(
                &self.shared,
                inner.connection_info.as_ref(),
                requests::interrupt_request(),
                self.shared.config.shutdown_timeout,
            )
            .await
            .map(|_| ()),
        }
    }

    /// Restart the kernel, reusing the same connection descriptor and
    /// ports. `now` skips the graceful shutdown phase.
    pub async fn restart_kernel(&self, now: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.shared.transition(LifecycleState::Restarting)?;

        stop_process(&self.shared, &mut inner, now, true).await;

        match start_inner(&self.shared, &mut inner).await {
            Ok(()) => self.shared.transition(LifecycleState::Running),
            Err(e) => {
                inner.provisioner.cleanup(false).await.ok();
                self.shared.transition(LifecycleState::Dead)?;
                Err(Error::start_failed(format!(
                    "kernel {} failed to relaunch: {}",
                    self.shared.kernel_id, e
                )))
            }
        }
    }

    /// Shut the kernel down. `now` skips the `shutdown_request` step and
    /// goes straight to process termination.
    pub async fn shutdown_kernel(&self, now: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if matches!(
            self.shared.state(),
            LifecycleState::Unstarted | LifecycleState::Dead
        ) {
            return Ok(());
        }
        self.shared.transition(LifecycleState::Shuttingdown)?;

        if let Some(monitor) = inner.monitor.take() {
            monitor.abort();
        }

        stop_process(&self.shared, &mut inner, now, false).await;

        if let Some(path) = inner.connection_file.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "connection file not removed");
            }
        }

        self.shared.transition(LifecycleState::Dead)
    }

    /// Stop everything this manager owns, without the graceful protocol.
    pub async fn dispose(&self) {
        self.shared.cancel.cancel();
        let _ = self.shutdown_kernel(true).await;
    }
}

/// Perform the launch sequence. Caller holds the inner lock and handles
/// state transitions.
async fn start_inner(shared: &Arc<ManagerShared>, inner: &mut Inner) -> Result<()> {
    // Settle the connection descriptor once; restarts reuse it.
    let info = match inner.connection_info.clone() {
        Some(info) => info,
        None => {
            // Provisioners that materialize the connection out-of-band win.
            let info = match inner.provisioner.connection_info() {
                Some(info) => info,
                None => ConnectionInfo::ephemeral("127.0.0.1", &shared.spec.language)?,
            };
            info.validate()?;
            inner.connection_info = Some(info.clone());
            info
        }
    };

    let connection_file = match (&inner.connection_file, inner.ephemeral) {
        (Some(path), _) => path.clone(),
        (None, true) => {
            // Never written; the path is only a template for argv.
            connection_file_path(shared.kernel_id.as_str())
        }
        (None, false) => {
            let path = connection_file_path(shared.kernel_id.as_str());
            info.write(&path)?;
            inner.connection_file = Some(path.clone());
            path
        }
    };

    inner.provisioner.load_connection_info(&info);
    let command = inner
        .provisioner
        .pre_launch(&shared.spec, &connection_file)
        .await?;
    inner.provisioner.launch(command).await?;

    // Provisioners that materialize the connection out-of-band only know
    // their endpoints after launch; adopt theirs if it differs.
    let info = match inner.provisioner.connection_info() {
        Some(materialized) if materialized != info => {
            materialized.validate()?;
            if let Some(path) = &inner.connection_file {
                materialized.write(path)?;
            }
            inner.connection_info = Some(materialized.clone());
            materialized
        }
        _ => info,
    };

    // Provably up: still alive AND one heartbeat echo.
    let deadline = Instant::now() + shared.config.startup_timeout;
    loop {
        if shared.cancel.is_cancelled() {
            return Err(Error::cancelled("start_kernel"));
        }
        if let Some(code) = inner.provisioner.poll().await? {
            return Err(Error::start_failed(format!(
                "kernel process exited with code {} during startup",
                code
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::timeout(
                Channel::Heartbeat,
                None,
                "kernel did not answer heartbeat before startup_timeout",
            ));
        }

        match heartbeat_once(&info, &shared.client_config).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "kernel not up yet");
                tokio::time::sleep(Duration::from_millis(100).min(remaining)).await;
            }
        }
    }
}

async fn heartbeat_once(info: &ConnectionInfo, config: &ClientConfig) -> Result<()> {
    let mut hb = HeartbeatSocket::connect(info, config).await?;
    hb.ping(b"ping", config.heartbeat_timeout).await?;
    hb.close().await.ok();
    Ok(())
}

/// Bring the kernel process down: optional graceful request, then
/// terminate, then kill, then cleanup.
async fn stop_process(shared: &Arc<ManagerShared>, inner: &mut Inner, now: bool, restart: bool) {
    let grace = if restart {
        shared.config.restart_timeout
    } else {
        shared.config.shutdown_timeout
    };

    if !now {
        match send_control_once(
            shared,
            inner.connection_info.as_ref(),
            requests::shutdown_request(restart),
            grace,
        )
        .await
        {
            Ok(reply) => {
                tracing::debug!(msg_type = reply.msg_type(), "graceful shutdown acknowledged");
                // Give the process a moment to act on the reply.
                if let Ok(Some(code)) = inner.provisioner.wait(grace).await {
                    tracing::debug!(code, "kernel exited gracefully");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "graceful shutdown request failed; escalating");
            }
        }
    }

    if matches!(inner.provisioner.poll().await, Ok(None)) {
        inner.provisioner.terminate().await.ok();
        match inner.provisioner.wait(grace).await {
            Ok(Some(_)) => {}
            _ => {
                tracing::warn!("kernel ignored terminate; killing");
                inner.provisioner.kill().await.ok();
                inner.provisioner.wait(grace).await.ok();
            }
        }
    }

    inner.provisioner.cleanup(restart).await.ok();
}

/// One-shot request on the control channel, without a full client.
async fn send_control_once(
    shared: &Arc<ManagerShared>,
    info: Option<&ConnectionInfo>,
    (msg_type, content): (&str, serde_json::Value),
    timeout: Duration,
) -> Result<Message> {
    let info = info.ok_or_else(|| Error::state_transition("kernel has no connection info"))?;
    let session = Session::new(&info.key, &info.signature_scheme, &shared.session_config)?;
    let mut socket = ChannelSocket::connect(info, Channel::Control, &shared.client_config).await?;

    let msg = session.msg(msg_type, content);
    let msg_id = msg.msg_id().to_string();
    socket.send(&session.serialize(&msg)?).await?;

    let reply = loop {
        let parts = tokio::time::timeout(timeout, socket.recv())
            .await
            .map_err(|_| {
                Error::timeout(Channel::Control, Some(msg_id.clone()), "no control reply")
            })??
            .ok_or_else(|| Error::channel_closed(Channel::Control, "peer closed"))?;
        let reply = session.deserialize(parts, Channel::Control, None)?;
        if reply.is_child_of(&msg_id) {
            break reply;
        }
        tracing::debug!(msg_type = reply.msg_type(), "skipping unrelated control traffic");
    };

    socket.close().await.ok();
    Ok(reply)
}

/// Spawn the liveness monitor that implements autorestart.
fn start_monitor(
    shared: &Arc<ManagerShared>,
    inner_arc: &Arc<Mutex<Inner>>,
    inner: &mut Inner,
) {
    if let Some(previous) = inner.monitor.take() {
        previous.abort();
    }
    let shared = shared.clone();
    let inner_arc = inner_arc.clone();
    inner.monitor = Some(tokio::spawn(monitor_loop(shared, inner_arc)));
}

/// Poll the provisioner while Running; on unexpected exit either restart
/// (within the sliding-window budget) or go Dead. Heartbeat is advisory
/// and never consulted here.
async fn monitor_loop(shared: Arc<ManagerShared>, inner_arc: Arc<Mutex<Inner>>) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if shared.state() != LifecycleState::Running {
            if shared.state().is_terminal() {
                return;
            }
            continue;
        }

        // A lifecycle operation holds the lock; defer to it.
        let Ok(mut inner) = inner_arc.try_lock() else {
            continue;
        };
        let exit = match inner.provisioner.poll().await {
            Ok(Some(code)) => code,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "provisioner poll failed");
                continue;
            }
        };
        // State may have moved while we polled.
        if shared.state() != LifecycleState::Running {
            continue;
        }

        tracing::warn!(
            kernel_id = %shared.kernel_id,
            code = exit,
            "kernel exited unexpectedly"
        );

        let now = Instant::now();
        let window = shared.config.autorestart_window;
        inner
            .restart_times
            .retain(|t| now.duration_since(*t) <= window);

        let budget_left =
            shared.config.autorestart && inner.restart_times.len() < shared.config.autorestart_limit as usize;

        if !budget_left {
            inner.provisioner.cleanup(false).await.ok();
            if shared.config.autorestart {
                tracing::error!(
                    kernel_id = %shared.kernel_id,
                    limit = shared.config.autorestart_limit,
                    "restart budget exhausted; kernel is dead"
                );
            }
            let _ = shared.transition(LifecycleState::Dead);
            return;
        }

        inner.restart_times.push_back(now);
        tracing::info!(
            kernel_id = %shared.kernel_id,
            attempt = inner.restart_times.len(),
            "autorestarting kernel"
        );

        if shared.transition(LifecycleState::Restarting).is_err() {
            continue;
        }
        inner.provisioner.cleanup(true).await.ok();
        match start_inner(&shared, &mut inner).await {
            Ok(()) => {
                let _ = shared.transition(LifecycleState::Running);
            }
            Err(e) => {
                tracing::error!(error = %e, "autorestart failed");
                inner.provisioner.cleanup(false).await.ok();
                let _ = shared.transition(LifecycleState::Dead);
                return;
            }
        }
    }
}
