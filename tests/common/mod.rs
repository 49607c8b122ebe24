//! In-process fake kernel speaking the wire protocol over real sockets.
//!
//! Serves all five channels from TCP listeners on ephemeral ports and
//! implements just enough of the standard message types to exercise the
//! client and manager end to end.

// Each integration crate uses a different slice of this support module.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, Notify};

use jupyter_wire::channels::{Channel, ChannelSocket};
use jupyter_wire::connection::{new_key, ConnectionInfo, DEFAULT_SIGNATURE_SCHEME};
use jupyter_wire::provisioning::{KernelProvisioner, LaunchCommand};
use jupyter_wire::session::wire::{read_multipart, write_multipart};
use jupyter_wire::session::{Header, Message, Session, SCHEME_HMAC_SHA256};
use jupyter_wire::types::{ClientConfig, Result, SessionConfig};
use jupyter_wire::kernelspec::KernelSpec;

pub struct FakeKernel {
    pub info: ConnectionInfo,
    shared: Arc<KernelShared>,
}

pub struct KernelShared {
    session: Session,
    config: ClientConfig,
    /// Serialized frames broadcast to every connected iopub subscriber.
    iopub_tx: broadcast::Sender<Vec<Vec<u8>>>,
    /// The connected stdin socket, once a client opens one.
    stdin: Mutex<Option<ChannelSocket>>,
    /// Raised by an `interrupt_request` on control.
    interrupt: Notify,
    execution_count: AtomicI64,
    /// When set, the next shell reply is corrupted after signing.
    pub tamper_next_shell_reply: AtomicBool,
    /// When set, every shell reply frame is sent twice.
    pub duplicate_shell_replies: AtomicBool,
    alive: AtomicBool,
}

impl FakeKernel {
    pub async fn spawn() -> Self {
        let shell = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let iopub = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stdin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hb = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let info = ConnectionInfo {
            transport: "tcp".to_string(),
            ip: "127.0.0.1".to_string(),
            shell_port: shell.local_addr().unwrap().port(),
            iopub_port: iopub.local_addr().unwrap().port(),
            stdin_port: stdin.local_addr().unwrap().port(),
            control_port: control.local_addr().unwrap().port(),
            hb_port: hb.local_addr().unwrap().port(),
            signature_scheme: DEFAULT_SIGNATURE_SCHEME.to_string(),
            key: new_key(),
            kernel_name: "fake".to_string(),
        };

        let session = Session::new(&info.key, SCHEME_HMAC_SHA256, &SessionConfig::default()).unwrap();
        let (iopub_tx, _) = broadcast::channel(256);
        let shared = Arc::new(KernelShared {
            session,
            config: ClientConfig::default(),
            iopub_tx,
            stdin: Mutex::new(None),
            interrupt: Notify::new(),
            execution_count: AtomicI64::new(0),
            tamper_next_shell_reply: AtomicBool::new(false),
            duplicate_shell_replies: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        });

        tokio::spawn(serve_heartbeat(hb));
        tokio::spawn(serve_iopub(iopub, shared.clone()));
        tokio::spawn(serve_stdin_accept(stdin, shared.clone()));
        tokio::spawn(serve_request_channel(shell, Channel::Shell, shared.clone()));
        tokio::spawn(serve_request_channel(control, Channel::Control, shared.clone()));

        Self { info, shared }
    }

    pub fn shared(&self) -> &Arc<KernelShared> {
        &self.shared
    }

    /// Publish one signed status frame twice on iopub (replay probe).
    pub fn publish_status_twice(&self, state: &str) {
        let msg = self
            .shared
            .session
            .msg("status", json!({ "execution_state": state }));
        let parts = self.shared.session.serialize(&msg).unwrap();
        let _ = self.shared.iopub_tx.send(parts.clone());
        let _ = self.shared.iopub_tx.send(parts);
    }

    pub fn stop(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
    }
}

async fn serve_heartbeat(listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            while let Ok(Some(parts)) = read_multipart(&mut reader, 8, 1 << 20).await {
                if write_multipart(&mut writer, &parts).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn serve_iopub(listener: TcpListener, shared: Arc<KernelShared>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut rx = shared.iopub_tx.subscribe();
        tokio::spawn(async move {
            let (_reader, mut writer) = stream.into_split();
            while let Ok(parts) = rx.recv().await {
                if write_multipart(&mut writer, &parts).await.is_err() {
                    break;
                }
            }
        });
    }
}

async fn serve_stdin_accept(listener: TcpListener, shared: Arc<KernelShared>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (reader, writer) = stream.into_split();
        let socket = ChannelSocket::from_stream(Channel::Stdin, reader, writer, &shared.config);
        *shared.stdin.lock().await = Some(socket);
    }
}

async fn serve_request_channel(listener: TcpListener, channel: Channel, shared: Arc<KernelShared>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (reader, writer) = stream.into_split();
        let socket = ChannelSocket::from_stream(channel, reader, writer, &shared.config);
        let shared = shared.clone();
        tokio::spawn(async move {
            serve_requests(socket, channel, shared).await;
        });
    }
}

async fn serve_requests(mut socket: ChannelSocket, channel: Channel, shared: Arc<KernelShared>) {
    loop {
        let parts = match socket.recv().await {
            Ok(Some(parts)) => parts,
            _ => return,
        };
        if !shared.alive.load(Ordering::SeqCst) {
            return;
        }
        let request = match shared.session.deserialize(parts, channel, None) {
            Ok(msg) => msg,
            Err(_) => continue,
        };

        match channel {
            Channel::Shell => handle_shell(&mut socket, &request, &shared).await,
            Channel::Control => handle_control(&mut socket, &request, &shared).await,
            _ => unreachable!("request channels only"),
        }
    }
}

impl KernelShared {
    fn publish(&self, parent: &Header, msg_type: &str, content: Value) {
        let msg = self.session.reply(parent, msg_type, content);
        let parts = self.session.serialize(&msg).unwrap();
        let _ = self.iopub_tx.send(parts);
    }

    fn status(&self, parent: &Header, state: &str) {
        self.publish(parent, "status", json!({ "execution_state": state }));
    }
}

async fn send_reply(
    socket: &mut ChannelSocket,
    shared: &KernelShared,
    reply: &Message,
) {
    let mut parts = shared.session.serialize(reply).unwrap();
    if shared.tamper_next_shell_reply.swap(false, Ordering::SeqCst) {
        // Flip one byte of the content JSON after signing.
        let last = parts.last_mut().unwrap();
        last[0] ^= 0x01;
    }
    let _ = socket.send(&parts).await;
    if shared.duplicate_shell_replies.load(Ordering::SeqCst) {
        let _ = socket.send(&parts).await;
    }
}

async fn handle_shell(socket: &mut ChannelSocket, request: &Message, shared: &Arc<KernelShared>) {
    let parent = &request.header;
    shared.status(parent, "busy");

    let reply = match request.msg_type() {
        "kernel_info_request" => shared.session.reply(
            parent,
            "kernel_info_reply",
            json!({
                "status": "ok",
                "protocol_version": "5.3",
                "implementation": "fake-kernel",
                "implementation_version": "1.0",
                "banner": "fake kernel for protocol tests",
                "language_info": { "name": "fake", "version": "0" },
            }),
        ),
        "execute_request" => {
            let code = request.content["code"].as_str().unwrap_or("").to_string();
            let count = shared.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
            shared.publish(
                parent,
                "execute_input",
                json!({ "code": code, "execution_count": count }),
            );
            execute(parent, &code, count, shared).await
        }
        "complete_request" => shared.session.reply(
            parent,
            "complete_reply",
            json!({
                "status": "ok",
                "matches": ["fake_completion"],
                "cursor_start": 0,
                "cursor_end": 0,
                "metadata": {},
            }),
        ),
        "inspect_request" => shared.session.reply(
            parent,
            "inspect_reply",
            json!({ "status": "ok", "found": false, "data": {}, "metadata": {} }),
        ),
        "is_complete_request" => shared.session.reply(
            parent,
            "is_complete_reply",
            json!({ "status": "complete" }),
        ),
        "history_request" => shared.session.reply(
            parent,
            "history_reply",
            json!({ "status": "ok", "history": [] }),
        ),
        "comm_info_request" => shared.session.reply(
            parent,
            "comm_info_reply",
            json!({ "status": "ok", "comms": {} }),
        ),
        other => {
            // Unknown shell request: reply with an error payload.
            shared.session.reply(
                parent,
                format!("{}_reply", other.trim_end_matches("_request")),
                json!({ "status": "error", "ename": "UnknownMessage", "evalue": other }),
            )
        }
    };

    shared.status(parent, "idle");
    send_reply(socket, shared, &reply).await;
}

/// Execute the handful of code snippets the scenarios use.
async fn execute(
    parent: &Header,
    code: &str,
    count: i64,
    shared: &Arc<KernelShared>,
) -> Message {
    if code == "print(\"hi\")" || code == "print('hi')" {
        shared.publish(
            parent,
            "stream",
            json!({ "name": "stdout", "text": "hi\n" }),
        );
    } else if let Some(prompt) = code
        .strip_prefix("input(\"")
        .and_then(|rest| rest.strip_suffix("\")"))
    {
        let value = request_input(parent, prompt, shared).await;
        shared.publish(
            parent,
            "stream",
            json!({ "name": "stdout", "text": value }),
        );
    } else if code == "while True: pass" {
        // Spin until interrupted.
        shared.interrupt.notified().await;
        shared.publish(
            parent,
            "error",
            json!({
                "ename": "KeyboardInterrupt",
                "evalue": "",
                "traceback": ["KeyboardInterrupt"],
            }),
        );
        return shared.session.reply(
            parent,
            "execute_reply",
            json!({
                "status": "error",
                "execution_count": count,
                "ename": "KeyboardInterrupt",
                "evalue": "",
            }),
        );
    } else if !code.is_empty() {
        shared.publish(
            parent,
            "execute_result",
            json!({
                "execution_count": count,
                "data": { "text/plain": format!("<{}>", code) },
                "metadata": {},
            }),
        );
    }

    shared.session.reply(
        parent,
        "execute_reply",
        json!({ "status": "ok", "execution_count": count, "user_expressions": {} }),
    )
}

/// Kernel-initiated stdin round trip: send input_request, await the reply.
async fn request_input(parent: &Header, prompt: &str, shared: &Arc<KernelShared>) -> String {
    let mut guard = shared.stdin.lock().await;
    let Some(socket) = guard.as_mut() else {
        return String::new();
    };

    let request = shared.session.reply(
        parent,
        "input_request",
        json!({ "prompt": prompt, "password": false }),
    );
    if shared.session.send(socket, &request).await.is_err() {
        return String::new();
    }

    let reply = tokio::time::timeout(Duration::from_secs(5), shared.session.recv(socket, None)).await;
    match reply {
        Ok(Ok(Some(msg))) => msg.content["value"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

async fn handle_control(socket: &mut ChannelSocket, request: &Message, shared: &Arc<KernelShared>) {
    let parent = &request.header;
    let reply = match request.msg_type() {
        "shutdown_request" => {
            let restart = request.content["restart"].as_bool().unwrap_or(false);
            shared.session.reply(
                parent,
                "shutdown_reply",
                json!({ "status": "ok", "restart": restart }),
            )
        }
        "interrupt_request" => {
            // notify_one stores a permit, so the interrupt lands even if
            // the execute handler has not reached its wait yet.
            shared.interrupt.notify_one();
            shared
                .session
                .reply(parent, "interrupt_reply", json!({ "status": "ok" }))
        }
        "debug_request" => shared
            .session
            .reply(parent, "debug_reply", json!({ "status": "ok", "body": {} })),
        other => shared.session.reply(
            parent,
            format!("{}_reply", other.trim_end_matches("_request")),
            json!({ "status": "error", "ename": "UnknownMessage" }),
        ),
    };
    let _ = shared.session.send(socket, &reply).await;
}

/// Provisioner that "launches" an in-process [`FakeKernel`].
#[derive(Debug, Default)]
pub struct FakeKernelProvisioner {
    kernel: Option<FakeKernel>,
    info: Option<ConnectionInfo>,
}

impl std::fmt::Debug for FakeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeKernel").finish_non_exhaustive()
    }
}

#[async_trait]
impl KernelProvisioner for FakeKernelProvisioner {
    fn has_process(&self) -> bool {
        self.kernel.is_some()
    }

    async fn pre_launch(
        &mut self,
        _spec: &KernelSpec,
        _connection_file: &Path,
    ) -> Result<LaunchCommand> {
        let kernel = FakeKernel::spawn().await;
        self.info = Some(kernel.info.clone());
        self.kernel = Some(kernel);
        Ok(LaunchCommand {
            cmd: vec!["fake-kernel".to_string()],
            env: Default::default(),
            cwd: None,
        })
    }

    async fn launch(&mut self, _command: LaunchCommand) -> Result<()> {
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<i32>> {
        Ok(if self.kernel.is_some() { None } else { Some(0) })
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Option<i32>> {
        if self.kernel.is_some() && !timeout.is_zero() {
            tokio::time::sleep(timeout.min(Duration::from_millis(20))).await;
        }
        self.poll().await
    }

    async fn send_signal(&mut self, _signum: i32) -> Result<()> {
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(kernel) = self.kernel.take() {
            kernel.stop();
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.terminate().await
    }

    async fn cleanup(&mut self, _restart: bool) -> Result<()> {
        if let Some(kernel) = self.kernel.take() {
            kernel.stop();
        }
        Ok(())
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.clone()
    }
}
