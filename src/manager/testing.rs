//! In-process doubles for manager-level tests: a scriptable provisioner
//! and a heartbeat echo listener.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionInfo;
use crate::kernelspec::KernelSpec;
use crate::provisioning::{KernelProvisioner, LaunchCommand, ProvisionerFactory};
use crate::session::wire::{read_multipart, write_multipart};
use crate::types::Result;

/// Scriptable process handle: tests flip `alive` to simulate exits.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockProcess {
    pub alive: Arc<AtomicBool>,
    pub launches: Arc<AtomicU32>,
    pub exit_code: Arc<AtomicI32>,
}

impl MockProcess {
    pub fn die(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct MockProvisioner {
    process: MockProcess,
    info: ConnectionInfo,
}

impl MockProvisioner {
    pub fn factory(process: MockProcess, info: ConnectionInfo) -> ProvisionerFactory {
        Arc::new(move || {
            Box::new(MockProvisioner {
                process: process.clone(),
                info: info.clone(),
            }) as Box<dyn KernelProvisioner>
        })
    }
}

#[async_trait]
impl KernelProvisioner for MockProvisioner {
    fn has_process(&self) -> bool {
        self.process.alive.load(Ordering::SeqCst)
    }

    async fn pre_launch(
        &mut self,
        _spec: &KernelSpec,
        _connection_file: &Path,
    ) -> Result<LaunchCommand> {
        Ok(LaunchCommand {
            cmd: vec!["mock-kernel".to_string()],
            env: HashMap::new(),
            cwd: None,
        })
    }

    async fn launch(&mut self, _command: LaunchCommand) -> Result<()> {
        self.process.alive.store(true, Ordering::SeqCst);
        self.process.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<i32>> {
        if self.process.alive.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(self.process.exit_code.load(Ordering::SeqCst)))
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Option<i32>> {
        if !timeout.is_zero() && self.process.alive.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout.min(Duration::from_millis(20))).await;
        }
        self.poll().await
    }

    async fn send_signal(&mut self, _signum: i32) -> Result<()> {
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        self.process.die(0);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.process.die(-9);
        Ok(())
    }

    async fn cleanup(&mut self, _restart: bool) -> Result<()> {
        Ok(())
    }

    fn connection_info(&self) -> Option<ConnectionInfo> {
        Some(self.info.clone())
    }
}

/// TCP listener echoing heartbeat frames, accepting any number of
/// sequential connections. Returns the bound port.
pub(crate) async fn spawn_heartbeat_echo() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
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
    });
    port
}

/// Connection info whose heartbeat endpoint is a live echo listener and
/// whose other ports point nowhere.
pub(crate) async fn mock_connection_info() -> ConnectionInfo {
    let hb_port = spawn_heartbeat_echo().await;
    ConnectionInfo {
        transport: "tcp".to_string(),
        ip: "127.0.0.1".to_string(),
        shell_port: 1,
        iopub_port: 2,
        stdin_port: 3,
        control_port: 4,
        hb_port,
        signature_scheme: "hmac-sha256".to_string(),
        key: "mock-key".to_string(),
        kernel_name: "mock".to_string(),
    }
}

/// A spec whose metadata routes to the given provisioner name.
pub(crate) fn mock_spec(provisioner: &str) -> KernelSpec {
    KernelSpec {
        argv: vec!["mock-kernel".to_string(), "{connection_file}".to_string()],
        display_name: "Mock".to_string(),
        language: "mock".to_string(),
        env: HashMap::new(),
        interrupt_mode: None,
        metadata: serde_json::json!({
            "kernel_provisioner": { "provisioner_name": provisioner }
        }),
        resource_dir: std::path::PathBuf::new(),
    }
}
