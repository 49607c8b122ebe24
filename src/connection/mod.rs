//! Connection descriptor - the durable record of how to reach a kernel.
//!
//! A [`ConnectionInfo`] names the transport, endpoint, shared signing key and
//! the port assignment for the five messaging channels. It round-trips
//! losslessly through the on-disk JSON representation and is considered
//! immutable once its ports are bound.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use crate::channels::Channel;
use crate::types::{Error, Result};

/// Signature scheme used when none is specified.
pub const DEFAULT_SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Connection descriptor, serialized as the standard connection file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// "tcp" or "ipc".
    pub transport: String,

    /// Host address ("tcp") or base socket path ("ipc").
    pub ip: String,

    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,

    /// Signature scheme; empty disables signing entirely.
    #[serde(default = "default_scheme")]
    pub signature_scheme: String,

    /// Shared secret key. Must be non-empty when a scheme is set.
    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub kernel_name: String,
}

fn default_scheme() -> String {
    DEFAULT_SIGNATURE_SCHEME.to_string()
}

impl ConnectionInfo {
    /// Build a descriptor with OS-assigned ports, never touching disk.
    ///
    /// Each zero port is resolved by binding a transient listener and
    /// reading back the assigned port. The bound listeners are dropped
    /// immediately; the kernel re-binds the same numbers at launch.
    pub fn ephemeral(ip: impl Into<String>, kernel_name: impl Into<String>) -> Result<Self> {
        let ip = ip.into();
        let mut ports = [0u16; 5];
        {
            // Hold all listeners until every port is assigned so the OS
            // cannot hand the same port out twice.
            let mut listeners = Vec::with_capacity(5);
            for slot in ports.iter_mut() {
                let listener = TcpListener::bind((ip.as_str(), 0))?;
                *slot = listener.local_addr()?.port();
                listeners.push(listener);
            }
        }

        let info = Self {
            transport: "tcp".to_string(),
            ip,
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            signature_scheme: DEFAULT_SIGNATURE_SCHEME.to_string(),
            key: new_key(),
            kernel_name: kernel_name.into(),
        };
        info.validate()?;
        Ok(info)
    }

    /// Load and validate a connection file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::permission_denied(format!("reading {}: {}", path.display(), e))
            } else {
                Error::Io(e)
            }
        })?;
        let info: Self = serde_json::from_str(&raw)?;
        info.validate()?;
        Ok(info)
    }

    /// Persist the descriptor atomically with owner-only permissions.
    ///
    /// Writes to a sibling temporary file and renames into place, so a
    /// concurrent reader never observes a partial file.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".connection-")
            .suffix(".json.tmp")
            .tempfile_in(parent)
            .map_err(|e| Error::permission_denied(format!("creating temp file in {}: {}", parent.display(), e)))?;

        let body = serde_json::to_vec_pretty(self)?;
        tmp.write_all(&body)?;
        tmp.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tmp.as_file().set_permissions(perms)?;
        }

        tmp.persist(path)
            .map_err(|e| Error::permission_denied(format!("renaming into {}: {}", path.display(), e.error)))?;
        tracing::debug!("wrote connection file {}", path.display());
        Ok(())
    }

    /// Check the descriptor invariants.
    pub fn validate(&self) -> Result<()> {
        match self.transport.as_str() {
            "tcp" | "ipc" => {}
            other => {
                return Err(Error::validation(format!(
                    "unknown transport {:?}; expected \"tcp\" or \"ipc\"",
                    other
                )))
            }
        }
        if self.ip.is_empty() {
            return Err(Error::validation("ip must not be empty"));
        }
        if !self.signature_scheme.is_empty() && self.key.is_empty() {
            return Err(Error::validation(format!(
                "scheme {:?} requires a non-empty key",
                self.signature_scheme
            )));
        }

        // Non-zero ports must be pairwise distinct.
        let ports = self.ports();
        for (i, a) in ports.iter().enumerate() {
            for b in ports.iter().skip(i + 1) {
                if *a != 0 && a == b {
                    return Err(Error::validation(format!("duplicate port assignment: {}", a)));
                }
            }
        }
        Ok(())
    }

    /// The five channel ports in channel-declaration order.
    pub fn ports(&self) -> [u16; 5] {
        [
            self.shell_port,
            self.iopub_port,
            self.stdin_port,
            self.control_port,
            self.hb_port,
        ]
    }

    /// Port assigned to a channel.
    pub fn port(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Shell => self.shell_port,
            Channel::Iopub => self.iopub_port,
            Channel::Stdin => self.stdin_port,
            Channel::Control => self.control_port,
            Channel::Heartbeat => self.hb_port,
        }
    }

    /// Connection endpoint for a channel, in `transport://address` form.
    pub fn endpoint(&self, channel: Channel) -> String {
        match self.transport.as_str() {
            "ipc" => format!("ipc://{}-{}", self.ip, self.port(channel)),
            _ => format!("tcp://{}:{}", self.ip, self.port(channel)),
        }
    }

    /// Filesystem path for a channel socket on the "ipc" transport.
    pub fn ipc_path(&self, channel: Channel) -> PathBuf {
        PathBuf::from(format!("{}-{}", self.ip, self.port(channel)))
    }

    /// True when signing is disabled (empty key).
    ///
    /// Insecure: any process that can reach the sockets can speak for the
    /// client. Only acceptable in same-host contexts already secured by
    /// other means.
    pub fn unsigned(&self) -> bool {
        self.key.is_empty()
    }
}

/// Mint a fresh shared secret: 32 random bytes, hex-encoded.
pub fn new_key() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    hex::encode(bytes)
}

/// Directory where connection files are placed by default.
///
/// Honors `JUPYTER_RUNTIME_DIR`, then `JUPYTER_DATA_DIR`, then the
/// platform data dir, then the config dir via `JUPYTER_CONFIG_DIR`.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("JUPYTER_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("JUPYTER_DATA_DIR") {
        return PathBuf::from(dir).join("runtime");
    }
    if let Some(data) = dirs::data_dir() {
        return data.join("jupyter").join("runtime");
    }
    if let Ok(dir) = std::env::var("JUPYTER_CONFIG_DIR") {
        return PathBuf::from(dir).join("runtime");
    }
    std::env::temp_dir().join("jupyter-runtime")
}

/// Default connection-file path for a kernel id.
pub fn connection_file_path(kernel_id: &str) -> PathBuf {
    runtime_dir().join(format!("kernel-{}.json", kernel_id))
}
