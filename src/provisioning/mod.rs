//! Pluggable kernel lifecycle backends.
//!
//! A provisioner realizes launch/signal/poll/cleanup for a kernel process
//! on a given platform. The bundled [`LocalProvisioner`] spawns a local
//! subprocess; alternative backends register under a name in the
//! [`ProvisionerRegistry`], which lives in an explicit [`crate::Context`]
//! rather than process-wide state.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::connection::ConnectionInfo;
use crate::kernelspec::KernelSpec;
use crate::types::{Error, Result};

mod local;

pub use local::{LocalProvisioner, LOCAL_PROVISIONER};

/// Effective command and environment produced by `pre_launch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub cmd: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Lifecycle backend for one kernel process.
///
/// A manager owns exactly one provisioner at a time and drives it through
/// pre_launch → launch → (poll | wait | signal)* → terminate/kill →
/// cleanup. Provisioners that materialize the connection out-of-band
/// implement the connection-info pair.
#[async_trait]
pub trait KernelProvisioner: Send + fmt::Debug {
    /// True while a launched process handle exists.
    fn has_process(&self) -> bool;

    /// Resolve the spec's argv template and environment into the effective
    /// launch command. `{connection_file}` and `{resource_dir}` tokens are
    /// substituted here.
    async fn pre_launch(
        &mut self,
        spec: &KernelSpec,
        connection_file: &Path,
    ) -> Result<LaunchCommand>;

    /// Start the kernel process.
    async fn launch(&mut self, command: LaunchCommand) -> Result<()>;

    /// Non-blocking liveness check: `None` while running, exit code once
    /// the process has exited.
    async fn poll(&mut self) -> Result<Option<i32>>;

    /// Wait up to `timeout` for exit. `None` means still running.
    /// A zero timeout polls without waiting.
    async fn wait(&mut self, timeout: Duration) -> Result<Option<i32>>;

    /// Deliver a signal, best effort on platforms without real signals.
    async fn send_signal(&mut self, signum: i32) -> Result<()>;

    /// Graceful stop (SIGTERM-equivalent).
    async fn terminate(&mut self) -> Result<()>;

    /// Forceful stop (SIGKILL-equivalent).
    async fn kill(&mut self) -> Result<()>;

    /// Reap the process and release resources. `restart` signals that the
    /// same connection ports will be reused immediately.
    async fn cleanup(&mut self, restart: bool) -> Result<()>;

    /// Connection info materialized by the provisioner, when it, not the
    /// manager, owns the handshake.
    fn connection_info(&self) -> Option<ConnectionInfo> {
        None
    }

    /// Hand the provisioner the connection info the manager settled on.
    fn load_connection_info(&mut self, _info: &ConnectionInfo) {}
}

/// Factory producing fresh provisioner instances.
pub type ProvisionerFactory = Arc<dyn Fn() -> Box<dyn KernelProvisioner> + Send + Sync>;

/// Named collection of provisioner factories.
///
/// Populated by explicit registration calls at startup; the bundled local
/// provisioner is registered unconditionally. Registration is idempotent:
/// re-registering a name replaces its factory.
pub struct ProvisionerRegistry {
    factories: RwLock<HashMap<String, ProvisionerFactory>>,
}

impl fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register(
            LOCAL_PROVISIONER,
            Arc::new(|| Box::<LocalProvisioner>::default() as Box<dyn KernelProvisioner>),
        );
        registry
    }

    pub fn register(&self, name: impl Into<String>, factory: ProvisionerFactory) {
        let name = name.into();
        self.factories
            .write()
            .expect("provisioner registry poisoned")
            .insert(name.clone(), factory);
        tracing::debug!(name = %name, "provisioner registered");
    }

    /// Instantiate the provisioner registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn KernelProvisioner>> {
        let factories = self.factories.read().expect("provisioner registry poisoned");
        let factory = factories
            .get(name)
            .ok_or_else(|| Error::UnknownProvisioner(name.to_string()))?;
        Ok(factory())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .expect("provisioner registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for ProvisionerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_provisioner_bundled() {
        let registry = ProvisionerRegistry::new();
        assert!(registry.names().contains(&LOCAL_PROVISIONER.to_string()));
        let provisioner = registry.create(LOCAL_PROVISIONER).unwrap();
        assert!(!provisioner.has_process());
    }

    #[test]
    fn test_unknown_provisioner_fails() {
        let registry = ProvisionerRegistry::new();
        let err = registry.create("kubernetes").unwrap_err();
        assert!(matches!(err, Error::UnknownProvisioner(_)));
        assert!(err.to_string().contains("kubernetes"));
    }

    #[test]
    fn test_registration_is_idempotent() {
        let registry = ProvisionerRegistry::new();
        let factory: ProvisionerFactory =
            Arc::new(|| Box::<LocalProvisioner>::default() as Box<dyn KernelProvisioner>);
        registry.register("custom", factory.clone());
        registry.register("custom", factory);
        assert_eq!(
            registry.names(),
            vec!["custom".to_string(), LOCAL_PROVISIONER.to_string()]
        );
    }
}
