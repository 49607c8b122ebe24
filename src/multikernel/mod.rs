//! Multi-kernel registry: a named collection of managers.
//!
//! Ids are opaque and unique for the life of the registry. Lifecycle
//! operations on different kernels run concurrently; `shutdown_all` fans
//! out in parallel with a shared deadline and collects per-kernel failures
//! instead of stopping at the first one.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::manager::KernelManager;
use crate::types::{ClientConfig, Error, KernelId, ManagerConfig, Result, SessionConfig};
use crate::Context;

/// Failures collected by [`MultiKernelManager::shutdown_all`].
pub type ShutdownFailures = Vec<(KernelId, Error)>;

/// Named collection of kernel managers with isolation between entries.
pub struct MultiKernelManager {
    context: Arc<Context>,
    config: ManagerConfig,
    client_config: ClientConfig,
    session_config: SessionConfig,
    kernels: Mutex<HashMap<KernelId, Arc<KernelManager>>>,
}

impl std::fmt::Debug for MultiKernelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiKernelManager").finish_non_exhaustive()
    }
}

impl MultiKernelManager {
    pub fn new(context: Arc<Context>) -> Self {
        Self::with_configs(
            context,
            ManagerConfig::default(),
            ClientConfig::default(),
            SessionConfig::default(),
        )
    }

    pub fn with_configs(
        context: Arc<Context>,
        config: ManagerConfig,
        client_config: ClientConfig,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            context,
            config,
            client_config,
            session_config,
            kernels: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Start a kernel by spec name and register it. On start failure the
    /// manager is not retained.
    pub async fn start_kernel(&self, name: &str) -> Result<KernelId> {
        let spec = self.context.kernelspecs.get_kernel_spec(name)?;
        self.start_kernel_from_spec(spec).await
    }

    /// Start a kernel from an explicit spec and register it.
    pub async fn start_kernel_from_spec(
        &self,
        spec: crate::kernelspec::KernelSpec,
    ) -> Result<KernelId> {
        let manager = KernelManager::new(
            &self.context,
            spec,
            self.config.clone(),
            self.client_config.clone(),
            self.session_config.clone(),
            false,
        )?;
        manager.start_kernel().await?;

        let id = manager.kernel_id().clone();
        self.kernels
            .lock()
            .await
            .insert(id.clone(), Arc::new(manager));
        tracing::info!(kernel_id = %id, "kernel registered");
        Ok(id)
    }

    /// Register an externally constructed manager.
    pub async fn insert(&self, manager: KernelManager) -> KernelId {
        let id = manager.kernel_id().clone();
        self.kernels
            .lock()
            .await
            .insert(id.clone(), Arc::new(manager));
        id
    }

    pub async fn get(&self, id: &KernelId) -> Option<Arc<KernelManager>> {
        self.kernels.lock().await.get(id).cloned()
    }

    pub async fn list_ids(&self) -> Vec<KernelId> {
        self.kernels.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.kernels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.kernels.lock().await.is_empty()
    }

    /// Shut one kernel down and remove it from the registry.
    pub async fn shutdown(&self, id: &KernelId, now: bool) -> Result<()> {
        let manager = self
            .kernels
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::NoSuchKernel(id.to_string()))?;
        manager.shutdown_kernel(now).await
    }

    /// Restart a registered kernel in place.
    pub async fn restart(&self, id: &KernelId, now: bool) -> Result<()> {
        let manager = self
            .get(id)
            .await
            .ok_or_else(|| Error::NoSuchKernel(id.to_string()))?;
        manager.restart_kernel(now).await
    }

    /// Shut every kernel down in parallel under a shared deadline.
    ///
    /// Returns the failures, one entry per kernel that did not shut down
    /// cleanly; an empty vec means every shutdown succeeded. The registry
    /// is emptied either way.
    pub async fn shutdown_all(&self, now: bool) -> ShutdownFailures {
        let drained: Vec<(KernelId, Arc<KernelManager>)> =
            self.kernels.lock().await.drain().collect();

        // Shared deadline: graceful phase plus escalation headroom.
        let deadline = self.config.shutdown_timeout.saturating_mul(3);

        let mut joins = JoinSet::new();
        for (id, manager) in drained {
            joins.spawn(async move {
                let result = match tokio::time::timeout(deadline, manager.shutdown_kernel(now)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(
                        crate::channels::Channel::Control,
                        None,
                        "shutdown_all deadline exceeded",
                    )),
                };
                (id, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    tracing::warn!(kernel_id = %id, error = %e, "kernel shutdown failed");
                    failures.push((id, e));
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "shutdown task panicked");
                }
            }
        }
        failures
    }
}
