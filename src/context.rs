//! Explicit dependency context.
//!
//! Holds the provisioner registry and the kernel-spec resolver that used to
//! be process-wide singletons in comparable systems. Everything that needs
//! them receives a context reference; tests construct disposable contexts
//! with their own search paths and registrations.

use std::path::PathBuf;

use crate::kernelspec::KernelSpecManager;
use crate::provisioning::ProvisionerRegistry;

/// Shared services threaded through managers and resolvers.
#[derive(Debug, Default)]
pub struct Context {
    pub provisioners: ProvisionerRegistry,
    pub kernelspecs: KernelSpecManager,
}

impl Context {
    /// Context with the bundled provisioners and the default spec search
    /// path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Disposable context rooted at explicit spec directories.
    pub fn with_kernel_spec_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            provisioners: ProvisionerRegistry::new(),
            kernelspecs: KernelSpecManager::with_search_paths(paths),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::LOCAL_PROVISIONER;

    #[test]
    fn test_default_context_has_local_provisioner() {
        let context = Context::new();
        assert!(context.provisioners.create(LOCAL_PROVISIONER).is_ok());
    }

    #[test]
    fn test_disposable_contexts_are_isolated() {
        let a = Context::with_kernel_spec_paths(vec![PathBuf::from("/nonexistent/a")]);
        let b = Context::with_kernel_spec_paths(vec![PathBuf::from("/nonexistent/b")]);
        assert_ne!(a.kernelspecs.search_paths(), b.kernelspecs.search_paths());
    }
}
