//! Kernel-spec resolution: discovery and loading of launch specifications.
//!
//! A kernel spec is a directory holding a `kernel.json` plus optional
//! resource files. Specs are discovered across a well-known search path
//! (system, then user, then environment); later directories override
//! earlier ones by name. Names are normalized to lowercase.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::types::{Error, Result};

/// File name looked up inside each spec directory.
pub const SPEC_FILE: &str = "kernel.json";

/// How a kernel prefers to be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// Deliver SIGINT to the process group.
    #[default]
    Signal,
    /// Send an `interrupt_request` on the control channel.
    Message,
}

/// A launch specification loaded from `kernel.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Template command line; must contain `{connection_file}`.
    pub argv: Vec<String>,

    pub display_name: String,
    pub language: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<InterruptMode>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,

    /// Directory the spec was loaded from. Not part of the file.
    #[serde(skip)]
    pub resource_dir: PathBuf,
}

impl KernelSpec {
    pub fn load(spec_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(spec_dir.join(SPEC_FILE))?;
        let mut spec: Self = serde_json::from_str(&raw)?;
        spec.resource_dir = spec_dir.to_path_buf();
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(Error::validation("kernel spec argv must not be empty"));
        }
        if !self.argv.iter().any(|a| a.contains("{connection_file}")) {
            return Err(Error::validation(
                "kernel spec argv must contain {connection_file}",
            ));
        }
        Ok(())
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.interrupt_mode.unwrap_or_default()
    }
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Spec resolver over a prioritized search path.
///
/// The discovered name→path map is cached; the cache is read-mostly and
/// guarded by a reader-preferring lock. Construct disposable instances in
/// tests with [`KernelSpecManager::with_search_paths`].
#[derive(Debug)]
pub struct KernelSpecManager {
    /// Low priority first; later entries override by name.
    search_paths: Vec<PathBuf>,
    cache: RwLock<Option<BTreeMap<String, PathBuf>>>,
}

impl KernelSpecManager {
    pub fn new() -> Self {
        Self::with_search_paths(default_search_paths())
    }

    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            cache: RwLock::new(None),
        }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Name → spec-directory map across the search path.
    pub fn find_kernel_specs(&self) -> Result<BTreeMap<String, PathBuf>> {
        if let Some(cached) = self.cache.read().expect("spec cache poisoned").as_ref() {
            return Ok(cached.clone());
        }

        let mut found = BTreeMap::new();
        for dir in &self.search_paths {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() || !path.join(SPEC_FILE).is_file() {
                    continue;
                }
                let Some(raw_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let name = normalize_name(raw_name);
                if !valid_name(&name) {
                    tracing::warn!(name = raw_name, "skipping kernel spec with invalid name");
                    continue;
                }
                // Later search-path entries win.
                found.insert(name, path);
            }
        }

        *self.cache.write().expect("spec cache poisoned") = Some(found.clone());
        Ok(found)
    }

    /// Load the spec registered under `name` (case-insensitive).
    pub fn get_kernel_spec(&self, name: &str) -> Result<KernelSpec> {
        let name = normalize_name(name);
        let specs = self.find_kernel_specs()?;
        let dir = specs
            .get(&name)
            .ok_or_else(|| Error::NoSuchKernel(name.clone()))?;
        KernelSpec::load(dir)
    }

    /// Copy a spec directory into the search path under `name`.
    ///
    /// `user` selects the highest-priority (user) destination instead of
    /// the first system directory. Fails if the name already exists there
    /// unless `replace` is set.
    pub fn install_kernel_spec(
        &self,
        source_dir: &Path,
        name: &str,
        user: bool,
        replace: bool,
    ) -> Result<PathBuf> {
        let name = normalize_name(name);
        if !valid_name(&name) {
            return Err(Error::validation(format!(
                "invalid kernel spec name {:?}",
                name
            )));
        }
        if !source_dir.join(SPEC_FILE).is_file() {
            return Err(Error::validation(format!(
                "{} has no {}",
                source_dir.display(),
                SPEC_FILE
            )));
        }

        let dest_root = if user {
            self.search_paths
                .last()
                .ok_or_else(|| Error::validation("empty search path"))?
        } else {
            self.search_paths
                .first()
                .ok_or_else(|| Error::validation("empty search path"))?
        };
        let dest = dest_root.join(&name);

        if dest.exists() {
            if !replace {
                return Err(Error::validation(format!(
                    "kernel spec {:?} already installed at {}",
                    name,
                    dest.display()
                )));
            }
            std::fs::remove_dir_all(&dest)?;
        }

        copy_dir(source_dir, &dest)?;
        self.invalidate_cache();
        tracing::info!(name = %name, dest = %dest.display(), "installed kernel spec");
        Ok(dest)
    }

    pub fn invalidate_cache(&self) {
        *self.cache.write().expect("spec cache poisoned") = None;
    }
}

impl Default for KernelSpecManager {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Search path, lowest priority first: system, user, environment.
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/usr/share/jupyter/kernels"),
        PathBuf::from("/usr/local/share/jupyter/kernels"),
    ];
    if let Some(data) = dirs::data_dir() {
        paths.push(data.join("jupyter").join("kernels"));
    }
    if let Ok(jupyter_path) = std::env::var("JUPYTER_PATH") {
        for entry in std::env::split_paths(&jupyter_path) {
            paths.push(entry.join("kernels"));
        }
    }
    if let Ok(data_dir) = std::env::var("JUPYTER_DATA_DIR") {
        paths.push(PathBuf::from(data_dir).join("kernels"));
    }
    paths
}
