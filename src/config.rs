// Manager Configuration
//
// Options consumed by ExtensionManager. Everything except the host resolver
// can be loaded from a camelCase JSON document.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::extensions::types::SandboxTemplate;

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";
pub const DEFAULT_EXTENSIONS_DIR: &str = "extension_packages";
pub const DEFAULT_ACCEPT: &str =
    "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8, */*";

/// Access to packages the host application already provides.
///
/// `package_version` answers "does the host ship this dependency, and at which
/// version"; `require` is the last-resort fallback for bare module names no
/// extension, static dependency or built-in could satisfy.
pub trait HostResolver {
    fn package_version(&self, name: &str) -> Option<String>;

    fn require(&self, _name: &str) -> Option<serde_json::Value> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum InstallMode {
    /// Reuse a compatible extraction already present on disk.
    #[default]
    UseCache,
    /// Always download again.
    NoCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RegistryAuth {
    Token { token: String },
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub auth: Option<RegistryAuth>,
    pub retries: u32,
    pub timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), DEFAULT_ACCEPT.to_string());
        Self {
            url: DEFAULT_REGISTRY_URL.to_string(),
            headers,
            auth: None,
            retries: 3,
            timeout_ms: 30_000,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A dependency name pattern: a literal name or a `/regex/`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub enum DependencyPattern {
    Exact(String),
    Pattern(Regex),
}

impl DependencyPattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            DependencyPattern::Exact(exact) => exact == name,
            DependencyPattern::Pattern(re) => re.is_match(name),
        }
    }
}

impl TryFrom<String> for DependencyPattern {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() > 2 && value.starts_with('/') && value.ends_with('/') {
            let body = &value[1..value.len() - 1];
            return Ok(DependencyPattern::Pattern(Regex::new(body)?));
        }
        Ok(DependencyPattern::Exact(value))
    }
}

impl From<Regex> for DependencyPattern {
    fn from(re: Regex) -> Self {
        DependencyPattern::Pattern(re)
    }
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerOptions {
    pub cwd: PathBuf,
    pub extensions_dir: PathBuf,
    pub sandbox: SandboxTemplate,
    pub registry: RegistryConfig,
    pub install_mode: InstallMode,
    pub allow_builtins: bool,
    #[serde(skip)]
    pub host_resolver: Option<Arc<dyn HostResolver + Send + Sync>>,
    pub ignored_dependencies: Vec<DependencyPattern>,
    pub static_dependencies: BTreeMap<String, serde_json::Value>,
    pub local_install_exclude: Vec<String>,
    pub source_extensions: Vec<String>,
    pub data_extensions: Vec<String>,
    pub lock_wait_ms: u64,
    pub lock_stale_ms: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        let ignore_types = Regex::new(r"^@types/").map(DependencyPattern::Pattern);
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            extensions_dir: PathBuf::from(DEFAULT_EXTENSIONS_DIR),
            sandbox: SandboxTemplate::default(),
            registry: RegistryConfig::default(),
            install_mode: InstallMode::UseCache,
            allow_builtins: true,
            host_resolver: None,
            ignored_dependencies: ignore_types.into_iter().collect(),
            static_dependencies: BTreeMap::new(),
            local_install_exclude: vec!["node_modules".to_string(), ".git".to_string()],
            source_extensions: vec!["js".to_string(), "cjs".to_string()],
            data_extensions: vec!["json".to_string()],
            lock_wait_ms: 120_000,
            lock_stale_ms: 180_000,
        }
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("cwd", &self.cwd)
            .field("extensions_dir", &self.extensions_dir)
            .field("sandbox", &self.sandbox)
            .field("registry", &self.registry)
            .field("install_mode", &self.install_mode)
            .field("allow_builtins", &self.allow_builtins)
            .field("host_resolver", &self.host_resolver.is_some())
            .field("ignored_dependencies", &self.ignored_dependencies)
            .field("static_dependencies", &self.static_dependencies)
            .field("lock_wait_ms", &self.lock_wait_ms)
            .field("lock_stale_ms", &self.lock_stale_ms)
            .finish_non_exhaustive()
    }
}

impl ManagerOptions {
    /// Options rooted at `cwd`, everything else default.
    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Absolute extensions root; relative paths are taken from `cwd`.
    pub fn extensions_dir(&self) -> PathBuf {
        if self.extensions_dir.is_absolute() {
            self.extensions_dir.clone()
        } else {
            self.cwd.join(&self.extensions_dir)
        }
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_millis(self.lock_stale_ms)
    }

    pub fn is_ignored_dependency(&self, name: &str) -> bool {
        self.ignored_dependencies.iter().any(|p| p.matches(name))
    }
}
