// Extension System Data Types
//
// Defines the core data structures for the extension system including
// installed extension metadata, registry descriptors, package manifests and
// sandbox templates.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An installed extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub name: String,
    pub version: String,
    /// Absolute install directory
    pub location: PathBuf,
    /// Absolute path of the entry module (manifest `main`, default index.js)
    #[serde(alias = "mainFile")]
    pub entry_file: PathBuf,
    /// Declared dependency ranges, keyed by package name
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub author: Option<Author>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default, alias = "schemaVersion")]
    pub schema_version: Option<String>,
}

/// Package author, parsed from `"Name <email> (url)"` or an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Archive location of one published version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(rename = "tarball", default)]
    pub archive_url: Option<String>,
    #[serde(default)]
    pub integrity: Option<String>,
    #[serde(default)]
    pub shasum: Option<String>,
}

/// One version entry of a registry document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub dist: Dist,
    #[serde(rename = "main", default, skip_serializing_if = "Option::is_none")]
    pub entry_file_hint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

impl PackageDescriptor {
    /// The `{name, version, dist}` projection returned by resolution.
    pub fn minimal(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            dist: self.dist.clone(),
            entry_file_hint: None,
            dependencies: BTreeMap::new(),
        }
    }
}

/// The subset of package.json the manager reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub dependencies: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub author: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default, alias = "schemaVersion")]
    pub schema_version: Option<serde_json::Value>,
}

/// Declarative description of an extension's execution context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxTemplate {
    /// Environment exposed as `process.env`; the host environment when absent
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    /// Extra globals copied into the context
    #[serde(default)]
    pub globals: Option<serde_json::Map<String, serde_json::Value>>,
}

/// How `already_installed` compares the installed version with a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    Satisfies,
    /// Also accept installed versions above the range's upper bound
    SatisfiesOrGreater,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalInstallOptions {
    /// Copy and register even when a satisfying version is installed
    pub force: bool,
}
