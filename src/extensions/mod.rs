// Extension System Module
//
// Handles:
// - Installing extensions from the registry, local paths and inline code
// - Tracking installed extensions and their dependencies
// - Running extensions in per-extension QuickJS scopes
// - Module resolution and the built-in modules extensions may use

pub mod builtins;
pub mod extension;
pub mod manager;
pub mod registry;
pub mod resolve;
pub mod runtime;
pub mod sandbox;
pub mod types;

pub use manager::ExtensionManager;
pub use runtime::{LoaderSettings, SandboxedLoader};
pub use types::{
    Author, Dist, ExtensionInfo, LocalInstallOptions, MatchMode, PackageDescriptor,
    PackageManifest, SandboxTemplate,
};
