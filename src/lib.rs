// Module declarations
pub mod config;
pub mod error;
pub mod extensions;
pub mod fsutil;
pub mod lock;
pub mod source;
pub mod version;

#[cfg(test)]
mod test_support;

pub use config::{HostResolver, InstallMode, ManagerOptions, RegistryAuth, RegistryConfig};
pub use error::{ExtensionError, ExtensionResult};
pub use extensions::{
    ExtensionInfo, ExtensionManager, LocalInstallOptions, MatchMode, PackageDescriptor,
    SandboxTemplate,
};
pub use source::{HttpNetworkTool, NetworkTool, PackageSource};
