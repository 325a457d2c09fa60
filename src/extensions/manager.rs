// Extension Manager
//
// Installs, tracks and runs extensions. Mutating operations hold the install
// lock for their whole duration; read accessors never touch the disk.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use futures_util::future::{FutureExt, LocalBoxFuture};
use rquickjs::{Ctx, Value};

use super::extension::{
    anonymous_extension_info, create_extension_info, extension_info_from_manifest,
    extension_location, is_tag, read_manifest, validate_name, validate_version, MANIFEST_FILE,
};
use super::registry::ExtensionRegistry;
use super::resolve::split_request;
use super::runtime::{LoaderSettings, SandboxedLoader};
use super::types::{ExtensionInfo, LocalInstallOptions, MatchMode, PackageDescriptor, SandboxTemplate};
use crate::config::{InstallMode, ManagerOptions};
use crate::error::{ExtensionError, ExtensionResult};
use crate::fsutil;
use crate::lock::InstallLock;
use crate::source::{HttpNetworkTool, NetworkTool, PackageSource};
use crate::version;

const CODE_DEFAULT_VERSION: &str = "0.0.0";

pub struct ExtensionManager {
    options: ManagerOptions,
    extensions_dir: PathBuf,
    registry: Rc<RefCell<ExtensionRegistry>>,
    loader: SandboxedLoader,
    source: PackageSource,
    lock: InstallLock,
    /// Extensions whose dependencies are being installed right now
    installing: HashSet<String>,
}

impl ExtensionManager {
    pub fn new(options: ManagerOptions) -> ExtensionResult<Self> {
        let network = Arc::new(HttpNetworkTool::new()?);
        Self::with_network(options, network)
    }

    pub fn with_network(options: ManagerOptions, network: Arc<dyn NetworkTool>) -> ExtensionResult<Self> {
        let extensions_dir = options.extensions_dir();
        let registry = Rc::new(RefCell::new(ExtensionRegistry::new()));
        let loader = SandboxedLoader::new(LoaderSettings::from_options(&options), registry.clone())?;
        let source = PackageSource::new(&options.registry, network);
        let lock = InstallLock::new(&extensions_dir, options.lock_wait(), options.lock_stale());

        log::debug!("Extension manager rooted at {}", extensions_dir.display());
        Ok(Self {
            options,
            extensions_dir,
            registry,
            loader,
            source,
            lock,
            installing: HashSet::new(),
        })
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn extensions_dir(&self) -> &Path {
        &self.extensions_dir
    }

    pub fn loader(&self) -> &SandboxedLoader {
        &self.loader
    }

    /// Install `name` from the registry; `version` defaults to `latest`.
    pub async fn install(&mut self, name: &str, version: Option<&str>) -> ExtensionResult<ExtensionInfo> {
        self.install_from_registry(name, version).await
    }

    pub async fn install_from_registry(
        &mut self,
        name: &str,
        version: Option<&str>,
    ) -> ExtensionResult<ExtensionInfo> {
        validate_name(name)?;
        let version = validate_version(name, version)?;

        let lock = self.lock.clone();
        lock.with_lock(self.install_from_registry_lock_free(name.to_string(), version))
            .await
    }

    /// Install the package whose sources live at `path`.
    pub async fn install_from_local_path(
        &mut self,
        path: &Path,
        options: LocalInstallOptions,
    ) -> ExtensionResult<ExtensionInfo> {
        let source_dir = fsutil::normalize_path(&self.options.cwd.join(path));
        let manifest = read_manifest(&source_dir)
            .await?
            .ok_or_else(|| ExtensionError::ManifestMissing(source_dir.clone()))?;

        let (name, version) = match (manifest.name, manifest.version) {
            (Some(name), Some(version)) if !name.is_empty() && !version.is_empty() => (name, version),
            _ => {
                return Err(ExtensionError::ManifestInvalid {
                    path: source_dir.join(MANIFEST_FILE),
                    reason: "required fields missing: name and version".to_string(),
                })
            }
        };
        validate_name(&name)?;

        let lock = self.lock.clone();
        lock.with_lock(self.install_from_local_path_lock_free(source_dir, name, version, options.force))
            .await
    }

    /// Register `code` as the entry module of a new extension.
    pub async fn install_from_code(
        &mut self,
        name: &str,
        code: &str,
        version: Option<&str>,
    ) -> ExtensionResult<ExtensionInfo> {
        validate_name(name)?;
        let version = version.unwrap_or(CODE_DEFAULT_VERSION);
        if version::parse_version(version).is_none() {
            return Err(ExtensionError::InvalidVersion {
                name: name.to_string(),
                version: version.to_string(),
            });
        }

        let lock = self.lock.clone();
        lock.with_lock(self.install_from_code_lock_free(name, code, version))
            .await
    }

    /// Remove `name`. Unknown names are ignored.
    pub async fn uninstall(&mut self, name: &str) -> ExtensionResult<()> {
        validate_name(name)?;
        let lock = self.lock.clone();
        lock.with_lock(self.uninstall_lock_free(name)).await?;
        Ok(())
    }

    /// Remove every extension, most recently installed first. Returns the
    /// removed extensions in teardown order.
    pub async fn uninstall_all(&mut self) -> ExtensionResult<Vec<ExtensionInfo>> {
        let lock = self.lock.clone();
        lock.with_lock(async {
            let names = self.registry.borrow().names();
            let mut removed = Vec::with_capacity(names.len());
            for name in names.iter().rev() {
                if let Some(info) = self.uninstall_lock_free(name).await? {
                    removed.push(info);
                }
            }
            Ok(removed)
        })
        .await
    }

    /// The installed info for `name` when it matches `range` under `mode`.
    pub fn already_installed(
        &self,
        name: &str,
        range: Option<&str>,
        mode: MatchMode,
    ) -> Option<ExtensionInfo> {
        let info = self.get_info(name)?;
        let Some(range) = range else {
            return Some(info);
        };

        if version::satisfies(&info.version, range) {
            return Some(info);
        }
        if mode == MatchMode::SatisfiesOrGreater && version::greater_than_range(&info.version, range) {
            return Some(info);
        }
        None
    }

    pub fn list(&self) -> Vec<ExtensionInfo> {
        self.registry.borrow().list()
    }

    pub fn get_info(&self, name: &str) -> Option<ExtensionInfo> {
        self.registry.borrow().get(name).cloned()
    }

    /// Load `qualified_name` (`name`, `name/sub/path`, `@scope/name/sub`) and
    /// return a JSON projection of its exports.
    pub fn require(&self, qualified_name: &str) -> ExtensionResult<serde_json::Value> {
        let (info, sub_path) = self.lookup(qualified_name)?;
        self.loader.require(&info, sub_path.as_deref())
    }

    /// Load `qualified_name` and pass its live exports to `f`.
    pub fn with_exports<R, F>(&self, qualified_name: &str, f: F) -> ExtensionResult<R>
    where
        F: for<'js> FnOnce(&Ctx<'js>, Value<'js>) -> rquickjs::Result<R>,
    {
        let (info, sub_path) = self.lookup(qualified_name)?;
        self.loader.with_exports(&info, sub_path.as_deref(), f)
    }

    /// Call an exported function of `qualified_name`.
    pub fn call(
        &self,
        qualified_name: &str,
        export: &str,
        args: &[serde_json::Value],
    ) -> ExtensionResult<serde_json::Value> {
        let (info, sub_path) = self.lookup(qualified_name)?;
        self.loader.call(&info, sub_path.as_deref(), export, args)
    }

    pub fn set_sandbox_template(
        &self,
        name: &str,
        template: Option<SandboxTemplate>,
    ) -> ExtensionResult<()> {
        validate_name(name)?;
        if self.get_info(name).is_none() {
            return Err(ExtensionError::NotInstalled(name.to_string()));
        }
        self.loader.set_template(name, template);
        Ok(())
    }

    pub fn get_sandbox_template(&self, name: &str) -> Option<SandboxTemplate> {
        self.loader.template(name)
    }

    /// Resolve `name@version` against the registry without installing.
    pub async fn query_package(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> ExtensionResult<PackageDescriptor> {
        validate_name(name)?;
        let version = validate_version(name, version)?;
        self.source.resolve(name, &version).await
    }

    /// Run `code` as a throwaway extension and return its exports.
    pub fn run_script(&self, code: &str) -> ExtensionResult<serde_json::Value> {
        let name = format!("dynamic-script-{}", uuid::Uuid::new_v4());
        let location = std::env::temp_dir().join(&name);
        let info = anonymous_extension_info(&name, &location);

        let result = self.loader.run_source(&info, code);
        self.loader.unload(&name);
        result
    }

    fn lookup(&self, qualified_name: &str) -> ExtensionResult<(ExtensionInfo, Option<String>)> {
        let (name, sub_path) = split_request(qualified_name);
        let info = self
            .get_info(&name)
            .ok_or_else(|| ExtensionError::NotInstalled(name.clone()))?;
        Ok((info, sub_path))
    }

    fn install_from_registry_lock_free(
        &mut self,
        name: String,
        version: String,
    ) -> LocalBoxFuture<'_, ExtensionResult<ExtensionInfo>> {
        async move {
            // Tags move over time; pin them to a concrete version first.
            let mut resolved: Option<PackageDescriptor> = None;
            let mut requested = version;
            if is_tag(&requested) {
                let descriptor = self.source.resolve(&name, &requested).await?;
                log::debug!("Tag {}@{} points to {}", name, requested, descriptor.version);
                requested = descriptor.version.clone();
                resolved = Some(descriptor);
            }

            if let Some(info) = self.already_installed(&name, Some(&requested), MatchMode::Satisfies) {
                log::debug!("{}@{} already satisfies {}", name, info.version, requested);
                return Ok(info);
            }

            if self.get_info(&name).is_some() {
                self.uninstall_lock_free(&name).await?;
            }

            let location = extension_location(&self.extensions_dir, &name);
            if let Some(info) = self.downloaded_package(&name, &requested, &location).await {
                log::debug!("Reusing {}@{} from {}", name, info.version, location.display());
                return self.add_extension(info).await;
            }

            let mut descriptor = match resolved {
                Some(descriptor) => descriptor,
                None => self.source.resolve(&name, &requested).await?,
            };
            if let Some(info) = self.downloaded_package(&name, &descriptor.version, &location).await {
                log::debug!("Reusing {}@{} from {}", name, info.version, location.display());
                return self.add_extension(info).await;
            }

            fsutil::remove_dir(&location).await?;
            descriptor.name = name.clone();
            self.source.fetch_archive(&self.extensions_dir, &descriptor).await?;

            let info = self.fetched_extension_info(&name, &location).await?;
            log::info!("Installed {}@{}", info.name, info.version);
            self.add_extension(info).await
        }
        .boxed_local()
    }

    /// Info for a freshly extracted archive. The package must declare the
    /// name it was requested under; anything else is removed again.
    async fn fetched_extension_info(
        &self,
        name: &str,
        location: &Path,
    ) -> ExtensionResult<ExtensionInfo> {
        let result = match create_extension_info(location).await {
            Ok(info) if info.name != name => Err(ExtensionError::ManifestInvalid {
                path: location.join(MANIFEST_FILE),
                reason: format!(
                    "package declares name '{}' but was installed as '{}'",
                    info.name, name
                ),
            }),
            other => other,
        };

        if result.is_err() {
            if let Err(e) = fsutil::remove_dir(location).await {
                log::warn!("Failed to clean up {}: {:#}", location.display(), e);
            }
        }
        result
    }

    async fn install_from_local_path_lock_free(
        &mut self,
        source_dir: PathBuf,
        name: String,
        version: String,
        force: bool,
    ) -> ExtensionResult<ExtensionInfo> {
        if !force {
            if let Some(info) = self.already_installed(&name, Some(&version), MatchMode::Satisfies) {
                return Ok(info);
            }
        }
        if self.get_info(&name).is_some() {
            self.uninstall_lock_free(&name).await?;
        }

        let location = extension_location(&self.extensions_dir, &name);
        let reusable = !force && self.downloaded_package(&name, &version, &location).await.is_some();
        let same_dir = fsutil::normalize_path(&source_dir) == fsutil::normalize_path(&location);

        if !reusable && !same_dir {
            let mut exclude = self.options.local_install_exclude.clone();
            // Never copy the destination into itself.
            if fsutil::is_within(&source_dir, &location) {
                if let Ok(relative) = self.extensions_dir.strip_prefix(&source_dir) {
                    exclude.push(relative.to_string_lossy().into_owned());
                }
            }
            fsutil::remove_dir(&location).await?;
            fsutil::copy_dir_filtered(&source_dir, &location, &exclude).await?;
            log::info!("Copied {} from {}", name, source_dir.display());
        }

        let info = create_extension_info(&location).await?;
        log::info!("Installed {}@{} from local path", info.name, info.version);
        self.add_extension(info).await
    }

    async fn install_from_code_lock_free(
        &mut self,
        name: &str,
        code: &str,
        version: &str,
    ) -> ExtensionResult<ExtensionInfo> {
        if self.get_info(name).is_some() {
            self.uninstall_lock_free(name).await?;
        }

        let location = extension_location(&self.extensions_dir, name);
        fsutil::remove_dir(&location).await?;
        let manifest = serde_json::json!({
            "name": name,
            "version": version,
            "main": "index.js",
        });
        fsutil::write_text(&location.join(MANIFEST_FILE), &manifest.to_string()).await?;
        fsutil::write_text(&location.join("index.js"), code).await?;

        let info = create_extension_info(&location).await?;
        log::info!("Installed {}@{} from code", info.name, info.version);
        self.add_extension(info).await
    }

    async fn uninstall_lock_free(&mut self, name: &str) -> ExtensionResult<Option<ExtensionInfo>> {
        let removed = self.registry.borrow_mut().remove(name);
        let Some(info) = removed else {
            log::debug!("Uninstall of {} ignored, not installed", name);
            return Ok(None);
        };

        self.loader.set_template(name, None);
        self.unload_with_dependents(name);

        fsutil::remove_dir(&info.location).await?;
        if name.starts_with('@') {
            if let Some(scope_dir) = info.location.parent() {
                if scope_dir != self.extensions_dir {
                    if let Err(e) = fsutil::remove_dir_if_empty(scope_dir).await {
                        log::warn!("Failed to clean up {}: {:#}", scope_dir.display(), e);
                    }
                }
            }
        }

        log::info!("Uninstalled {}@{}", info.name, info.version);
        Ok(Some(info))
    }

    /// Unload `name` and, transitively, every registered extension that
    /// depends on it. Files and registry entries are left alone.
    fn unload_with_dependents(&self, name: &str) {
        let mut visited = HashSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            self.loader.unload(&current);
            pending.extend(self.registry.borrow().dependents_of(&current));
        }
    }

    async fn add_extension(&mut self, info: ExtensionInfo) -> ExtensionResult<ExtensionInfo> {
        self.installing.insert(info.name.clone());
        let installed = self.install_dependencies(&info).await;
        self.installing.remove(&info.name);
        installed?;

        let previous = self.registry.borrow_mut().insert(info.clone());
        if previous.is_some() {
            self.loader.unload(&info.name);
        }
        Ok(info)
    }

    async fn install_dependencies(&mut self, info: &ExtensionInfo) -> ExtensionResult<()> {
        for (dependency, range) in &info.dependencies {
            if self.options.is_ignored_dependency(dependency) {
                log::debug!("Skipping ignored dependency {} of {}", dependency, info.name);
                continue;
            }
            if self.installing.contains(dependency) {
                log::debug!("Skipping {} of {}, already being installed", dependency, info.name);
                continue;
            }
            if self.host_provides(dependency, range) {
                log::debug!("Skipping {} of {}, provided by the host", dependency, info.name);
                continue;
            }
            if self
                .already_installed(dependency, Some(range), MatchMode::SatisfiesOrGreater)
                .is_some()
            {
                log::debug!("Skipping {} of {}, already installed", dependency, info.name);
                continue;
            }

            validate_name(dependency)?;
            let range = validate_version(dependency, Some(range))?;
            self.install_from_registry_lock_free(dependency.clone(), range)
                .await?;
        }
        Ok(())
    }

    fn host_provides(&self, dependency: &str, range: &str) -> bool {
        self.options
            .host_resolver
            .as_ref()
            .and_then(|resolver| resolver.package_version(dependency))
            .map_or(false, |version| version::satisfies(&version, range))
    }

    /// A compatible copy of `name` already extracted at `location`.
    async fn downloaded_package(&self, name: &str, range: &str, location: &Path) -> Option<ExtensionInfo> {
        if self.options.install_mode == InstallMode::NoCache || !fsutil::dir_exists(location).await {
            return None;
        }

        let manifest = match read_manifest(location).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return None,
            Err(e) => {
                log::debug!("Ignoring unreadable manifest in {}: {}", location.display(), e);
                return None;
            }
        };

        let matches = manifest.name.as_deref() == Some(name)
            && manifest
                .version
                .as_deref()
                .map_or(false, |v| version::satisfies(v, range));
        if !matches {
            return None;
        }
        extension_info_from_manifest(location, manifest).ok()
    }
}
