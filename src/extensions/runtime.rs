// Extension Runtime - QuickJS module loader
//
// Provides the CommonJS execution environment for installed extensions:
// - One QuickJS runtime shared by every extension
// - A QuickJS context (globals, intrinsics) and module cache per extension
// - require() resolution across files, extensions, host built-ins and
//   static host dependencies

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use rquickjs::context::EvalOptions;
use rquickjs::function::{Rest, This};
use rquickjs::{CatchResultExt, Context, Ctx, Exception, Function, Object, Persistent, Runtime, Value};

use super::builtins;
use super::registry::ExtensionDirectory;
use super::resolve::{self, Resolution};
use super::sandbox::{self, js_to_json, json_to_js, ExecutionContext};
use super::types::{ExtensionInfo, SandboxTemplate};
use crate::config::{HostResolver, ManagerOptions};
use crate::error::{ExtensionError, ExtensionResult};
use crate::fsutil::is_within;

/// Loader configuration derived from ManagerOptions
#[derive(Clone)]
pub struct LoaderSettings {
    pub allow_builtins: bool,
    pub static_dependencies: BTreeMap<String, serde_json::Value>,
    pub source_extensions: Vec<String>,
    pub data_extensions: Vec<String>,
    pub host_resolver: Option<Arc<dyn HostResolver + Send + Sync>>,
    pub default_template: SandboxTemplate,
    pub host_env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl LoaderSettings {
    pub fn from_options(options: &ManagerOptions) -> Self {
        Self {
            allow_builtins: options.allow_builtins,
            static_dependencies: options.static_dependencies.clone(),
            source_extensions: options.source_extensions.clone(),
            data_extensions: options.data_extensions.clone(),
            host_resolver: options.host_resolver.clone(),
            default_template: options.sandbox.clone(),
            host_env: std::env::vars().collect(),
            cwd: options.cwd.clone(),
        }
    }

    /// Extensions tried when a request names a file without one.
    pub fn probe_extensions(&self) -> Vec<&str> {
        self.source_extensions
            .iter()
            .chain(&self.data_extensions)
            .map(|e| e.trim_start_matches('.'))
            .collect()
    }

    fn module_kind(&self, path: &Path) -> Option<ModuleKind> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        let matches = |list: &[String]| list.iter().any(|e| e.trim_start_matches('.') == ext);
        if matches(&self.source_extensions) {
            Some(ModuleKind::Source)
        } else if matches(&self.data_extensions) {
            Some(ModuleKind::Data)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ModuleKind {
    Source,
    Data,
}

struct ModuleRecord {
    module: Persistent<Object<'static>>,
    loaded: bool,
}

/// Everything loaded on behalf of one extension. Lives in the extension's
/// own context.
struct ExtensionState {
    info: ExtensionInfo,
    bootstrap: Persistent<Object<'static>>,
    modules: HashMap<PathBuf, ModuleRecord>,
    host_modules: HashMap<String, Persistent<Object<'static>>>,
}

/// Field order matters: module state must be released before the contexts
/// it lives in, and those before the runtime.
struct LoaderInner {
    this: Weak<LoaderInner>,
    settings: LoaderSettings,
    directory: Rc<dyn ExtensionDirectory>,
    templates: RefCell<HashMap<String, SandboxTemplate>>,
    extensions: RefCell<HashMap<String, ExtensionState>>,
    /// Only created and dropped from host code, never while JS runs.
    contexts: RefCell<HashMap<String, Context>>,
    /// Typed error behind the most recent exception thrown by the loader
    last_error: RefCell<Option<ExtensionError>>,
    runtime: Runtime,
}

/// Executes extension modules.
pub struct SandboxedLoader {
    inner: Rc<LoaderInner>,
}

impl SandboxedLoader {
    pub fn new(settings: LoaderSettings, directory: Rc<dyn ExtensionDirectory>) -> ExtensionResult<Self> {
        let runtime = Runtime::new().map_err(engine_error)?;

        let inner = Rc::new_cyclic(|this| LoaderInner {
            this: this.clone(),
            settings,
            directory,
            templates: RefCell::new(HashMap::new()),
            extensions: RefCell::new(HashMap::new()),
            contexts: RefCell::new(HashMap::new()),
            last_error: RefCell::new(None),
            runtime,
        });

        Ok(Self { inner })
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.inner.settings
    }

    /// Where `request` made from `from_dir` inside `extension` points.
    pub fn resolve(
        &self,
        extension: &ExtensionInfo,
        from_dir: &Path,
        request: &str,
    ) -> ExtensionResult<Resolution> {
        resolve::resolve(
            &self.inner.settings,
            &*self.inner.directory,
            extension,
            from_dir,
            request,
        )
    }

    /// Load `extension` (its entry or `sub_path`) and return a JSON
    /// projection of its exports.
    pub fn require(
        &self,
        extension: &ExtensionInfo,
        sub_path: Option<&str>,
    ) -> ExtensionResult<serde_json::Value> {
        self.with_exports(extension, sub_path, |ctx, exports| js_to_json(ctx, exports))
    }

    /// Load `extension` and hand the live exports value to `f`.
    pub fn with_exports<R, F>(
        &self,
        extension: &ExtensionInfo,
        sub_path: Option<&str>,
        f: F,
    ) -> ExtensionResult<R>
    where
        F: for<'js> FnOnce(&Ctx<'js>, Value<'js>) -> rquickjs::Result<R>,
    {
        let inner = &self.inner;
        self.host_call(&extension.name, move |ctx| {
            let exports = inner.load_entry(&ctx, extension, sub_path)?;
            f(&ctx, exports)
        })
    }

    /// Call the exported function `export` with JSON arguments. Promises are
    /// driven to completion.
    pub fn call(
        &self,
        extension: &ExtensionInfo,
        sub_path: Option<&str>,
        export: &str,
        args: &[serde_json::Value],
    ) -> ExtensionResult<serde_json::Value> {
        self.with_exports(extension, sub_path, |ctx, exports| {
            let target: Function = match exports.as_object() {
                Some(object) => object.get(export)?,
                None => {
                    return Err(Exception::throw_type(
                        ctx,
                        &format!("exports has no function '{}'", export),
                    ))
                }
            };
            let js_args = args
                .iter()
                .map(|arg| json_to_js(ctx, arg))
                .collect::<rquickjs::Result<Vec<_>>>()?;

            let result: Value = target.call((This(exports.clone()), Rest(js_args)))?;
            let settled = match result.as_promise() {
                Some(promise) => Some(promise.finish::<Value>()?),
                None => None,
            };
            js_to_json(ctx, settled.unwrap_or(result))
        })
    }

    /// Execute `code` as the entry module of `extension` without reading it
    /// from disk.
    pub fn run_source(
        &self,
        extension: &ExtensionInfo,
        code: &str,
    ) -> ExtensionResult<serde_json::Value> {
        let inner = &self.inner;
        self.host_call(&extension.name, move |ctx| {
            let exports = inner.load(&ctx, extension, &extension.entry_file, Some(code))?;
            js_to_json(&ctx, exports)
        })
    }

    /// Drop the module cache and execution context of `name`.
    pub fn unload(&self, name: &str) {
        let state = self.inner.extensions.borrow_mut().remove(name);
        // Module state first; it references values owned by the context.
        drop(state);
        let context = self.inner.contexts.borrow_mut().remove(name);
        if context.is_some() {
            log::debug!("Unloaded extension context {}", name);
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner.extensions.borrow().contains_key(name)
    }

    /// Whether `path` is a fully loaded module in `name`'s cache.
    pub fn is_cached(&self, name: &str, path: &Path) -> bool {
        self.inner
            .extensions
            .borrow()
            .get(name)
            .and_then(|state| state.modules.get(path))
            .map_or(false, |record| record.loaded)
    }

    /// Per-extension template override; `None` clears it. Applies the next
    /// time the extension's context is created.
    pub fn set_template(&self, name: &str, template: Option<SandboxTemplate>) {
        let mut templates = self.inner.templates.borrow_mut();
        match template {
            Some(template) => {
                templates.insert(name.to_string(), template);
            }
            None => {
                templates.remove(name);
            }
        }
    }

    pub fn template(&self, name: &str) -> Option<SandboxTemplate> {
        self.inner.templates.borrow().get(name).cloned()
    }

    /// Run `f` inside `extension`'s context and translate a pending
    /// exception into an ExtensionError.
    fn host_call<R, F>(&self, extension: &str, f: F) -> ExtensionResult<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<R>,
    {
        let context = self.prepare_contexts(extension)?;
        self.inner.last_error.replace(None);
        let outcome = context.with(|ctx| f(ctx.clone()).catch(&ctx).map_err(|e| e.to_string()));

        match outcome {
            Ok(value) => Ok(value),
            Err(message) => {
                let thrown = self.inner.last_error.take();
                match thrown {
                    Some(error) if message.contains(&error.to_string()) => Err(error),
                    _ => Err(ExtensionError::Execution {
                        extension: extension.to_string(),
                        message,
                    }),
                }
            }
        }
    }

    /// Context of `extension`, after making sure every extension a require
    /// could reach has one. Contexts cannot be created once JS is running.
    fn prepare_contexts(&self, extension: &str) -> ExtensionResult<Context> {
        let mut names = self.inner.directory.names();
        names.push(extension.to_string());

        let mut contexts = self.inner.contexts.borrow_mut();
        for name in names {
            if !contexts.contains_key(&name) {
                let context = Context::full(&self.inner.runtime).map_err(engine_error)?;
                log::debug!("Created execution context for {}", name);
                contexts.insert(name, context);
            }
        }
        contexts
            .get(extension)
            .cloned()
            .ok_or_else(|| ExtensionError::NotInstalled(extension.to_string()))
    }
}

impl LoaderInner {
    /// Run `f` in `name`'s context from inside a JS callback.
    fn enter<'js, R>(
        &self,
        caller: &Ctx<'js>,
        name: &str,
        f: impl for<'a> FnOnce(Ctx<'a>) -> rquickjs::Result<R>,
    ) -> rquickjs::Result<R> {
        let raw: Option<NonNull<_>> = self.contexts.borrow().get(name).map(Context::as_raw);
        let Some(raw) = raw else {
            return Err(self.throw(caller, ExtensionError::NotInstalled(name.to_string())));
        };
        // SAFETY: only reached from require callbacks, so the runtime lock
        // taken by host_call is held. The context belongs to the same
        // runtime and stays in `contexts` until the next host-side unload.
        // The Ctx cannot escape `f`.
        let ctx = unsafe { Ctx::from_raw(raw) };
        f(ctx)
    }

    /// Throw `error` into JS, remembering it for the host boundary.
    fn throw(&self, ctx: &Ctx<'_>, error: ExtensionError) -> rquickjs::Error {
        let message = error.to_string();
        *self.last_error.borrow_mut() = Some(error);
        Exception::throw_message(ctx, &message)
    }

    fn state_info(&self, name: &str) -> Option<ExtensionInfo> {
        self.extensions.borrow().get(name).map(|s| s.info.clone())
    }

    fn load_entry<'js>(
        &self,
        ctx: &Ctx<'js>,
        extension: &ExtensionInfo,
        sub_path: Option<&str>,
    ) -> rquickjs::Result<Value<'js>> {
        let path = match sub_path {
            Some(sub_path) => {
                let resolution = resolve::resolve(
                    &self.settings,
                    &*self.directory,
                    extension,
                    &extension.location,
                    sub_path,
                )
                .map_err(|e| self.throw(ctx, e))?;
                match resolution {
                    Resolution::File(path) => path,
                    _ => {
                        return Err(self.throw(
                            ctx,
                            ExtensionError::FileNotFound {
                                extension: extension.name.clone(),
                                request: sub_path.to_string(),
                            },
                        ))
                    }
                }
            }
            None => {
                if !is_within(&extension.location, &extension.entry_file) {
                    return Err(self.throw(
                        ctx,
                        ExtensionError::AccessDenied {
                            extension: extension.name.clone(),
                            request: extension.entry_file.display().to_string(),
                        },
                    ));
                }
                resolve::probe(&self.settings, &extension.entry_file).ok_or_else(|| {
                    self.throw(
                        ctx,
                        ExtensionError::FileNotFound {
                            extension: extension.name.clone(),
                            request: extension.entry_file.display().to_string(),
                        },
                    )
                })?
            }
        };
        self.load(ctx, extension, &path, None)
    }

    /// Fill `ctx`'s globals for `extension` on first use. `ctx` must be the
    /// extension's own context.
    fn ensure_state(&self, ctx: &Ctx<'_>, extension: &ExtensionInfo) -> rquickjs::Result<()> {
        if self.extensions.borrow().contains_key(&extension.name) {
            return Ok(());
        }

        let template = self
            .templates
            .borrow()
            .get(&extension.name)
            .cloned()
            .unwrap_or_else(|| self.settings.default_template.clone());
        let context = ExecutionContext::from_template(&template, &self.settings.host_env, &self.settings.cwd);
        let bootstrap = sandbox::install(ctx, &context)?;

        log::debug!("Initialised globals for {}", extension.name);
        self.extensions.borrow_mut().insert(
            extension.name.clone(),
            ExtensionState {
                info: extension.clone(),
                bootstrap: Persistent::save(ctx, bootstrap),
                modules: HashMap::new(),
                host_modules: HashMap::new(),
            },
        );
        Ok(())
    }

    fn cached_module<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        path: &Path,
    ) -> rquickjs::Result<Option<Object<'js>>> {
        let record = self
            .extensions
            .borrow()
            .get(name)
            .and_then(|state| state.modules.get(path))
            .map(|record| record.module.clone());
        record.map(|module| module.restore(ctx)).transpose()
    }

    fn set_module_state(&self, name: &str, path: &Path, record: Option<ModuleRecord>) {
        let mut extensions = self.extensions.borrow_mut();
        let Some(state) = extensions.get_mut(name) else {
            return;
        };
        match record {
            Some(record) => {
                state.modules.insert(path.to_path_buf(), record);
            }
            None => {
                state.modules.remove(path);
            }
        }
    }

    fn mark_loaded(&self, name: &str, path: &Path) {
        if let Some(record) = self
            .extensions
            .borrow_mut()
            .get_mut(name)
            .and_then(|state| state.modules.get_mut(path))
        {
            record.loaded = true;
        }
    }

    /// Load one module. The cache record is registered before the module
    /// body runs, so a circular require sees the same (partial) exports.
    fn load<'js>(
        &self,
        ctx: &Ctx<'js>,
        extension: &ExtensionInfo,
        path: &Path,
        source: Option<&str>,
    ) -> rquickjs::Result<Value<'js>> {
        self.ensure_state(ctx, extension)?;

        if let Some(module) = self.cached_module(ctx, &extension.name, path)? {
            return module.get("exports");
        }

        let Some(kind) = self.settings.module_kind(path) else {
            return Err(self.throw(ctx, ExtensionError::UnsupportedModule(path.to_path_buf())));
        };

        let filename = path.to_string_lossy().into_owned();
        let dirname = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let module = Object::new(ctx.clone())?;
        let exports = Object::new(ctx.clone())?;
        let require = self.make_require(ctx, &extension.name, path.parent().unwrap_or(path))?;
        module.set("exports", exports.clone())?;
        module.set("id", filename.as_str())?;
        module.set("filename", filename.as_str())?;
        module.set("loaded", false)?;
        module.set("require", require.clone())?;

        self.set_module_state(
            &extension.name,
            path,
            Some(ModuleRecord {
                module: Persistent::save(ctx, module.clone()),
                loaded: false,
            }),
        );

        let executed = self.execute(
            ctx, kind, path, source, &module, exports, require, filename, dirname,
        );
        if let Err(e) = executed {
            self.set_module_state(&extension.name, path, None);
            log::debug!("Evicted {} after failed load", path.display());
            return Err(e);
        }

        module.set("loaded", true)?;
        self.mark_loaded(&extension.name, path);
        module.get("exports")
    }

    #[allow(clippy::too_many_arguments)]
    fn execute<'js>(
        &self,
        ctx: &Ctx<'js>,
        kind: ModuleKind,
        path: &Path,
        source: Option<&str>,
        module: &Object<'js>,
        exports: Object<'js>,
        require: Function<'js>,
        filename: String,
        dirname: String,
    ) -> rquickjs::Result<()> {
        let content = match source {
            Some(source) => source.to_string(),
            None => std::fs::read_to_string(path).map_err(|source| {
                self.throw(
                    ctx,
                    ExtensionError::ModuleRead {
                        path: path.to_path_buf(),
                        source,
                    },
                )
            })?,
        };

        match kind {
            ModuleKind::Data => {
                let value = ctx.json_parse(content)?;
                module.set("exports", value)
            }
            ModuleKind::Source => {
                let wrapper = wrap_commonjs(&content);
                let mut options = EvalOptions::default();
                options.strict = false;
                let body: Function = ctx.eval_with_options(wrapper, options)?;
                body.call::<_, Value>((
                    This(exports.clone()),
                    exports,
                    require,
                    module.clone(),
                    filename,
                    dirname,
                ))?;
                Ok(())
            }
        }
    }

    fn make_require<'js>(
        &self,
        ctx: &Ctx<'js>,
        extension: &str,
        dir: &Path,
    ) -> rquickjs::Result<Function<'js>> {
        let loader = self.this.clone();
        let extension = extension.to_string();
        let dir = dir.to_path_buf();
        // Callbacks see the caller's context, which differs when a require
        // function is handed to another extension.
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, request: String| {
            let Some(inner) = loader.upgrade() else {
                return Err(Exception::throw_message(&ctx, "Extension loader has been dropped"));
            };
            if inner.owns(&extension, &ctx) {
                return inner.require_from(&ctx, &extension, &dir, &request);
            }
            let value = inner.enter(&ctx, &extension, |own| {
                let value = inner.require_from(&own, &extension, &dir, &request)?;
                Ok(Persistent::save(&own, value))
            })?;
            value.restore(&ctx)
        })
    }

    fn owns(&self, name: &str, ctx: &Ctx<'_>) -> bool {
        self.contexts
            .borrow()
            .get(name)
            .map_or(false, |context| context.as_raw() == ctx.as_raw())
    }

    fn require_from<'js>(
        &self,
        ctx: &Ctx<'js>,
        extension: &str,
        from_dir: &Path,
        request: &str,
    ) -> rquickjs::Result<Value<'js>> {
        let info = match self.state_info(extension).or_else(|| self.directory.extension(extension)) {
            Some(info) => info,
            None => {
                return Err(self.throw(ctx, ExtensionError::NotInstalled(extension.to_string())))
            }
        };

        let resolution = resolve::resolve(&self.settings, &*self.directory, &info, from_dir, request)
            .map_err(|e| self.throw(ctx, e))?;
        log::debug!("{} requires {} -> {:?}", extension, request, resolution);

        match resolution {
            Resolution::File(path) => self.load(ctx, &info, &path, None),
            Resolution::Static(name) => match self.settings.static_dependencies.get(&name) {
                Some(value) => json_to_js(ctx, value),
                None => Err(self.module_not_found(ctx, extension, request)),
            },
            Resolution::Extension { name, sub_path } => match self.directory.extension(&name) {
                Some(other) => self.require_extension(ctx, &other, sub_path.as_deref()),
                None => Err(self.module_not_found(ctx, extension, request)),
            },
            Resolution::Builtin(name) => self.builtin(ctx, extension, &name),
            Resolution::Unresolved(name) => {
                let fallback = self
                    .settings
                    .host_resolver
                    .as_ref()
                    .and_then(|resolver| resolver.require(&name));
                match fallback {
                    Some(value) => json_to_js(ctx, &value),
                    None => Err(self.module_not_found(ctx, extension, request)),
                }
            }
        }
    }

    /// Load another extension in its own context and hand its exports to
    /// the caller's.
    fn require_extension<'js>(
        &self,
        ctx: &Ctx<'js>,
        other: &ExtensionInfo,
        sub_path: Option<&str>,
    ) -> rquickjs::Result<Value<'js>> {
        let exports = self.enter(ctx, &other.name, |other_ctx| {
            let exports = self.load_entry(&other_ctx, other, sub_path)?;
            Ok(Persistent::save(&other_ctx, exports))
        })?;
        exports.restore(ctx)
    }

    fn module_not_found(&self, ctx: &Ctx<'_>, extension: &str, request: &str) -> rquickjs::Error {
        self.throw(
            ctx,
            ExtensionError::ModuleNotFound {
                extension: extension.to_string(),
                request: request.to_string(),
            },
        )
    }

    fn builtin<'js>(&self, ctx: &Ctx<'js>, extension: &str, name: &str) -> rquickjs::Result<Value<'js>> {
        let cached = self
            .extensions
            .borrow()
            .get(extension)
            .and_then(|state| state.host_modules.get(name).cloned());
        if let Some(module) = cached {
            return Ok(module.restore(ctx)?.into_value());
        }

        let bootstrap = self
            .extensions
            .borrow()
            .get(extension)
            .map(|state| state.bootstrap.clone());
        let Some(bootstrap) = bootstrap else {
            return Err(self.throw(ctx, ExtensionError::NotInstalled(extension.to_string())));
        };
        let bootstrap = bootstrap.restore(ctx)?;
        let cwd = self.settings.cwd.to_string_lossy().into_owned();
        let module = builtins::create_module(ctx, name, &cwd, &bootstrap)?;

        if let Some(state) = self.extensions.borrow_mut().get_mut(extension) {
            state
                .host_modules
                .insert(name.to_string(), Persistent::save(ctx, module.clone()));
        }
        Ok(module.into_value())
    }
}

/// The familiar CommonJS module function, evaluated in sloppy mode.
fn wrap_commonjs(code: &str) -> String {
    let code = if code.starts_with("#!") {
        // Keep line numbers stable.
        match code.find('\n') {
            Some(idx) => &code[idx..],
            None => "",
        }
    } else {
        code
    };
    format!(
        "(function (exports, require, module, __filename, __dirname) {{\n{}\n}})",
        code
    )
}

fn engine_error(e: rquickjs::Error) -> ExtensionError {
    ExtensionError::Other(anyhow::anyhow!("QuickJS initialisation failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::extension::anonymous_extension_info;
    use crate::extensions::registry::ExtensionRegistry;
    use serde_json::json;
    use std::cell::RefCell;

    struct Fixture {
        _temp: tempfile::TempDir,
        root: PathBuf,
        registry: Rc<RefCell<ExtensionRegistry>>,
        loader: SandboxedLoader,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_options(|_| {})
        }

        fn with_options(configure: impl FnOnce(&mut ManagerOptions)) -> Self {
            let temp = tempfile::tempdir().unwrap();
            let root = temp.path().to_path_buf();
            let mut options = ManagerOptions::with_cwd(&root);
            configure(&mut options);
            let registry = Rc::new(RefCell::new(ExtensionRegistry::new()));
            let loader =
                SandboxedLoader::new(LoaderSettings::from_options(&options), registry.clone()).unwrap();
            Self {
                _temp: temp,
                root,
                registry,
                loader,
            }
        }

        fn extension(&self, name: &str, files: &[(&str, &str)]) -> ExtensionInfo {
            let location = self.root.join(name);
            for (path, content) in files {
                let target = location.join(path);
                std::fs::create_dir_all(target.parent().unwrap()).unwrap();
                std::fs::write(target, content).unwrap();
            }
            let info = anonymous_extension_info(name, &location);
            self.registry.borrow_mut().insert(info.clone());
            info
        }
    }

    #[test]
    fn test_require_entry_exports() {
        let fixture = Fixture::new();
        let ext = fixture.extension(
            "greeter",
            &[
                ("index.js", "const util = require('./lib/util'); module.exports = { greeting: util.hello('world'), data: require('./data') };"),
                ("lib/util.js", "exports.hello = function (who) { return 'hello ' + who; };"),
                ("data.json", r#"{ "answer": 42 }"#),
            ],
        );

        let exports = fixture.loader.require(&ext, None).unwrap();
        assert_eq!(exports, json!({ "greeting": "hello world", "data": { "answer": 42 } }));
        assert!(fixture.loader.is_cached("greeter", &ext.location.join("lib/util.js")));

        let util = fixture.loader.require(&ext, Some("./lib/util")).unwrap();
        assert_eq!(util, json!({}));
    }

    #[test]
    fn test_circular_requires_share_partial_exports() {
        let fixture = Fixture::new();
        let ext = fixture.extension(
            "cycle",
            &[
                (
                    "index.js",
                    "exports.early = 'a'; exports.count = (globalThis.count || 0) + 1; globalThis.count = exports.count; const b = require('./b'); exports.sawB = b.fromA; exports.same = b.aExports === exports;",
                ),
                ("b.js", "const a = require('./index'); exports.fromA = a.early; exports.aExports = a;"),
            ],
        );

        let exports = fixture.loader.require(&ext, None).unwrap();
        assert_eq!(exports["sawB"], "a");
        assert_eq!(exports["same"], true);
        assert_eq!(exports["count"], 1);
    }

    #[test]
    fn test_failed_module_is_evicted() {
        let fixture = Fixture::new();
        let ext = fixture.extension(
            "flaky",
            &[
                ("index.js", "globalThis.attempts = (globalThis.attempts || 0) + 1; if (globalThis.attempts === 1) throw new Error('first run fails'); module.exports = globalThis.attempts;"),
            ],
        );

        let err = fixture.loader.require(&ext, None).unwrap_err();
        match err {
            ExtensionError::Execution { extension, message } => {
                assert_eq!(extension, "flaky");
                assert!(message.contains("first run fails"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!fixture.loader.is_cached("flaky", &ext.entry_file));

        assert_eq!(fixture.loader.require(&ext, None).unwrap(), json!(2));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let fixture = Fixture::new();
        let code = "globalThis.shared = (typeof shared === 'undefined' ? 0 : shared) + 1; leaked = 'x'; module.exports = { shared: shared, leaked: typeof leaked };";
        let one = fixture.extension("one", &[("index.js", code)]);
        let two = fixture.extension("two", &[("index.js", code)]);

        assert_eq!(fixture.loader.require(&one, None).unwrap(), json!({ "shared": 1, "leaked": "string" }));
        assert_eq!(fixture.loader.require(&two, None).unwrap(), json!({ "shared": 1, "leaked": "string" }));
        assert!(!fixture.loader.is_cached("one", &two.entry_file));

        fixture.loader.unload("one");
        assert!(!fixture.loader.is_loaded("one"));
        assert!(fixture.loader.is_loaded("two"));
        assert_eq!(fixture.loader.require(&one, None).unwrap()["shared"], 1);
    }

    #[test]
    fn test_intrinsics_are_not_shared() {
        let fixture = Fixture::new();
        let a = fixture.extension(
            "a",
            &[(
                "index.js",
                "Array.prototype.evil = 'from-a'; Math.secret = 'a-math'; exports.proto = [].evil; exports.secret = function () { return Math.secret; };",
            )],
        );
        let b = fixture.extension(
            "b",
            &[(
                "index.js",
                "const a = require('a'); module.exports = { proto: [].evil || null, math: Math.secret || null, viaA: a.secret(), seenByA: a.proto };",
            )],
        );

        assert_eq!(fixture.loader.require(&a, None).unwrap()["proto"], "from-a");
        assert_eq!(
            fixture.loader.require(&b, None).unwrap(),
            json!({ "proto": null, "math": null, "viaA": "a-math", "seenByA": "from-a" })
        );
    }

    #[test]
    fn test_undeclared_identifiers_are_reference_errors() {
        let fixture = Fixture::new();
        let ext = fixture.extension(
            "strictish",
            &[(
                "index.js",
                "module.exports = (function () { try { undeclaredThing; return 'resolved'; } catch (e) { return e instanceof ReferenceError; } })();",
            )],
        );
        assert_eq!(fixture.loader.require(&ext, None).unwrap(), json!(true));
    }

    #[test]
    fn test_escaped_require_runs_in_owner_context() {
        let fixture = Fixture::new();
        fixture.extension(
            "owner",
            &[
                ("index.js", "globalThis.marker = 'owner'; exports.req = require;"),
                ("lib.js", "module.exports = typeof marker === 'undefined' ? 'none' : marker;"),
            ],
        );
        let guest = fixture.extension(
            "guest",
            &[("index.js", "const owner = require('owner'); module.exports = [owner.req('./lib'), typeof marker];")],
        );

        assert_eq!(fixture.loader.require(&guest, None).unwrap(), json!(["owner", "undefined"]));
        assert!(fixture.loader.is_cached("owner", &fixture.root.join("owner/lib.js")));
    }

    #[test]
    fn test_buffer_global_and_module() {
        let fixture = Fixture::new();
        let ext = fixture.extension(
            "bytes",
            &[(
                "index.js",
                "const { Buffer: Imported } = require('buffer'); const hi = Buffer.from('hi'); module.exports = { base64: hi.toString('base64'), hex: hi.toString('hex'), decoded: Buffer.from('aGk=', 'base64').toString(), isBuffer: Buffer.isBuffer(hi), plain: Buffer.isBuffer(new Uint8Array(1)), length: Buffer.byteLength('héllo'), same: Imported === Buffer };",
            )],
        );
        assert_eq!(
            fixture.loader.require(&ext, None).unwrap(),
            json!({ "base64": "aGk=", "hex": "6869", "decoded": "hi", "isBuffer": true, "plain": false, "length": 6, "same": true })
        );
    }

    #[test]
    fn test_path_escape_is_access_denied() {
        let fixture = Fixture::new();
        std::fs::write(fixture.root.join("outside.js"), "module.exports = 'secret';").unwrap();
        let ext = fixture.extension("escape", &[("index.js", "module.exports = require('../../outside');")]);

        let err = fixture.loader.require(&ext, None).unwrap_err();
        assert!(matches!(err, ExtensionError::AccessDenied { .. }), "{:?}", err);

        let ext = fixture.extension(
            "catcher",
            &[("index.js", "try { require('../outside'); module.exports = 'loaded'; } catch (e) { module.exports = e.message; }")],
        );
        let message = fixture.loader.require(&ext, None).unwrap();
        assert!(message.as_str().unwrap().starts_with("Access denied"));
    }

    #[test]
    fn test_missing_module_and_unsupported_type() {
        let fixture = Fixture::new();
        let ext = fixture.extension("needy", &[("index.js", "module.exports = require('left-pad');")]);
        let err = fixture.loader.require(&ext, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Module not found, extension 'needy' cannot load 'left-pad'"
        );

        let ext = fixture.extension(
            "odd",
            &[("index.js", "module.exports = require('./style.css');"), ("style.css", "body {}")],
        );
        let err = fixture.loader.require(&ext, None).unwrap_err();
        assert!(matches!(err, ExtensionError::UnsupportedModule(_)));
    }

    #[test]
    fn test_cross_extension_static_and_builtin_requires() {
        let fixture = Fixture::with_options(|options| {
            options
                .static_dependencies
                .insert("host-api".to_string(), json!({ "version": 3 }));
        });
        fixture.extension("@acme/strings", &[("index.js", "exports.upper = function (s) { return s.toUpperCase(); };"), ("extra.js", "module.exports = 'extra';")]);
        let ext = fixture.extension(
            "consumer",
            &[(
                "index.js",
                "const path = require('node:path'); const strings = require('@acme/strings'); module.exports = { upper: strings.upper('abc'), extra: require('@acme/strings/extra'), host: require('host-api').version, joined: path.join('a', 'b', '../c'), url: new (require('url').URL)('https://x.dev/p?q=1').search, platform: typeof process.platform };",
            )],
        );

        let exports = fixture.loader.require(&ext, None).unwrap();
        assert_eq!(
            exports,
            json!({ "upper": "ABC", "extra": "extra", "host": 3, "joined": "a/c", "url": "?q=1", "platform": "string" })
        );
        assert!(fixture.loader.is_loaded("@acme/strings"));
    }

    #[test]
    fn test_templates_shape_the_context() {
        let fixture = Fixture::with_options(|options| {
            let mut env = BTreeMap::new();
            env.insert("MODE".to_string(), "default".to_string());
            options.sandbox.env = Some(env);
        });
        let code = "process.env.MODE_SEEN = process.env.MODE; module.exports = { mode: process.env.MODE, flag: typeof flag === 'undefined' ? null : flag };";
        let ext = fixture.extension("templated", &[("index.js", code)]);

        assert_eq!(fixture.loader.require(&ext, None).unwrap(), json!({ "mode": "default", "flag": null }));

        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "custom".to_string());
        let mut globals = serde_json::Map::new();
        globals.insert("flag".to_string(), json!(true));
        fixture.loader.set_template(
            "templated",
            Some(SandboxTemplate {
                env: Some(env),
                globals: Some(globals),
            }),
        );
        fixture.loader.unload("templated");
        assert_eq!(fixture.loader.require(&ext, None).unwrap(), json!({ "mode": "custom", "flag": true }));
        assert!(fixture.loader.template("templated").is_some());
    }

    #[test]
    fn test_call_exported_function() {
        let fixture = Fixture::new();
        let ext = fixture.extension(
            "math",
            &[(
                "index.js",
                "exports.add = function (a, b) { return a + b; }; exports.later = async function (x) { return { doubled: x * 2 }; };",
            )],
        );
        assert_eq!(fixture.loader.call(&ext, None, "add", &[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(fixture.loader.call(&ext, None, "later", &[json!(4)]).unwrap(), json!({ "doubled": 8 }));
        assert!(fixture.loader.call(&ext, None, "missing", &[]).is_err());
    }

    #[test]
    fn test_run_source_with_shebang() {
        let fixture = Fixture::new();
        let ext = anonymous_extension_info("script", &fixture.root.join("script"));
        let exports = fixture
            .loader
            .run_source(&ext, "#!/usr/bin/env node\nmodule.exports = [__filename.endsWith('index.js'), this === exports];")
            .unwrap();
        assert_eq!(exports, json!([true, true]));
    }
}
