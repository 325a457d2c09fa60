// Module resolution
//
// Maps a require() request to where it points. Loading is done by the
// runtime; this module only decides what kind of thing a request names.

use std::path::{Path, PathBuf};

use super::builtins;
use super::registry::ExtensionDirectory;
use super::runtime::LoaderSettings;
use super::types::ExtensionInfo;
use crate::error::{ExtensionError, ExtensionResult};
use crate::fsutil::{is_within, normalize_path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A file inside the requesting extension
    File(PathBuf),
    /// Another installed extension, optionally with a path inside it
    Extension {
        name: String,
        sub_path: Option<String>,
    },
    /// A host-provided static dependency
    Static(String),
    /// A host built-in module (`path`, `os`, `url`)
    Builtin(String),
    /// A bare name nothing claims
    Unresolved(String),
}

/// Split `@scope/name/rest` or `name/rest` into the package name and a
/// `./rest` sub-path.
pub fn split_request(request: &str) -> (String, Option<String>) {
    let separator = if request.starts_with('@') {
        request
            .find('/')
            .and_then(|first| request[first + 1..].find('/').map(|second| first + 1 + second))
    } else {
        request.find('/')
    };

    match separator {
        Some(idx) => {
            let rest = request[idx + 1..].trim_start_matches('/');
            let sub_path = if rest.is_empty() {
                None
            } else {
                Some(format!("./{}", rest))
            };
            (request[..idx].to_string(), sub_path)
        }
        None => (request.to_string(), None),
    }
}

pub fn is_path_request(request: &str) -> bool {
    request == "."
        || request == ".."
        || request.starts_with("./")
        || request.starts_with("../")
        || Path::new(request).is_absolute()
}

pub fn resolve(
    settings: &LoaderSettings,
    directory: &dyn ExtensionDirectory,
    extension: &ExtensionInfo,
    from_dir: &Path,
    request: &str,
) -> ExtensionResult<Resolution> {
    if is_path_request(request) {
        let target = normalize_path(&from_dir.join(request));
        // Checked before the filesystem is consulted at all.
        if !is_within(&extension.location, &target) {
            return Err(ExtensionError::AccessDenied {
                extension: extension.name.clone(),
                request: request.to_string(),
            });
        }
        return probe(settings, &target)
            .map(Resolution::File)
            .ok_or_else(|| ExtensionError::FileNotFound {
                extension: extension.name.clone(),
                request: request.to_string(),
            });
    }

    let (name, sub_path) = split_request(request);
    if directory.extension(&name).is_some() {
        return Ok(Resolution::Extension { name, sub_path });
    }
    if settings.static_dependencies.contains_key(request) {
        return Ok(Resolution::Static(request.to_string()));
    }
    if settings.allow_builtins {
        if let Some(builtin) = builtins::builtin_name(request) {
            return Ok(Resolution::Builtin(builtin.to_string()));
        }
    }
    Ok(Resolution::Unresolved(request.to_string()))
}

/// Find the file `target` refers to: itself, with a known extension
/// appended, or a directory index.
pub fn probe(settings: &LoaderSettings, target: &Path) -> Option<PathBuf> {
    if target.is_file() {
        return Some(target.to_path_buf());
    }

    let extensions = settings.probe_extensions();
    for ext in &extensions {
        let mut candidate = target.as_os_str().to_os_string();
        candidate.push(".");
        candidate.push(ext);
        let candidate = PathBuf::from(candidate);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    if target.is_dir() {
        for ext in &extensions {
            let candidate = target.join(format!("index.{}", ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerOptions;
    use crate::extensions::extension::anonymous_extension_info;
    use crate::extensions::registry::ExtensionRegistry;
    use std::cell::RefCell;

    fn settings() -> LoaderSettings {
        let mut options = ManagerOptions::with_cwd("/tmp");
        options
            .static_dependencies
            .insert("host-api".to_string(), serde_json::json!({ "v": 1 }));
        LoaderSettings::from_options(&options)
    }

    #[test]
    fn test_split_request() {
        assert_eq!(split_request("foo"), ("foo".to_string(), None));
        assert_eq!(split_request("foo/lib/a"), ("foo".to_string(), Some("./lib/a".to_string())));
        assert_eq!(split_request("@scope/name"), ("@scope/name".to_string(), None));
        assert_eq!(
            split_request("@scope/name/util.js"),
            ("@scope/name".to_string(), Some("./util.js".to_string()))
        );
        assert_eq!(split_request("foo/"), ("foo".to_string(), None));
    }

    #[test]
    fn test_path_escape_is_denied_before_probing() {
        let temp = tempfile::tempdir().unwrap();
        let location = temp.path().join("ext");
        std::fs::create_dir_all(&location).unwrap();
        std::fs::write(temp.path().join("outside.js"), "secret").unwrap();

        let ext = anonymous_extension_info("ext", &location);
        let directory = RefCell::new(ExtensionRegistry::new());
        let err = resolve(&settings(), &directory, &ext, &location, "../outside").unwrap_err();
        assert!(matches!(err, ExtensionError::AccessDenied { .. }));

        let err = resolve(&settings(), &directory, &ext, &location, "../../outside").unwrap_err();
        assert!(matches!(err, ExtensionError::AccessDenied { .. }));
    }

    #[test]
    fn test_probing_order() {
        let temp = tempfile::tempdir().unwrap();
        let location = temp.path().join("ext");
        std::fs::create_dir_all(location.join("lib/dir")).unwrap();
        std::fs::write(location.join("lib/a.js"), "").unwrap();
        std::fs::write(location.join("lib/data.json"), "{}").unwrap();
        std::fs::write(location.join("lib/dir/index.js"), "").unwrap();

        let ext = anonymous_extension_info("ext", &location);
        let directory = RefCell::new(ExtensionRegistry::new());
        let settings = settings();
        let resolve_file = |request: &str| resolve(&settings, &directory, &ext, &location, request);

        assert_eq!(resolve_file("./lib/a").unwrap(), Resolution::File(location.join("lib/a.js")));
        assert_eq!(resolve_file("./lib/a.js").unwrap(), Resolution::File(location.join("lib/a.js")));
        assert_eq!(
            resolve_file("./lib/data").unwrap(),
            Resolution::File(location.join("lib/data.json"))
        );
        assert_eq!(
            resolve_file("./lib/dir").unwrap(),
            Resolution::File(location.join("lib/dir/index.js"))
        );
        assert!(matches!(
            resolve_file("./lib/missing"),
            Err(ExtensionError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_bare_name_dispatch() {
        let temp = tempfile::tempdir().unwrap();
        let location = temp.path().join("ext");
        let ext = anonymous_extension_info("ext", &location);

        let mut registry = ExtensionRegistry::new();
        registry.insert(anonymous_extension_info("@acme/tool", &temp.path().join("@acme/tool")));
        let directory = RefCell::new(registry);
        let settings = settings();

        assert_eq!(
            resolve(&settings, &directory, &ext, &location, "@acme/tool/sub").unwrap(),
            Resolution::Extension {
                name: "@acme/tool".to_string(),
                sub_path: Some("./sub".to_string())
            }
        );
        assert_eq!(
            resolve(&settings, &directory, &ext, &location, "host-api").unwrap(),
            Resolution::Static("host-api".to_string())
        );
        assert_eq!(
            resolve(&settings, &directory, &ext, &location, "node:path").unwrap(),
            Resolution::Builtin("path".to_string())
        );
        assert_eq!(
            resolve(&settings, &directory, &ext, &location, "lodash").unwrap(),
            Resolution::Unresolved("lodash".to_string())
        );

        let mut no_builtins = settings.clone();
        no_builtins.allow_builtins = false;
        assert_eq!(
            resolve(&no_builtins, &directory, &ext, &location, "os").unwrap(),
            Resolution::Unresolved("os".to_string())
        );
    }
}
