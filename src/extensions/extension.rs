// Extension metadata and validation
//
// Name/version checks applied before any I/O, and construction of
// ExtensionInfo from an extracted package directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use super::types::{Author, ExtensionInfo, PackageManifest};
use crate::error::{ExtensionError, ExtensionResult};
use crate::version;

pub const MANIFEST_FILE: &str = "package.json";
pub const DEFAULT_ENTRY_FILE: &str = "index.js";
pub const DEFAULT_VERSION_TAG: &str = "latest";

/// Reject names that could address anything outside their own directory.
pub fn validate_name(name: &str) -> ExtensionResult<()> {
    let invalid = || ExtensionError::InvalidName(name.to_string());

    if name.trim().is_empty() || name.starts_with('.') || name.contains('\\') {
        return Err(invalid());
    }
    if name.starts_with('/') {
        return Err(invalid());
    }
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    Ok(())
}

/// Default a missing version to `latest`; accept ranges and tag names.
pub fn validate_version(name: &str, version: Option<&str>) -> ExtensionResult<String> {
    let version = match version.map(str::trim) {
        None | Some("") => return Ok(DEFAULT_VERSION_TAG.to_string()),
        Some(v) => v,
    };

    if version::is_valid_range(version) || is_tag(version) {
        return Ok(version.to_string());
    }

    Err(ExtensionError::InvalidVersion {
        name: name.to_string(),
        version: version.to_string(),
    })
}

lazy_static::lazy_static! {
    static ref TAG_PATTERN: Option<Regex> = Regex::new(r"^[A-Za-z][A-Za-z0-9._-]*$").ok();
    static ref AUTHOR_PATTERN: Option<Regex> =
        Regex::new(r"^\s*([^<(]*?)\s*(?:<([^>]*)>)?\s*(?:\(([^)]*)\))?\s*$").ok();
}

/// Tag names such as `latest`, `next`, `beta-2`.
pub fn is_tag(value: &str) -> bool {
    TAG_PATTERN.as_ref().is_some_and(|re| re.is_match(value)) && !version::is_valid_range(value)
}

/// Parse an npm author field: `"Name <email> (url)"` or `{name, email, url}`.
pub fn parse_author(value: &serde_json::Value) -> Option<Author> {
    match value {
        serde_json::Value::String(raw) => parse_author_string(raw),
        serde_json::Value::Object(map) => {
            let field = |key: &str| {
                map.get(key)
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
            };
            let name = field("name")?;
            Some(Author {
                name,
                email: field("email"),
                url: field("url"),
            })
        }
        _ => None,
    }
}

fn parse_author_string(raw: &str) -> Option<Author> {
    let captures = AUTHOR_PATTERN.as_ref()?.captures(raw)?;
    let part = |idx: usize| {
        captures
            .get(idx)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let name = part(1)?;
    Some(Author {
        name,
        email: part(2),
        url: part(3),
    })
}

/// Read `<location>/package.json`. `Ok(None)` when the file does not exist.
pub async fn read_manifest(location: &Path) -> ExtensionResult<Option<PackageManifest>> {
    let path = location.join(MANIFEST_FILE);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| ExtensionError::ManifestInvalid {
            path,
            reason: e.to_string(),
        })
}

/// Build ExtensionInfo for the package extracted at `location`.
pub async fn create_extension_info(location: &Path) -> ExtensionResult<ExtensionInfo> {
    let manifest = read_manifest(location)
        .await?
        .ok_or_else(|| ExtensionError::ManifestMissing(location.to_path_buf()))?;
    extension_info_from_manifest(location, manifest)
}

pub fn extension_info_from_manifest(
    location: &Path,
    manifest: PackageManifest,
) -> ExtensionResult<ExtensionInfo> {
    let (name, version) = match (manifest.name, manifest.version) {
        (Some(name), Some(version)) if !name.is_empty() && !version.is_empty() => (name, version),
        _ => {
            return Err(ExtensionError::ManifestInvalid {
                path: location.join(MANIFEST_FILE),
                reason: "required fields missing: name and version".to_string(),
            })
        }
    };

    let main = manifest
        .main
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENTRY_FILE.to_string());

    let schema_version = manifest.schema_version.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    Ok(ExtensionInfo {
        name,
        version,
        location: location.to_path_buf(),
        entry_file: location.join(main),
        dependencies: manifest.dependencies.unwrap_or_default(),
        author: manifest.author.as_ref().and_then(parse_author),
        description: manifest.description.unwrap_or_default(),
        homepage: manifest.homepage,
        schema_version,
    })
}

/// Info for an ad hoc script rooted at `location`.
pub fn anonymous_extension_info(name: &str, location: &Path) -> ExtensionInfo {
    ExtensionInfo {
        name: name.to_string(),
        version: "0.0.0".to_string(),
        location: location.to_path_buf(),
        entry_file: location.join(DEFAULT_ENTRY_FILE),
        dependencies: BTreeMap::new(),
        author: None,
        description: String::new(),
        homepage: None,
        schema_version: None,
    }
}

/// Install directory for `name` (scoped names nest under their scope).
pub fn extension_location(extensions_dir: &Path, name: &str) -> PathBuf {
    name.split('/')
        .fold(extensions_dir.to_path_buf(), |path, segment| path.join(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_name_validation() {
        for ok in ["left-pad", "@acme/tool", "foo.bar", "my_ext"] {
            assert!(validate_name(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", "  ", ".hidden", "..", "a\\b", "a/../b", "/abs", "a//b", "a/./b", "a/"] {
            assert!(
                matches!(validate_name(bad), Err(ExtensionError::InvalidName(_))),
                "{:?} should be invalid",
                bad
            );
        }
    }

    #[test]
    fn test_version_validation() {
        assert_eq!(validate_version("x", None).unwrap(), "latest");
        assert_eq!(validate_version("x", Some("")).unwrap(), "latest");
        assert_eq!(validate_version("x", Some("^1.2.0")).unwrap(), "^1.2.0");
        assert_eq!(validate_version("x", Some("next")).unwrap(), "next");
        assert!(matches!(
            validate_version("x", Some("not a version!")),
            Err(ExtensionError::InvalidVersion { .. })
        ));
        assert!(is_tag("beta"));
        assert!(!is_tag("1.0.0"));
    }

    #[test]
    fn test_tag_pattern_is_compiled_once() {
        for tag in ["latest", "next", "beta-2", "rc.1"] {
            assert!(is_tag(tag), "{tag}");
        }
        assert!(!is_tag("2nd"));
        assert!(!is_tag("has space"));
        let first = TAG_PATTERN.as_ref().unwrap() as *const Regex;
        assert!(is_tag("canary"));
        assert_eq!(first, TAG_PATTERN.as_ref().unwrap() as *const Regex);
    }

    #[test]
    fn test_parse_author() {
        let author = parse_author(&json!("Jane Doe <jane@example.com> (https://jane.dev)")).unwrap();
        assert_eq!(author.name, "Jane Doe");
        assert_eq!(author.email.as_deref(), Some("jane@example.com"));
        assert_eq!(author.url.as_deref(), Some("https://jane.dev"));

        let author = parse_author(&json!("Solo")).unwrap();
        assert_eq!(author.name, "Solo");
        assert!(author.email.is_none());

        let author = parse_author(&json!({ "name": "Obj", "url": "https://o.dev" })).unwrap();
        assert_eq!(author.url.as_deref(), Some("https://o.dev"));

        assert!(parse_author(&json!(42)).is_none());
    }

    #[tokio::test]
    async fn test_create_extension_info() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("foo");

        let err = create_extension_info(&dir).await.unwrap_err();
        assert!(matches!(err, ExtensionError::ManifestMissing(_)));

        crate::test_support::write_package(&dir, json!({ "name": "foo" }), &[]);
        let err = create_extension_info(&dir).await.unwrap_err();
        assert!(err.to_string().contains("required fields missing"));

        crate::test_support::write_package(
            &dir,
            json!({
                "name": "foo",
                "version": "1.2.3",
                "main": "lib/main.js",
                "dependencies": { "bar": "^1.0.0" },
                "author": "Foo Bar <foo@bar.dev>",
                "schemaVersion": 2
            }),
            &[],
        );
        let info = create_extension_info(&dir).await.unwrap();
        assert_eq!(info.version, "1.2.3");
        assert_eq!(info.entry_file, dir.join("lib/main.js"));
        assert_eq!(info.dependencies.get("bar").map(String::as_str), Some("^1.0.0"));
        assert_eq!(info.author.unwrap().email.as_deref(), Some("foo@bar.dev"));
        assert_eq!(info.schema_version.as_deref(), Some("2"));
        assert_eq!(info.description, "");
    }

    #[test]
    fn test_extension_location_nests_scopes() {
        let root = Path::new("/ext");
        assert_eq!(extension_location(root, "@acme/tool"), PathBuf::from("/ext/@acme/tool"));
        assert_eq!(extension_location(root, "foo"), PathBuf::from("/ext/foo"));
    }
}
