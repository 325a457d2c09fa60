// Package archives
//
// Extraction of npm `.tgz` archives and `dist.integrity` verification.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha512};
use tar::{Archive, EntryType};

/// Extract `archive` into `dest`, dropping the leading `package/` directory
/// every npm tarball wraps its content in.
pub fn extract_tarball(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(false);
    #[cfg(unix)]
    archive.set_unpack_xattrs(false);

    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory {}", dest.display()))?;

    let mut extracted = 0;
    for entry in archive.entries().context("Bad tar.gz archive")? {
        let mut entry = entry.context("Bad tar.gz entry")?;
        let entry_path = entry.path().context("Invalid path in archive")?.into_owned();

        let Some(relative) = strip_first_component(&entry_path)? else {
            continue;
        };
        let target = dest.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create directory {}", target.display()))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create directory {}", parent.display())
                    })?;
                }
                entry
                    .unpack(&target)
                    .with_context(|| format!("Failed to extract {}", target.display()))?;
                extracted += 1;
            }
            other => {
                log::debug!("Skipping archive entry {} ({:?})", entry_path.display(), other);
            }
        }
    }

    Ok(extracted)
}

/// Entry path without its first component. `None` for the wrapper directory
/// itself; an error for anything that could land outside the destination.
fn strip_first_component(path: &Path) -> Result<Option<PathBuf>> {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));

    if components.next().is_none() {
        return Ok(None);
    }

    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => relative.push(part),
            _ => return Err(anyhow!("Archive entry escapes package root: {}", path.display())),
        }
    }

    if relative.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(relative))
    }
}

/// Check `archive` against an SRI string such as `sha512-<base64>`.
///
/// Returns `Ok(false)` when the algorithm is not one we verify.
pub fn verify_integrity(archive: &Path, integrity: &str) -> Result<bool> {
    // Several space-separated hashes may be listed; use the first sha512.
    let Some(expected) = integrity
        .split_whitespace()
        .find_map(|h| h.strip_prefix("sha512-"))
    else {
        return Ok(false);
    };

    let mut file = std::fs::File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;
    let mut hasher = Sha512::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let actual = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
    if actual != expected {
        return Err(anyhow!("expected sha512-{} but got sha512-{}", expected, actual));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::build_tarball;

    #[test]
    fn test_extract_strips_wrapper_directory() {
        let temp = tempfile::tempdir().unwrap();
        let archive_path = temp.path().join("pkg.tgz");
        let bytes = build_tarball(&[
            ("package.json", r#"{"name":"foo","version":"1.0.0"}"#),
            ("lib/index.js", "module.exports = 1;"),
        ]);
        std::fs::write(&archive_path, bytes).unwrap();

        let dest = temp.path().join("out");
        let count = extract_tarball(&archive_path, &dest).unwrap();
        assert_eq!(count, 2);
        assert!(dest.join("package.json").is_file());
        assert!(dest.join("lib/index.js").is_file());
        assert!(!dest.join("package").exists());
    }

    #[test]
    fn test_strip_first_component() {
        assert_eq!(
            strip_first_component(Path::new("package/lib/a.js")).unwrap(),
            Some(PathBuf::from("lib/a.js"))
        );
        assert_eq!(
            strip_first_component(Path::new("./package/a.js")).unwrap(),
            Some(PathBuf::from("a.js"))
        );
        assert_eq!(strip_first_component(Path::new("package/")).unwrap(), None);
        assert!(strip_first_component(Path::new("package/../../evil.js")).is_err());
    }

    #[test]
    fn test_verify_integrity() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data.tgz");
        std::fs::write(&path, b"hello").unwrap();

        let digest = base64::engine::general_purpose::STANDARD.encode(Sha512::digest(b"hello"));
        assert!(verify_integrity(&path, &format!("sha512-{}", digest)).unwrap());
        assert!(!verify_integrity(&path, "sha1-abcdef").unwrap());
        assert!(verify_integrity(&path, "sha512-AAAA").is_err());
    }
}
