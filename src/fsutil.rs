// Filesystem helpers
//
// Thin async wrappers over tokio::fs and walkdir used by the manager and the
// package source. Errors carry the path that failed.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

pub async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

pub async fn dir_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory {}", path.display()))
}

pub async fn read_text(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read_text(path).await?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub async fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Remove a directory tree; a missing directory is not an error.
pub async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Remove `path` only when it is an empty directory.
pub async fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    if entries.next_entry().await?.is_some() {
        return Ok(false);
    }
    tokio::fs::remove_dir(path)
        .await
        .with_context(|| format!("Failed to remove {}", path.display()))?;
    Ok(true)
}

/// Recursively copy `src` into `dst`, skipping entries whose path relative to
/// `src` matches one of `exclude` (case-insensitive).
pub async fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[String]) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    let exclude: Vec<String> = exclude.iter().map(|e| normalize_exclude(e)).collect();
    tokio::task::spawn_blocking(move || copy_tree(&src, &dst, &exclude))
        .await
        .context("Copy task panicked")?
}

fn normalize_exclude(pattern: &str) -> String {
    pattern
        .replace('\\', "/")
        .trim_matches('/')
        .to_lowercase()
}

fn copy_tree(src: &Path, dst: &Path, exclude: &[String]) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory {}", dst.display()))?;

    let walker = walkdir::WalkDir::new(src)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_excluded(src, entry.path(), exclude));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(src)
            .with_context(|| format!("{} is outside {}", path.display(), src.display()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory {}", target.display()))?;
        } else if entry.file_type().is_file() {
            std::fs::copy(path, &target).with_context(|| {
                format!("Failed to copy {} to {}", path.display(), target.display())
            })?;
        }
    }

    Ok(())
}

fn is_excluded(root: &Path, path: &Path, exclude: &[String]) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let relative = relative.to_string_lossy().replace('\\', "/").to_lowercase();
    exclude.iter().any(|e| *e == relative)
}

/// Lexically normalise a path: resolve `.` and `..` without touching the disk.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `path` is `root` or lies below it (component-wise, lexical).
pub fn is_within(root: &Path, path: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(root))
}
