// Package Source
//
// Resolves package names and version requests against an npm-compatible
// registry and fetches the matching archives.

pub mod archive;
pub mod client;
pub mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;

use crate::config::{RegistryAuth, RegistryConfig};
use crate::error::{ExtensionError, ExtensionResult};
use crate::extensions::types::PackageDescriptor;
use crate::version::{self, VersionRange};

pub use client::{HttpNetworkTool, NetworkTool};
pub use types::PackageDocument;

pub struct PackageSource {
    base_url: String,
    headers: BTreeMap<String, String>,
    retries: u32,
    timeout: std::time::Duration,
    network: Arc<dyn NetworkTool>,
}

impl PackageSource {
    pub fn new(config: &RegistryConfig, network: Arc<dyn NetworkTool>) -> Self {
        let mut headers = config.headers.clone();
        if let Some(auth) = &config.auth {
            headers.insert("authorization".to_string(), authorization_header(auth));
        }

        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            headers,
            retries: config.retries,
            timeout: config.timeout(),
            network,
        }
    }

    /// `<registry>/<name>` with the scope separator encoded.
    pub fn metadata_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name.replace('/', "%2F"))
    }

    pub async fn fetch_metadata(&self, name: &str) -> ExtensionResult<PackageDocument> {
        let registry_error = |message: String| ExtensionError::Registry {
            name: name.to_string(),
            message,
        };

        let url = self.metadata_url(name);
        let body = self
            .network
            .get(&url, &self.headers, self.retries, self.timeout)
            .await
            .map_err(|e| registry_error(format!("{:#}", e)))?;

        PackageDocument::parse(&body).map_err(registry_error)
    }

    /// Pick the version `version_or_tag` refers to: a dist-tag, an exact
    /// version, or the highest version inside a range.
    pub async fn resolve(
        &self,
        name: &str,
        version_or_tag: &str,
    ) -> ExtensionResult<PackageDescriptor> {
        let document = self.fetch_metadata(name).await?;
        let descriptor = select_version(&document, version_or_tag).ok_or_else(|| {
            ExtensionError::VersionNotFound {
                name: name.to_string(),
                version: version_or_tag.to_string(),
            }
        })?;
        log::debug!("Resolved {}@{} to {}", name, version_or_tag, descriptor.version);
        Ok(descriptor.minimal())
    }

    /// Download the archive for `descriptor` and extract it into
    /// `dest_dir/<name>`. Returns the extraction directory.
    ///
    /// The archive is unpacked into a sibling staging directory that only
    /// replaces the target once extraction succeeded, so a failed download
    /// never leaves a partial package behind.
    pub async fn fetch_archive(
        &self,
        dest_dir: &Path,
        descriptor: &PackageDescriptor,
    ) -> ExtensionResult<PathBuf> {
        let name = descriptor.name.clone();
        let url = descriptor
            .dist
            .archive_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ExtensionError::MissingArchiveUrl(name.clone()))?;

        let temp = TempArchive::new();
        if temp.path.exists() {
            let _ = tokio::fs::remove_file(&temp.path).await;
        }

        log::info!("Downloading {}@{} from {}", name, descriptor.version, url);
        self.network
            .download(&url, &temp.path)
            .await
            .map_err(|e| ExtensionError::Download {
                name: name.clone(),
                message: format!("{:#}", e),
            })?;

        let target = dest_dir.join(&name);
        let integrity = descriptor.dist.integrity.clone();
        let archive_path = temp.path.clone();
        let extract_target = target.clone();
        let extract_name = name.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            if let Some(integrity) = integrity {
                match archive::verify_integrity(&archive_path, &integrity) {
                    Ok(true) => {}
                    Ok(false) => log::debug!("Skipping unsupported integrity {}", integrity),
                    Err(e) => {
                        log::warn!("Integrity mismatch for {}: {}", extract_name, e);
                        return Err(ExtensionError::Integrity {
                            name: extract_name,
                            expected: integrity,
                        });
                    }
                }
            }
            extract_staged(&archive_path, &extract_target).map_err(|e| {
                ExtensionError::Extract {
                    name: extract_name,
                    message: format!("{:#}", e),
                }
            })
        })
        .await
        .map_err(|e| ExtensionError::Extract {
            name: name.clone(),
            message: e.to_string(),
        })?;

        temp.remove().await;
        let files = outcome?;
        log::debug!("Extracted {} files into {}", files, target.display());
        Ok(target)
    }
}

fn select_version<'a>(
    document: &'a PackageDocument,
    version_or_tag: &str,
) -> Option<&'a PackageDescriptor> {
    let requested = document
        .dist_tags
        .get(version_or_tag)
        .map(String::as_str)
        .unwrap_or(version_or_tag);

    if let Some(exact) = document.version(requested) {
        return Some(exact);
    }

    let range = VersionRange::parse(requested).ok()?;
    let best = version::max_satisfying(document.versions().map(|(v, _)| v.as_str()), &range)?;
    document.version(best)
}

fn authorization_header(auth: &RegistryAuth) -> String {
    match auth {
        RegistryAuth::Token { token } => format!("Bearer {}", token),
        RegistryAuth::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            format!("Basic {}", encoded)
        }
    }
}

/// Sibling of `target` that an archive is unpacked into first.
fn staging_dir(target: &Path) -> PathBuf {
    let base = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}-{}.partial", base, uuid::Uuid::new_v4()))
}

fn extract_staged(archive_path: &Path, target: &Path) -> anyhow::Result<usize> {
    let staging = staging_dir(target);
    let result = archive::extract_tarball(archive_path, &staging).and_then(|files| {
        if target.exists() {
            std::fs::remove_dir_all(target)
                .with_context(|| format!("Failed to remove {}", target.display()))?;
        }
        std::fs::rename(&staging, target).with_context(|| {
            format!("Failed to move {} to {}", staging.display(), target.display())
        })?;
        Ok(files)
    });

    if result.is_err() {
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", staging.display(), e);
            }
        }
    }
    result
}

/// Temporary download target, removed when dropped.
struct TempArchive {
    path: PathBuf,
    removed: bool,
}

impl TempArchive {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("{}.tgz", uuid::Uuid::new_v4()));
        Self {
            path,
            removed: false,
        }
    }

    async fn remove(mut self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
        self.removed = true;
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
