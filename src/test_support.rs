// Test support
//
// An in-memory npm registry implementing NetworkTool, plus helpers for
// building package archives and local package directories.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use sha2::{Digest, Sha512};
use tar::{Builder, EntryType, Header};

use crate::source::NetworkTool;

pub const REGISTRY_URL: &str = "https://registry.test";

#[derive(Default)]
struct Package {
    tags: BTreeMap<String, String>,
    versions: BTreeMap<String, serde_json::Value>,
}

#[derive(Default)]
pub struct MockRegistry {
    packages: Mutex<BTreeMap<String, Package>>,
    archives: Mutex<HashMap<String, Vec<u8>>>,
    truncated: Mutex<HashSet<String>>,
    last_headers: Mutex<BTreeMap<String, String>>,
    gets: AtomicUsize,
    downloads: AtomicUsize,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `name@version`. A package.json is generated from `deps` unless
    /// `files` already contains one. The version becomes `latest`.
    pub fn publish(&self, name: &str, version: &str, files: &[(&str, &str)], deps: &[(&str, &str)]) {
        let dependencies: BTreeMap<&str, &str> = deps.iter().copied().collect();
        let generated = json!({
            "name": name,
            "version": version,
            "dependencies": dependencies,
        })
        .to_string();

        let mut entries: Vec<(&str, &str)> = Vec::new();
        if !files.iter().any(|(path, _)| *path == "package.json") {
            entries.push(("package.json", generated.as_str()));
        }
        entries.extend_from_slice(files);

        let bytes = build_tarball(&entries);
        let integrity = format!(
            "sha512-{}",
            base64::engine::general_purpose::STANDARD.encode(Sha512::digest(&bytes))
        );
        let url = archive_url(name, version);

        self.archives.lock().unwrap().insert(url.clone(), bytes);

        let mut packages = self.packages.lock().unwrap();
        let package = packages.entry(name.to_string()).or_default();
        package.versions.insert(
            version.to_string(),
            json!({
                "name": name,
                "version": version,
                "dependencies": dependencies,
                "dist": { "tarball": url, "integrity": integrity },
            }),
        );
        package.tags.insert("latest".to_string(), version.to_string());
    }

    pub fn set_tag(&self, name: &str, tag: &str, version: &str) {
        let mut packages = self.packages.lock().unwrap();
        let package = packages.entry(name.to_string()).or_default();
        package.tags.insert(tag.to_string(), version.to_string());
    }

    /// Serve only the first half of `name@version`'s archive on its next
    /// download.
    pub fn truncate_next_download(&self, name: &str, version: &str) {
        self.truncated.lock().unwrap().insert(archive_url(name, version));
    }

    /// Strip `dist.integrity` so a damaged archive reaches extraction.
    pub fn drop_integrity(&self, name: &str, version: &str) {
        let mut packages = self.packages.lock().unwrap();
        if let Some(dist) = packages
            .get_mut(name)
            .and_then(|p| p.versions.get_mut(version))
            .and_then(|v| v.get_mut("dist"))
            .and_then(|d| d.as_object_mut())
        {
            dist.remove("integrity");
        }
    }

    pub fn metadata_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn last_headers(&self) -> BTreeMap<String, String> {
        self.last_headers.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkTool for MockRegistry {
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        _retries: u32,
        _timeout: std::time::Duration,
    ) -> Result<String> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        *self.last_headers.lock().unwrap() = headers.clone();

        let name = url
            .strip_prefix(REGISTRY_URL)
            .map(|p| p.trim_start_matches('/').replace("%2F", "/"))
            .ok_or_else(|| anyhow!("unexpected registry url {}", url))?;

        let packages = self.packages.lock().unwrap();
        let package = packages.get(&name).ok_or_else(|| anyhow!("HTTP 404: Not found"))?;
        Ok(json!({
            "name": name,
            "dist-tags": package.tags,
            "versions": package.versions,
        })
        .to_string())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let mut bytes = self
            .archives
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP 404 while downloading {}", url))?;
        if self.truncated.lock().unwrap().remove(url) {
            bytes.truncate(bytes.len() / 2);
        }
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }
}

fn archive_url(name: &str, version: &str) -> String {
    let basename = name.rsplit('/').next().unwrap_or(name);
    format!("{}/{}/-/{}-{}.tgz", REGISTRY_URL, name, basename, version)
}

/// Hex text that barely compresses, so a truncated archive fails mid-stream.
pub fn incompressible_text(len: usize) -> String {
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            char::from(b"0123456789abcdef"[(state & 0xf) as usize])
        })
        .collect()
}

/// A gzipped tarball with every file under the `package/` wrapper directory.
pub fn build_tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for (path, content) in files {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{}", path), content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Write a package directory (package.json plus `files`) at `dir`.
pub fn write_package(dir: &Path, manifest: serde_json::Value, files: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("package.json"), manifest.to_string()).unwrap();
    for (path, content) in files {
        let target = dir.join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(target, content).unwrap();
    }
}
