// Registry document types

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::extensions::types::PackageDescriptor;

/// Registry metadata for one package (`GET <registry>/<name>`)
#[derive(Debug, Clone, Deserialize)]
pub struct PackageDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: Option<BTreeMap<String, PackageDescriptor>>,
}

impl PackageDocument {
    /// Parse and check the fields resolution depends on.
    pub fn parse(body: &str) -> Result<Self, String> {
        let document: PackageDocument =
            serde_json::from_str(body).map_err(|e| format!("Invalid JSON: {}", e))?;
        if document.name.as_deref().map_or(true, str::is_empty) {
            return Err("Invalid JSON: missing name".to_string());
        }
        if document.versions.is_none() {
            return Err("Invalid JSON: missing versions".to_string());
        }
        Ok(document)
    }

    pub fn versions(&self) -> impl Iterator<Item = (&String, &PackageDescriptor)> {
        self.versions.iter().flatten()
    }

    pub fn version(&self, version: &str) -> Option<&PackageDescriptor> {
        self.versions.as_ref().and_then(|v| v.get(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validates_required_fields() {
        let ok = r#"{
            "name": "left-pad",
            "dist-tags": { "latest": "1.3.0" },
            "versions": {
                "1.3.0": {
                    "name": "left-pad",
                    "version": "1.3.0",
                    "dist": { "tarball": "https://registry.test/left-pad/-/left-pad-1.3.0.tgz" }
                }
            }
        }"#;
        let doc = PackageDocument::parse(ok).unwrap();
        assert_eq!(doc.dist_tags.get("latest").map(String::as_str), Some("1.3.0"));
        let descriptor = doc.version("1.3.0").unwrap();
        assert!(descriptor.dist.archive_url.as_deref().unwrap().ends_with(".tgz"));

        assert!(PackageDocument::parse(r#"{ "versions": {} }"#).unwrap_err().contains("name"));
        assert!(PackageDocument::parse(r#"{ "name": "x" }"#).unwrap_err().contains("versions"));
        assert!(PackageDocument::parse("not json").is_err());
    }
}
