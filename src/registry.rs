//! Remote registry manifests and clients
//!
//! A registry publishes a single `manifest.json` listing every component it
//! carries, the versions available, where each version's content lives and
//! the checksum of that content:
//!
//! ```json
//! {
//!   "name": "fractary",
//!   "components": [
//!     {
//!       "name": "base-agent",
//!       "type": "agent",
//!       "description": "General purpose agent",
//!       "versions": [
//!         {
//!           "version": "1.2.0",
//!           "content": "agents/base-agent/1.2.0.json",
//!           "checksum": "sha256:9f86d0...",
//!           "dependencies": [{ "name": "web-search", "type": "tool", "version": "^2.0.0" }]
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Content URIs are either absolute (`https://`, `file://`) or relative to the
//! registry root. The content document is a [`ContentBundle`].
//!
//! Two transports exist, mirroring each other: a directory on disk (or a
//! `file://` URL) and an HTTPS endpoint.

use crate::component::{validate_name, ComponentMetadata, ComponentType, DependencyList};
use crate::config::{expand_path, RegistrySource};
use crate::registry_http::HttpRegistryClient;
use crate::version::parse_version;
use crate::{Error, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::time::Duration;

/// File name of the manifest at the root of every registry
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub components: Vec<ManifestComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestComponent {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub versions: Vec<ManifestVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestVersion {
    pub version: String,
    /// Content URI, absolute or relative to the registry root
    pub content: String,
    /// Published SHA-256 of the raw content document
    pub checksum: String,
    #[serde(default, skip_serializing_if = "DependencyList::is_empty")]
    pub dependencies: DependencyList,
    /// Yanked versions are never selected
    #[serde(default)]
    pub yanked: bool,
}

impl RegistryManifest {
    /// Reject manifests whose entries cannot be resolved safely
    pub fn validate(&self, registry: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidManifest {
            registry: registry.to_string(),
            reason,
        };

        for component in &self.components {
            validate_name(&component.name).map_err(|e| invalid(e.to_string()))?;
            for version in &component.versions {
                parse_version(&version.version).map_err(|_| {
                    invalid(format!(
                        "{} '{}' lists invalid version '{}'",
                        component.component_type, component.name, version.version
                    ))
                })?;
                if version.content.trim().is_empty() {
                    return Err(invalid(format!(
                        "{} '{}'@{} has no content URI",
                        component.component_type, component.name, version.version
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn find(&self, component_type: ComponentType, name: &str) -> Option<&ManifestComponent> {
        self.components
            .iter()
            .find(|c| c.component_type == component_type && c.name == name)
    }
}

impl ManifestComponent {
    /// Selectable (non-yanked) versions, ascending
    pub fn available_versions(&self) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .versions
            .iter()
            .filter(|v| !v.yanked)
            .filter_map(|v| parse_version(&v.version).ok())
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }

    pub fn version(&self, version: &Version) -> Option<&ManifestVersion> {
        self.versions
            .iter()
            .find(|v| parse_version(&v.version).map(|p| &p == version).unwrap_or(false))
    }
}

/// The content document a manifest version points at
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentBundle {
    /// metadata.json for the version; generated from the manifest when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ComponentMetadata>,
    /// Relative path -> file content
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl ContentBundle {
    pub fn from_slice(bytes: &[u8], subject: &str) -> Result<Self> {
        let bundle: ContentBundle = serde_json::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("Malformed content for {}: {}", subject, e)))?;
        for path in bundle.files.keys() {
            if !is_safe_relative(path) {
                return Err(Error::Validation(format!(
                    "Content for {} contains unsafe path '{}'",
                    subject, path
                )));
            }
        }
        Ok(bundle)
    }
}

/// Relative path that stays inside the directory it is joined to
pub fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, PathComponent::Normal(_) | PathComponent::CurDir))
}

pub enum RegistryClient {
    File(FileRegistryClient),
    Http(HttpRegistryClient),
}

pub struct FileRegistryClient {
    name: String,
    registry_path: PathBuf,
}

impl FileRegistryClient {
    pub fn new<P: AsRef<Path>>(name: &str, registry_path: P) -> Self {
        Self {
            name: name.to_string(),
            registry_path: registry_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.registry_path
    }

    pub fn fetch_manifest(&self) -> Result<RegistryManifest> {
        let path = self.registry_path.join(MANIFEST_FILE);
        let content = fs::read(&path).map_err(|e| {
            Error::Network(format!(
                "Registry '{}' unavailable: cannot read {}: {}",
                self.name,
                path.display(),
                e
            ))
        })?;

        let manifest: RegistryManifest =
            serde_json::from_slice(&content).map_err(|e| Error::InvalidManifest {
                registry: self.name.clone(),
                reason: e.to_string(),
            })?;
        manifest.validate(&self.name)?;
        Ok(manifest)
    }

    pub fn fetch_content(&self, uri: &str) -> Result<Vec<u8>> {
        let path = if uri.starts_with("file://") {
            file_url_to_path(uri)?
        } else {
            if !is_safe_relative(uri) {
                return Err(Error::InvalidManifest {
                    registry: self.name.clone(),
                    reason: format!("content URI '{}' escapes the registry root", uri),
                });
            }
            self.registry_path.join(uri)
        };

        fs::read(&path).map_err(|e| {
            Error::Network(format!(
                "Registry '{}' content {} unavailable: {}",
                self.name,
                path.display(),
                e
            ))
        })
    }
}

impl RegistryClient {
    /// Build the client for a configured registry from its URL scheme
    pub fn from_source(source: &RegistrySource, timeout: Duration) -> Result<Self> {
        let url = source.url.trim();
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(RegistryClient::Http(HttpRegistryClient::new(
                &source.name,
                url,
                timeout,
            )?));
        }

        let path = if url.starts_with("file://") {
            file_url_to_path(url)?
        } else {
            expand_path(url)
        };
        Ok(RegistryClient::File(FileRegistryClient::new(&source.name, path)))
    }

    pub fn name(&self) -> &str {
        match self {
            RegistryClient::File(client) => &client.name,
            RegistryClient::Http(client) => client.name(),
        }
    }

    pub fn fetch_manifest(&self) -> Result<RegistryManifest> {
        tracing::debug!("Fetching manifest from registry '{}'", self.name());
        match self {
            RegistryClient::File(client) => client.fetch_manifest(),
            RegistryClient::Http(client) => client.fetch_manifest(),
        }
    }

    pub fn fetch_content(&self, uri: &str) -> Result<Vec<u8>> {
        tracing::debug!("Fetching '{}' from registry '{}'", uri, self.name());
        match self {
            RegistryClient::File(client) => client.fetch_content(uri),
            RegistryClient::Http(client) => client.fetch_content(uri),
        }
    }
}

fn file_url_to_path(raw: &str) -> Result<PathBuf> {
    let url = url::Url::parse(raw).map_err(|e| Error::Config(format!("Invalid URL '{}': {}", raw, e)))?;
    url.to_file_path()
        .map_err(|_| Error::Config(format!("URL '{}' is not a local file path", raw)))
}
