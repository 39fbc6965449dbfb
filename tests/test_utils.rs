//! Test utilities and helpers for forgepm integration tests.
//!
//! This module provides an isolated workspace (local, global and cache
//! directories), a builder for component fixtures, and a file-backed registry
//! that publishes those fixtures with real checksums.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use forgepm::component::{ComponentMetadata, ComponentType, DependencyList, DependencySpec};
use forgepm::config::RegistrySource;
use forgepm::integrity::sha256_hex;
use forgepm::registry::{ContentBundle, ManifestComponent, ManifestVersion, RegistryManifest, MANIFEST_FILE};
use forgepm::{Config, Forge};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated set of tier directories
pub struct TestWorkspace {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub local: PathBuf,
    pub global: PathBuf,
    pub cache: PathBuf,
}

impl TestWorkspace {
    /// Create a new isolated workspace
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();
        let local = root.join("project/.forge");
        let global = root.join("home/.forge");
        let cache = root.join("home/.forge/cache");

        for dir in [&local, &global, &cache] {
            fs::create_dir_all(dir).expect("Failed to create tier directory");
        }

        Self {
            temp_dir,
            root,
            local,
            global,
            cache,
        }
    }

    pub fn install_local(&self, component: &MockComponent) -> PathBuf {
        component.install_into(&self.local)
    }

    pub fn install_global(&self, component: &MockComponent) -> PathBuf {
        component.install_into(&self.global)
    }

    /// Empty file registry under the workspace
    pub fn registry(&self, name: &str) -> TestRegistry {
        TestRegistry::new(name, self.root.join("registries").join(name))
    }

    /// Configuration pointing every tier into the workspace
    pub fn config(&self, registries: &[(&str, &str, u32)]) -> Config {
        let mut config = Config::default();
        config.paths.local = self.local.to_string_lossy().to_string();
        config.paths.global = self.global.to_string_lossy().to_string();
        config.cache.dir = Some(self.cache.to_string_lossy().to_string());
        config.registries = registries
            .iter()
            .map(|(name, url, priority)| RegistrySource {
                name: name.to_string(),
                url: url.to_string(),
                priority: *priority,
                enabled: true,
            })
            .collect();
        config
    }

    pub fn forge(&self, registries: &[(&str, &str, u32)]) -> Forge {
        Forge::new(self.config(registries)).expect("Failed to build forge")
    }

    /// Forge without any registry
    pub fn offline_forge(&self) -> Forge {
        self.forge(&[])
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.local.join(forgepm::LOCKFILE_NAME)
    }
}

/// Component fixture builder
#[derive(Debug, Clone)]
pub struct MockComponent {
    pub name: String,
    pub component_type: ComponentType,
    pub version: String,
    pub description: Option<String>,
    pub dependencies: Vec<DependencySpec>,
    pub files: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MockComponent {
    pub fn new(component_type: ComponentType, name: &str, version: &str) -> Self {
        let mut files = BTreeMap::new();
        files.insert(
            format!("{}.md", component_type),
            format!("# {}\n\nVersion {}\n", name, version),
        );
        Self {
            name: name.to_string(),
            component_type,
            version: version.to_string(),
            description: None,
            dependencies: Vec::new(),
            files,
            updated_at: None,
        }
    }

    pub fn agent(name: &str, version: &str) -> Self {
        Self::new(ComponentType::Agent, name, version)
    }

    pub fn tool(name: &str, version: &str) -> Self {
        Self::new(ComponentType::Tool, name, version)
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Dependency on a component of the same type
    pub fn depends_on(mut self, name: &str, constraint: &str) -> Self {
        self.dependencies.push(DependencySpec {
            name: name.to_string(),
            component_type: None,
            version: constraint.to_string(),
        });
        self
    }

    pub fn depends_on_typed(mut self, component_type: ComponentType, name: &str, constraint: &str) -> Self {
        self.dependencies.push(DependencySpec {
            name: name.to_string(),
            component_type: Some(component_type),
            version: constraint.to_string(),
        });
        self
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn updated_at(mut self, timestamp: &str) -> Self {
        self.updated_at = Some(
            DateTime::parse_from_rfc3339(timestamp)
                .expect("Invalid RFC 3339 timestamp")
                .with_timezone(&Utc),
        );
        self
    }

    pub fn metadata(&self) -> ComponentMetadata {
        let mut metadata = ComponentMetadata::new(&self.name, &self.version);
        metadata.component_type = Some(self.component_type);
        metadata.description = self.description.clone();
        metadata.dependencies = DependencyList::List(self.dependencies.clone());
        metadata.updated_at = self.updated_at;
        metadata
    }

    /// Write into `<root>/<plural>/<name>/<version>/`
    pub fn install_into(&self, root: &Path) -> PathBuf {
        let dir = root
            .join(self.component_type.plural())
            .join(&self.name)
            .join(&self.version);
        fs::create_dir_all(&dir).expect("Failed to create component directory");
        self.metadata().save(&dir).expect("Failed to write metadata.json");
        for (path, content) in &self.files {
            let file = dir.join(path);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, content).expect("Failed to write component file");
        }
        dir
    }

    /// Content document as a registry would serve it
    pub fn bundle_bytes(&self) -> Vec<u8> {
        let bundle = ContentBundle {
            metadata: Some(self.metadata()),
            files: self.files.clone(),
        };
        serde_json::to_vec_pretty(&bundle).expect("Failed to serialize bundle")
    }

    /// Relative content URI used when publishing
    pub fn content_uri(&self) -> String {
        format!(
            "{}/{}/{}.json",
            self.component_type.plural(),
            self.name,
            self.version
        )
    }
}

/// File-backed registry with a manifest.json kept in sync on every publish
pub struct TestRegistry {
    pub name: String,
    pub root: PathBuf,
    manifest: RegistryManifest,
}

impl TestRegistry {
    pub fn new(name: &str, root: PathBuf) -> Self {
        fs::create_dir_all(&root).expect("Failed to create registry directory");
        let registry = Self {
            name: name.to_string(),
            root,
            manifest: RegistryManifest {
                name: Some(name.to_string()),
                components: Vec::new(),
            },
        };
        registry.write_manifest();
        registry
    }

    /// Value to use as the registry URL in configuration
    pub fn url(&self) -> String {
        self.root.to_string_lossy().to_string()
    }

    /// Publish with the correct checksum
    pub fn publish(&mut self, component: &MockComponent) -> &mut Self {
        let checksum = format!("sha256:{}", sha256_hex(&component.bundle_bytes()));
        self.publish_with_checksum(component, &checksum)
    }

    /// Publish with an arbitrary published checksum
    pub fn publish_with_checksum(&mut self, component: &MockComponent, checksum: &str) -> &mut Self {
        let bytes = component.bundle_bytes();
        let uri = component.content_uri();
        let path = self.root.join(&uri);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, &bytes).expect("Failed to write content");

        let version = ManifestVersion {
            version: component.version.clone(),
            content: uri,
            checksum: checksum.to_string(),
            dependencies: DependencyList::List(component.dependencies.clone()),
            yanked: false,
        };

        match self
            .manifest
            .components
            .iter_mut()
            .find(|c| c.name == component.name && c.component_type == component.component_type)
        {
            Some(existing) => {
                existing.versions.retain(|v| v.version != component.version);
                existing.versions.push(version);
            }
            None => self.manifest.components.push(ManifestComponent {
                name: component.name.clone(),
                component_type: component.component_type,
                description: component.description.clone(),
                versions: vec![version],
            }),
        }
        self.write_manifest();
        self
    }

    pub fn manifest_json(&self) -> String {
        serde_json::to_string_pretty(&self.manifest).expect("Failed to serialize manifest")
    }

    fn write_manifest(&self) {
        fs::write(self.root.join(MANIFEST_FILE), self.manifest_json()).expect("Failed to write manifest");
    }
}

/// Assert that a result is an error with the given stable code
pub fn assert_error_code<T: std::fmt::Debug>(result: forgepm::Result<T>, code: &str) {
    match result {
        Ok(value) => panic!("Expected {} error, got Ok({:?})", code, value),
        Err(e) => assert_eq!(e.code(), code, "unexpected error: {}", e),
    }
}
