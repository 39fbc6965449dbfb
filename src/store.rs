//! Filesystem component stores
//!
//! A store is a directory tree laid out as
//! `<root>/<plural type>/<name>/<version>/metadata.json`. The local and global
//! tiers are stores, and so is the directory where fetched remote content is
//! materialised (one store per registry).

use crate::component::{validate_name, Component, ComponentRef, ComponentType, SourceTier, METADATA_FILE};
use crate::integrity::content_files;
use crate::version::VersionConstraint;
use crate::Result;
use semver::Version;
use std::fs;
use std::path::{Path, PathBuf};

/// Write a file by renaming a fully written sibling over it
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, std::process::id()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Copy the content files of `src` into `dst`, skipping transient directories.
/// Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst)?;
    let files = content_files(src)?;
    for (relative, path) in &files {
        let target = dst.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &target)?;
    }
    Ok(files.len())
}

#[derive(Debug, Clone)]
pub struct ComponentStore {
    root: PathBuf,
    tier: SourceTier,
    registry_name: Option<String>,
}

impl ComponentStore {
    pub fn new<P: AsRef<Path>>(root: P, tier: SourceTier) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            tier,
            registry_name: None,
        }
    }

    /// Store of materialised content fetched from `registry`
    pub fn for_registry<P: AsRef<Path>>(root: P, registry: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            tier: SourceTier::Remote,
            registry_name: Some(registry.to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tier(&self) -> SourceTier {
        self.tier
    }

    pub fn registry_name(&self) -> Option<&str> {
        self.registry_name.as_deref()
    }

    /// Directory holding all versions of a component
    pub fn component_root(&self, component_type: ComponentType, name: &str) -> PathBuf {
        self.root.join(component_type.plural()).join(name)
    }

    /// Directory of one component version
    pub fn version_dir(&self, component_type: ComponentType, name: &str, version: &Version) -> PathBuf {
        self.component_root(component_type, name).join(version.to_string())
    }

    /// Installed versions of a component, ascending
    ///
    /// Directories whose name is not a version, or that lack metadata.json,
    /// are ignored.
    pub fn versions(&self, component_type: ComponentType, name: &str) -> Result<Vec<Version>> {
        if validate_name(name).is_err() {
            return Ok(Vec::new());
        }

        let dir = self.component_root(component_type, name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join(METADATA_FILE).is_file() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            // Directory names must be canonical so version_dir() maps back to them
            match Version::parse(&dir_name) {
                Ok(version) => versions.push(version),
                Err(_) => tracing::debug!("Skipping non-version directory {}", entry.path().display()),
            }
        }

        versions.sort();
        Ok(versions)
    }

    /// Load a specific installed version
    pub fn load(&self, component_type: ComponentType, name: &str, version: &Version) -> Result<Option<Component>> {
        if validate_name(name).is_err() {
            return Ok(None);
        }
        let dir = self.version_dir(component_type, name, version);
        if !dir.join(METADATA_FILE).is_file() {
            return Ok(None);
        }
        let mut component = Component::from_dir(&dir, component_type, self.tier, self.registry_name.clone())?;
        // The directory name is authoritative for the version
        component.version = version.clone();
        Ok(Some(component))
    }

    /// Best installed version satisfying the reference's constraint
    pub fn resolve(&self, reference: &ComponentRef) -> Result<Option<Component>> {
        let constraint = VersionConstraint::parse(&reference.constraint)?;
        let versions = self.versions(reference.component_type, &reference.name)?;

        match constraint.select_best(&versions) {
            Some(version) => self.load(reference.component_type, &reference.name, version),
            None => Ok(None),
        }
    }

    pub fn exists(&self, component_type: ComponentType, name: &str) -> Result<bool> {
        Ok(!self.versions(component_type, name)?.is_empty())
    }

    /// Component names of one type, sorted
    pub fn names(&self, component_type: ComponentType) -> Result<Vec<String>> {
        let dir = self.root.join(component_type.plural());
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if validate_name(&name).is_ok() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Latest version of every component, optionally restricted to one type
    pub fn list(&self, type_filter: Option<ComponentType>) -> Result<Vec<Component>> {
        let types: Vec<ComponentType> = match type_filter {
            Some(t) => vec![t],
            None => ComponentType::ALL.to_vec(),
        };

        let mut components = Vec::new();
        for component_type in types {
            for name in self.names(component_type)? {
                let versions = self.versions(component_type, &name)?;
                if let Some(latest) = VersionConstraint::any().select_best(&versions) {
                    if let Some(component) = self.load(component_type, &name, latest)? {
                        components.push(component);
                    }
                }
            }
        }
        Ok(components)
    }
}
