//! Materialise fetched remote content into a component store
//!
//! A version is written into a staging directory next to its final location
//! and then renamed into place. An existing copy is moved aside first and put
//! back if anything fails, so the target is either the old tree or the new
//! one, never a mix.

use crate::component::{ComponentMetadata, ComponentType, SourceInfo};
use crate::integrity::{compute_integrity, digests_match};
use crate::registry::{ContentBundle, ManifestComponent, ManifestVersion};
use crate::store::ComponentStore;
use crate::{Error, Result};
use chrono::Utc;
use semver::Version;
use std::fs;
use std::path::{Path, PathBuf};

/// One fetched and verified remote version, ready to be written
pub struct Materialize<'a> {
    pub registry: &'a str,
    pub component: &'a ManifestComponent,
    pub entry: &'a ManifestVersion,
    pub version: &'a Version,
    pub bundle: &'a ContentBundle,
}

/// Is a materialised copy of this version present, built from content with
/// the published checksum, and unchanged since it was written?
///
/// The tree is rehashed on every call; a copy whose files no longer match the
/// digest recorded at materialisation time is reported stale so the caller
/// refetches it.
pub fn is_current(store: &ComponentStore, component_type: ComponentType, name: &str, version: &Version, checksum: &str) -> bool {
    let dir = store.version_dir(component_type, name, version);
    let Some(source) = ComponentMetadata::load(&dir).ok().and_then(|m| m.source) else {
        return false;
    };
    let published = source
        .checksum
        .as_deref()
        .map(|recorded| digests_match(recorded, checksum))
        .unwrap_or(false);
    let Some(recorded) = source.integrity.filter(|_| published) else {
        return false;
    };

    match compute_integrity(&dir) {
        Ok(actual) if digests_match(&actual, &recorded) => true,
        Ok(actual) => {
            tracing::warn!(
                "Materialised {} '{}'@{} was modified on disk (recorded {}, found {})",
                component_type,
                name,
                version,
                recorded,
                actual
            );
            false
        }
        Err(e) => {
            tracing::warn!("Cannot hash materialised {} '{}'@{}: {}", component_type, name, version, e);
            false
        }
    }
}

/// Write the bundle into `store`, replacing any previous copy of the version
pub fn materialize(store: &ComponentStore, request: &Materialize<'_>) -> Result<PathBuf> {
    let component_type = request.component.component_type;
    let name = &request.component.name;
    let target = store.version_dir(component_type, name, request.version);
    let parent = store.component_root(component_type, name);
    fs::create_dir_all(&parent)?;

    let staging = parent.join(format!(".{}.staging-{}", request.version, std::process::id()));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }

    if let Err(e) = write_bundle(&staging, request) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let mut backup_dir: Option<PathBuf> = None;
    if target.exists() {
        let backup_path = parent.join(format!(".{}.backup-{}", request.version, std::process::id()));
        if backup_path.exists() {
            let _ = fs::remove_dir_all(&backup_path);
        }
        if let Err(e) = fs::rename(&target, &backup_path) {
            let _ = fs::remove_dir_all(&staging);
            return Err(Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to move existing {} aside: {}", target.display(), e),
            )));
        }
        backup_dir = Some(backup_path);
    }

    if let Err(e) = fs::rename(&staging, &target) {
        if let Some(backup) = &backup_dir {
            let _ = fs::rename(backup, &target);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }

    if let Some(backup) = backup_dir {
        let _ = fs::remove_dir_all(backup);
    }

    tracing::info!(
        "Materialised {} '{}'@{} from registry '{}'",
        component_type,
        name,
        request.version,
        request.registry
    );
    Ok(target)
}

fn write_bundle(dir: &Path, request: &Materialize<'_>) -> Result<()> {
    fs::create_dir_all(dir)?;

    for (relative, content) in &request.bundle.files {
        if relative == crate::component::METADATA_FILE {
            continue;
        }
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
    }

    let mut metadata = metadata_for(request);
    metadata.save(dir)?;
    let integrity = compute_integrity(dir)?;
    if let Some(source) = metadata.source.as_mut() {
        source.integrity = Some(integrity);
    }
    metadata.save(dir)
}

/// metadata.json for a materialised copy: the bundle's own metadata (or one
/// built from the manifest) stamped with its remote provenance
fn metadata_for(request: &Materialize<'_>) -> ComponentMetadata {
    let version = request.version.to_string();
    let mut metadata = request
        .bundle
        .metadata
        .clone()
        .unwrap_or_else(|| ComponentMetadata::new(&request.component.name, &version));

    metadata.name = request.component.name.clone();
    metadata.version = version.clone();
    metadata.component_type = Some(request.component.component_type);
    if metadata.description.is_none() {
        metadata.description = request.component.description.clone();
    }
    if metadata.dependencies.is_empty() {
        metadata.dependencies = request.entry.dependencies.clone();
    }
    metadata.fork = None;
    metadata.source = Some(SourceInfo {
        registry: request.registry.to_string(),
        component: request.component.name.clone(),
        version,
        checksum: Some(request.entry.checksum.clone()),
        integrity: None,
    });
    metadata.installed_at = Some(Utc::now());
    metadata
}
