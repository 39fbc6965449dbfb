//! Forking components into the local tier and merging upstream changes back
//!
//! A fork is a copy of a component version under a (possibly new) name in the
//! local tier, with a `fork` block in its metadata.json recording where it
//! came from. Later, upstream changes can be compared against the fork with
//! [`ForkMergeEngine::diff`] and pulled in with [`ForkMergeEngine::merge`].
//!
//! Tree mutations go through a staging directory that is renamed into place,
//! so the target is left either untouched or fully rewritten. Two operations
//! on the same target path must not run at the same time.

use crate::component::{validate_name, Component, ComponentMetadata, ComponentType, ForkInfo, SourceTier, METADATA_FILE};
use crate::integrity::{canonical_file_bytes, content_files, sha256_hex};
use crate::store::{copy_tree, ComponentStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// metadata.json fields that describe a copy rather than the component
pub const PROVENANCE_FIELDS: &[&str] = &["fork", "source", "installed_at", "updated_at"];

/// Fields a customization may not override
const PROTECTED_FIELDS: &[&str] = &["name", "version", "fork", "source"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkRecord {
    pub original_name: String,
    pub forked_name: String,
    pub component_type: ComponentType,
    pub source_tier: SourceTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_registry: Option<String>,
    pub source_version: String,
    pub forked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ForkOptions {
    /// Name for the fork; defaults to the source name, suffixed on collision
    pub target_name: Option<String>,
    /// Top-level metadata fields to set on the fork
    pub customizations: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// One difference between a base tree and a source tree. File differences
/// carry content hashes as their values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Difference {
    pub path: String,
    pub change_type: ChangeType,
    pub base_value: Option<Value>,
    pub source_value: Option<Value>,
}

/// A difference that a merge cannot settle silently
pub type Conflict = Difference;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub metadata: Vec<Difference>,
    pub files: Vec<Difference>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.files.is_empty()
    }

    pub fn all(&self) -> Vec<Difference> {
        self.metadata.iter().chain(self.files.iter()).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Take upstream only when its metadata timestamp is newer
    Auto,
    /// Keep the local tree unchanged
    Local,
    /// Reset the local tree to upstream
    Upstream,
    /// Report conflicts without changing anything
    Manual,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeStrategy::Auto => "auto",
            MergeStrategy::Local => "local",
            MergeStrategy::Upstream => "upstream",
            MergeStrategy::Manual => "manual",
        })
    }
}

impl FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(MergeStrategy::Auto),
            "local" => Ok(MergeStrategy::Local),
            "upstream" => Ok(MergeStrategy::Upstream),
            "manual" => Ok(MergeStrategy::Manual),
            other => Err(Error::Validation(format!(
                "Unknown merge strategy '{}' (expected auto, local, upstream or manual)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Snapshot the base tree before changing it
    pub backup: bool,
    /// Compute statistics only
    pub dry_run: bool,
}

/// Changes a merge applied (or would apply, in a dry run)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    pub metadata_updated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeResult {
    pub strategy: MergeStrategy,
    /// Whether the base tree was rewritten
    pub applied: bool,
    pub dry_run: bool,
    pub conflicts: Vec<Conflict>,
    pub stats: MergeStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

impl MergeResult {
    /// Fail with [`Error::Conflict`] if the merge left conflicts unresolved
    pub fn ensure_resolved(&self) -> Result<()> {
        if self.applied || self.conflicts.is_empty() {
            return Ok(());
        }
        Err(Error::Conflict {
            paths: self.conflicts.iter().map(|c| c.path.clone()).collect(),
        })
    }
}

pub struct ForkMergeEngine {
    local: ComponentStore,
}

impl ForkMergeEngine {
    pub fn new(local: ComponentStore) -> Self {
        Self { local }
    }

    /// Copy `source` into the local tier as an independent, provenance-tracked
    /// component
    pub fn fork(&self, source: &Component, options: &ForkOptions) -> Result<ForkRecord> {
        let forked_name = match &options.target_name {
            Some(target) => {
                validate_name(target)?;
                if self.local.exists(source.component_type, target)? {
                    return Err(Error::Validation(format!(
                        "{} '{}' already exists in the local tier",
                        source.component_type, target
                    )));
                }
                target.clone()
            }
            None => self.free_name(source.component_type, &source.name)?,
        };

        let target = self.local.version_dir(source.component_type, &forked_name, &source.version);
        let parent = self.local.component_root(source.component_type, &forked_name);
        fs::create_dir_all(&parent)?;
        let staging = parent.join(format!(".{}.fork-staging-{}", source.version, std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        let now = Utc::now();
        let written = copy_tree(&source.content_path, &staging)
            .and_then(|_| self.write_fork_metadata(&staging, source, &forked_name, now, options))
            .and_then(|_| fs::rename(&staging, &target).map_err(Error::from));
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        tracing::info!(
            "Forked {} '{}'@{} to '{}'",
            source.component_type,
            source.name,
            source.version,
            forked_name
        );

        Ok(ForkRecord {
            original_name: source.name.clone(),
            forked_name,
            component_type: source.component_type,
            source_tier: source.source_tier,
            source_registry: fork_registry(source),
            source_version: source.version.to_string(),
            forked_at: now,
            merged_at: None,
            path: target,
        })
    }

    /// `name`, or the first of `name-1`, `name-2`, ... not taken in the local tier
    fn free_name(&self, component_type: ComponentType, name: &str) -> Result<String> {
        if !self.local.exists(component_type, name)? {
            return Ok(name.to_string());
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{}-{}", name, n);
            if !self.local.exists(component_type, &candidate)? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn write_fork_metadata(
        &self,
        dir: &Path,
        source: &Component,
        forked_name: &str,
        now: DateTime<Utc>,
        options: &ForkOptions,
    ) -> Result<()> {
        let mut metadata = source.metadata.clone();
        metadata.name = forked_name.to_string();
        metadata.version = source.version.to_string();
        metadata.component_type = Some(source.component_type);
        metadata.source = None;
        metadata.installed_at = None;
        metadata.updated_at = None;
        metadata.fork = Some(ForkInfo {
            created_at: now,
            from_registry: fork_registry(source),
            from_name: source.name.clone(),
            from_version: source.version.to_string(),
            merged_at: None,
        });

        if !options.customizations.is_empty() {
            let mut value = serde_json::to_value(&metadata)?;
            if let Value::Object(object) = &mut value {
                for (key, custom) in &options.customizations {
                    if PROTECTED_FIELDS.contains(&key.as_str()) {
                        tracing::warn!("Ignoring customization of protected field '{}'", key);
                        continue;
                    }
                    object.insert(key.clone(), custom.clone());
                }
            }
            metadata = serde_json::from_value(value)
                .map_err(|e| Error::Validation(format!("Invalid fork customizations: {}", e)))?;
        }

        metadata.validate()?;
        metadata.save(dir)
    }

    /// Compare a base tree against a source tree
    ///
    /// Metadata is compared key by key (nested objects by dotted path) with
    /// provenance fields and the component name left out; files are compared
    /// by content hash per relative path.
    pub fn diff(&self, base: &Path, source: &Path) -> Result<DiffResult> {
        let base_meta = comparable_metadata(base)?;
        let source_meta = comparable_metadata(source)?;
        let mut metadata = Vec::new();
        diff_values("", &base_meta, &source_meta, &mut metadata);

        let base_files = file_hashes(base)?;
        let source_files = file_hashes(source)?;
        let mut files = Vec::new();
        for (path, base_hash) in &base_files {
            match source_files.get(path) {
                None => files.push(Difference {
                    path: path.clone(),
                    change_type: ChangeType::Removed,
                    base_value: Some(Value::String(base_hash.clone())),
                    source_value: None,
                }),
                Some(source_hash) if source_hash != base_hash => files.push(Difference {
                    path: path.clone(),
                    change_type: ChangeType::Modified,
                    base_value: Some(Value::String(base_hash.clone())),
                    source_value: Some(Value::String(source_hash.clone())),
                }),
                Some(_) => {}
            }
        }
        for (path, source_hash) in &source_files {
            if !base_files.contains_key(path) {
                files.push(Difference {
                    path: path.clone(),
                    change_type: ChangeType::Added,
                    base_value: None,
                    source_value: Some(Value::String(source_hash.clone())),
                });
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(DiffResult { metadata, files })
    }

    pub fn merge(&self, base: &Path, source: &Path, strategy: MergeStrategy, options: MergeOptions) -> Result<MergeResult> {
        let diff = self.diff(base, source)?;
        let mut result = MergeResult {
            strategy,
            applied: false,
            dry_run: options.dry_run,
            conflicts: Vec::new(),
            stats: MergeStats::default(),
            backup_path: None,
        };

        let adopt = match strategy {
            MergeStrategy::Local => {
                tracing::debug!("Local strategy: keeping {}", base.display());
                false
            }
            MergeStrategy::Manual => {
                result.conflicts = detect_conflicts(&diff.all());
                return Ok(result);
            }
            MergeStrategy::Upstream => true,
            MergeStrategy::Auto => {
                let base_time = ComponentMetadata::load(base)?.timestamp();
                let source_time = ComponentMetadata::load(source)?.timestamp();
                let newer = source_time > base_time;
                tracing::debug!(
                    "Auto strategy: base {:?}, source {:?}, {}",
                    base_time,
                    source_time,
                    if newer { "adopting source" } else { "keeping base" }
                );
                newer
            }
        };

        if !adopt || diff.is_empty() {
            return Ok(result);
        }

        result.stats = stats_for(&diff);
        if options.dry_run {
            return Ok(result);
        }

        let backup_path = if options.backup { Some(snapshot(base)?) } else { None };
        if let Err(e) = replace_with_upstream(base, source) {
            if let Some(backup) = &backup_path {
                let _ = fs::remove_dir_all(backup);
            }
            return Err(e);
        }

        tracing::info!(
            "Merged {} into {} (+{} ~{} -{})",
            source.display(),
            base.display(),
            result.stats.files_added,
            result.stats.files_modified,
            result.stats.files_removed
        );
        result.applied = true;
        result.backup_path = backup_path;
        Ok(result)
    }
}

/// A difference is a conflict if both sides changed it, or if it adds or
/// removes something other than provenance
pub fn detect_conflicts(diffs: &[Difference]) -> Vec<Conflict> {
    diffs
        .iter()
        .filter(|d| match d.change_type {
            ChangeType::Modified => true,
            ChangeType::Added | ChangeType::Removed => !is_provenance(&d.path),
        })
        .cloned()
        .collect()
}

fn is_provenance(path: &str) -> bool {
    let top = path.split('.').next().unwrap_or(path);
    PROVENANCE_FIELDS.contains(&top)
}

/// Read the fork record of a forked component directory, if it is one
pub fn fork_record(dir: &Path, component_type: ComponentType) -> Result<Option<ForkRecord>> {
    let metadata = ComponentMetadata::load(dir)?;
    Ok(metadata.fork.map(|fork| ForkRecord {
        original_name: fork.from_name,
        forked_name: metadata.name.clone(),
        component_type,
        source_tier: if fork.from_registry.is_some() {
            SourceTier::Remote
        } else {
            SourceTier::Local
        },
        source_registry: fork.from_registry,
        source_version: fork.from_version,
        forked_at: fork.created_at,
        merged_at: fork.merged_at,
        path: dir.to_path_buf(),
    }))
}

fn fork_registry(source: &Component) -> Option<String> {
    source
        .registry_name
        .clone()
        .or_else(|| source.metadata.source.as_ref().map(|s| s.registry.clone()))
}

fn comparable_metadata(dir: &Path) -> Result<Value> {
    let content = fs::read_to_string(dir.join(METADATA_FILE))?;
    let mut value: Value = serde_json::from_str(&content)
        .map_err(|e| Error::Validation(format!("Malformed metadata in {}: {}", dir.display(), e)))?;
    if let Value::Object(object) = &mut value {
        for field in PROVENANCE_FIELDS {
            object.remove(*field);
        }
        // Forks are renamed by design
        object.remove("name");
    }
    Ok(value)
}

fn diff_values(prefix: &str, base: &Value, source: &Value, out: &mut Vec<Difference>) {
    match (base, source) {
        (Value::Object(b), Value::Object(s)) => {
            let keys: std::collections::BTreeSet<&String> = b.keys().chain(s.keys()).collect();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                match (b.get(key), s.get(key)) {
                    (Some(bv), Some(sv)) => diff_values(&path, bv, sv, out),
                    (Some(bv), None) => out.push(Difference {
                        path,
                        change_type: ChangeType::Removed,
                        base_value: Some(bv.clone()),
                        source_value: None,
                    }),
                    (None, Some(sv)) => out.push(Difference {
                        path,
                        change_type: ChangeType::Added,
                        base_value: None,
                        source_value: Some(sv.clone()),
                    }),
                    (None, None) => {}
                }
            }
        }
        (b, s) if b != s => out.push(Difference {
            path: prefix.to_string(),
            change_type: ChangeType::Modified,
            base_value: Some(b.clone()),
            source_value: Some(s.clone()),
        }),
        _ => {}
    }
}

fn file_hashes(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    for (relative, path) in content_files(dir)? {
        if relative == METADATA_FILE {
            continue;
        }
        let bytes = fs::read(&path)?;
        hashes.insert(relative.clone(), sha256_hex(&canonical_file_bytes(&relative, &bytes)));
    }
    Ok(hashes)
}

fn stats_for(diff: &DiffResult) -> MergeStats {
    let count = |kind: ChangeType| diff.files.iter().filter(|d| d.change_type == kind).count();
    MergeStats {
        files_added: count(ChangeType::Added),
        files_modified: count(ChangeType::Modified),
        files_removed: count(ChangeType::Removed),
        metadata_updated: !diff.metadata.is_empty(),
    }
}

fn sibling(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Validation(format!("{} has no directory name", dir.display())))?;
    let parent = dir
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent directory", dir.display())))?;
    Ok(parent.join(format!("{}{}", name, suffix)))
}

/// Timestamped copy of `base` next to it
fn snapshot(base: &Path) -> Result<PathBuf> {
    let backup = sibling(base, &format!(".backup-{}", Utc::now().format("%Y%m%d%H%M%S%3f")))?;
    if let Err(e) = copy_tree(base, &backup) {
        let _ = fs::remove_dir_all(&backup);
        return Err(e);
    }
    tracing::info!("Backed up {} to {}", base.display(), backup.display());
    Ok(backup)
}

/// Replace the base tree with the source tree. Metadata comes from the
/// source, keeping the base's name, version and fork block (stamped with the
/// merge time and the upstream version now tracked).
fn replace_with_upstream(base: &Path, source: &Path) -> Result<()> {
    let base_meta = ComponentMetadata::load(base)?;
    let source_meta = ComponentMetadata::load(source)?;

    let staging = sibling(base, &format!(".merge-staging-{}", std::process::id()))?;
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }

    let staged = copy_tree(source, &staging).and_then(|_| {
        let mut merged = source_meta.clone();
        merged.name = base_meta.name.clone();
        merged.version = base_meta.version.clone();
        merged.source = None;
        merged.installed_at = None;
        merged.updated_at = None;
        merged.fork = base_meta.fork.clone().map(|mut fork| {
            fork.merged_at = Some(Utc::now());
            fork.from_version = source_meta.version.clone();
            fork
        });
        merged.save(&staging)
    });
    if let Err(e) = staged {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let previous = sibling(base, &format!(".merge-previous-{}", std::process::id()))?;
    if previous.exists() {
        fs::remove_dir_all(&previous)?;
    }
    if let Err(e) = fs::rename(base, &previous) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&staging, base) {
        let _ = fs::rename(&previous, base);
        let _ = fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    let _ = fs::remove_dir_all(&previous);
    Ok(())
}
