//! Lockfile generation, validation and persistence
//!
//! `forge.lock` pins every component of the dependency closure to an exact
//! version, records which tier it was resolved from and carries a content
//! digest so drift can be detected later:
//!
//! ```json
//! {
//!   "version": 1,
//!   "generated": "2025-03-01T12:00:00Z",
//!   "agents": {
//!     "base-agent": {
//!       "version": "1.2.0",
//!       "resolved": "remote",
//!       "registry": "fractary",
//!       "integrity": "sha256-4f1c...",
//!       "dependencies": { "tool:web-search": "2.1.0" }
//!     }
//!   },
//!   "tools": { "web-search": { "version": "2.1.0", "resolved": "global", "integrity": "sha256-..." } },
//!   "workflows": {}, "templates": {}, "hooks": {}, "commands": {}, "plugins": {}
//! }
//! ```
//!
//! Dependency keys are the bare name when the dependency has the same type
//! as the entry, otherwise `type:name`.

use crate::component::{Component, ComponentRef, ComponentType, SourceTier};
use crate::graph::{DependencyGraphBuilder, DependencyNode, DEFAULT_MAX_DEPTH};
use crate::integrity::{compute_integrity, digests_match};
use crate::resolver::ResolutionCoordinator;
use crate::store::write_atomic;
use crate::version::{parse_version, VersionConstraint};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// The lockfile filename
pub const LOCKFILE_NAME: &str = "forge.lock";

/// Current lockfile format version
pub const LOCKFILE_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Exact pinned version
    pub version: String,
    /// Tier the version was resolved from
    pub resolved: SourceTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// `sha256-<hex>` over the canonicalised content
    pub integrity: String,
    /// Dependency key -> pinned version
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    pub version: u64,
    pub generated: DateTime<Utc>,
    agents: BTreeMap<String, LockEntry>,
    tools: BTreeMap<String, LockEntry>,
    workflows: BTreeMap<String, LockEntry>,
    templates: BTreeMap<String, LockEntry>,
    hooks: BTreeMap<String, LockEntry>,
    commands: BTreeMap<String, LockEntry>,
    plugins: BTreeMap<String, LockEntry>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockfile {
    pub fn new() -> Self {
        Self {
            version: LOCKFILE_VERSION,
            generated: Utc::now(),
            agents: BTreeMap::new(),
            tools: BTreeMap::new(),
            workflows: BTreeMap::new(),
            templates: BTreeMap::new(),
            hooks: BTreeMap::new(),
            commands: BTreeMap::new(),
            plugins: BTreeMap::new(),
        }
    }

    pub fn section(&self, component_type: ComponentType) -> &BTreeMap<String, LockEntry> {
        match component_type {
            ComponentType::Agent => &self.agents,
            ComponentType::Tool => &self.tools,
            ComponentType::Workflow => &self.workflows,
            ComponentType::Template => &self.templates,
            ComponentType::Hook => &self.hooks,
            ComponentType::Command => &self.commands,
            ComponentType::Plugin => &self.plugins,
        }
    }

    fn section_mut(&mut self, component_type: ComponentType) -> &mut BTreeMap<String, LockEntry> {
        match component_type {
            ComponentType::Agent => &mut self.agents,
            ComponentType::Tool => &mut self.tools,
            ComponentType::Workflow => &mut self.workflows,
            ComponentType::Template => &mut self.templates,
            ComponentType::Hook => &mut self.hooks,
            ComponentType::Command => &mut self.commands,
            ComponentType::Plugin => &mut self.plugins,
        }
    }

    pub fn get(&self, component_type: ComponentType, name: &str) -> Option<&LockEntry> {
        self.section(component_type).get(name)
    }

    /// Add or replace an entry
    pub fn upsert(&mut self, component_type: ComponentType, name: &str, entry: LockEntry) {
        self.section_mut(component_type).insert(name.to_string(), entry);
    }

    pub fn remove(&mut self, component_type: ComponentType, name: &str) -> Option<LockEntry> {
        self.section_mut(component_type).remove(name)
    }

    pub fn len(&self) -> usize {
        ComponentType::ALL.iter().map(|t| self.section(*t).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point every entry that depends on `name` at `version`; returns how many
    /// pins changed
    pub fn repin_dependents(&mut self, component_type: ComponentType, name: &str, version: &str) -> usize {
        let mut changed = 0;
        for owner_type in ComponentType::ALL {
            let key = dependency_key(owner_type, component_type, name);
            for entry in self.section_mut(owner_type).values_mut() {
                if let Some(pin) = entry.dependencies.get_mut(&key) {
                    if pin != version {
                        *pin = version.to_string();
                        changed += 1;
                    }
                }
            }
        }
        changed
    }

    /// All entries, grouped by type then sorted by name
    pub fn entries(&self) -> Vec<(ComponentType, &str, &LockEntry)> {
        ComponentType::ALL
            .iter()
            .flat_map(|t| self.section(*t).iter().map(move |(name, entry)| (*t, name.as_str(), entry)))
            .collect()
    }

    /// Parse lockfile JSON, checking the required shape first
    pub fn parse(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| Error::LockfileInvalid(format!("not valid JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::LockfileInvalid("top level must be an object".to_string()))?;

        let version = object
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::LockfileInvalid("missing numeric 'version'".to_string()))?;
        if version > LOCKFILE_VERSION {
            return Err(Error::LockfileInvalid(format!(
                "unsupported lockfile version {} (newest supported is {})",
                version, LOCKFILE_VERSION
            )));
        }
        if !object.get("generated").is_some_and(Value::is_string) {
            return Err(Error::LockfileInvalid("missing 'generated' timestamp".to_string()));
        }
        for component_type in ComponentType::ALL {
            if !object.get(component_type.plural()).is_some_and(Value::is_object) {
                return Err(Error::LockfileInvalid(format!(
                    "missing '{}' section",
                    component_type.plural()
                )));
            }
        }

        serde_json::from_value(value).map_err(|e| Error::LockfileInvalid(e.to_string()))
    }

    /// Load a lockfile; `Ok(None)` when the file does not exist
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map(Some)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        write_atomic(path.as_ref(), content.as_bytes())
    }
}

/// Key under which `dependency` is recorded in an entry of `owner_type`
pub fn dependency_key(owner_type: ComponentType, dependency_type: ComponentType, name: &str) -> String {
    if owner_type == dependency_type {
        name.to_string()
    } else {
        format!("{}:{}", dependency_type, name)
    }
}

/// Inverse of [`dependency_key`]
pub fn parse_dependency_key(owner_type: ComponentType, key: &str) -> (ComponentType, String) {
    if let Some((prefix, name)) = key.split_once(':') {
        if let Ok(component_type) = prefix.parse::<ComponentType>() {
            return (component_type, name.to_string());
        }
    }
    (owner_type, key.to_string())
}

/// Outcome of [`LockfileManager::validate`]
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Error>,
}

pub struct LockfileManager<'a> {
    coordinator: &'a ResolutionCoordinator,
    path: PathBuf,
    max_depth: usize,
}

impl<'a> LockfileManager<'a> {
    pub fn new<P: AsRef<Path>>(coordinator: &'a ResolutionCoordinator, path: P) -> Self {
        Self {
            coordinator,
            path: path.as_ref().to_path_buf(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Lockfile>> {
        Lockfile::load_from(&self.path)
    }

    pub fn save(&self, lockfile: &Lockfile) -> Result<()> {
        lockfile.save_to(&self.path)?;
        tracing::info!("Wrote {} ({} entries)", self.path.display(), lockfile.len());
        Ok(())
    }

    /// Resolve the declared roots and pin their full dependency closure
    ///
    /// Without `force`, a root already pinned in the existing lockfile keeps
    /// its pin as long as the pin still satisfies the declared constraint.
    /// With `force` every root is resolved afresh.
    pub fn generate(&self, roots: &[ComponentRef], force: bool) -> Result<Lockfile> {
        let existing = if force { None } else { self.load()? };
        let builder = DependencyGraphBuilder::new(self.coordinator).with_max_depth(self.max_depth);
        let mut lockfile = Lockfile::new();

        for root in roots {
            let reference = match existing.as_ref().and_then(|l| l.get(root.component_type, &root.name)) {
                Some(entry) if pin_still_satisfies(entry, &root.constraint)? => {
                    tracing::debug!("Keeping locked {} '{}'@{}", root.component_type, root.name, entry.version);
                    ComponentRef::new(root.name.clone(), root.component_type, &format!("={}", entry.version))
                }
                _ => root.clone(),
            };

            let tree = builder.build_tree(&reference)?;
            for node in tree.nodes() {
                let entry = lock_entry(node)?;
                pin(&mut lockfile, &node.component, entry)?;
            }
        }

        tracing::info!("Locked {} component(s) from {} root(s)", lockfile.len(), roots.len());
        Ok(lockfile)
    }

    /// Check every entry against what is on disk. Never mutates the lockfile
    /// and reports every problem found rather than stopping at the first.
    pub fn validate(&self, lockfile: &Lockfile) -> ValidationReport {
        let mut errors = Vec::new();

        for (component_type, name, entry) in lockfile.entries() {
            if let Err(e) = self.validate_entry(component_type, name, entry) {
                errors.push(e);
            }

            for (key, pinned) in &entry.dependencies {
                let (dep_type, dep_name) = parse_dependency_key(component_type, key);
                match lockfile.get(dep_type, &dep_name) {
                    Some(dep) if dep.version == *pinned => {}
                    Some(dep) => errors.push(Error::LockfileInvalid(format!(
                        "{} '{}' pins {} '{}'@{} but the lockfile has {}",
                        component_type, name, dep_type, dep_name, pinned, dep.version
                    ))),
                    None => errors.push(Error::LockfileInvalid(format!(
                        "{} '{}' depends on {} '{}' which is not locked",
                        component_type, name, dep_type, dep_name
                    ))),
                }
            }
        }

        if !errors.is_empty() {
            tracing::warn!("Lockfile validation found {} problem(s)", errors.len());
        }
        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    fn validate_entry(&self, component_type: ComponentType, name: &str, entry: &LockEntry) -> Result<()> {
        let missing = |reason: String| Error::MissingComponent {
            name: name.to_string(),
            component_type,
            version: entry.version.clone(),
            reason,
        };

        let version = parse_version(&entry.version).map_err(|_| missing("pinned version is not valid semver".to_string()))?;
        let component = self
            .locate(component_type, name, &version, entry)?
            .ok_or_else(|| missing(format!("not present in the {} tier", entry.resolved)))?;

        let actual = compute_integrity(&component.content_path)?;
        if !digests_match(&actual, &entry.integrity) {
            return Err(Error::IntegrityMismatch {
                name: name.to_string(),
                component_type,
                version: entry.version.clone(),
                expected: entry.integrity.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Find the pinned version in the tier it was locked from. Remote pins are
    /// looked up in the materialised copy first and only fetched when absent.
    fn locate(
        &self,
        component_type: ComponentType,
        name: &str,
        version: &semver::Version,
        entry: &LockEntry,
    ) -> Result<Option<Component>> {
        match entry.resolved {
            SourceTier::Local => self.coordinator.local().load(component_type, name, version),
            SourceTier::Global => self.coordinator.global().load(component_type, name, version),
            SourceTier::Remote => {
                let (Some(remote), Some(registry)) = (self.coordinator.remote(), entry.registry.as_deref()) else {
                    return Ok(None);
                };
                match remote.store_for(registry).load(component_type, name, version)? {
                    Some(component) => Ok(Some(component)),
                    None => remote.fetch_from(registry, component_type, name, version),
                }
            }
        }
    }
}

fn pin_still_satisfies(entry: &LockEntry, constraint: &str) -> Result<bool> {
    let constraint = VersionConstraint::parse(constraint)?;
    Ok(parse_version(&entry.version)
        .map(|v| constraint.satisfies(&v))
        .unwrap_or(false))
}

/// Lock entry for one resolved node
pub fn lock_entry(node: &DependencyNode) -> Result<LockEntry> {
    let component = &node.component;
    let dependencies = node
        .children
        .iter()
        .map(|child| {
            (
                dependency_key(component.component_type, child.component.component_type, &child.component.name),
                child.resolved_version.to_string(),
            )
        })
        .collect();

    Ok(LockEntry {
        version: node.resolved_version.to_string(),
        resolved: component.source_tier,
        registry: component.registry_name.clone(),
        integrity: compute_integrity(&component.content_path)?,
        dependencies,
    })
}

/// Insert an entry, refusing two different versions of one component
fn pin(lockfile: &mut Lockfile, component: &Component, entry: LockEntry) -> Result<()> {
    if let Some(existing) = lockfile.get(component.component_type, &component.name) {
        if existing.version != entry.version {
            return Err(Error::Validation(format!(
                "{} '{}' is required at both {} and {}; a lockfile can pin only one version",
                component.component_type, component.name, existing.version, entry.version
            )));
        }
        return Ok(());
    }
    lockfile.upsert(component.component_type, &component.name, entry);
    Ok(())
}
