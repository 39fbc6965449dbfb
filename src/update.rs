//! Update checks, lockfile updates and rollback
//!
//! Unlike resolution, which stops at the first registry that can satisfy a
//! constraint, update checks look at every enabled registry and report the
//! highest version published anywhere.

use crate::component::{Component, ComponentType, SourceTier};
use crate::graph::{DependencyGraphBuilder, DEFAULT_MAX_DEPTH};
use crate::integrity::compute_integrity;
use crate::lockfile::{dependency_key, lock_entry, LockEntry, Lockfile};
use crate::resolver::ResolutionCoordinator;
use crate::version::{parse_version, UpdateType, VersionConstraint};
use crate::{Error, Result};
use semver::Version;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateInfo {
    pub name: String,
    pub component_type: ComponentType,
    pub current: Version,
    /// Highest version found, `current` when nothing newer exists
    pub latest: Version,
    /// Registry publishing `latest`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    pub has_update: bool,
    pub update_type: UpdateType,
}

/// How far `update` may move a pinned version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    #[default]
    Latest,
    /// Stay within the current major version
    Minor,
    /// Stay within the current minor version
    Patch,
}

impl UpdateStrategy {
    /// Range of versions this strategy may pick from, `None` when unbounded
    fn bound(&self, current: &Version) -> Option<String> {
        match self {
            UpdateStrategy::Latest => None,
            UpdateStrategy::Minor => Some(format!(">={}, <{}.0.0", current, current.major + 1)),
            UpdateStrategy::Patch => Some(format!(
                ">={}, <{}.{}.0",
                current,
                current.major,
                current.minor + 1
            )),
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateStrategy::Latest => "latest",
            UpdateStrategy::Minor => "minor",
            UpdateStrategy::Patch => "patch",
        })
    }
}

impl FromStr for UpdateStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(UpdateStrategy::Latest),
            "minor" => Ok(UpdateStrategy::Minor),
            "patch" => Ok(UpdateStrategy::Patch),
            other => Err(Error::Validation(format!(
                "Unknown update strategy '{}' (expected latest, minor or patch)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Component names to update (`name` or `type:name`); all locked entries when empty
    pub packages: Vec<String>,
    pub strategy: UpdateStrategy,
    /// Leave major updates alone
    pub skip_breaking: bool,
    /// Also move entries locked from the local tier (usually forks) to registry releases
    pub include_local: bool,
    pub dry_run: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            strategy: UpdateStrategy::Latest,
            skip_breaking: true,
            include_local: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpToDate,
    Breaking,
    /// A locked dependent's declared constraint excludes the newer version
    Constrained,
    /// Locked from the local tier
    Local,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::UpToDate => "already at the newest allowed version",
            SkipReason::Breaking => "major update skipped",
            SkipReason::Constrained => "newer version excluded by a dependent",
            SkipReason::Local => "local component left as is",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedUpdate {
    pub name: String,
    pub component_type: ComponentType,
    pub from: Version,
    pub to: Version,
    pub update_type: UpdateType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedUpdate {
    pub name: String,
    pub component_type: ComponentType,
    pub current: Version,
    pub latest: Version,
    pub reason: SkipReason,
    /// Dependents whose constraints rule out `latest`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub constrained_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUpdate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_type: Option<ComponentType>,
    pub code: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateReport {
    pub updated: Vec<AppliedUpdate>,
    pub skipped: Vec<SkippedUpdate>,
    pub failed: Vec<FailedUpdate>,
    pub dry_run: bool,
}

pub struct UpdateEngine<'a> {
    coordinator: &'a ResolutionCoordinator,
    lockfile_path: PathBuf,
    max_depth: usize,
}

impl<'a> UpdateEngine<'a> {
    pub fn new<P: AsRef<Path>>(coordinator: &'a ResolutionCoordinator, lockfile_path: P) -> Self {
        Self {
            coordinator,
            lockfile_path: lockfile_path.as_ref().to_path_buf(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Compare `current` against the highest version any registry publishes
    /// (restricted to `constraint` when given)
    pub fn check_update(
        &self,
        name: &str,
        current: &Version,
        component_type: ComponentType,
        constraint: Option<&str>,
    ) -> Result<UpdateInfo> {
        let constraint = match constraint {
            Some(c) => VersionConstraint::parse(c)?,
            None => VersionConstraint::any(),
        };

        let mut best: Option<(Version, String)> = None;
        if let Some(remote) = self.coordinator.remote() {
            // Registries come back in priority order; a tie keeps the earlier one
            for offered in remote.versions(component_type, name)? {
                let Some(candidate) = constraint.select_best(&offered.versions) else {
                    continue;
                };
                let newer = best
                    .as_ref()
                    .map(|(v, _)| candidate.cmp_precedence(v).is_gt())
                    .unwrap_or(true);
                if newer {
                    best = Some((candidate.clone(), offered.registry.clone()));
                }
            }
        }

        let (latest, registry) = match best {
            Some((version, registry)) if version.cmp_precedence(current).is_gt() => (version, Some(registry)),
            _ => (current.clone(), None),
        };
        let update_type = UpdateType::classify(current, &latest);

        tracing::debug!(
            "Update check for {} '{}': {} -> {} ({})",
            component_type,
            name,
            current,
            latest,
            update_type
        );

        Ok(UpdateInfo {
            name: name.to_string(),
            component_type,
            current: current.clone(),
            latest,
            registry,
            has_update: update_type != UpdateType::None,
            update_type,
        })
    }

    /// Move locked components to newer registry versions and rewrite their
    /// lockfile entries. Per-package failures are collected, not raised.
    pub fn update(&self, options: &UpdateOptions) -> Result<UpdateReport> {
        let mut lockfile = Lockfile::load_from(&self.lockfile_path)?.ok_or_else(|| {
            Error::LockfileInvalid(format!("No lockfile at {}", self.lockfile_path.display()))
        })?;

        let mut report = UpdateReport {
            dry_run: options.dry_run,
            ..UpdateReport::default()
        };

        let targets = self.targets(&lockfile, &options.packages, &mut report);
        let mut changed = false;

        for (component_type, name, entry) in targets {
            match self.update_one(&mut lockfile, component_type, &name, &entry, options) {
                Ok(Outcome::Updated(applied)) => {
                    changed = true;
                    report.updated.push(applied);
                }
                Ok(Outcome::Skipped(skipped)) => report.skipped.push(skipped),
                Err(e) => {
                    tracing::warn!("Failed to update {} '{}': {}", component_type, name, e);
                    report.failed.push(FailedUpdate {
                        name,
                        component_type: Some(component_type),
                        code: e.code(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if changed && !options.dry_run {
            lockfile.generated = chrono::Utc::now();
            lockfile.save_to(&self.lockfile_path)?;
        }

        tracing::info!(
            "Update finished: {} updated, {} skipped, {} failed{}",
            report.updated.len(),
            report.skipped.len(),
            report.failed.len(),
            if options.dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }

    /// Locked entries selected by `packages`; unknown names are recorded as failures
    fn targets(
        &self,
        lockfile: &Lockfile,
        packages: &[String],
        report: &mut UpdateReport,
    ) -> Vec<(ComponentType, String, LockEntry)> {
        let all: Vec<(ComponentType, String, LockEntry)> = lockfile
            .entries()
            .into_iter()
            .map(|(t, n, e)| (t, n.to_string(), e.clone()))
            .collect();
        if packages.is_empty() {
            return all;
        }

        let mut selected = Vec::new();
        for package in packages {
            let (wanted_type, wanted_name) = match package.split_once(':') {
                Some((t, n)) => match t.parse::<ComponentType>() {
                    Ok(t) => (Some(t), n),
                    Err(e) => {
                        report.failed.push(FailedUpdate {
                            name: package.clone(),
                            component_type: None,
                            code: e.code(),
                            error: e.to_string(),
                        });
                        continue;
                    }
                },
                None => (None, package.as_str()),
            };

            let before = selected.len();
            for (t, n, e) in &all {
                if n == wanted_name && wanted_type.map_or(true, |w| w == *t) {
                    selected.push((*t, n.clone(), e.clone()));
                }
            }
            if selected.len() == before {
                report.failed.push(FailedUpdate {
                    name: package.clone(),
                    component_type: wanted_type,
                    code: "NOT_LOCKED",
                    error: format!("'{}' is not in the lockfile", package),
                });
            }
        }
        selected
    }

    fn update_one(
        &self,
        lockfile: &mut Lockfile,
        component_type: ComponentType,
        name: &str,
        entry: &LockEntry,
        options: &UpdateOptions,
    ) -> Result<Outcome> {
        let current = parse_version(&entry.version)?;
        let skipped = |latest: &Version, reason: SkipReason, constrained_by: Vec<String>| -> Result<Outcome> {
            Ok(Outcome::Skipped(SkippedUpdate {
                name: name.to_string(),
                component_type,
                current: current.clone(),
                latest: latest.clone(),
                reason,
                constrained_by,
            }))
        };

        if entry.resolved == SourceTier::Local && !options.include_local {
            tracing::debug!("Leaving local {} '{}'@{} alone", component_type, name, current);
            return skipped(&current, SkipReason::Local, Vec::new());
        }

        let bound = options.strategy.bound(&current);
        let info = self.check_update(name, &current, component_type, bound.as_deref())?;

        if !info.has_update {
            return skipped(&info.latest, SkipReason::UpToDate, Vec::new());
        }
        if info.update_type == UpdateType::Major && options.skip_breaking {
            tracing::info!(
                "Skipping major update of {} '{}' {} -> {}",
                component_type,
                name,
                current,
                info.latest
            );
            return skipped(&info.latest, SkipReason::Breaking, Vec::new());
        }

        let blockers = self.unsatisfied_dependents(lockfile, component_type, name, &info.latest, &[])?;
        if !blockers.is_empty() {
            tracing::info!(
                "Skipping {} '{}' {} -> {}: required by {}",
                component_type,
                name,
                current,
                info.latest,
                blockers.join(", ")
            );
            return skipped(&info.latest, SkipReason::Constrained, blockers);
        }

        if !options.dry_run {
            let component = self.fetch_latest(component_type, name, &info)?;
            let tree = DependencyGraphBuilder::new(self.coordinator)
                .with_max_depth(self.max_depth)
                .build_from(component, &format!("={}", info.latest))?;

            let mut pins: Vec<(ComponentType, String, LockEntry)> = Vec::new();
            for node in tree.nodes() {
                let node_type = node.component.component_type;
                if pins.iter().any(|(t, n, _)| *t == node_type && *n == node.component.name) {
                    continue;
                }
                pins.push((node_type, node.component.name.clone(), lock_entry(node)?));
            }

            // Shared dependencies the new tree moves must still suit everything else pinning them
            let replaced: Vec<(ComponentType, &str)> = pins.iter().map(|(t, n, _)| (*t, n.as_str())).collect();
            for (node_type, node_name, pin) in &pins {
                let unchanged = lockfile
                    .get(*node_type, node_name)
                    .is_some_and(|locked| locked.version == pin.version);
                if unchanged {
                    continue;
                }
                let version = parse_version(&pin.version)?;
                let blockers = self.unsatisfied_dependents(lockfile, *node_type, node_name, &version, &replaced)?;
                if !blockers.is_empty() {
                    return Err(Error::Validation(format!(
                        "Updating {} '{}' to {} moves {} '{}' to {}, which {} do not allow",
                        component_type,
                        name,
                        info.latest,
                        node_type,
                        node_name,
                        version,
                        blockers.join(", ")
                    )));
                }
            }

            for (node_type, node_name, pin) in pins {
                let version = pin.version.clone();
                lockfile.upsert(node_type, &node_name, pin);
                lockfile.repin_dependents(node_type, &node_name, &version);
            }
            tracing::info!("Updated {} '{}' {} -> {}", component_type, name, current, info.latest);
        }

        Ok(Outcome::Updated(AppliedUpdate {
            name: name.to_string(),
            component_type,
            from: current,
            to: info.latest,
            update_type: info.update_type,
        }))
    }

    /// Locked entries that pin `name` and whose declared constraint rejects
    /// `version`, described for reporting. Entries in `exclude` are about to
    /// be replaced and are not consulted.
    fn unsatisfied_dependents(
        &self,
        lockfile: &Lockfile,
        component_type: ComponentType,
        name: &str,
        version: &Version,
        exclude: &[(ComponentType, &str)],
    ) -> Result<Vec<String>> {
        let mut blockers = Vec::new();
        for (owner_type, owner_name, owner) in lockfile.entries() {
            if exclude.iter().any(|(t, n)| *t == owner_type && *n == owner_name) {
                continue;
            }
            if !owner.dependencies.contains_key(&dependency_key(owner_type, component_type, name)) {
                continue;
            }

            let owner_version = parse_version(&owner.version)?;
            let declared = self
                .installed(owner_type, owner_name, &owner_version)?
                .ok_or_else(|| Error::MissingComponent {
                    name: owner_name.to_string(),
                    component_type: owner_type,
                    version: owner.version.clone(),
                    reason: format!("needed to check its constraint on {} '{}'", component_type, name),
                })?;
            for dependency in declared
                .depends_on
                .iter()
                .filter(|d| d.component_type == component_type && d.name == name)
            {
                if !VersionConstraint::parse(&dependency.constraint)?.satisfies(version) {
                    blockers.push(format!(
                        "{} '{}'@{} ({})",
                        owner_type, owner_name, owner.version, dependency.constraint
                    ));
                }
            }
        }
        Ok(blockers)
    }

    fn fetch_latest(&self, component_type: ComponentType, name: &str, info: &UpdateInfo) -> Result<Component> {
        let not_found = || Error::ComponentNotFound {
            name: name.to_string(),
            component_type,
            constraint: format!("={}", info.latest),
            searched: info.registry.iter().cloned().collect(),
        };
        let (Some(remote), Some(registry)) = (self.coordinator.remote(), info.registry.as_deref()) else {
            return Err(not_found());
        };
        remote
            .fetch_from(registry, component_type, name, &info.latest)?
            .ok_or_else(not_found)
    }

    /// Re-pin a component to a version that is already available offline:
    /// in the local or global tier, or materialised from a registry earlier.
    pub fn rollback(&self, component_type: ComponentType, name: &str, version: &Version) -> Result<LockEntry> {
        let component = self
            .installed(component_type, name, version)?
            .ok_or_else(|| Error::VersionNotInstalled {
                name: name.to_string(),
                version: version.to_string(),
            })?;

        let mut lockfile = Lockfile::load_from(&self.lockfile_path)?.unwrap_or_default();

        // Keep existing pins of declared dependencies that still satisfy
        let mut dependencies = BTreeMap::new();
        for dependency in &component.depends_on {
            let constraint = VersionConstraint::parse(&dependency.constraint)?;
            match lockfile.get(dependency.component_type, &dependency.name) {
                Some(pinned) if parse_version(&pinned.version).is_ok_and(|v| constraint.satisfies(&v)) => {
                    dependencies.insert(
                        dependency_key(component_type, dependency.component_type, &dependency.name),
                        pinned.version.clone(),
                    );
                }
                _ => tracing::warn!(
                    "Rolled back {} '{}' needs {} which the lockfile does not satisfy",
                    component_type,
                    name,
                    dependency
                ),
            }
        }

        let entry = LockEntry {
            version: version.to_string(),
            resolved: component.source_tier,
            registry: component.registry_name.clone(),
            integrity: compute_integrity(&component.content_path)?,
            dependencies,
        };
        let blockers = self.unsatisfied_dependents(&lockfile, component_type, name, version, &[])?;
        if !blockers.is_empty() {
            tracing::warn!(
                "Rolled back {} '{}'@{} is outside the constraints of {}",
                component_type,
                name,
                version,
                blockers.join(", ")
            );
        }
        lockfile.upsert(component_type, name, entry.clone());
        lockfile.repin_dependents(component_type, name, &entry.version);
        lockfile.generated = chrono::Utc::now();
        lockfile.save_to(&self.lockfile_path)?;

        tracing::info!(
            "Rolled back {} '{}' to {} from {}",
            component_type,
            name,
            version,
            component.source_tier
        );
        Ok(entry)
    }

    fn installed(&self, component_type: ComponentType, name: &str, version: &Version) -> Result<Option<Component>> {
        if let Some(component) = self.coordinator.local().load(component_type, name, version)? {
            return Ok(Some(component));
        }
        if let Some(component) = self.coordinator.global().load(component_type, name, version)? {
            return Ok(Some(component));
        }
        if let Some(remote) = self.coordinator.remote() {
            for store in remote.stores() {
                if let Some(component) = store.load(component_type, name, version)? {
                    return Ok(Some(component));
                }
            }
        }
        Ok(None)
    }
}

enum Outcome {
    Updated(AppliedUpdate),
    Skipped(SkippedUpdate),
}
