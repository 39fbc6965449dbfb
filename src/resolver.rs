//! Multi-tier component resolution
//!
//! Resolution tries the project-local tier, then the user-global tier, then
//! the remote registries, and returns the first tier's best match. A tier that
//! has nothing matching is not an error; only when every tier came up empty
//! does resolution fail with [`Error::ComponentNotFound`]. Any other failure
//! (malformed metadata, integrity mismatch, bad constraint) aborts at once.
//!
//! # Examples
//!
//! ```no_run
//! use forgepm::{ComponentRef, ComponentStore, ComponentType, ResolutionCoordinator, SourceTier};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = ResolutionCoordinator::new(
//!     ComponentStore::new("./.forge", SourceTier::Local),
//!     ComponentStore::new("/home/me/.forge", SourceTier::Global),
//!     None,
//! );
//!
//! let component = coordinator.resolve(&ComponentRef::new("base-agent", ComponentType::Agent, "^1.0"))?;
//! println!("{} {} from {}", component.name, component.version, component.source_tier);
//! # Ok(())
//! # }
//! ```

use crate::component::{Component, ComponentRef, ComponentType, SourceTier};
use crate::remote::RemoteTier;
use crate::store::ComponentStore;
use crate::version::VersionConstraint;
use crate::{Error, Result};
use semver::Version;
use serde::Serialize;
use std::collections::HashSet;

/// One resolution source
pub trait TierResolver: Send + Sync {
    fn tier(&self) -> SourceTier;

    /// Human-readable label used in "not found" reports
    fn label(&self) -> String {
        self.tier().to_string()
    }

    /// Best match in this tier, `None` when the tier has nothing satisfying
    fn resolve(&self, reference: &ComponentRef) -> Result<Option<Component>>;

    fn list(&self, type_filter: Option<ComponentType>) -> Result<Vec<ComponentSummary>>;
}

/// Listing row: the latest version a tier offers for a component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub version: Version,
    pub tier: SourceTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TierResolver for ComponentStore {
    fn tier(&self) -> SourceTier {
        ComponentStore::tier(self)
    }

    fn label(&self) -> String {
        format!("{} ({})", ComponentStore::tier(self), self.root().display())
    }

    fn resolve(&self, reference: &ComponentRef) -> Result<Option<Component>> {
        ComponentStore::resolve(self, reference)
    }

    fn list(&self, type_filter: Option<ComponentType>) -> Result<Vec<ComponentSummary>> {
        Ok(ComponentStore::list(self, type_filter)?
            .into_iter()
            .map(|c| ComponentSummary {
                name: c.name,
                component_type: c.component_type,
                version: c.version,
                tier: c.source_tier,
                registry: c.registry_name,
                description: c.metadata.description,
            })
            .collect())
    }
}

impl TierResolver for RemoteTier {
    fn tier(&self) -> SourceTier {
        SourceTier::Remote
    }

    fn label(&self) -> String {
        let names = self.registry_names();
        if names.is_empty() {
            "remote (no registries)".to_string()
        } else {
            format!("remote ({})", names.join(", "))
        }
    }

    fn resolve(&self, reference: &ComponentRef) -> Result<Option<Component>> {
        RemoteTier::resolve(self, reference)
    }

    /// Best effort: unreachable registries are skipped
    fn list(&self, type_filter: Option<ComponentType>) -> Result<Vec<ComponentSummary>> {
        let any = VersionConstraint::any();
        let mut summaries = Vec::new();
        for (registry, manifest) in self.manifests() {
            for component in &manifest.components {
                if type_filter.is_some_and(|t| t != component.component_type) {
                    continue;
                }
                let versions = component.available_versions();
                if let Some(latest) = any.select_best(&versions) {
                    summaries.push(ComponentSummary {
                        name: component.name.clone(),
                        component_type: component.component_type,
                        version: latest.clone(),
                        tier: SourceTier::Remote,
                        registry: Some(registry.clone()),
                        description: component.description.clone(),
                    });
                }
            }
        }
        Ok(summaries)
    }
}

pub struct ResolutionCoordinator {
    local: ComponentStore,
    global: ComponentStore,
    remote: Option<RemoteTier>,
}

impl ResolutionCoordinator {
    pub fn new(local: ComponentStore, global: ComponentStore, remote: Option<RemoteTier>) -> Self {
        Self { local, global, remote }
    }

    pub fn local(&self) -> &ComponentStore {
        &self.local
    }

    pub fn global(&self) -> &ComponentStore {
        &self.global
    }

    pub fn remote(&self) -> Option<&RemoteTier> {
        self.remote.as_ref()
    }

    /// Tiers in resolution order
    pub fn tiers(&self) -> Vec<&dyn TierResolver> {
        let mut tiers: Vec<&dyn TierResolver> = vec![&self.local, &self.global];
        if let Some(remote) = &self.remote {
            tiers.push(remote);
        }
        tiers
    }

    /// Resolve through local, global and remote tiers in that order
    pub fn resolve(&self, reference: &ComponentRef) -> Result<Component> {
        // Surface a bad constraint before touching any tier
        VersionConstraint::parse(&reference.constraint)?;

        let mut searched = Vec::new();
        for tier in self.tiers() {
            match tier.resolve(reference)? {
                Some(component) => {
                    tracing::debug!(
                        "Resolved {} '{}'@{} from {}",
                        component.component_type,
                        component.name,
                        component.version,
                        tier.label()
                    );
                    return Ok(component);
                }
                None => {
                    tracing::trace!("{} not in {}", reference, tier.label());
                    searched.push(tier.label());
                }
            }
        }

        Err(Error::ComponentNotFound {
            name: reference.name.clone(),
            component_type: reference.component_type,
            constraint: reference.constraint.clone(),
            searched,
        })
    }

    /// Resolve from a single tier only
    pub fn resolve_in(&self, tier: SourceTier, reference: &ComponentRef) -> Result<Option<Component>> {
        match tier {
            SourceTier::Local => self.local.resolve(reference),
            SourceTier::Global => self.global.resolve(reference),
            SourceTier::Remote => match &self.remote {
                Some(remote) => remote.resolve(reference),
                None => Ok(None),
            },
        }
    }

    /// Does any tier have some version of this component?
    pub fn exists(&self, component_type: ComponentType, name: &str) -> Result<bool> {
        match self.resolve(&ComponentRef::new(name, component_type, "*")) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Components visible across tiers. A name available in several tiers is
    /// reported once, from the tier that would win resolution.
    pub fn list(&self, type_filter: Option<ComponentType>, tier_filter: Option<SourceTier>) -> Result<Vec<ComponentSummary>> {
        let mut seen = HashSet::new();
        let mut summaries = Vec::new();

        for tier in self.tiers() {
            if tier_filter.is_some_and(|t| t != tier.tier()) {
                continue;
            }
            for summary in tier.list(type_filter)? {
                if seen.insert((summary.component_type, summary.name.clone())) {
                    summaries.push(summary);
                }
            }
        }

        summaries.sort_by(|a, b| {
            a.component_type
                .cmp(&b.component_type)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentMetadata;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn install(root: &Path, component_type: ComponentType, name: &str, version: &str) {
        let dir = root.join(component_type.plural()).join(name).join(version);
        fs::create_dir_all(&dir).unwrap();
        ComponentMetadata::new(name, version).save(&dir).unwrap();
    }

    fn coordinator(local: &Path, global: &Path) -> ResolutionCoordinator {
        ResolutionCoordinator::new(
            ComponentStore::new(local, SourceTier::Local),
            ComponentStore::new(global, SourceTier::Global),
            None,
        )
    }

    #[test]
    fn test_local_wins_over_global() {
        let local = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        install(local.path(), ComponentType::Agent, "base-agent", "1.0.0");
        install(global.path(), ComponentType::Agent, "base-agent", "1.5.0");

        let resolved = coordinator(local.path(), global.path())
            .resolve(&ComponentRef::new("base-agent", ComponentType::Agent, "^1.0.0"))
            .unwrap();
        assert_eq!(resolved.source_tier, SourceTier::Local);
        assert_eq!(resolved.version, Version::new(1, 0, 0));
    }

    #[test]
    fn test_falls_back_when_local_has_no_match() {
        let local = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        install(local.path(), ComponentType::Agent, "base-agent", "1.0.0");
        install(global.path(), ComponentType::Agent, "base-agent", "2.1.0");

        let resolved = coordinator(local.path(), global.path())
            .resolve(&ComponentRef::new("base-agent", ComponentType::Agent, ">=2.0.0"))
            .unwrap();
        assert_eq!(resolved.source_tier, SourceTier::Global);
    }

    #[test]
    fn test_not_found_lists_searched_tiers() {
        let local = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();

        let err = coordinator(local.path(), global.path())
            .resolve(&ComponentRef::new("ghost", ComponentType::Tool, "*"))
            .unwrap_err();
        match err {
            Error::ComponentNotFound { searched, .. } => assert_eq!(searched.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_constraint_is_not_swallowed() {
        let local = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        let err = coordinator(local.path(), global.path())
            .resolve(&ComponentRef::new("x", ComponentType::Tool, ">>>nope"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConstraint { .. }));
    }

    #[test]
    fn test_exists_and_list() {
        let local = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        install(local.path(), ComponentType::Agent, "a", "1.0.0");
        install(global.path(), ComponentType::Agent, "a", "3.0.0");
        install(global.path(), ComponentType::Tool, "t", "0.1.0");
        let coordinator = coordinator(local.path(), global.path());

        assert!(coordinator.exists(ComponentType::Tool, "t").unwrap());
        assert!(!coordinator.exists(ComponentType::Agent, "t").unwrap());

        let all = coordinator.list(None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");
        assert_eq!(all[0].tier, SourceTier::Local);

        let global_only = coordinator.list(None, Some(SourceTier::Global)).unwrap();
        assert_eq!(global_only.len(), 2);
        assert_eq!(global_only[0].version, Version::new(3, 0, 0));
    }
}
