//! The `Forge` facade
//!
//! Builds the stores, cache, remote tier and resolution coordinator once from
//! a [`Config`] and exposes every engine operation on top of them. CLI and MCP
//! front ends hold one `Forge` per invocation.

use crate::cache::{CacheStats, InvalidateOptions, ManifestCache};
use crate::component::{Component, ComponentRef, ComponentType, SourceTier};
use crate::config::Config;
use crate::fork::{DiffResult, ForkMergeEngine, ForkOptions, ForkRecord, MergeOptions, MergeResult, MergeStrategy};
use crate::graph::{DependencyGraphBuilder, DependencyTree};
use crate::lockfile::{LockEntry, Lockfile, LockfileManager, ValidationReport, LOCKFILE_NAME};
use crate::remote::RemoteTier;
use crate::resolver::{ComponentSummary, ResolutionCoordinator};
use crate::store::ComponentStore;
use crate::update::{UpdateEngine, UpdateInfo, UpdateOptions, UpdateReport};
use crate::Result;
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Directory under the cache dir holding materialised remote components
pub const COMPONENTS_DIR: &str = "components";

pub struct Forge {
    config: Config,
    coordinator: ResolutionCoordinator,
    cache: Option<Arc<ManifestCache>>,
    lockfile_path: PathBuf,
}

impl Forge {
    /// Load configuration from the default location and build everything
    pub fn open() -> Result<Self> {
        Self::new(Config::load()?)
    }

    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let local_root = config.local_root();
        let global_root = config.global_root();
        let cache_dir = config.cache_dir();

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ManifestCache::new(&cache_dir, config.cache.ttl_seconds)));

        let registries = config.enabled_registries();
        let remote = if registries.is_empty() {
            None
        } else {
            Some(RemoteTier::from_sources(
                &registries,
                Duration::from_secs(config.resolver.fetch_timeout_seconds),
                cache.clone(),
                &cache_dir.join(COMPONENTS_DIR),
            )?
            .with_manifest_ttl(Duration::from_secs(config.cache.ttl_seconds)))
        };

        tracing::debug!(
            "Forge tiers: local {}, global {}, {} registr{}",
            local_root.display(),
            global_root.display(),
            registries.len(),
            if registries.len() == 1 { "y" } else { "ies" }
        );

        let coordinator = ResolutionCoordinator::new(
            ComponentStore::new(&local_root, SourceTier::Local),
            ComponentStore::new(&global_root, SourceTier::Global),
            remote,
        );
        let lockfile_path = local_root.join(LOCKFILE_NAME);

        Ok(Self {
            config,
            coordinator,
            cache,
            lockfile_path,
        })
    }

    /// Use a lockfile other than `<local root>/forge.lock`
    pub fn with_lockfile_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.lockfile_path = path.as_ref().to_path_buf();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &ResolutionCoordinator {
        &self.coordinator
    }

    pub fn lockfile_path(&self) -> &Path {
        &self.lockfile_path
    }

    fn max_depth(&self) -> usize {
        self.config.resolver.max_depth
    }

    pub fn resolve(&self, reference: &ComponentRef) -> Result<Component> {
        self.coordinator.resolve(reference)
    }

    pub fn list(&self, type_filter: Option<ComponentType>, tier_filter: Option<SourceTier>) -> Result<Vec<ComponentSummary>> {
        self.coordinator.list(type_filter, tier_filter)
    }

    pub fn exists(&self, component_type: ComponentType, name: &str) -> Result<bool> {
        self.coordinator.exists(component_type, name)
    }

    pub fn build_dependency_tree(&self, root: &ComponentRef) -> Result<DependencyTree> {
        DependencyGraphBuilder::new(&self.coordinator)
            .with_max_depth(self.max_depth())
            .build_tree(root)
    }

    fn lockfiles(&self) -> LockfileManager<'_> {
        LockfileManager::new(&self.coordinator, &self.lockfile_path).with_max_depth(self.max_depth())
    }

    /// Resolve `roots`, pin their closure and write the lockfile
    pub fn generate_lockfile(&self, roots: &[ComponentRef], force: bool) -> Result<Lockfile> {
        let manager = self.lockfiles();
        let lockfile = manager.generate(roots, force)?;
        manager.save(&lockfile)?;
        Ok(lockfile)
    }

    pub fn load_lockfile(&self) -> Result<Option<Lockfile>> {
        self.lockfiles().load()
    }

    /// Validate the lockfile on disk; a missing lockfile is an error
    pub fn validate_lockfile(&self) -> Result<ValidationReport> {
        let manager = self.lockfiles();
        let lockfile = manager.load()?.ok_or_else(|| {
            crate::Error::LockfileInvalid(format!("No lockfile at {}", self.lockfile_path.display()))
        })?;
        Ok(manager.validate(&lockfile))
    }

    fn fork_engine(&self) -> ForkMergeEngine {
        ForkMergeEngine::new(self.coordinator.local().clone())
    }

    /// Resolve `source` through the tiers and fork it into the local tier
    pub fn fork(&self, source: &ComponentRef, options: &ForkOptions) -> Result<ForkRecord> {
        let component = self.coordinator.resolve(source)?;
        self.fork_engine().fork(&component, options)
    }

    pub fn diff(&self, base: &Path, source: &Path) -> Result<DiffResult> {
        self.fork_engine().diff(base, source)
    }

    pub fn merge(&self, base: &Path, source: &Path, strategy: MergeStrategy, options: MergeOptions) -> Result<MergeResult> {
        self.fork_engine().merge(base, source, strategy, options)
    }

    /// Merge the latest upstream version matching `upstream` into a local fork
    pub fn merge_upstream(
        &self,
        fork: &Component,
        upstream: &ComponentRef,
        strategy: MergeStrategy,
        options: MergeOptions,
    ) -> Result<MergeResult> {
        let source = self.coordinator.resolve(upstream)?;
        self.merge(&fork.content_path, &source.content_path, strategy, options)
    }

    fn updates(&self) -> UpdateEngine<'_> {
        UpdateEngine::new(&self.coordinator, &self.lockfile_path).with_max_depth(self.max_depth())
    }

    pub fn check_update(
        &self,
        name: &str,
        current: &Version,
        component_type: ComponentType,
        constraint: Option<&str>,
    ) -> Result<UpdateInfo> {
        self.updates().check_update(name, current, component_type, constraint)
    }

    pub fn update(&self, options: &UpdateOptions) -> Result<UpdateReport> {
        self.updates().update(options)
    }

    pub fn rollback(&self, component_type: ComponentType, name: &str, version: &Version) -> Result<LockEntry> {
        self.updates().rollback(component_type, name, version)
    }

    pub fn cache(&self) -> Option<&ManifestCache> {
        self.cache.as_deref()
    }

    /// Cache statistics; `None` when caching is disabled
    pub fn cache_stats(&self) -> Result<Option<CacheStats>> {
        self.cache.as_ref().map(|c| c.stats()).transpose()
    }

    /// Drop matching cache entries and return their keys
    pub fn invalidate_cache(&self, options: &InvalidateOptions) -> Result<Vec<String>> {
        match &self.cache {
            Some(cache) => cache.invalidate(options),
            None => Ok(Vec::new()),
        }
    }
}
