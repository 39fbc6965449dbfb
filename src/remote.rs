//! Remote tier
//!
//! Registries are consulted in ascending priority order and the first one
//! whose manifest has a version satisfying the constraint wins; lower
//! priority registries are not consulted after a match. The winning version's
//! content is verified against the published checksum and materialised under
//! `<store root>/<registry>/<plural type>/<name>/<version>/`.
//!
//! Manifests and content go through the [`ManifestCache`] when one is
//! configured. Within one `RemoteTier` every version is fetched at most once
//! and every manifest at most once per TTL: concurrent callers asking for the
//! same key wait for the first caller's result instead of issuing their own
//! request.

use crate::cache::ManifestCache;
use crate::component::{Component, ComponentRef, ComponentType};
use crate::config::RegistrySource;
use crate::installer::{self, Materialize};
use crate::integrity::verify_bytes;
use crate::registry::{ContentBundle, ManifestComponent, RegistryClient, RegistryManifest};
use crate::store::ComponentStore;
use crate::version::VersionConstraint;
use crate::{Error, Result};
use dashmap::DashMap;
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Slot<T> = Arc<Mutex<Option<T>>>;

/// How long a manifest is reused in memory when no cache TTL is known
pub const DEFAULT_MANIFEST_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
struct MemoManifest {
    manifest: Arc<RegistryManifest>,
    fetched_at: Instant,
}

pub struct RemoteRegistry {
    pub source: RegistrySource,
    pub client: RegistryClient,
}

/// Versions one registry offers for a component
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryVersions {
    pub registry: String,
    pub priority: u32,
    pub versions: Vec<Version>,
}

pub struct RemoteTier {
    registries: Vec<RemoteRegistry>,
    cache: Option<Arc<ManifestCache>>,
    store_root: PathBuf,
    manifest_ttl: Duration,
    manifests: DashMap<String, Slot<MemoManifest>>,
    fetched: DashMap<String, Slot<Component>>,
}

impl RemoteTier {
    /// Build clients for every enabled registry in `sources`
    pub fn from_sources(
        sources: &[RegistrySource],
        timeout: Duration,
        cache: Option<Arc<ManifestCache>>,
        store_root: &Path,
    ) -> Result<Self> {
        let mut registries = Vec::new();
        for source in sources.iter().filter(|s| s.enabled) {
            registries.push(RemoteRegistry {
                source: source.clone(),
                client: RegistryClient::from_source(source, timeout)?,
            });
        }
        Ok(Self::new(registries, cache, store_root))
    }

    pub fn new(mut registries: Vec<RemoteRegistry>, cache: Option<Arc<ManifestCache>>, store_root: &Path) -> Self {
        registries.sort_by(|a, b| {
            a.source
                .priority
                .cmp(&b.source.priority)
                .then_with(|| a.source.name.cmp(&b.source.name))
        });
        let manifest_ttl = cache
            .as_ref()
            .map(|c| Duration::from_secs(c.default_ttl()))
            .unwrap_or(DEFAULT_MANIFEST_TTL);
        Self {
            registries,
            cache,
            store_root: store_root.to_path_buf(),
            manifest_ttl,
            manifests: DashMap::new(),
            fetched: DashMap::new(),
        }
    }

    /// Refetch manifests held in memory for longer than `ttl`
    pub fn with_manifest_ttl(mut self, ttl: Duration) -> Self {
        self.manifest_ttl = ttl;
        self
    }

    pub fn registry_names(&self) -> Vec<&str> {
        self.registries.iter().map(|r| r.source.name.as_str()).collect()
    }

    /// Store holding content materialised from `registry`
    pub fn store_for(&self, registry: &str) -> ComponentStore {
        ComponentStore::for_registry(self.store_root.join(registry), registry)
    }

    /// Materialised stores of every configured registry, in priority order
    pub fn stores(&self) -> Vec<ComponentStore> {
        self.registries
            .iter()
            .map(|r| self.store_for(&r.source.name))
            .collect()
    }

    /// Resolve against registries in priority order, stopping at the first match
    ///
    /// Unreachable registries are skipped; if none matched and at least one
    /// was unreachable, the last network error is returned instead of `None`.
    pub fn resolve(&self, reference: &ComponentRef) -> Result<Option<Component>> {
        let constraint = VersionConstraint::parse(&reference.constraint)?;
        let mut network_error = None;

        for registry in &self.registries {
            let manifest = match self.manifest(registry) {
                Ok(manifest) => manifest,
                Err(e @ Error::Network(_)) => {
                    tracing::warn!("Skipping registry '{}': {}", registry.source.name, e);
                    network_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(component) = manifest.find(reference.component_type, &reference.name) else {
                continue;
            };
            let versions = component.available_versions();
            let Some(best) = constraint.select_best(&versions) else {
                tracing::debug!(
                    "Registry '{}' has {} but no version matching {}",
                    registry.source.name,
                    reference.name,
                    constraint
                );
                continue;
            };

            return self.fetch(registry, component, best).map(Some);
        }

        match network_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Every registry's available versions of a component. Unreachable
    /// registries are logged and left out.
    pub fn versions(&self, component_type: ComponentType, name: &str) -> Result<Vec<RegistryVersions>> {
        let mut found = Vec::new();
        for registry in &self.registries {
            let manifest = match self.manifest(registry) {
                Ok(manifest) => manifest,
                Err(e @ Error::Network(_)) => {
                    tracing::warn!("Skipping registry '{}': {}", registry.source.name, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(component) = manifest.find(component_type, name) {
                found.push(RegistryVersions {
                    registry: registry.source.name.clone(),
                    priority: registry.source.priority,
                    versions: component.available_versions(),
                });
            }
        }
        Ok(found)
    }

    /// Fetch an exact version from a named registry
    pub fn fetch_from(
        &self,
        registry_name: &str,
        component_type: ComponentType,
        name: &str,
        version: &Version,
    ) -> Result<Option<Component>> {
        let Some(registry) = self.registries.iter().find(|r| r.source.name == registry_name) else {
            return Ok(None);
        };
        let manifest = self.manifest(registry)?;
        match manifest.find(component_type, name) {
            Some(component) if component.version(version).is_some() => {
                self.fetch(registry, component, version).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Manifests of every reachable registry, in priority order
    pub fn manifests(&self) -> Vec<(String, Arc<RegistryManifest>)> {
        let mut manifests = Vec::new();
        for registry in &self.registries {
            match self.manifest(registry) {
                Ok(manifest) => manifests.push((registry.source.name.clone(), manifest)),
                Err(e) => tracing::warn!("Registry '{}' unavailable for listing: {}", registry.source.name, e),
            }
        }
        manifests
    }

    fn manifest(&self, registry: &RemoteRegistry) -> Result<Arc<RegistryManifest>> {
        let name = &registry.source.name;
        let fresh = |memo: &MemoManifest| memo.fetched_at.elapsed() < self.manifest_ttl;
        let memo = once_while(&self.manifests, name.clone(), fresh, || {
            let key = format!("manifest/{}", name);
            let fetched_at = Instant::now();
            if let Some(cache) = &self.cache {
                if let Some(manifest) = cache.get_json::<RegistryManifest>(&key)? {
                    tracing::debug!("Using cached manifest for registry '{}'", name);
                    return Ok(MemoManifest {
                        manifest: Arc::new(manifest),
                        fetched_at,
                    });
                }
            }

            let manifest = registry.client.fetch_manifest()?;
            if let Some(cache) = &self.cache {
                cache.put_json(&key, &manifest, None)?;
            }
            Ok(MemoManifest {
                manifest: Arc::new(manifest),
                fetched_at,
            })
        })?;
        Ok(memo.manifest)
    }

    fn fetch(&self, registry: &RemoteRegistry, component: &ManifestComponent, version: &Version) -> Result<Component> {
        let registry_name = &registry.source.name;
        let key = format!(
            "{}/{}/{}/{}",
            registry_name, component.component_type, component.name, version
        );

        once(&self.fetched, key, || {
            let entry = component.version(version).ok_or_else(|| Error::InvalidManifest {
                registry: registry_name.clone(),
                reason: format!("{} '{}' has no entry for {}", component.component_type, component.name, version),
            })?;
            let store = self.store_for(registry_name);

            if installer::is_current(&store, component.component_type, &component.name, version, &entry.checksum) {
                tracing::debug!(
                    "Reusing materialised {} '{}'@{} from registry '{}'",
                    component.component_type,
                    component.name,
                    version,
                    registry_name
                );
            } else {
                let subject = format!("{} '{}'@{}", component.component_type, component.name, version);
                let bytes = self.content(registry, component, version, &entry.content, &entry.checksum, &subject)?;
                let bundle = ContentBundle::from_slice(&bytes, &subject)?;
                installer::materialize(
                    &store,
                    &Materialize {
                        registry: registry_name,
                        component,
                        entry,
                        version,
                        bundle: &bundle,
                    },
                )?;
            }

            let mut resolved = store
                .load(component.component_type, &component.name, version)?
                .ok_or_else(|| Error::MissingComponent {
                    name: component.name.clone(),
                    component_type: component.component_type,
                    version: version.to_string(),
                    reason: format!("materialised copy under {} vanished", store.root().display()),
                })?;
            resolved.checksum = Some(entry.checksum.clone());
            Ok(resolved)
        })
    }

    /// Content bytes, cache-first, always verified against the published checksum
    fn content(
        &self,
        registry: &RemoteRegistry,
        component: &ManifestComponent,
        version: &Version,
        uri: &str,
        checksum: &str,
        subject: &str,
    ) -> Result<Vec<u8>> {
        let key = format!(
            "content/{}/{}/{}/{}",
            registry.source.name, component.component_type, component.name, version
        );

        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(&key)? {
                match verify_bytes(&bytes, checksum, subject) {
                    Ok(()) => return Ok(bytes),
                    Err(e) => tracing::warn!("Discarding cached content: {}", e),
                }
            }
        }

        let bytes = registry.client.fetch_content(uri)?;
        verify_bytes(&bytes, checksum, subject)?;
        tracing::debug!("Verified checksum for {}", subject);

        if let Some(cache) = &self.cache {
            cache.put(&key, &bytes, None)?;
        }
        Ok(bytes)
    }
}

/// Compute a value at most once per key; concurrent callers for the same key
/// block until the first finishes. Failures are not remembered.
fn once<T: Clone>(map: &DashMap<String, Slot<T>>, key: String, compute: impl FnOnce() -> Result<T>) -> Result<T> {
    once_while(map, key, |_| true, compute)
}

/// Like [`once`], but a remembered value is recomputed once `fresh` rejects it
fn once_while<T: Clone>(
    map: &DashMap<String, Slot<T>>,
    key: String,
    fresh: impl Fn(&T) -> bool,
    compute: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let slot = map
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(None)))
        .clone();
    let mut guard = slot
        .lock()
        .map_err(|_| Error::Validation("In-flight fetch lock poisoned".to_string()))?;

    if let Some(value) = guard.as_ref().filter(|v| fresh(*v)) {
        return Ok(value.clone());
    }
    let value = compute()?;
    *guard = Some(value.clone());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_once_computes_single_time() {
        let map: DashMap<String, Slot<u32>> = DashMap::new();
        let calls = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let value = once(&map, "k".to_string(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(7)
                    })
                    .unwrap();
                    assert_eq!(value, 7);
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manifest_memo_expires_with_ttl() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry_root = dir.path().join("registry");
        std::fs::create_dir_all(&registry_root).unwrap();
        let publish = |versions: &[&str]| {
            let versions: Vec<serde_json::Value> = versions
                .iter()
                .map(|v| serde_json::json!({"version": v, "content": "x.json", "checksum": "sha256:00"}))
                .collect();
            let manifest = serde_json::json!({"components": [{"name": "x", "type": "agent", "versions": versions}]});
            std::fs::write(registry_root.join("manifest.json"), manifest.to_string()).unwrap();
        };
        let tier = |ttl: Duration| {
            let source = RegistrySource {
                name: "main".to_string(),
                url: registry_root.to_string_lossy().to_string(),
                priority: 1,
                enabled: true,
            };
            RemoteTier::from_sources(&[source], Duration::from_secs(5), None, &dir.path().join("store"))
                .unwrap()
                .with_manifest_ttl(ttl)
        };
        let offered = |tier: &RemoteTier| tier.versions(ComponentType::Agent, "x").unwrap()[0].versions.len();

        publish(&["1.0.0"]);
        let long_lived = tier(Duration::from_secs(3600));
        let expiring = tier(Duration::ZERO);
        assert_eq!(offered(&long_lived), 1);
        assert_eq!(offered(&expiring), 1);

        publish(&["1.0.0", "1.1.0"]);
        assert_eq!(offered(&long_lived), 1);
        assert_eq!(offered(&expiring), 2);
    }

    #[test]
    fn test_once_does_not_remember_errors() {
        let map: DashMap<String, Slot<u32>> = DashMap::new();
        assert!(once(&map, "k".to_string(), || Err(Error::Network("down".to_string()))).is_err());
        assert_eq!(once(&map, "k".to_string(), || Ok(3)).unwrap(), 3);
    }
}
