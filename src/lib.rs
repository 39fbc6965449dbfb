//! forgepm - resolution and distribution engine for AI agent components
//!
//! Agents, tools, workflows, templates, hooks, commands and plugins are
//! versioned components that live in three tiers: the project-local tier, the
//! user-global tier and any number of remote registries. forgepm resolves
//! semver constraints across those tiers, builds dependency trees, pins them
//! in a lockfile with content integrity digests, forks components for local
//! customisation and merges upstream changes back, and checks for updates.
//!
//! The library never prints or exits; every failure is a typed [`Error`] for
//! the CLI or MCP front end to translate.
//!
//! # Examples
//!
//! ```no_run
//! use forgepm::{ComponentRef, ComponentType, Config, Forge};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! forgepm::logging::init(&config.logging)?;
//!
//! let forge = Forge::new(config)?;
//! let root = ComponentRef::parse("base-agent@^1.2", ComponentType::Agent)?;
//!
//! let tree = forge.build_dependency_tree(&root)?;
//! println!("{} components in the closure", tree.flatten().len());
//!
//! let lockfile = forge.generate_lockfile(&[root], false)?;
//! println!("Locked {} entries", lockfile.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`component`] - Component identity, references and metadata.json
//! - [`version`] - Version constraints and update classification
//! - [`store`] - Filesystem tiers
//! - [`registry`] / [`registry_http`] - Remote registry manifests and clients
//! - [`remote`] - Remote tier with priority ordering and fetch de-duplication
//! - [`resolver`] - Multi-tier resolution
//! - [`graph`] - Dependency trees
//! - [`lockfile`] - forge.lock generation and validation
//! - [`fork`] - Forking and upstream merges
//! - [`update`] - Update checks, updates and rollback
//! - [`cache`] - On-disk manifest cache
//! - [`config`] / [`logging`] - User configuration and tracing setup

pub mod cache;
pub mod component;
pub mod config;
pub mod error;
pub mod forge;
pub mod fork;
pub mod graph;
pub mod installer;
pub mod integrity;
pub mod lockfile;
pub mod logging;
pub mod registry;
pub mod registry_http;
pub mod remote;
pub mod resolver;
pub mod store;
pub mod update;
pub mod version;

pub use cache::{CacheStats, InvalidateOptions, ManifestCache};
pub use component::{Component, ComponentMetadata, ComponentRef, ComponentType, SourceTier};
pub use config::Config;
pub use error::{Error, Result};
pub use forge::Forge;
pub use fork::{ForkMergeEngine, ForkOptions, ForkRecord, MergeOptions, MergeResult, MergeStrategy};
pub use graph::{DependencyGraphBuilder, DependencyNode, DependencyTree};
pub use lockfile::{LockEntry, Lockfile, LockfileManager, LOCKFILE_NAME};
pub use registry::RegistryClient;
pub use remote::RemoteTier;
pub use resolver::{ResolutionCoordinator, TierResolver};
pub use store::ComponentStore;
pub use update::{UpdateEngine, UpdateInfo, UpdateOptions, UpdateReport, UpdateStrategy};
pub use version::{UpdateType, VersionConstraint};
