//! Component model shared by every engine
//!
//! A component is a named, typed, versioned artifact. On disk every component
//! version lives in its own directory holding a `metadata.json` envelope plus
//! arbitrary content files:
//!
//! ```text
//! <tier root>/
//! ├── agents/
//! │   └── base-agent/
//! │       ├── 1.0.0/
//! │       │   ├── metadata.json
//! │       │   └── agent.md
//! │       └── 1.1.0/
//! └── tools/
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the metadata envelope inside every component directory
pub const METADATA_FILE: &str = "metadata.json";

/// Closed set of component kinds managed by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Agent,
    Tool,
    Workflow,
    Template,
    Hook,
    Command,
    Plugin,
}

impl ComponentType {
    pub const ALL: [ComponentType; 7] = [
        ComponentType::Agent,
        ComponentType::Tool,
        ComponentType::Workflow,
        ComponentType::Template,
        ComponentType::Hook,
        ComponentType::Command,
        ComponentType::Plugin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Agent => "agent",
            ComponentType::Tool => "tool",
            ComponentType::Workflow => "workflow",
            ComponentType::Template => "template",
            ComponentType::Hook => "hook",
            ComponentType::Command => "command",
            ComponentType::Plugin => "plugin",
        }
    }

    /// Directory name used for this type inside a tier and as lockfile section
    pub fn plural(&self) -> &'static str {
        match self {
            ComponentType::Agent => "agents",
            ComponentType::Tool => "tools",
            ComponentType::Workflow => "workflows",
            ComponentType::Template => "templates",
            ComponentType::Hook => "hooks",
            ComponentType::Command => "commands",
            ComponentType::Plugin => "plugins",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        ComponentType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower || t.plural() == lower)
            .ok_or_else(|| Error::Validation(format!("Unknown component type '{}'", s)))
    }
}

/// Where a component was resolved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Local,
    Global,
    Remote,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Local => "local",
            SourceTier::Global => "global",
            SourceTier::Remote => "remote",
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SourceTier::Local),
            "global" => Ok(SourceTier::Global),
            "remote" => Ok(SourceTier::Remote),
            other => Err(Error::Validation(format!("Unknown source tier '{}'", other))),
        }
    }
}

/// A request for a component: name, type and version constraint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(rename = "version", default = "default_constraint")]
    pub constraint: String,
}

fn default_constraint() -> String {
    "*".to_string()
}

impl ComponentRef {
    pub fn new(name: impl Into<String>, component_type: ComponentType, constraint: &str) -> Self {
        Self {
            name: name.into(),
            component_type,
            constraint: constraint.to_string(),
        }
    }

    /// Parse `name` or `name@constraint`
    ///
    /// ```
    /// use forgepm::{ComponentRef, ComponentType};
    ///
    /// let r = ComponentRef::parse("code-analyzer@^1.2", ComponentType::Agent).unwrap();
    /// assert_eq!(r.name, "code-analyzer");
    /// assert_eq!(r.constraint, "^1.2");
    /// ```
    pub fn parse(reference: &str, component_type: ComponentType) -> Result<Self> {
        let (name, constraint) = match reference.split_once('@') {
            Some((name, constraint)) => (name.trim(), constraint.trim()),
            None => (reference.trim(), "*"),
        };
        validate_name(name)?;
        let constraint = if constraint.is_empty() { "*" } else { constraint };
        Ok(Self::new(name, component_type, constraint))
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'@{}", self.component_type, self.name, self.constraint)
    }
}

/// Reject names that cannot safely become a directory name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Component name must not be empty".to_string()));
    }
    if name.starts_with('.') || name.contains("..") {
        return Err(Error::Validation(format!(
            "Component name '{}' must not start with '.' or contain '..'",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::Validation(format!(
            "Component name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

/// Declared dependency as written in metadata.json
///
/// The type defaults to the dependent's own type when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub component_type: Option<ComponentType>,
    #[serde(default = "default_constraint")]
    pub version: String,
}

/// metadata.json accepts either a list of dependency objects or a
/// `{ name: constraint }` map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyList {
    List(Vec<DependencySpec>),
    Map(BTreeMap<String, String>),
}

impl Default for DependencyList {
    fn default() -> Self {
        DependencyList::List(Vec::new())
    }
}

impl DependencyList {
    pub fn is_empty(&self) -> bool {
        match self {
            DependencyList::List(list) => list.is_empty(),
            DependencyList::Map(map) => map.is_empty(),
        }
    }

    pub fn to_refs(&self, default_type: ComponentType) -> Vec<ComponentRef> {
        match self {
            DependencyList::List(list) => list
                .iter()
                .map(|d| {
                    ComponentRef::new(
                        d.name.clone(),
                        d.component_type.unwrap_or(default_type),
                        &d.version,
                    )
                })
                .collect(),
            DependencyList::Map(map) => map
                .iter()
                .map(|(name, constraint)| ComponentRef::new(name.clone(), default_type, constraint))
                .collect(),
        }
    }

    pub fn from_refs(refs: &[ComponentRef]) -> Self {
        DependencyList::List(
            refs.iter()
                .map(|r| DependencySpec {
                    name: r.name.clone(),
                    component_type: Some(r.component_type),
                    version: r.constraint.clone(),
                })
                .collect(),
        )
    }
}

/// Remote provenance of an installed component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub registry: String,
    pub component: String,
    pub version: String,
    /// Published checksum of the content this copy was materialised from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Digest of the materialised tree as written, checked before reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

/// Fork provenance stamped onto a forked component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkInfo {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_registry: Option<String>,
    pub from_name: String,
    pub from_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
}

/// The metadata.json envelope: common fields plus a free-form, type-specific
/// payload kept in `extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    pub name: String,
    pub version: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub component_type: Option<ComponentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "DependencyList::is_empty")]
    pub dependencies: DependencyList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork: Option<ForkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ComponentMetadata {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    /// Load and validate `metadata.json` from a component directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let content = fs::read_to_string(&path)?;
        let metadata: ComponentMetadata = serde_json::from_str(&content).map_err(|e| {
            Error::Validation(format!("Malformed {}: {}", path.display(), e))
        })?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Write `metadata.json` into a component directory
    pub fn save(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(METADATA_FILE), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        crate::version::parse_version(&self.version).map_err(|_| {
            Error::Validation(format!(
                "Component '{}' has invalid version '{}'",
                self.name, self.version
            ))
        })?;
        Ok(())
    }

    /// Most recent modification timestamp recorded in the envelope
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        [
            self.updated_at,
            self.fork.as_ref().and_then(|f| f.merged_at),
            self.installed_at,
            self.fork.as_ref().map(|f| f.created_at),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

/// A resolved component version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub version: semver::Version,
    pub source_tier: SourceTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_name: Option<String>,
    pub content_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<ComponentRef>,
    pub metadata: ComponentMetadata,
}

impl Component {
    /// Build a component from a directory containing metadata.json
    pub fn from_dir(
        dir: &Path,
        component_type: ComponentType,
        tier: SourceTier,
        registry_name: Option<String>,
    ) -> Result<Self> {
        let metadata = ComponentMetadata::load(dir)?;
        let version = crate::version::parse_version(&metadata.version)?;
        let depends_on = metadata.dependencies.to_refs(component_type);
        Ok(Self {
            name: metadata.name.clone(),
            component_type,
            version,
            source_tier: tier,
            registry_name,
            content_path: dir.to_path_buf(),
            checksum: None,
            depends_on,
            metadata,
        })
    }

    /// `type:name` identity used for cycle tracking and lockfile keys
    pub fn key(&self) -> String {
        format!("{}:{}", self.component_type, self.name)
    }
}
