use crate::component::ComponentType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Version parsing error: {0}")]
    SemVer(#[from] semver::Error),

    #[error("Invalid version constraint '{constraint}': {reason}")]
    InvalidConstraint { constraint: String, reason: String },

    #[error("{component_type} '{name}' not found (constraint: {constraint}, searched: {})", searched.join(", "))]
    ComponentNotFound {
        name: String,
        component_type: ComponentType,
        constraint: String,
        searched: Vec<String>,
    },

    #[error("Dependency '{dependency}' of '{parent}' could not be resolved: {reason}")]
    DependencyNotFound {
        parent: String,
        dependency: String,
        reason: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid registry manifest from '{registry}': {reason}")]
    InvalidManifest { registry: String, reason: String },

    #[error("Invalid lockfile: {0}")]
    LockfileInvalid(String),

    #[error("Integrity check failed for {subject}\nExpected: {expected}\nComputed: {actual}")]
    Integrity {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Integrity mismatch for {component_type} '{name}'@{version}: locked {expected}, found {actual}")]
    IntegrityMismatch {
        name: String,
        component_type: ComponentType,
        version: String,
        expected: String,
        actual: String,
    },

    #[error("Locked {component_type} '{name}'@{version} is missing: {reason}")]
    MissingComponent {
        name: String,
        component_type: ComponentType,
        version: String,
        reason: String,
    },

    #[error("Circular dependency detected: {}", path.join(" → "))]
    CircularDependency { path: Vec<String> },

    #[error("Dependency depth exceeded maximum of {max_depth} at: {}", path.join(" → "))]
    DependencyDepthExceeded { max_depth: usize, path: Vec<String> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Merge has {} unresolved conflict(s): {}", paths.len(), paths.join(", "))]
    Conflict { paths: Vec<String> },

    #[error("Version {version} of '{name}' is not installed in any tier or cache")]
    VersionNotInstalled { name: String, version: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable code for callers that translate errors into
    /// exit codes or structured payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) | Error::TomlDe(_) | Error::TomlSer(_) => "SERIALIZATION_ERROR",
            Error::SemVer(_) | Error::InvalidConstraint { .. } => "INVALID_CONSTRAINT",
            Error::ComponentNotFound { .. } => "COMPONENT_NOT_FOUND",
            Error::DependencyNotFound { .. } => "DEPENDENCY_NOT_FOUND",
            Error::Validation(_) | Error::InvalidManifest { .. } => "VALIDATION_ERROR",
            Error::LockfileInvalid(_) => "LOCKFILE_INVALID",
            Error::Integrity { .. } => "INTEGRITY_ERROR",
            Error::IntegrityMismatch { .. } => "INTEGRITY_MISMATCH",
            Error::MissingComponent { .. } => "MISSING_COMPONENT",
            Error::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            Error::DependencyDepthExceeded { .. } => "DEPENDENCY_DEPTH_EXCEEDED",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Conflict { .. } => "MERGE_CONFLICT",
            Error::VersionNotInstalled { .. } => "VERSION_NOT_INSTALLED",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    /// True for the expected "nothing matched" outcome, as opposed to a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ComponentNotFound { .. }
                | Error::DependencyNotFound { .. }
                | Error::VersionNotInstalled { .. }
        )
    }
}
