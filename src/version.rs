//! Semantic version constraints
//!
//! Wraps [`semver`] with the npm-flavoured constraint grammar used in component
//! metadata and registry manifests:
//!
//! - exact: `1.2.3`, `=1.2.3`, `v1.2.3`
//! - caret / tilde: `^1.2.3`, `~1.2`
//! - comparator ranges: `>=1.0.0 <2.0.0`, `>=1.0.0, <2.0.0`, `1.0.0 - 1.4.0`
//! - x-ranges: `1.x`, `1.2.*`, `1`
//! - alternatives: `^1.0.0 || ^2.0.0`
//! - any: empty, `*`, `x`, `latest`
//!
//! Pre-release versions only match when a comparator names a pre-release on
//! the same `major.minor.patch`.
//!
//! # Examples
//!
//! ```
//! use forgepm::version::{parse_version, VersionConstraint};
//!
//! let constraint = VersionConstraint::parse("^1.2.0 || ~2.0").unwrap();
//! let candidates = ["1.1.0", "1.4.2", "2.0.7", "2.1.0"]
//!     .iter()
//!     .map(|v| parse_version(v).unwrap())
//!     .collect::<Vec<_>>();
//!
//! let best = constraint.select_best(&candidates).unwrap();
//! assert_eq!(best.to_string(), "2.0.7");
//! ```

use crate::{Error, Result};
use semver::{Version, VersionReq};
use std::fmt;

/// A parsed version constraint
#[derive(Debug, Clone, PartialEq)]
pub struct VersionConstraint {
    raw: String,
    kind: ConstraintKind,
}

#[derive(Debug, Clone, PartialEq)]
enum ConstraintKind {
    Any,
    /// Satisfied when any alternative matches
    Alternatives(Vec<VersionReq>),
}

impl VersionConstraint {
    /// Constraint matching every stable version
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            kind: ConstraintKind::Any,
        }
    }

    /// Constraint matching exactly one version
    pub fn exact(version: &Version) -> Self {
        let raw = format!("={}", version);
        let req = VersionReq::parse(&raw).unwrap_or(VersionReq::STAR);
        Self {
            raw,
            kind: ConstraintKind::Alternatives(vec![req]),
        }
    }

    /// Parse a constraint string, failing with [`Error::InvalidConstraint`]
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if is_any(trimmed) {
            return Ok(Self {
                raw: if trimmed.is_empty() { "*".to_string() } else { trimmed.to_string() },
                kind: ConstraintKind::Any,
            });
        }

        let mut alternatives = Vec::new();
        for alternative in trimmed.split("||") {
            let alternative = alternative.trim();
            if alternative.is_empty() {
                return Err(invalid(input, "empty alternative around '||'"));
            }
            if is_any(alternative) {
                return Ok(Self {
                    raw: trimmed.to_string(),
                    kind: ConstraintKind::Any,
                });
            }
            let normalized = normalize_range(alternative).map_err(|reason| invalid(input, &reason))?;
            let req = VersionReq::parse(&normalized).map_err(|e| invalid(input, &e.to_string()))?;
            alternatives.push(req);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            kind: ConstraintKind::Alternatives(alternatives),
        })
    }

    pub fn is_any(&self) -> bool {
        matches!(self.kind, ConstraintKind::Any)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Does `version` satisfy this constraint?
    pub fn satisfies(&self, version: &Version) -> bool {
        match &self.kind {
            ConstraintKind::Any => version.pre.is_empty(),
            ConstraintKind::Alternatives(reqs) => reqs.iter().any(|req| req.matches(version)),
        }
    }

    /// Highest candidate satisfying the constraint, by semver precedence
    pub fn select_best<'a, I>(&self, candidates: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates
            .into_iter()
            .filter(|v| self.satisfies(v))
            .max_by(|a, b| a.cmp_precedence(b).then_with(|| a.cmp(b)))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Convenience wrapper: `parse(constraint)?.satisfies(version)`
pub fn satisfies(version: &Version, constraint: &str) -> Result<bool> {
    Ok(VersionConstraint::parse(constraint)?.satisfies(version))
}

/// Convenience wrapper over [`VersionConstraint::select_best`]
pub fn select_best<'a>(candidates: &'a [Version], constraint: &str) -> Result<Option<&'a Version>> {
    Ok(VersionConstraint::parse(constraint)?.select_best(candidates))
}

/// Parse a version string, accepting a leading `v` and `major.minor` shorthand
pub fn parse_version(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

    // Normalize version (1.2 -> 1.2.0, 1 -> 1.0.0) for semver compatibility
    let core_end = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, rest) = trimmed.split_at(core_end);
    let normalized = match core.matches('.').count() {
        0 if !core.is_empty() => format!("{}.0.0{}", core, rest),
        1 => format!("{}.0{}", core, rest),
        _ => trimmed.to_string(),
    };

    Ok(Version::parse(&normalized)?)
}

/// Size of the jump between two versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Major,
    Minor,
    Patch,
    None,
}

impl UpdateType {
    /// Classify the move from `current` to `latest`; `None` when not newer
    pub fn classify(current: &Version, latest: &Version) -> Self {
        if latest.cmp_precedence(current) != std::cmp::Ordering::Greater {
            UpdateType::None
        } else if latest.major != current.major {
            UpdateType::Major
        } else if latest.minor != current.minor {
            UpdateType::Minor
        } else {
            UpdateType::Patch
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateType::Major => "major",
            UpdateType::Minor => "minor",
            UpdateType::Patch => "patch",
            UpdateType::None => "none",
        })
    }
}

fn is_any(s: &str) -> bool {
    matches!(s, "" | "*" | "x" | "X" | "latest")
}

fn invalid(constraint: &str, reason: &str) -> Error {
    Error::InvalidConstraint {
        constraint: constraint.to_string(),
        reason: reason.to_string(),
    }
}

/// Rewrite one npm-style range into the comma-separated form `semver` parses
fn normalize_range(range: &str) -> std::result::Result<String, String> {
    // Hyphen range: "1.0.0 - 2.0.0" is inclusive on both ends
    if let Some((low, high)) = range.split_once(" - ") {
        let low = low.trim().trim_start_matches('v');
        let high = high.trim().trim_start_matches('v');
        if low.is_empty() || high.is_empty() {
            return Err(format!("incomplete hyphen range '{}'", range));
        }
        return Ok(format!(">={}, <={}", low, high));
    }

    // Glue detached operators back onto their version: ">= 1.0.0" -> ">=1.0.0"
    let mut tokens: Vec<String> = Vec::new();
    let mut pending_op: Option<String> = None;
    for token in range.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            if pending_op.is_some() {
                return Err(format!("dangling operator in '{}'", range));
            }
            pending_op = Some(token.to_string());
            continue;
        }
        let token = match pending_op.take() {
            Some(op) => format!("{}{}", op, token),
            None => token.to_string(),
        };
        tokens.push(normalize_comparator(&token));
    }
    if pending_op.is_some() {
        return Err(format!("operator without version in '{}'", range));
    }
    if tokens.is_empty() {
        return Err("empty range".to_string());
    }

    Ok(tokens.join(", "))
}

fn normalize_comparator(token: &str) -> String {
    let op_len = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(op_len);
    let version = version.strip_prefix('v').unwrap_or(version);

    // Only the numeric core may carry x-range wildcards; pre-release tags are literal
    let core_end = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = version.split_at(core_end);
    let core = core
        .split('.')
        .map(|part| if matches!(part, "x" | "X") { "*" } else { part })
        .collect::<Vec<_>>()
        .join(".");
    let version = format!("{}{}", core, suffix);

    // A bare version is an exact pin, a bare partial version an x-range
    if op.is_empty() && !core.contains('*') {
        format!("={}", version)
    } else {
        format!("{}{}", op, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    fn versions(list: &[&str]) -> Vec<Version> {
        list.iter().map(|s| v(s)).collect()
    }

    #[test]
    fn test_exact_and_bare_versions() {
        let c = VersionConstraint::parse("1.2.3").unwrap();
        assert!(c.satisfies(&v("1.2.3")));
        assert!(!c.satisfies(&v("1.2.4")));

        let c = VersionConstraint::parse("=v1.2.3").unwrap();
        assert!(c.satisfies(&v("1.2.3")));
    }

    #[test]
    fn test_caret_and_tilde() {
        let c = VersionConstraint::parse("^1.2.3").unwrap();
        assert!(c.satisfies(&v("1.9.0")));
        assert!(!c.satisfies(&v("2.0.0")));
        assert!(!c.satisfies(&v("1.2.2")));

        let c = VersionConstraint::parse("^0.2.3").unwrap();
        assert!(c.satisfies(&v("0.2.9")));
        assert!(!c.satisfies(&v("0.3.0")));

        let c = VersionConstraint::parse("~1.2.0").unwrap();
        assert!(c.satisfies(&v("1.2.5")));
        assert!(!c.satisfies(&v("1.3.0")));
    }

    #[test]
    fn test_comparator_ranges() {
        for input in [">=1.0.0 <2.0.0", ">=1.0.0, <2.0.0", ">= 1.0.0 < 2.0.0"] {
            let c = VersionConstraint::parse(input).unwrap();
            assert!(c.satisfies(&v("1.5.0")), "{}", input);
            assert!(!c.satisfies(&v("2.0.0")), "{}", input);
            assert!(!c.satisfies(&v("0.9.0")), "{}", input);
        }

        let c = VersionConstraint::parse("1.0.0 - 1.4.0").unwrap();
        assert!(c.satisfies(&v("1.4.0")));
        assert!(!c.satisfies(&v("1.4.1")));
    }

    #[test]
    fn test_x_ranges() {
        let c = VersionConstraint::parse("1.x").unwrap();
        assert!(c.satisfies(&v("1.9.9")));
        assert!(!c.satisfies(&v("2.0.0")));

        let c = VersionConstraint::parse("1.2.*").unwrap();
        assert!(c.satisfies(&v("1.2.7")));
        assert!(!c.satisfies(&v("1.3.0")));

        let c = VersionConstraint::parse("1.2").unwrap();
        assert!(c.satisfies(&v("1.2.7")));
        assert!(!c.satisfies(&v("1.3.0")));
    }

    #[test]
    fn test_or_ranges() {
        let c = VersionConstraint::parse("^1.0.0 || ^3.0.0").unwrap();
        assert!(c.satisfies(&v("1.1.0")));
        assert!(!c.satisfies(&v("2.0.0")));
        assert!(c.satisfies(&v("3.2.0")));
    }

    #[test]
    fn test_any_forms() {
        for input in ["", "*", "latest", "x", "  "] {
            let c = VersionConstraint::parse(input).unwrap();
            assert!(c.is_any(), "{:?}", input);
            assert!(c.satisfies(&v("99.0.0")));
        }
    }

    #[test]
    fn test_invalid_constraints() {
        for input in ["not-a-version", "^1.0.0 ||", ">=", "1.0.0 -", ">>1.0"] {
            let err = VersionConstraint::parse(input).unwrap_err();
            assert!(
                matches!(err, Error::InvalidConstraint { .. }),
                "{:?} gave {:?}",
                input,
                err
            );
        }
    }

    #[test]
    fn test_select_best_highest() {
        let candidates = versions(&["1.0.0", "1.5.0", "1.9.0", "2.0.0"]);
        let best = select_best(&candidates, "^1.0.0").unwrap();
        assert_eq!(best, Some(&v("1.9.0")));

        let best = select_best(&candidates, ">=3.0.0").unwrap();
        assert_eq!(best, None);
    }

    #[test]
    fn test_prerelease_excluded_unless_requested() {
        let candidates = versions(&["1.0.0", "1.1.0-beta.1"]);
        assert_eq!(select_best(&candidates, "*").unwrap(), Some(&v("1.0.0")));
        assert_eq!(select_best(&candidates, "^1.0.0").unwrap(), Some(&v("1.0.0")));
        assert_eq!(
            select_best(&candidates, ">=1.1.0-beta.0").unwrap(),
            Some(&v("1.1.0-beta.1"))
        );
        assert_eq!(
            select_best(&candidates, "1.1.0-beta.1").unwrap(),
            Some(&v("1.1.0-beta.1"))
        );
    }

    #[test]
    fn test_parse_version_normalization() {
        assert_eq!(v("1.2"), Version::new(1, 2, 0));
        assert_eq!(v("v3"), Version::new(3, 0, 0));
        assert_eq!(v("1.2-rc.1").to_string(), "1.2.0-rc.1");
        assert!(parse_version("abc").is_err());
    }

    #[test]
    fn test_update_type_classification() {
        assert_eq!(UpdateType::classify(&v("1.2.0"), &v("2.0.0")), UpdateType::Major);
        assert_eq!(UpdateType::classify(&v("1.2.0"), &v("1.3.0")), UpdateType::Minor);
        assert_eq!(UpdateType::classify(&v("1.2.0"), &v("1.2.1")), UpdateType::Patch);
        assert_eq!(UpdateType::classify(&v("1.2.0"), &v("1.2.0")), UpdateType::None);
        assert_eq!(UpdateType::classify(&v("1.2.0"), &v("1.0.0")), UpdateType::None);
    }
}
