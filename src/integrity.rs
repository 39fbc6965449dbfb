//! Content integrity digests
//!
//! Digests are SHA-256 over a canonical rendering of a component's content so
//! that formatting noise (key order, indentation, line endings) never changes
//! the result. The lockfile format is `sha256-<hex>`; registry manifests may
//! publish `sha256:<hex>`, `sha256-<hex>` or a bare hex digest.

use crate::component::METADATA_FILE;
use crate::{Error, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Directory names never treated as component content
pub const TRANSIENT_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".cache",
    ".venv",
    "target",
    ".pytest_cache",
];

/// metadata.json keys that record when a copy was made, not what it contains
const VOLATILE_METADATA_KEYS: &[&str] = &["installed_at", "updated_at"];

/// Is this path component a transient directory (or hidden scratch file)?
pub fn is_transient(name: &str) -> bool {
    TRANSIENT_DIRS.contains(&name) || name == ".DS_Store"
}

/// Canonical JSON: object keys sorted, no insignificant whitespace
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&obj[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Lowercase hex SHA-256 of raw bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Format a hex digest the way the lockfile stores it
pub fn format_integrity(hex_digest: &str) -> String {
    format!("sha256-{}", hex_digest.to_ascii_lowercase())
}

/// Strip any `sha256:` / `sha256-` prefix and lowercase the hex digest
pub fn normalize_digest(digest: &str) -> String {
    let trimmed = digest.trim();
    let hex_part = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("sha256-"))
        .unwrap_or(trimmed);
    hex_part.to_ascii_lowercase()
}

/// Compare two digests regardless of prefix style or case
pub fn digests_match(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_digest(a), normalize_digest(b));
    !a.is_empty() && a == b
}

/// Verify raw bytes against a published checksum
pub fn verify_bytes(bytes: &[u8], expected: &str, subject: &str) -> Result<()> {
    if normalize_digest(expected).is_empty() {
        return Err(Error::Integrity {
            subject: subject.to_string(),
            expected: "<empty checksum>".to_string(),
            actual: format_integrity(&sha256_hex(bytes)),
        });
    }

    let computed = sha256_hex(bytes);
    if digests_match(&computed, expected) {
        Ok(())
    } else {
        Err(Error::Integrity {
            subject: subject.to_string(),
            expected: expected.to_string(),
            actual: format_integrity(&computed),
        })
    }
}

/// Canonical bytes for one content file
///
/// JSON files are re-serialized canonically (metadata.json additionally drops
/// copy timestamps and `source.integrity`); text files get CRLF normalized to LF; anything else is
/// hashed verbatim.
pub fn canonical_file_bytes(relative_path: &str, bytes: &[u8]) -> Vec<u8> {
    if relative_path.ends_with(".json") {
        if let Ok(mut value) = serde_json::from_slice::<Value>(bytes) {
            if relative_path == METADATA_FILE {
                if let Value::Object(obj) = &mut value {
                    for key in VOLATILE_METADATA_KEYS {
                        obj.remove(*key);
                    }
                    // A materialised copy records its own digest here
                    if let Some(Value::Object(source)) = obj.get_mut("source") {
                        source.remove("integrity");
                    }
                }
            }
            return canonical_json(&value).into_bytes();
        }
    }

    match std::str::from_utf8(bytes) {
        Ok(text) if text.contains("\r\n") => text.replace("\r\n", "\n").into_bytes(),
        _ => bytes.to_vec(),
    }
}

/// `sha256-<hex>` digest over a component directory (or a single file)
///
/// Files are visited in sorted relative-path order; each contributes its
/// forward-slash relative path, a NUL separator, and its canonical bytes.
pub fn compute_integrity(path: &Path) -> Result<String> {
    if path.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = fs::read(path)?;
        return Ok(format_integrity(&sha256_hex(&canonical_file_bytes(&name, &bytes))));
    }

    if !path.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Component content not found: {}", path.display()),
        )));
    }

    let mut hasher = Sha256::new();
    let mut file_count = 0usize;

    for (relative, file_path) in content_files(path)? {
        let bytes = fs::read(&file_path)?;
        hasher.update(relative.as_bytes());
        hasher.update(b"\0");
        hasher.update(canonical_file_bytes(&relative, &bytes));
        hasher.update(b"\0");
        file_count += 1;
    }

    tracing::debug!(
        "Computed integrity for {} over {} file(s)",
        path.display(),
        file_count
    );

    Ok(format_integrity(&hex::encode(hasher.finalize())))
}

/// Sorted `(relative path, absolute path)` pairs of content files under `root`,
/// skipping transient directories
pub fn content_files(root: &Path) -> Result<Vec<(String, std::path::PathBuf)>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_transient(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = entry.map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to walk {}: {}", root.display(), e),
            ))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Validation(format!("Path outside component root: {}", e)))?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        files.push((relative, entry.path().to_path_buf()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 2, "a": {"d": [3, {"z": 1, "y": 2}], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"d":[3,{"y":2,"z":1}]},"b":2}"#
        );
    }

    #[test]
    fn test_normalize_digest_styles() {
        assert_eq!(normalize_digest("sha256:AB12"), "ab12");
        assert_eq!(normalize_digest("sha256-ab12"), "ab12");
        assert_eq!(normalize_digest("AB12"), "ab12");
        assert!(digests_match("sha256:AB12", "sha256-ab12"));
        assert!(!digests_match("", ""));
    }

    #[test]
    fn test_verify_bytes() {
        let bytes = b"Hello, World!";
        let expected = format!("sha256:{}", sha256_hex(bytes));
        assert!(verify_bytes(bytes, &expected, "greeting").is_ok());
        assert!(verify_bytes(bytes, &sha256_hex(bytes).to_uppercase(), "greeting").is_ok());

        let err = verify_bytes(bytes, &"0".repeat(64), "greeting").unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));

        let err = verify_bytes(bytes, "", "greeting").unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[test]
    fn test_integrity_ignores_formatting_noise() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        fs::write(
            a.path().join("metadata.json"),
            r#"{"name":"x","version":"1.0.0","installed_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        fs::write(a.path().join("agent.md"), "line one\nline two\n").unwrap();

        fs::write(
            b.path().join("metadata.json"),
            "{\n  \"version\": \"1.0.0\",\n  \"name\": \"x\"\n}\n",
        )
        .unwrap();
        fs::write(b.path().join("agent.md"), "line one\r\nline two\r\n").unwrap();

        assert_eq!(
            compute_integrity(a.path()).unwrap(),
            compute_integrity(b.path()).unwrap()
        );
    }

    #[test]
    fn test_integrity_detects_content_change_and_skips_transient() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("metadata.json"), r#"{"name":"x","version":"1.0.0"}"#).unwrap();
        fs::write(dir.path().join("tool.py"), "print('a')\n").unwrap();
        let before = compute_integrity(dir.path()).unwrap();
        assert!(before.starts_with("sha256-"));
        assert_eq!(before.len(), "sha256-".len() + 64);

        fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/tool.pyc"), [0u8, 1, 2]).unwrap();
        assert_eq!(compute_integrity(dir.path()).unwrap(), before);

        fs::write(dir.path().join("tool.py"), "print('b')\n").unwrap();
        assert_ne!(compute_integrity(dir.path()).unwrap(), before);
    }

    #[test]
    fn test_recorded_source_integrity_is_not_hashed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("agent.md"), "# x\n").unwrap();
        fs::write(
            dir.path().join("metadata.json"),
            r#"{"name":"x","version":"1.0.0","source":{"registry":"main","component":"x","version":"1.0.0"}}"#,
        )
        .unwrap();
        let digest = compute_integrity(dir.path()).unwrap();

        let stamped = format!(
            r#"{{"name":"x","version":"1.0.0","source":{{"registry":"main","component":"x","version":"1.0.0","integrity":"{}"}}}}"#,
            digest
        );
        fs::write(dir.path().join("metadata.json"), stamped).unwrap();
        assert_eq!(compute_integrity(dir.path()).unwrap(), digest);

        fs::write(
            dir.path().join("metadata.json"),
            r#"{"name":"x","version":"1.0.0","source":{"registry":"other","component":"x","version":"1.0.0"}}"#,
        )
        .unwrap();
        assert_ne!(compute_integrity(dir.path()).unwrap(), digest);
    }

    #[test]
    fn test_integrity_missing_path() {
        let dir = TempDir::new().unwrap();
        assert!(compute_integrity(&dir.path().join("missing")).is_err());
    }
}
