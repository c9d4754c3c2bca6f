//! Warm cache for file-backed grammar and schema artifacts.
//!
//! Entries are keyed by path and stamped with the file's modification time.
//! A lookup re-reads the file only when the stamp no longer matches, so a
//! request that names the same unchanged file costs one stat call and no
//! content read. Entries live for the process lifetime and are never evicted;
//! the set of artifact paths is small and static in practice.

use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

/// Failure loading a file-backed artifact (prompt, grammar, or schema).
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The file is missing or unreadable.
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file exists but is empty after trimming.
    #[error("{} is empty", .path.display())]
    Empty { path: PathBuf },
    /// The file is not valid JSON (schema artifacts only).
    #[error("{} is not valid JSON", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A parsed artifact together with the modification time it was read at.
#[derive(Debug)]
struct CachedArtifact<T> {
    stamp: SystemTime,
    value: T,
}

/// Mtime-keyed cache of grammar texts and parsed JSON Schemas.
///
/// Single-threaded by construction: the server loop owns the cache and no
/// request is processed while another is in flight.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    grammars: HashMap<PathBuf, CachedArtifact<String>>,
    schemas: HashMap<PathBuf, CachedArtifact<Value>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the grammar text at `path`, re-reading only if the file's
    /// modification time has changed since the last lookup.
    pub fn grammar_text(&mut self, path: &Path) -> Result<&str, ArtifactError> {
        refresh(&mut self.grammars, path, read_text_artifact).map(String::as_str)
    }

    /// Return the parsed JSON Schema at `path`, re-reading and re-parsing
    /// only if the file's modification time has changed since the last lookup.
    pub fn schema_object(&mut self, path: &Path) -> Result<&Value, ArtifactError> {
        refresh(&mut self.schemas, path, read_json_artifact)
    }
}

/// Look up one cache entry, reloading it if the file's mtime moved.
fn refresh<'a, T>(
    entries: &'a mut HashMap<PathBuf, CachedArtifact<T>>,
    path: &Path,
    read: fn(&Path) -> Result<T, ArtifactError>,
) -> Result<&'a T, ArtifactError> {
    let stamp = modified_time(path)?;
    let entry = match entries.entry(path.to_path_buf()) {
        Entry::Occupied(entry) if entry.get().stamp == stamp => entry.into_mut(),
        Entry::Occupied(entry) => {
            debug!("artifact changed, reloading {}", path.display());
            let value = read(path)?;
            let slot = entry.into_mut();
            *slot = CachedArtifact { stamp, value };
            slot
        }
        Entry::Vacant(entry) => {
            debug!("caching artifact {}", path.display());
            entry.insert(CachedArtifact {
                stamp,
                value: read(path)?,
            })
        }
    };
    Ok(&entry.value)
}

fn modified_time(path: &Path) -> Result<SystemTime, ArtifactError> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Read a text artifact, rejecting missing and blank files.
///
/// Also used at startup to load the configured default grammar, so startup
/// failures and per-request path-override failures share one error shape.
pub fn read_text_artifact(path: &Path) -> Result<String, ArtifactError> {
    let text = fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Err(ArtifactError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(text)
}

/// Read and parse a JSON Schema artifact, rejecting missing, blank, and
/// syntactically invalid files. Schema semantics are not validated here;
/// that is the endpoint's job.
pub fn read_json_artifact(path: &Path) -> Result<Value, ArtifactError> {
    let text = read_text_artifact(path)?;
    serde_json::from_str(&text).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_grammar_cached_while_mtime_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.ebnf");
        fs::write(&path, r#"root ::= "yes""#).unwrap();
        let stamp = fs::metadata(&path).unwrap().modified().unwrap();

        let mut cache = ArtifactCache::new();
        assert_eq!(cache.grammar_text(&path).unwrap(), r#"root ::= "yes""#);

        // Rewrite the file but restore the stamp; the cached text must win.
        fs::write(&path, r#"root ::= "no""#).unwrap();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(stamp).unwrap();
        assert_eq!(cache.grammar_text(&path).unwrap(), r#"root ::= "yes""#);

        // Move the stamp forward; the new content must be observed.
        file.set_modified(stamp + Duration::from_secs(10)).unwrap();
        assert_eq!(cache.grammar_text(&path).unwrap(), r#"root ::= "no""#);
    }

    #[test]
    fn test_schema_reloaded_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        fs::write(&path, r#"{"type":"object"}"#).unwrap();
        let stamp = fs::metadata(&path).unwrap().modified().unwrap();

        let mut cache = ArtifactCache::new();
        assert_eq!(
            cache.schema_object(&path).unwrap(),
            &json!({"type": "object"})
        );

        fs::write(&path, r#"{"type":"array"}"#).unwrap();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(stamp + Duration::from_secs(5)).unwrap();
        assert_eq!(
            cache.schema_object(&path).unwrap(),
            &json!({"type": "array"})
        );
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.ebnf");
        let mut cache = ArtifactCache::new();
        assert!(matches!(
            cache.grammar_text(&path),
            Err(ArtifactError::Io { .. })
        ));
    }

    #[test]
    fn test_blank_grammar_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.ebnf");
        fs::write(&path, "  \n\t\n").unwrap();
        let mut cache = ArtifactCache::new();
        assert!(matches!(
            cache.grammar_text(&path),
            Err(ArtifactError::Empty { .. })
        ));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        let mut cache = ArtifactCache::new();
        assert!(matches!(
            cache.schema_object(&path),
            Err(ArtifactError::Json { .. })
        ));
    }

    #[test]
    fn test_failed_reload_keeps_error_not_stale_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.ebnf");
        fs::write(&path, r#"root ::= "a""#).unwrap();
        let stamp = fs::metadata(&path).unwrap().modified().unwrap();

        let mut cache = ArtifactCache::new();
        cache.grammar_text(&path).unwrap();

        // Blank the file under a new stamp: the reload must surface Empty.
        fs::write(&path, "   ").unwrap();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(stamp + Duration::from_secs(3)).unwrap();
        assert!(matches!(
            cache.grammar_text(&path),
            Err(ArtifactError::Empty { .. })
        ));
    }
}
