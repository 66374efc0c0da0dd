//! Core data model: object keys, content hashes, and sidecar metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// User-metadata key under which the content hash is stored on every object.
/// The presence of this key is the sole criterion index hydration uses to
/// decide whether an object participates in duplicate detection.
pub const HASH_METADATA_KEY: &str = "x-file-hash";

/// Optional informational metadata fields (not consulted for correctness).
pub mod optional_meta_keys {
    pub const UPLOAD_SOURCE: &str = "x-upload-source";
    pub const CHUNK_SIZE: &str = "x-chunk-size";
}

/// Errors raised validating a client-supplied object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValidationError(String);

impl fmt::Display for KeyValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for KeyValidationError {}

/// Validate a client-supplied object key for traversal and encoding hazards.
///
/// Object keys in this service are always `{bucket}/{filename}` with no
/// internal directory structure exposed to clients (the `.part{N}` suffix
/// used during multipart sessions is server-derived, not client input).
pub fn validate_filename(filename: &str) -> Result<(), KeyValidationError> {
    if filename.is_empty() {
        return Err(KeyValidationError("filename must not be empty".into()));
    }
    if filename.contains('\0') {
        return Err(KeyValidationError(
            "filename must not contain NUL bytes".into(),
        ));
    }
    if filename.contains('\\') {
        return Err(KeyValidationError(
            "filename must not contain backslashes".into(),
        ));
    }
    for segment in filename.split('/') {
        if segment == ".." {
            return Err(KeyValidationError(
                "filename must not contain '..' path segments".into(),
            ));
        }
    }
    if filename == "." || filename == ".." {
        return Err(KeyValidationError("invalid filename".into()));
    }
    Ok(())
}

/// Derive the server-side key for a multipart session's Nth part object.
pub fn part_object_key(object_key: &str, part_number: u32) -> String {
    format!("{object_key}.part{part_number}")
}

/// Lowercase-hex SHA-256, used both as dedup key and integrity witness.
pub type ContentHash = String;

/// Upload route chosen by the admission controller for a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    /// Body streamed through this process with a fixed scratch buffer.
    Proxy,
    /// Single presigned PUT; client uploads directly to the store.
    DirectMinio,
    /// Stateful multipart session, presigned per-part URLs.
    Multipart,
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadMethod::Proxy => "proxy",
            UploadMethod::DirectMinio => "direct_minio",
            UploadMethod::Multipart => "multipart",
        };
        f.write_str(s)
    }
}

/// Sidecar metadata persisted alongside (or as user-metadata on) a stored
/// object. Its absence must never affect correctness — it is written best
/// effort by the metadata recorder off the data path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub original_filename: String,
    pub renamed_filename: String,
    pub file_hash: ContentHash,
    pub file_size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    pub upload_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_metadata: HashMap<String, String>,
}

impl FileMetadata {
    pub fn new(filename: &str, hash: ContentHash, size: u64, content_type: Option<String>) -> Self {
        Self {
            original_filename: filename.to_string(),
            renamed_filename: filename.to_string(),
            file_hash: hash,
            file_size: size,
            content_type,
            upload_timestamp: Utc::now(),
            user_metadata: HashMap::new(),
        }
    }

    /// Build the user-metadata map written onto the stored object, with the
    /// hash under the stable key index hydration relies on.
    pub fn to_object_user_metadata(&self) -> HashMap<String, String> {
        let mut map = self.user_metadata.clone();
        map.insert(HASH_METADATA_KEY.to_string(), self.file_hash.clone());
        map.insert(
            optional_meta_keys::UPLOAD_SOURCE.to_string(),
            "wavegate".to_string(),
        );
        map
    }
}

/// Memory pressure classification published by the memory monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() {
        assert!(validate_filename("../../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_backslash() {
        assert!(validate_filename("path\\file").is_err());
    }

    #[test]
    fn rejects_nul_byte() {
        assert!(validate_filename("path\0file").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_filename("").is_err());
    }

    #[test]
    fn accepts_normal_filename() {
        assert!(validate_filename("sermon-a.wav").is_ok());
    }

    #[test]
    fn derives_part_key() {
        assert_eq!(part_object_key("sermon.wav", 7), "sermon.wav.part7");
    }

    #[test]
    fn metadata_user_map_has_hash() {
        let meta = FileMetadata::new("a.wav", "deadbeef".into(), 10, None);
        let map = meta.to_object_user_metadata();
        assert_eq!(map.get(HASH_METADATA_KEY), Some(&"deadbeef".to_string()));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any filename built only from ASCII alphanumerics, dashes, dots,
        /// and underscores (no traversal segments) is always accepted —
        /// this is the shape every legitimate upload filename takes.
        #[test]
        fn plain_filenames_are_always_valid(
            name in "[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}"
        ) {
            prop_assume!(!name.split('/').any(|seg| seg == ".."));
            prop_assert!(validate_filename(&name).is_ok());
        }

        /// Any filename containing a NUL byte or backslash is always
        /// rejected, regardless of what else surrounds it.
        #[test]
        fn filenames_with_hazard_bytes_are_always_rejected(
            prefix in "[a-zA-Z0-9]{0,20}",
            suffix in "[a-zA-Z0-9]{0,20}",
            hazard in prop_oneof![Just('\0'), Just('\\')],
        ) {
            let name = format!("{prefix}{hazard}{suffix}");
            prop_assert!(validate_filename(&name).is_err());
        }

        /// Deriving a part key is injective in the part number for a fixed
        /// object key: two distinct part numbers never collide.
        #[test]
        fn distinct_part_numbers_never_collide(
            key in "[a-z]{1,10}\\.wav",
            a in 0u32..1000,
            b in 0u32..1000,
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(part_object_key(&key, a), part_object_key(&key, b));
        }
    }
}
