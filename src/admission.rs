//! Admission & routing (C6): a single table-driven decision function,
//! rather than nested conditionals, deciding whether a declared upload is
//! admitted and which of the three upload routes it takes.

use crate::types::UploadMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    TooLarge,
    InsufficientMemory,
    DuplicateContent,
    /// The declared filename already names a stored object under a
    /// different content hash. Rejected by default rather than silently
    /// overwritten or auto-disambiguated; see `allow_filename_overwrite`.
    NameCollision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit { route: UploadMethod },
    Reject { kind: RejectKind, detail: String },
}

pub struct AdmissionThresholds {
    pub large_file_threshold_bytes: u64,
    /// Boundary above which an admitted large file is routed to a
    /// multipart session instead of a single direct presigned PUT.
    /// Distinct from the per-part chunk size used once multipart is
    /// chosen.
    pub direct_threshold_bytes: u64,
    pub max_upload_bytes: u64,
}

/// Input facts the decision table is evaluated over. Each field is cheap
/// to compute before calling `decide` — no I/O happens inside this function.
pub struct AdmissionInput<'a> {
    pub declared_size: u64,
    pub existing_hash_match: Option<&'a str>,
    /// Set when the declared filename already names a stored object under
    /// a different hash than the one declared for this request, and the
    /// deployment has not opted into overwrite.
    pub name_collision: bool,
    pub memory_admits: bool,
}

/// Pure decision function: `(too_large, name_collision, duplicate_check,
/// memory_check, size_bucket) -> Decision`. No nested conditionals — every
/// case is one match arm, evaluated in priority order: size cap first (the
/// request is unconditionally invalid), then the two content-identity
/// checks, then memory, then route selection by size.
pub fn decide(thresholds: &AdmissionThresholds, input: &AdmissionInput<'_>) -> Decision {
    match (
        input.declared_size > thresholds.max_upload_bytes,
        input.name_collision,
        input.existing_hash_match.is_some(),
        input.memory_admits,
        input.declared_size > thresholds.large_file_threshold_bytes,
    ) {
        (true, _, _, _, _) => Decision::Reject {
            kind: RejectKind::TooLarge,
            detail: format!(
                "declared size {} exceeds maximum {}",
                input.declared_size, thresholds.max_upload_bytes
            ),
        },
        (false, true, _, _, _) => Decision::Reject {
            kind: RejectKind::NameCollision,
            detail: "filename already stored under a different content hash".to_string(),
        },
        (false, false, true, _, _) => Decision::Reject {
            kind: RejectKind::DuplicateContent,
            detail: format!(
                "content already stored at {}",
                input.existing_hash_match.unwrap()
            ),
        },
        (false, false, false, false, _) => Decision::Reject {
            kind: RejectKind::InsufficientMemory,
            detail: "memory monitor reports critical pressure".to_string(),
        },
        (false, false, false, true, true) if input.declared_size > thresholds.direct_threshold_bytes => {
            Decision::Admit {
                route: UploadMethod::Multipart,
            }
        }
        (false, false, false, true, true) => Decision::Admit {
            route: UploadMethod::DirectMinio,
        },
        (false, false, false, true, false) => Decision::Admit {
            route: UploadMethod::Proxy,
        },
    }
}
