//! Test fixtures and data generators.

use splice_core::{PartRange, StrategyKind};
use splice_metadata::models::NewUploadSession;

/// A session for `owner` whose request hash is derived from `seed`.
#[allow(dead_code)]
pub fn new_session(owner: &str, seed: &str, total_parts: u32) -> NewUploadSession {
    NewUploadSession {
        owner_id: owner.to_string(),
        request_hash: format!("{:032x}", opaque_hash(seed)),
        request_body: format!(r#"{{"file_name":"{seed}"}}"#),
        strategy: StrategyKind::MergeTree,
        bucket: "uploads".to_string(),
        object_key: format!("{owner}/{seed}"),
        upload_token: String::new(),
        total_parts,
        part_size: 5,
        source_object_id: None,
        source_etag: None,
    }
}

fn opaque_hash(seed: &str) -> u128 {
    // Stable, distinct per seed; the store treats the hash as opaque.
    seed.bytes()
        .fold(0xcbf29ce484222325u128, |acc, b| (acc ^ u128::from(b)).wrapping_mul(0x100000001b3))
}

#[allow(dead_code)]
pub fn range(lower: u32, upper: u32) -> PartRange {
    PartRange::new(lower, upper).expect("valid range")
}
