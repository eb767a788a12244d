//! Object key conventions.
//!
//! Every key here is derivable from the session's base key alone, so any
//! process can locate part and range objects without extra lookup state.

use crate::range::PartRange;
use uuid::Uuid;

/// Base key for the part and range objects of the upload finishing at
/// `final_key`. A sibling of the final key, so the finished object never
/// has to replace a directory-like prefix.
pub fn parts_base(final_key: &str) -> String {
    format!("{final_key}.parts")
}

/// Key of the object a client uploads for a single part: `{base}/{n}`.
pub fn part_key(base_key: &str, part_number: u32) -> String {
    format!("{base_key}/{part_number}")
}

/// Key of the object backing a range: `{base}/{lower}` for a single part,
/// `{base}/{lower}-{upper}` otherwise.
pub fn range_key(base_key: &str, range: &PartRange) -> String {
    if range.is_single() {
        part_key(base_key, range.lower())
    } else {
        format!("{base_key}/{}-{}", range.lower(), range.upper())
    }
}

/// Prefix shared by every part and range object of an upload.
pub fn parts_prefix(base_key: &str) -> String {
    format!("{base_key}/")
}

/// Destination key for a new upload: `{owner}/{key_id}/{file}`.
///
/// `key_id` is minted per allocation so retried uploads of the same file
/// never collide.
pub fn destination_key(owner_id: &str, key_id: Uuid, file_name: &str) -> String {
    let file_name: String = file_name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{owner_id}/{key_id}/{file_name}")
}
