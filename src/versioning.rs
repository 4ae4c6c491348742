//! Version-number resolution shared by status and folder time travel.
//!
//! A versioned entity has at most one current row and an ordered list of
//! archived rows. The version effective at a timestamp is the number of
//! archived transaction times at or before it, plus one when the current
//! row was already in effect.

use crate::error::{Result, VaultError};
use crate::types::Timestamp;

/// Version number effective at `at`.
///
/// Fails with `NoVersionAtTime` when nothing existed at or before `at`.
pub fn version_from_timestamp(
    current: Option<Timestamp>,
    history: &[Timestamp],
    at: Timestamp,
) -> Result<u32> {
    let mut version = history.iter().filter(|&&t| t <= at).count() as u32;
    if let Some(current) = current {
        if at >= current {
            version += 1;
        }
    }
    if version == 0 {
        return Err(VaultError::NoVersionAtTime(at));
    }
    Ok(version)
}

/// Latest version number: archived rows plus the current row.
pub fn latest_version(current_exists: bool, history_len: usize) -> u32 {
    history_len as u32 + u32::from(current_exists)
}
