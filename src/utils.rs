//! Small shared helpers: integer clocks, SHA-1 checksums and the platform
//! rule for media filename normalization.

use sha1::{Digest, Sha1};
use std::time::{SystemTime, UNIX_EPOCH};
use unicode_normalization::UnicodeNormalization;

/// The time in integer seconds. Pass `scale = 1000` for milliseconds.
pub fn int_time(scale: i64) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs_f64() * scale as f64) as i64
}

/// SHA-1 hex digest of `data`. Media file checksums and session keys both
/// use this form.
pub fn checksum(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha1::digest(data.as_ref()))
}

/// macOS stores media filenames decomposed; everything else composed.
pub const IS_MAC: bool = cfg!(target_os = "macos");

/// Normalize a media filename for the local platform (NFD on macOS, NFC
/// elsewhere). Normalized names are what the media database and the media
/// directory both carry.
pub fn normalize_filename(name: &str) -> String {
    if IS_MAC {
        name.nfd().collect()
    } else {
        name.nfc().collect()
    }
}
