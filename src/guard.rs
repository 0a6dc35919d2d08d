//! Marker-based idempotency detection.
//!
//! A unit counts as applied when its marker token occurs anywhere in the
//! target's content. Nothing structural is compared: target files belong to
//! third-party packages whose formatting drifts between releases.

/// Whether `marker` is present in `content`.
///
/// An empty marker never counts as applied.
pub fn is_applied(content: &str, marker: &str) -> bool {
    !marker.is_empty() && content.contains(marker)
}
