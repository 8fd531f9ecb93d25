//! Tuning constants shared by every layer.

/// Bytes of transaction payload after which a session records a signature
/// checkpoint and content is split into separate pieces.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// Length of the hash prefix used for content-derived CoValue IDs.
pub const SHORT_HASH_LENGTH: usize = 19;

/// Returns true if adding `extra` bytes to `current` goes over `limit`, the
/// checkpoint size in use (normally [`MAX_RECOMMENDED_TX_SIZE`]).
///
/// Session logs and every storage backend decide checkpoints with this one
/// predicate, so their signature boundaries line up.
pub fn exceeds_recommended_size(current: usize, extra: usize, limit: usize) -> bool {
    current.saturating_add(extra) > limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exceeds_recommended_size() {
        let limit = MAX_RECOMMENDED_TX_SIZE;
        assert!(!exceeds_recommended_size(0, limit, limit));
        assert!(exceeds_recommended_size(1, limit, limit));
        assert!(exceeds_recommended_size(limit + 1, 0, limit));
        assert!(exceeds_recommended_size(10, 1, 10));
        assert!(exceeds_recommended_size(usize::MAX, 1, limit));
    }
}
