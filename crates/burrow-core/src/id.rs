//! Random identifiers.

use rand::RngExt;

/// Generate a random non-negative 63-bit connection id.
///
/// Ids are drawn, not allocated, so uniqueness among live tunnels is only
/// probabilistic.
pub fn connection_id() -> i64 {
    rand::rng().random_range(0..=i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::connection_id;

    #[test]
    fn connection_ids_are_non_negative() {
        for _ in 0..1000 {
            assert!(connection_id() >= 0);
        }
    }

    #[test]
    fn connection_ids_differ() {
        assert_ne!(connection_id(), connection_id());
    }
}
