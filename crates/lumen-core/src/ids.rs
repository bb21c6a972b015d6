//! Time-ordered identifiers.
//!
//! Every row id is a UUIDv7, so `Ord` on [`Uuid`] follows creation time.
//! Tie-breaks that say "lowest id" therefore prefer the oldest row.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_v7_is_version_7() {
        assert_eq!(new_v7().get_version_num(), 7);
    }

    #[test]
    fn test_new_v7_orders_by_creation() {
        let first = new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_v7();
        assert!(first < second);
    }
}
