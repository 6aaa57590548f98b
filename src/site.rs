//! Source-site identifiers.
//!
//! Every shared variable and every barrier is addressed by a 32-bit
//! identifier derived from the source location that declares it. The same
//! declaration site hashes to the same id on every node, which is what makes
//! the id a valid cluster-wide address: no registration round-trip is needed
//! at startup. The hash function (XXH32, seed 0, over the UTF-8 bytes of
//! `"<file>:<line>"`) is part of the wire ABI and must match on all nodes.
//!
//! Variables and barriers share the identifier namespace. A collision
//! between two declaration sites is undefined behavior; XXH32 makes that
//! astronomically unlikely for real programs.

use xxhash_rust::const_xxh32::xxh32;

/// A 32-bit identifier for a shared variable or barrier, derived from the
/// source site that declares it.
pub type SiteId = u32;

/// Hash a source-site string of the form `"<file>:<line>"` into a [`SiteId`].
///
/// `const` so that [`site_id!`](crate::site_id) folds to a constant at
/// compile time.
pub const fn site_hash(site: &str) -> SiteId {
    xxh32(site.as_bytes(), 0)
}

/// Derive the [`SiteId`] of the current source location.
///
/// Expands to a constant expression, so it can initialize a `const`:
///
/// ```
/// use pbsm::site::SiteId;
///
/// const COUNTER: SiteId = pbsm::site_id!();
/// ```
#[macro_export]
macro_rules! site_id {
    () => {
        $crate::site::site_hash(concat!(file!(), ":", line!()))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(site_hash("src/main.rs:42"), site_hash("src/main.rs:42"));
    }

    #[test]
    fn adjacent_lines_get_distinct_ids() {
        assert_ne!(site_hash("src/main.rs:42"), site_hash("src/main.rs:43"));
        assert_ne!(site_hash("src/main.rs:42"), site_hash("src/lib.rs:42"));
    }

    #[test]
    fn macro_yields_distinct_ids_per_line() {
        const A: SiteId = site_id!();
        const B: SiteId = site_id!();
        assert_ne!(A, B);
    }

    #[test]
    fn macro_is_stable_within_a_line() {
        let ids: Vec<SiteId> = (0..3).map(|_| site_id!()).collect();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[1], ids[2]);
    }
}
