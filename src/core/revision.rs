//! A monotonically increasing identifier assigned to each non-empty change-set a
//! `PolicyList` observes.
//!
//! Backed by a ULID so that revisions minted by the same process carry a
//! real-time-ordered component even if two are allocated within the same
//! millisecond (the monotonic counter in [`ulid::Generator`] breaks ties).

use std::fmt;
use std::sync::Mutex;
use ulid::{Generator, Ulid};

/// Opaque, totally ordered revision marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(Ulid);

impl Revision {
    /// The revision a fresh, never-updated `PolicyList` starts at. It is
    /// superseded by any revision minted via [`RevisionAllocator::next`].
    pub const fn zero() -> Self {
        Revision(Ulid::nil())
    }

    /// Whether `self` supersedes `other`. For any two revisions emitted by
    /// one list, exactly one supersedes the other.
    pub fn supersedes(&self, other: &Revision) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates strictly increasing [`Revision`]s for one `PolicyList` instance.
///
/// Held behind the same mutex that guards a list's refresh-and-diff critical
/// section, so revisions are allocated inside that mutex and their order
/// matches real time.
pub struct RevisionAllocator {
    gen: Mutex<Generator>,
}

impl RevisionAllocator {
    pub fn new() -> Self {
        Self {
            gen: Mutex::new(Generator::new()),
        }
    }

    /// Mint the next revision. Only ever fails if the generator's
    /// monotonic counter overflows within a single millisecond, which
    /// requires generating more than 2^80 revisions in that window.
    pub fn next(&self) -> Revision {
        let mut gen = self.gen.lock().unwrap();
        loop {
            if let Ok(ulid) = gen.generate() {
                return Revision(ulid);
            }
        }
    }
}

impl Default for RevisionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RevisionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevisionAllocator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_are_strictly_increasing_and_total_order() {
        let alloc = RevisionAllocator::new();
        let r1 = alloc.next();
        let r2 = alloc.next();
        assert!(r2.supersedes(&r1));
        assert!(!r1.supersedes(&r2));
        assert_ne!(r1, r2);
    }

    #[test]
    fn zero_is_superseded_by_any_minted_revision() {
        let alloc = RevisionAllocator::new();
        let r1 = alloc.next();
        assert!(r1.supersedes(&Revision::zero()));
    }
}
