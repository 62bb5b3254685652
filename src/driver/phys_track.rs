//! This module implements tracking of locked machine pages with a three level
//! sparse bitmap.
//!
//! An MPN is split into L1, L2 and L3 indices. The L1 array grows, and L2
//! directories and L3 bitmap pages are allocated, on the first `add` that needs
//! them. They are only released by `cleanup`. Read paths never allocate.
//!
//! Adding a page that is already tracked, removing one that is not, and
//! cleaning up a tracker that still tracks pages are contract violations and
//! panic.

use alloc::{boxed::Box, vec::Vec};
use bitvec::{array::BitArray, order::Lsb0};
use spin::Mutex;

use super::types::{INVALID_MPN, Mpn, PAGE_SIZE};

/// Number of MPNs covered by one L3 bitmap page (one bit per MPN).
const L3_ENTRIES: u64 = (PAGE_SIZE * 8) as u64;
/// Number of L3 pages one L2 directory refers to.
const L2_ENTRIES: u64 = 1024;
/// MPNs are tracked up to 2^36 - 1, which covers a 48-bit physical address space.
const MAX_MPN_BITS: u32 = 36;
const L1_ENTRIES: u64 = (1 << MAX_MPN_BITS) / (L3_ENTRIES * L2_ENTRIES);

/// The largest MPN a tracker can hold.
pub(crate) const PHYSTRACK_MAX_MPN: Mpn = Mpn((1 << MAX_MPN_BITS) - 1);

type L3Page = BitArray<[u64; PAGE_SIZE / 8], Lsb0>;
const _: () = assert!(core::mem::size_of::<L3Page>() == PAGE_SIZE);

struct L2Dir {
    pages: Box<[Option<Box<L3Page>>]>,
}

impl L2Dir {
    fn new() -> Self {
        Self {
            pages: (0..L2_ENTRIES).map(|_| None).collect(),
        }
    }
}

/// A set of MPNs.
pub struct PhysTracker {
    dirs: Vec<Option<Box<L2Dir>>>,
    count: u64,
}

impl core::fmt::Debug for PhysTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysTracker")
            .field("count", &self.count)
            .field(
                "l2_dirs",
                &self.dirs.iter().filter(|dir| dir.is_some()).count(),
            )
            .finish()
    }
}

impl Default for PhysTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an MPN into its (L1, L2, L3) indices.
fn indices(mpn: Mpn) -> (usize, usize, usize) {
    let p1 = mpn.0 / (L3_ENTRIES * L2_ENTRIES);
    let p2 = (mpn.0 / L3_ENTRIES) % L2_ENTRIES;
    let p3 = mpn.0 % L3_ENTRIES;
    (p1 as usize, p2 as usize, p3 as usize)
}

fn mpn_from(p1: usize, p2: usize, p3: usize) -> Mpn {
    Mpn((p1 as u64 * L2_ENTRIES + p2 as u64) * L3_ENTRIES + p3 as u64)
}

impl PhysTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            dirs: Vec::new(),
            count: 0,
        }
    }

    /// Number of MPNs currently tracked.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Starts tracking `mpn`.
    ///
    /// # Panics
    ///
    /// Panics if `mpn` is already tracked or is beyond [`PHYSTRACK_MAX_MPN`].
    pub fn add(&mut self, mpn: Mpn) {
        assert!(mpn <= PHYSTRACK_MAX_MPN, "MPN {mpn} cannot be tracked");
        let (p1, p2, p3) = indices(mpn);

        debug_assert!((p1 as u64) < L1_ENTRIES);
        if p1 >= self.dirs.len() {
            self.dirs.resize_with(p1 + 1, || None);
        }
        let dir = self.dirs[p1].get_or_insert_with(|| Box::new(L2Dir::new()));
        let page = dir.pages[p2].get_or_insert_with(|| Box::new(L3Page::ZERO));
        assert!(!page[p3], "MPN {mpn} is already tracked");
        page.set(p3, true);
        self.count += 1;
    }

    /// Stops tracking `mpn`.
    ///
    /// # Panics
    ///
    /// Panics if `mpn` is not tracked.
    pub fn remove(&mut self, mpn: Mpn) {
        let page = self
            .page_mut(mpn)
            .unwrap_or_else(|| panic!("MPN {mpn} is not tracked"));
        let (_, _, p3) = indices(mpn);
        assert!(page[p3], "MPN {mpn} is not tracked");
        page.set(p3, false);
        self.count -= 1;
    }

    /// Tests whether `mpn` is tracked.
    pub fn test(&self, mpn: Mpn) -> bool {
        if mpn > PHYSTRACK_MAX_MPN {
            return false;
        }
        let (p1, p2, p3) = indices(mpn);
        self.dirs
            .get(p1)
            .and_then(Option::as_ref)
            .and_then(|dir| dir.pages[p2].as_ref())
            .is_some_and(|page| page[p3])
    }

    /// Returns the smallest tracked MPN strictly greater than `mpn`, or
    /// [`INVALID_MPN`] if there is none. Passing [`INVALID_MPN`] starts the
    /// search from the beginning.
    pub fn next(&self, mpn: Mpn) -> Mpn {
        let start = if mpn == INVALID_MPN { 0 } else { mpn.0 + 1 };
        if start > PHYSTRACK_MAX_MPN.0 {
            return INVALID_MPN;
        }

        let (first1, first2, first3) = indices(Mpn(start));
        for (p1, dir) in self.dirs.iter().enumerate().skip(first1) {
            let Some(dir) = dir else {
                continue;
            };
            let from2 = if p1 == first1 { first2 } else { 0 };
            for (p2, page) in dir.pages.iter().enumerate().skip(from2) {
                let Some(page) = page else {
                    continue;
                };
                let from3 = if p1 == first1 && p2 == first2 {
                    first3
                } else {
                    0
                };
                if let Some(offset) = page[from3..].first_one() {
                    return mpn_from(p1, p2, from3 + offset);
                }
            }
        }
        INVALID_MPN
    }

    /// Returns an iterator over every tracked MPN in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Mpn> + '_ {
        core::iter::successors(Some(self.next(INVALID_MPN)), |&mpn| Some(self.next(mpn)))
            .take_while(|mpn| mpn.is_valid())
    }

    /// Releases the tracker and every directory and page allocated for it.
    ///
    /// # Panics
    ///
    /// Panics if any MPN is still tracked, as that means a page lock leaked.
    pub fn cleanup(self) {
        for (p1, dir) in self.dirs.into_iter().enumerate() {
            let Some(dir) = dir else {
                continue;
            };
            for (p2, page) in dir.pages.iter().enumerate() {
                if let Some(page) = page {
                    if let Some(p3) = page.first_one() {
                        panic!("MPN {} still tracked at cleanup", mpn_from(p1, p2, p3));
                    }
                }
            }
        }
    }

    fn page_mut(&mut self, mpn: Mpn) -> Option<&mut L3Page> {
        if mpn > PHYSTRACK_MAX_MPN {
            return None;
        }
        let (p1, p2, _) = indices(mpn);
        self.dirs
            .get_mut(p1)
            .and_then(Option::as_mut)
            .and_then(|dir| dir.pages[p2].as_deref_mut())
    }
}

/// The one process wide tracker used when VMs share page tracking, with a
/// count of its users.
#[derive(Debug, Default)]
pub struct SharedPhysTracker {
    inner: Mutex<SharedInner>,
}

#[derive(Debug, Default)]
struct SharedInner {
    tracker: Option<PhysTracker>,
    users: usize,
}

impl SharedPhysTracker {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                tracker: None,
                users: 0,
            }),
        }
    }

    /// Registers a user of the shared tracker, allocating it on first use.
    pub fn init_shared(&self) {
        let mut inner = self.inner.lock();
        if inner.tracker.is_none() {
            inner.tracker = Some(PhysTracker::new());
        }
        inner.users += 1;
    }

    /// Runs `f` on the shared tracker.
    ///
    /// # Panics
    ///
    /// Panics if there is no registered user.
    pub fn with<R>(&self, f: impl FnOnce(&mut PhysTracker) -> R) -> R {
        let mut inner = self.inner.lock();
        let tracker = inner
            .tracker
            .as_mut()
            .unwrap_or_else(|| panic!("shared tracker used without init_shared"));
        f(tracker)
    }

    /// Drops a user. The last user cleans the tracker up, which panics if
    /// pages are still tracked.
    pub fn cleanup(&self) {
        let tracker = {
            let mut inner = self.inner.lock();
            assert!(inner.users > 0, "shared tracker has no user");
            inner.users -= 1;
            if inner.users == 0 {
                inner.tracker.take()
            } else {
                None
            }
        };
        if let Some(tracker) = tracker {
            tracker.cleanup();
        }
    }

    pub fn users(&self) -> usize {
        self.inner.lock().users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_test_remove() {
        let mut t = PhysTracker::new();
        for mpn in [Mpn(0), Mpn(1), Mpn(L3_ENTRIES), Mpn(0x1234_5678), PHYSTRACK_MAX_MPN] {
            assert!(!t.test(mpn));
            t.add(mpn);
            assert!(t.test(mpn));
            t.remove(mpn);
            assert!(!t.test(mpn));
        }
        assert!(t.is_empty());
        t.cleanup();
    }

    #[test]
    fn test_does_not_allocate() {
        let t = PhysTracker::new();
        assert!(!t.test(Mpn(0x4242)));
        assert!(!t.test(INVALID_MPN));
        assert!(t.dirs.is_empty());
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn double_add_panics() {
        let mut t = PhysTracker::new();
        t.add(Mpn(7));
        t.add(Mpn(7));
    }

    #[test]
    #[should_panic(expected = "not tracked")]
    fn remove_absent_panics() {
        let mut t = PhysTracker::new();
        t.add(Mpn(8));
        t.remove(Mpn(9));
    }

    #[test]
    #[should_panic(expected = "not tracked")]
    fn remove_from_unallocated_directory_panics() {
        let mut t = PhysTracker::new();
        t.remove(Mpn(0x10_0000));
    }

    #[test]
    #[should_panic(expected = "still tracked at cleanup")]
    fn cleanup_with_leaked_bit_panics() {
        let mut t = PhysTracker::new();
        t.add(Mpn(0x777));
        t.cleanup();
    }

    #[test]
    fn next_enumerates_in_order() {
        let mut t = PhysTracker::new();
        let mpns = [
            Mpn(3),
            Mpn(L3_ENTRIES - 1),
            Mpn(L3_ENTRIES),
            Mpn(L3_ENTRIES * L2_ENTRIES + 5),
            Mpn(0x9_0000_0001),
        ];
        for mpn in mpns.iter().rev() {
            t.add(*mpn);
        }

        assert_eq!(t.next(INVALID_MPN), Mpn(3));
        assert_eq!(t.next(Mpn(3)), Mpn(L3_ENTRIES - 1));
        assert_eq!(t.next(Mpn(4)), Mpn(L3_ENTRIES - 1));
        assert_eq!(t.next(Mpn(0x9_0000_0001)), INVALID_MPN);
        assert_eq!(t.next(PHYSTRACK_MAX_MPN), INVALID_MPN);
        assert_eq!(t.iter().collect::<Vec<_>>(), mpns);

        for mpn in mpns {
            t.remove(mpn);
        }
        assert_eq!(t.next(INVALID_MPN), INVALID_MPN);
        t.cleanup();
    }

    #[test]
    fn shared_tracker_is_cleaned_by_last_user() {
        let shared = SharedPhysTracker::new();
        shared.init_shared();
        shared.init_shared();
        shared.with(|t| t.add(Mpn(5)));
        shared.cleanup();
        assert_eq!(shared.users(), 1);
        assert!(shared.with(|t| t.test(Mpn(5))));
        shared.with(|t| t.remove(Mpn(5)));
        shared.cleanup();
        assert_eq!(shared.users(), 0);
    }
}
