//! A bucketed open-addressing hash table using graveyard hashing.
//!
//! Graveyard hashing is linear probing without tombstones: erased slots go
//! straight back to empty, every insert between rehashes is tracked as a
//! potential disturbance of the table's order, and the table rehashes a
//! little more eagerly than a classic swiss table would. In exchange, lookups
//! never step over deleted markers and the rehash itself becomes a nearly
//! linear, cache-friendly merge instead of a random scatter.
//!
//! [`HashTable<V>`] stores values of type `V` and provides fast insertion,
//! lookup, and removal operations. This is a fairly low-level structure that
//! requires you to provide the hash value and an equality predicate for each
//! operation. Prefer the [`HashMap<K, V>`] or [`HashSet<V>`] wrappers for a
//! key-value or set interface unless you are implementing your own map or
//! set structure.
//!
//! ## Design
//!
//! The backing array is a contiguous sequence of *buckets*. Each bucket holds
//! 14 control bytes, a 16-bit metadata word, and 14 value slots. A control
//! byte encodes one of three states: empty, full-and-ordered, or
//! full-and-disordered. The low 7 bits hold `0x7F` for an empty slot and
//! otherwise the H2 tag of the stored hash; the high bit marks a full slot as
//! disordered. The metadata word packs the bucket's *search distance* (how
//! many additional buckets a lookup starting here must examine) with an
//! end-of-array flag. 14 control bytes plus the word are exactly 16 bytes, so
//! a single unaligned SIMD load scans a whole bucket.
//!
//! Two hashes are derived from the caller's 64-bit hash. `H1` maps the hash
//! onto a *logical* bucket index by multiplying into the bucket count and
//! taking the high half of the product; this avoids an integer division and,
//! unlike masking, is monotone in the hash value. `H2` is `hash % 127`, a
//! 7-bit tag used to filter slot candidates before the equality predicate
//! runs; the value 127 is reserved to mark empty slots.
//!
//! The monotonicity of `H1` is what makes the graveyard trick work. After a
//! rehash every entry sits in hash-sorted position and is marked ordered.
//! Inserts that happen between rehashes place the new entry in the first
//! empty slot at-or-after its home bucket and mark it disordered. When the
//! table next rehashes, the move into the new array is a two-way merge: one
//! cursor streams the ordered entries (already sorted), while a second
//! cursor scans slightly ahead pulling disordered entries into a small
//! min-heap keyed by hash. Each bucket's search distance bounds how far past
//! its home a disordered entry can live, so the heap only ever holds the
//! entries of a narrow window. At the steady-state load factor only about an
//! eighth of the table is disordered and the heap stays tiny.
//!
//! The array allocates a few more *physical* buckets than the logical count
//! so probes running off the high end usually find room before the end
//! marker. When they do not, the probe wraps to bucket zero and the entry is
//! marked disordered regardless of position, since a wrapped entry is by
//! definition out of hash order.
//!
//! The table runs at up to 7/8 load before rehashing and rehashes down to
//! 7/16 load. Erases do not return budget to the insert counter
//! (`growth_left`): a table that has absorbed `capacity * 7/8` inserts
//! rehashes even if many of them were subsequently erased, which is what
//! keeps probe sequences short without tombstone bookkeeping. Tables no
//! larger than one bucket skip all of this; they never probe, so they are
//! allowed to fill completely.
//!
//! An empty table owns no allocation at all. It points at a shared, static,
//! all-empty bucket whose metadata says "search distance zero, end of
//! array", which lets `find` run its ordinary loop and fall out with a miss
//! without a branch on emptiness.
//!
//! ## Safety Invariants
//!
//! The implementation relies on the following key invariants:
//!
//! 1. **Initialization**: a control byte other than the empty sentinel
//!    guarantees the corresponding slot holds an initialized `V`.
//! 2. **Bounds**: `H1` lands in `[0, logical_bins)` and `logical_bins <=
//!    physical_bins`; probes advance one bucket at a time and consult the
//!    end flag before stepping, wrapping to bucket zero instead of walking
//!    past the last bucket.
//! 3. **Findability**: a full slot whose home bucket is `b` lives within
//!    `search_distance(b)` buckets of `b` (with wrap-around), and a bucket's
//!    distance only grows between rehashes.
//! 4. **Order**: full, non-disordered slots appear in nondecreasing hash
//!    order in any linear traversal of the array.
//!
//! [`HashMap<K, V>`]: crate::hash_map::HashMap
//! [`HashSet<V>`]: crate::hash_set::HashSet

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::alloc::Layout;
#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;
use core::cmp::Reverse;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

use crate::group;
use crate::group::Ctrl;
use crate::group::DistanceWord;
use crate::group::SLOTS_PER_BUCKET;
use crate::telemetry::Telemetry;
use crate::telemetry::TelemetryHandle;

/// Load factor that triggers a rehash: the table rehashes once
/// `capacity * 7/8` inserts have happened since the last rehash.
const FULL_UTILIZATION_NUM: usize = 7;
const FULL_UTILIZATION_DEN: usize = 8;

/// Load factor the table is sized for coming out of a growth rehash.
const REHASHED_UTILIZATION_NUM: usize = 7;
const REHASHED_UTILIZATION_DEN: usize = 16;

/// `clear` keeps the allocation and just resets metadata for tables up to
/// this many slots; larger arrays are released.
const CLEAR_REUSE_MAX_SLOTS: usize = 128;

/// Arrays of more than this many buckets are aligned to a cache line.
const CACHE_ALIGNED_MIN_BUCKETS: usize = 4;
const CACHE_LINE: usize = 64;

#[cfg(feature = "generations")]
const RESERVED_GROWTH_JUST_RAN_OUT: usize = usize::MAX;

/// With no reserved growth, an insert triggers a bug-detection rehash with
/// probability `REHASH_PROBABILITY_CONSTANT / capacity`, keeping N inserts
/// O(N) overall while still exercising iterator-invalidation paths.
#[cfg(feature = "generations")]
const REHASH_PROBABILITY_CONSTANT: usize = 16;

#[cfg(feature = "generations")]
static EMPTY_GENERATION: u8 = 0;

/// Zero is the generation of unallocated tables; live tables skip it.
#[cfg(feature = "generations")]
#[inline(always)]
fn next_generation(generation: u8) -> u8 {
    let next = generation.wrapping_add(1);
    if next == 0 { 1 } else { next }
}

/// Extracts the home bucket index from a hash. Multiplying into the bucket
/// count and keeping the high half of the product spreads the hash uniformly
/// over `[0, logical_bins)` without a division, and is monotone in `hash`,
/// which the rehash merge depends on.
#[inline(always)]
fn h1(hash: u64, logical_bins: usize) -> usize {
    ((hash as u128 * logical_bins as u128) >> 64) as usize
}

/// Extracts the 7-bit slot tag from a hash. 127 is reserved for empty slots.
#[inline(always)]
fn h2(hash: u64) -> u8 {
    (hash % 127) as u8
}

/// Prefetches data into the cache.
///
/// # Safety
///
/// The caller must ensure that `ptr` points to a memory location that is safe
/// to read from. While `_mm_prefetch` might not fault on invalid addresses,
/// the behavior is undefined if the address is not valid for reads.
#[inline(always)]
unsafe fn prefetch<T>(ptr: *const T) {
    #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse"
    ))]
    unsafe {
        _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse"
    )))]
    let _ = ptr;
}

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Offset of the metadata word within a bucket.
const DISTANCE_OFFSET: usize = SLOTS_PER_BUCKET;

/// Minimum alignment of a bucket: the metadata word needs 2 bytes, the slots
/// need `V`'s alignment.
const fn bucket_align<V>() -> usize {
    let slot_align = mem::align_of::<V>();
    if slot_align < 2 { 2 } else { slot_align }
}

/// Offset of the first slot within a bucket.
const fn slots_offset<V>() -> usize {
    align_up(SLOTS_PER_BUCKET + 2, mem::align_of::<V>())
}

/// Size of one bucket, padded so consecutive buckets stay aligned.
const fn bucket_size<V>() -> usize {
    align_up(
        slots_offset::<V>() + SLOTS_PER_BUCKET * mem::size_of::<V>(),
        bucket_align::<V>(),
    )
}

/// Number of buckets to allocate for a given logical bucket count. The extra
/// tail absorbs probe sequences running past the last logical bucket, making
/// wrap-around (and the disordered marks it forces) rare. One extra bucket
/// per eight logical buckets, plus one; tunable against memory overhead.
const fn physical_bins_for(logical_bins: usize) -> usize {
    logical_bins + logical_bins / 8 + 1
}

/// Returns the number of logical buckets needed to hold `n` values at the
/// load factor `num/den`. Tables of at most one bucket never probe, so a
/// single bucket may fill completely.
fn bins_for_load(n: usize, num: usize, den: usize) -> usize {
    if n == 0 {
        0
    } else if n <= SLOTS_PER_BUCKET {
        1
    } else {
        (n * den).div_ceil(SLOTS_PER_BUCKET * num)
    }
}

fn bins_for_full_load(n: usize) -> usize {
    bins_for_load(n, FULL_UTILIZATION_NUM, FULL_UTILIZATION_DEN)
}

fn bins_for_rehashed_load(n: usize) -> usize {
    bins_for_load(n, REHASHED_UTILIZATION_NUM, REHASHED_UTILIZATION_DEN)
}

/// Number of inserts an empty table with `logical_bins` buckets accepts
/// before a rehash becomes mandatory.
fn growth_capacity(logical_bins: usize) -> usize {
    let slots = logical_bins * SLOTS_PER_BUCKET;
    if logical_bins <= 1 {
        slots
    } else {
        slots * FULL_UTILIZATION_NUM / FULL_UTILIZATION_DEN
    }
}

/// The shared metadata image referenced by unallocated tables: one all-empty
/// bucket with search distance zero and the end flag set. Aligned so the
/// 16-byte metadata scan is one in-bounds load.
#[repr(C, align(16))]
struct EmptyBucketImage {
    ctrl: [u8; SLOTS_PER_BUCKET],
    distance: u16,
}

static EMPTY_BUCKET_IMAGE: EmptyBucketImage = EmptyBucketImage {
    ctrl: [Ctrl::EMPTY.bits(); SLOTS_PER_BUCKET],
    distance: DistanceWord::new(true).bits(),
};

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    buckets_offset: usize,
}

impl DataLayout {
    fn new<V>(physical_bins: usize) -> Self {
        let bucket_align = bucket_align::<V>();
        let align = if physical_bins > CACHE_ALIGNED_MIN_BUCKETS {
            bucket_align.max(CACHE_LINE)
        } else {
            bucket_align
        };
        // One generation byte ahead of the buckets when mutation detection
        // is compiled in; a full alignment unit keeps the buckets aligned.
        let buckets_offset = if cfg!(feature = "generations") {
            bucket_align
        } else {
            0
        };
        let size = physical_bins
            .checked_mul(bucket_size::<V>())
            .and_then(|bytes| bytes.checked_add(buckets_offset))
            .expect("allocation size overflow");
        let layout = Layout::from_size_align(size, align).expect("allocation size overflow");
        DataLayout {
            layout,
            buckets_offset,
        }
    }

    fn empty() -> Self {
        DataLayout {
            layout: Layout::new::<()>(),
            buckets_offset: 0,
        }
    }
}

/// A cursor over the bucket array.
///
/// A `BucketPtr` knows the bucket layout from `V` alone, so it can read
/// control bytes, the metadata word, and slot pointers, and advance to the
/// next bucket, without a reference to the table.
struct BucketPtr<V> {
    ptr: NonNull<u8>,
    _marker: PhantomData<*mut V>,
}

impl<V> Clone for BucketPtr<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for BucketPtr<V> {}

impl<V> BucketPtr<V> {
    #[inline(always)]
    fn new(ptr: NonNull<u8>) -> Self {
        BucketPtr {
            ptr,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn metadata(self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Reads the control byte of slot `i`.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket and `i < SLOTS_PER_BUCKET`.
    #[inline(always)]
    unsafe fn ctrl(self, i: usize) -> Ctrl {
        debug_assert!(i < SLOTS_PER_BUCKET);
        // SAFETY: Caller guarantees the bucket is live and `i` in bounds.
        unsafe { Ctrl::from_bits(*self.ptr.as_ptr().add(i)) }
    }

    /// Writes the control byte of slot `i`.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live, exclusively borrowed bucket and
    /// `i < SLOTS_PER_BUCKET`.
    #[inline(always)]
    unsafe fn set_ctrl(self, i: usize, ctrl: Ctrl) {
        debug_assert!(i < SLOTS_PER_BUCKET);
        // SAFETY: Caller guarantees the bucket is live and `i` in bounds.
        unsafe {
            *self.ptr.as_ptr().add(i) = ctrl.bits();
        }
    }

    /// Reads the bucket's metadata word.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket.
    #[inline(always)]
    unsafe fn distance_word(self) -> DistanceWord {
        // SAFETY: Buckets are at least 2-aligned and the word sits at an
        // even offset, so the typed read is aligned.
        unsafe {
            DistanceWord::from_bits(self.ptr.as_ptr().add(DISTANCE_OFFSET).cast::<u16>().read())
        }
    }

    /// Writes the bucket's metadata word.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live, exclusively borrowed bucket.
    #[inline(always)]
    unsafe fn set_distance_word(self, word: DistanceWord) {
        // SAFETY: As in `distance_word`; the write is aligned.
        unsafe {
            self.ptr
                .as_ptr()
                .add(DISTANCE_OFFSET)
                .cast::<u16>()
                .write(word.bits());
        }
    }

    /// Whether this is the last physical bucket.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket.
    #[inline(always)]
    unsafe fn is_end(self) -> bool {
        // SAFETY: Forwarded.
        unsafe { self.distance_word().is_end() }
    }

    /// Pointer to slot `i`. Whether the slot is initialized is governed by
    /// its control byte.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket and `i < SLOTS_PER_BUCKET`.
    #[inline(always)]
    unsafe fn slot_ptr(self, i: usize) -> *mut V {
        debug_assert!(i < SLOTS_PER_BUCKET);
        // SAFETY: Caller guarantees the bucket is live and `i` in bounds.
        unsafe { self.ptr.as_ptr().add(slots_offset::<V>()).cast::<V>().add(i) }
    }

    /// Advances to the next bucket. Advancing past the end bucket is a bug
    /// in the caller; wrap-around is handled a layer up.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket that is not the end bucket.
    #[inline(always)]
    unsafe fn next(self) -> BucketPtr<V> {
        // SAFETY: Not the end bucket, so the following bucket exists within
        // the same allocation.
        unsafe {
            debug_assert!(!self.is_end());
            BucketPtr::new(NonNull::new_unchecked(
                self.ptr.as_ptr().add(bucket_size::<V>()),
            ))
        }
    }

    /// Bitmask of slots whose control byte is full with H2 tag `q`.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket.
    #[inline(always)]
    unsafe fn match_tag(self, q: u8) -> u16 {
        // SAFETY: A live bucket has 16 initialized metadata bytes.
        unsafe { group::match_tag(self.metadata(), q) }
    }

    /// Bitmask of empty slots.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket.
    #[inline(always)]
    unsafe fn mask_empty(self) -> u16 {
        // SAFETY: A live bucket has 16 initialized metadata bytes.
        unsafe { group::mask_empty(self.metadata()) }
    }

    /// Bitmask of full slots.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket.
    #[inline(always)]
    unsafe fn mask_full(self) -> u16 {
        // SAFETY: A live bucket has 16 initialized metadata bytes.
        unsafe { group::mask_full(self.metadata()) }
    }

    /// Number of consecutive empty slots starting at slot `from`.
    ///
    /// # Safety
    ///
    /// The pointer must reference a live bucket and `from <=
    /// SLOTS_PER_BUCKET`.
    #[inline(always)]
    unsafe fn count_leading_empty(self, from: usize) -> usize {
        // SAFETY: A live bucket has 16 initialized metadata bytes.
        unsafe { group::count_leading_empty(self.metadata(), from) }
    }
}

/// Location of an empty slot found by probing, plus how far the probe
/// walked.
struct FindSlot {
    bucket_index: usize,
    slot: usize,
    probe_length: usize,
}

/// A low-level hash table storing values of type `V` with graveyard hashing.
///
/// `HashTable<V>` does not know how to hash or compare values; every
/// operation takes the hash and the predicates it needs. The `rehash`
/// closure passed to mutating operations must return, for any stored value,
/// the hash the value was inserted under.
pub struct HashTable<V> {
    layout: DataLayout,
    alloc: NonNull<u8>,

    size: usize,
    logical_bins: usize,
    physical_bins: usize,
    growth_left: usize,
    /// Largest search distance recorded since the last rehash; bounds the
    /// look-ahead window of the rehash merge.
    max_search_distance: usize,

    telemetry: TelemetryHandle,

    /// Inserts guaranteed rehash-free by the last `reserve`. Drives the
    /// bug-detection rehash state machine.
    #[cfg(feature = "generations")]
    reserved_growth: usize,
    #[cfg(feature = "generations")]
    rehash_seed: u64,

    _phantom: PhantomData<V>,
}

// SAFETY: The table uniquely owns its allocation and hands out references
// with ordinary borrow-checked lifetimes; the raw pointers never alias
// another table's storage. Telemetry sinks are required to be Sync.
unsafe impl<V: Send> Send for HashTable<V> {}
// SAFETY: Shared references only permit reads of the backing array.
unsafe impl<V: Sync> Sync for HashTable<V> {}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HashTable<V> {
    /// Creates an empty table. Does not allocate; the first insert or
    /// reservation does.
    pub fn new() -> Self {
        HashTable {
            layout: DataLayout::empty(),
            alloc: NonNull::from(&EMPTY_BUCKET_IMAGE).cast(),
            size: 0,
            logical_bins: 0,
            physical_bins: 1,
            growth_left: 0,
            max_search_distance: 0,
            telemetry: TelemetryHandle::default(),
            #[cfg(feature = "generations")]
            reserved_growth: 0,
            #[cfg(feature = "generations")]
            rehash_seed: 0,
            _phantom: PhantomData,
        }
    }

    /// Creates a table pre-sized so that `capacity` inserts will not rehash.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut table = Self::new();
        if capacity > 0 {
            table.install_storage(bins_for_full_load(capacity));
            table.growth_left = capacity;
        }
        table
    }

    /// Attaches a telemetry sink. The sink receives a `register` call now
    /// and an `unregister` call when the table is dropped.
    pub fn set_telemetry(&mut self, sink: &'static dyn Telemetry) {
        self.telemetry.attach(sink);
    }

    /// Returns the number of values in the table.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` if the table contains no values.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the number of slots in the logical bucket range. The table
    /// rehashes before the live count reaches this; see the module docs for
    /// the load factors.
    pub fn capacity(&self) -> usize {
        self.logical_bins * SLOTS_PER_BUCKET
    }

    fn is_allocated(&self) -> bool {
        self.layout.layout.size() != 0
    }

    #[inline(always)]
    fn bucket_ptr(&self, index: usize) -> BucketPtr<V> {
        debug_assert!(index < self.physical_bins);
        // SAFETY: `index` is within the physical bucket range of the live
        // allocation, or zero for the shared empty image, which is one
        // bucket's worth of valid metadata.
        unsafe {
            BucketPtr::new(NonNull::new_unchecked(
                self.alloc
                    .as_ptr()
                    .add(self.layout.buckets_offset + index * bucket_size::<V>()),
            ))
        }
    }

    #[cfg(feature = "generations")]
    fn generation_ptr(&self) -> *const u8 {
        if self.is_allocated() {
            self.alloc.as_ptr()
        } else {
            &EMPTY_GENERATION
        }
    }

    #[cfg(feature = "generations")]
    fn bump_generation(&mut self) {
        if self.is_allocated() {
            // SAFETY: The generation byte ahead of the buckets is part of
            // our allocation.
            unsafe {
                let generation = self.alloc.as_ptr();
                *generation = next_generation(*generation);
            }
        }
    }

    #[cfg(not(feature = "generations"))]
    #[inline(always)]
    fn bump_generation(&mut self) {}

    #[cfg(feature = "generations")]
    fn maybe_increment_generation_on_insert(&mut self) {
        if self.reserved_growth == RESERVED_GROWTH_JUST_RAN_OUT {
            self.reserved_growth = 0;
        }
        if self.reserved_growth > 0 {
            self.reserved_growth -= 1;
            if self.reserved_growth == 0 {
                self.reserved_growth = RESERVED_GROWTH_JUST_RAN_OUT;
            }
        } else {
            self.bump_generation();
        }
    }

    #[cfg(not(feature = "generations"))]
    #[inline(always)]
    fn maybe_increment_generation_on_insert(&mut self) {}

    /// Whether this insert should rehash purely to shake out stale iterators
    /// and pointers: always on the first insert after reserved growth runs
    /// out, and with probability `REHASH_PROBABILITY_CONSTANT / capacity`
    /// otherwise.
    #[cfg(feature = "generations")]
    fn should_rehash_for_bug_detection(&mut self) -> bool {
        if self.reserved_growth == RESERVED_GROWTH_JUST_RAN_OUT {
            return true;
        }
        if self.reserved_growth != 0 || !self.is_allocated() {
            return false;
        }
        self.rehash_seed = self
            .rehash_seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.rehash_seed >> 33) as usize) % self.capacity() < REHASH_PROBABILITY_CONSTANT
    }

    /// Allocates and installs a fresh backing array of `logical_bins`
    /// buckets. The previous storage, if any, is the caller's to release.
    fn install_storage(&mut self, logical_bins: usize) {
        debug_assert!(logical_bins > 0);
        let physical_bins = physical_bins_for(logical_bins);
        let layout = DataLayout::new::<V>(physical_bins);

        // SAFETY: The layout has nonzero size (at least one bucket).
        // Allocation failure is handled; every bucket's metadata is
        // initialized before the pointer is published.
        let alloc = unsafe {
            let raw = alloc::alloc::alloc(layout.layout);
            if raw.is_null() {
                handle_alloc_error(layout.layout);
            }

            #[cfg(feature = "generations")]
            {
                *raw = next_generation(*self.generation_ptr());
            }

            let buckets = raw.add(layout.buckets_offset);
            for i in 0..physical_bins {
                let bucket = buckets.add(i * bucket_size::<V>());
                core::ptr::write_bytes(bucket, Ctrl::EMPTY.bits(), SLOTS_PER_BUCKET);
                let word = DistanceWord::new(i + 1 == physical_bins);
                bucket.add(DISTANCE_OFFSET).cast::<u16>().write(word.bits());
            }

            NonNull::new_unchecked(raw)
        };

        self.layout = layout;
        self.alloc = alloc;
        self.logical_bins = logical_bins;
        self.physical_bins = physical_bins;
        self.growth_left = growth_capacity(logical_bins).saturating_sub(self.size);
        self.max_search_distance = 0;
        #[cfg(feature = "generations")]
        {
            self.rehash_seed ^= alloc.as_ptr() as usize as u64;
        }
        self.telemetry
            .record_storage_changed(self.size, self.capacity());
    }

    /// Releases the backing array and returns to the unallocated state. All
    /// slots must already be empty or moved out.
    fn release_storage(&mut self) {
        debug_assert!(self.size == 0);
        if !self.is_allocated() {
            return;
        }
        // SAFETY: The allocation is live and matches `self.layout`.
        unsafe {
            alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
        }
        self.layout = DataLayout::empty();
        self.alloc = NonNull::from(&EMPTY_BUCKET_IMAGE).cast();
        self.logical_bins = 0;
        self.physical_bins = 1;
        self.growth_left = 0;
        self.max_search_distance = 0;
        self.telemetry.record_storage_changed(0, 0);
    }

    /// Finds the bucket and slot holding a value matching `eq` under `hash`.
    #[inline]
    fn find_slot(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<(usize, usize)> {
        let q = h2(hash);
        let mut index = h1(hash, self.logical_bins);
        let mut bucket = self.bucket_ptr(index);
        // SAFETY: `index` comes from `h1` and is in bounds; the end flag is
        // consulted before every advance, wrapping to bucket zero.
        unsafe {
            let mut remaining = bucket.distance_word().distance();
            loop {
                let mut candidates = bucket.match_tag(q);
                while candidates != 0 {
                    let slot = candidates.trailing_zeros() as usize;
                    candidates &= candidates - 1;
                    // A matching tag guarantees the slot is full and
                    // therefore initialized; tag collisions cost one extra
                    // predicate call.
                    if eq(&*bucket.slot_ptr(slot)) {
                        return Some((index, slot));
                    }
                }
                if remaining == 0 {
                    return None;
                }
                remaining -= 1;
                if bucket.is_end() {
                    index = 0;
                    bucket = self.bucket_ptr(0);
                } else {
                    index += 1;
                    bucket = bucket.next();
                }
                prefetch(bucket.metadata());
            }
        }
    }

    /// Probes for the first empty slot at-or-after `hash`'s home bucket,
    /// wrapping past the physical tail to bucket zero.
    ///
    /// Must not be called unless the table has an empty slot.
    fn find_first_empty(&self, hash: u64) -> FindSlot {
        debug_assert!(self.is_allocated());
        let mut index = h1(hash, self.logical_bins);
        let mut bucket = self.bucket_ptr(index);
        let mut probe_length = 0;
        // SAFETY: `index` starts in bounds; the end flag is consulted before
        // every advance.
        unsafe {
            loop {
                let empty = bucket.mask_empty();
                if empty != 0 {
                    return FindSlot {
                        bucket_index: index,
                        slot: empty.trailing_zeros() as usize,
                        probe_length,
                    };
                }
                debug_assert!(
                    probe_length <= self.physical_bins,
                    "probed a full table for an empty slot"
                );
                if bucket.is_end() {
                    index = 0;
                    bucket = self.bucket_ptr(0);
                } else {
                    index += 1;
                    bucket = bucket.next();
                }
                probe_length += 1;
            }
        }
    }

    /// Finds a value by hash and equality predicate.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash of the value to search for
    /// * `eq` - A predicate that returns `true` for the desired value
    #[inline]
    pub fn find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&V> {
        let (bucket_index, slot) = self.find_slot(hash, eq)?;
        // SAFETY: `find_slot` only returns full slots, which are
        // initialized.
        Some(unsafe { &*self.bucket_ptr(bucket_index).slot_ptr(slot) })
    }

    /// Finds a value by hash and equality predicate, returning a mutable
    /// reference.
    #[inline]
    pub fn find_mut(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        let (bucket_index, slot) = self.find_slot(hash, eq)?;
        // SAFETY: `find_slot` only returns full slots, which are
        // initialized.
        Some(unsafe { &mut *self.bucket_ptr(bucket_index).slot_ptr(slot) })
    }

    /// Gets an entry for the given hash and equality predicate, for in-place
    /// insertion or modification.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash of the value
    /// * `eq` - A predicate that returns `true` for matching values
    /// * `rehash` - Recomputes the hash of a stored value; called if the
    ///   table must rehash before the entry can be placed
    #[inline]
    pub fn entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Entry<'_, V> {
        if let Some((bucket_index, slot)) = self.find_slot(hash, &eq) {
            return Entry::Occupied(OccupiedEntry {
                table: self,
                bucket_index,
                slot,
            });
        }
        Entry::Vacant(self.prepare_vacant(hash, &rehash))
    }

    /// Locates (growing if necessary) an empty slot for a value with `hash`
    /// that `find_slot` just missed.
    fn prepare_vacant(&mut self, hash: u64, rehash: &dyn Fn(&V) -> u64) -> VacantEntry<'_, V> {
        #[cfg(feature = "generations")]
        if self.should_rehash_for_bug_detection() {
            let bins = if self.growth_left > 0 {
                self.logical_bins
            } else {
                bins_for_rehashed_load(self.size + 1)
            };
            self.resize_to(bins, rehash);
        }

        if self.growth_left == 0 {
            self.resize_to(bins_for_rehashed_load(self.size + 1), rehash);
        }

        let mut target = self.find_first_empty(hash);
        while target.probe_length > DistanceWord::MAX_DISTANCE {
            // The home bucket cannot record a probe this long; rehash rather
            // than lose track of the value.
            self.resize_to(bins_for_rehashed_load(self.size + 1), rehash);
            target = self.find_first_empty(hash);
        }

        VacantEntry {
            hash,
            bucket_index: target.bucket_index,
            slot: target.slot,
            probe_length: target.probe_length,
            table: self,
        }
    }

    /// Removes and returns a value from the table.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash of the value to remove
    /// * `eq` - A predicate that returns `true` for the value to remove
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        let (bucket_index, slot) = self.find_slot(hash, eq)?;
        let bucket = self.bucket_ptr(bucket_index);
        // SAFETY: `find_slot` returned a full slot; the value is moved out
        // and the control byte set to empty in one step. Search distances
        // stay put (they remain a valid upper bound) and erases do not
        // return insert budget.
        let value = unsafe {
            let value = bucket.slot_ptr(slot).read();
            bucket.set_ctrl(slot, Ctrl::EMPTY);
            value
        };
        self.size -= 1;
        self.bump_generation();
        self.telemetry.record_erase();
        Some(value)
    }

    /// Reserves capacity for at least `capacity` values in total and
    /// guarantees that `capacity - len()` further inserts will not rehash.
    pub fn reserve(&mut self, capacity: usize, rehash: impl Fn(&V) -> u64) {
        if capacity > self.size + self.growth_left {
            self.resize_to(bins_for_full_load(capacity), &rehash);
            self.telemetry.record_reservation(capacity);
            // The reservation is an exact insert budget; an organic rehash
            // re-derives the budget from the load factor instead.
            self.growth_left = capacity - self.size;
        }
        #[cfg(feature = "generations")]
        {
            self.reserved_growth = capacity.saturating_sub(self.size);
        }
    }

    /// Rehashes the table to hold at least `capacity` values.
    ///
    /// `rehash_to(0)` re-establishes the hash-sorted order (clearing all
    /// disordered marks) at the current size, releasing the array entirely
    /// if the table is empty.
    pub fn rehash_to(&mut self, capacity: usize, rehash: impl Fn(&V) -> u64) {
        if capacity == 0 && !self.is_allocated() {
            return;
        }
        if capacity == 0 && self.size == 0 {
            self.release_storage();
            return;
        }
        let bins = bins_for_full_load(self.size.max(capacity)).max(1);
        if capacity == 0 || bins > self.logical_bins {
            self.resize_to(bins, &rehash);
            self.telemetry.record_reservation(capacity);
        }
    }

    /// Removes all values. Small arrays are kept with their metadata reset;
    /// larger arrays are released.
    pub fn clear(&mut self) {
        if !self.is_allocated() {
            return;
        }
        // SAFETY: Control bytes accurately describe which slots are
        // initialized.
        unsafe {
            self.drop_slots();
        }
        self.size = 0;
        #[cfg(feature = "generations")]
        {
            self.reserved_growth = 0;
        }
        if self.capacity() <= CLEAR_REUSE_MAX_SLOTS {
            // SAFETY: The allocation is live; only metadata is rewritten.
            unsafe {
                self.reset_metadata();
            }
            self.growth_left = growth_capacity(self.logical_bins);
            self.max_search_distance = 0;
            self.bump_generation();
        } else {
            self.release_storage();
        }
        self.telemetry.record_clear();
    }

    /// Drops every initialized value, leaving control bytes untouched.
    ///
    /// # Safety
    ///
    /// Control bytes must accurately describe slot initialization; after
    /// this call the caller must not treat any slot as initialized.
    unsafe fn drop_slots(&mut self) {
        if !mem::needs_drop::<V>() || self.size == 0 {
            return;
        }
        for index in 0..self.physical_bins {
            let bucket = self.bucket_ptr(index);
            // SAFETY: The full mask selects exactly the initialized slots.
            unsafe {
                let mut full = bucket.mask_full();
                while full != 0 {
                    let slot = full.trailing_zeros() as usize;
                    full &= full - 1;
                    bucket.slot_ptr(slot).drop_in_place();
                }
            }
        }
    }

    /// Resets every control byte to empty and every search distance to
    /// zero, preserving the end flag on the last bucket.
    ///
    /// # Safety
    ///
    /// The allocation must be live, and no slot may be treated as
    /// initialized afterwards.
    unsafe fn reset_metadata(&mut self) {
        for index in 0..self.physical_bins {
            let bucket = self.bucket_ptr(index);
            // SAFETY: The bucket is within the live allocation.
            unsafe {
                core::ptr::write_bytes(bucket.metadata(), Ctrl::EMPTY.bits(), SLOTS_PER_BUCKET);
                bucket.set_distance_word(DistanceWord::new(index + 1 == self.physical_bins));
            }
        }
    }

    /// Replaces the backing array with one sized for `new_logical` buckets
    /// and streams every value into it in hash order.
    #[cold]
    fn resize_to(&mut self, new_logical: usize, rehash: &dyn Fn(&V) -> u64) {
        debug_assert!(new_logical > 0);

        let old_layout = self.layout;
        let old_alloc = self.alloc;
        let old_logical = self.logical_bins;
        let old_physical = self.physical_bins;
        let old_allocated = self.is_allocated();
        // The merge only needs to look this far ahead of the ordered cursor
        // for disordered entries that could sort earlier.
        let old_window = self.max_search_distance + 1;

        // Allocating the new array first means an allocation failure leaves
        // the table untouched.
        self.install_storage(new_logical);

        if self.size != 0 {
            let old_buckets = |index: usize| -> BucketPtr<V> {
                debug_assert!(index < old_physical);
                // SAFETY: The old allocation is still live; `index` is
                // bounded by its physical bucket count.
                unsafe {
                    BucketPtr::new(NonNull::new_unchecked(
                        old_alloc
                            .as_ptr()
                            .add(old_layout.buckets_offset + index * bucket_size::<V>()),
                    ))
                }
            };
            let total_probe_length =
                self.merge_from(old_buckets, old_logical, old_physical, old_window, rehash);
            self.telemetry.record_rehash(total_probe_length);
        }

        if old_allocated {
            // SAFETY: Every value has been moved out; the old array is
            // released without running destructors.
            unsafe {
                alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
            }
        }
        self.growth_left = growth_capacity(new_logical).saturating_sub(self.size);
        self.bump_generation();
    }

    /// Merges the old array into the freshly installed new one, emitting
    /// values in nondecreasing hash order so everything lands ordered except
    /// wrap-arounds.
    ///
    /// Ordered slots already appear in hash order in array order (the
    /// previous merge emitted them that way, and in-between inserts are
    /// always marked disordered), so this is a two-way merge between the
    /// ordered sequence and a min-heap of upcoming disordered entries.
    fn merge_from(
        &mut self,
        old_buckets: impl Fn(usize) -> BucketPtr<V>,
        old_logical: usize,
        old_physical: usize,
        old_window: usize,
        rehash: &dyn Fn(&V) -> u64,
    ) -> usize {
        let mut total_probe_length = 0;

        // (hash, bucket, slot) of disordered entries not yet emitted;
        // `Reverse` turns the max-heap into a min-heap on hash.
        let mut heap: BinaryHeap<Reverse<(u64, usize, usize)>> = BinaryHeap::new();
        let mut prescan = 0usize;

        let mut ordered_bucket = 0usize;
        let mut ordered_slot = 0usize;
        let mut ordered_next: Option<(u64, usize, usize)> = None;

        loop {
            // SAFETY: All old-array accesses are bounded by `old_physical`
            // and read only full slots, which stay initialized until emitted
            // exactly once.
            unsafe {
                if ordered_next.is_none() {
                    'search: while ordered_bucket < old_physical {
                        let bucket = old_buckets(ordered_bucket);
                        while ordered_slot < SLOTS_PER_BUCKET {
                            let ctrl = bucket.ctrl(ordered_slot);
                            if ctrl.is_full() && !ctrl.is_disordered() {
                                let hash = rehash(&*bucket.slot_ptr(ordered_slot));
                                ordered_next = Some((hash, ordered_bucket, ordered_slot));
                                ordered_slot += 1;
                                break 'search;
                            }
                            ordered_slot += 1;
                        }
                        ordered_bucket += 1;
                        ordered_slot = 0;
                    }
                }

                // Pull in every disordered entry that could sort before the
                // ordered head: such an entry's home bucket is at most the
                // head's, and the search distance bounds how far past its
                // home it can sit. Wrapped entries live below their home and
                // were covered by an earlier prescan.
                let prescan_bound = match ordered_next {
                    Some((hash, _, _)) => (h1(hash, old_logical) + old_window).min(old_physical),
                    None => old_physical,
                };
                while prescan < prescan_bound {
                    let bucket = old_buckets(prescan);
                    let mut full = bucket.mask_full();
                    while full != 0 {
                        let slot = full.trailing_zeros() as usize;
                        full &= full - 1;
                        if bucket.ctrl(slot).is_disordered() {
                            let hash = rehash(&*bucket.slot_ptr(slot));
                            heap.push(Reverse((hash, prescan, slot)));
                        }
                    }
                    prescan += 1;
                }

                let take_heap = match (heap.peek(), ordered_next) {
                    (Some(Reverse(top)), Some(ordered)) => top.0 < ordered.0,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => break,
                };
                let (hash, bucket_index, slot) = if take_heap {
                    heap.pop().unwrap().0
                } else {
                    ordered_next.take().unwrap()
                };

                total_probe_length +=
                    self.place_rehashed(hash, old_buckets(bucket_index).slot_ptr(slot));
            }
        }

        total_probe_length
    }

    /// Moves one value (by raw copy out of the old array) into the new
    /// array, marking it ordered unless the probe wrapped.
    ///
    /// # Safety
    ///
    /// `src` must point to an initialized value that is not read again.
    unsafe fn place_rehashed(&mut self, hash: u64, src: *const V) -> usize {
        let target = self.find_first_empty(hash);
        let home = h1(hash, self.logical_bins);
        let bucket = self.bucket_ptr(target.bucket_index);
        // SAFETY: `find_first_empty` returned an empty in-bounds slot; the
        // copy transfers ownership out of the old array, which is later
        // deallocated without running destructors.
        unsafe {
            let ctrl = if target.bucket_index < home {
                Ctrl::disordered(h2(hash))
            } else {
                Ctrl::ordered(h2(hash))
            };
            bucket.set_ctrl(target.slot, ctrl);
            core::ptr::copy_nonoverlapping(src, bucket.slot_ptr(target.slot), 1);
        }
        self.note_probe(home, target.probe_length);
        target.probe_length
    }

    /// Records a placement probe of `probe_length` buckets for home bucket
    /// `home`, growing its search distance if needed.
    fn note_probe(&mut self, home: usize, probe_length: usize) {
        let bucket = self.bucket_ptr(home);
        // SAFETY: `home` is a logical bucket index, in bounds.
        unsafe {
            let word = bucket.distance_word();
            if probe_length > word.distance() {
                debug_assert!(probe_length <= DistanceWord::MAX_DISTANCE);
                bucket.set_distance_word(word.with_distance(probe_length));
            }
        }
        if probe_length > self.max_search_distance {
            self.max_search_distance = probe_length;
        }
    }

    /// Retains only the values for which `f` returns `true`, dropping the
    /// rest in place.
    pub fn retain(&mut self, mut f: impl FnMut(&mut V) -> bool) {
        if self.size == 0 {
            return;
        }
        let mut erased = 0usize;
        for index in 0..self.physical_bins {
            let bucket = self.bucket_ptr(index);
            // SAFETY: The full mask selects exactly the initialized slots;
            // a rejected value is dropped and its control byte cleared in
            // one step.
            unsafe {
                let mut full = bucket.mask_full();
                while full != 0 {
                    let slot = full.trailing_zeros() as usize;
                    full &= full - 1;
                    if !f(&mut *bucket.slot_ptr(slot)) {
                        bucket.slot_ptr(slot).drop_in_place();
                        bucket.set_ctrl(slot, Ctrl::EMPTY);
                        erased += 1;
                    }
                }
            }
        }
        if erased != 0 {
            self.size -= erased;
            self.bump_generation();
            for _ in 0..erased {
                self.telemetry.record_erase();
            }
        }
    }

    /// Returns an iterator over all values in the table.
    ///
    /// The iteration order is unspecified and changes on rehash.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            bucket: self.bucket_ptr(0),
            slot: 0,
            #[cfg(feature = "generations")]
            generation_ptr: self.generation_ptr(),
            // SAFETY: The generation byte is readable for the table's
            // lifetime.
            #[cfg(feature = "generations")]
            generation: unsafe { *self.generation_ptr() },
            _marker: PhantomData,
        }
    }

    /// Returns an iterator that removes and yields all values.
    ///
    /// The table is emptied up front; `mem::forget`ting the iterator leaks
    /// the unyielded values but leaves the table in a valid empty state.
    pub fn drain(&mut self) -> Drain<'_, V> {
        let total_slots = if self.is_allocated() {
            self.physical_bins * SLOTS_PER_BUCKET
        } else {
            0
        };

        let mut occupied = Box::new_uninit_slice(total_slots);
        if total_slots != 0 {
            // SAFETY: The snapshot copies each bucket's control bytes, and
            // the table's own metadata is then reset, so a leaked iterator
            // cannot cause a double drop.
            unsafe {
                for index in 0..self.physical_bins {
                    core::ptr::copy_nonoverlapping(
                        self.bucket_ptr(index).metadata(),
                        occupied
                            .as_mut_ptr()
                            .cast::<u8>()
                            .add(index * SLOTS_PER_BUCKET),
                        SLOTS_PER_BUCKET,
                    );
                }
                self.reset_metadata();
            }
            self.growth_left = growth_capacity(self.logical_bins);
            self.max_search_distance = 0;
            self.bump_generation();
        }
        // SAFETY: Either zero-length or fully written above.
        let occupied = unsafe { occupied.assume_init() };

        self.size = 0;
        #[cfg(feature = "generations")]
        {
            self.reserved_growth = 0;
        }
        self.telemetry.record_clear();

        Drain {
            occupied,
            index: 0,
            table: self,
        }
    }
}

impl<V> Drop for HashTable<V> {
    fn drop(&mut self) {
        // SAFETY: Control bytes accurately describe initialization, and the
        // allocation is released exactly once.
        unsafe {
            self.drop_slots();
            if self.is_allocated() {
                alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
            }
        }
        self.telemetry.unregister();
    }
}

impl<V> Clone for HashTable<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        let mut new_table = Self::new();
        new_table.telemetry = self.telemetry;
        new_table.telemetry.register();
        if !self.is_allocated() {
            return new_table;
        }

        new_table.install_storage(self.logical_bins);
        new_table.size = self.size;
        new_table.growth_left = self.growth_left;
        new_table.max_search_distance = self.max_search_distance;

        // SAFETY: Both arrays share the same geometry. Distance words are
        // copied wholesale; each control byte is set only after its slot's
        // clone lands, so a panicking clone drops only initialized slots.
        unsafe {
            for index in 0..self.physical_bins {
                let src = self.bucket_ptr(index);
                let dst = new_table.bucket_ptr(index);
                dst.set_distance_word(src.distance_word());
                let mut full = src.mask_full();
                while full != 0 {
                    let slot = full.trailing_zeros() as usize;
                    full &= full - 1;
                    dst.slot_ptr(slot).write((*src.slot_ptr(slot)).clone());
                    dst.set_ctrl(slot, src.ctrl(slot));
                }
            }
        }

        new_table
    }
}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use alloc::format;
        use alloc::string::String;

        if !self.is_allocated() {
            return f
                .debug_struct("HashTable")
                .field("metadata", &"empty")
                .field("size", &self.size)
                .field("capacity", &self.capacity())
                .finish();
        }

        // SAFETY: Only metadata is read, and only within the live
        // allocation.
        unsafe {
            let buckets: Vec<String> = (0..self.physical_bins)
                .map(|index| {
                    let bucket = self.bucket_ptr(index);
                    let mut cells = Vec::new();
                    for slot in 0..SLOTS_PER_BUCKET {
                        cells.push(format!("{:?}", bucket.ctrl(slot)));
                    }
                    format!("d{} [{}]", bucket.distance_word().distance(), cells.join(" "))
                })
                .collect();
            f.debug_struct("HashTable")
                .field("metadata", &buckets)
                .field("size", &self.size)
                .field("capacity", &self.capacity())
                .field("growth_left", &self.growth_left)
                .finish()
        }
    }
}

/// A view into a single entry in the table, which may be vacant or occupied.
///
/// Constructed from the [`entry`] method on [`HashTable`].
///
/// [`entry`]: HashTable::entry
pub enum Entry<'a, V> {
    /// The value is not present in the table.
    Vacant(VacantEntry<'a, V>),
    /// The value is present in the table.
    Occupied(OccupiedEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Inserts `default` if the entry is vacant; returns a mutable reference
    /// to the value either way.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts the value computed by `default` if the entry is vacant;
    /// returns a mutable reference to the value either way.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Applies `f` to the value if the entry is occupied.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Option<&'a mut V> {
        match self {
            Entry::Occupied(entry) => {
                let value = entry.into_mut();
                f(value);
                Some(value)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Inserts `V::default()` if the entry is vacant; returns a mutable
    /// reference to the value either way.
    pub fn or_default(self) -> &'a mut V
    where
        V: Default,
    {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the table.
///
/// The destination slot is already chosen; [`insert`] writes the value and
/// publishes the metadata. Dropping the entry without inserting leaves the
/// table unchanged.
///
/// [`insert`]: VacantEntry::insert
pub struct VacantEntry<'a, V> {
    table: &'a mut HashTable<V>,
    hash: u64,
    bucket_index: usize,
    slot: usize,
    probe_length: usize,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value into the vacant slot and returns a mutable reference
    /// to it.
    pub fn insert(self, value: V) -> &'a mut V {
        let table = self.table;
        let bucket = table.bucket_ptr(self.bucket_index);
        // SAFETY: The entry holds an empty in-bounds slot located by
        // `prepare_vacant`, and the exclusive borrow means nothing has
        // touched it since. New values are always marked disordered:
        // nothing guarantees they land in hash order until the next rehash.
        unsafe {
            bucket.set_ctrl(self.slot, Ctrl::disordered(h2(self.hash)));
            bucket.slot_ptr(self.slot).write(value);
        }
        let home = h1(self.hash, table.logical_bins);
        table.note_probe(home, self.probe_length);
        table.size += 1;
        table.growth_left -= 1;
        table.maybe_increment_generation_on_insert();
        table.telemetry.record_insert(self.hash, self.probe_length);
        // SAFETY: Just initialized above.
        unsafe { &mut *bucket.slot_ptr(self.slot) }
    }
}

/// A view into an occupied entry in the table.
pub struct OccupiedEntry<'a, V> {
    table: &'a mut HashTable<V>,
    bucket_index: usize,
    slot: usize,
}

// Safety invariant for OccupiedEntry methods: the entry is only constructed
// from a slot `find_slot` reported full, and the exclusive borrow of the
// table keeps it full, so the slot stays initialized for the entry's
// lifetime.
impl<'a, V> OccupiedEntry<'a, V> {
    /// Gets a reference to the value.
    pub fn get(&self) -> &V {
        // SAFETY: See invariant above.
        unsafe { &*self.table.bucket_ptr(self.bucket_index).slot_ptr(self.slot) }
    }

    /// Gets a mutable reference to the value.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: See invariant above.
        unsafe { &mut *self.table.bucket_ptr(self.bucket_index).slot_ptr(self.slot) }
    }

    /// Converts the entry into a mutable reference with the table's
    /// lifetime.
    pub fn into_mut(self) -> &'a mut V {
        // SAFETY: See invariant above.
        unsafe { &mut *self.table.bucket_ptr(self.bucket_index).slot_ptr(self.slot) }
    }

    /// Removes the value from the table and returns it.
    pub fn remove(self) -> V {
        let bucket = self.table.bucket_ptr(self.bucket_index);
        // SAFETY: See invariant above; the value is read out exactly once
        // and the control byte cleared in the same step.
        let value = unsafe {
            let value = bucket.slot_ptr(self.slot).read();
            bucket.set_ctrl(self.slot, Ctrl::EMPTY);
            value
        };
        self.table.size -= 1;
        self.table.bump_generation();
        self.table.telemetry.record_erase();
        value
    }
}

/// An iterator over the values in a [`HashTable`].
///
/// Created by [`iter`]; yields `&V` in an unspecified order.
///
/// [`iter`]: HashTable::iter
pub struct Iter<'a, V> {
    bucket: BucketPtr<V>,
    slot: usize,
    #[cfg(feature = "generations")]
    generation_ptr: *const u8,
    #[cfg(feature = "generations")]
    generation: u8,
    _marker: PhantomData<&'a V>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        #[cfg(feature = "generations")]
        // SAFETY: The generation byte outlives the borrow the iterator
        // holds.
        if unsafe { *self.generation_ptr } != self.generation {
            panic!(
                "hash table iterator used after a mutation that may have \
                 invalidated it"
            );
        }

        // SAFETY: The iterator's bucket pointer always references a live
        // bucket of the borrowed table (or the shared empty image); the end
        // flag is consulted before advancing.
        unsafe {
            loop {
                if self.slot >= SLOTS_PER_BUCKET {
                    if self.bucket.is_end() {
                        return None;
                    }
                    self.bucket = self.bucket.next();
                    self.slot = 0;
                }
                self.slot += self.bucket.count_leading_empty(self.slot);
                if self.slot < SLOTS_PER_BUCKET {
                    let value = &*self.bucket.slot_ptr(self.slot);
                    self.slot += 1;
                    return Some(value);
                }
            }
        }
    }
}

/// A draining iterator over the values in a [`HashTable`].
///
/// Created by [`drain`]; yields owned values. The table is already empty
/// while the iterator exists.
///
/// [`drain`]: HashTable::drain
pub struct Drain<'a, V> {
    /// Snapshot of the control bytes taken before the table was reset.
    occupied: Box<[u8]>,
    index: usize,
    table: &'a mut HashTable<V>,
}

impl<V> Iterator for Drain<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.occupied.len() {
            let index = self.index;
            self.index += 1;
            if Ctrl::from_bits(self.occupied[index]).is_full() {
                let bucket = self.table.bucket_ptr(index / SLOTS_PER_BUCKET);
                // SAFETY: The snapshot marks this slot as holding a value
                // the reset table no longer claims; it is read out exactly
                // once.
                return Some(unsafe { bucket.slot_ptr(index % SLOTS_PER_BUCKET).read() });
            }
        }
        None
    }
}

impl<V> Drop for Drain<'_, V> {
    fn drop(&mut self) {
        for _ in &mut *self {}
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::hash::Hasher;
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering;

    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn build_hasher(&self) -> SipHasher {
            SipHasher::new_with_keys(self.k0, self.k1)
        }
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Item {
        key: u64,
        value: i32,
    }

    fn hash_key(state: &HashState, key: u64) -> u64 {
        let mut h = state.build_hasher();
        h.write_u64(key);
        h.finish()
    }

    /// Every full slot in linear order, with its bucket index and value.
    fn live_slots(table: &HashTable<u64>) -> Vec<(usize, Ctrl, u64)> {
        let mut out = Vec::new();
        if !table.is_allocated() {
            return out;
        }
        for index in 0..table.physical_bins {
            let bucket = table.bucket_ptr(index);
            for slot in 0..SLOTS_PER_BUCKET {
                // SAFETY: In-bounds metadata reads; slots read only when
                // their control byte says full.
                unsafe {
                    let ctrl = bucket.ctrl(slot);
                    if ctrl.is_full() {
                        out.push((index, ctrl, *bucket.slot_ptr(slot)));
                    }
                }
            }
        }
        out
    }

    fn metadata_bytes<V>(table: &HashTable<V>) -> Vec<u8> {
        let mut out = Vec::new();
        for index in 0..table.physical_bins {
            let bucket = table.bucket_ptr(index);
            for offset in 0..SLOTS_PER_BUCKET + 2 {
                // SAFETY: The metadata block is 16 readable bytes.
                out.push(unsafe { *bucket.metadata().add(offset) });
            }
        }
        out
    }

    fn insert_key(table: &mut HashTable<u64>, key: u64) -> bool {
        match table.entry(key, |v| *v == key, |v| *v) {
            Entry::Vacant(vacant) => {
                vacant.insert(key);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..32u64 {
            let hash = hash_key(&state, k);
            match table.entry(hash, |v: &Item| v.key == k, |v| hash_key(&state, v.key)) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: (k as i32) * 2,
                    });
                }
                Entry::Occupied(_) => panic!("unexpected occupied on first insert: {:#?}", table),
            }
        }
        assert_eq!(table.len(), 32);
        for k in 0..32u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: (k as i32) * 2
                }),
                "{:#?}",
                table
            );
        }

        let miss_hash = hash_key(&state, 999);
        assert!(table.find(miss_hash, |v| v.key == 999).is_none());
    }

    #[test]
    fn duplicate_entry_is_occupied() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        let k = 42u64;
        let hash = hash_key(&state, k);

        match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
            Entry::Vacant(v) => {
                v.insert(Item { key: k, value: 7 });
            }
            Entry::Occupied(_) => panic!("should be vacant first time"),
        }
        let size_after_first = table.len();

        match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
            Entry::Occupied(mut occ) => {
                assert_eq!(occ.get().value, 7);
                *occ.get_mut() = Item { key: k, value: 11 };
            }
            Entry::Vacant(_) => panic!("should be occupied: {:#?}", table),
        }
        assert_eq!(table.len(), size_after_first);
        assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 11);
    }

    #[test]
    fn find_mut_and_modify() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
                Entry::Vacant(v) => {
                    v.insert(Item { key: k, value: 1 });
                }
                _ => unreachable!(),
            }
        }

        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            if let Some(v) = table.find_mut(hash, |v| v.key == k) {
                v.value += 9;
            }
        }
        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 10);
        }
    }

    #[test]
    fn remove_items() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..8u64 {
            let hash = hash_key(&state, k);
            match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(table.len(), 8);
        let growth_before = table.growth_left;

        for k in [0u64, 3, 7] {
            let hash = hash_key(&state, k);
            let removed = table.remove(hash, |v| v.key == k).expect("should remove");
            assert_eq!(removed.key, k);
        }
        assert_eq!(table.len(), 5);
        // Erases are not returned to the insert budget.
        assert_eq!(table.growth_left, growth_before);

        let hash = hash_key(&state, 1000);
        assert!(table.remove(hash, |v| v.key == 1000).is_none());
    }

    #[test]
    fn erase_touches_only_the_target_control_byte() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..40u64 {
            let hash = hash_key(&state, k);
            match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                _ => unreachable!(),
            }
        }

        let before = metadata_bytes(&table);
        let hash = hash_key(&state, 17);
        table.remove(hash, |v| v.key == 17).unwrap();
        let after = metadata_bytes(&table);

        let changed: Vec<usize> = before
            .iter()
            .zip(after.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(changed.len(), 1, "exactly one control byte changes");
        assert_eq!(after[changed[0]], Ctrl::EMPTY.bits());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..10000u64 {
            let hash = hash_key(&state, k);
            match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                _ => unreachable!(),
            }
        }

        assert_eq!(table.len(), 10000);
        for k in 0..10000u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: k as i32
                })
            );
        }
        for k in 10000..12000u64 {
            let hash = hash_key(&state, k);
            assert!(table.find(hash, |v| v.key == k).is_none());
        }
    }

    #[test]
    fn colliding_hashes_are_disambiguated_by_eq() {
        // Every value shares hash zero, so every lookup walks the same
        // probe chain and relies on the predicate to pick the right slot.
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..65u64 {
            match table.entry(0, |v| v.key == k, |_| 0) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                _ => unreachable!(),
            }
        }

        assert_eq!(table.len(), 65);
        for k in 0..65u64 {
            assert_eq!(
                table.find(0, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: k as i32
                }),
                "{:#?}",
                table
            );
        }
    }

    #[test]
    fn colliding_tags_with_differing_keys() {
        // 1 and 128 share H2 (both 1 mod 127) and, in a small table, the
        // home bucket; the equality check must tell them apart.
        let mut table: HashTable<u64> = HashTable::new();
        assert!(insert_key(&mut table, 1));
        assert!(insert_key(&mut table, 128));
        assert_eq!(table.find(1, |v| *v == 1), Some(&1));
        assert_eq!(table.find(128, |v| *v == 128), Some(&128));
        assert!(table.find(1, |v| *v == 999).is_none());
    }

    #[test]
    fn one_bucket_table_fills_completely() {
        let mut table: HashTable<u64> = HashTable::with_capacity(14);
        assert_eq!(table.capacity(), 14);
        for k in 0..14u64 {
            assert!(insert_key(&mut table, k));
        }
        assert_eq!(table.len(), 14);
        assert_eq!(table.capacity(), 14);

        for (index, ctrl, _) in live_slots(&table) {
            assert_eq!(index, 0);
            assert!(ctrl.is_disordered(), "fresh inserts are disordered");
        }
        // Nothing probed past its home bucket.
        for index in 0..table.physical_bins {
            // SAFETY: In-bounds metadata read.
            let distance = unsafe { table.bucket_ptr(index).distance_word().distance() };
            assert_eq!(distance, 0);
        }

        table.rehash_to(0, |v| *v);
        assert_eq!(table.len(), 14);
        assert_eq!(table.capacity(), 14);
        let mut previous = None;
        for (_, ctrl, value) in live_slots(&table) {
            assert!(!ctrl.is_disordered(), "rehash clears disordered marks");
            assert!(previous <= Some(value));
            previous = Some(value);
        }
        for k in 0..14u64 {
            assert!(table.find(k, |v| *v == k).is_some());
        }
    }

    #[test]
    fn round_trip_thousand_keys() {
        let mut table: HashTable<u64> = HashTable::new();
        for k in 0..1000u64 {
            assert!(insert_key(&mut table, k));
        }
        for k in 0..1000u64 {
            assert!(table.find(k, |v| *v == k).is_some(), "missing {k}");
        }
        for k in 1000..2000u64 {
            assert!(table.find(k, |v| *v == k).is_none(), "phantom {k}");
        }
    }

    #[test]
    fn erase_odd_keys_then_iterate() {
        let mut table: HashTable<u64> = HashTable::new();
        for k in 0..100u64 {
            assert!(insert_key(&mut table, k));
        }
        let growth_before = table.growth_left;
        for k in (1..100u64).step_by(2) {
            assert!(table.remove(k, |v| *v == k).is_some());
        }
        assert_eq!(table.len(), 50);
        assert_eq!(table.growth_left, growth_before);

        let mut seen: Vec<u64> = table.iter().copied().collect();
        seen.sort_unstable();
        let expected: Vec<u64> = (0..100).step_by(2).collect();
        assert_eq!(seen, expected);

        for k in (1..100u64).step_by(2) {
            assert!(table.find(k, |v| *v == k).is_none());
        }
    }

    #[test]
    fn rehash_restores_hash_order() {
        let mut table: HashTable<u64> = HashTable::new();
        for k in 0..100u64 {
            assert!(insert_key(&mut table, k));
        }
        table.rehash_to(0, |v| *v);

        let mut previous_ordered = None;
        for (index, ctrl, value) in live_slots(&table) {
            let home = h1(value, table.logical_bins);
            if ctrl.is_disordered() {
                assert!(index < home, "only wrapped entries stay disordered");
            } else {
                assert!(
                    previous_ordered <= Some(value),
                    "ordered slots nondecreasing: {:#?}",
                    table
                );
                previous_ordered = Some(value);
            }
        }
        for k in 0..100u64 {
            assert!(table.find(k, |v| *v == k).is_some());
        }
    }

    #[test]
    fn wrap_around_lands_disordered_but_findable() {
        let mut table: HashTable<u64> = HashTable::with_capacity(100);
        let last_bucket_keys: Vec<u64> = (0..50).map(|i| u64::MAX - i).collect();
        for &k in &last_bucket_keys {
            assert!(insert_key(&mut table, k));
        }

        // Everything hashes to the final logical bucket, so the tail pad
        // overflows and some entries wrap to the front of the array.
        let slots = live_slots(&table);
        assert!(
            slots.iter().any(|(index, _, value)| {
                *index < h1(*value, table.logical_bins)
            }),
            "expected wrapped placements: {:#?}",
            table
        );

        for &k in &last_bucket_keys {
            assert_eq!(table.find(k, |v| *v == k), Some(&k));
        }

        table.rehash_to(0, |v| *v);
        for (index, ctrl, value) in live_slots(&table) {
            if ctrl.is_disordered() {
                assert!(index < h1(value, table.logical_bins));
            }
        }
        for &k in &last_bucket_keys {
            assert_eq!(table.find(k, |v| *v == k), Some(&k));
        }
    }

    #[test]
    fn growth_rehash_lands_at_rehashed_load() {
        let mut table: HashTable<u64> = HashTable::new();
        let mut k = 0u64;
        // Fill until the next insert must rehash.
        loop {
            if table.growth_left == 0 && table.capacity() > SLOTS_PER_BUCKET {
                break;
            }
            assert!(insert_key(&mut table, k));
            k += 1;
        }

        assert!(insert_key(&mut table, k));
        assert!(
            table.len() * REHASHED_UTILIZATION_DEN
                <= table.capacity() * REHASHED_UTILIZATION_NUM,
            "size {} capacity {}",
            table.len(),
            table.capacity()
        );
        // And the trigger point respected the full-utilization bound.
        assert!(table.len() <= table.capacity() * FULL_UTILIZATION_NUM / FULL_UTILIZATION_DEN);
    }

    struct CountingSink {
        storage_changes: AtomicUsize,
        rehashes: AtomicUsize,
        inserts: AtomicUsize,
        registered: AtomicUsize,
    }

    impl CountingSink {
        const fn new() -> Self {
            CountingSink {
                storage_changes: AtomicUsize::new(0),
                rehashes: AtomicUsize::new(0),
                inserts: AtomicUsize::new(0),
                registered: AtomicUsize::new(0),
            }
        }
    }

    impl Telemetry for CountingSink {
        fn register(&self) {
            self.registered.fetch_add(1, Ordering::Relaxed);
        }

        fn unregister(&self) {
            self.registered.fetch_sub(1, Ordering::Relaxed);
        }

        fn record_insert(&self, _hash: u64, _probe_length: usize) {
            self.inserts.fetch_add(1, Ordering::Relaxed);
        }

        fn record_rehash(&self, _total_probe_length: usize) {
            self.rehashes.fetch_add(1, Ordering::Relaxed);
        }

        fn record_storage_changed(&self, _size: usize, _capacity: usize) {
            self.storage_changes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn reserve_provides_an_exact_insert_budget() {
        static SINK: CountingSink = CountingSink::new();

        let mut table: HashTable<u64> = HashTable::new();
        table.set_telemetry(&SINK);
        table.reserve(256, |v| *v);
        assert_eq!(table.growth_left, 256);

        for k in 0..200u64 {
            assert!(insert_key(&mut table, k));
        }
        assert_eq!(table.len(), 200);
        assert_eq!(table.growth_left, 56);
        // One allocation from the reservation, and no rehash since.
        assert_eq!(SINK.storage_changes.load(Ordering::Relaxed), 1);
        assert_eq!(SINK.rehashes.load(Ordering::Relaxed), 0);
        assert_eq!(SINK.inserts.load(Ordering::Relaxed), 200);

        drop(table);
        assert_eq!(SINK.registered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn empty_table_find_does_not_allocate() {
        let table: HashTable<u64> = HashTable::new();
        assert!(table.find(12345, |v| *v == 12345).is_none());
        assert!(!table.is_allocated());
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn clear_reuses_small_arrays_and_releases_large_ones() {
        let mut table: HashTable<u64> = HashTable::new();
        for k in 0..20u64 {
            assert!(insert_key(&mut table, k));
        }
        let capacity = table.capacity();
        assert!(capacity <= CLEAR_REUSE_MAX_SLOTS);
        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), capacity, "small arrays are kept");
        assert!(insert_key(&mut table, 7));

        let mut table: HashTable<u64> = HashTable::new();
        for k in 0..500u64 {
            assert!(insert_key(&mut table, k));
        }
        assert!(table.capacity() > CLEAR_REUSE_MAX_SLOTS);
        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), 0, "large arrays are released");
        assert!(table.find(3, |v| *v == 3).is_none());
    }

    #[test]
    fn rehash_to_zero_on_empty_table_releases_storage() {
        let mut table: HashTable<u64> = HashTable::new();
        table.rehash_to(0, |v| *v);
        assert!(!table.is_allocated());

        for k in 0..10u64 {
            assert!(insert_key(&mut table, k));
        }
        for k in 0..10u64 {
            table.remove(k, |v| *v == k);
        }
        table.rehash_to(0, |v| *v);
        assert!(!table.is_allocated());
        assert_eq!(table.capacity(), 0);
    }

    #[test]
    fn drain_yields_everything_and_empties() {
        let mut table: HashTable<u64> = HashTable::new();
        for k in 10..30u64 {
            assert!(insert_key(&mut table, k));
        }

        let mut drained: Vec<u64> = table.drain().collect();
        drained.sort_unstable();
        assert_eq!(drained, (10..30u64).collect::<Vec<_>>());
        assert_eq!(table.len(), 0);
        for k in 10..30u64 {
            assert!(table.find(k, |v| *v == k).is_none());
        }
        assert!(insert_key(&mut table, 99));
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct StringItem {
        key: String,
        value: i32,
    }

    fn hash_string_key(state: &HashState, key: &str) -> u64 {
        let mut h = state.build_hasher();
        h.write(key.as_bytes());
        h.finish()
    }

    #[test]
    fn owned_values_clone_and_drop_cleanly() {
        let state = HashState::default();
        let mut table: HashTable<StringItem> = HashTable::new();
        let keys = ["hello", "world", "foo", "bar", "baz"];

        for (i, k) in keys.iter().enumerate() {
            let hash = hash_string_key(&state, k);
            match table.entry(
                hash,
                |v: &StringItem| v.key == *k,
                |v| hash_string_key(&state, &v.key),
            ) {
                Entry::Vacant(v) => {
                    v.insert(StringItem {
                        key: k.to_string(),
                        value: i as i32,
                    });
                }
                Entry::Occupied(_) => panic!("unexpected occupied on first insert"),
            }
        }

        let copy = table.clone();
        assert_eq!(copy.len(), keys.len());
        for (i, k) in keys.iter().enumerate() {
            let hash = hash_string_key(&state, k);
            assert_eq!(
                copy.find(hash, |v| v.key == *k),
                Some(&StringItem {
                    key: k.to_string(),
                    value: i as i32
                })
            );
        }

        drop(table);
        let hash = hash_string_key(&state, "hello");
        assert!(copy.find(hash, |v| v.key == "hello").is_some());
    }

    #[test]
    fn occupied_entry_remove() {
        let mut table: HashTable<u64> = HashTable::new();
        for k in 0..10u64 {
            assert!(insert_key(&mut table, k));
        }
        match table.entry(4, |v| *v == 4, |v| *v) {
            Entry::Occupied(occ) => assert_eq!(occ.remove(), 4),
            Entry::Vacant(_) => panic!("expected occupied"),
        }
        assert_eq!(table.len(), 9);
        assert!(table.find(4, |v| *v == 4).is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn randomized_churn_stays_consistent() {
        let state = HashState::default();
        let mut table: HashTable<u64> = HashTable::new();
        let mut live = Vec::new();

        for round in 0..2000u64 {
            let key = round % 512;
            let hash = hash_key(&state, key);
            if round % 3 == 0 && table.remove(hash, |v| *v == key).is_some() {
                live.retain(|&k| k != key);
            } else {
                match table.entry(hash, |v| *v == key, |v| hash_key(&state, *v)) {
                    Entry::Vacant(v) => {
                        v.insert(key);
                        live.push(key);
                    }
                    Entry::Occupied(_) => {}
                }
            }
        }

        assert_eq!(table.len(), live.len());
        for &key in &live {
            let hash = hash_key(&state, key);
            assert_eq!(table.find(hash, |v| *v == key), Some(&key));
        }
    }

    #[cfg(feature = "generations")]
    #[test]
    fn mutations_bump_the_generation() {
        let mut table: HashTable<u64> = HashTable::new();
        assert!(insert_key(&mut table, 1));
        // SAFETY: Reading our own generation byte.
        let before = unsafe { *table.generation_ptr() };
        assert!(insert_key(&mut table, 2));
        let after_insert = unsafe { *table.generation_ptr() };
        assert_ne!(before, after_insert);

        table.remove(1, |v| *v == 1).unwrap();
        let after_remove = unsafe { *table.generation_ptr() };
        assert_ne!(after_insert, after_remove);

        table.clear();
        let after_clear = unsafe { *table.generation_ptr() };
        assert_ne!(after_remove, after_clear);
    }

    #[cfg(feature = "generations")]
    #[test]
    fn reserved_growth_defers_generation_bumps() {
        let mut table: HashTable<u64> = HashTable::new();
        table.reserve(64, |v| *v);
        let before = unsafe { *table.generation_ptr() };
        for k in 0..32u64 {
            assert!(insert_key(&mut table, k));
        }
        // Inserts covered by the reservation are guaranteed not to
        // invalidate anything, so the generation stays put.
        let after = unsafe { *table.generation_ptr() };
        assert_eq!(before, after);
    }
}
