//! StripeMap: a concurrent linear-probing hash map sharded across spinlock stripes.
//!
//! Keys and values live inline in a power-of-two slot array. Every mutation hashes its
//! key, locks the stripe that owns the target bucket, re-checks the table generation and
//! probes linearly from there; erased slots stay behind as tombstones until a resize or a
//! full clear drops them. When an insert exhausts its probe budget the table grows by one
//! hashpower under a whole-table lock rendezvous, migrating slots on parallel worker
//! threads and swapping the entire bucket array in one step.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::hash::{BuildHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::panic;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use ahash::RandomState;
use thiserror::Error;

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Default hashpower: new tables start with 2^16 buckets.
const DEFAULT_HASHPOWER: usize = 16;

/// Upper bound on the number of lock stripes in a single stripe set.
const MAX_NUM_STRIPES: usize = 1 << 16;

/// Default cap on the extra worker threads one resize may spawn.
const DEFAULT_MAX_WORKER_THREADS: usize = 8;

/// `shrink` keeps halving the table while the load factor stays at or below this.
const SHRINK_LOAD_FACTOR: f64 = 0.25;

// ================================================================================================
// ERRORS
// ================================================================================================

/// Error returned by [`StripeMap::find`] when the key is not present.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("key not found")]
pub struct KeyNotFound;

// ================================================================================================
// LOCK STRIPES
// ================================================================================================

/// One lock stripe: a test-and-test-and-set spinlock plus the element count for the
/// buckets it guards. Cache-line aligned so neighboring stripes do not false-share.
#[repr(align(64))]
struct Stripe {
    locked: AtomicBool,
    elems: AtomicI64,
}

impl Stripe {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            elems: AtomicI64::new(0),
        }
    }

    /// Spin until the stripe is acquired.
    #[inline(always)]
    fn lock(&self) {
        loop {
            if self.try_lock() {
                return;
            }
            // Test phase: spin on a relaxed load so the line stays shared until release.
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::AcqRel)
    }

    #[inline(always)]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Current element count. Only written while the stripe is held, so relaxed reads
    /// suffice for the (non-linearizable) `len` sum.
    #[inline(always)]
    fn elem_count(&self) -> i64 {
        self.elems.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn add_elems(&self, delta: i64) {
        self.elems.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline(always)]
    fn set_elems(&self, count: i64) {
        self.elems.store(count, Ordering::Relaxed);
    }
}

/// The stripes guarding one generation of the bucket array. Bucket `i` belongs to stripe
/// `i & (stripes.len() - 1)`. Sets form an append-only chain: a resize that needs more
/// stripes links a longer set through `next`, and old sets are kept alive until the map
/// drops so that a thread which sampled an older set can still finish unlocking it.
struct StripeSet {
    stripes: Box<[Stripe]>,
    next: AtomicPtr<StripeSet>,
}

impl StripeSet {
    fn with_len(len: usize) -> Box<Self> {
        let stripes: Vec<Stripe> = (0..len).map(|_| Stripe::new()).collect();
        Box::new(Self {
            stripes: stripes.into_boxed_slice(),
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    #[inline(always)]
    fn stripe_for(&self, bucket: usize) -> &Stripe {
        &self.stripes[bucket & (self.stripes.len() - 1)]
    }
}

/// Stripe count for a table of `bucket_count` buckets.
#[inline(always)]
fn stripe_count_for(bucket_count: usize) -> usize {
    bucket_count.clamp(1, MAX_NUM_STRIPES)
}

/// Holds one locked stripe; releases it on drop.
struct StripeGuard<'a> {
    stripe: &'a Stripe,
}

impl<'a> StripeGuard<'a> {
    #[inline(always)]
    fn stripe(&self) -> &'a Stripe {
        self.stripe
    }
}

impl Drop for StripeGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.stripe.unlock();
    }
}

/// Holds every stripe in every set from `first_locked` to the end of the chain,
/// including sets appended while the guard was held. Unlocks all of them on drop.
struct FullLockGuard<'a> {
    first_locked: &'a StripeSet,
}

impl Drop for FullLockGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.first_locked;
        loop {
            for stripe in set.stripes.iter() {
                stripe.unlock();
            }
            let next = set.next.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            set = unsafe { &*next };
        }
    }
}

// ================================================================================================
// BUCKET STORAGE
// ================================================================================================

/// One bucket slot. The key/value pair is initialized exactly while
/// `occupied && !deleted`; `occupied && deleted` is a tombstone (pair dropped, slot
/// reusable, still costs a probe step); `hash` caches the key's full hash while the slot
/// is occupied so probes can reject mismatches without touching the key.
struct Slot<K, V> {
    hash: u64,
    occupied: bool,
    deleted: bool,
    key: MaybeUninit<K>,
    val: MaybeUninit<V>,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Self {
            hash: 0,
            occupied: false,
            deleted: false,
            key: MaybeUninit::uninit(),
            val: MaybeUninit::uninit(),
        }
    }

    #[inline(always)]
    fn is_live(&self) -> bool {
        self.occupied && !self.deleted
    }

    #[inline(always)]
    fn key(&self) -> &K {
        unsafe { self.key.assume_init_ref() }
    }

    #[inline(always)]
    fn val(&self) -> &V {
        unsafe { self.val.assume_init_ref() }
    }

    #[inline(always)]
    fn val_mut(&mut self) -> &mut V {
        unsafe { self.val.assume_init_mut() }
    }

    /// Store a pair into an empty or tombstone slot. The flags are published last so a
    /// panic while moving user types in leaves the slot observably empty.
    fn set_kv(&mut self, hash: u64, key: K, val: V) {
        debug_assert!(!self.occupied || self.deleted);
        self.key.write(key);
        self.val.write(val);
        self.hash = hash;
        self.occupied = true;
        self.deleted = false;
    }

    /// Turn a live slot into a tombstone, dropping the pair in place.
    fn erase_kv(&mut self) {
        debug_assert!(self.is_live());
        self.deleted = true;
        unsafe {
            ptr::drop_in_place(self.key.as_mut_ptr());
            ptr::drop_in_place(self.val.as_mut_ptr());
        }
    }

    /// Move the pair out for migration and reset the slot to empty, so tearing down the
    /// retired array cannot drop the pair a second time.
    fn take_kv(&mut self) -> (K, V) {
        debug_assert!(self.is_live());
        self.occupied = false;
        self.deleted = false;
        unsafe { (self.key.as_ptr().read(), self.val.as_ptr().read()) }
    }
}

/// Fixed-size power-of-two slot array. Its identity (slot pointer plus hashpower) only
/// changes under the full-table lock; `hashpower` doubles as the generation tag that
/// in-flight operations re-check after acquiring a stripe.
struct BucketArray<K, V> {
    hashpower: AtomicUsize,
    slots: AtomicPtr<Slot<K, V>>,
    _marker: PhantomData<Box<Slot<K, V>>>,
}

impl<K, V> BucketArray<K, V> {
    fn with_hashpower(hashpower: usize) -> Self {
        Self {
            hashpower: AtomicUsize::new(hashpower),
            slots: AtomicPtr::new(Self::alloc_slots(1usize << hashpower)),
            _marker: PhantomData,
        }
    }

    fn alloc_slots(len: usize) -> *mut Slot<K, V> {
        let layout = Layout::array::<Slot<K, V>>(len).unwrap();
        let slots = unsafe { alloc(layout) as *mut Slot<K, V> };
        if slots.is_null() {
            handle_alloc_error(layout);
        }
        for i in 0..len {
            unsafe {
                ptr::write(slots.add(i), Slot::empty());
            }
        }
        slots
    }

    fn dealloc_slots(slots: *mut Slot<K, V>, len: usize) {
        let layout = Layout::array::<Slot<K, V>>(len).unwrap();
        unsafe {
            dealloc(slots as *mut u8, layout);
        }
    }

    #[inline(always)]
    fn hashpower(&self) -> usize {
        self.hashpower.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn bucket_count(&self) -> usize {
        1usize << self.hashpower()
    }

    #[inline(always)]
    fn slot(&self, index: usize) -> &Slot<K, V> {
        unsafe { &*self.slots.load(Ordering::Acquire).add(index) }
    }

    /// Callers must hold the stripe that owns `index`, or the full-table lock.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn slot_mut(&self, index: usize) -> &mut Slot<K, V> {
        unsafe { &mut *self.slots.load(Ordering::Acquire).add(index) }
    }

    /// Drop every live pair and reset all slots to empty. Requires the full-table lock.
    fn clear(&self) {
        for i in 0..self.bucket_count() {
            let slot = self.slot_mut(i);
            if slot.is_live() {
                slot.erase_kv();
            }
            slot.occupied = false;
            slot.deleted = false;
        }
    }

    /// Exchange storage identity with `other`. Requires the full-table lock on the map
    /// that owns `self`; the release stores publish the new generation to waiters.
    fn swap_with(&self, other: &BucketArray<K, V>) {
        let hp = self.hashpower.load(Ordering::Relaxed);
        let slots = self.slots.load(Ordering::Relaxed);
        let other_hp = other.hashpower.load(Ordering::Relaxed);
        let other_slots = other.slots.load(Ordering::Relaxed);
        other.slots.store(slots, Ordering::Relaxed);
        other.hashpower.store(hp, Ordering::Relaxed);
        self.slots.store(other_slots, Ordering::Release);
        self.hashpower.store(other_hp, Ordering::Release);
    }

    /// Drop all pairs, release the backing allocation and fall back to a hashpower-0
    /// array, keeping the map usable. Requires the full-table lock.
    fn free_and_reset(&self) {
        self.clear();
        let len = self.bucket_count();
        let old = self.slots.load(Ordering::Relaxed);
        self.slots.store(Self::alloc_slots(1), Ordering::Release);
        self.hashpower.store(0, Ordering::Release);
        Self::dealloc_slots(old, len);
    }
}

impl<K, V> Drop for BucketArray<K, V> {
    fn drop(&mut self) {
        self.clear();
        let len = self.bucket_count();
        Self::dealloc_slots(self.slots.load(Ordering::Relaxed), len);
    }
}

// ================================================================================================
// MAIN STRIPEMAP STRUCTURE
// ================================================================================================

/// Concurrent hash map with striped spinlocks, inline slot storage and tombstone
/// deletion. All operations take `&self` and are safe to call from many threads.
pub struct StripeMap<K, V, S: BuildHasher = RandomState> {
    buckets: BucketArray<K, V>,
    /// Oldest stripe set; newer sets are chained through `StripeSet::next` and freed only
    /// when the map drops.
    lock_history: AtomicPtr<StripeSet>,
    /// Newest stripe set, the one fast-path operations sample.
    current_stripes: AtomicPtr<StripeSet>,
    max_worker_threads: AtomicUsize,
    expansions: AtomicU64,
    shrinks: AtomicU64,
    clears: AtomicU64,
    hasher: S,
}

// SAFETY: keys and values are only reached through the stripe locks (or the full-table
// lock), and migration moves them between threads, so sharing the map requires K and V to
// be Send + Sync and handing it off requires them to be Send.
unsafe impl<K: Send, V: Send, S: Send + BuildHasher> Send for StripeMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync + BuildHasher> Sync for StripeMap<K, V, S> {}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl<K: Eq + Hash, V> StripeMap<K, V, RandomState> {
    /// Create an empty map with the default hashpower (2^16 buckets).
    pub fn new() -> Self {
        Self::with_hashpower(DEFAULT_HASHPOWER)
    }

    /// Create an empty map with `1 << hashpower` buckets.
    pub fn with_hashpower(hashpower: usize) -> Self {
        Self::with_hashpower_and_hasher(hashpower, RandomState::new())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> StripeMap<K, V, S> {
    /// Create an empty map with the default hashpower and the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_hashpower_and_hasher(DEFAULT_HASHPOWER, hasher)
    }

    /// Create an empty map with `1 << hashpower` buckets and the given hasher.
    pub fn with_hashpower_and_hasher(hashpower: usize, hasher: S) -> Self {
        let buckets = BucketArray::with_hashpower(hashpower);
        let stripes = Box::into_raw(StripeSet::with_len(stripe_count_for(buckets.bucket_count())));
        Self {
            buckets,
            lock_history: AtomicPtr::new(stripes),
            current_stripes: AtomicPtr::new(stripes),
            max_worker_threads: AtomicUsize::new(DEFAULT_MAX_WORKER_THREADS),
            expansions: AtomicU64::new(0),
            shrinks: AtomicU64::new(0),
            clears: AtomicU64::new(0),
            hasher,
        }
    }
}

// ================================================================================================
// SIZE, OBSERVABILITY AND WHOLE-TABLE OPERATIONS
// ================================================================================================

impl<K, V, S: BuildHasher> StripeMap<K, V, S> {
    /// log2 of the bucket count; also the generation tag bumped by every resize.
    pub fn hashpower(&self) -> usize {
        self.buckets.hashpower()
    }

    /// Number of buckets in the table.
    pub fn bucket_count(&self) -> usize {
        self.buckets.bucket_count()
    }

    /// Number of elements the table can hold.
    pub fn capacity(&self) -> usize {
        self.bucket_count()
    }

    /// Number of elements, summed over the per-stripe counters. Not linearizable with
    /// concurrent mutations, but exact whenever the table is quiescent.
    pub fn len(&self) -> usize {
        let mut total: i64 = 0;
        for stripe in self.current_set().stripes.iter() {
            total += stripe.elem_count();
        }
        total.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current load factor (`len / capacity`).
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    /// Cap on the extra worker threads a resize may spawn.
    pub fn max_worker_threads(&self) -> usize {
        self.max_worker_threads.load(Ordering::Acquire)
    }

    pub fn set_max_worker_threads(&self, extra_threads: usize) {
        self.max_worker_threads.store(extra_threads, Ordering::Release);
    }

    /// Borrow the hasher.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Remove every element. Capacity is retained; per-stripe counters reset to zero.
    pub fn clear(&self) {
        let _guard = self.lock_all();
        self.clears.fetch_add(1, Ordering::Relaxed);
        self.buckets.clear();
        self.reset_counters();
    }

    /// Remove every element and release the bucket storage, leaving a minimal
    /// (hashpower 0) table behind.
    pub fn clear_and_free(&self) {
        let _guard = self.lock_all();
        self.clears.fetch_add(1, Ordering::Relaxed);
        self.buckets.free_and_reset();
        self.reset_counters();
    }

    /// Lock the whole table and return a handle for iteration and snapshot lookups.
    /// No other operation on the map makes progress while the handle exists.
    pub fn lock_table(&self) -> LockedTable<'_, K, V, S> {
        LockedTable {
            map: self,
            _guard: self.lock_all(),
        }
    }

    /// Human-readable counters as a JSON object string.
    pub fn stat(&self) -> String {
        format!(
            "{{\"size\":{},\"capacity\":{},\"hashpower\":{},\"expansions\":{},\"shrinks\":{},\"clears\":{}}}",
            self.len(),
            self.capacity(),
            self.hashpower(),
            self.expansions.load(Ordering::Relaxed),
            self.shrinks.load(Ordering::Relaxed),
            self.clears.load(Ordering::Relaxed),
        )
    }

    /// Approximate memory footprint in bytes: every stripe in every historical set plus
    /// the live bucket array.
    pub fn footprint(&self) -> usize {
        let mut stripes = 0usize;
        let mut node = self.lock_history.load(Ordering::Acquire);
        while !node.is_null() {
            let set = unsafe { &*node };
            stripes += set.stripes.len();
            node = set.next.load(Ordering::Acquire);
        }
        stripes * std::mem::size_of::<Stripe>()
            + self.bucket_count() * std::mem::size_of::<Slot<K, V>>()
    }

    #[inline(always)]
    fn current_set(&self) -> &StripeSet {
        unsafe { &*self.current_stripes.load(Ordering::Acquire) }
    }

    /// Lock every stripe in every set from the current one to the end of the chain.
    /// Appends happen only while this guard is held, so walking forward from the set
    /// that was current on entry blocks all future fast-path operations.
    fn lock_all(&self) -> FullLockGuard<'_> {
        let first_locked = self.current_set();
        let mut set = first_locked;
        loop {
            for stripe in set.stripes.iter() {
                stripe.lock();
            }
            let next = set.next.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            set = unsafe { &*next };
        }
        FullLockGuard { first_locked }
    }

    /// Zero every counter in the current stripe set. Requires the full-table lock.
    fn reset_counters(&self) {
        for stripe in self.current_set().stripes.iter() {
            stripe.set_elems(0);
        }
    }
}

// ================================================================================================
// LOOKUP, UPDATE AND ERASE
// ================================================================================================

impl<K, V, S> StripeMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Return a clone of the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let mut out = None;
        self.find_fn(key, |v| out = Some(v.clone()));
        out
    }

    /// Like [`get`](Self::get), but absence is an error.
    pub fn find(&self, key: &K) -> Result<V, KeyNotFound>
    where
        V: Clone,
    {
        self.get(key).ok_or(KeyNotFound)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find_fn(key, |_| {})
    }

    /// Run `f` on the value stored under `key` while its stripe is held.
    /// Returns whether the key was present.
    pub fn find_fn<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&V),
    {
        let hash = self.hashed(key);
        match self.linear_find_loop(key, hash) {
            Some((index, _guard)) => {
                f(self.buckets.slot(index).val());
                true
            }
            None => false,
        }
    }

    /// Replace the value stored under `key`. Returns whether the key was present.
    pub fn update(&self, key: &K, val: V) -> bool {
        self.update_fn(key, |v| *v = val)
    }

    /// Run `f` on the mutable value stored under `key` while its stripe is held.
    /// Returns whether the key was present.
    pub fn update_fn<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let hash = self.hashed(key);
        match self.linear_find_loop(key, hash) {
            Some((index, _guard)) => {
                f(self.buckets.slot_mut(index).val_mut());
                true
            }
            None => false,
        }
    }

    /// Remove `key`. Returns whether it was present.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_fn(key, |_| true)
    }

    /// Remove `key` if `pred` approves of its value. Returns whether the key was present,
    /// independent of `pred`'s verdict.
    pub fn erase_fn<F>(&self, key: &K, pred: F) -> bool
    where
        F: FnOnce(&mut V) -> bool,
    {
        let hash = self.hashed(key);
        match self.linear_find_loop(key, hash) {
            Some((index, guard)) => {
                if pred(self.buckets.slot_mut(index).val_mut()) {
                    self.buckets.slot_mut(index).erase_kv();
                    guard.stripe().add_elems(-1);
                }
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn hashed(&self, key: &K) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    /// Lock the stripe owning `bucket`. Returns `None` when the table generation moved
    /// past `expected_hp`, in which case the caller restarts from a recomputed index.
    #[inline(always)]
    fn lock_one(&self, expected_hp: usize, bucket: usize) -> Option<StripeGuard<'_>> {
        let stripe = self.current_set().stripe_for(bucket);
        stripe.lock();
        if self.buckets.hashpower() != expected_hp {
            stripe.unlock();
            return None;
        }
        Some(StripeGuard { stripe })
    }

    /// Stripe-locked linear probe for `key`. On a hit, the returned guard is the stripe
    /// protecting the slot and must outlive the caller's access to it.
    fn linear_find_loop(&self, key: &K, hash: u64) -> Option<(usize, StripeGuard<'_>)> {
        'probe: loop {
            let hp = self.buckets.hashpower();
            let mask = (1usize << hp) - 1;
            let mut ind = (hash as usize) & mask;
            let mut step = 0;
            loop {
                let guard = match self.lock_one(hp, ind) {
                    Some(guard) => guard,
                    None => continue 'probe,
                };
                let slot = self.buckets.slot(ind);
                if !slot.occupied {
                    return None;
                }
                if !slot.deleted && slot.hash == hash && slot.key() == key {
                    return Some((ind, guard));
                }
                drop(guard);
                step += 1;
                if step >= hp {
                    return None;
                }
                ind = (ind + 1) & mask;
            }
        }
    }

    /// Probe without per-slot locking; only sound under the full-table lock.
    fn snapshot_probe(&self, key: &K) -> Option<usize> {
        let hash = self.hashed(key);
        let hp = self.buckets.hashpower();
        let mask = (1usize << hp) - 1;
        let mut ind = (hash as usize) & mask;
        let mut step = 0;
        loop {
            let slot = self.buckets.slot(ind);
            if !slot.occupied {
                return None;
            }
            if !slot.deleted && slot.hash == hash && slot.key() == key {
                return Some(ind);
            }
            step += 1;
            if step >= hp {
                return None;
            }
            ind = (ind + 1) & mask;
        }
    }
}

// ================================================================================================
// INSERTION AND RESIZE
// ================================================================================================

/// Where an insert probe landed.
enum InsertSlot<'a> {
    /// First reusable slot on the probe path, with the walk having proven that no live
    /// duplicate follows it.
    Vacant { index: usize, guard: StripeGuard<'a> },
    /// The key is already present at `index`.
    Existing { index: usize, guard: StripeGuard<'a> },
}

/// Outcome of re-locking a remembered reusable slot.
enum ReuseCheck<'a> {
    Vacant(StripeGuard<'a>),
    Existing(StripeGuard<'a>),
    /// A racer claimed the slot for a different key, or the generation moved; probe again.
    Conflict,
}

impl<K, V, S> StripeMap<K, V, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Clone + Sync,
{
    /// Insert `key -> val` if the key is absent. Returns whether it was inserted.
    pub fn insert(&self, key: K, val: V) -> bool {
        self.uprase_fn(key, |_| false, val)
    }

    /// Insert `key -> val`, overwriting any existing value.
    /// Returns `true` iff the key was newly inserted.
    pub fn insert_or_assign(&self, key: K, val: V) -> bool {
        let hash = self.hashed(&key);
        match self.linear_insert_loop(&key, hash) {
            InsertSlot::Vacant { index, guard } => {
                self.buckets.slot_mut(index).set_kv(hash, key, val);
                guard.stripe().add_elems(1);
                true
            }
            InsertSlot::Existing { index, guard: _guard } => {
                *self.buckets.slot_mut(index).val_mut() = val;
                false
            }
        }
    }

    /// Insert `key -> val` if absent, otherwise run `f` on the existing value.
    /// Returns `true` iff the key was newly inserted.
    pub fn upsert<F>(&self, key: K, f: F, val: V) -> bool
    where
        F: FnOnce(&mut V),
    {
        self.uprase_fn(
            key,
            |v| {
                f(v);
                false
            },
            val,
        )
    }

    /// Insert `key -> val` if absent, otherwise run `f` on the existing value and erase
    /// the entry when `f` returns `true`. Returns `true` iff the key was newly inserted.
    pub fn uprase_fn<F>(&self, key: K, f: F, val: V) -> bool
    where
        F: FnOnce(&mut V) -> bool,
    {
        let hash = self.hashed(&key);
        match self.linear_insert_loop(&key, hash) {
            InsertSlot::Vacant { index, guard } => {
                self.buckets.slot_mut(index).set_kv(hash, key, val);
                guard.stripe().add_elems(1);
                true
            }
            InsertSlot::Existing { index, guard } => {
                if f(self.buckets.slot_mut(index).val_mut()) {
                    self.buckets.slot_mut(index).erase_kv();
                    guard.stripe().add_elems(-1);
                }
                false
            }
        }
    }

    /// Resize to `1 << new_hashpower` buckets. Returns `false` when `new_hashpower`
    /// equals the current hashpower or another resize committed first.
    pub fn rehash(&self, new_hashpower: usize) -> bool {
        let hp = self.buckets.hashpower();
        if new_hashpower == hp {
            return false;
        }
        self.linear_expand(hp, new_hashpower)
    }

    /// Grow so that at least `n` buckets exist. Returns `false` when the table is
    /// already large enough.
    pub fn reserve(&self, n: usize) -> bool {
        let hp = self.buckets.hashpower();
        let new_hp = reserve_calc(n);
        if new_hp <= hp {
            return false;
        }
        self.linear_expand(hp, new_hp)
    }

    /// Halve the table while the load factor stays at or below 1/4 and the hashpower
    /// stays above 1. Never triggered implicitly.
    pub fn shrink(&self) {
        while self.load_factor() <= SHRINK_LOAD_FACTOR {
            let hp = self.buckets.hashpower();
            if hp <= 1 {
                break;
            }
            self.linear_expand(hp, hp - 1);
        }
    }

    /// Stripe-locked probe for an insertion point. Keys dominate tombstones: the walk
    /// remembers the first reusable slot but keeps scanning, so a live duplicate later in
    /// the chain wins. A remembered slot is only taken once the walk has hit the end of
    /// the chain or the probe budget, and it is re-validated after re-locking.
    fn linear_insert_loop(&self, key: &K, hash: u64) -> InsertSlot<'_> {
        'probe: loop {
            let hp = self.buckets.hashpower();
            let mask = (1usize << hp) - 1;
            let mut ind = (hash as usize) & mask;
            let mut reuse: Option<usize> = None;
            let mut step = 0;
            loop {
                let guard = match self.lock_one(hp, ind) {
                    Some(guard) => guard,
                    None => continue 'probe,
                };
                let slot = self.buckets.slot(ind);
                if !slot.occupied {
                    // End of the chain: no live duplicate can follow.
                    match reuse {
                        None => return InsertSlot::Vacant { index: ind, guard },
                        Some(r) => {
                            drop(guard);
                            match self.relock_reusable(hp, r, key, hash) {
                                ReuseCheck::Vacant(guard) => {
                                    return InsertSlot::Vacant { index: r, guard }
                                }
                                ReuseCheck::Existing(guard) => {
                                    return InsertSlot::Existing { index: r, guard }
                                }
                                ReuseCheck::Conflict => continue 'probe,
                            }
                        }
                    }
                } else if slot.deleted {
                    if reuse.is_none() {
                        reuse = Some(ind);
                    }
                } else if slot.hash == hash && slot.key() == key {
                    return InsertSlot::Existing { index: ind, guard };
                }
                drop(guard);
                ind = (ind + 1) & mask;
                step += 1;
                if step >= hp {
                    match reuse {
                        Some(r) => match self.relock_reusable(hp, r, key, hash) {
                            ReuseCheck::Vacant(guard) => {
                                return InsertSlot::Vacant { index: r, guard }
                            }
                            ReuseCheck::Existing(guard) => {
                                return InsertSlot::Existing { index: r, guard }
                            }
                            ReuseCheck::Conflict => continue 'probe,
                        },
                        None => {
                            // Probe budget exhausted with nothing reusable: the table is
                            // too full. Grow one hashpower and start over.
                            self.linear_expand(hp, hp + 1);
                            continue 'probe;
                        }
                    }
                }
            }
        }
    }

    fn relock_reusable(&self, hp: usize, index: usize, key: &K, hash: u64) -> ReuseCheck<'_> {
        match self.lock_one(hp, index) {
            None => ReuseCheck::Conflict,
            Some(guard) => {
                let slot = self.buckets.slot(index);
                if !slot.occupied || slot.deleted {
                    ReuseCheck::Vacant(guard)
                } else if slot.hash == hash && slot.key() == key {
                    ReuseCheck::Existing(guard)
                } else {
                    ReuseCheck::Conflict
                }
            }
        }
    }

    // ============================================================================================
    // RESIZE COORDINATOR
    // ============================================================================================

    /// Swap in a table of `1 << new_hp` buckets, migrating every live pair. Returns
    /// `false` when another thread resized first (callers re-read the hashpower and
    /// retry). Runs entirely under the full-table lock, so no operation can observe a
    /// torn view of the swap.
    fn linear_expand(&self, orig_hp: usize, new_hp: usize) -> bool {
        let guard = self.lock_all();
        if self.buckets.hashpower() != orig_hp {
            return false;
        }
        if new_hp > orig_hp {
            self.expansions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shrinks.fetch_add(1, Ordering::Relaxed);
        }

        // The replacement map must probe exactly like this one will after the swap, so it
        // gets the live hasher, not a fresh one.
        let new_map = StripeMap::with_hashpower_and_hasher(new_hp, self.hasher.clone());
        new_map.set_max_worker_threads(self.max_worker_threads());

        self.parallel_migrate(&new_map, 1usize << orig_hp);
        self.adopt_stripes(&new_map);
        self.buckets.swap_with(&new_map.buckets);
        drop(guard);
        true
    }

    /// Split `[0, old_len)` into contiguous slices, one per extra worker plus the calling
    /// thread, and reinsert every live pair into `new_map`. Tombstones are dropped on the
    /// floor; the insert path populates the new map's stripe counters. Worker panics are
    /// re-raised here after every worker has joined.
    fn parallel_migrate(&self, new_map: &Self, old_len: usize) {
        let extra_workers = self.max_worker_threads().min(num_cpus::get());
        let num_workers = 1 + extra_workers;
        let per_worker = old_len / num_workers;
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(extra_workers);
            let mut start = 0;
            for _ in 0..extra_workers {
                let end = start + per_worker;
                handles.push(scope.spawn(move || self.migrate_range(new_map, start, end)));
                start = end;
            }
            self.migrate_range(new_map, start, old_len);
            let mut worker_panic = None;
            for handle in handles {
                if let Err(payload) = handle.join() {
                    worker_panic.get_or_insert(payload);
                }
            }
            if let Some(payload) = worker_panic {
                panic::resume_unwind(payload);
            }
        });
    }

    fn migrate_range(&self, new_map: &Self, start: usize, end: usize) {
        for i in start..end {
            if self.buckets.slot(i).is_live() {
                let (key, val) = self.buckets.slot_mut(i).take_kv();
                new_map.insert(key, val);
            }
        }
    }

    /// Take over the replacement map's stripe counters. When the new stripe count
    /// exceeds the current one, a longer set is appended to the history chain with every
    /// stripe pre-locked, so it is covered by the full-lock guard already held.
    /// Otherwise the counters are copied in place and the tail zeroed; bucket-to-stripe
    /// assignment agrees between the two sets for every index in the new array.
    fn adopt_stripes(&self, new_map: &Self) {
        let current = self.current_set();
        let donor = new_map.current_set();
        if donor.stripes.len() > current.stripes.len() {
            let extended = StripeSet::with_len(donor.stripes.len());
            for (stripe, from) in extended.stripes.iter().zip(donor.stripes.iter()) {
                stripe.lock();
                stripe.set_elems(from.elem_count());
            }
            let extended = Box::into_raw(extended);
            current.next.store(extended, Ordering::Release);
            self.current_stripes.store(extended, Ordering::Release);
        } else {
            for (i, stripe) in current.stripes.iter().enumerate() {
                stripe.set_elems(if i < donor.stripes.len() {
                    donor.stripes[i].elem_count()
                } else {
                    0
                });
            }
        }
    }
}

// ================================================================================================
// LOCKED TABLE AND ITERATORS
// ================================================================================================

/// Handle over a fully locked table, produced by [`StripeMap::lock_table`]. All other
/// operations on the map block until this handle drops.
pub struct LockedTable<'a, K, V, S: BuildHasher = RandomState> {
    map: &'a StripeMap<K, V, S>,
    _guard: FullLockGuard<'a>,
}

impl<'a, K, V, S: BuildHasher> LockedTable<'a, K, V, S> {
    /// Cursor over live entries in storage order. Supports reverse traversal through
    /// [`DoubleEndedIterator`].
    pub fn iter(&self) -> LockedIter<'_, K, V> {
        LockedIter {
            buckets: &self.map.buckets,
            front: 0,
            back: self.map.buckets.bucket_count(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a, K: Eq + Hash, V, S: BuildHasher> LockedTable<'a, K, V, S> {
    /// Borrow the value stored under `key`, if any.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map
            .snapshot_probe(key)
            .map(|index| self.map.buckets.slot(index).val())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.snapshot_probe(key).is_some()
    }
}

impl<'t, 'a, K, V, S: BuildHasher> IntoIterator for &'t LockedTable<'a, K, V, S> {
    type Item = (&'t K, &'t V);
    type IntoIter = LockedIter<'t, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Bidirectional cursor over the live slots of a locked table, in storage order.
pub struct LockedIter<'t, K, V> {
    buckets: &'t BucketArray<K, V>,
    front: usize,
    back: usize,
}

impl<'t, K, V> Iterator for LockedIter<'t, K, V> {
    type Item = (&'t K, &'t V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.front < self.back {
            let slot = self.buckets.slot(self.front);
            self.front += 1;
            if slot.is_live() {
                return Some((slot.key(), slot.val()));
            }
        }
        None
    }
}

impl<'t, K, V> DoubleEndedIterator for LockedIter<'t, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        while self.back > self.front {
            self.back -= 1;
            let slot = self.buckets.slot(self.back);
            if slot.is_live() {
                return Some((slot.key(), slot.val()));
            }
        }
        None
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K: Eq + Hash, V, S: BuildHasher + Default> Default for StripeMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> FromIterator<(K, V)> for StripeMap<K, V, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Clone + Sync + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = StripeMap::with_hasher(S::default());
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K, V, S> Extend<(K, V)> for StripeMap<K, V, S>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Clone + Sync,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

// ================================================================================================
// DROP IMPLEMENTATIONS
// ================================================================================================

impl<K, V, S: BuildHasher> Drop for StripeMap<K, V, S> {
    fn drop(&mut self) {
        // The bucket array drops itself; only the stripe-set chain is manually owned.
        let mut node = self.lock_history.load(Ordering::Relaxed);
        while !node.is_null() {
            let set = unsafe { Box::from_raw(node) };
            node = set.next.load(Ordering::Relaxed);
        }
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

/// Smallest hashpower whose table holds at least `n` buckets.
fn reserve_calc(n: usize) -> usize {
    let mut hp = 0;
    while (1usize << hp) < n {
        hp += 1;
    }
    hp
}
