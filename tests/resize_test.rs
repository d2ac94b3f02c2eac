//! Deterministic resize behavior, driven by a pass-through hasher so every integer key
//! probes from its own value.

use std::hash::{BuildHasher, Hasher};

use stripemap_rs::StripeMap;

#[derive(Clone, Default)]
struct IdentityState;

struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        self.0 = u64::from_le_bytes(buf);
    }

    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }

    fn write_usize(&mut self, n: usize) {
        self.0 = n as u64;
    }

    fn write_u32(&mut self, n: u32) {
        self.0 = n as u64;
    }
}

impl BuildHasher for IdentityState {
    type Hasher = IdentityHasher;

    fn build_hasher(&self) -> IdentityHasher {
        IdentityHasher(0)
    }
}

fn identity_map(hashpower: usize) -> StripeMap<u64, u64, IdentityState> {
    StripeMap::with_hashpower_and_hasher(hashpower, IdentityState)
}

#[test]
fn fill_to_capacity() {
    const N: u64 = 1 << 20;
    let map = identity_map(20);
    for i in 0..N {
        assert!(map.insert(i, i));
    }
    assert_eq!(map.len(), N as usize);
    assert_eq!(map.capacity(), N as usize);
    assert_eq!(map.load_factor(), 1.0);
    for i in 0..N {
        assert_eq!(map.get(&i), Some(i));
    }
}

#[test]
fn grow_on_collision_advances_capacity() {
    let map = identity_map(1);
    assert_eq!(map.capacity(), 2);

    let mut capacities = Vec::new();
    for k in 1..=9u64 {
        assert!(map.insert(k, k));
        capacities.push(map.capacity());
    }

    for pair in capacities.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    for cap in &capacities {
        assert!([2, 4, 8, 16].contains(cap), "capacity {}", cap);
    }
    assert_eq!(map.capacity(), 16);

    for k in 1..=9u64 {
        assert_eq!(map.get(&k), Some(k));
    }
    for k in 10..=16u64 {
        assert_eq!(map.get(&k), None);
    }
}

#[test]
fn full_table_grows_on_next_insert() {
    let map = identity_map(4);
    for i in 0..16u64 {
        assert!(map.insert(i, i));
    }
    assert_eq!(map.load_factor(), 1.0);
    assert_eq!(map.capacity(), 16);

    assert!(map.insert(16, 16));
    assert_eq!(map.capacity(), 32);
    for i in 0..=16u64 {
        assert_eq!(map.get(&i), Some(i));
    }
}

#[test]
fn shrink_returns_to_floor() {
    const N: u64 = 1 << 12;
    let map = identity_map(1);
    for i in 0..N {
        assert!(map.insert(i, i));
    }
    assert_eq!(map.len(), N as usize);
    assert_eq!(map.capacity(), N as usize);

    for i in 0..N {
        assert!(map.erase(&i));
    }
    assert_eq!(map.len(), 0);
    assert_eq!(map.capacity(), N as usize);

    map.shrink();
    assert_eq!(map.capacity(), 2);
    assert_eq!(map.load_factor(), 0.0);
}

#[test]
fn shrink_is_idempotent_once_loaded() {
    let map = identity_map(6);
    for i in 0..32u64 {
        map.insert(i, i);
    }
    // Load factor 1/2: shrink must not touch the table.
    map.shrink();
    assert_eq!(map.capacity(), 64);

    for i in 16..32u64 {
        map.erase(&i);
    }
    // Load factor 1/4: one halving, then the loop stops at 1/2.
    map.shrink();
    assert_eq!(map.capacity(), 32);
    map.shrink();
    assert_eq!(map.capacity(), 32);

    for i in 0..16u64 {
        assert_eq!(map.get(&i), Some(i));
    }
}

#[test]
fn rehash_preserves_contents_both_directions() {
    let map = identity_map(8);
    for i in 0..60u64 {
        map.insert(i, i + 1000);
    }

    assert!(map.rehash(11));
    assert_eq!(map.capacity(), 2048);
    assert_eq!(map.len(), 60);
    for i in 0..60u64 {
        assert_eq!(map.get(&i), Some(i + 1000));
    }

    assert!(map.rehash(6));
    assert_eq!(map.capacity(), 64);
    assert_eq!(map.len(), 60);
    for i in 0..60u64 {
        assert_eq!(map.get(&i), Some(i + 1000));
    }
}

#[test]
fn rehash_drops_tombstones() {
    let map = identity_map(6);
    for i in 0..64u64 {
        map.insert(i, i);
    }
    for i in 0..32u64 {
        map.erase(&i);
    }
    assert!(map.rehash(7));
    assert_eq!(map.len(), 32);

    // A rehash rebuilds from live entries only, so the lower half reinserts cleanly
    // into their home slots.
    for i in 0..32u64 {
        assert!(map.insert(i, i));
    }
    assert_eq!(map.len(), 64);
}

#[test]
fn reserve_from_tiny_table() {
    let map = identity_map(1);
    assert!(map.reserve(4096));
    assert_eq!(map.capacity(), 4096);
    for i in 0..4096u64 {
        assert!(map.insert(i, i));
    }
    // Perfectly placed keys fit without another expansion.
    assert_eq!(map.capacity(), 4096);
}

#[test]
fn migration_preserves_counters() {
    let map = identity_map(2);
    for i in 0..512u64 {
        map.insert(i, i);
    }
    assert_eq!(map.len(), 512);
    map.rehash(12);
    assert_eq!(map.len(), 512);
    for i in 0..512u64 {
        assert!(map.erase(&i));
    }
    assert_eq!(map.len(), 0);
}

#[test]
fn worker_thread_limit_is_propagated() {
    let map = identity_map(2);
    map.set_max_worker_threads(2);
    assert_eq!(map.max_worker_threads(), 2);
    for i in 0..10_000u64 {
        map.insert(i, i);
    }
    assert_eq!(map.len(), 10_000);
    assert_eq!(map.max_worker_threads(), 2);

    map.set_max_worker_threads(0);
    map.rehash(15);
    assert_eq!(map.len(), 10_000);
    for i in 0..10_000u64 {
        assert_eq!(map.get(&i), Some(i));
    }
}
