//! Direct-buffer page cache behavior: exact round trips, LRU eviction
//! under pressure, and idempotent close.

use burldb::storage::{scramble, PageCache};

fn filled_page(seed: u64, size: usize) -> Vec<u8> {
    let mut page = vec![0u8; size];
    let mut x = scramble(seed);
    for byte in page.iter_mut() {
        x = scramble(x);
        *byte = x as u8;
    }
    page
}

#[test]
fn fill_sequential_ids_and_remove_all() {
    let capacity = 64;
    let cache = PageCache::new(capacity * (24 + 4096), 4096, 0);
    assert_eq!(cache.capacity(), capacity);

    let pages: Vec<Vec<u8>> = (1..=capacity as u64)
        .map(|id| filled_page(id, 4096))
        .collect();
    for (i, page) in pages.iter().enumerate() {
        cache.add(i as u64 + 1, page);
    }

    let mut out = vec![0u8; 4096];
    for (i, page) in pages.iter().enumerate() {
        assert!(cache.remove(i as u64 + 1, &mut out), "page {} lost", i + 1);
        assert_eq!(&out, page, "page {} corrupted", i + 1);
    }

    // Everything was handed back once; nothing remains.
    assert!(!cache.remove(1, &mut out));
}

#[test]
fn fill_scrambled_ids_and_remove_all() {
    let capacity = 64;
    let cache = PageCache::new(capacity * (24 + 4096), 4096, scramble(0));

    let pages: Vec<Vec<u8>> = (1..=capacity as u64)
        .map(|id| filled_page(id ^ 0xDEAD, 4096))
        .collect();
    for (i, page) in pages.iter().enumerate() {
        cache.add(scramble(i as u64 + 1), page);
    }

    let mut out = vec![0u8; 4096];
    for (i, page) in pages.iter().enumerate() {
        assert!(cache.remove(scramble(i as u64 + 1), &mut out));
        assert_eq!(&out, page);
    }
}

#[test]
fn eviction_drops_oldest_half() {
    let capacity = 32;
    let cache = PageCache::new(capacity * (24 + 100), 100, 0);

    let pages: Vec<Vec<u8>> = (1..=2 * capacity as u64)
        .map(|id| filled_page(id, 100))
        .collect();
    for (i, page) in pages.iter().enumerate() {
        cache.add(i as u64 + 1, page);
    }

    let mut out = vec![0u8; 100];
    // The first `capacity` insertions were evicted to admit the rest.
    for id in 1..=capacity as u64 {
        assert!(!cache.remove(id, &mut out), "page {} should be gone", id);
    }
    for id in (capacity as u64 + 1)..=(2 * capacity as u64) {
        assert!(cache.remove(id, &mut out), "page {} should survive", id);
        assert_eq!(out, pages[id as usize - 1]);
    }
}

#[test]
fn close_is_idempotent_and_disables_operations() {
    let cache = PageCache::new(8 * (24 + 64), 64, 0);
    cache.add(1, &filled_page(1, 64));

    cache.close();
    cache.close();

    let mut out = vec![0u8; 64];
    assert!(!cache.remove(1, &mut out));
    cache.add(2, &filled_page(2, 64));
    assert!(!cache.remove(2, &mut out));
}
