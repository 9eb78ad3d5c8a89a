//! Concurrent snapshot stress tests.
//!
//! Writer threads own disjoint sets of logical pages and commit new
//! versions under increasing CSNs while reader threads open snapshots and
//! check that every page they see is whole and no newer than their CSN.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::primitives::pager::PagerOptions;
use strata::segment::SegmentOptions;
use strata::types::{Csn, PageId, PageOwnerId, Result};
use strata::{StoreOptions, VersionedStore};

const WRITERS: usize = 4;
const READERS: usize = 3;
const PAGES_PER_WRITER: usize = 16;
const TXNS_PER_WRITER: usize = 40;

fn stamp(buf: &mut [u8], x: usize, csn: u64) {
    buf.fill((csn % 251) as u8);
    buf[..8].copy_from_slice(&(x as u64).to_le_bytes());
    buf[8..16].copy_from_slice(&csn.to_le_bytes());
}

fn decode(buf: &[u8]) -> (u64, u64) {
    let x = u64::from_le_bytes(buf[..8].try_into().unwrap());
    let csn = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    assert!(
        buf[16..].iter().all(|&b| b == (csn % 251) as u8),
        "torn page for index {x}"
    );
    (x, csn)
}

fn setup() -> Result<(Arc<VersionedStore>, Vec<PageId>)> {
    let store = VersionedStore::in_memory(
        StoreOptions::default()
            .pager(PagerOptions::default().page_size(512).cache_pages(512))
            .segment(
                SegmentOptions::default()
                    .pages_per_extent(16)
                    .extents_per_seg_alloc(8),
            ),
    )?;
    let txn = store.open_snapshot(Csn(0));
    let mut pages = Vec::new();
    for x in 0..WRITERS * PAGES_PER_WRITER {
        let page = txn.allocate_page(PageOwnerId(1))?.unwrap();
        stamp(txn.write_page(page)?.data_mut(), x, 0);
        pages.push(page);
    }
    txn.commit(Csn(0))?;
    Ok((Arc::new(store), pages))
}

#[test]
fn readers_see_consistent_versions_under_concurrent_commits() -> Result<()> {
    let (store, pages) = setup()?;
    let pages = Arc::new(pages);
    let next_csn = Arc::new(AtomicU64::new(1));
    let published = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(WRITERS + READERS));

    let mut writers = Vec::new();
    for w in 0..WRITERS {
        let store = Arc::clone(&store);
        let pages = Arc::clone(&pages);
        let next_csn = Arc::clone(&next_csn);
        let published = Arc::clone(&published);
        let barrier = Arc::clone(&barrier);
        writers.push(thread::spawn(move || -> Result<()> {
            let mut rng = ChaCha8Rng::seed_from_u64(0x5eed + w as u64);
            let own = w * PAGES_PER_WRITER..(w + 1) * PAGES_PER_WRITER;
            barrier.wait();
            for _ in 0..TXNS_PER_WRITER {
                let csn = next_csn.fetch_add(1, Ordering::SeqCst);
                let txn = store.open_snapshot(Csn(csn));
                let touches = rng.gen_range(1..=4);
                for _ in 0..touches {
                    let x = rng.gen_range(own.clone());
                    stamp(txn.write_page(pages[x])?.data_mut(), x, csn);
                }
                if rng.gen_bool(0.2) {
                    txn.rollback()?;
                } else {
                    txn.commit(Csn(csn))?;
                    published.fetch_max(csn, Ordering::SeqCst);
                }
            }
            Ok(())
        }));
    }

    let mut readers = Vec::new();
    for r in 0..READERS {
        let store = Arc::clone(&store);
        let pages = Arc::clone(&pages);
        let published = Arc::clone(&published);
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        readers.push(thread::spawn(move || -> Result<u64> {
            let mut rng = ChaCha8Rng::seed_from_u64(0xdead + r as u64);
            let mut reads = 0u64;
            barrier.wait();
            while !done.load(Ordering::SeqCst) {
                let csn = published.load(Ordering::SeqCst);
                let snapshot = store.open_snapshot(Csn(csn));
                for _ in 0..16 {
                    let x = rng.gen_range(0..pages.len());
                    let handle = snapshot.read_page(pages[x])?;
                    let (seen_x, seen_csn) = decode(handle.data());
                    assert_eq!(seen_x, x as u64);
                    assert!(seen_csn <= csn, "read csn {seen_csn} from snapshot {csn}");
                    reads += 1;
                }
            }
            Ok(reads)
        }));
    }

    for writer in writers {
        writer.join().expect("writer panicked")?;
    }
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        assert!(reader.join().expect("reader panicked")? > 0);
    }

    assert_eq!(store.scratch_pages_in_use(), 0);
    assert!(store.verify()?.is_clean());

    let last = next_csn.load(Ordering::SeqCst);
    let before = store.segment().allocated_size_in_pages();
    let freed = store.reclaim_all(Csn(last), 32)?;
    assert_eq!(store.segment().allocated_size_in_pages(), before - freed);
    let reader = store.open_snapshot(Csn(last));
    for (x, &page) in pages.iter().enumerate() {
        let (seen_x, _) = decode(reader.read_page(page)?.data());
        assert_eq!(seen_x, x as u64);
        assert!(store.segment().version_chain(page)?.len() <= 2);
    }
    assert!(store.verify()?.is_clean());
    Ok(())
}

#[test]
fn concurrent_allocation_hands_out_distinct_pages() -> Result<()> {
    let (store, _) = setup()?;
    let next_csn = Arc::new(AtomicU64::new(1));
    let mut handles = Vec::new();
    for t in 0..WRITERS {
        let store = Arc::clone(&store);
        let next_csn = Arc::clone(&next_csn);
        handles.push(thread::spawn(move || -> Result<Vec<PageId>> {
            let mut rng = ChaCha8Rng::seed_from_u64(t as u64);
            let mut kept = Vec::new();
            for _ in 0..20 {
                let csn = next_csn.fetch_add(1, Ordering::SeqCst);
                let txn = store.open_snapshot(Csn(csn));
                let mut created = Vec::new();
                for _ in 0..rng.gen_range(1..6) {
                    created.push(txn.allocate_page(PageOwnerId(t as u64 + 10))?.unwrap());
                }
                if rng.gen_bool(0.7) {
                    txn.commit(Csn(csn))?;
                    kept.extend(created);
                } else {
                    txn.rollback()?;
                }
            }
            Ok(kept)
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("allocator thread panicked")?);
    }
    let count = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), count, "a page was committed by two transactions");
    assert_eq!(
        store.segment().allocated_size_in_pages(),
        (WRITERS * PAGES_PER_WRITER + count) as u64
    );
    assert_eq!(store.scratch_pages_in_use(), 0);
    assert!(store.verify()?.is_clean());
    Ok(())
}
