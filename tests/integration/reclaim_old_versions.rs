#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use strata::primitives::pager::PagerOptions;
use strata::segment::{CounterMetrics, SegmentOptions, SnapshotSegment};
use strata::types::{Csn, PageId, PageOwnerId, Result};
use strata::{StoreOptions, VersionedStore};

const PAGES: usize = 150;
const VERSIONS: [u64; 3] = [3, 5, 7];

fn ceil_div(n: usize, k: usize) -> u64 {
    n.div_ceil(k) as u64
}

fn open_store(metrics: Arc<CounterMetrics>) -> Result<VersionedStore> {
    VersionedStore::in_memory(
        StoreOptions::default()
            .pager(PagerOptions::default().page_size(512).cache_pages(128))
            .segment(
                SegmentOptions::default()
                    .pages_per_extent(10)
                    .extents_per_seg_alloc(5)
                    .metrics(metrics),
            ),
    )
}

fn stamp(buf: &mut [u8], x: usize, tag: u8) {
    buf.fill(tag);
    buf[..8].copy_from_slice(&(x as u64).to_le_bytes());
}

/// Populates the store at csn 0, then writes every multiple of 3, 5 and 7
/// at that csn.
fn build_history(store: &VersionedStore) -> Result<Vec<PageId>> {
    let txn = store.open_snapshot(Csn(0));
    let mut pages = Vec::with_capacity(PAGES);
    for x in 0..PAGES {
        let page = txn.allocate_page(PageOwnerId(1))?.unwrap();
        stamp(txn.write_page(page)?.data_mut(), x, 0);
        pages.push(page);
    }
    txn.commit(Csn(0))?;

    for csn in VERSIONS {
        let txn = store.open_snapshot(Csn(csn));
        for (x, &page) in pages.iter().enumerate().step_by(csn as usize) {
            stamp(txn.write_page(page)?.data_mut(), x, csn as u8);
        }
        txn.commit(Csn(csn))?;
    }
    Ok(pages)
}

fn check_reads(store: &VersionedStore, pages: &[PageId], from: u64) -> Result<()> {
    for csn in from..=8 {
        let reader: SnapshotSegment = store.open_snapshot(Csn(csn));
        for (x, &page) in pages.iter().enumerate() {
            let expected = VERSIONS
                .iter()
                .copied()
                .filter(|&v| v <= csn && x % v as usize == 0)
                .max()
                .unwrap_or(0) as u8;
            let handle = reader.read_page(page)?;
            assert_eq!(&handle.data()[..8], &(x as u64).to_le_bytes());
            assert_eq!(handle.data()[8], expected, "page {x} at csn {csn}");
        }
    }
    Ok(())
}

#[test]
fn reclaim_frees_versions_below_horizon() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let store = open_store(Arc::clone(&metrics))?;
    let pages = build_history(&store)?;

    let total = PAGES as u64 + ceil_div(PAGES, 3) + ceil_div(PAGES, 5) + ceil_div(PAGES, 7);
    assert_eq!(store.segment().allocated_size_in_pages(), total);
    check_reads(&store, &pages, 0)?;

    let mut expected = total;
    for (horizon, freed) in [
        (3u64, 0u64),
        (4, 0),
        (6, ceil_div(PAGES, 15)),
        (8, ceil_div(PAGES, 35) + ceil_div(PAGES, 21) - ceil_div(PAGES, 105)),
    ] {
        assert_eq!(store.reclaim_all(Csn(horizon), 7)?, freed, "horizon {horizon}");
        expected -= freed;
        assert_eq!(store.segment().allocated_size_in_pages(), expected);
        check_reads(&store, &pages, horizon)?;
        assert!(store.verify()?.is_clean());
    }
    assert_eq!(
        metrics.versions_reclaimed.load(Ordering::Relaxed),
        total - expected
    );

    let recount = store.segment().count_allocated_pages()?;
    assert_eq!(recount.allocated, expected);
    Ok(())
}

#[test]
fn reclaim_is_idempotent() -> Result<()> {
    let store = open_store(Arc::new(CounterMetrics::default()))?;
    let pages = build_history(&store)?;
    let first = store.reclaim_all(Csn(100), 1000)?;
    assert!(first > 0);
    assert_eq!(store.reclaim_all(Csn(100), 1000)?, 0);
    for &page in &pages {
        assert!(store.segment().version_chain(page)?.len() <= 2);
    }
    check_reads(&store, &pages, 8)?;
    Ok(())
}

#[test]
fn reclaim_skips_chains_with_pending_writes() -> Result<()> {
    let store = open_store(Arc::new(CounterMetrics::default()))?;
    let pages = build_history(&store)?;

    let pending = store.open_snapshot(Csn(9));
    stamp(pending.write_page(pages[0])?.data_mut(), 0, 9);
    let before = store.segment().version_chain(pages[0])?.len();
    store.reclaim_all(Csn(9), 64)?;
    assert_eq!(store.segment().version_chain(pages[0])?.len(), before);
    pending.commit(Csn(9))?;

    store.reclaim_all(Csn(10), 64)?;
    assert_eq!(store.segment().version_chain(pages[0])?.len(), 2);
    let reader = store.open_snapshot(Csn(10));
    assert_eq!(reader.read_page(pages[0])?.data()[8], 9);
    Ok(())
}

#[test]
fn reclaim_resumes_between_batches() -> Result<()> {
    let store = open_store(Arc::new(CounterMetrics::default()))?;
    build_history(&store)?;
    let first = store.reclaim(Csn(8), 1)?;
    assert!(first.more, "a single-candidate batch stops after one extent");
    let mut freed = first.freed;
    loop {
        let outcome = store.reclaim(Csn(8), 1)?;
        freed += outcome.freed;
        if !outcome.more {
            break;
        }
    }
    let expected = ceil_div(PAGES, 15) + ceil_div(PAGES, 35) + ceil_div(PAGES, 21)
        - ceil_div(PAGES, 105);
    assert_eq!(freed, expected);
    Ok(())
}
