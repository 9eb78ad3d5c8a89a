#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use strata::primitives::pager::{Pager, PagerOptions};
use strata::segment::{RandomAllocationSegment, SegmentOptions};
use strata::types::{Csn, PageId, PageOwnerId, Result};
use strata::{StoreOptions, VersionedStore};
use tempfile::tempdir;

const PAGES: usize = 100;

fn segment_options() -> SegmentOptions {
    SegmentOptions::default()
        .pages_per_extent(10)
        .extents_per_seg_alloc(5)
}

fn pager_options() -> PagerOptions {
    PagerOptions::default().page_size(512).cache_pages(256)
}

fn fill(pager: &Pager, page: PageId, byte: u8) -> Result<()> {
    let mut handle = pager.pin_exclusive(page)?;
    handle.data_mut().fill(byte);
    Ok(())
}

#[test]
fn random_segment_allocate_free_reallocate() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("random.strata");
    let pager = Arc::new(Pager::create(&path, pager_options())?);
    let segment = RandomAllocationSegment::create(Arc::clone(&pager), &segment_options())?;

    let mut pages = Vec::with_capacity(PAGES);
    for i in 0..PAGES {
        let page = segment
            .allocate_page_id(PageOwnerId(7))?
            .expect("store grows without bound");
        assert!(segment.is_page_id_valid(page)?);
        assert_eq!(segment.get_page_owner_id(page)?, PageOwnerId(7));
        fill(&pager, page, i as u8)?;
        pages.push(page);
    }
    let distinct: HashSet<PageId> = pages.iter().copied().collect();
    assert_eq!(distinct.len(), PAGES);
    assert_eq!(segment.allocated_size_in_pages(), PAGES as u64);
    let high_water = segment.occupied_high_water();
    assert!(high_water > PAGES as u64, "node pages count toward high water");

    let unused_before = pager.unused_pages();
    for &page in &pages {
        segment.deallocate_page(page)?;
        assert!(!segment.is_page_id_allocated(page)?);
    }
    assert_eq!(pager.unused_pages(), unused_before + PAGES);
    assert_eq!(segment.allocated_size_in_pages(), 0);
    assert_eq!(segment.occupied_high_water(), high_water);

    let mut again = HashSet::new();
    for _ in 0..PAGES {
        let page = segment.allocate_page_id(PageOwnerId(8))?.unwrap();
        assert!(again.insert(page));
    }
    assert_eq!(again, distinct, "freed pages are reused before growing");
    assert_eq!(segment.occupied_high_water(), high_water);
    assert!(segment.verify()?.is_clean());
    Ok(())
}

#[test]
fn random_segment_successor_chain_survives_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.strata");
    let pages = {
        let pager = Arc::new(Pager::create(&path, pager_options())?);
        let segment = RandomAllocationSegment::create(Arc::clone(&pager), &segment_options())?;
        let pages: Vec<PageId> = (0..12)
            .map(|_| segment.allocate_page_id(PageOwnerId(3)).map(Option::unwrap))
            .collect::<Result<_>>()?;
        for pair in pages.windows(2) {
            segment.set_page_successor(pair[0], pair[1])?;
        }
        pager.flush()?;
        pages
    };

    let pager = Arc::new(Pager::open(&path, pager_options())?);
    let segment = RandomAllocationSegment::open(pager, &segment_options())?;
    assert_eq!(segment.allocated_size_in_pages(), pages.len() as u64);
    let mut walked = vec![pages[0]];
    let mut current = pages[0];
    while walked.len() < pages.len() {
        current = segment.get_page_successor(current)?;
        walked.push(current);
    }
    assert_eq!(walked, pages);
    assert!(segment.get_page_successor(current)?.is_null());

    segment.deallocate_all()?;
    assert_eq!(segment.allocated_size_in_pages(), 0);
    assert!(pages
        .iter()
        .all(|&page| !segment.is_page_id_allocated(page).unwrap()));
    Ok(())
}

#[test]
fn versioned_store_persists_committed_pages() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("versioned.strata");
    let options = StoreOptions::default()
        .pager(pager_options())
        .segment(segment_options());

    let pages = {
        let store = VersionedStore::create(&path, options.clone())?;
        let txn = store.open_snapshot(Csn(0));
        let mut pages = Vec::new();
        for i in 0..30u8 {
            let page = txn.allocate_page(PageOwnerId(1))?.unwrap();
            txn.write_page(page)?.data_mut().fill(i);
            pages.push(page);
        }
        txn.commit(Csn(0))?;
        assert_eq!(store.scratch_pages_in_use(), 0);
        pages
    };

    let store = VersionedStore::open(&path, options)?;
    let stats = store.stats();
    assert_eq!(stats.counts.allocated, 30);
    assert_eq!(stats.pages_per_extent, 10);
    let reader = store.open_snapshot(Csn(0));
    for (i, &page) in pages.iter().enumerate() {
        assert!(reader.is_page_visible(page)?);
        assert!(reader.read_page(page)?.data().iter().all(|&b| b == i as u8));
    }
    assert!(store.verify()?.is_clean());
    Ok(())
}

#[test]
fn geometry_mismatch_is_rejected_on_open() -> Result<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("geometry.strata");
    let options = StoreOptions::default()
        .pager(pager_options())
        .segment(segment_options());
    drop(VersionedStore::create(&path, options)?);

    let other = StoreOptions::default()
        .pager(pager_options())
        .segment(SegmentOptions::default().pages_per_extent(8).extents_per_seg_alloc(5));
    assert!(VersionedStore::open(&path, other).is_err());
    Ok(())
}
