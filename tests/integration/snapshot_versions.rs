#![allow(missing_docs)]

use strata::primitives::pager::PagerOptions;
use strata::segment::{SegmentOptions, SnapshotSegment};
use strata::types::{Csn, PageId, PageOwnerId, Result, StrataError};
use strata::{StoreOptions, VersionedStore};

const PAGES: usize = 120;

fn open_store(max_pages: Option<u64>) -> Result<VersionedStore> {
    let mut pager = PagerOptions::default().page_size(512).cache_pages(128);
    pager.max_pages = max_pages;
    VersionedStore::in_memory(
        StoreOptions::default().pager(pager).segment(
            SegmentOptions::default()
                .pages_per_extent(10)
                .extents_per_seg_alloc(5),
        ),
    )
}

fn stamp(buf: &mut [u8], x: usize, tag: u8) {
    buf.fill(tag);
    buf[..8].copy_from_slice(&(x as u64).to_le_bytes());
}

fn read_tag(snapshot: &SnapshotSegment, page: PageId, x: usize) -> Result<u8> {
    let handle = snapshot.read_page(page)?;
    let data = handle.data();
    assert_eq!(&data[..8], &(x as u64).to_le_bytes(), "page {page} holds another page's data");
    let tag = data[8];
    assert_eq!(data[data.len() - 1], tag, "page {page} is torn");
    Ok(tag)
}

/// Allocates `PAGES` pages at csn 0, each tagged 0.
fn populate(store: &VersionedStore) -> Result<Vec<PageId>> {
    let txn = store.open_snapshot(Csn(0));
    let mut pages = Vec::with_capacity(PAGES);
    for x in 0..PAGES {
        let page = txn.allocate_page(PageOwnerId(1))?.unwrap();
        stamp(txn.write_page(page)?.data_mut(), x, 0);
        pages.push(page);
    }
    txn.commit(Csn(0))?;
    Ok(pages)
}

/// Rewrites every page whose index is a multiple of `step`, tagging it with
/// the snapshot csn.
fn skip_write(snapshot: &SnapshotSegment, pages: &[PageId], step: usize) -> Result<()> {
    let tag = snapshot.csn().0 as u8;
    for (x, &page) in pages.iter().enumerate().step_by(step) {
        stamp(snapshot.write_page(page)?.data_mut(), x, tag);
    }
    Ok(())
}

fn expected_tag(x: usize, csn: u64, versions: &[u64]) -> u8 {
    versions
        .iter()
        .copied()
        .filter(|&v| v <= csn && x % v as usize == 0)
        .max()
        .unwrap_or(0) as u8
}

fn ceil_div(n: usize, k: usize) -> u64 {
    n.div_ceil(k) as u64
}

#[test]
fn reads_follow_snapshot_csn() -> Result<()> {
    let store = open_store(None)?;
    let pages = populate(&store)?;
    for csn in [5u64, 7] {
        let txn = store.open_snapshot(Csn(csn));
        skip_write(&txn, &pages, csn as usize)?;
        txn.commit(Csn(csn))?;
    }
    assert_eq!(
        store.segment().allocated_size_in_pages(),
        PAGES as u64 + ceil_div(PAGES, 5) + ceil_div(PAGES, 7)
    );

    for csn in 0..10u64 {
        let reader = store.open_snapshot(Csn(csn));
        for (x, &page) in pages.iter().enumerate() {
            assert_eq!(
                read_tag(&reader, page, x)?,
                expected_tag(x, csn, &[5, 7]),
                "page {x} at csn {csn}"
            );
        }
    }
    assert_eq!(store.scratch_pages_in_use(), 0);
    assert!(store.verify()?.is_clean());
    Ok(())
}

#[test]
fn uncommitted_writes_are_invisible() -> Result<()> {
    let store = open_store(None)?;
    let pages = populate(&store)?;

    let writer = store.open_snapshot(Csn(5));
    skip_write(&writer, &pages, 5)?;
    {
        let reader = store.open_snapshot(Csn(6));
        for (x, &page) in pages.iter().enumerate() {
            assert_eq!(read_tag(&reader, page, x)?, 0);
        }
    }
    for (x, &page) in pages.iter().enumerate() {
        assert_eq!(read_tag(&writer, page, x)?, expected_tag(x, 5, &[5]));
    }
    assert!(store.scratch_pages_in_use() > 0);
    writer.commit(Csn(5))?;

    let reader = store.open_snapshot(Csn(6));
    for (x, &page) in pages.iter().enumerate() {
        assert_eq!(read_tag(&reader, page, x)?, expected_tag(x, 6, &[5]));
    }
    assert_eq!(store.scratch_pages_in_use(), 0);
    Ok(())
}

#[test]
fn rollback_restores_allocation_state() -> Result<()> {
    let store = open_store(None)?;
    let pages = populate(&store)?;
    let committed = store.segment().counts();

    let txn = store.open_snapshot(Csn(5));
    skip_write(&txn, &pages, 5)?;
    let fresh = txn.allocate_page(PageOwnerId(2))?.unwrap();
    txn.deallocate(pages[1])?;
    assert_eq!(
        store.segment().allocated_size_in_pages(),
        PAGES as u64 + ceil_div(PAGES, 5) + 1
    );
    txn.rollback()?;

    assert_eq!(store.segment().allocated_size_in_pages(), PAGES as u64);
    assert_eq!(store.segment().counts().allocated, committed.allocated);
    assert_eq!(store.scratch_pages_in_use(), 0);
    assert!(!store.segment().is_page_id_allocated(fresh)?);

    let reader = store.open_snapshot(Csn(5));
    for (x, &page) in pages.iter().enumerate() {
        assert!(reader.is_page_visible(page)?);
        assert_eq!(read_tag(&reader, page, x)?, 0);
        assert_eq!(store.segment().version_chain(page)?.len(), 1);
    }
    assert!(store.verify()?.is_clean());
    Ok(())
}

#[test]
fn rolled_back_growth_leaves_segment_node_unchanged() -> Result<()> {
    let store = open_store(None)?;
    let node = |page: u64| -> Result<Vec<u8>> {
        Ok(store.segment().pager().pin_shared(PageId(page))?.data().to_vec())
    };
    let before = node(0)?;

    let txn = store.open_snapshot(Csn(1));
    for x in 0..10 {
        let page = txn.allocate_page(PageOwnerId(2))?.unwrap();
        stamp(txn.write_page(page)?.data_mut(), x, 1);
    }
    txn.rollback()?;

    assert_eq!(node(0)?, before);
    assert!(node(11)?.iter().all(|&b| b == 0));
    assert_eq!(store.segment().allocated_size_in_pages(), 0);
    assert_eq!(store.scratch_pages_in_use(), 0);
    let report = store.verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(report.extents, 1);

    let txn = store.open_snapshot(Csn(2));
    let pages = (0..10)
        .map(|_| txn.allocate_page(PageOwnerId(3)).map(Option::unwrap))
        .collect::<Result<Vec<_>>>()?;
    txn.commit(Csn(2))?;
    assert_eq!(pages[9], PageId(12));
    assert_eq!(store.verify()?.extents, 2);
    assert_eq!(store.segment().count_allocated_pages()?.allocated, 10);
    Ok(())
}

#[test]
fn dropped_snapshot_rolls_back() -> Result<()> {
    let store = open_store(None)?;
    let pages = populate(&store)?;
    {
        let txn = store.open_snapshot(Csn(3));
        skip_write(&txn, &pages, 3)?;
        assert!(txn.has_pending_changes());
    }
    assert_eq!(store.segment().allocated_size_in_pages(), PAGES as u64);
    assert_eq!(store.scratch_pages_in_use(), 0);
    Ok(())
}

#[test]
fn deallocated_chain_is_reclaimed_after_horizon() -> Result<()> {
    let store = open_store(None)?;
    let pages = populate(&store)?;
    let victim = pages[10];

    let txn = store.open_snapshot(Csn(2));
    skip_write(&txn, &pages, 10)?;
    txn.commit(Csn(2))?;
    assert_eq!(store.segment().version_chain(victim)?.len(), 2);

    let txn = store.open_snapshot(Csn(4));
    txn.deallocate(victim)?;
    assert!(!txn.is_page_visible(victim)?);
    txn.commit(Csn(4))?;

    assert!(store.open_snapshot(Csn(3)).is_page_visible(victim)?);
    assert!(!store.open_snapshot(Csn(4)).is_page_visible(victim)?);

    let before = store.segment().allocated_size_in_pages();
    store.reclaim_all(Csn(4), 16)?;
    assert!(store.segment().is_page_id_allocated(victim)?);
    store.reclaim_all(Csn(5), 16)?;
    assert!(!store.segment().is_page_id_allocated(victim)?);
    assert!(store.segment().allocated_size_in_pages() <= before - 2);
    assert!(store.verify()?.is_clean());
    Ok(())
}

#[test]
fn copy_on_write_reports_no_space() -> Result<()> {
    let store = open_store(None)?;
    let pages = populate(&store)?;
    let limit = store.segment().pager().allocated_pages();
    drop(store);

    let store = open_store(Some(limit))?;
    let pages_again = populate(&store)?;
    assert_eq!(pages, pages_again);

    let txn = store.open_snapshot(Csn(1));
    let mut result = Ok(());
    for &page in &pages {
        if let Err(err) = txn.write_page(page) {
            result = Err(err);
            break;
        }
    }
    assert!(matches!(result, Err(StrataError::NoSpace)));
    txn.rollback()?;
    assert_eq!(store.segment().allocated_size_in_pages(), PAGES as u64);
    Ok(())
}
