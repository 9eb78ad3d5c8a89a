#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use strata::primitives::pager::{Pager, PagerOptions};
use strata::segment::{RandomAllocationSegment, SegmentOptions};
use strata::types::{Csn, PageId, PageOwnerId};
use strata::{StoreOptions, VersionedStore};

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    Free(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

#[derive(Debug, Clone)]
enum TxnOp {
    Allocate,
    Write(usize),
    Deallocate(usize),
}

fn arb_txn() -> impl Strategy<Value = (Vec<TxnOp>, bool)> {
    (
        prop::collection::vec(
            prop_oneof![
                2 => Just(TxnOp::Allocate),
                3 => any::<usize>().prop_map(TxnOp::Write),
                1 => any::<usize>().prop_map(TxnOp::Deallocate),
            ],
            1..12,
        ),
        any::<bool>(),
    )
}

fn segment_options() -> SegmentOptions {
    SegmentOptions::default()
        .pages_per_extent(6)
        .extents_per_seg_alloc(3)
}

fn random_segment() -> RandomAllocationSegment {
    let pager =
        Arc::new(Pager::in_memory(PagerOptions::default().page_size(512).cache_pages(64)).unwrap());
    RandomAllocationSegment::create(pager, &segment_options()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_no_page_is_handed_out_twice(ops in prop::collection::vec(arb_op(), 1..200)) {
        let segment = random_segment();
        let mut live: Vec<PageId> = Vec::new();
        for op in ops {
            match op {
                Op::Allocate => {
                    let page = segment.allocate_page_id(PageOwnerId(9)).unwrap().unwrap();
                    prop_assert!(!live.contains(&page), "page {} allocated twice", page);
                    prop_assert!(segment.is_page_id_valid(page).unwrap());
                    live.push(page);
                }
                Op::Free(i) if !live.is_empty() => {
                    let page = live.swap_remove(i % live.len());
                    segment.deallocate_page(page).unwrap();
                }
                Op::Free(_) => {}
            }
            prop_assert_eq!(segment.allocated_size_in_pages(), live.len() as u64);
        }
        let report = segment.verify().unwrap();
        prop_assert!(report.is_clean(), "{:?}", report.findings);
        prop_assert_eq!(report.allocated_pages, live.len() as u64);
        let recount = segment.count_allocated_pages().unwrap();
        prop_assert_eq!(recount.allocated, live.len() as u64);
    }

    #[test]
    fn prop_high_water_is_stable_across_cycles(count in 1usize..80, cycles in 1usize..4) {
        let segment = random_segment();
        let mut high_water = None;
        for _ in 0..cycles {
            let pages: BTreeSet<PageId> = (0..count)
                .map(|_| segment.allocate_page_id(PageOwnerId(2)).unwrap().unwrap())
                .collect();
            prop_assert_eq!(pages.len(), count);
            let current = segment.occupied_high_water();
            if let Some(previous) = high_water {
                prop_assert_eq!(current, previous);
            }
            high_water = Some(current);
            for page in pages {
                segment.deallocate_page(page).unwrap();
            }
            prop_assert_eq!(segment.allocated_size_in_pages(), 0);
        }
    }

    #[test]
    fn prop_transactions_keep_counters_consistent(txns in prop::collection::vec(arb_txn(), 1..12)) {
        let store = VersionedStore::in_memory(
            StoreOptions::default()
                .pager(PagerOptions::default().page_size(512).cache_pages(64))
                .segment(segment_options()),
        )
        .unwrap();
        let mut live: Vec<PageId> = Vec::new();
        let horizon = Csn(txns.len() as u64 + 1);
        for (i, (ops, commit)) in txns.into_iter().enumerate() {
            let csn = Csn(i as u64 + 1);
            let txn = store.open_snapshot(csn);
            let mut created = Vec::new();
            let mut dropped = Vec::new();
            for op in ops {
                let visible: Vec<PageId> = live
                    .iter()
                    .chain(created.iter())
                    .copied()
                    .filter(|page| !dropped.contains(page))
                    .collect();
                match op {
                    TxnOp::Allocate => {
                        created.push(txn.allocate_page(PageOwnerId(5)).unwrap().unwrap());
                    }
                    TxnOp::Write(k) if !visible.is_empty() => {
                        let page = visible[k % visible.len()];
                        txn.write_page(page).unwrap().data_mut()[0] = i as u8;
                    }
                    TxnOp::Deallocate(k) if !visible.is_empty() => {
                        let page = visible[k % visible.len()];
                        txn.deallocate(page).unwrap();
                        dropped.push(page);
                    }
                    _ => {}
                }
            }
            if commit {
                txn.commit(csn).unwrap();
                live.extend(created);
                live.retain(|page| !dropped.contains(page));
            } else {
                txn.rollback().unwrap();
            }
            prop_assert_eq!(store.scratch_pages_in_use(), 0);
            let report = store.verify().unwrap();
            prop_assert!(report.is_clean(), "{:?}", report.findings);
            let reader = store.open_snapshot(csn);
            for &page in &live {
                prop_assert!(reader.is_page_visible(page).unwrap());
            }
        }
        store.reclaim_all(horizon, 32).unwrap();
        let reader = store.open_snapshot(horizon);
        for &page in &live {
            prop_assert!(reader.is_page_visible(page).unwrap());
        }
        let recount = store.segment().count_allocated_pages().unwrap();
        prop_assert_eq!(recount.allocated, store.segment().allocated_size_in_pages());
    }
}
