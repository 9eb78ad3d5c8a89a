#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use strata::primitives::pager::PagerOptions;
use strata::segment::SegmentOptions;
use strata::types::{Csn, PageOwnerId};
use strata::{StoreOptions, VersionedStore};
use tempfile::TempDir;

const GEOMETRY: [&str; 6] = [
    "--page-size",
    "512",
    "--pages-per-extent",
    "10",
    "--extents-per-node",
    "5",
];

fn store_options() -> StoreOptions {
    StoreOptions::default()
        .pager(PagerOptions::default().page_size(512))
        .segment(
            SegmentOptions::default()
                .pages_per_extent(10)
                .extents_per_seg_alloc(5),
        )
}

fn setup_store(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.strata"));
    seed_versions(&path).expect("seed versions");
    (dir, path)
}

/// Twenty pages at csn 0, every page rewritten at csn 2 and every other
/// page again at csn 4.
fn seed_versions(path: &Path) -> strata::Result<()> {
    let store = VersionedStore::create(path, store_options())?;
    let txn = store.open_snapshot(Csn(0));
    let mut pages = Vec::new();
    for _ in 0..20 {
        pages.push(txn.allocate_page(PageOwnerId(1))?.unwrap());
    }
    txn.commit(Csn(0))?;
    for (csn, step) in [(2u64, 1usize), (4, 2)] {
        let txn = store.open_snapshot(Csn(csn));
        for &page in pages.iter().step_by(step) {
            txn.write_page(page)?.data_mut()[0] = csn as u8;
        }
        txn.commit(Csn(csn))?;
    }
    store.flush()
}

fn run_json(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("strata")
        .args(["--format", "json"])
        .args(GEOMETRY)
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn format_creates_store() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("nested").join("fresh.strata");
    let json = run_json(&["format"], &path);
    assert_eq!(json["page_size"].as_u64(), Some(512));
    assert_eq!(json["pages_per_extent"].as_u64(), Some(10));
    assert!(path.exists());

    cargo_bin_cmd!("strata")
        .args(GEOMETRY)
        .arg("format")
        .arg(&path)
        .assert()
        .failure();
    cargo_bin_cmd!("strata")
        .args(GEOMETRY)
        .args(["format", "--force"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn stats_emits_json() {
    let (_dir, path) = setup_store("stats");
    let json = run_json(&["stats"], &path);
    assert_eq!(json["geometry"]["page_size"].as_u64(), Some(512));
    assert_eq!(json["pages"]["allocated"].as_u64(), Some(50));
    assert_eq!(json["pages"]["scratch_pages_in_use"].as_u64(), Some(0));
    assert!(json["filesystem"]["size_bytes"].as_u64().unwrap_or(0) > 0);
}

#[test]
fn verify_full_succeeds() {
    let (_dir, path) = setup_store("verify");
    let json = run_json(&["verify", "--level", "full"], &path);
    assert!(json["success"].as_bool().unwrap_or(false));
    assert_eq!(json["counts"]["allocated_entries"].as_u64(), Some(50));
}

#[test]
fn verify_text_output() {
    let (_dir, path) = setup_store("verify-text");
    let output = cargo_bin_cmd!("strata")
        .args(GEOMETRY)
        .args(["verify", "--level", "fast"])
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("success=true"), "{text}");
}

#[test]
fn reclaim_frees_old_versions() {
    let (_dir, path) = setup_store("reclaim");
    let json = run_json(&["reclaim", "--oldest-active", "3"], &path);
    assert_eq!(json["freed"].as_u64(), Some(0));

    let json = run_json(&["reclaim", "--oldest-active", "5"], &path);
    assert_eq!(json["freed"].as_u64(), Some(10));
    assert_eq!(json["allocated_after"].as_u64(), Some(40));

    let json = run_json(&["stats"], &path);
    assert_eq!(json["pages"]["allocated"].as_u64(), Some(40));
}

#[test]
fn missing_store_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("strata")
        .arg("stats")
        .arg(dir.path().join("absent.strata"))
        .assert()
        .failure();
}
