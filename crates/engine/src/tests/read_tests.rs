use super::helpers::*;
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

fn keys(items: &[(Vec<u8>, Vec<u8>)]) -> Vec<String> {
    items
        .iter()
        .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
        .collect()
}

// --------------------- Range boundaries ---------------------

#[test]
fn range_is_half_open() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    tree.insert(b"a", b"1")?;
    tree.insert(b"b", b"2")?;
    tree.insert(b"c", b"3")?;
    tree.flush()?;

    let snap = tree.snapshot_must_include(3)?;
    let got = collect(snap.range(b"b", b"z")?)?;
    assert_eq!(
        got,
        vec![(b"b".to_vec(), b"2".to_vec()), (b"c".to_vec(), b"3".to_vec())]
    );

    assert_eq!(keys(&collect(snap.range(b"a", b"c")?)?), vec!["a", "b"]);
    assert_eq!(keys(&collect(snap.range(b"b", b"b\0")?)?), vec!["b"]);
    Ok(())
}

#[test]
fn empty_bounds_are_unbounded() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    for k in ["d", "a", "c", "b"] {
        tree.insert(k.as_bytes(), b"v")?;
    }
    let snap = tree.snapshot_must_include(4)?;

    assert_eq!(keys(&collect(snap.range(b"", b"")?)?), vec!["a", "b", "c", "d"]);
    assert_eq!(keys(&collect(snap.range(b"c", b"")?)?), vec!["c", "d"]);
    assert_eq!(keys(&collect(snap.range(b"", b"c")?)?), vec!["a", "b"]);
    Ok(())
}

#[test]
fn start_not_below_end_is_empty() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    tree.insert(b"a", b"1")?;
    tree.insert(b"m", b"2")?;
    let snap = tree.snapshot_must_include(2)?;

    assert!(collect(snap.range(b"m", b"m")?)?.is_empty());
    assert!(collect(snap.range(b"z", b"a")?)?.is_empty());
    Ok(())
}

#[test]
fn range_past_last_key_is_empty() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    tree.insert(b"a", b"1")?;
    let snap = tree.snapshot_must_include(1)?;
    assert!(collect(snap.range(b"b", b"")?)?.is_empty());
    Ok(())
}

#[test]
fn range_on_empty_tree() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    let snap = tree.snapshot()?;
    assert!(collect(snap.range(b"", b"")?)?.is_empty());
    assert!(snap.get(b"a").unwrap_err().is_not_found());
    Ok(())
}

// --------------------- Multi-level trees ---------------------

#[test]
fn full_scan_is_sorted_across_many_nodes() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_flush_thld(100).with_sync_thld(1000))?;
    for i in shuffled(1000) {
        tree.insert(&key(i), format!("{}", i).as_bytes())?;
    }
    let snap = tree.snapshot_must_include(tree.version())?;

    let all = collect(snap.range(b"", b"")?)?;
    assert_eq!(all.len(), 1000);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(k, &key(i));
        assert_eq!(v, format!("{}", i).as_bytes());
    }

    let part = collect(snap.range(&key(250), &key(350))?)?;
    assert_eq!(part.len(), 100);
    assert_eq!(part[0].0, key(250));
    assert_eq!(part[99].0, key(349));
    Ok(())
}

#[test]
fn range_start_between_keys() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    for i in (0..300).step_by(2) {
        tree.insert(&key(i), b"v")?;
    }
    let snap = tree.snapshot_must_include(tree.version())?;

    // key(101) is absent; the scan starts at key(102)
    let got = collect(snap.range(&key(101), &key(110))?)?;
    let want: Vec<Vec<u8>> = (102..110).step_by(2).map(key).collect();
    assert_eq!(got.into_iter().map(|(k, _)| k).collect::<Vec<_>>(), want);
    Ok(())
}

#[test]
fn range_reports_versions() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    tree.insert(b"a", b"1")?;
    tree.insert(b"b", b"1")?;
    tree.insert(b"a", b"2")?;
    let snap = tree.snapshot_must_include(3)?;

    let got: Vec<(Vec<u8>, u64)> = snap
        .range(b"", b"")?
        .map(|r| r.map(|(k, v)| (k, v.version)))
        .collect::<crate::Result<_>>()?;
    assert_eq!(got, vec![(b"a".to_vec(), 3), (b"b".to_vec(), 2)]);
    Ok(())
}

// --------------------- Tree-level API ---------------------

#[test]
fn iterate_goes_through_snapshot() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    for i in 0..20 {
        tree.insert(&key(i), b"v")?;
    }
    let snap = tree.snapshot_must_include(20)?;
    let got = collect(tree.iterate(&key(5), &key(8), &snap)?)?;
    assert_eq!(got.len(), 3);
    Ok(())
}

#[test]
fn writer_reads_unflushed_inserts() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    for i in 0..200 {
        tree.insert(&key(i), b"v")?;
    }
    assert_eq!(tree.durability_stats().flushes, 0);
    for i in 0..200 {
        assert_eq!(tree.get(&key(i))?.version, i as u64 + 1);
    }
    assert!(tree.get(&key(200)).unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn reads_survive_cache_churn() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_cache_size(1))?;
    for i in shuffled(300) {
        tree.insert(&key(i), b"v")?;
    }
    let snap = tree.snapshot_must_include(300)?;
    assert_eq!(collect(snap.range(b"", b"")?)?.len(), 300);
    for i in 0..300 {
        snap.get(&key(i))?;
    }
    assert!(tree.stats().cache.evictions > 0);
    Ok(())
}
