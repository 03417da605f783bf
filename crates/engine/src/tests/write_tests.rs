use super::helpers::*;
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

// --------------------- Basic insert / get ---------------------

#[test]
fn insert_and_get() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    let v = tree.insert(b"name", b"alice")?;
    let got = tree.get(b"name")?;
    assert_eq!(got.value, b"alice");
    assert_eq!(got.version, v);
    assert_eq!(v, 1);
    Ok(())
}

#[test]
fn get_missing_key_is_not_found() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    let err = tree.get(b"nope").unwrap_err();
    assert!(err.is_not_found());

    tree.insert(b"other", b"1")?;
    assert!(tree.get(b"nope").unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn overwrite_returns_latest_with_higher_version() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    let mut last = 0;
    for i in 0..10 {
        tree.insert(b"k", format!("v{}", i).as_bytes())?;
        let got = tree.get(b"k")?;
        assert_eq!(got.value, format!("v{}", i).as_bytes());
        assert!(got.version > last);
        last = got.version;
    }
    assert_eq!(tree.entry_count(), 1);
    Ok(())
}

#[test]
fn versions_strictly_increase_across_keys() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    let versions: Vec<u64> = (0..50)
        .map(|i| tree.insert(&key(i % 7), b"x"))
        .collect::<crate::Result<_>>()?;
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(tree.version(), 50);
    Ok(())
}

#[test]
fn entry_count_counts_distinct_keys() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    for i in 0..30 {
        tree.insert(&key(i % 10), b"v")?;
    }
    assert_eq!(tree.entry_count(), 10);
    Ok(())
}

// --------------------- Argument errors ---------------------

#[test]
fn empty_key_rejected() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    assert!(matches!(tree.insert(b"", b"v"), Err(TreeError::EmptyKey)));
    assert!(matches!(tree.get(b""), Err(TreeError::EmptyKey)));
    Ok(())
}

#[test]
fn key_too_long_rejected_without_state_change() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    tree.insert(b"a", b"1")?;

    let long = vec![b'k'; 33];
    let err = tree.insert(&long, b"v").unwrap_err();
    assert!(matches!(err, TreeError::KeyTooLong { len: 33, max: 32 }));
    assert!(err.is_argument());

    assert_eq!(tree.version(), 1);
    assert_eq!(tree.entry_count(), 1);
    assert!(matches!(tree.get(&long), Err(TreeError::KeyTooLong { .. })));

    // exactly at the limit is fine
    tree.insert(&vec![b'k'; 32], b"v")?;
    Ok(())
}

#[test]
fn entry_too_large_rejected() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    let max = tree.options().max_entry_size();

    let fits = vec![0u8; max - 1 - config::LEAF_ENTRY_OVERHEAD];
    tree.insert(b"k", &fits)?;

    let too_big = vec![0u8; max];
    assert!(matches!(
        tree.insert(b"k", &too_big),
        Err(TreeError::EntryTooLarge { .. })
    ));
    assert_eq!(tree.get(b"k")?.value, fits);
    Ok(())
}

// --------------------- Batches ---------------------

#[test]
fn insert_batch_shares_one_version() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    tree.insert(b"x", b"0")?;
    let v = tree.insert_batch(&[("a", "1"), ("b", "2"), ("c", "3")])?;
    assert_eq!(v, 2);
    for k in ["a", "b", "c"] {
        assert_eq!(tree.get(k.as_bytes())?.version, v);
    }
    assert_eq!(tree.entry_count(), 4);
    assert_eq!(tree.insert(b"y", b"0")?, 3);
    Ok(())
}

#[test]
fn insert_batch_rejects_duplicates_and_bad_keys() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    assert!(matches!(
        tree.insert_batch(&[("a", "1"), ("a", "2")]),
        Err(TreeError::DuplicateKey)
    ));
    assert!(matches!(
        tree.insert_batch(&[("a", "1"), ("", "2")]),
        Err(TreeError::EmptyKey)
    ));
    assert_eq!(tree.version(), 0);
    assert!(tree.get(b"a").unwrap_err().is_not_found());
    Ok(())
}

// --------------------- Tree shape ---------------------

#[test]
fn many_inserts_build_bounded_multi_level_tree() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_flush_thld(64).with_sync_thld(1024))?;

    for i in shuffled(1000) {
        tree.insert(&key(i), format!("value-{}", i).as_bytes())?;
    }
    let (nodes, depth) = check_tree(&tree);
    assert!(depth >= 3, "depth {}", depth);
    assert!(nodes > 100);

    for i in 0..1000 {
        assert_eq!(tree.get(&key(i))?.value, format!("value-{}", i).as_bytes());
    }
    assert_eq!(tree.entry_count(), 1000);
    Ok(())
}

#[test]
fn copy_on_write_marks_replaced_nodes_stale() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    tree.insert(b"a", b"1")?;
    let s = tree.stats();
    assert_eq!((s.live_nodes, s.stale_nodes), (1, 0));

    tree.insert(b"a", b"2")?;
    let s = tree.stats();
    assert_eq!((s.live_nodes, s.stale_nodes), (1, 1));

    for i in 0..200 {
        tree.insert(&key(i), b"v")?;
    }
    let (nodes, _) = check_tree(&tree);
    assert_eq!(tree.stats().live_nodes, nodes as u64);
    Ok(())
}

// --------------------- Flush / sync checkpoints ---------------------

#[test]
fn flush_after_second_sync_after_fourth() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_flush_thld(2).with_sync_thld(4))?;

    tree.insert(b"k1", b"v")?;
    let s = tree.durability_stats();
    assert_eq!((s.flushes, s.syncs), (0, 0));
    assert_eq!(s.unflushed, 1);

    tree.insert(b"k2", b"v")?;
    let s = tree.durability_stats();
    assert_eq!((s.flushes, s.syncs), (1, 0));
    assert_eq!(s.last_flush_version, Some(2));
    assert_eq!(s.unflushed, 0);
    assert_eq!(s.unsynced, 2);

    tree.insert(b"k3", b"v")?;
    let s = tree.durability_stats();
    assert_eq!((s.flushes, s.syncs), (1, 0));

    tree.insert(b"k4", b"v")?;
    let s = tree.durability_stats();
    assert_eq!((s.flushes, s.syncs), (1, 1));
    assert_eq!(s.last_sync_version, Some(4));
    assert_eq!((s.unflushed, s.unsynced), (0, 0));
    Ok(())
}

#[test]
fn batch_counts_every_entry_towards_thresholds() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_flush_thld(3).with_sync_thld(100))?;

    tree.insert_batch(&[("a", "1"), ("b", "2"), ("c", "3")])?;
    assert_eq!(tree.durability_stats().flushes, 1);
    Ok(())
}

#[test]
fn explicit_flush_is_noop_without_changes() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    tree.flush()?;
    assert_eq!(tree.durability_stats().flushes, 0);

    tree.insert(b"a", b"1")?;
    tree.flush()?;
    tree.flush()?;
    let s = tree.durability_stats();
    assert_eq!(s.flushes, 1);
    assert_eq!(tree.stats().commit_seq, 1);
    Ok(())
}

#[test]
fn sync_counts_as_sync_only() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    tree.insert(b"a", b"1")?;
    tree.sync()?;
    let s = tree.durability_stats();
    assert_eq!((s.flushes, s.syncs), (0, 1));
    assert_eq!(tree.stats().commit_seq, 1);

    // flushed but not synced work still gets synced
    tree.insert(b"b", b"2")?;
    tree.flush()?;
    tree.sync()?;
    let s = tree.durability_stats();
    assert_eq!((s.flushes, s.syncs), (1, 2));
    assert_eq!(tree.stats().commit_seq, 2);
    Ok(())
}

#[test]
fn flush_moves_staged_nodes_into_cache() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;

    tree.insert(b"a", b"1")?;
    tree.insert(b"b", b"2")?;
    tree.insert(b"a", b"2")?;
    let s = tree.stats();
    // only the current leaf; the two it replaced were never committed
    assert_eq!(s.staged_nodes, 1);
    assert_eq!(s.staged_history, 1);

    tree.flush()?;
    let s = tree.stats();
    assert_eq!((s.staged_nodes, s.staged_history), (0, 0));
    assert_eq!(s.cache.len, 1);
    assert_eq!(tree.get(b"a")?.value, b"2");
    Ok(())
}

// --------------------- Write buffer bounds ---------------------

#[test]
fn overwrites_only_stage_reachable_nodes() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_flush_buffer_size(1 << 20))?;

    for round in 0..30 {
        for i in 0..100 {
            tree.insert(&key(i), format!("v{}", round).as_bytes())?;
        }
    }
    let s = tree.stats();
    assert_eq!(s.durability.flushes + s.durability.spills, 0);
    let (nodes, _) = check_tree(&tree);
    assert_eq!(s.staged_nodes, nodes);
    assert_eq!(s.live_nodes, nodes as u64);
    assert_eq!(s.staged_history, 2900);
    Ok(())
}

#[test]
fn staged_bytes_spill_past_flush_buffer_size() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_flush_buffer_size(1024))?;

    for i in 0..200 {
        tree.insert(&key(i), b"value")?;
    }
    tree.insert(&key(7), b"second")?;
    tree.insert(&key(7), b"third")?;

    let s = tree.stats();
    assert!(s.durability.spills > 0);
    assert!(s.staged_bytes < 1024, "staged {} bytes", s.staged_bytes);
    // a spill is not a checkpoint
    assert_eq!((s.durability.flushes, s.durability.syncs), (0, 0));
    assert_eq!(s.commit_seq, 0);
    assert_eq!(s.snapshot_version, 0);

    for i in 0..200 {
        tree.get(&key(i))?;
    }
    let got = collect_history(tree.history(&key(7))?)?;
    assert_eq!(
        got,
        vec![(b"third".to_vec(), 202), (b"second".to_vec(), 201), (b"value".to_vec(), 8)]
    );

    tree.sync()?;
    let snap = tree.snapshot_must_include(202)?;
    assert_eq!(snap.get(&key(7))?.value, b"third");
    Ok(())
}

// --------------------- Read-only / poisoning ---------------------

#[test]
fn read_only_rejects_writes() -> Result<()> {
    let dir = tempdir()?;
    {
        let tree = Tree::open(dir.path(), small_opts())?;
        tree.insert(b"a", b"1")?;
        tree.close()?;
    }

    let tree = Tree::open(dir.path(), small_opts().with_read_only(true))?;
    assert!(matches!(tree.insert(b"b", b"2"), Err(TreeError::ReadOnly)));
    assert!(matches!(tree.flush(), Err(TreeError::ReadOnly)));
    assert!(matches!(tree.sync(), Err(TreeError::ReadOnly)));
    assert!(matches!(tree.compact_force(), Err(TreeError::ReadOnly)));
    assert_eq!(tree.get(b"a")?.value, b"1");
    Ok(())
}

#[test]
fn poisoned_writer_refuses_everything() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts())?;
    tree.insert(b"a", b"1")?;

    tree.inner.writer.lock().poisoned = true;
    assert!(matches!(tree.insert(b"b", b"2"), Err(TreeError::Poisoned)));
    assert!(matches!(tree.flush(), Err(TreeError::Poisoned)));
    assert!(matches!(tree.get(b"a"), Err(TreeError::Poisoned)));
    assert!(matches!(tree.close(), Err(TreeError::Poisoned)));
    Ok(())
}

#[test]
fn tree_is_shareable_across_threads() -> Result<()> {
    let dir = tempdir()?;
    let tree = Tree::open(dir.path(), small_opts().with_flush_thld(16).with_sync_thld(1024))?;

    std::thread::scope(|s| {
        for t in 0..4 {
            let tree = &tree;
            s.spawn(move || {
                for i in 0..100 {
                    tree.insert(&key(t * 100 + i), b"v").unwrap();
                }
            });
        }
    });

    assert_eq!(tree.entry_count(), 400);
    assert_eq!(tree.version(), 400);
    check_tree(&tree);
    Ok(())
}
