use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |var| map.get(var).cloned()
}

// -------------------- Defaults --------------------

#[test]
fn defaults_are_valid() {
    let opts = Options::default();
    assert!(opts.validate().is_ok());
    assert_eq!(opts.max_node_size, 4096);
    assert_eq!(opts.flush_thld, 100_000);
    assert_eq!(opts.sync_thld, 1_000_000);
    assert_eq!(opts.nodes_log_max_opened_files, 10);
    assert_eq!(opts.history_log_max_opened_files, 1);
    assert_eq!(opts.commit_log_max_opened_files, 1);
    assert_eq!(opts.file_size, 64 * 1024 * 1024);
}

#[test]
fn builders_chain() {
    let opts = Options::default()
        .with_flush_thld(2)
        .with_sync_thld(4)
        .with_cache_size(8)
        .with_read_only(true);
    assert_eq!(opts.flush_thld, 2);
    assert_eq!(opts.sync_thld, 4);
    assert_eq!(opts.cache_size, 8);
    assert!(opts.read_only);
    assert!(opts.validate().is_ok());
}

// -------------------- Validation --------------------

#[test]
fn node_size_below_minimum_rejected() {
    let opts = Options::default().with_max_node_size(MIN_NODE_SIZE - 1);
    assert_eq!(
        opts.validate(),
        Err(ConfigError::NodeSizeTooSmall(MIN_NODE_SIZE - 1))
    );
}

#[test]
fn flush_above_sync_rejected() {
    let opts = Options::default().with_flush_thld(5).with_sync_thld(4);
    assert_eq!(
        opts.validate(),
        Err(ConfigError::FlushAboveSync { flush: 5, sync: 4 })
    );
}

#[test]
fn flush_equal_to_sync_accepted() {
    let opts = Options::default().with_flush_thld(4).with_sync_thld(4);
    assert!(opts.validate().is_ok());
}

#[test]
fn zero_pools_rejected() {
    let opts = Options::default().with_nodes_log_max_opened_files(0);
    assert_eq!(
        opts.validate(),
        Err(ConfigError::ZeroOpenedFiles("nodes_log_max_opened_files"))
    );
    let opts = Options::default().with_history_log_max_opened_files(0);
    assert!(opts.validate().is_err());
    let opts = Options::default().with_commit_log_max_opened_files(0);
    assert!(opts.validate().is_err());
}

#[test]
fn cache_below_minimum_rejected() {
    let opts = Options::default().with_cache_size(0);
    assert_eq!(opts.validate(), Err(ConfigError::CacheTooSmall(0)));
}

#[test]
fn cleanup_percentage_range() {
    assert!(Options::default()
        .with_cleanup_percentage(100.0)
        .validate()
        .is_ok());
    assert!(Options::default()
        .with_cleanup_percentage(100.5)
        .validate()
        .is_err());
    assert!(Options::default()
        .with_cleanup_percentage(-1.0)
        .validate()
        .is_err());
}

#[test]
fn key_len_must_fit_half_a_node() {
    // 128-byte nodes leave 61 bytes per entry; the default 1 KiB key can't fit.
    let opts = Options::default().with_max_node_size(MIN_NODE_SIZE);
    assert!(matches!(
        opts.validate(),
        Err(ConfigError::KeyLenExceedsNode { .. })
    ));

    let opts = opts.with_max_key_len(16);
    assert!(opts.validate().is_ok());
}

#[test]
fn zero_counts_rejected() {
    assert_eq!(
        Options::default().with_flush_thld(0).validate(),
        Err(ConfigError::ZeroFlushThld)
    );
    assert_eq!(
        Options::default().with_max_active_snapshots(0).validate(),
        Err(ConfigError::ZeroMaxActiveSnapshots)
    );
    assert_eq!(
        Options::default().with_compaction_thld(0).validate(),
        Err(ConfigError::ZeroCompactionThld)
    );
    assert_eq!(
        Options::default().with_max_key_len(0).validate(),
        Err(ConfigError::ZeroMaxKeyLen)
    );
    assert_eq!(
        Options::default().with_flush_buffer_size(0).validate(),
        Err(ConfigError::ZeroFlushBuffer)
    );
}

// -------------------- Environment --------------------

#[test]
fn empty_env_gives_defaults() {
    let opts = Options::from_lookup(lookup_from(&[])).unwrap();
    assert_eq!(opts, Options::default());
}

#[test]
fn env_overrides_fields() {
    let opts = Options::from_lookup(lookup_from(&[
        ("LEDGERTREE_FLUSH_THLD", "2"),
        ("LEDGERTREE_SYNC_THLD", " 4 "),
        ("LEDGERTREE_RENEW_SNAP_ROOT_MS", "0"),
        ("LEDGERTREE_FILE_MODE", "0o644"),
        ("LEDGERTREE_READ_ONLY", "true"),
    ]))
    .unwrap();
    assert_eq!(opts.flush_thld, 2);
    assert_eq!(opts.sync_thld, 4);
    assert_eq!(opts.renew_snap_root_after, Duration::ZERO);
    assert_eq!(opts.file_mode, 0o644);
    assert!(opts.read_only);
}

#[test]
fn env_garbage_is_reported() {
    let err = Options::from_lookup(lookup_from(&[("LEDGERTREE_CACHE_SIZE", "lots")])).unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidEnv {
            var: "LEDGERTREE_CACHE_SIZE",
            value: "lots".to_string()
        }
    );
}
