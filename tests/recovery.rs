use std::path::Path;
use txindex::storage::command::Command;
use txindex::storage::layout::StorageLayout;
use txindex::storage::log::{LogicalLog, SyncMode};
use txindex::{Config, EntityId, ErrorKind, IndexService, XaDataSource, XaResource, Xid};

fn xid(n: u8) -> Xid {
    Xid::new(0x54, vec![n], b"r".to_vec()).unwrap()
}

fn ids(service: &IndexService, key: &str, value: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = service
        .nodes(key, value)
        .unwrap()
        .into_ids()
        .unwrap()
        .into_iter()
        .map(|id| id.value())
        .collect();
    ids.sort();
    ids
}

/// Writes a log as a crash would leave it: committed but never marked done.
fn write_committed_log(dir: &Path, commands: &[Command]) {
    let layout = StorageLayout::new(dir.to_path_buf()).unwrap();
    let (log, _) = LogicalLog::open(&layout.log_path(), SyncMode::Immediate, 0).unwrap();
    let local_id = log.begin(&xid(1), commands).unwrap();
    log.prepare(local_id).unwrap();
    log.commit(local_id).unwrap();
}

fn crash_commands() -> Vec<Command> {
    vec![
        Command::add(EntityId(1), "name", "alice"),
        Command::add(EntityId(2), "name", "alice"),
        Command::add(EntityId(3), "tag", "red"),
        Command::remove_value(EntityId(2), "name", "alice"),
        Command::add(EntityId(4), "tag", "blue"),
        Command::remove_entity(EntityId(4), "tag"),
    ]
}

#[test]
fn committed_work_is_replayed_on_open() {
    let dir = tempfile::tempdir().unwrap();
    write_committed_log(dir.path(), &crash_commands());

    let service = IndexService::open(Config::new(dir.path())).unwrap();
    assert_eq!(ids(&service, "name", "alice"), vec![1]);
    assert_eq!(ids(&service, "tag", "red"), vec![3]);
    assert!(ids(&service, "tag", "blue").is_empty());

    let stats = service.stats();
    assert!(!stats.recovering);
    assert_eq!(stats.open_transactions, 0);
    assert_eq!(stats.last_committed_tx, 1);
    assert!(stats.health().is_healthy());
}

#[test]
fn replaying_the_same_log_twice_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_committed_log(dir.path(), &crash_commands());
    let log_path = dir.path().join("index.log");
    let crashed_log = std::fs::read(&log_path).unwrap();

    let once = {
        let service = IndexService::open(Config::new(dir.path())).unwrap();
        let snapshot = (ids(&service, "name", "alice"), ids(&service, "tag", "red"), ids(&service, "tag", "blue"));
        service.shutdown().unwrap();
        snapshot
    };

    // the same crash again, over an index that already has the work
    std::fs::write(&log_path, &crashed_log).unwrap();
    let service = IndexService::open(Config::new(dir.path())).unwrap();
    let twice = (ids(&service, "name", "alice"), ids(&service, "tag", "red"), ids(&service, "tag", "blue"));

    assert_eq!(once, twice);
    assert_eq!(service.nodes("name", "alice").unwrap().size(), 1);
}

#[test]
fn replay_is_invisible_until_recovery_completes() {
    let dir = tempfile::tempdir().unwrap();
    write_committed_log(dir.path(), &[Command::add(EntityId(9), "name", "zed")]);

    let mut config = Config::new(dir.path());
    config.auto_recovery_complete = false;
    let service = IndexService::open(config).unwrap();
    assert!(service.stats().recovering);
    assert!(ids(&service, "name", "zed").is_empty());

    service.recovery_complete().unwrap();
    assert_eq!(ids(&service, "name", "zed"), vec![9]);
    assert!(!service.stats().recovering);
}

#[test]
fn prepared_transaction_is_in_doubt_until_the_coordinator_decides() {
    let dir = tempfile::tempdir().unwrap();
    {
        let service = IndexService::open(Config::new(dir.path())).unwrap();
        let mut conn = service.connect();
        conn.start(&xid(1)).unwrap();
        conn.index(EntityId(1), "name", "alice").unwrap();
        conn.prepare(&xid(1)).unwrap();
        conn.start(&xid(2)).unwrap_err();
        // the process dies here: no commit, no rollback
    }

    let service = IndexService::open(Config::new(dir.path())).unwrap();
    let mut conn = service.connect();
    assert_eq!(conn.recover().unwrap(), vec![xid(1)]);
    assert!(!service.stats().health().is_healthy());
    assert!(ids(&service, "name", "alice").is_empty());

    conn.commit(&xid(1), false).unwrap();
    assert!(conn.recover().unwrap().is_empty());
    assert_eq!(ids(&service, "name", "alice"), vec![1]);
    assert_eq!(conn.commit(&xid(1), false).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn in_doubt_rollback_discards_the_work() {
    let dir = tempfile::tempdir().unwrap();
    {
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        let (log, _) = LogicalLog::open(&layout.log_path(), SyncMode::Immediate, 0).unwrap();
        let local_id = log.begin(&xid(5), &[Command::add(EntityId(5), "k", "v")]).unwrap();
        log.prepare(local_id).unwrap();
    }

    let service = IndexService::open(Config::new(dir.path())).unwrap();
    let mut conn = service.connect();
    conn.rollback(&xid(5)).unwrap();
    assert!(conn.recover().unwrap().is_empty());
    assert!(ids(&service, "k", "v").is_empty());
    assert_eq!(service.stats().open_transactions, 0);
}

#[test]
fn unprepared_transaction_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    {
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        let (log, _) = LogicalLog::open(&layout.log_path(), SyncMode::Immediate, 0).unwrap();
        log.begin(&xid(6), &[Command::add(EntityId(6), "k", "v")]).unwrap();
    }

    let service = IndexService::open(Config::new(dir.path())).unwrap();
    assert!(service.connect().recover().unwrap().is_empty());
    assert!(ids(&service, "k", "v").is_empty());
    assert_eq!(service.stats().open_transactions, 0);
}

#[test]
fn version_and_identity_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (identity, version) = {
        let service = IndexService::open(Config::new(dir.path())).unwrap();
        let source = service.data_source();
        let previous = source.get_and_set_new_version().unwrap();
        assert_eq!(source.current_version(), previous + 1);
        (service.connect().identity(), source.current_version())
    };

    let service = IndexService::open(Config::new(dir.path())).unwrap();
    let conn = service.connect();
    assert!(conn.identity().same_identity(&identity));
    assert_eq!(service.data_source().current_version(), version);
}

#[test]
fn log_rotates_once_it_grows_past_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new(dir.path());
    config.log_rotate_bytes = 256;
    let service = IndexService::open(config).unwrap();
    let version = service.data_source().current_version();
    let mut conn = service.connect();

    for n in 0..4u8 {
        conn.start(&xid(n)).unwrap();
        conn.index(EntityId(n as i64), "name", "a fairly long value to grow the log").unwrap();
        conn.commit(&xid(n), true).unwrap();
        assert!(service.stats().log_size_bytes < 256);
    }

    assert!(service.data_source().current_version() > version);
    assert_eq!(service.stats().last_committed_tx, 4);
    assert_eq!(service.nodes("name", "a fairly long value to grow the log").unwrap().size(), 4);
}

#[test]
fn files_cut_short_at_creation_do_not_block_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let service = IndexService::open(Config::new(dir.path())).unwrap();
        let mut conn = service.connect();
        conn.start(&xid(1)).unwrap();
        conn.index(EntityId(1), "name", "alice").unwrap();
        conn.commit(&xid(1), true).unwrap();
    }

    std::fs::write(dir.path().join("index.log"), [0u8; 3]).unwrap();
    std::fs::write(dir.path().join("index.meta"), [0u8; 7]).unwrap();

    let service = IndexService::open(Config::new(dir.path())).unwrap();
    assert_eq!(ids(&service, "name", "alice"), vec![1]);
    assert!(service.stats().health().is_healthy());

    let mut conn = service.connect();
    conn.start(&xid(2)).unwrap();
    conn.index(EntityId(2), "name", "alice").unwrap();
    conn.commit(&xid(2), true).unwrap();
    assert_eq!(ids(&service, "name", "alice"), vec![1, 2]);
}
