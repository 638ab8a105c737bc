use std::thread;
use txindex::{Config, EntityId, Isolation, IndexService, Mutation, XaResource, Xid};

fn xid(n: u32) -> Xid {
    Xid::new(0x54, n.to_be_bytes().to_vec(), Vec::new()).unwrap()
}

fn ids_of(hits: txindex::IndexHits) -> Vec<i64> {
    let mut ids: Vec<i64> = hits.into_ids().unwrap().into_iter().map(|id| id.value()).collect();
    ids.sort();
    ids
}

#[test]
fn uncommitted_writes_are_private_to_their_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::open(Config::new(dir.path())).unwrap();
    let mut writer = service.connect();
    let mut reader = service.connect();

    writer.start(&xid(1)).unwrap();
    writer.index(EntityId(7), "name", "eve").unwrap();

    reader.start(&xid(2)).unwrap();
    assert_eq!(ids_of(writer.nodes("name", "eve").unwrap()), vec![7]);
    assert!(ids_of(reader.nodes("name", "eve").unwrap()).is_empty());
    assert!(ids_of(service.nodes("name", "eve").unwrap()).is_empty());

    writer.prepare(&xid(1)).unwrap();
    assert!(ids_of(reader.nodes("name", "eve").unwrap()).is_empty());

    writer.commit(&xid(1), false).unwrap();
    assert_eq!(ids_of(reader.nodes("name", "eve").unwrap()), vec![7]);
    reader.rollback(&xid(2)).unwrap();
}

#[test]
fn remove_right_after_index_cancels_out() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::open(Config::new(dir.path())).unwrap();
    let mut conn = service.connect();

    conn.start(&xid(1)).unwrap();
    conn.index(EntityId(1), "name", "alice").unwrap();
    conn.remove_value(EntityId(1), "name", "alice").unwrap();
    assert!(ids_of(conn.nodes("name", "alice").unwrap()).is_empty());
    conn.commit(&xid(1), true).unwrap();

    assert!(ids_of(service.nodes("name", "alice").unwrap()).is_empty());
}

#[test]
fn committed_removal_invalidates_cached_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::open(Config::new(dir.path()).with_cache("name", 32)).unwrap();
    let mut conn = service.connect();

    conn.start(&xid(1)).unwrap();
    conn.index(EntityId(1), "name", "alice").unwrap();
    conn.index(EntityId(2), "name", "bob").unwrap();
    conn.commit(&xid(1), true).unwrap();

    // fill, then hit
    assert_eq!(ids_of(service.nodes("name", "alice").unwrap()), vec![1]);
    assert_eq!(ids_of(service.nodes("name", "alice").unwrap()), vec![1]);
    assert_eq!(ids_of(service.nodes("name", "bob").unwrap()), vec![2]);
    let hits_before = service.stats().cache_stats.hit_count;
    assert!(hits_before >= 1);

    conn.start(&xid(2)).unwrap();
    conn.remove_value(EntityId(1), "name", "alice").unwrap();
    conn.index(EntityId(3), "name", "alice").unwrap();
    conn.commit(&xid(2), true).unwrap();

    assert_eq!(ids_of(service.nodes("name", "alice").unwrap()), vec![3]);
    assert_eq!(ids_of(service.nodes("name", "bob").unwrap()), vec![2]);
    // bob was untouched and still served from the cache
    assert!(service.stats().cache_stats.hit_count > hits_before);
}

#[test]
fn lazy_hits_keep_reading_their_own_generation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new(dir.path());
    config.lazy_threshold = 3;
    let service = IndexService::open(config).unwrap();
    let mut conn = service.connect();

    conn.start(&xid(1)).unwrap();
    for entity in 0..10 {
        conn.index(EntityId(entity), "kind", "user").unwrap();
    }
    conn.commit(&xid(1), true).unwrap();

    let hits = service.nodes("kind", "user").unwrap();
    assert!(hits.is_lazy());
    assert_eq!(hits.size(), 10);

    conn.start(&xid(2)).unwrap();
    conn.drop_key("kind").unwrap();
    conn.commit(&xid(2), true).unwrap();

    assert_eq!(ids_of(hits), (0..10).collect::<Vec<_>>());
    assert_eq!(service.stats().live_references, 0);
    assert!(ids_of(service.nodes("kind", "user").unwrap()).is_empty());
}

#[test]
fn other_tx_sync_does_not_join_the_open_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::open(Config::new(dir.path())).unwrap();
    let mut conn = service.connect();

    conn.start(&xid(1)).unwrap();
    conn.index(EntityId(1), "name", "alice").unwrap();
    conn.apply(
        Isolation::OtherTxSync,
        Mutation::Add { entity: EntityId(2), key: "name".into(), value: "alice".into() },
    )
    .unwrap();

    assert_eq!(ids_of(service.nodes("name", "alice").unwrap()), vec![2]);
    assert_eq!(ids_of(conn.nodes("name", "alice").unwrap()), vec![1, 2]);

    conn.rollback(&xid(1)).unwrap();
    assert_eq!(ids_of(service.nodes("name", "alice").unwrap()), vec![2]);
}

#[test]
fn keys_commit_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let service = IndexService::open(Config::new(dir.path())).unwrap();

    thread::scope(|scope| {
        for worker in 0..4u32 {
            let service = &service;
            scope.spawn(move || {
                let mut conn = service.connect();
                for round in 0..5u32 {
                    let id = xid(worker * 100 + round);
                    conn.start(&id).unwrap();
                    conn.index(EntityId((worker * 100 + round) as i64), &format!("key{}", worker), "v").unwrap();
                    conn.index(EntityId((worker * 100 + round) as i64), "shared", "v").unwrap();
                    conn.prepare(&id).unwrap();
                    conn.commit(&id, false).unwrap();
                }
            });
        }
    });

    for worker in 0..4 {
        assert_eq!(service.nodes(&format!("key{}", worker), "v").unwrap().size(), 5);
    }
    assert_eq!(service.nodes("shared", "v").unwrap().size(), 20);
    assert_eq!(service.stats().last_committed_tx, 20);
    assert_eq!(service.stats().open_transactions, 0);
}
