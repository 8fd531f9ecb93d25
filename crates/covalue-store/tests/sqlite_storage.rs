//! SQLite storage on disk: persistence across reopen, sharing between
//! storages, erasure and ordered intake.

use covalue_core::{
    CoId, CoValueHeader, CoValueType, KnownState, NewContentMessage, SessionId, Signature,
    Transaction, Uniqueness,
};
use covalue_store::{DbClient, SqliteDb, StorageApi, StorageSync, WorkerStorage};
use proptest::prelude::*;
use serde_json::json;

fn header() -> CoValueHeader {
    CoValueHeader::unsafe_allow_all(CoValueType::Colist, Uniqueness::String("disk".into()))
}

fn id() -> CoId {
    CoId::parse("co_zdisk").unwrap()
}

fn session(n: u8) -> SessionId {
    SessionId::new_session("sealer_z01/signer_z01", &format!("{n}"))
}

fn chunk(session_id: &SessionId, after: u32, count: u32, with_header: bool) -> NewContentMessage {
    let mut msg = NewContentMessage::create(id(), &header(), with_header);
    for idx in after..after + count {
        let tx = Transaction::trusting(&[json!({"op": "app", "value": idx})], None, idx as u64)
            .unwrap();
        let sig = Signature::parse(format!("signature_z{idx:06}")).unwrap();
        msg.add_transaction(session_id, tx, idx, sig);
    }
    msg
}

fn no_correction(_: &KnownState) -> Option<Vec<NewContentMessage>> {
    None
}

#[tokio::test]
async fn test_content_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("covalues.db");

    {
        let storage = StorageSync::new(SqliteDb::open(&path).unwrap());
        assert!(storage.store(chunk(&session(1), 0, 3, true), &no_correction).await.unwrap());
        assert!(storage.store(chunk(&session(2), 0, 1, false), &no_correction).await.unwrap());
        storage.close().await.unwrap();
    }

    let storage = StorageSync::new(SqliteDb::open(&path).unwrap());
    let known = storage.load_known_state(&id()).await.unwrap().unwrap();
    assert!(known.header);
    assert_eq!(known.session_count(&session(1)), 3);
    assert_eq!(known.session_count(&session(2)), 1);

    let loaded = storage.load(&id()).await.unwrap();
    assert!(loaded.found);
    let first = &loaded.content[0];
    assert_eq!(first.header.as_ref(), Some(&header()));
    assert_eq!(first.new[&session(1)].new_transactions.len(), 3);
    assert_eq!(first.new[&session(2)].new_transactions.len(), 1);
}

#[tokio::test]
async fn test_two_storages_share_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let a = StorageSync::new(SqliteDb::open(&path).unwrap());
    let b = StorageSync::new(SqliteDb::open(&path).unwrap());

    a.store(chunk(&session(1), 0, 2, true), &no_correction).await.unwrap();

    assert_eq!(b.get_known_state(&id()).session_count(&session(1)), 0);
    let loaded = b.load(&id()).await.unwrap();
    assert!(loaded.found);
    assert_eq!(b.get_known_state(&id()).session_count(&session(1)), 2);
}

#[tokio::test]
async fn test_worker_over_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteDb::open(dir.path().join("worker.db")).unwrap();
    let worker = WorkerStorage::spawn(StorageSync::new(db.clone()));

    assert!(worker.store(chunk(&session(1), 0, 4, true), &no_correction).await.unwrap());
    let row = db.get_covalue(&id()).unwrap().unwrap();
    assert_eq!(db.get_covalue_sessions(row.row_id).unwrap()[0].last_idx, 4);
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_erase_keeps_header_and_delete_session() {
    let db = SqliteDb::open_memory().unwrap();
    let storage = StorageSync::new(db.clone());
    storage.store(chunk(&session(1), 0, 5, true), &no_correction).await.unwrap();

    let delete_session = SessionId::new_delete_session("sealer_z01/signer_z01", "9");
    let mut delete = NewContentMessage::create(id(), &header(), false);
    let marker = Transaction::trusting(&[], Some(&json!({"deleted": id()})), 10).unwrap();
    delete.add_transaction(&delete_session, marker, 0, Signature::parse("signature_zdel").unwrap());

    storage.mark_delete_as_valid(&id());
    storage.store(delete, &no_correction).await.unwrap();
    assert_eq!(db.get_all_covalues_waiting_for_delete().unwrap(), vec![id()]);

    storage.erase_all_deleted_covalues().await.unwrap();

    storage.on_covalue_unmounted(&id());
    let loaded = storage.load(&id()).await.unwrap();
    assert!(loaded.found);
    let only = &loaded.content[0];
    assert!(only.header.is_some());
    assert_eq!(only.new.len(), 1);
    assert!(only.new.contains_key(&delete_session));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Chunks arriving in any order end with the full session, given that
    /// gaps are answered with what is missing.
    #[test]
    fn prop_any_arrival_order_converges(order in Just(vec![0u32, 1, 2, 3, 4]).prop_shuffle()) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let storage = StorageSync::new(SqliteDb::open_memory().unwrap());
            let s = session(1);
            let fill = |known: &KnownState| {
                let have = known.session_count(&s);
                Some(vec![chunk(&s, have, 10 - have, !known.header)])
            };
            for piece in &order {
                let after = piece * 2;
                let stored = storage.store(chunk(&s, after, 2, *piece == 0), &fill).await.unwrap();
                prop_assert!(stored);
            }
            prop_assert_eq!(storage.get_known_state(&id()).session_count(&s), 10);
            Ok(())
        })?;
    }
}
