//! Deleting values: tombstones, erasure and replication of the marker.

use serde_json::json;

use covalue::core::CoreError;
use covalue::{NodeError, Role};
use covalue_testkit::fixtures::{connect, init_tracing, memory_storage, sqlite_storage, TestAgent};

#[tokio::test]
async fn test_deleted_value_rejects_writes() -> anyhow::Result<()> {
    init_tracing();
    let node = TestAgent::new().node(Some(memory_storage()))?;
    let group = node.create_group()?;
    let map = node.create_map(&group)?;
    node.map_set(&map, "k", 1)?;

    node.delete_covalue(&map)?;
    assert!(node.is_deleted(&map));
    assert!(!node.is_deleted(&group));
    assert!(matches!(
        node.map_set(&map, "k", 2),
        Err(NodeError::Core(CoreError::DeletedCoValue(id))) if id == map
    ));
    Ok(())
}

#[tokio::test]
async fn test_groups_cannot_be_deleted() -> anyhow::Result<()> {
    let node = TestAgent::new().node(None)?;
    let group = node.create_group()?;
    assert!(matches!(
        node.delete_covalue(&group),
        Err(NodeError::WrongType { .. })
    ));
    assert!(!node.is_deleted(&group));
    Ok(())
}

#[tokio::test]
async fn test_erasure_keeps_only_the_tombstone() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("covalues.db");
    let agent = TestAgent::new();

    let (group, map) = {
        let node = agent.node(Some(sqlite_storage(&path)?))?;
        let group = node.create_group()?;
        let map = node.create_map(&group)?;
        node.map_set(&map, "title", "draft")?;
        node.map_set(&map, "body", "text")?;
        node.delete_covalue(&map)?;
        node.wait_for_sync(&map).await?;

        node.erase_deleted_covalues().await?;
        node.shutdown().await?;
        (group, map)
    };

    let reopened = agent.node(Some(sqlite_storage(&path)?))?;
    reopened.load(&map).await?;
    assert!(reopened.is_deleted(&map));
    assert!(reopened.map(&map)?.is_empty());

    let known = reopened.known_state(&map).expect("tombstone is loaded");
    assert!(known.header);
    assert!(known.sessions.keys().all(|session| session.is_delete_session()));

    reopened.load(&group).await?;
    assert_eq!(reopened.group(&group)?.role_of(&agent.id), Some(Role::Admin));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_erasure_sees_local_deletes_on_threaded_runtime() -> anyhow::Result<()> {
    init_tracing();
    let storage = memory_storage();
    let node = TestAgent::new().node(Some(storage.clone()))?;
    let group = node.create_group()?;

    for round in 0..40 {
        let map = node.create_map(&group)?;
        node.map_set(&map, "round", round)?;
        node.wait_for_sync(&map).await?;
        node.delete_covalue(&map)?;
        node.wait_for_sync(&map).await?;
        node.erase_deleted_covalues().await?;

        let stored = storage
            .load_known_state(&map)
            .await?
            .expect("tombstone stays in storage");
        assert!(stored.header);
        assert!(
            stored.sessions.keys().all(|session| session.is_delete_session()),
            "round {round}: history kept after erasure"
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_deletion_reaches_other_members() -> anyhow::Result<()> {
    init_tracing();
    let server = TestAgent::new().node(Some(memory_storage()))?;
    let alice = TestAgent::new();
    let bob = TestAgent::new();
    let a = alice.node(None)?;
    let b = bob.node(None)?;
    let _links = [connect(&a, &server)?, connect(&b, &server)?];

    let group = a.create_group()?;
    a.add_member(&group, &bob.id, Role::Reader)?;
    let map = a.create_map(&group)?;
    a.map_set(&map, "k", "v")?;
    a.wait_for_sync(&map).await?;

    b.load(&map).await?;
    assert_eq!(b.map(&map)?.get("k"), Some(&json!("v")));

    a.delete_covalue(&map)?;
    a.wait_for_sync(&map).await?;
    b.wait_for(&map, |core| core.is_deleted()).await;
    assert!(server.is_deleted(&map));
    assert!(b.is_deleted(&map));
    Ok(())
}

#[tokio::test]
async fn test_reader_cannot_delete() -> anyhow::Result<()> {
    init_tracing();
    let server = TestAgent::new().node(Some(memory_storage()))?;
    let alice = TestAgent::new();
    let bob = TestAgent::new();
    let a = alice.node(None)?;
    let b = bob.node(None)?;
    let _links = [connect(&a, &server)?, connect(&b, &server)?];

    let group = a.create_group()?;
    a.add_member(&group, &bob.id, Role::Reader)?;
    let map = a.create_map(&group)?;
    a.wait_for_sync(&map).await?;

    b.load(&map).await?;
    let _ = b.delete_covalue(&map);
    assert!(!b.is_deleted(&map));

    a.map_set(&map, "still", "writable")?;
    a.wait_for_sync(&map).await?;
    assert!(!server.is_deleted(&map));
    Ok(())
}
