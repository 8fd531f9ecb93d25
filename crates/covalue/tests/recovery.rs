//! Sessions that diverged between two nodes of the same agent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use covalue::core::{
    CoId, CoValueHeader, CoValueType, DefaultCrypto, KnownState, NewContentMessage, PeerId,
    SessionNewContent, Uniqueness,
};
use covalue::store::StorageApi;
use covalue::LocalNode;
use covalue::sync::{connected_pair, ErrorMessage, KnownMessage, PeerRole, SyncMessage, Transport};
use covalue_testkit::fixtures::{connect, init_tracing, memory_storage, test_config, TestAgent};

#[tokio::test]
async fn test_owner_adopts_server_history_and_replays_its_tail() -> anyhow::Result<()> {
    init_tracing();
    let server_storage = memory_storage();
    let server = TestAgent::new().node(Some(server_storage.clone()))?;
    let alice = TestAgent::new();
    let session = alice.session();

    let a = alice.node_in_session(session.clone(), Some(memory_storage()), test_config())?;
    let link = connect(&a, &server)?;
    let group = a.create_group()?;
    let map = a.create_map(&group)?;
    a.map_set(&map, "k", "v0")?;
    a.wait_for_sync(&map).await?;
    let before = a.known_state(&map).unwrap().session_count(&session);

    // A goes offline; a second node reusing the session writes first.
    link.close();
    let a2 = alice.node_in_session(session.clone(), None, test_config())?;
    let _l2 = connect(&a2, &server)?;
    a2.load(&map).await?;
    a2.map_set(&map, "k", "x")?;
    a2.wait_for_sync(&map).await?;

    a.map_set(&map, "k", "v1")?;
    a.map_set(&map, "k", "v2")?;

    let _link = connect(&a, &server)?;
    a.wait_for_sync(&map).await?;

    let known = a.known_state(&map).unwrap();
    assert_eq!(known.session_count(&session), before + 3);
    assert_eq!(server.known_state(&map), Some(known.clone()));
    assert_eq!(a.map(&map)?.get("k"), Some(&json!("v2")));

    let target = known.clone();
    a2.wait_for(&map, |core| target.is_subset_of(&core.known_state()))
        .await;
    assert_eq!(a2.map(&map)?.get("k"), Some(&json!("v2")));

    // The repaired session is what the server stored.
    server.wait_for_sync(&map).await?;
    let a3 = alice.node(Some(server_storage))?;
    a3.load(&map).await?;
    assert_eq!(a3.known_state(&map), Some(known));
    assert_eq!(a3.map(&map)?.get("k"), Some(&json!("v2")));
    Ok(())
}

/// A raw peer attached to `node` as a client.
fn attach_raw_peer(node: &covalue::LocalNode) -> anyhow::Result<Arc<dyn Transport>> {
    let (ours, theirs) = connected_pair("raw", "node");
    node.add_peer(PeerId::new("raw"), PeerRole::Client, Arc::new(theirs))?;
    Ok(Arc::new(ours))
}

async fn next_known(transport: &dyn Transport) -> anyhow::Result<KnownMessage> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), transport.recv())
            .await??
            .ok_or_else(|| anyhow::anyhow!("transport closed"))?;
        if let SyncMessage::Known(known) = msg {
            return Ok(known);
        }
    }
}

#[tokio::test]
async fn test_mismatch_in_foreign_session_is_ignored() -> anyhow::Result<()> {
    init_tracing();
    let bob = TestAgent::new().node(None)?;
    let group = bob.create_group()?;
    let before = bob.known_state(&group);

    let raw = attach_raw_peer(&bob)?;
    let stranger = TestAgent::new();
    raw.send(SyncMessage::Error(ErrorMessage::signature_mismatch(
        group.clone(),
        stranger.session(),
        Vec::new(),
        "test",
    )))?;

    // Still serving requests afterwards.
    raw.send(SyncMessage::Load(covalue::KnownState::empty(group.clone())))?;
    let known = loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), raw.recv())
            .await??
            .ok_or_else(|| anyhow::anyhow!("transport closed"))?;
        match msg {
            SyncMessage::Content(content) => break content.known_state(),
            SyncMessage::Known(known) => break known.known_state(),
            _ => continue,
        }
    };
    assert_eq!(Some(known.sessions), before.clone().map(|k| k.sessions));
    assert_eq!(bob.known_state(&group), before);
    Ok(())
}

#[tokio::test]
async fn test_unverifiable_history_leaves_session_untouched() -> anyhow::Result<()> {
    init_tracing();
    let bob = TestAgent::new();
    let node = bob.node(Some(memory_storage()))?;
    let group = node.create_group()?;
    let before = node.known_state(&group);

    // Mallory's own session content, presented as Bob's.
    let mallory = TestAgent::new().node(None)?;
    let mallory_group = mallory.create_group()?;
    let from_mallory = attach_raw_peer(&mallory)?;
    from_mallory.send(SyncMessage::Load(covalue::KnownState::empty(mallory_group)))?;
    let forged: Vec<SessionNewContent> = loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), from_mallory.recv())
            .await??
            .ok_or_else(|| anyhow::anyhow!("transport closed"))?;
        if let SyncMessage::Content(content) = msg {
            break content.new.into_values().collect();
        }
    };

    let raw = attach_raw_peer(&node)?;
    raw.send(SyncMessage::Error(ErrorMessage::signature_mismatch(
        group.clone(),
        node.session_id().clone(),
        forged,
        "test",
    )))?;
    raw.send(SyncMessage::Load(covalue::KnownState::empty(
        covalue::CoId::parse("co_zunrelated")?,
    )))?;
    let reply = next_known(raw.as_ref()).await?;
    assert!(!reply.header);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(node.known_state(&group), before);
    assert_eq!(node.group(&group)?.role_of(&bob.id), Some(covalue::Role::Admin));
    Ok(())
}

/// Content of `id` as `node` serves it to a fresh peer.
async fn fetch(node: &LocalNode, id: &CoId) -> anyhow::Result<NewContentMessage> {
    let raw = attach_raw_peer(node)?;
    raw.send(SyncMessage::Load(KnownState::empty(id.clone())))?;
    let content = loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), raw.recv())
            .await??
            .ok_or_else(|| anyhow::anyhow!("transport closed"))?;
        if let SyncMessage::Content(content) = msg {
            break content;
        }
    };
    node.remove_peer(&PeerId::new("raw"));
    Ok(content)
}

/// Two nodes in one session, each with a second transaction the other lacks.
/// Returns the first node, the list and the other node's history.
async fn diverged(
    storage: Option<Arc<dyn StorageApi>>,
) -> anyhow::Result<(LocalNode, CoId, Vec<SessionNewContent>)> {
    let alice = TestAgent::new();
    let session = alice.session();
    let a = alice.node_in_session(session.clone(), storage, test_config())?;
    let header = CoValueHeader::unsafe_allow_all(CoValueType::Colist, Uniqueness::random(&DefaultCrypto::new()));
    let list = a.create(header)?;
    a.list_append(&list, [json!("shared")])?;

    let a2 = alice.node_in_session(session.clone(), None, test_config())?;
    let first = fetch(&a, &list).await?;
    let raw = attach_raw_peer(&a2)?;
    raw.send(SyncMessage::Content(first))?;
    next_known(raw.as_ref()).await?;
    a2.remove_peer(&PeerId::new("raw"));
    a2.list_append(&list, [json!("theirs")])?;

    a.list_append(&list, [json!("mine")])?;
    let mut theirs = fetch(&a2, &list).await?;
    let history = theirs.new.shift_remove(&session).into_iter().collect();
    Ok((a, list, history))
}

#[tokio::test]
async fn test_owner_without_storage_skips_recovery() -> anyhow::Result<()> {
    init_tracing();
    let (a, list, history) = diverged(None).await?;
    let before = a.known_state(&list);

    let raw = attach_raw_peer(&a)?;
    raw.send(SyncMessage::Error(ErrorMessage::signature_mismatch(
        list.clone(),
        a.session_id().clone(),
        history,
        "test",
    )))?;
    raw.send(SyncMessage::Load(KnownState::empty(CoId::parse("co_zunrelated")?)))?;
    next_known(raw.as_ref()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(a.known_state(&list), before);
    assert_eq!(a.list(&list)?.to_vec(), vec![json!("shared"), json!("mine")]);
    Ok(())
}

#[tokio::test]
async fn test_owner_with_storage_adopts_history() -> anyhow::Result<()> {
    init_tracing();
    let (a, list, history) = diverged(Some(memory_storage())).await?;
    let session = a.session_id().clone();

    let raw = attach_raw_peer(&a)?;
    raw.send(SyncMessage::Error(ErrorMessage::signature_mismatch(
        list.clone(),
        session.clone(),
        history,
        "test",
    )))?;
    tokio::time::timeout(
        Duration::from_secs(5),
        a.wait_for(&list, |core| core.known_state().session_count(&session) == 3),
    )
    .await?;

    let mut items = a.list(&list)?.to_vec();
    items.sort_by_key(|item| item.to_string());
    assert_eq!(items, vec![json!("mine"), json!("shared"), json!("theirs")]);
    Ok(())
}
