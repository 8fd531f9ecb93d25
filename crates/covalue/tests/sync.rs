//! Replication between nodes over in-memory links.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use covalue::core::{
    AgentSecret, CoId, CoValueHeader, CoValueType, CryptoProvider, DefaultCrypto, KnownState,
    NewContentMessage, PeerId, Uniqueness,
};
use covalue::sync::{connected_pair, KnownMessage, PeerRole, SyncMessage, Transport};
use covalue::{CoValueCore, LoadingStatus, LocalNode, Privacy, Role};
use covalue_testkit::fixtures::{connect, init_tracing, memory_storage, test_config, TestAgent};

#[tokio::test]
async fn test_nodes_sharing_storage_see_each_others_values() -> anyhow::Result<()> {
    init_tracing();
    let storage = memory_storage();
    let agent = TestAgent::new();

    let a = agent.node(Some(storage.clone()))?;
    let group = a.create_group()?;
    let map = a.create_map(&group)?;
    a.map_set(&map, "title", "shared")?;
    a.wait_for_sync(&map).await?;

    let b = agent.node(Some(storage))?;
    b.load(&map).await?;
    assert_eq!(b.status(&group), LoadingStatus::Available);
    assert_eq!(b.map(&map)?.get("title"), Some(&json!("shared")));
    assert_eq!(b.known_state(&map), a.known_state(&map));
    Ok(())
}

#[tokio::test]
async fn test_member_reads_private_map_through_server() -> anyhow::Result<()> {
    init_tracing();
    let server = TestAgent::new().node(Some(memory_storage()))?;
    let alice = TestAgent::new();
    let bob = TestAgent::new();
    let carol = TestAgent::new();

    let a = alice.node(None)?;
    let b = bob.node(None)?;
    let c = carol.node(None)?;
    let _links = [connect(&a, &server)?, connect(&b, &server)?, connect(&c, &server)?];

    let group = a.create_group()?;
    a.add_member(&group, &bob.id, Role::Reader)?;
    let map = a.create_map(&group)?;
    a.map_set(&map, "secret", 42)?;
    a.wait_for_sync(&map).await?;

    b.load(&map).await?;
    assert_eq!(b.map(&map)?.get("secret"), Some(&json!(42)));
    assert_eq!(b.group(&group)?.role_of(&bob.id), Some(Role::Reader));

    c.load(&map).await?;
    let view = c.map(&map)?;
    assert!(view.is_empty());
    assert_eq!(view.unreadable_count(), 1);

    assert!(matches!(
        b.map_set(&map, "secret", 0),
        Err(covalue::NodeError::NotAuthorized(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_subscribed_client_receives_live_updates() -> anyhow::Result<()> {
    init_tracing();
    let server = TestAgent::new().node(Some(memory_storage()))?;
    let alice = TestAgent::new();
    let a = alice.node(None)?;
    let a2 = alice.node(None)?;
    let _l1 = connect(&a, &server)?;
    let _l2 = connect(&a2, &server)?;

    let group = a.create_group()?;
    let map = a.create_map(&group)?;
    a.map_set(&map, "n", 1)?;
    a.wait_for_sync(&map).await?;
    a2.load(&map).await?;

    a.map_set(&map, "n", 2)?;
    let target = a.known_state(&map).expect("map is available");
    a2.wait_for(&map, |core| target.is_subset_of(&core.known_state()))
        .await;
    assert_eq!(a2.map(&map)?.get("n"), Some(&json!(2)));
    Ok(())
}

#[tokio::test]
async fn test_content_past_what_server_has_is_corrected() -> anyhow::Result<()> {
    init_tracing();
    let server = TestAgent::new().node(Some(memory_storage()))?;
    let alice = TestAgent::new();
    let a = alice.node(None)?;
    let link = connect(&a, &server)?;

    // The first write never reaches the server.
    link.client_end()
        .set_outgoing_filter(|msg| !matches!(msg, SyncMessage::Content(_)));
    let group = a.create_group()?;
    let map = a.create_map(&group)?;
    a.map_set(&map, "k", "lost")?;
    link.client_end().clear_outgoing_filter();

    a.map_set(&map, "k", "kept")?;
    a.wait_for_sync(&map).await?;

    assert_eq!(server.known_state(&map), a.known_state(&map));
    assert_eq!(server.known_state(&group), a.known_state(&group));
    Ok(())
}

#[tokio::test]
async fn test_reconnect_pushes_offline_changes() -> anyhow::Result<()> {
    init_tracing();
    let server = TestAgent::new().node(Some(memory_storage()))?;
    let alice = TestAgent::new();
    let a = alice.node(Some(memory_storage()))?;
    let link = connect(&a, &server)?;

    let group = a.create_group()?;
    let map = a.create_map(&group)?;
    a.wait_for_sync(&map).await?;

    link.close();
    a.map_set(&map, "offline", true)?;
    assert_ne!(server.known_state(&map), a.known_state(&map));

    let _link = connect(&a, &server)?;
    a.wait_for_sync(&map).await?;
    assert_eq!(server.known_state(&map), a.known_state(&map));
    Ok(())
}

#[tokio::test]
async fn test_unknown_value_is_unavailable_without_peers() {
    let node = TestAgent::new().node(None).unwrap();
    let id = covalue::CoId::parse("co_zmissing").unwrap();
    assert!(matches!(
        node.load(&id).await,
        Err(covalue::NodeError::Unavailable(_))
    ));
    assert_eq!(node.status(&id), LoadingStatus::Unavailable);
}

#[tokio::test]
async fn test_shutdown_rejects_writes() {
    let node = LocalNode::new(
        AgentSecret::generate(&DefaultCrypto::new()),
        None,
        test_config(),
    )
    .unwrap();
    let group = node.create_group().unwrap();
    node.shutdown().await.unwrap();
    assert!(matches!(
        node.add_member(&group, &TestAgent::new().id, Role::Reader),
        Err(covalue::NodeError::Closed)
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted peer
// ─────────────────────────────────────────────────────────────────────────────

/// A hand-driven client attached to `node`.
fn scripted_peer(node: &LocalNode, name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let (ours, theirs) = connected_pair(name, "node");
    node.add_peer(PeerId::new(name), PeerRole::Client, Arc::new(theirs))?;
    Ok(Arc::new(ours))
}

async fn next_reply<T>(
    transport: &dyn Transport,
    pick: impl Fn(SyncMessage) -> Option<T>,
) -> anyhow::Result<T> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), transport.recv())
            .await??
            .ok_or_else(|| anyhow::anyhow!("transport closed"))?;
        if let Some(picked) = pick(msg) {
            return Ok(picked);
        }
    }
}

async fn next_known(transport: &dyn Transport, id: &CoId) -> anyhow::Result<KnownMessage> {
    next_reply(transport, |msg| match msg {
        SyncMessage::Known(known) if &known.id == id => Some(known),
        _ => None,
    })
    .await
}

/// Full content of `id` as `node` serves it to a fresh peer.
async fn fetch_content(node: &LocalNode, id: &CoId) -> anyhow::Result<NewContentMessage> {
    let peer = scripted_peer(node, "fetch")?;
    peer.send(SyncMessage::Load(KnownState::empty(id.clone())))?;
    let content = next_reply(peer.as_ref(), |msg| match msg {
        SyncMessage::Content(content) if &content.id == id => Some(content),
        _ => None,
    })
    .await?;
    node.remove_peer(&PeerId::new("fetch"));
    Ok(content)
}

fn trusting_list(node: &LocalNode) -> anyhow::Result<CoId> {
    let header = CoValueHeader::unsafe_allow_all(CoValueType::Colist, Uniqueness::random(&DefaultCrypto::new()));
    Ok(node.create(header)?)
}

#[tokio::test]
async fn test_content_with_invalid_assumption_gets_correction() -> anyhow::Result<()> {
    init_tracing();
    let alice = TestAgent::new().node(None)?;
    let list = trusting_list(&alice)?;
    alice.list_append(&list, [json!("a")])?;
    let first = fetch_content(&alice, &list).await?;
    alice.list_append(&list, [json!("b")])?;
    alice.list_append(&list, [json!("c")])?;
    let full = fetch_content(&alice, &list).await?;
    let session = alice.session_id().clone();

    let bob = TestAgent::new().node(None)?;
    let peer = scripted_peer(&bob, "scripted")?;
    peer.send(SyncMessage::Content(first))?;
    let reply = next_known(peer.as_ref(), &list).await?;
    assert!(!reply.is_correction);
    assert_eq!(reply.known_state().session_count(&session), 1);

    // Only the last transaction, claiming bob already has two.
    let mut gapped = full.clone();
    let content = gapped.new.get_mut(&session).expect("alice's session");
    content.new_transactions.drain(..2);
    content.after = 2;
    peer.send(SyncMessage::Content(gapped))?;

    let reply = next_known(peer.as_ref(), &list).await?;
    assert!(reply.is_correction);
    assert!(reply.header);
    assert_eq!(reply.known_state().session_count(&session), 1);
    assert_eq!(Some(reply.known_state()), bob.known_state(&list));

    // Answering the correction with the missing range completes the value.
    peer.send(SyncMessage::Content(full))?;
    let reply = next_known(peer.as_ref(), &list).await?;
    assert!(!reply.is_correction);
    assert_eq!(reply.known_state().session_count(&session), 3);
    assert_eq!(bob.list(&list)?.to_vec(), vec![json!("a"), json!("b"), json!("c")]);
    Ok(())
}

#[tokio::test]
async fn test_headerless_content_for_unknown_value_gets_empty_correction() -> anyhow::Result<()> {
    init_tracing();
    let alice = TestAgent::new().node(None)?;
    let list = trusting_list(&alice)?;
    alice.list_append(&list, [json!("a")])?;
    let mut content = fetch_content(&alice, &list).await?;
    content.header = None;

    let bob = TestAgent::new().node(None)?;
    let peer = scripted_peer(&bob, "scripted")?;
    peer.send(SyncMessage::Content(content))?;

    let reply = next_known(peer.as_ref(), &list).await?;
    assert!(reply.is_correction);
    assert!(!reply.header);
    assert!(reply.sessions.is_empty());
    assert_eq!(reply.known_state(), KnownState::empty(list.clone()));
    assert_eq!(bob.known_state(&list), None);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Delivery order
// ─────────────────────────────────────────────────────────────────────────────

/// Apply `msg` the way a receiving node does: slice what is new and drop
/// pieces that start past what is known.
fn deliver(core: &mut CoValueCore, msg: &NewContentMessage) {
    for (session, content) in &msg.new {
        let known = core.transactions_count(session);
        if let Some(txs) = content.new_transactions_for(known) {
            if !txs.is_empty() {
                core.try_add_transactions(session, txs, &content.last_signature, false)
                    .unwrap();
            }
        }
    }
}

fn source_with_writes(count: usize) -> (CoValueCore, Vec<NewContentMessage>) {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(DefaultCrypto::new());
    let agent = AgentSecret::generate(crypto.as_ref());
    let session = crypto.new_random_session_id(agent.id(crypto.as_ref()).unwrap().as_str());
    let header = CoValueHeader::unsafe_allow_all(CoValueType::Colist, Uniqueness::random(crypto.as_ref()));
    let id = header.id(crypto.as_ref()).unwrap();
    let mut core = CoValueCore::new(id, header, crypto, 1024).unwrap();

    let mut msgs = Vec::new();
    for n in 0..count {
        let signed = core
            .make_transaction(&session, &agent.signer, &[json!(n)], &Privacy::Trusting, None, n as u64)
            .unwrap();
        msgs.push(core.content_for_transaction(&session, &signed));
    }
    (core, msgs)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_delivery_order_and_duplicates_do_not_matter(
        count in 1usize..8,
        order in prop::collection::vec(0usize..8, 0..24),
    ) {
        let (source, msgs) = source_with_writes(count);
        let mut copy = CoValueCore::new(
            source.id().clone(),
            source.header().clone(),
            source.verified().crypto().clone(),
            1024,
        )
        .unwrap();

        for i in order.into_iter().filter(|i| *i < count) {
            deliver(&mut copy, &msgs[i]);
            prop_assert!(copy.known_state().is_subset_of(&source.known_state()));
        }
        for msg in &msgs {
            deliver(&mut copy, msg);
        }
        for msg in &msgs {
            deliver(&mut copy, msg);
        }
        prop_assert_eq!(copy.known_state(), source.known_state());
        prop_assert!(source.new_content_since(Some(&copy.known_state())).is_none());
        prop_assert_eq!(
            copy.new_content_since(Some(&KnownState::empty(source.id().clone()))).map(|m| m.len()),
            source.new_content_since(Some(&KnownState::empty(source.id().clone()))).map(|m| m.len())
        );
    }
}
