mod common;

use std::time::Duration;

use anyhow::{anyhow, Result};
use common::{acquire_db_lock, TestApp};
use coderoom::crdt;
use coderoom::doclog::{self, DocLogError};
use coderoom::documents::{self, Role};
use coderoom::error::ErrorKind;
use coderoom::hub::{Hub, Peer};
use coderoom::realtime::protocol::ServerMessage;
use coderoom::storage::{snapshot_key, ObjectStorage};
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{GetString, Text, Transact, Update};

/// Appends `text` to a client-side document and returns the v1 update a
/// real client would send.
fn edit_update(doc: &yrs::Doc, text: &str) -> Vec<u8> {
    let root = doc.get_or_insert_text(crdt::TEXT_ROOT);
    let mut txn = doc.transact_mut();
    let len = root.get_string(&txn).chars().count() as u32;
    root.insert(&mut txn, len, text);
    txn.encode_update_v1()
}

fn apply(doc: &yrs::Doc, bytes: &[u8]) {
    let update = Update::decode_v1(bytes).expect("valid update");
    doc.transact_mut().apply_update(update).expect("applies");
}

async fn create_document(app: &TestApp, subject: &str) -> Result<(Uuid, Uuid)> {
    let owner = app.upsert_user(subject, subject).await?;
    let subject_owner = owner;
    let document = app
        .with_conn(move |conn| {
            documents::create(conn, subject_owner, "collab", None).map_err(|err| anyhow!("{err}"))
        })
        .await?;
    Ok((document.id, owner))
}

fn peer(user_id: Uuid, role: Role) -> (Peer, mpsc::UnboundedReceiver<ServerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Peer {
            user_id,
            name: Some("peer".to_string()),
            role,
            presence: None,
            tx,
        },
        rx,
    )
}

async fn next_matching<F>(
    rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    mut predicate: F,
) -> Option<ServerMessage>
where
    F: FnMut(&ServerMessage) -> bool,
{
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        while let Some(message) = rx.recv().await {
            if predicate(&message) {
                return Some(message);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn concurrent_appends_assign_contiguous_sequences() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (document_id, owner) = create_document(&app, "auth0|writer").await?;

    let mut handles = Vec::new();
    for i in 0u8..10 {
        let pool = app.state.pool.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().expect("pooled connection");
            doclog::append(&mut conn, document_id, Some(owner), vec![i])
        }));
    }

    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.await??);
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());

    let state = app
        .with_conn(move |conn| {
            doclog::read_state(conn, document_id).map_err(|err| anyhow!("{err}"))
        })
        .await?;
    assert_eq!(state.latest_update_seq, 10);

    let entries = app
        .with_conn(move |conn| doclog::tail(conn, document_id, 4).map_err(|err| anyhow!("{err}")))
        .await?;
    assert_eq!(
        entries.iter().map(|e| e.seq).collect::<Vec<i64>>(),
        vec![5, 6, 7, 8, 9, 10]
    );

    Ok(())
}

#[tokio::test]
async fn append_to_unknown_document_reports_missing() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let result = app
        .with_conn(move |conn| {
            Ok(doclog::append(
                conn,
                Uuid::new_v4(),
                None,
                vec![1, 2, 3],
            ))
        })
        .await?;
    assert!(matches!(result, Err(DocLogError::DocumentMissing)));
    Ok(())
}

#[tokio::test]
async fn snapshot_mark_prunes_and_guards_regressions() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (document_id, owner) = create_document(&app, "auth0|snap").await?;

    for i in 0u8..3 {
        app.with_conn(move |conn| {
            doclog::append(conn, document_id, Some(owner), vec![i]).map_err(|err| anyhow!("{err}"))
        })
        .await?;
    }

    // Beyond the log head is refused.
    let result = app
        .with_conn(move |conn| Ok(doclog::snapshot_mark(conn, document_id, 9, "k", false)))
        .await?;
    assert!(matches!(result, Err(DocLogError::Conflict(_))));

    app.with_conn(move |conn| {
        doclog::snapshot_mark(conn, document_id, 3, "docs/x/snapshots/3.bin", true)
            .map_err(|err| anyhow!("{err}"))
    })
    .await?;

    let state = app
        .with_conn(move |conn| {
            doclog::read_state(conn, document_id).map_err(|err| anyhow!("{err}"))
        })
        .await?;
    assert_eq!(state.latest_snapshot_seq, 3);
    assert_eq!(state.latest_update_seq, 3);

    let entries = app
        .with_conn(move |conn| doclog::tail(conn, document_id, 0).map_err(|err| anyhow!("{err}")))
        .await?;
    assert!(entries.is_empty(), "pruned entries must be gone");

    // Moving the pointer backwards is refused.
    let result = app
        .with_conn(move |conn| Ok(doclog::snapshot_mark(conn, document_id, 2, "k2", false)))
        .await?;
    assert!(matches!(result, Err(DocLogError::Conflict(_))));

    Ok(())
}

#[tokio::test]
async fn joining_peer_receives_snapshot_and_tail() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (document_id, owner) = create_document(&app, "auth0|initsnap").await?;

    // A client edits three times; the first two are compacted into a
    // snapshot, the third stays in the log.
    let client = yrs::Doc::new();
    for (i, piece) in ["alpha ", "beta ", "gamma"].iter().enumerate() {
        let bytes = edit_update(&client, piece);
        let seq = app
            .with_conn(move |conn| {
                doclog::append(conn, document_id, Some(owner), bytes)
                    .map_err(|err| anyhow!("{err}"))
            })
            .await?;
        assert_eq!(seq, i as i64 + 1);
    }

    let prefix = yrs::Doc::new();
    let full_after_two = {
        let entries = app
            .with_conn(move |conn| {
                doclog::tail(conn, document_id, 0).map_err(|err| anyhow!("{err}"))
            })
            .await?;
        for entry in &entries[..2] {
            apply(&prefix, &entry.update_bytes);
        }
        crdt::encode_full_state(&prefix)
    };

    let key = snapshot_key(document_id, 2);
    app.storage()
        .put_object(&key, full_after_two, None)
        .await?;
    let mark_key = key.clone();
    app.with_conn(move |conn| {
        doclog::snapshot_mark(conn, document_id, 2, &mark_key, true)
            .map_err(|err| anyhow!("{err}"))
    })
    .await?;

    let hub = Hub::new(
        document_id,
        app.state.pool.clone(),
        app.state.config.clone(),
        app.state.storage.clone(),
    );
    let user = app.upsert_user("auth0|joiner", "Joiner").await?;
    let (joiner, mut rx) = peer(user, Role::Viewer);
    hub.join(Uuid::new_v4(), joiner).await.map_err(|err| anyhow!("{err}"))?;

    let init = next_matching(&mut rx, |m| matches!(m, ServerMessage::Init { .. }))
        .await
        .expect("init message");
    let ServerMessage::Init {
        snapshot,
        snapshot_seq,
        updates,
        ..
    } = init
    else {
        unreachable!();
    };

    assert_eq!(snapshot_seq, 2);
    let snapshot = snapshot.expect("snapshot bytes present");
    assert_eq!(updates.iter().map(|u| u.seq).collect::<Vec<i64>>(), vec![3]);

    // Snapshot plus tail reproduces the client's text.
    let restored = yrs::Doc::new();
    apply(&restored, &snapshot);
    for update in &updates {
        apply(&restored, &update.bytes);
    }
    assert_eq!(crdt::text_content(&restored), "alpha beta gamma");

    Ok(())
}

#[tokio::test]
async fn unreadable_snapshot_with_pruned_tail_is_inconsistent() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (document_id, owner) = create_document(&app, "auth0|broken").await?;

    for i in 0u8..2 {
        app.with_conn(move |conn| {
            doclog::append(conn, document_id, Some(owner), vec![i]).map_err(|err| anyhow!("{err}"))
        })
        .await?;
    }

    // Pointer recorded and tail pruned, but the object is never written.
    let key = snapshot_key(document_id, 2);
    let mark_key = key.clone();
    app.with_conn(move |conn| {
        doclog::snapshot_mark(conn, document_id, 2, &mark_key, true)
            .map_err(|err| anyhow!("{err}"))
    })
    .await?;

    let hub = Hub::new(
        document_id,
        app.state.pool.clone(),
        app.state.config.clone(),
        app.state.storage.clone(),
    );
    let user = app.upsert_user("auth0|victim", "Victim").await?;
    let (joiner, _rx) = peer(user, Role::Viewer);
    let err = hub
        .join(Uuid::new_v4(), joiner)
        .await
        .expect_err("load must fail");
    assert_eq!(err.kind(), ErrorKind::InconsistentState);

    Ok(())
}

#[tokio::test]
async fn two_peers_converge_and_viewer_cannot_edit() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (document_id, owner) = create_document(&app, "auth0|pair").await?;
    let second = app.upsert_user("auth0|pair2", "Pair Two").await?;

    let hub = app.state.hubs.get_or_create(document_id).await;

    let (peer_a, mut rx_a) = peer(owner, Role::Owner);
    let (peer_b, mut rx_b) = peer(second, Role::Editor);
    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();
    hub.join(id_a, peer_a).await.map_err(|err| anyhow!("{err}"))?;
    hub.join(id_b, peer_b).await.map_err(|err| anyhow!("{err}"))?;

    let doc_a = yrs::Doc::new();
    let doc_b = yrs::Doc::new();

    let update_a = edit_update(&doc_a, "hello ");
    let seq_a = hub
        .submit_update(id_a, update_a)
        .await
        .map_err(|err| anyhow!("{err}"))?;
    let update_b = edit_update(&doc_b, "world");
    let seq_b = hub
        .submit_update(id_b, update_b)
        .await
        .map_err(|err| anyhow!("{err}"))?;
    assert_eq!((seq_a, seq_b), (1, 2));

    // Each peer receives the other's update, not an echo of its own.
    let to_b = next_matching(&mut rx_b, |m| matches!(m, ServerMessage::Update { .. }))
        .await
        .expect("update for b");
    let ServerMessage::Update { seq, bytes, .. } = to_b else {
        unreachable!();
    };
    assert_eq!(seq, 1);
    apply(&doc_b, &bytes);

    let to_a = next_matching(&mut rx_a, |m| matches!(m, ServerMessage::Update { .. }))
        .await
        .expect("update for a");
    let ServerMessage::Update { seq, bytes, .. } = to_a else {
        unreachable!();
    };
    assert_eq!(seq, 2);
    apply(&doc_a, &bytes);

    assert_eq!(crdt::text_content(&doc_a), crdt::text_content(&doc_b));

    let state = app
        .with_conn(move |conn| {
            doclog::read_state(conn, document_id).map_err(|err| anyhow!("{err}"))
        })
        .await?;
    assert_eq!(state.latest_update_seq, 2);

    // A viewer's update is refused and nothing is appended.
    let third = app.upsert_user("auth0|viewer", "Viewer").await?;
    let (peer_c, _rx_c) = peer(third, Role::Viewer);
    let id_c = Uuid::new_v4();
    hub.join(id_c, peer_c).await.map_err(|err| anyhow!("{err}"))?;
    let err = hub
        .submit_update(id_c, edit_update(&yrs::Doc::new(), "nope"))
        .await
        .expect_err("viewer edit must fail");
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    Ok(())
}

#[tokio::test]
async fn presence_is_relayed_and_cleared_on_disconnect() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (document_id, owner) = create_document(&app, "auth0|presence").await?;
    let second = app.upsert_user("auth0|presence2", "Observer").await?;

    let hub = app.state.hubs.get_or_create(document_id).await;

    let (peer_a, _rx_a) = peer(owner, Role::Owner);
    let (peer_b, mut rx_b) = peer(second, Role::Viewer);
    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();
    hub.join(id_a, peer_a).await.map_err(|err| anyhow!("{err}"))?;
    hub.join(id_b, peer_b).await.map_err(|err| anyhow!("{err}"))?;

    hub.publish_presence(id_a, Some(vec![7, 7, 7])).await;
    let relayed = next_matching(&mut rx_b, |m| matches!(m, ServerMessage::Presence { .. }))
        .await
        .expect("presence relayed");
    let ServerMessage::Presence { peer_id, bytes, .. } = relayed else {
        unreachable!();
    };
    assert_eq!(peer_id, id_a);
    assert_eq!(bytes, Some(vec![7, 7, 7]));

    // Disconnect clears the record for everyone still connected.
    hub.remove_peer(id_a).await;
    let cleared = next_matching(&mut rx_b, |m| matches!(m, ServerMessage::Presence { .. }))
        .await
        .expect("presence cleared");
    let ServerMessage::Presence { peer_id, bytes, .. } = cleared else {
        unreachable!();
    };
    assert_eq!(peer_id, id_a);
    assert!(bytes.is_none());

    hub.remove_peer(id_b).await;

    // A fresh joiner sees no stale presence.
    let third = app.upsert_user("auth0|presence3", "Late").await?;
    let (peer_c, mut rx_c) = peer(third, Role::Viewer);
    hub.join(Uuid::new_v4(), peer_c)
        .await
        .map_err(|err| anyhow!("{err}"))?;
    next_matching(&mut rx_c, |m| matches!(m, ServerMessage::Init { .. }))
        .await
        .expect("init");
    let stale = tokio::time::timeout(Duration::from_millis(200), async {
        next_matching(&mut rx_c, |m| matches!(m, ServerMessage::Presence { .. })).await
    })
    .await;
    assert!(
        stale.is_err() || stale.unwrap().is_none(),
        "no presence may survive a full disconnect"
    );

    Ok(())
}

#[tokio::test]
async fn snapshot_policy_compacts_after_n_updates() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new_with(|config| {
        config.snapshot_every_n_updates = 3;
        config.prune_updates_before_snapshot = true;
    })
    .await?;
    let (document_id, owner) = create_document(&app, "auth0|compact").await?;

    let hub = app.state.hubs.get_or_create(document_id).await;
    let (editor, _rx) = peer(owner, Role::Owner);
    let editor_id = Uuid::new_v4();
    hub.join(editor_id, editor)
        .await
        .map_err(|err| anyhow!("{err}"))?;

    let client = yrs::Doc::new();
    for piece in ["one ", "two ", "three"] {
        hub.submit_update(editor_id, edit_update(&client, piece))
            .await
            .map_err(|err| anyhow!("{err}"))?;
    }

    // The snapshot task is asynchronous; poll until it lands.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = app
            .with_conn(move |conn| {
                doclog::read_state(conn, document_id).map_err(|err| anyhow!("{err}"))
            })
            .await?;
        if state.latest_snapshot_seq == 3 {
            assert_eq!(
                state.latest_snapshot_key.as_deref(),
                Some(snapshot_key(document_id, 3).as_str())
            );
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("snapshot never recorded");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let entries = app
        .with_conn(move |conn| doclog::tail(conn, document_id, 0).map_err(|err| anyhow!("{err}")))
        .await?;
    assert!(entries.is_empty(), "log must be pruned after the snapshot");

    // A new joiner reconstructs the full text from the snapshot alone.
    let late = app.upsert_user("auth0|late", "Late").await?;
    let (late_peer, mut rx) = peer(late, Role::Viewer);
    hub.join(Uuid::new_v4(), late_peer)
        .await
        .map_err(|err| anyhow!("{err}"))?;
    let init = next_matching(&mut rx, |m| matches!(m, ServerMessage::Init { .. }))
        .await
        .expect("init");
    let ServerMessage::Init {
        snapshot,
        snapshot_seq,
        updates,
        ..
    } = init
    else {
        unreachable!();
    };
    assert_eq!(snapshot_seq, 3);
    assert!(updates.is_empty());

    let restored = yrs::Doc::new();
    apply(&restored, &snapshot.expect("snapshot bytes"));
    assert_eq!(crdt::text_content(&restored), "one two three");

    Ok(())
}
