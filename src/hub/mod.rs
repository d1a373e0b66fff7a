//! Per-document coordinator. One `Hub` instance exists per active document
//! and is the serialization domain for that document: load, append+broadcast
//! and snapshot bookkeeping all run under the document lock, while presence
//! relay only touches the peer map and proceeds in parallel with edits.

pub mod registry;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::crdt;
use crate::doclog::{self, DocLogError};
use crate::documents::Role;
use crate::error::{AppError, AppResult};
use crate::realtime::protocol::{PeerInfo, SeqUpdate, ServerMessage};
use crate::state::PgPool;
use crate::storage::{self, ObjectStorage, SNAPSHOT_CONTENT_TYPE};

/// A connected peer, addressed by the connection's peer id. The sender is
/// the only handle the hub keeps; the gateway owns the socket.
#[derive(Clone)]
pub struct Peer {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub role: Role,
    pub presence: Option<Vec<u8>>,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
}

struct DocState {
    loaded: bool,
    doc: yrs::Doc,
    /// Highest log sequence applied to the cached document.
    applied_seq: i64,
    /// Sequence of the snapshot bytes cached below; 0 when none are held.
    snapshot_seq: i64,
    snapshot_bytes: Option<Vec<u8>>,
    /// Sequences of snapshot objects written by this process, oldest first.
    snapshot_history: VecDeque<i64>,
    last_snapshot_at: Instant,
    pending_updates: u64,
    snapshot_inflight: bool,
}

pub struct Hub {
    document_id: Uuid,
    pool: PgPool,
    config: Arc<AppConfig>,
    storage: Option<Arc<dyn ObjectStorage>>,
    doc: Mutex<DocState>,
    peers: RwLock<HashMap<Uuid, Peer>>,
    peer_count: AtomicUsize,
    empty_since: StdMutex<Option<Instant>>,
    closed: AtomicBool,
}

impl Hub {
    pub fn new(
        document_id: Uuid,
        pool: PgPool,
        config: Arc<AppConfig>,
        storage: Option<Arc<dyn ObjectStorage>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            document_id,
            pool,
            config,
            storage,
            doc: Mutex::new(DocState {
                loaded: false,
                doc: crdt::new_doc(),
                applied_seq: 0,
                snapshot_seq: 0,
                snapshot_bytes: None,
                snapshot_history: VecDeque::new(),
                last_snapshot_at: Instant::now(),
                pending_updates: 0,
                snapshot_inflight: false,
            }),
            peers: RwLock::new(HashMap::new()),
            peer_count: AtomicUsize::new(0),
            empty_since: StdMutex::new(Some(Instant::now())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the hub closed if it still has no peers. Called by the
    /// registry under its write lock during eviction.
    pub(crate) fn close_if_empty(&self) -> bool {
        if self.peer_count.load(Ordering::SeqCst) == 0 {
            self.closed.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.empty_since
            .lock()
            .expect("empty_since lock poisoned")
            .map(|since| since.elapsed())
    }

    /// Registers a peer and queues its `init` payload. Everything happens
    /// under the document lock, so the init is complete up to some sequence
    /// and every later broadcast the peer sees has a higher one.
    pub async fn join(&self, peer_id: Uuid, peer: Peer) -> AppResult<()> {
        self.peer_count.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            self.peer_count.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::transient("document room is restarting"));
        }
        *self.empty_since.lock().expect("empty_since lock poisoned") = None;

        let mut state = self.doc.lock().await;
        if let Err(err) = self.ensure_loaded(&mut state).await {
            self.note_peer_gone();
            return Err(err);
        }

        let init = self.build_init(&state).await;
        let init = match init {
            Ok(init) => init,
            Err(err) => {
                self.note_peer_gone();
                return Err(err);
            }
        };

        let mut peers = self.peers.write().await;

        let _ = peer.tx.send(init);

        // Late joiners see existing cursors twice over: the records the hub
        // already holds, plus a republish request to the live peers.
        for (other_id, other) in peers.iter() {
            if let Some(presence) = &other.presence {
                let _ = peer.tx.send(ServerMessage::Presence {
                    document_id: self.document_id,
                    peer_id: *other_id,
                    bytes: Some(presence.clone()),
                });
            }
        }

        let roster: Vec<PeerInfo> = peers
            .iter()
            .map(|(id, p)| PeerInfo {
                peer_id: *id,
                name: p.name.clone(),
            })
            .chain(std::iter::once(PeerInfo {
                peer_id,
                name: peer.name.clone(),
            }))
            .collect();
        let _ = peer.tx.send(ServerMessage::ActivePeers {
            document_id: self.document_id,
            peers: roster,
        });

        for other in peers.values() {
            let _ = other.tx.send(ServerMessage::PeerJoined {
                document_id: self.document_id,
                peer_id,
                name: peer.name.clone(),
            });
            let _ = other.tx.send(ServerMessage::PresenceRequest {
                document_id: self.document_id,
            });
        }

        peers.insert(peer_id, peer);
        info!(document_id = %self.document_id, %peer_id, "peer joined");
        Ok(())
    }

    /// Persists an update from `peer_id`, applies it to the cache and
    /// broadcasts it to every other peer. Returns the assigned sequence.
    pub async fn submit_update(self: &Arc<Self>, peer_id: Uuid, bytes: Vec<u8>) -> AppResult<i64> {
        let (role, actor) = {
            let peers = self.peers.read().await;
            let peer = peers.get(&peer_id).ok_or_else(AppError::forbidden)?;
            (peer.role, peer.user_id)
        };
        if !role.can_edit() {
            return Err(AppError::forbidden());
        }

        let mut state = self.doc.lock().await;
        self.ensure_loaded(&mut state).await?;

        let pool = self.pool.clone();
        let document_id = self.document_id;
        let append_bytes = bytes.clone();
        let seq = task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            doclog::append(&mut conn, document_id, Some(actor), append_bytes)
                .map_err(doclog_error)
        })
        .await
        .map_err(AppError::internal)??;

        // Persistence is authoritative; a cache that refuses an update is
        // rebuilt from the log on the next load.
        if let Err(err) = crdt::apply_update(&state.doc, &bytes) {
            warn!(document_id = %self.document_id, seq, error = %err, "failed to apply update to cache");
        } else {
            state.applied_seq = seq;
        }
        state.pending_updates += 1;

        {
            let peers = self.peers.read().await;
            for (other_id, other) in peers.iter() {
                if *other_id == peer_id {
                    continue;
                }
                let _ = other.tx.send(ServerMessage::Update {
                    document_id: self.document_id,
                    seq,
                    bytes: bytes.clone(),
                });
            }
        }

        self.maybe_snapshot(&mut state);
        Ok(seq)
    }

    /// Relays a presence blob (or a clear) to the other peers. Runs without
    /// the document lock so cursors stay live during heavy edits.
    pub async fn publish_presence(&self, peer_id: Uuid, bytes: Option<Vec<u8>>) {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&peer_id) else {
            return;
        };
        peer.presence = bytes.clone();

        for (other_id, other) in peers.iter() {
            if *other_id == peer_id {
                continue;
            }
            let _ = other.tx.send(ServerMessage::Presence {
                document_id: self.document_id,
                peer_id,
                bytes: bytes.clone(),
            });
        }
    }

    /// Drops the peer, clears its presence for everyone else and announces
    /// the departure.
    pub async fn remove_peer(&self, peer_id: Uuid) {
        let mut peers = self.peers.write().await;
        if peers.remove(&peer_id).is_none() {
            return;
        }

        for other in peers.values() {
            let _ = other.tx.send(ServerMessage::Presence {
                document_id: self.document_id,
                peer_id,
                bytes: None,
            });
            let _ = other.tx.send(ServerMessage::PeerLeft {
                document_id: self.document_id,
                peer_id,
            });
        }
        drop(peers);

        self.note_peer_gone();
        info!(document_id = %self.document_id, %peer_id, "peer left");
    }

    pub async fn broadcast(&self, message: ServerMessage) {
        let peers = self.peers.read().await;
        for peer in peers.values() {
            let _ = peer.tx.send(message.clone());
        }
    }

    fn note_peer_gone(&self) {
        if self.peer_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.empty_since.lock().expect("empty_since lock poisoned") = Some(Instant::now());
        }
    }

    /// Load protocol: snapshot first, then the log tail. Falls back to full
    /// replay when snapshot bytes are unavailable, unless the tail below
    /// the pointer has been pruned, which is unrecoverable.
    async fn ensure_loaded(&self, state: &mut DocState) -> AppResult<()> {
        if state.loaded {
            return Ok(());
        }

        let pool = self.pool.clone();
        let document_id = self.document_id;
        let row = task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            doclog::read_state(&mut conn, document_id).map_err(doclog_error)
        })
        .await
        .map_err(AppError::internal)??;

        let mut snapshot_bytes = None;
        if let (Some(key), Some(storage)) = (&row.latest_snapshot_key, &self.storage) {
            match storage.get_object(key).await {
                Ok(Some(bytes)) => snapshot_bytes = Some(bytes),
                Ok(None) => {
                    warn!(document_id = %self.document_id, key = %key, "snapshot object missing")
                }
                Err(err) => {
                    warn!(document_id = %self.document_id, key = %key, error = %err, "snapshot fetch failed")
                }
            }
        }

        let doc = crdt::new_doc();
        let mut applied_seq = 0;

        if let Some(bytes) = snapshot_bytes.take() {
            if let Err(err) = crdt::apply_update(&doc, &bytes) {
                warn!(document_id = %self.document_id, error = %err, "snapshot bytes rejected, falling back to replay");
            } else {
                applied_seq = row.latest_snapshot_seq;
                snapshot_bytes = Some(bytes);
            }
        }

        if snapshot_bytes.is_none() && row.latest_snapshot_seq > 0 {
            // A snapshot was recorded but its bytes are gone. Full replay
            // is only possible while the log still starts at sequence 1.
            let pool = self.pool.clone();
            let min = task::spawn_blocking(move || {
                let mut conn = pool.get()?;
                doclog::min_seq(&mut conn, document_id).map_err(doclog_error)
            })
            .await
            .map_err(AppError::internal)??;

            if min != Some(1) {
                return Err(AppError::inconsistent_state(
                    "snapshot unreadable and update log pruned; document cannot be reconstructed",
                ));
            }
        }

        let pool = self.pool.clone();
        let tail = task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            doclog::tail(&mut conn, document_id, applied_seq).map_err(doclog_error)
        })
        .await
        .map_err(AppError::internal)??;

        for entry in tail {
            if let Err(err) = crdt::apply_update(&doc, &entry.update_bytes) {
                warn!(document_id = %self.document_id, seq = entry.seq, error = %err, "skipping unappliable log entry");
            }
            applied_seq = entry.seq;
        }

        state.doc = doc;
        state.applied_seq = applied_seq;
        state.snapshot_seq = if snapshot_bytes.is_some() {
            row.latest_snapshot_seq
        } else {
            0
        };
        state.snapshot_bytes = snapshot_bytes;
        state.last_snapshot_at = Instant::now();
        state.pending_updates = 0;
        state.loaded = true;
        info!(document_id = %self.document_id, applied_seq, snapshot_seq = state.snapshot_seq, "document loaded");
        Ok(())
    }

    /// Init payload: cached snapshot plus the tail above it, or the whole
    /// log when no snapshot bytes are held.
    async fn build_init(&self, state: &DocState) -> AppResult<ServerMessage> {
        let after = state.snapshot_seq;
        let pool = self.pool.clone();
        let document_id = self.document_id;
        let tail = task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            doclog::tail(&mut conn, document_id, after).map_err(doclog_error)
        })
        .await
        .map_err(AppError::internal)??;

        Ok(ServerMessage::Init {
            document_id: self.document_id,
            snapshot: state.snapshot_bytes.clone(),
            snapshot_seq: state.snapshot_seq,
            updates: tail
                .into_iter()
                .map(|entry| SeqUpdate {
                    seq: entry.seq,
                    bytes: entry.update_bytes,
                })
                .collect(),
        })
    }

    /// Fires the asynchronous snapshot task when either trigger threshold
    /// is crossed. Counters stay untouched until the task succeeds, so a
    /// failed snapshot retries on the next trigger.
    fn maybe_snapshot(self: &Arc<Self>, state: &mut DocState) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        if state.snapshot_inflight {
            return;
        }

        let by_count = state.pending_updates >= self.config.snapshot_every_n_updates;
        let by_time = state.pending_updates > 0
            && state.last_snapshot_at.elapsed()
                >= Duration::from_millis(self.config.snapshot_every_ms);
        if !by_count && !by_time {
            return;
        }

        state.snapshot_inflight = true;
        let seq = state.applied_seq;
        let bytes = crdt::encode_full_state(&state.doc);
        let pending_at = state.pending_updates;
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.run_snapshot(storage, seq, bytes, pending_at).await;
        });
    }

    async fn run_snapshot(
        self: Arc<Self>,
        storage: Arc<dyn ObjectStorage>,
        seq: i64,
        bytes: Vec<u8>,
        pending_at: u64,
    ) {
        let key = storage::snapshot_key(self.document_id, seq);
        let upload = storage
            .put_object(&key, bytes.clone(), Some(SNAPSHOT_CONTENT_TYPE.to_string()))
            .await;

        let marked = match upload {
            Ok(()) => {
                let pool = self.pool.clone();
                let document_id = self.document_id;
                let prune = self.config.prune_updates_before_snapshot;
                let mark_key = key.clone();
                task::spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    doclog::snapshot_mark(&mut conn, document_id, seq, &mark_key, prune)
                        .map_err(doclog_error)
                })
                .await
                .map_err(AppError::internal)
                .and_then(|inner| inner)
            }
            Err(err) => Err(AppError::internal(err)),
        };

        let mut state = self.doc.lock().await;
        state.snapshot_inflight = false;
        match marked {
            Ok(()) => {
                state.snapshot_seq = seq;
                state.snapshot_bytes = Some(bytes);
                state.last_snapshot_at = Instant::now();
                state.pending_updates = state.pending_updates.saturating_sub(pending_at);
                state.snapshot_history.push_back(seq);
                let expired = self.expired_snapshots(&mut state);
                drop(state);
                debug!(document_id = %self.document_id, seq, "snapshot recorded");

                for old_seq in expired {
                    let old_key = storage::snapshot_key(self.document_id, old_seq);
                    if let Err(err) = storage.delete_object(&old_key).await {
                        warn!(document_id = %self.document_id, key = %old_key, error = %err, "failed to delete expired snapshot");
                    }
                }
            }
            Err(err) => {
                // Edits were never blocked on this; next trigger retries.
                warn!(document_id = %self.document_id, seq, error = %err, "snapshot failed");
            }
        }
    }

    fn expired_snapshots(&self, state: &mut DocState) -> Vec<i64> {
        let keep = self.config.snapshot_keep as usize;
        if keep == 0 {
            return Vec::new();
        }
        let mut expired = Vec::new();
        while state.snapshot_history.len() > keep {
            if let Some(seq) = state.snapshot_history.pop_front() {
                expired.push(seq);
            }
        }
        expired
    }
}

fn doclog_error(err: DocLogError) -> AppError {
    match err {
        DocLogError::DocumentMissing => AppError::not_found(),
        DocLogError::Conflict(message) => AppError::conflict(message),
        DocLogError::Database(err) => AppError::from(err),
    }
}
