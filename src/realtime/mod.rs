//! Realtime gateway: one WebSocket per client, JSON messages, binary CRDT
//! payloads base64-encoded. The handshake must authenticate before anything
//! else happens; each `join` is authorized independently against membership
//! or a presented share token.

pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use diesel::OptionalExtension;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthenticatedUser};
use crate::documents::{self, Role};
use crate::error::{AppError, AppResult};
use crate::hub::{Hub, Peer};
use crate::state::AppState;

use protocol::{ClientMessage, ServerMessage};

const AUTH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer.map(|TypedHeader(Authorization(bearer))| bearer.token().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(socket: WebSocket, state: AppState, header_token: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    // Authenticate before anything else: either the Authorization header
    // from the handshake or a first `auth` frame.
    let token = match header_token {
        Some(token) => Some(token),
        None => wait_for_auth_frame(&mut stream).await,
    };

    let user = match token {
        Some(token) => match auth::authenticate(&state, &token).await {
            Ok(user) => user,
            Err(_) => {
                let _ = send_json(
                    &mut sink,
                    &ServerMessage::Error {
                        reason: "authentication failed".to_string(),
                        document_id: None,
                    },
                )
                .await;
                let _ = sink.close().await;
                return;
            }
        },
        None => {
            let _ = sink.close().await;
            return;
        }
    };

    let peer_id = Uuid::new_v4();
    state.active_connections.fetch_add(1, Ordering::SeqCst);
    info!(%peer_id, user_id = %user.user_id, "realtime connection established");

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Single writer task: everything queued for this connection leaves the
    // socket in queue order, which gives per-document send ordering.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if send_json(&mut sink, &message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection {
        state: state.clone(),
        user,
        peer_id,
        tx,
        joined: HashMap::new(),
    };

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%peer_id, error = %err, "socket read error");
                break;
            }
        };

        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => conn.dispatch(message).await,
                Err(err) => conn.send_error(None, format!("malformed message: {err}")),
            },
            Message::Binary(_) => {
                conn.send_error(None, "binary frames are not supported".to_string())
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    for (_, hub) in conn.joined.drain() {
        hub.remove_peer(peer_id).await;
    }
    state.active_connections.fetch_sub(1, Ordering::SeqCst);
    writer.abort();
    info!(%peer_id, "realtime connection closed");
}

async fn wait_for_auth_frame(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<String> {
    let frame = tokio::time::timeout(AUTH_HANDSHAKE_TIMEOUT, stream.next())
        .await
        .ok()??
        .ok()?;
    match frame {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Auth { token }) => Some(token),
            _ => None,
        },
        _ => None,
    }
}

async fn send_json(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            // Emission failures are logged, never propagated (§7).
            warn!(error = %err, "failed to encode outbound message");
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await
}

struct Connection {
    state: AppState,
    user: AuthenticatedUser,
    peer_id: Uuid,
    tx: mpsc::UnboundedSender<ServerMessage>,
    joined: HashMap<Uuid, Arc<Hub>>,
}

impl Connection {
    async fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Auth { .. } => {}
            ClientMessage::Join {
                document_id,
                share_token,
            } => {
                if let Err(err) = self.join(document_id, share_token).await {
                    self.send_error(Some(document_id), err.message().to_string());
                }
            }
            ClientMessage::Leave { document_id } => {
                if let Some(hub) = self.joined.remove(&document_id) {
                    hub.remove_peer(self.peer_id).await;
                }
            }
            ClientMessage::Update { document_id, bytes } => {
                let Some(hub) = self.joined.get(&document_id) else {
                    self.send_error(Some(document_id), "not joined".to_string());
                    return;
                };
                if let Err(err) = hub.submit_update(self.peer_id, bytes).await {
                    self.send_error(Some(document_id), err.message().to_string());
                }
            }
            ClientMessage::Presence { document_id, bytes } => {
                if let Some(hub) = self.joined.get(&document_id) {
                    hub.publish_presence(self.peer_id, bytes).await;
                }
            }
        }
    }

    async fn join(&mut self, document_id: Uuid, share_token: Option<String>) -> AppResult<()> {
        if self.joined.contains_key(&document_id) {
            return Ok(());
        }

        let role = self.resolve_role(document_id, share_token)?;
        if !role.can_read() {
            return Err(AppError::forbidden());
        }

        let peer = Peer {
            user_id: self.user.user_id,
            name: self.user.name.clone(),
            role,
            presence: None,
            tx: self.tx.clone(),
        };

        // The registry may have evicted the hub between lookup and join;
        // one retry against a fresh hub covers that window.
        for attempt in 0..2 {
            let hub = self.state.hubs.get_or_create(document_id).await;
            match hub.join(self.peer_id, peer.clone()).await {
                Ok(()) => {
                    self.joined.insert(document_id, hub);
                    return Ok(());
                }
                Err(_) if hub.is_closed() && attempt == 0 => continue,
                Err(err) => return Err(err),
            }
        }
        Err(AppError::transient("document room unavailable"))
    }

    fn resolve_role(&self, document_id: Uuid, share_token: Option<String>) -> AppResult<Role> {
        let mut conn = self.state.db()?;

        let document = documents::find(&mut conn, document_id)
            .optional()
            .map_err(AppError::from)?
            .ok_or_else(AppError::not_found)?;
        if document.archived_at.is_some() {
            return Err(AppError::not_found());
        }

        let mut role = documents::role_of(&mut conn, self.user.user_id, document_id)?;
        if !role.can_read() {
            if let Some(token) = share_token {
                role = documents::resolve_share_link(&mut conn, document_id, &token)?;
            }
        }
        Ok(role)
    }

    fn send_error(&self, document_id: Option<Uuid>, reason: String) {
        let _ = self.tx.send(ServerMessage::Error {
            reason,
            document_id,
        });
    }
}
