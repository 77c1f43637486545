//! One WebSocket connection: handshake, authorization, then the relay loop
//! between the socket and its document room.
//!
//! ```text
//! Connecting ──► Authenticating ──► Synced ──► Disconnected
//!                      │
//!                      └──► Rejected (close code 44xx)
//! ```

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use uuid::Uuid;

use super::room::{JoinError, JoinRequest, Outbound, RoomCommand};
use super::stats::StatsCounters;
use super::{mutations, Shared};
use crate::auth::{AuthDecision, Identity};
use crate::broadcast::ConnectionId;
use crate::protocol::{DocumentId, MessageType, RejectReason, SyncMessage};

/// Close code for a document the coordinator could not load.
pub const CLOSE_UNAVAILABLE: u16 = 1011;
/// Close code for an idle or shut-down connection.
pub const CLOSE_GOING_AWAY: u16 = 1001;

const JOIN_ATTEMPTS: usize = 3;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Synced,
    Disconnected,
    Rejected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, Synced)
                | (Authenticating, Rejected)
                | (Authenticating, Disconnected)
                | (Synced, Disconnected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Rejected)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("illegal session transition {from:?} -> {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

/// Binding of one connection to one document and identity.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: ConnectionId,
    state: SessionState,
    document: Option<DocumentId>,
    identity: Option<Identity>,
}

impl Session {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
            document: None,
            identity: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document(&self) -> Option<DocumentId> {
        self.document
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        log::trace!("session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Record the authorized identity and enter `Synced`.
    pub fn synced(&mut self, document: Option<DocumentId>, identity: Identity) -> Result<(), SessionError> {
        self.transition(SessionState::Synced)?;
        self.document = document;
        self.identity = Some(identity);
        Ok(())
    }
}

/// What a connection asked for, parsed from its request URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Document { document: DocumentId, token: Option<String> },
    Mutations { token: Option<String> },
}

/// Parse `/documents/{uuid}?token=...` or `/mutations?token=...`.
pub fn parse_route(uri: &str) -> Result<Route, RejectReason> {
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, query),
        None => (uri, ""),
    };
    let token = query_param(query, "token").filter(|t| !t.is_empty());

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["documents", id] => {
            let document = Uuid::parse_str(id).map_err(|_| RejectReason::MalformedPath)?;
            Ok(Route::Document { document, token })
        }
        ["mutations"] => Ok(Route::Mutations { token }),
        _ => Err(RejectReason::MalformedPath),
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| urlencoding::decode(v).ok())
        .map(|v| v.into_owned())
}

pub(crate) type Socket = WebSocketStream<TcpStream>;

pub(crate) fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// Refuse a connection with `reason`'s close code and wait briefly for the
/// client to acknowledge the close.
pub(crate) async fn reject(shared: &Shared, ws: &mut Socket, session: &mut Session, reason: RejectReason) {
    if session.transition(SessionState::Rejected).is_err() {
        log::debug!("session {} rejected from state {:?}", session.id, session.state());
    }
    StatsCounters::incr(&shared.stats.rejected_connections);
    log::info!("session {} rejected: {}", session.id, reason);
    let _ = ws.send(close_frame(reason.close_code(), reason.description())).await;
    let _ = tokio::time::timeout(CLOSE_GRACE, async { while let Some(Ok(_)) = ws.next().await {} }).await;
}

/// Accept one TCP connection and run it to completion.
pub(crate) async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> Result<(), tungstenite::Error> {
    let mut uri = None;
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        uri = Some(req.uri().to_string());
        Ok(resp)
    };
    let mut ws = accept_hdr_async(stream, capture).await?;

    let id = shared.next_connection_id();
    let mut session = Session::new(id);
    StatsCounters::incr(&shared.stats.total_connections);
    StatsCounters::incr(&shared.stats.active_connections);
    log::info!("connection {id} from {addr}: {}", uri.as_deref().unwrap_or(""));

    let result = route_connection(&shared, &mut ws, &mut session, uri.as_deref().unwrap_or("")).await;

    if !session.state().is_terminal() {
        let _ = session.transition(SessionState::Disconnected);
    }
    StatsCounters::decr(&shared.stats.active_connections);
    log::info!("connection {id} from {addr} ended ({:?})", session.state());
    result
}

async fn route_connection(
    shared: &Arc<Shared>,
    ws: &mut Socket,
    session: &mut Session,
    uri: &str,
) -> Result<(), tungstenite::Error> {
    if session.transition(SessionState::Authenticating).is_err() {
        return Ok(());
    }
    match parse_route(uri) {
        Err(reason) => {
            reject(shared, ws, session, reason).await;
            Ok(())
        }
        Ok(Route::Mutations { token }) => mutations::serve(shared, ws, session, token).await,
        Ok(Route::Document { document, token }) => serve_document(shared, ws, session, document, token).await,
    }
}

async fn join_room(shared: &Arc<Shared>, document: DocumentId, request: &JoinRequest) -> Result<super::room::Joined, JoinError> {
    for _ in 0..JOIN_ATTEMPTS {
        let handle = shared.rooms.get_or_spawn(shared, document);
        let (reply, joined) = tokio::sync::oneshot::channel();
        if !handle.send(RoomCommand::Join {
            request: request.clone(),
            reply,
        }) {
            continue;
        }
        match joined.await {
            Ok(Err(JoinError::Closed)) | Err(_) => continue,
            Ok(result) => return result,
        }
    }
    Err(JoinError::Unavailable)
}

async fn serve_document(
    shared: &Arc<Shared>,
    ws: &mut Socket,
    session: &mut Session,
    document: DocumentId,
    token: Option<String>,
) -> Result<(), tungstenite::Error> {
    let Some(token) = token else {
        reject(shared, ws, session, RejectReason::MissingToken).await;
        return Ok(());
    };
    let identity = match shared.authorizer.authorize(&token, Some(document)).await {
        AuthDecision::Allow(identity) => identity,
        AuthDecision::Deny(failure) => {
            reject(shared, ws, session, failure.reject_reason()).await;
            return Ok(());
        }
    };

    let (outbox, mut outgoing) = mpsc::unbounded_channel();
    let request = JoinRequest {
        connection: session.id,
        identity: identity.clone(),
        token,
        outbox,
    };
    let joined = join_room(shared, document, &request).await;
    drop(request);
    let joined = match joined {
        Ok(joined) => joined,
        Err(JoinError::Rejected(reason)) => {
            reject(shared, ws, session, reason).await;
            return Ok(());
        }
        Err(JoinError::Unavailable | JoinError::Closed) => {
            log::warn!("session {}: document {document} unavailable", session.id);
            let _ = ws.send(close_frame(CLOSE_UNAVAILABLE, "document unavailable")).await;
            return Ok(());
        }
    };
    let room = joined.room;
    if session.synced(Some(document), identity).is_err() {
        room.send(RoomCommand::Leave { connection: session.id });
        return Ok(());
    }
    log::info!(
        "session {} ({}) synced to document {document}",
        session.id,
        session.identity().map_or("?", |i| i.user_id.as_str())
    );

    let id = session.id;
    let mut frames = joined.frames;
    let lag = joined.lag;
    let idle_timeout = shared.config.idle_timeout;
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    let (mut sink, mut stream) = ws.split();
    let result = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    last_seen = Instant::now();
                    shared.stats.received(data.len());
                    let msg = match SyncMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("session {id}: undecodable frame: {e}");
                            continue;
                        }
                    };
                    if msg.doc_id != document {
                        log::warn!("session {id}: frame for document {} ignored", msg.doc_id);
                        continue;
                    }
                    match msg.msg_type {
                        MessageType::SyncStep1 => match msg.state_vector() {
                            Ok(state_vector) => {
                                room.send(RoomCommand::SyncStep1 { connection: id, state_vector });
                            }
                            Err(e) => log::warn!("session {id}: bad state vector: {e}"),
                        },
                        MessageType::SyncStep2 | MessageType::Update => match msg.batch() {
                            Ok(batch) => {
                                let frame = if msg.msg_type == MessageType::Update {
                                    data.to_vec()
                                } else {
                                    match SyncMessage::update(document, msg.clock, msg.payload.clone()).encode() {
                                        Ok(frame) => frame,
                                        Err(e) => {
                                            log::warn!("session {id}: re-encode failed: {e}");
                                            continue;
                                        }
                                    }
                                };
                                room.send(RoomCommand::Update { connection: id, batch, frame });
                            }
                            Err(e) => {
                                StatsCounters::incr(&shared.stats.dropped_batches);
                                log::warn!("session {id}: dropped malformed batch: {e}");
                            }
                        },
                        MessageType::Awareness => match msg.awareness_update() {
                            Ok(update) => {
                                room.send(RoomCommand::Awareness { connection: id, update, frame: data.to_vec() });
                            }
                            Err(e) => log::warn!("session {id}: bad awareness payload: {e}"),
                        },
                        MessageType::Ping => {
                            if let Ok(pong) = SyncMessage::pong(document).encode() {
                                if let Err(e) = sink.send(Message::Binary(pong.into())).await {
                                    break Err(e);
                                }
                            }
                        }
                        MessageType::Pong => {}
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    last_seen = Instant::now();
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        break Err(e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("session {id}: closed by peer");
                    break Ok(());
                }
                Some(Ok(_)) => {
                    last_seen = Instant::now();
                }
                Some(Err(e)) => {
                    log::debug!("session {id}: socket error: {e}");
                    break Ok(());
                }
            },

            out = outgoing.recv() => match out {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        break Err(e);
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    log::info!("session {id}: closed by room ({code} {reason})");
                    let _ = sink.send(close_frame(code, &reason)).await;
                    break Ok(());
                }
                None => break Ok(()),
            },

            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if frame.is_for(id) {
                        if let Err(e) = sink.send(Message::Binary(frame.bytes.clone().into())).await {
                            break Err(e);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("session {id}: lagged by {skipped} frames; resyncing");
                    lag.record(skipped);
                    room.send(RoomCommand::Resync { connection: id });
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    log::info!("session {id}: idle for {:?}; closing", last_seen.elapsed());
                    let _ = sink.send(close_frame(CLOSE_GOING_AWAY, "idle timeout")).await;
                    break Ok(());
                }
            }
        }
    };

    room.send(RoomCommand::Leave { connection: id });
    let _ = session.transition(SessionState::Disconnected);
    result
}
