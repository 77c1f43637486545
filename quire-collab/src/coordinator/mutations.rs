//! The `/mutations` endpoint: JSON frames between a `SyncCache` and the
//! coordinator's `MutationAuthority`.
//!
//! Every commit is pushed to every session, the issuer included, tagged with
//! its authority version. A session that falls behind the push channel gets
//! the whole confirmed state instead of the effects it missed.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use super::session::{close_frame, reject, Session, Socket, CLOSE_GOING_AWAY};
use super::Shared;
use crate::auth::AuthDecision;
use crate::mutation::{MutationAuthority, MutationFrame, MutationResponse};
use crate::protocol::RejectReason;

pub(crate) async fn serve(
    shared: &Arc<Shared>,
    ws: &mut Socket,
    session: &mut Session,
    token: Option<String>,
) -> Result<(), tungstenite::Error> {
    let Some(authority) = shared.authority.clone() else {
        reject(shared, ws, session, RejectReason::MalformedPath).await;
        return Ok(());
    };
    let Some(token) = token else {
        reject(shared, ws, session, RejectReason::MissingToken).await;
        return Ok(());
    };
    let identity = match shared.authorizer.authorize(&token, None).await {
        AuthDecision::Allow(identity) => identity,
        AuthDecision::Deny(failure) => {
            reject(shared, ws, session, failure.reject_reason()).await;
            return Ok(());
        }
    };
    if session.synced(None, identity).is_err() {
        return Ok(());
    }
    let id = session.id;
    log::info!(
        "session {id} ({}) opened the mutation channel",
        session.identity().map_or("?", |i| i.user_id.as_str())
    );

    let mut effects = authority.subscribe();
    let (responses_tx, mut responses) = mpsc::unbounded_channel::<MutationResponse>();
    let idle_timeout = shared.config.idle_timeout;
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    let mut last_seen = Instant::now();

    loop {
        // Pushes go out ahead of responses so a client usually sees commits
        // in version order.
        tokio::select! {
            biased;
            effect = effects.recv() => match effect {
                Ok(effect) => send_frame(ws, MutationFrame::Effect(effect), id).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("session {id}: skipped {skipped} pushed effects; sending confirmed state");
                    send_state(ws, &authority, id).await?;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(response) = responses.recv() => {
                send_frame(ws, MutationFrame::Response(response), id).await?;
            }
            msg = ws.next() => {
                let Some(msg) = msg else { break };
                last_seen = Instant::now();
                match msg? {
                    Message::Text(text) => {
                        shared.stats.received(text.len());
                        match MutationFrame::decode(text.as_str()) {
                            Ok(MutationFrame::Request(request)) => {
                                let authority = authority.clone();
                                let responses = responses_tx.clone();
                                tokio::spawn(async move {
                                    let _ = responses.send(authority.submit(request).await);
                                });
                            }
                            Ok(MutationFrame::Resync) => send_state(ws, &authority, id).await?,
                            Ok(_) => log::warn!("session {id}: unexpected mutation frame from client"),
                            Err(e) => log::warn!("session {id}: undecodable mutation frame: {e}"),
                        }
                    }
                    Message::Ping(payload) => ws.send(Message::Pong(payload)).await?,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    log::info!("session {id}: idle for {:?}, closing", last_seen.elapsed());
                    let _ = ws.send(close_frame(CLOSE_GOING_AWAY, "idle timeout")).await;
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn send_state(ws: &mut Socket, authority: &MutationAuthority, id: u64) -> Result<(), tungstenite::Error> {
    send_frame(ws, MutationFrame::State(authority.confirmed_state()), id).await
}

async fn send_frame(ws: &mut Socket, frame: MutationFrame, id: u64) -> Result<(), tungstenite::Error> {
    match frame.encode() {
        Ok(text) => ws.send(Message::text(text)).await,
        Err(e) => {
            log::error!("session {id}: mutation frame encode failed: {e}");
            Ok(())
        }
    }
}
