//! Session Gateway
//!
//! Authenticated full-duplex client sessions over websockets. The upgrade
//! request carries a bearer token (query `token=` or `Authorization`
//! header); a bad token gets one `error` frame and the socket is closed.
//! After auth, inbound messages dispatch by tagged kind through an explicit
//! match, each under a request deadline and a per-connection inflight cap
//! that is independent of the per-auction rate gate. The connection's
//! writer task is the only writer to the socket; rooms, the dispatcher, and
//! handlers all enqueue onto the session's bounded buffer.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod auth;
pub mod protocol;
pub mod session;

pub use session::{SessionHandle, SessionRegistry};

use crate::hotstate::{SessionMeta, SharedHotState};
use crate::models::AuctionStatus;
use crate::services::bidding::BiddingService;
use crate::services::lifecycle::LifecycleScheduler;
use crate::services::rooms::{RoomError, RoomHub};
use crate::settings::GavelSettings;
use crate::store::SharedStore;
use protocol::{AmountInput, BidErrorCode, ClientMessage, ServerMessage};

/// Deadline for handling one inbound message.
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// Bids returned by `getBidHistory`.
const HISTORY_LIMIT: u32 = 50;

/// Connection-level errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// Websocket front door
pub struct SessionGateway {
    settings: GavelSettings,
    store: SharedStore,
    hot: SharedHotState,
    rooms: Arc<RoomHub>,
    bidding: Arc<BiddingService>,
    lifecycle: Arc<LifecycleScheduler>,
    registry: Arc<SessionRegistry>,
    replica: Uuid,
}

impl SessionGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: GavelSettings,
        store: SharedStore,
        hot: SharedHotState,
        rooms: Arc<RoomHub>,
        bidding: Arc<BiddingService>,
        lifecycle: Arc<LifecycleScheduler>,
        registry: Arc<SessionRegistry>,
        replica: Uuid,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            hot,
            rooms,
            bidding,
            lifecycle,
            registry,
            replica,
        })
    }

    /// Accept connections until shutdown.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(error) = gateway.handle_connection(stream, shutdown).await {
                                debug!(%peer, %error, "connection closed");
                            }
                        });
                    }
                    Err(error) => warn!(%error, "failed to accept connection"),
                },
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        let mut token: Option<String> = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            token = extract_token(request);
            Ok(response)
        })
        .await?;

        let (mut sink, mut inbound) = ws.split();

        let verified = token
            .as_deref()
            .ok_or("missing bearer token".to_string())
            .and_then(|t| {
                auth::verify(
                    t,
                    &self.settings.sessions.signing_key,
                    Utc::now().timestamp_millis(),
                )
                .map_err(|e| e.to_string())
            });
        let claims = match verified {
            Ok(claims) => claims,
            Err(reason) => {
                let frame = ServerMessage::Error {
                    message: format!("authentication failed: {reason}"),
                };
                let _ = sink.send(Message::Text(serde_json::to_string(&frame)?)).await;
                let _ = sink.close().await;
                return Ok(());
            }
        };

        info!(user_id = %claims.user_id, username = %claims.username, "session connected");

        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<ServerMessage>(self.settings.server.outbound_buffer);
        let session = SessionHandle::new(claims.user_id, claims.username.clone(), outbound_tx);
        self.registry.insert(session.clone());

        if let Err(error) = self
            .hot
            .set_session(
                claims.user_id,
                SessionMeta {
                    session_id: session.session_id,
                    username: claims.username.clone(),
                    replica: self.replica,
                    connected_at: Utc::now(),
                },
            )
            .await
        {
            warn!(%error, "failed to register session presence");
        }

        session.enqueue(ServerMessage::Connected {
            user_id: claims.user_id,
            username: claims.username.clone(),
        });

        // sole writer to the socket
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, "failed to encode outbound frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inflight = Arc::new(Semaphore::new(self.settings.server.connection_inflight_cap));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = session.evicted() => {
                    debug!(session_id = %session.session_id, "dropping slow consumer");
                    break;
                }
                frame = inbound.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.clone().dispatch(session.clone(), inflight.clone(), text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // pings are answered by the transport; binary is ignored
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(%error, "socket error");
                        break;
                    }
                },
            }
        }

        self.rooms.leave_all(session.session_id);
        self.registry.remove(session.user_id, session.session_id);
        if let Err(error) = self.hot.clear_session(session.user_id).await {
            warn!(%error, "failed to clear session presence");
        }
        writer.abort();
        info!(session_id = %session.session_id, "session disconnected");
        Ok(())
    }

    /// Parse and handle one inbound frame under the inflight cap and the
    /// request deadline.
    fn dispatch(self: Arc<Self>, session: Arc<SessionHandle>, inflight: Arc<Semaphore>, text: String) {
        let Ok(permit) = inflight.try_acquire_owned() else {
            session.enqueue(ServerMessage::Error {
                message: "too many requests in flight".to_string(),
            });
            return;
        };

        let gateway = self;
        tokio::spawn(async move {
            let _permit = permit;
            let reply_to = session.clone();
            let handled =
                tokio::time::timeout(REQUEST_DEADLINE, gateway.handle_message(session, text)).await;
            if handled.is_err() {
                reply_to.enqueue(ServerMessage::Error {
                    message: "request timed out".to_string(),
                });
            }
        });
    }

    async fn handle_message(&self, session: Arc<SessionHandle>, text: String) {
        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "rejecting unsupported message");
                session.enqueue(ServerMessage::Error {
                    message: "unsupported message".to_string(),
                });
                return;
            }
        };

        match message {
            ClientMessage::JoinAuction { auction_id } => {
                self.handle_join(session, auction_id).await;
            }
            ClientMessage::PlaceBid { auction_id, amount } => {
                self.handle_place_bid(session, auction_id, amount).await;
            }
            ClientMessage::GetBidHistory { auction_id } => {
                self.handle_history(session, auction_id).await;
            }
        }
    }

    async fn handle_join(&self, session: Arc<SessionHandle>, auction_id: Uuid) {
        match self.rooms.join(session.clone(), auction_id).await {
            Ok(snapshot) => {
                self.end_if_expired(&snapshot.auction_id, snapshot.status, snapshot.end_time);
                let highest = snapshot.highest_message();
                session.enqueue(ServerMessage::JoinedAuction {
                    auction_id,
                    snapshot,
                });
                session.enqueue(highest);
            }
            Err(RoomError::AuctionNotFound) => {
                session.enqueue(ServerMessage::Error {
                    message: "auction not found".to_string(),
                });
            }
            Err(RoomError::Store(error)) => {
                warn!(%auction_id, %error, "join failed");
                session.enqueue(ServerMessage::Error {
                    message: "auction room unavailable".to_string(),
                });
            }
        }
    }

    async fn handle_place_bid(
        &self,
        session: Arc<SessionHandle>,
        auction_id: Uuid,
        amount: AmountInput,
    ) {
        let Some(amount) = amount.to_decimal() else {
            session.enqueue(ServerMessage::BidError {
                code: BidErrorCode::InvalidAmount,
                message: "amount is not a number".to_string(),
            });
            return;
        };

        match self
            .bidding
            .submit(
                session.user_id,
                &session.username,
                auction_id,
                amount,
                Utc::now(),
            )
            .await
        {
            Ok(bid) => {
                session.enqueue(ServerMessage::BidPlaced {
                    bid_id: bid.id,
                    amount: bid.amount,
                });
            }
            Err(rejection) => {
                session.enqueue(ServerMessage::BidError {
                    code: rejection.code(),
                    message: rejection.to_string(),
                });
            }
        }
    }

    async fn handle_history(&self, session: Arc<SessionHandle>, auction_id: Uuid) {
        let auction = match self.store.get_auction(auction_id).await {
            Ok(Some(auction)) => auction,
            Ok(None) => {
                session.enqueue(ServerMessage::Error {
                    message: "auction not found".to_string(),
                });
                return;
            }
            Err(error) => {
                warn!(%auction_id, %error, "history read failed");
                session.enqueue(ServerMessage::Error {
                    message: "bid history unavailable".to_string(),
                });
                return;
            }
        };
        self.end_if_expired(&auction.id, auction.status, auction.end_time);

        match self.rooms.bid_history(auction_id, HISTORY_LIMIT).await {
            Ok(bids) => {
                session.enqueue(ServerMessage::BidHistory { auction_id, bids });
            }
            Err(error) => {
                warn!(%auction_id, %error, "history read failed");
                session.enqueue(ServerMessage::Error {
                    message: "bid history unavailable".to_string(),
                });
            }
        }
    }

    /// On-demand lifecycle detection: any read that observes an expired
    /// ACTIVE auction kicks off its finalization.
    fn end_if_expired(
        &self,
        auction_id: &Uuid,
        status: AuctionStatus,
        end_time: chrono::DateTime<Utc>,
    ) {
        let now = Utc::now();
        if status == AuctionStatus::Active && end_time <= now {
            let lifecycle = self.lifecycle.clone();
            let auction_id = *auction_id;
            tokio::spawn(async move {
                if let Err(error) = lifecycle.finalize(auction_id, Utc::now()).await {
                    warn!(%auction_id, %error, "on-demand finalize failed");
                }
            });
        }
    }
}

fn extract_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token=").map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    fn upgrade_request(uri: &str, bearer: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn token_comes_from_header_or_query() {
        let from_header = upgrade_request("ws://localhost/", Some("abc"));
        assert_eq!(extract_token(&from_header).as_deref(), Some("abc"));

        let from_query = upgrade_request("ws://localhost/?token=xyz&other=1", None);
        assert_eq!(extract_token(&from_query).as_deref(), Some("xyz"));

        let header_wins = upgrade_request("ws://localhost/?token=query", Some("header"));
        assert_eq!(extract_token(&header_wins).as_deref(), Some("header"));

        let missing = upgrade_request("ws://localhost/?other=1", None);
        assert_eq!(extract_token(&missing), None);
    }
}
