//! Gavel - Real-Time English Auction Engine
//!
//! A server for time-bounded, single-item English auctions providing:
//! - Persistent authenticated websocket sessions
//! - Per-auction serialized bid validation with monotonic pricing
//! - Low-latency fan-out of accepted bids to auction rooms
//! - Exactly-once auction closing with winner resolution
//! - At-least-once outcome notifications with an idempotent delivery sink
//! - Per-user-per-auction rate limiting with progressive penalties
//!
//! # Architecture
//!
//! The crate follows a layered architecture:
//! - **Models**: Domain entities and event payloads
//! - **Store**: Authoritative durable persistence (source of truth)
//! - **HotState**: Best-effort derived cache, presence, rate counters, pub/sub
//! - **Bus**: Durable at-least-once event streams
//! - **Services**: Bid acceptance, rooms, lifecycle, notifications
//! - **Gateway**: Websocket front door and wire protocol

pub mod bus;
pub mod gateway;
pub mod hotstate;
pub mod models;
pub mod server;
pub mod services;
pub mod settings;
pub mod store;

pub use server::{GavelApp, ServerError};
pub use settings::GavelSettings;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use bus::{EventBus, EventStream, MemoryEventBus, SqlEventBus};
pub use gateway::protocol::{ClientMessage, ServerMessage};
pub use gateway::{SessionGateway, SessionRegistry};
pub use hotstate::{HotState, MemoryHotState};
pub use models::{Auction, AuctionStatus, Bid, BidSummary, NotificationKind, User};
pub use services::{BiddingService, LifecycleScheduler, NotificationDispatcher, RoomHub};
pub use store::{AuctionStore, SqlStore, StoreError};
