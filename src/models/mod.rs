//! Gavel Data Models
//!
//! Domain entities for the auction engine:
//! - Core: Users, Auctions, Bids
//! - Derived: bid summaries, room snapshots
//! - Events: audit, lifecycle, and notification payloads

pub mod auction;
pub mod event;
pub mod user;

pub use auction::*;
pub use event::*;
pub use user::*;
