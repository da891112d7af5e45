//! Gavel Engine Services
//!
//! The business logic layer: bid acceptance, room fan-out, auction
//! lifecycle, and outcome notifications.

pub mod bidding;
pub mod lifecycle;
pub mod notifications;
pub mod rooms;

pub use bidding::BiddingService;
pub use lifecycle::LifecycleScheduler;
pub use notifications::NotificationDispatcher;
pub use rooms::RoomHub;
