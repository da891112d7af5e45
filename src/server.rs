//! Composition Root
//!
//! Explicit construction of the component tree: durable backends first,
//! then the services that hold typed handles to them. No ambient container;
//! everything a component collaborates with is passed at construction.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::bus::{BusError, SharedBus, SqlEventBus};
use crate::gateway::{SessionGateway, SessionRegistry};
use crate::hotstate::{MemoryHotState, SharedHotState};
use crate::services::{BiddingService, LifecycleScheduler, NotificationDispatcher, RoomHub};
use crate::settings::GavelSettings;
use crate::store::{SharedStore, SqlStore, StoreError};

/// Startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The wired engine
pub struct GavelApp {
    pub settings: GavelSettings,
    pub replica: Uuid,
    pub store: SharedStore,
    pub hot: SharedHotState,
    pub bus: SharedBus,
    pub registry: Arc<SessionRegistry>,
    pub rooms: Arc<RoomHub>,
    pub bidding: Arc<BiddingService>,
    pub scheduler: Arc<LifecycleScheduler>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub gateway: Arc<SessionGateway>,
}

impl GavelApp {
    /// Connect the durable backends named in the settings, then wire.
    pub async fn build(settings: GavelSettings) -> Result<Self, ServerError> {
        let store = SqlStore::connect(&settings.store.url, settings.store.max_connections).await?;
        let bus = SqlEventBus::new(store.pool().clone(), settings.events.clone()).await?;
        let hot = MemoryHotState::new(
            settings.hot_state.clone(),
            Duration::from_secs(settings.sessions.ttl_secs),
        );
        Ok(Self::assemble(
            settings,
            Arc::new(store),
            Arc::new(hot),
            Arc::new(bus),
        ))
    }

    /// Wire the component tree over explicit backend handles. Tests use
    /// this directly with in-memory backends.
    pub fn assemble(
        settings: GavelSettings,
        store: SharedStore,
        hot: SharedHotState,
        bus: SharedBus,
    ) -> Self {
        let replica = Uuid::new_v4();
        let registry = SessionRegistry::new();
        let rooms = RoomHub::new(store.clone(), hot.clone(), replica);
        let scheduler = LifecycleScheduler::new(
            store.clone(),
            bus.clone(),
            rooms.clone(),
            Duration::from_secs(settings.scheduler.tick_secs),
        );
        let bidding = BiddingService::new(
            store.clone(),
            hot.clone(),
            bus.clone(),
            rooms.clone(),
            scheduler.clone(),
            settings.bidding.clone(),
            replica,
        );
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            bus.clone(),
            rooms.clone(),
            registry.clone(),
            Duration::from_millis(settings.events.poll_interval_ms),
        );
        let gateway = SessionGateway::new(
            settings.clone(),
            store.clone(),
            hot.clone(),
            rooms.clone(),
            bidding.clone(),
            scheduler.clone(),
            registry.clone(),
            replica,
        );

        Self {
            settings,
            replica,
            store,
            hot,
            bus,
            registry,
            rooms,
            bidding,
            scheduler,
            dispatcher,
            gateway,
        }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(&self.settings.server.listen_addr).await?)
    }

    /// Run every task until the shutdown flag flips.
    pub async fn serve(self, listener: TcpListener, shutdown: watch::Receiver<bool>) {
        info!(replica = %self.replica, "gavel serving");

        let relay = tokio::spawn(self.rooms.clone().run_relay(shutdown.clone()));
        let sweeps = tokio::spawn(self.scheduler.clone().run(shutdown.clone()));
        let dispatch = tokio::spawn(self.dispatcher.clone().run(shutdown.clone()));

        self.gateway.clone().run(listener, shutdown).await;

        let _ = tokio::join!(relay, sweeps, dispatch);
    }
}
