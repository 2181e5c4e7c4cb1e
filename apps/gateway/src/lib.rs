pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use db::presence::PresenceStore;
use gateway::fanout::EventBus;
use gateway::handler::{DefaultHandler, EventHandler};
use gateway::hub::Hub;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KeyValueStore>,
    pub hub: Arc<Hub>,
    pub bus: Arc<dyn EventBus>,
    pub handler: Arc<dyn EventHandler>,
}

impl AppState {
    /// Wire a hub and the default handler around the given stores.
    pub fn new(
        config: Config,
        kv: Arc<dyn KeyValueStore>,
        presence: Option<Arc<dyn PresenceStore>>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let hub = Arc::new(Hub::new(config.socket, presence));
        let handler: Arc<dyn EventHandler> = Arc::new(DefaultHandler::new(bus.clone()));
        Self {
            config: Arc::new(config),
            kv,
            hub,
            bus,
            handler,
        }
    }
}
