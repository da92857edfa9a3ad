//! Shared runtime state for sovd-daemon.
//!
//! No globals: the store, bus, connector, verifier and limiter are injected
//! here and handlers receive `State<Arc<AppState>>`. Scenario tests build
//! the same state around the in-memory store and scripted connectors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sovd_bus::EventBus;
use sovd_connector::VehicleConnector;
use sovd_db::CommandStore;

use crate::auth::TokenVerifier;
use crate::config::DaemonConfig;
use crate::ratelimit::{RateLimiter, UnlimitedLimiter};

/// Static build metadata included in the health response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers and the executor.
pub struct AppState {
    pub store: Arc<dyn CommandStore>,
    pub bus: Arc<EventBus>,
    pub connector: Arc<dyn VehicleConnector>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub limiter: Arc<dyn RateLimiter>,
    pub config: DaemonConfig,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CommandStore>,
        connector: Arc<dyn VehicleConnector>,
        verifier: Arc<dyn TokenVerifier>,
        config: DaemonConfig,
    ) -> Self {
        let bus = Arc::new(EventBus::with_capacity(config.ws_send_buffer));
        Self {
            store,
            bus,
            connector,
            verifier,
            limiter: Arc::new(UnlimitedLimiter),
            config,
            build: BuildInfo {
                service: "sovd-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }
}
