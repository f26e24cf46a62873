//! Application state shared across requests.
//!
//! Cross-request state is deliberately small: the immutable configuration,
//! one circuit breaker per external service, and the two service clients.
//! Everything else is per-request.

use std::sync::Arc;

use avgate_core::{CircuitBreaker, GateConfig};
use avgate_services::{BackendForwarder, IcapClient};

pub struct AppState {
    pub config: Arc<GateConfig>,
    pub icap_breaker: Arc<CircuitBreaker>,
    pub backend_breaker: Arc<CircuitBreaker>,
    pub icap: IcapClient,
    pub forwarder: BackendForwarder,
}

impl AppState {
    pub fn new(config: GateConfig) -> Result<Self, anyhow::Error> {
        let icap = IcapClient::new(&config);
        let forwarder = BackendForwarder::new(&config)?;
        let icap_breaker = Arc::new(CircuitBreaker::new(
            "icap",
            config.icap_failure_threshold,
            config.icap_recovery_timeout,
        ));
        let backend_breaker = Arc::new(CircuitBreaker::new(
            "backend",
            config.backend_failure_threshold,
            config.backend_recovery_timeout,
        ));

        Ok(Self {
            config: Arc::new(config),
            icap_breaker,
            backend_breaker,
            icap,
            forwarder,
        })
    }
}
