//! Built-in route services.

use crate::config::ServiceSpec;
use anyhow::{bail, Result};
use redweb_core::{Route, Service};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Build a service from its config entry.
///
/// # Errors
///
/// Returns an error for an unknown service kind.
pub fn build(spec: &ServiceSpec) -> Result<Arc<dyn Service>> {
    match spec.kind.as_str() {
        Presence::KIND => Ok(Arc::new(Presence {
            interval: spec.tick_interval(),
        })),
        other => bail!("Unknown service kind: {other}"),
    }
}

/// Periodically tells every client how many clients the route has.
pub struct Presence {
    interval: Option<Duration>,
}

impl Presence {
    /// Config name of the service.
    pub const KIND: &'static str = "presence";
}

impl Service for Presence {
    fn name(&self) -> &str {
        Self::KIND
    }

    fn tick_interval(&self) -> Option<Duration> {
        self.interval
    }

    fn on_init(&self, route: &Route) {
        debug!(path = %route.path(), "Presence service attached");
    }

    fn on_tick(&self, route: &Route) {
        let clients = route.client_count();
        if clients == 0 {
            return;
        }
        if let Err(e) = route.broadcast(&json!({"type": "presence", "clients": clients})) {
            warn!(path = %route.path(), error = %e, "Presence broadcast failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redweb_core::{DefaultHandler, Outbound, RouteConfig};
    use tokio::sync::mpsc;

    #[test]
    fn test_unknown_kind_rejected() {
        let spec = ServiceSpec {
            kind: "weather".into(),
            tick_ms: None,
        };
        assert!(build(&spec).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_broadcasts_client_count() {
        let spec = ServiceSpec {
            kind: "presence".into(),
            tick_ms: Some(100),
        };
        let route = Route::builder(RouteConfig::new("/"))
            .handler(|| DefaultHandler)
            .shared_service(build(&spec).unwrap())
            .build()
            .unwrap();
        route.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _conn = route.accept("10.0.0.1:1".parse().unwrap(), tx);

        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("Expected a presence frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame, json!({"type": "presence", "clients": 1}));
        route.shutdown();
    }
}
