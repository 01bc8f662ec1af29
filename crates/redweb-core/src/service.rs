//! Autonomous per-route services.
//!
//! A service is background logic attached to a route: a game loop, a
//! presence broadcaster, a cleanup sweep. It is initialised when the route is
//! started and may tick at a fixed interval until the route shuts down.

use crate::route::{panic_message, Route, RouteShared};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, trace, warn};

/// Background logic bound to a route.
pub trait Service: Send + Sync + 'static {
    /// Service identifier, used in logs.
    fn name(&self) -> &str;

    /// Interval between ticks. `None` or zero disables ticking.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Called once when the owning route starts.
    fn on_init(&self, _route: &Route) {}

    /// Called every tick interval while the route is running.
    ///
    /// Must not shut down the route it is ticking on.
    fn on_tick(&self, _route: &Route) {}

    /// Called once when the route shuts down, after the timer is cancelled.
    fn on_shutdown(&self) {}
}

/// Owns a service's lifecycle: back-reference to its route and tick timer.
pub(crate) struct ServiceHost {
    service: Arc<dyn Service>,
    route: OnceLock<Weak<RouteShared>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    // Held for the duration of each tick; cleared on shutdown.
    running: Arc<Mutex<bool>>,
}

impl ServiceHost {
    pub(crate) fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            route: OnceLock::new(),
            timer: Mutex::new(None),
            running: Arc::new(Mutex::new(false)),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.service.name()
    }

    /// Bind the service to its route and start the tick timer if configured.
    ///
    /// Must be called from within a tokio runtime when ticking is enabled.
    pub(crate) fn on_init(&self, route: &Route) {
        if self.route.set(route.downgrade()).is_err() {
            return;
        }
        *self.running.lock() = true;
        self.service.on_init(route);

        let Some(period) = self.service.tick_interval().filter(|p| !p.is_zero()) else {
            debug!(service = %self.name(), path = %route.path(), "Service started");
            return;
        };

        let service = Arc::clone(&self.service);
        let running = Arc::clone(&self.running);
        let weak = route.downgrade();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(route) = Route::upgrade(&weak) else {
                    break;
                };
                if !tick_once(&running, service.as_ref(), &route) {
                    break;
                }
            }
        });
        *self.timer.lock() = Some(handle);

        debug!(
            service = %self.name(),
            path = %route.path(),
            period_ms = period.as_millis() as u64,
            "Service started with tick"
        );
    }

    /// Cancel the timer and run the service's shutdown hook.
    ///
    /// Idempotent. Once this returns no tick is running and none will start.
    pub(crate) fn on_shutdown(&self) {
        let was_running = std::mem::replace(&mut *self.running.lock(), false);
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        if was_running {
            self.service.on_shutdown();
            debug!(service = %self.name(), "Service shut down");
        }
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHost")
            .field("name", &self.name())
            .field("running", &*self.running.lock())
            .finish()
    }
}

fn tick_once(running: &Mutex<bool>, service: &dyn Service, route: &Route) -> bool {
    let running = running.lock();
    if !*running {
        return false;
    }
    trace!(service = %service.name(), "Tick");
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| service.on_tick(route))) {
        warn!(
            service = %service.name(),
            path = %route.path(),
            error = %panic_message(payload.as_ref()),
            "Service tick panicked"
        );
    }
    true
}
