//! Per-client admission control.
//!
//! Each client gets a fixed window budget. The first call after a window
//! expires resets the count; a denied call never consumes budget. A
//! background sweeper drops clients that have gone idle so the table does
//! not grow without bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

struct ClientWindow {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

pub struct AdmissionController {
    clients: Arc<Mutex<HashMap<String, ClientWindow>>>,
    limit: u32,
    window: Duration,
    sweeper: JoinHandle<()>,
}

impl AdmissionController {
    /// Starts the controller and its idle sweeper. Must be called from
    /// within a Tokio runtime.
    pub fn start(limit: u32, window: Duration, sweep_period: Duration) -> Self {
        let clients: Arc<Mutex<HashMap<String, ClientWindow>>> = Arc::new(Mutex::new(HashMap::new()));
        let sweeper = tokio::spawn(sweep_idle_clients(clients.clone(), sweep_period));
        Self {
            clients,
            limit,
            window,
            sweeper,
        }
    }

    /// Admits or denies one call for `key`. Admission and eviction take
    /// the same lock, so a client is never admitted against a window the
    /// sweeper is tearing down.
    pub fn admit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut clients = lock_clients(&self.clients);
        let entry = clients.entry(key.to_string()).or_insert(ClientWindow {
            count: 0,
            window_start: now,
            last_seen: now,
        });
        entry.last_seen = now;
        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        lock_clients(&self.clients).len()
    }

    pub fn shutdown(&self) {
        self.sweeper.abort();
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn lock_clients(
    clients: &Mutex<HashMap<String, ClientWindow>>,
) -> MutexGuard<'_, HashMap<String, ClientWindow>> {
    match clients.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn sweep_idle_clients(
    clients: Arc<Mutex<HashMap<String, ClientWindow>>>,
    period: Duration,
) {
    // interval panics on a zero period
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let mut clients = lock_clients(&clients);
        let before = clients.len();
        clients.retain(|_, window| now.duration_since(window.last_seen) < period);
        let evicted = before - clients.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = clients.len(), "evicted idle clients");
        }
    }
}
