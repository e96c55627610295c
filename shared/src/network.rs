//! Process-wide connectivity state.
//!
//! One `NetworkStatusMonitor` is built at startup and shared by `Arc` with
//! everything that needs to know whether the device is offline. Subscribers
//! get the current value immediately on `subscribe`, then one call per real
//! change, in subscription order. Deliveries are serialized, so every
//! subscriber sees changes in the order they were recorded. Callbacks may
//! read the monitor or drop their `Subscription`, but must not call
//! `subscribe` or `update_status` themselves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ConnectivityProbe, ProbeResult};
use crate::config::NetworkConfig;

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

struct MonitorState {
    is_offline: bool,
    next_id: u64,
    subscribers: Vec<(u64, Callback)>,
}

fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct NetworkStatusMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    config: NetworkConfig,
    state: Arc<Mutex<MonitorState>>,
    /// Held from a state change until its last callback returns.
    delivery: Mutex<()>,
}

impl NetworkStatusMonitor {
    /// Builds a monitor that assumes online until the first probe lands.
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self::with_config(probe, NetworkConfig::default())
    }

    pub fn with_config(probe: Arc<dyn ConnectivityProbe>, config: NetworkConfig) -> Self {
        Self {
            probe,
            config,
            state: Arc::new(Mutex::new(MonitorState {
                is_offline: false,
                next_id: 0,
                subscribers: Vec::new(),
            })),
            delivery: Mutex::new(()),
        }
    }

    /// Builds the monitor and runs the initial probe.
    pub async fn start(probe: Arc<dyn ConnectivityProbe>, config: NetworkConfig) -> Arc<Self> {
        let monitor = Arc::new(Self::with_config(probe, config));
        monitor.refresh().await;
        monitor
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        lock(&self.state).is_offline
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Registers `callback` and invokes it once, synchronously, with the
    /// current state. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let (id, current) = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state.subscribers.push((id, Arc::clone(&callback)));
            (id, state.is_offline)
        };

        callback(current);

        Subscription {
            id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Records a new status. Subscribers are only notified when the value
    /// actually changes. Returns whether it changed.
    pub fn update_status(&self, is_offline: bool) -> bool {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let subscribers: Vec<Callback> = {
            let mut state = lock(&self.state);
            if state.is_offline == is_offline {
                return false;
            }
            state.is_offline = is_offline;
            state.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        info!(is_offline, subscribers = subscribers.len(), "network status changed");

        // Outside the state lock so callbacks may read the monitor.
        for callback in subscribers {
            callback(is_offline);
        }
        true
    }

    /// Probes the platform and records the result. A failed probe counts as
    /// offline unless configured otherwise. Returns the resulting state.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> bool {
        match self.probe.probe().await {
            Ok(result) => {
                self.update_status(result.is_offline());
            }
            Err(e) if self.config.assume_offline_on_probe_error => {
                warn!(error = %e, "connectivity probe failed, treating as offline");
                self.update_status(true);
            }
            Err(e) => {
                warn!(error = %e, "connectivity probe failed, keeping last known state");
            }
        }
        self.is_offline()
    }

    pub fn handle_platform_change(&self, result: ProbeResult) {
        debug!(?result, "platform connectivity event");
        self.update_status(result.is_offline());
    }

    /// Forwards a platform event stream into the monitor until the sender
    /// side closes.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ProbeResult>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(result) = events.recv().await {
                monitor.handle_platform_change(result);
            }
            debug!("connectivity event stream closed");
        })
    }
}

/// Handle returned by [`NetworkStatusMonitor::subscribe`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    state: Weak<Mutex<MonitorState>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
