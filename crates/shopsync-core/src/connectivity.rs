//! Connectivity monitor
//!
//! Tracks whether the device is online, notifies listeners of every change,
//! and signals reconnection once per burst of network flapping.
//!
//! The platform network API sits behind [`NetworkProbe`]. [`HttpProbe`] is a
//! polling implementation that checks the sync server's health endpoint.
//!
//! ## Reconnection debounce
//!
//! An offline → online transition arms a timer for the debounce window. Each
//! further offline → online transition inside the window re-arms it. When the
//! timer fires and the device is still online, one `Reconnected` notice is
//! sent. A burst of flaps therefore yields exactly one notice, and a burst
//! that ends offline yields none.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};

/// Kind of link the device is using
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Other,
    None,
    #[default]
    Unknown,
}

/// Raw reading from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    pub connection_type: ConnectionType,
}

impl NetworkSnapshot {
    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            connection_type,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
            connection_type: ConnectionType::None,
        }
    }
}

/// Process-wide network state, written only by the monitor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    pub connection_type: ConnectionType,
    pub last_connection_at: Option<DateTime<Utc>>,
    pub last_disconnection_at: Option<DateTime<Utc>>,
}

impl NetworkState {
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

/// What listeners are told
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityNotice {
    /// The platform reported a change
    Changed {
        previous: NetworkState,
        current: NetworkState,
    },
    /// Back online after being offline (debounced)
    Reconnected(NetworkState),
}

/// Source of network readings
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Current reading
    async fn fetch(&self) -> SyncResult<NetworkSnapshot>;

    /// Stream of readings pushed by the platform
    fn subscribe(&self) -> SyncResult<mpsc::Receiver<NetworkSnapshot>>;
}

type Listener = Arc<dyn Fn(&ConnectivityNotice) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
}

/// Removes its listener when dropped or when `unsubscribe` is called
#[must_use = "dropping the subscription removes the listener"]
pub struct ListenerSubscription {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl ListenerSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.listeners.remove(&self.id);
            }
        }
    }
}

/// Tracks online/offline state and fans out notices
pub struct ConnectivityMonitor {
    probe: Arc<dyn NetworkProbe>,
    events: EventBus,
    debounce: Duration,
    state_tx: watch::Sender<NetworkState>,
    listeners: Arc<Mutex<ListenerRegistry>>,
    pending_reconnect: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    this: Weak<ConnectivityMonitor>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn NetworkProbe>, events: EventBus, debounce: Duration) -> Arc<Self> {
        let (state_tx, _) = watch::channel(NetworkState::default());
        Arc::new_cyclic(|this| Self {
            probe,
            events,
            debounce,
            state_tx,
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
            pending_reconnect: Mutex::new(None),
            pump: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Fetch the initial reading and start following platform changes
    ///
    /// Never fails: if the platform cannot be read, the monitor reports offline.
    pub async fn initialize(&self) -> NetworkState {
        match self.probe.fetch().await {
            Ok(snapshot) => {
                self.apply(snapshot, false);
            }
            Err(e) => {
                warn!("Network probe failed during initialization, assuming offline: {}", e);
                self.apply(NetworkSnapshot::offline(), false);
            }
        }

        match self.probe.subscribe() {
            Ok(mut rx) => {
                let weak = self.this.clone();
                let handle = tokio::spawn(async move {
                    while let Some(snapshot) = rx.recv().await {
                        let Some(monitor) = weak.upgrade() else {
                            break;
                        };
                        monitor.handle_change(snapshot);
                    }
                    debug!("Network change stream ended");
                });
                if let Some(old) = lock(&self.pump).replace(handle) {
                    old.abort();
                }
            }
            Err(e) => {
                warn!("Cannot subscribe to network changes, assuming offline: {}", e);
                self.apply(NetworkSnapshot::offline(), false);
            }
        }

        self.state()
    }

    /// Stop following platform changes
    pub fn shutdown(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        if let Some(pending) = lock(&self.pending_reconnect).take() {
            pending.abort();
        }
    }

    /// Process one platform reading
    pub fn handle_change(&self, snapshot: NetworkSnapshot) {
        self.apply(snapshot, true);
    }

    /// Force a fresh reading
    pub async fn refresh(&self) -> NetworkState {
        match self.probe.fetch().await {
            Ok(snapshot) => self.handle_change(snapshot),
            Err(e) => {
                warn!("Network refresh failed, assuming offline: {}", e);
                self.handle_change(NetworkSnapshot::offline());
            }
        }
        self.state()
    }

    pub fn state(&self) -> NetworkState {
        self.state_tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.state_tx.borrow().is_online()
    }

    /// Watch the state without registering a listener
    pub fn watch(&self) -> watch::Receiver<NetworkState> {
        self.state_tx.subscribe()
    }

    /// Time since the last disconnection, while offline
    pub fn offline_for(&self) -> Option<Duration> {
        let state = self.state_tx.borrow();
        if state.is_online() {
            return None;
        }
        state
            .last_disconnection_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
    }

    /// Register a listener, called sequentially with every notice
    ///
    /// A panicking listener is logged and does not affect the others.
    pub fn add_listener(
        &self,
        listener: impl Fn(&ConnectivityNotice) + Send + Sync + 'static,
    ) -> ListenerSubscription {
        let mut registry = lock(&self.listeners);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, Arc::new(listener));
        ListenerSubscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).listeners.len()
    }

    fn apply(&self, snapshot: NetworkSnapshot, may_reconnect: bool) {
        let previous = self.state();
        let was_online = previous.is_online();

        let mut current = previous.clone();
        current.is_connected = snapshot.is_connected;
        current.is_internet_reachable = snapshot.is_internet_reachable;
        current.connection_type = snapshot.connection_type;

        let now_online = current.is_online();
        if now_online && !was_online {
            current.last_connection_at = Some(Utc::now());
        } else if !now_online && was_online {
            current.last_disconnection_at = Some(Utc::now());
        }

        self.state_tx.send_replace(current.clone());

        if now_online != was_online {
            info!(
                "Network is now {} ({:?})",
                if now_online { "online" } else { "offline" },
                current.connection_type
            );
        }

        self.events.emit(SyncEvent::ConnectivityChanged(current.clone()));
        self.notify(&ConnectivityNotice::Changed {
            previous,
            current,
        });

        if may_reconnect && now_online && !was_online {
            self.arm_reconnect();
        }
    }

    fn arm_reconnect(&self) {
        let runtime = tokio::runtime::Handle::try_current();
        if self.debounce.is_zero() || runtime.is_err() {
            self.fire_reconnect();
            return;
        }

        let weak = self.this.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(monitor) = weak.upgrade() {
                lock(&monitor.pending_reconnect).take();
                monitor.fire_reconnect();
            }
        });

        if let Some(old) = lock(&self.pending_reconnect).replace(handle) {
            debug!("Reconnection within debounce window, re-arming");
            old.abort();
        }
    }

    fn fire_reconnect(&self) {
        let state = self.state();
        if !state.is_online() {
            debug!("Dropped reconnection notice, offline again");
            return;
        }
        info!("Reconnected");
        self.events.emit(SyncEvent::Reconnected);
        self.notify(&ConnectivityNotice::Reconnected(state));
    }

    fn notify(&self, notice: &ConnectivityNotice) {
        // Snapshot so listeners may unsubscribe while being called
        let listeners: Vec<(u64, Listener)> = lock(&self.listeners)
            .listeners
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(notice))).is_err() {
                error!("Connectivity listener {} panicked", id);
            }
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Polls `GET {server}/health` to decide reachability
pub struct HttpProbe {
    client: reqwest::Client,
    health_url: String,
    interval: Duration,
}

impl HttpProbe {
    pub fn new(server_url: &str, timeout: Duration, interval: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            health_url: format!("{}/health", server_url.trim_end_matches('/')),
            interval,
        })
    }

    async fn check(client: &reqwest::Client, url: &str) -> NetworkSnapshot {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => NetworkSnapshot::online(ConnectionType::Other),
            // Reached the network but not a healthy server
            Ok(resp) => {
                debug!("Health check returned {}", resp.status());
                NetworkSnapshot {
                    is_connected: true,
                    is_internet_reachable: false,
                    connection_type: ConnectionType::Other,
                }
            }
            Err(e) => {
                debug!("Health check failed: {}", e);
                NetworkSnapshot::offline()
            }
        }
    }
}

#[async_trait]
impl NetworkProbe for HttpProbe {
    async fn fetch(&self) -> SyncResult<NetworkSnapshot> {
        Ok(Self::check(&self.client, &self.health_url).await)
    }

    fn subscribe(&self) -> SyncResult<mpsc::Receiver<NetworkSnapshot>> {
        let (tx, rx) = mpsc::channel(8);
        let client = self.client.clone();
        let url = self.health_url.clone();

        tokio::spawn(poll_health(tx, self.interval, move || {
            let client = client.clone();
            let url = url.clone();
            async move { Self::check(&client, &url).await }
        }));

        Ok(rx)
    }
}

/// Send a reading whenever `check` reports a change, until the receiver is dropped
async fn poll_health<F, Fut>(tx: mpsc::Sender<NetworkSnapshot>, interval: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = NetworkSnapshot>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<NetworkSnapshot> = None;
    loop {
        let snapshot = tokio::select! {
            _ = tx.closed() => break,
            snapshot = async {
                ticker.tick().await;
                check().await
            } => snapshot,
        };
        if last != Some(snapshot) {
            last = Some(snapshot);
            if tx.send(snapshot).await.is_err() {
                break;
            }
        }
    }
    debug!("Health polling stopped");
}
