//! Node context: owns the bus, timer service, persistence and element
//! modules and wires them together.
//!
//! ```text
//!   stack ──StackEventSink──▶ ┌──────────┐ ──▶ RelayServer ─┐
//!                             │ EventBus │ ──▶ RelayClient ─┼─▶ Persistence ─▶ FlashPort
//!   app ───AppApi────────────▶└──────────┘ ──▶ TxControl ───┼─▶ StackBridge ─▶ StackPort
//!                                  ▲                        │
//!                   TimerService ──┘ (TIMER_FIRE, FRESH_BOOT)
//! ```
//!
//! Element id 0 is the root element. Server elements follow it, client
//! elements follow the servers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};

use crate::app::api::AppApi;
use crate::app::ports::{Clock, FlashPort, StackPort};
use crate::bus::EventBus;
use crate::config::NodeConfig;
use crate::element::{ElementRange, RelayClient, RelayServer};
use crate::error::{Error, Result};
use crate::events::{
    AppMsg, BusMessage, Channel, OnOffOp, ProvisionInfo, provisioning, system, to_app,
};
use crate::persistence::{Identity, KEY_NODE_STORE, NodeStore, Persistence};
use crate::rtos::tick::Ticker;
use crate::stack::{StackBridge, StackEventSink};
use crate::timer::{TimerId, TimerService};
use crate::tx_control::TxControl;

/// Handles for the background tasks started by [`Node::spawn_tasks`].
pub struct NodeTasks {
    bus: JoinHandle<()>,
    ticker: Ticker,
}

pub struct Node {
    config: NodeConfig,
    bus: Arc<EventBus>,
    timers: Arc<TimerService>,
    nvs: Arc<Persistence>,
    bridge: Arc<StackBridge>,
    tx: Option<Arc<TxControl>>,
    server: Option<Arc<RelayServer>>,
    client: Option<Arc<RelayClient>>,
    fresh_boot_timer: TimerId,
    store: Arc<Mutex<NodeStore>>,
}

impl Node {
    /// Build and wire every component. No task is started; see
    /// [`spawn_tasks`](Self::spawn_tasks) and [`boot`](Self::boot).
    pub fn new(
        config: NodeConfig,
        flash: Box<dyn FlashPort>,
        port: Arc<dyn StackPort>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let timers = TimerService::new(Arc::clone(&bus), clock)?;
        let nvs = Persistence::new(flash, Arc::clone(&timers));
        nvs.open(
            &config.nvs_namespace,
            Identity {
                company_id: config.company_id,
                product_id: config.product_id,
            },
            config.commit_window_ms,
        )?;

        let store = match nvs.read_record::<NodeStore>(KEY_NODE_STORE) {
            Ok(s) => s,
            Err(Error::NotFound) => NodeStore::default(),
            Err(e) => {
                warn!("node: node store unreadable ({}), starting unprovisioned", e);
                NodeStore::default()
            }
        };
        info!(
            "node: '{}' addr={:#06x} provisioned={}",
            config.product_name, store.node_addr, store.provisioned
        );
        let store = Arc::new(Mutex::new(store));

        let (bridge, tx) = if config.tx_control {
            let (bridge, tx) = StackBridge::register_with_tx_control(Arc::clone(&bus), port)?;
            (bridge, Some(tx))
        } else {
            (StackBridge::register(Arc::clone(&bus), port)?, None)
        };

        let mut next = 1u16;
        let server = if config.relay_server_count > 0 {
            let range = ElementRange::new(next, config.relay_server_count)?;
            next = range.end;
            Some(RelayServer::register(range, Arc::clone(&bus), Arc::clone(&nvs))?)
        } else {
            None
        };
        let client = if config.relay_client_count > 0 {
            let range = ElementRange::new(next, config.relay_client_count)?;
            Some(RelayClient::register(
                range,
                Arc::clone(&bus),
                Arc::clone(&nvs),
                config.retry,
            )?)
        } else {
            None
        };

        subscribe_provisioning(&bus, &nvs, &store)?;

        let weak_bus = Arc::downgrade(&bus);
        let fresh_boot_timer = timers.create("fresh_boot", config.fresh_boot_delay_ms, false, move || {
            let Some(bus) = weak_bus.upgrade() else { return };
            if let Err(e) = bus.try_publish(Channel::System, system::FRESH_BOOT, &[]) {
                error!("node: fresh boot publish failed: {}", e);
            }
        })?;

        Ok(Self {
            config,
            bus,
            timers,
            nvs,
            bridge,
            tx,
            server,
            client,
            fresh_boot_timer,
            store,
        })
    }

    /// Arm the one-shot fresh-boot timer.
    pub fn boot(&self) -> Result<()> {
        info!("node: fresh boot in {}ms", self.config.fresh_boot_delay_ms);
        self.timers.start(self.fresh_boot_timer)
    }

    /// Start the bus consumer task and the timer tick.
    pub fn spawn_tasks(&self) -> Result<NodeTasks> {
        let bus = self
            .bus
            .spawn(Duration::from_millis(u64::from(self.config.dequeue_timeout_ms)))?;
        let ticker = match self
            .timers
            .start_driver(Duration::from_millis(u64::from(self.config.timer_tick_ms)))
        {
            Ok(t) => t,
            Err(e) => {
                self.bus.stop();
                return Err(e);
            }
        };
        Ok(NodeTasks { bus, ticker })
    }

    /// Build, start the tasks and arm the fresh-boot timer.
    pub fn start(
        config: NodeConfig,
        flash: Box<dyn FlashPort>,
        port: Arc<dyn StackPort>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, NodeTasks)> {
        let node = Self::new(config, flash, port, clock)?;
        let tasks = node.spawn_tasks()?;
        node.boot()?;
        Ok((node, tasks))
    }

    /// Stop the tasks, flush pending writes and close persistence.
    pub fn shutdown(&self, tasks: NodeTasks) -> Result<()> {
        let NodeTasks { bus, mut ticker } = tasks;
        ticker.stop();
        self.bus.stop();
        if bus.join().is_err() {
            error!("node: bus task panicked");
        }
        self.nvs.commit()?;
        self.nvs.close()?;
        info!("node: shut down");
        Ok(())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.nvs
    }

    pub fn bridge(&self) -> &Arc<StackBridge> {
        &self.bridge
    }

    /// Client-traffic queue; `None` when `tx_control` is off.
    pub fn tx_control(&self) -> Option<&Arc<TxControl>> {
        self.tx.as_ref()
    }

    pub fn server(&self) -> Option<&Arc<RelayServer>> {
        self.server.as_ref()
    }

    pub fn client(&self) -> Option<&Arc<RelayClient>> {
        self.client.as_ref()
    }

    /// Inbound seam for the mesh stack.
    pub fn stack_sink(&self) -> StackEventSink {
        StackEventSink::new(Arc::clone(&self.bus))
    }

    pub fn api(&self) -> AppApi {
        AppApi::new(Arc::clone(&self.bus))
    }

    /// App request to a client element, bounded by the configured publish
    /// timeout.
    pub fn request(&self, element_id: u16, op: OnOffOp) -> Result<()> {
        let timeout = Duration::from_millis(u64::from(self.config.publish_timeout_ms));
        self.api().send_to_element(element_id, op, timeout)
    }

    pub fn node_store(&self) -> NodeStore {
        *lock(&self.store)
    }
}

fn lock(store: &Mutex<NodeStore>) -> MutexGuard<'_, NodeStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keep the node store in step with provisioning and forward every
/// provisioning bit to the application.
fn subscribe_provisioning(
    bus: &Arc<EventBus>,
    nvs: &Arc<Persistence>,
    store: &Arc<Mutex<NodeStore>>,
) -> Result<()> {
    // Weak: the bus registry must not keep its own owners alive.
    let weak_bus: Weak<EventBus> = Arc::downgrade(bus);
    let weak_nvs: Weak<Persistence> = Arc::downgrade(nvs);
    let store = Arc::clone(store);
    bus.subscribe_fn(Channel::Provisioning, provisioning::ALL, move |msg| {
        let (Some(bus), Some(nvs)) = (weak_bus.upgrade(), weak_nvs.upgrade()) else {
            return Ok(());
        };
        on_provisioning(msg, &nvs, &store);
        bus.try_emit(Channel::ToApp, to_app::CTRL, &AppMsg::Control { event: msg.event })
    })?;
    Ok(())
}

fn on_provisioning(msg: &BusMessage, nvs: &Persistence, store: &Mutex<NodeStore>) {
    if msg.event & provisioning::COMPLETE != 0 {
        let info: ProvisionInfo = match msg.decode() {
            Ok(i) => i,
            Err(e) => {
                warn!("node: bad provisioning payload: {}", e);
                return;
            }
        };
        let updated = NodeStore {
            net_key_idx: info.net_key_idx,
            node_addr: info.node_addr,
            provisioned: true,
        };
        *lock(store) = updated;
        // Provisioning data must not sit in a debounce window.
        let saved = nvs
            .write_record(KEY_NODE_STORE, &updated, false)
            .and_then(|()| nvs.commit());
        match saved {
            Ok(()) => info!("node: provisioned as {:#06x}", info.node_addr),
            Err(e) => error!("node: node store save failed: {}", e),
        }
    }
    if msg.event & provisioning::NODE_RESET != 0 {
        *lock(store) = NodeStore::default();
        match nvs.erase() {
            Ok(()) => warn!("node: reset, namespace erased"),
            Err(e) => error!("node: reset erase failed: {}", e),
        }
    }
}
