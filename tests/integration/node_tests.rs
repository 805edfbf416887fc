//! End-to-end tests through [`Node`]: stack events in, stack messages and
//! app notifications out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshnode::adapters::nvs::NvsFlash;
use meshnode::adapters::time::{ManualClock, MonotonicClock};
use meshnode::config::NodeConfig;
use meshnode::element::ElementSyncState;
use meshnode::events::{
    AppMsg, ConfigChange, OnOffOp, OnOffSet, OnOffStatus, ProvisionInfo, StackMsg, configuration,
    provisioning,
};
use meshnode::node::Node;
use meshnode::persistence::KEY_NODE_STORE;
use meshnode::rtos::sem::CountingSemaphore;
use meshnode::stack::StackEvent;

use crate::mock_stack::RecordingStack;

struct Harness {
    node: Node,
    clock: Arc<ManualClock>,
    flash: NvsFlash,
    stack: Arc<RecordingStack>,
}

impl Harness {
    fn new(flash: NvsFlash) -> Self {
        let clock = Arc::new(ManualClock::new());
        let stack = RecordingStack::new();
        let node = Node::new(
            NodeConfig::default(),
            Box::new(flash.clone()),
            stack.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            node,
            clock,
            flash,
            stack,
        }
    }

    fn event(&self, ev: StackEvent) {
        self.node.stack_sink().on_stack_event(ev).unwrap();
        self.node.bus().drain();
    }

    fn step(&self, ms: u64) {
        self.clock.advance_ms(ms);
        self.node.timers().poll();
        self.node.bus().drain();
    }

    fn bind(&self, element_id: u16, pub_addr: u16) {
        self.event(StackEvent::Config {
            event: configuration::PUB_ADD,
            change: ConfigChange {
                element_id,
                app_key_idx: 0,
                pub_addr,
            },
        });
    }
}

fn provision(net_key_idx: u16, node_addr: u16) -> StackEvent {
    StackEvent::Provisioning {
        event: provisioning::COMPLETE,
        info: ProvisionInfo {
            net_key_idx,
            node_addr,
        },
    }
}

#[test]
fn provisioned_node_publishes_server_status_on_enable() {
    let h = Harness::new(NvsFlash::new().unwrap());
    h.event(provision(3, 0x0010));
    h.bind(1, 0xC000);
    h.event(StackEvent::OnOffSet(OnOffSet {
        element_id: 1,
        on: true,
    }));
    h.stack.clear();

    h.event(StackEvent::Provisioning {
        event: provisioning::NODE_ENABLED,
        info: ProvisionInfo {
            net_key_idx: 3,
            node_addr: 0x0010,
        },
    });

    assert_eq!(
        h.stack.sent(),
        vec![StackMsg::ServerStatus {
            element_id: 1,
            net_key_idx: 3,
            app_key_idx: 0,
            dst_addr: 0xC000,
            on: true,
        }]
    );
}

#[test]
fn fresh_boot_queries_client_elements() {
    let h = Harness::new(NvsFlash::new().unwrap());
    h.bind(2, 0xC001);
    h.node.boot().unwrap();

    h.step(1499);
    assert_eq!(h.stack.client_sends_for(2), 0);
    h.step(1);

    let sent = h.stack.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(
        sent[0],
        StackMsg::Client {
            element_id: 2,
            op: OnOffOp::Get,
            dst_addr: 0xC001,
            ..
        }
    ));
}

#[test]
fn client_messages_go_out_one_exchange_at_a_time() {
    let clock = Arc::new(ManualClock::new());
    let stack = RecordingStack::new();
    let config = NodeConfig {
        relay_client_count: 2,
        ..NodeConfig::default()
    };
    let node = Node::new(
        config,
        Box::new(NvsFlash::new().unwrap()),
        stack.clone(),
        clock,
    )
    .unwrap();
    let api = node.api();

    // Clients are elements 2 and 3.
    api.try_send_to_element(2, OnOffOp::Set).unwrap();
    api.try_send_to_element(3, OnOffOp::Set).unwrap();
    node.bus().drain();
    assert_eq!(stack.client_sends_for(2), 1);
    assert_eq!(stack.client_sends_for(3), 0);
    assert_eq!(node.tx_control().unwrap().pending(), 2);

    // A failed exchange is retried before the queue moves on.
    node.stack_sink()
        .on_stack_event(StackEvent::OnOffStatus(OnOffStatus {
            element_id: 2,
            delivered: false,
            on: false,
        }))
        .unwrap();
    node.bus().drain();
    assert_eq!(stack.client_sends_for(2), 2);
    assert_eq!(stack.client_sends_for(3), 0);

    node.stack_sink()
        .on_stack_event(StackEvent::OnOffStatus(OnOffStatus {
            element_id: 2,
            delivered: true,
            on: true,
        }))
        .unwrap();
    node.bus().drain();
    assert_eq!(stack.client_sends_for(3), 1);
    assert_eq!(node.tx_control().unwrap().pending(), 1);
}

#[test]
fn control_events_reach_the_app_and_reset_erases() {
    let h = Harness::new(NvsFlash::new().unwrap());
    let ctrl = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&ctrl);
    h.node.api().on_control(move |ev| c.lock().unwrap().push(ev)).unwrap();

    h.event(provision(0, 0x0042));
    assert!(h.flash.durable_value("MESHX_NVS", KEY_NODE_STORE).is_some());

    h.event(StackEvent::Provisioning {
        event: provisioning::NODE_RESET,
        info: ProvisionInfo {
            net_key_idx: 0,
            node_addr: 0,
        },
    });
    assert!(!h.node.node_store().provisioned);
    assert_eq!(h.flash.durable_value("MESHX_NVS", KEY_NODE_STORE), None);
    assert_eq!(
        *ctrl.lock().unwrap(),
        vec![provisioning::COMPLETE, provisioning::NODE_RESET]
    );
}

#[test]
fn element_state_survives_reboot() {
    let flash = NvsFlash::new().unwrap();
    {
        let h = Harness::new(flash.clone());
        h.event(StackEvent::OnOffSet(OnOffSet {
            element_id: 1,
            on: true,
        }));
        let server = h.node.server().unwrap();
        assert_eq!(server.sync_state(1).unwrap(), ElementSyncState::Dirty);
        h.step(u64::from(h.node.config().commit_window_ms));
        assert_eq!(server.sync_state(1).unwrap(), ElementSyncState::Synced);
    }
    flash.power_cycle();

    let h = Harness::new(flash);
    let ctx = h.node.server().unwrap().context(1).unwrap();
    assert!(ctx.state);
    assert!(!ctx.prev_state);
}

#[test]
fn running_node_delivers_app_notifications() {
    let stack = RecordingStack::new();
    let (node, tasks) = Node::start(
        NodeConfig::default(),
        Box::new(NvsFlash::new().unwrap()),
        stack.clone(),
        Arc::new(MonotonicClock::new()),
    )
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(CountingSemaphore::new(0));
    let (s, d) = (Arc::clone(&seen), Arc::clone(&delivered));
    node.api()
        .on_data(move |m| {
            s.lock().unwrap().push(m);
            d.give();
        })
        .unwrap();

    node.stack_sink()
        .on_stack_event(StackEvent::OnOffSet(OnOffSet {
            element_id: 1,
            on: true,
        }))
        .unwrap();

    delivered.take(Duration::from_secs(2)).unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![AppMsg::ServerState {
            element_id: 1,
            on: true
        }]
    );

    node.shutdown(tasks).unwrap();
    assert!(!node.bus().is_running());
    assert!(!node.persistence().is_open());
}
