//! Element synchronizer tests: relay server and client modules wired to
//! the bus, persistence and a recording stack.

use std::sync::{Arc, Mutex};

use meshnode::Error;
use meshnode::app::api::AppApi;
use meshnode::config::RetryPolicy;
use meshnode::element::{ElementContext, ElementRange, ElementSyncState, RelayClient, RelayServer};
use meshnode::events::{AppMsg, OnOffOp, OnOffSet, OnOffStatus, StackMsg};
use meshnode::stack::{StackBridge, StackEvent, StackEventSink};

use crate::mock_stack::{RecordingStack, Rig};

fn server(rig: &Rig, start: u16, count: u16) -> Arc<RelayServer> {
    RelayServer::register(
        ElementRange::new(start, count).unwrap(),
        Arc::clone(&rig.bus),
        Arc::clone(&rig.nvs),
    )
    .unwrap()
}

fn client(rig: &Rig, start: u16, count: u16, retry: RetryPolicy) -> Arc<RelayClient> {
    RelayClient::register(
        ElementRange::new(start, count).unwrap(),
        Arc::clone(&rig.bus),
        Arc::clone(&rig.nvs),
        retry,
    )
    .unwrap()
}

fn app_log(rig: &Rig) -> Arc<Mutex<Vec<AppMsg>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    AppApi::new(Arc::clone(&rig.bus))
        .on_data(move |m| l.lock().unwrap().push(m))
        .unwrap();
    log
}

// ── Server ────────────────────────────────────────────────────

#[test]
fn element_outside_range_is_rejected_without_side_effects() {
    let rig = Rig::new(100);
    let srv = server(&rig, 10, 3);
    let app = app_log(&rig);
    let commits = rig.flash.commit_count();

    assert_eq!(srv.set_on_off(5, true).unwrap_err(), Error::InvalidArgument);

    // Through the bus the stray id is ignored.
    StackEventSink::new(Arc::clone(&rig.bus))
        .on_stack_event(StackEvent::OnOffSet(OnOffSet {
            element_id: 5,
            on: true,
        }))
        .unwrap();
    rig.step(200);

    for id in 10..13 {
        assert_eq!(srv.context(id).unwrap(), ElementContext::default());
        assert_eq!(srv.sync_state(id).unwrap(), ElementSyncState::Uninitialized);
    }
    assert!(app.lock().unwrap().is_empty());
    assert_eq!(rig.flash.commit_count(), commits);
}

#[test]
fn server_state_walks_dirty_then_synced() {
    let rig = Rig::new(100);
    let srv = server(&rig, 1, 2);
    let sink = StackEventSink::new(Arc::clone(&rig.bus));

    sink.on_stack_event(StackEvent::OnOffSet(OnOffSet {
        element_id: 2,
        on: true,
    }))
    .unwrap();
    rig.step(0);
    assert_eq!(srv.sync_state(2).unwrap(), ElementSyncState::Dirty);

    // A second change inside the window re-arms it.
    rig.step(60);
    sink.on_stack_event(StackEvent::OnOffSet(OnOffSet {
        element_id: 2,
        on: false,
    }))
    .unwrap();
    rig.step(60);
    assert_eq!(srv.sync_state(2).unwrap(), ElementSyncState::Dirty);

    // The window restarted when the second change was handled at t=120.
    rig.step(40);
    assert_eq!(srv.sync_state(2).unwrap(), ElementSyncState::Dirty);
    rig.step(60);
    assert_eq!(srv.sync_state(2).unwrap(), ElementSyncState::Synced);
    let ctx = srv.context(2).unwrap();
    assert!(!ctx.state);
    assert!(ctx.prev_state);
}

#[test]
fn committed_context_restored_after_power_cycle() {
    let rig = Rig::new(100);
    let srv = server(&rig, 1, 1);
    srv.set_on_off(1, true).unwrap();
    rig.step(100);
    let flash = rig.flash.clone();
    rig.nvs.close().unwrap();
    drop(srv);
    drop(rig);

    flash.power_cycle();
    let rig = Rig::on_flash(flash, 100);
    let srv = server(&rig, 1, 1);
    assert!(srv.context(1).unwrap().state);
    assert_eq!(srv.sync_state(1).unwrap(), ElementSyncState::Synced);
}

#[test]
fn uncommitted_context_lost_on_power_cycle() {
    let rig = Rig::new(100);
    let srv = server(&rig, 1, 1);
    srv.set_on_off(1, true).unwrap();
    rig.step(50);
    let flash = rig.flash.clone();
    drop(srv);
    drop(rig);

    flash.power_cycle();
    let rig = Rig::on_flash(flash, 100);
    let srv = server(&rig, 1, 1);
    assert!(!srv.context(1).unwrap().state);
    assert_eq!(srv.sync_state(1).unwrap(), ElementSyncState::Uninitialized);
}

// ── Client ────────────────────────────────────────────────────

#[test]
fn send_failure_triggers_another_attempt() {
    let rig = Rig::new(100);
    let stack = RecordingStack::new();
    let _bridge = StackBridge::register(Arc::clone(&rig.bus), stack.clone()).unwrap();
    let cli = client(&rig, 10, 3, RetryPolicy::Unbounded);

    stack.fail_next(3);
    cli.send(10, OnOffOp::Set).unwrap();
    // Unbounded retry: bound the drain rather than waiting for quiet.
    rig.bus.drain_up_to(64);

    assert!(stack.client_sends_for(10) >= 2);
    assert_eq!(stack.client_sends_for(10), 4);
    assert_eq!(stack.client_sends_for(11), 0);
}

#[test]
fn bounded_retry_reports_send_failed_to_app() {
    let rig = Rig::new(100);
    let stack = RecordingStack::new();
    let _bridge = StackBridge::register(Arc::clone(&rig.bus), stack.clone()).unwrap();
    let cli = client(&rig, 10, 3, RetryPolicy::Bounded { max_attempts: 3 });
    let app = app_log(&rig);

    stack.fail_next(u32::MAX);
    cli.send(11, OnOffOp::Set).unwrap();
    rig.bus.drain();

    assert_eq!(stack.client_sends_for(11), 3);
    assert_eq!(
        *app.lock().unwrap(),
        vec![AppMsg::SendFailed { element_id: 11 }]
    );
}

#[test]
fn exhausted_retries_release_the_next_queued_message() {
    let rig = Rig::new(100);
    let stack = RecordingStack::new();
    let (_bridge, tx) =
        StackBridge::register_with_tx_control(Arc::clone(&rig.bus), stack.clone()).unwrap();
    let cli = client(&rig, 10, 2, RetryPolicy::Bounded { max_attempts: 2 });

    stack.fail_next(2);
    cli.send(10, OnOffOp::Set).unwrap();
    cli.send(11, OnOffOp::Get).unwrap();
    rig.bus.drain();

    // Two failed attempts for 10, then the queue moves on to 11.
    assert_eq!(stack.client_sends_for(10), 2);
    assert_eq!(stack.client_sends_for(11), 1);
    assert!(matches!(
        tx.in_flight(),
        Some(StackMsg::Client {
            element_id: 11,
            op: OnOffOp::Get,
            ..
        })
    ));
}

#[test]
fn app_request_round_trip_updates_client_state() {
    let rig = Rig::new(100);
    let stack = RecordingStack::new();
    let _bridge = StackBridge::register(Arc::clone(&rig.bus), stack.clone()).unwrap();
    let cli = client(&rig, 10, 1, RetryPolicy::Unbounded);
    let app = app_log(&rig);
    let api = AppApi::new(Arc::clone(&rig.bus));

    api.try_send_to_element(10, OnOffOp::Get).unwrap();
    // Requests for elements the client does not own are dropped.
    api.try_send_to_element(42, OnOffOp::Get).unwrap();
    rig.bus.drain();
    assert_eq!(stack.sent().len(), 1);
    assert!(matches!(
        stack.sent()[0],
        StackMsg::Client {
            element_id: 10,
            op: OnOffOp::Get,
            ..
        }
    ));

    StackEventSink::new(Arc::clone(&rig.bus))
        .on_stack_event(StackEvent::OnOffStatus(OnOffStatus {
            element_id: 10,
            delivered: true,
            on: true,
        }))
        .unwrap();
    rig.bus.drain();

    assert!(cli.is_ready(10).unwrap());
    assert_eq!(
        *app.lock().unwrap(),
        vec![AppMsg::ClientState {
            element_id: 10,
            on: true
        }]
    );
    // Next SET targets the opposite of what the remote reported.
    assert!(!cli.context(10).unwrap().state);
}
