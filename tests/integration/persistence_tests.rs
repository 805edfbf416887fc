//! Persistence engine tests against the simulated NVS partition.

use std::sync::Arc;

use meshnode::Error;
use meshnode::persistence::{Identity, Persistence};

use crate::mock_stack::{IDENTITY, NAMESPACE, Rig};

#[test]
fn burst_of_writes_coalesces_into_one_commit() {
    let rig = Rig::new(1000);
    let before = rig.flash.commit_count();

    rig.nvs.set("A", &[1], true).unwrap();
    rig.step(10);
    rig.nvs.set("A", &[2], true).unwrap();
    rig.step(999);
    assert_eq!(rig.flash.commit_count(), before);

    rig.step(1);
    assert_eq!(rig.flash.commit_count(), before + 1);
    assert_eq!(rig.flash.durable_value(NAMESPACE, "A"), Some(vec![2]));

    let mut buf = [0u8; 4];
    assert_eq!(rig.nvs.get("A", &mut buf).unwrap(), 1);
    assert_eq!(buf[0], 2);

    // Nothing further pending.
    rig.step(5000);
    assert_eq!(rig.flash.commit_count(), before + 1);
}

#[test]
fn unarmed_write_is_readable_but_never_durable() {
    let rig = Rig::new(100);
    let before = rig.flash.commit_count();
    rig.nvs.set("cfg", b"xyz", false).unwrap();
    rig.step(10_000);

    let mut buf = [0u8; 8];
    assert_eq!(rig.nvs.get("cfg", &mut buf).unwrap(), 3);
    assert_eq!(rig.flash.commit_count(), before);
    assert_eq!(rig.flash.durable_value(NAMESPACE, "cfg"), None);

    rig.flash.power_cycle();
    assert_eq!(rig.nvs.get("cfg", &mut buf).unwrap_err(), Error::NotFound);
}

#[test]
fn short_buffer_reports_truncated_and_stays_untouched() {
    let rig = Rig::new(100);
    rig.nvs.set("blob", &[9; 8], true).unwrap();
    let mut buf = [0xAAu8; 4];
    assert_eq!(rig.nvs.get("blob", &mut buf).unwrap_err(), Error::Truncated);
    assert_eq!(buf, [0xAA; 4]);
}

#[test]
fn identity_mismatch_wipes_namespace() {
    let rig = Rig::new(100);
    rig.nvs.set("keep", &[1], false).unwrap();
    rig.nvs.commit().unwrap();
    rig.nvs.close().unwrap();

    // Same firmware: data survives.
    rig.nvs.open(NAMESPACE, IDENTITY, 100).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(rig.nvs.get("keep", &mut buf).unwrap(), 1);
    rig.nvs.close().unwrap();

    // Other product: erased and re-stamped.
    let other = Identity {
        company_id: IDENTITY.company_id,
        product_id: IDENTITY.product_id + 1,
    };
    rig.nvs.open(NAMESPACE, other, 100).unwrap();
    assert_eq!(rig.nvs.get("keep", &mut buf).unwrap_err(), Error::NotFound);
    assert_eq!(rig.flash.durable_value(NAMESPACE, "keep"), None);
    assert_eq!(
        rig.flash.durable_value(NAMESPACE, "id_pid"),
        Some(other.product_id.to_le_bytes().to_vec())
    );
}

#[test]
fn lifecycle_errors() {
    let rig = Rig::new(100);
    assert_eq!(
        rig.nvs.open(NAMESPACE, IDENTITY, 100).unwrap_err(),
        Error::InvalidState
    );
    assert_eq!(rig.nvs.remove("missing").unwrap_err(), Error::NotFound);

    rig.nvs.close().unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(rig.nvs.get("A", &mut buf).unwrap_err(), Error::InvalidState);
    assert_eq!(rig.nvs.set("A", &[1], true).unwrap_err(), Error::InvalidState);
    assert_eq!(rig.nvs.commit().unwrap_err(), Error::InvalidState);
    assert_eq!(rig.nvs.close().unwrap_err(), Error::InvalidState);
}

#[test]
fn close_drops_pending_commit() {
    let rig = Rig::new(100);
    let before = rig.flash.commit_count();
    rig.nvs.set("A", &[1], true).unwrap();
    rig.nvs.close().unwrap();
    rig.step(500);
    assert_eq!(rig.flash.commit_count(), before);
}

#[test]
fn zero_window_uses_default() {
    let rig = Rig::new(100);
    let fresh = Persistence::new(Box::new(rig.flash.clone()), Arc::clone(&rig.timers));
    fresh.open("other_ns", IDENTITY, 0).unwrap();
    assert_eq!(fresh.commit_window_ms().unwrap(), 1000);
}
