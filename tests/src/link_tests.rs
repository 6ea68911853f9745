//! End-to-end link-protocol scenarios over the loopback bus.

use psu_core::test_utils::{leak, LinkHarness, ResponderMode};
use psu_core::{
    EventKind, SpimQueueError, SpimTrx, SpimTrxStatus, SpisSendError, SpisState, TaskRef,
};

fn reply(msg_type: u8, payload: &'static [u8]) -> ResponderMode {
    ResponderMode::Reply { msg_type, payload }
}

#[test]
fn request_and_response_round_trip() {
    let h = LinkHarness::new(reply(0x01, &[0x01, 0x02, 0x03]));
    let trx = leak(
        SpimTrx::framed(h.select, 0x01, &[0xAA, 0xBB], 4, Some(h.owner as TaskRef)).unwrap(),
    );
    let status = h.run_until_done(trx, 400);

    assert_eq!(status, SpimTrxStatus::CompletedSuccessfully);
    assert_eq!(trx.rx_type(), Some(0x01));
    assert_eq!(trx.rx().as_slice(), [0x01, 0x02, 0x03]);

    assert_eq!(h.slave.rx_type(), 0x01);
    assert_eq!(h.slave.rx().as_slice(), [0xAA, 0xBB]);
    assert!(h.responder.saw(EventKind::SpisMessageReceived));
    assert_eq!(h.responder.last_send(), Some(Ok(())));

    // Run a little past the deselect so the transmit notification lands.
    h.run(10);
    assert!(h.responder.saw(EventKind::SpisResponseTransmitted));
    assert!(h
        .owner
        .saw(EventKind::SpimTrxDone(SpimTrxStatus::CompletedSuccessfully)));
    assert!(!h.select.is_selected());
    assert_eq!(h.slave.state(), SpisState::Ready);
}

#[test]
fn empty_request_and_empty_response() {
    let h = LinkHarness::new(reply(0x06, &[]));
    let trx = leak(SpimTrx::framed(h.select, 0x03, &[], 8, Some(h.owner as TaskRef)).unwrap());
    let status = h.run_until_done(trx, 400);

    assert_eq!(status, SpimTrxStatus::CompletedSuccessfully);
    assert_eq!(trx.rx_type(), Some(0x06));
    assert!(trx.rx().is_empty());
    assert!(h.slave.rx().is_empty());
}

#[test]
fn corrupted_request_byte_is_rejected_by_the_slave() {
    let h = LinkHarness::new(reply(0x05, &[0x01]));
    // Frame on the wire is [type][size][p0][p1][crc][crc]; flip the first
    // payload byte.
    h.master_bus.corrupt_write_at(2);
    let trx = leak(
        SpimTrx::framed(h.select, 0x01, &[0xAA, 0xBB], 16, Some(h.owner as TaskRef)).unwrap(),
    );
    let status = h.run_until_done(trx, 400);

    assert_eq!(status, SpimTrxStatus::CrcFailure);
    assert!(!h.responder.saw(EventKind::SpisMessageReceived));
    h.run(5);
    assert_eq!(h.slave.state(), SpisState::Ready);
}

#[test]
fn request_too_large_for_the_slave_aborts_mid_frame() {
    let h = LinkHarness::new(reply(0x05, &[0x01]));
    // Fits the master's buffer but not the slave's.
    let payload = [0u8; 40];
    let trx = leak(
        SpimTrx::framed(h.select, 0x01, &payload, 16, Some(h.owner as TaskRef)).unwrap(),
    );
    let status = h.run_until_done(trx, 400);

    assert_eq!(status, SpimTrxStatus::MessageTooLarge);
    // The error byte was seen early enough to skip most of the payload.
    assert!(h.master_bus.written().len() < 8);
    assert!(!h.responder.saw(EventKind::SpisMessageReceived));
    h.run(5);
    assert_eq!(h.slave.state(), SpisState::Ready);
}

#[test]
fn silent_slave_owner_times_out() {
    let h = LinkHarness::new(ResponderMode::Silent);
    let trx = leak(SpimTrx::framed(h.select, 0x01, &[0x11], 8, Some(h.owner as TaskRef)).unwrap());
    let status = h.run_until_done(trx, 600);

    assert_eq!(status, SpimTrxStatus::NoResponse);
    assert!(!h.select.is_selected());
    h.run(10);
    // The slave learned its response window closed.
    assert!(h.responder.saw(EventKind::SpisResponseError));
    assert_eq!(
        h.slave.state(),
        SpisState::AbortedWhileWaitingForCallback
    );

    // A response staged after the fact is refused and clears the slate.
    assert_eq!(
        h.slave.send_response(0x05, &[]),
        Err(SpisSendError::NoTrxInProgress)
    );
    assert_eq!(h.slave.state(), SpisState::Ready);
}

#[test]
fn response_exceeding_master_capacity_is_cut_off() {
    let h = LinkHarness::new(reply(0x05, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]));
    let trx = leak(SpimTrx::framed(h.select, 0x01, &[], 4, Some(h.owner as TaskRef)).unwrap());
    let status = h.run_until_done(trx, 400);

    assert_eq!(status, SpimTrxStatus::ResponseTooLarge);
    h.run(10);
    // Deselect landed while the slave was mid-response.
    assert!(h.responder.saw(EventKind::SpisResponseError));
    assert_eq!(h.slave.state(), SpisState::Ready);
}

#[test]
fn reserved_response_type_surfaces_on_both_sides() {
    let h = LinkHarness::new(reply(0xF5, &[0x01]));
    let trx = leak(SpimTrx::framed(h.select, 0x01, &[], 8, Some(h.owner as TaskRef)).unwrap());
    let status = h.run_until_done(trx, 400);

    assert_eq!(status, SpimTrxStatus::SlaveResponseInvalid);
    assert_eq!(h.responder.last_send(), Some(Err(SpisSendError::InvalidType)));
}

#[test]
fn transactions_complete_in_queue_order() {
    let h = LinkHarness::new(reply(0x05, &[0x0A]));
    let first = leak(SpimTrx::framed(h.select, 0x01, &[0x01], 8, Some(h.owner as TaskRef)).unwrap());
    let second =
        leak(SpimTrx::framed(h.select, 0x02, &[0x02], 8, Some(h.owner as TaskRef)).unwrap());

    h.master.queue(first).unwrap();
    h.master.queue(second).unwrap();
    assert_eq!(h.master.queue(second), Err(SpimQueueError::AlreadyQueued));

    for _ in 0..800 {
        h.step();
        if first.status().is_some() && second.status().is_some() {
            break;
        }
    }
    assert_eq!(first.status(), Some(SpimTrxStatus::CompletedSuccessfully));
    assert_eq!(second.status(), Some(SpimTrxStatus::CompletedSuccessfully));
    // The second request only started after the first finished.
    assert_eq!(h.slave.rx_type(), 0x02);
    assert_eq!(h.master.backlog(), 0);
}

#[test]
fn descriptor_round_trips_twice() {
    let h = LinkHarness::new(reply(0x05, &[0x0A]));
    let trx = leak(SpimTrx::framed(h.select, 0x01, &[0x10], 8, Some(h.owner as TaskRef)).unwrap());

    assert_eq!(
        h.run_until_done(trx, 400),
        SpimTrxStatus::CompletedSuccessfully
    );
    assert_eq!(trx.rx().as_slice(), [0x0A]);

    h.run(10);
    assert_eq!(
        h.run_until_done(trx, 400),
        SpimTrxStatus::CompletedSuccessfully
    );
    assert_eq!(trx.rx().as_slice(), [0x0A]);
}

#[test]
fn recovery_after_rejected_frame() {
    let h = LinkHarness::new(reply(0x05, &[0x0A]));

    h.master_bus.corrupt_write_at(2);
    let bad =
        leak(SpimTrx::framed(h.select, 0x01, &[0x01, 0x02], 8, Some(h.owner as TaskRef)).unwrap());
    assert_eq!(h.run_until_done(bad, 400), SpimTrxStatus::CrcFailure);

    // Next frame goes through untouched.
    h.run(10);
    let good =
        leak(SpimTrx::framed(h.select, 0x01, &[0x03, 0x04], 8, Some(h.owner as TaskRef)).unwrap());
    assert_eq!(
        h.run_until_done(good, 400),
        SpimTrxStatus::CompletedSuccessfully
    );
    assert_eq!(h.slave.rx().as_slice(), [0x03, 0x04]);
}
