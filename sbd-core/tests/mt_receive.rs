//! Gateway poll, mobile-terminated read, and the voice-call hangup that
//! follows a delivery while the handset is off hook.

mod common;

use common::Rig;
use sbd_core::at::mt;
use sbd_core::session::SessionState;

fn mt_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame: heapless::Vec<u8, { mt::MAX_MT_FRAME + 1 }> = heapless::Vec::new();
    mt::encode_frame(payload, &mut frame).unwrap();
    frame.to_vec()
}

#[test]
fn gateway_poll_triggers_a_read_and_hangup() {
    let mut rig = Rig::new();
    rig.boot_to_idle();
    rig.settle_idle();

    // No outbox traffic, so the expired gateway timer polls the ESS.
    rig.bench.advance_secs(11);
    rig.tick();
    assert_eq!(rig.drain_wire(), b"AT+SBDSX\r");

    rig.feed(b"+SBDSX: 0, 42, 1, 7, 0, 1\r\n0\r");
    rig.tick(); // fields parsed
    rig.tick(); // final ack; cleanup issues the buffer read
    assert_eq!(rig.drain_wire(), b"AT+SBDRB\r");
    assert_eq!(rig.modem.mtmsn(), "7");

    // The handset goes off hook while the frame streams in.
    rig.modem.port_mut().set_input_lines(false, false, true, true);

    let mut payload = [0u8; 16];
    payload[2..4].copy_from_slice(&0x0025u16.to_be_bytes()); // modem inbox band
    payload[4..].fill(0xA5);
    let frame = mt_frame(&payload);
    rig.feed(&frame);
    rig.tick(); // frame complete, file written, hangup queued

    assert_eq!(rig.bench.files.len(), 1);
    let (path, data) = &rig.bench.files[0];
    assert!(path.starts_with("modem/inbox/"));
    assert_eq!(data.as_slice(), payload);
    assert!(rig
        .bench
        .log_lines
        .iter()
        .any(|line| line.contains("received successfully") && line.contains("MTMSN: 7")));

    assert_eq!(rig.session.state(), SessionState::Busy);
    assert_eq!(rig.drain_wire(), b"AT+CHUP\r");

    rig.feed(b"0\r");
    rig.tick();
    assert!(rig
        .bench
        .log_lines
        .iter()
        .any(|line| line.contains("hung up call")));
}

#[test]
fn sentinel_message_runs_the_remote_command_without_a_file() {
    let mut rig = Rig::new();
    rig.boot_to_idle();
    rig.settle_idle();

    rig.bench.advance_secs(11);
    rig.tick(); // gateway poll
    rig.drain_wire();
    rig.feed(b"+SBDSX: 0, 42, 1, 8, 0, 1\r\n0\r");
    rig.tick();
    rig.tick(); // read dispatched
    rig.drain_wire();

    let mut payload = [0u8; 12];
    payload[2..4].copy_from_slice(&mt::MT_POWER_CYCLE_CIS.to_be_bytes());
    payload[4..8].copy_from_slice(&0x6655_4433u32.to_be_bytes());
    let frame = mt_frame(&payload);
    rig.feed(&frame);
    rig.tick();

    assert!(rig.bench.files.is_empty());
    assert_eq!(
        rig.bench.remote_commands.as_slice(),
        &[(
            sbd_core::platform::RemoteCommand::PowerCycleCis,
            0x6655_4433
        )]
    );
}
