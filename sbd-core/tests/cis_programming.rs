//! CIS firmware upload: version gate, line-by-line reload, recovery, and
//! the output-state restore that follows.

mod common;

use common::Rig;
use sbd_core::session::{Op, OpResponse, SessionState};

#[test]
fn reload_flash_happy_path_restores_cached_outputs() {
    let mut rig = Rig::new();
    rig.bench.cis_image = vec![b"S0030000FC\r".to_vec(), b"S104000012E5\r".to_vec()];
    rig.boot_to_idle();
    rig.settle_idle();

    assert!(rig.session.program_cis(&mut rig.modem, &rig.bench));
    let wire = rig.drain_wire();
    assert!(wire.ends_with(b"~\r"));

    rig.feed(b"20400000 1B010000\r");
    rig.tick(); // version accepted, reload flash sent
    let wire = rig.drain_wire();
    assert!(wire.windows(12).any(|w| w == b"reload flash"));

    rig.feed(b"CMD:reload flash");
    rig.tick(); // echo accepted
    rig.tick(); // first image line sent
    assert_eq!(rig.drain_wire(), b"S0030000FC\r");

    rig.feed(b"a");
    rig.tick(); // block passed, next line
    rig.tick();
    assert_eq!(rig.drain_wire(), b"S104000012E5\r");

    rig.feed(b"aC");
    rig.tick(); // upload complete

    assert!(rig.session.is_cis_action_complete());
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert_eq!(rig.session.get_response(Op::ProgramCis), OpResponse::Success);
    assert_eq!(rig.bench.cis_power_cycles, 1);
    assert!(!rig.bench.cis_invalidated);

    // The cached ringer/relay states are queued for restore and dispatch
    // on the following idle passes.
    assert_eq!(rig.session.get_response(Op::RingerOn), OpResponse::Waiting);
    rig.tick();
    let wire = rig.drain_wire();
    assert!(wire.windows(12).any(|w| w == b"set ringer 0")); // reverse polarity: 0 is ON
}

#[test]
fn recoverable_upload_error_cancels_and_retries() {
    let mut rig = Rig::new();
    rig.bench.cis_image = vec![b"S0030000FC\r".to_vec()];
    rig.boot_to_idle();
    rig.settle_idle();

    assert!(rig.session.program_cis(&mut rig.modem, &rig.bench));
    rig.feed(b"20400000 1B010000\r");
    rig.tick();
    rig.feed(b"CMD:reload flash");
    rig.tick();
    rig.tick(); // line on the wire
    rig.drain_wire();

    rig.feed(b"F"); // bad format: cancel and restart from the top
    rig.tick();
    assert_eq!(rig.session.state(), SessionState::Busy);
    let wire = rig.drain_wire();
    assert!(wire.starts_with(b"c\r"));
    assert!(wire.windows(12).any(|w| w == b"reload flash"));

    rig.feed(b"CMD:reload flash");
    rig.tick();
    rig.tick();
    rig.feed(b"aC");
    rig.tick();
    assert_eq!(rig.session.get_response(Op::ProgramCis), OpResponse::Success);
}

#[test]
fn download_config_captures_the_image_on_the_long_timer() {
    let mut rig = Rig::new();
    rig.boot_to_idle();
    rig.settle_idle();

    assert!(rig.session.upload_cis_config(&mut rig.modem, &rig.bench));
    rig.feed(b"CMD:download config\r\n");
    rig.tick(); // echo accepted, capture begins

    // A 5 s stall must not abort: the bulk download runs on the
    // satellite-length timer.
    rig.bench.advance_secs(8);
    rig.tick();
    assert_eq!(rig.session.state(), SessionState::Busy);

    let chunk = [0x42u8; 256];
    for _ in 0..4 {
        rig.feed(&chunk);
        rig.tick();
    }

    assert!(rig.session.is_cis_action_complete());
    assert_eq!(rig.bench.cis_capture.len(), 1024);
    assert_eq!(rig.bench.cis_capture_commits, 1);
    assert_eq!(
        rig.session.get_response(Op::UploadCisConfig),
        OpResponse::Success
    );
}
