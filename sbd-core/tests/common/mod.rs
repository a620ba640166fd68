//! Shared rig for the end-to-end scenarios: a virtual clock, a recording
//! card store, and a scripted modem endpoint on the far side of the wire.
#![allow(dead_code)]

use core::ops::Add;
use core::time::Duration;

use sbd_core::at::AtDriver;
use sbd_core::platform::{
    DeviceDir, PathName, Platform, RemoteCommand, Store, StoreError, SubDir,
};
use sbd_core::session::{Session, SessionState};

/// Millisecond virtual clock instant.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Instant(pub u64);

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.as_millis() as u64)
    }
}

/// Recording platform/store double.
pub struct Bench {
    pub now_ms: u64,
    pub wallclock: u32,
    pub modem_on: bool,
    pub cis_on: bool,
    pub imei_mirror: String,
    pub outbox: Vec<(String, Vec<u8>)>,
    pub files: Vec<(String, Vec<u8>)>,
    pub log_lines: Vec<String>,
    pub syslog: Vec<String>,
    pub hardware_errors: u32,
    pub remote_commands: Vec<(RemoteCommand, u32)>,
    pub deleted: Vec<String>,
    pub marked_sent: Vec<String>,
    pub marked_error: Vec<String>,
    pub copied: Vec<String>,
    pub modem_power_cycles: u32,
    pub cis_power_cycles: u32,
    pub cis_image: Vec<Vec<u8>>,
    pub cis_image_index: usize,
    pub cis_capture: Vec<u8>,
    pub cis_capture_commits: u32,
    pub cis_invalidated: bool,
    file_seq: u32,
}

impl Bench {
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            wallclock: 1_000_000,
            modem_on: false,
            cis_on: true,
            imei_mirror: String::from("000000000000000"),
            outbox: Vec::new(),
            files: Vec::new(),
            log_lines: Vec::new(),
            syslog: Vec::new(),
            hardware_errors: 0,
            remote_commands: Vec::new(),
            deleted: Vec::new(),
            marked_sent: Vec::new(),
            marked_error: Vec::new(),
            copied: Vec::new(),
            modem_power_cycles: 0,
            cis_power_cycles: 0,
            cis_image: Vec::new(),
            cis_image_index: 0,
            cis_capture: Vec::new(),
            cis_capture_commits: 0,
            cis_invalidated: false,
            file_seq: 0,
        }
    }

    pub fn advance_secs(&mut self, secs: u64) {
        self.now_ms += secs * 1000;
        self.wallclock += secs as u32;
    }

    pub fn add_outbox_file(&mut self, name: &str, data: &[u8]) {
        self.outbox.push((String::from(name), data.to_vec()));
        self.outbox.sort_by(|a, b| a.0.cmp(&b.0));
    }

    fn dir_name(dir: DeviceDir) -> &'static str {
        match dir {
            DeviceDir::Root => "root",
            DeviceDir::Modem => "modem",
            DeviceDir::Rs422Port2 => "port2",
            DeviceDir::Rs422Port3 => "port3",
            DeviceDir::Ela => "ela",
            DeviceDir::Compress => "compress",
            DeviceDir::Decompress => "decompress",
            DeviceDir::Firmware => "firmware",
            DeviceDir::System => "system",
        }
    }

    fn sub_name(sub: SubDir) -> &'static str {
        match sub {
            SubDir::None => "",
            SubDir::Inbox => "inbox",
            SubDir::Outbox => "outbox",
            SubDir::Error => "error",
            SubDir::Working => "working",
            SubDir::Sent => "sent",
            SubDir::FdrLogs => "fdrlogs",
        }
    }
}

impl Platform for Bench {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant(self.now_ms)
    }

    fn timestamp(&self) -> u32 {
        self.wallclock
    }

    fn startup_timestamp(&self) -> u32 {
        999_000
    }

    fn timestamp_str(&self, out: &mut heapless::String<24>) {
        use core::fmt::Write as _;
        let _ = write!(out, "T{}", self.wallclock);
    }

    fn modem_running(&self) -> bool {
        self.modem_on
    }

    fn cis_powered(&self) -> bool {
        self.cis_on
    }

    fn power_cycle_modem(&mut self) -> bool {
        self.modem_power_cycles += 1;
        true
    }

    fn power_cycle_cis(&mut self) -> bool {
        self.cis_power_cycles += 1;
        true
    }

    fn imei_mirror(&self) -> heapless::String<15> {
        let mut out = heapless::String::new();
        let _ = out.push_str(&self.imei_mirror);
        out
    }

    fn store_imei_mirror(&mut self, imei: &str) {
        self.imei_mirror = String::from(imei);
    }

    fn invalidate_cis_config(&mut self) {
        self.cis_invalidated = true;
    }

    fn system_log(&mut self, message: &str) {
        self.syslog.push(String::from(message));
    }

    fn hardware_error(&mut self) {
        self.hardware_errors += 1;
    }

    fn system_status_report(&mut self, out: &mut [u8]) -> usize {
        let report = b"CARD MISSING";
        let len = report.len().min(out.len());
        out[..len].copy_from_slice(&report[..len]);
        len
    }

    fn remote_command(&mut self, command: RemoteCommand, requested_at: u32) {
        self.remote_commands.push((command, requested_at));
    }
}

impl Store for Bench {
    fn create(
        &mut self,
        dir: DeviceDir,
        sub: SubDir,
        msg_type: u16,
        data: &[u8],
    ) -> Result<PathName, StoreError> {
        self.file_seq += 1;
        let name = format!(
            "{}/{}/mt{:04x}_{:03}.bin",
            Self::dir_name(dir),
            Self::sub_name(sub),
            msg_type,
            self.file_seq
        );
        self.files.push((name.clone(), data.to_vec()));

        let mut path = PathName::new();
        let _ = path.push_str(&name);
        Ok(path)
    }

    fn append_modem_log(&mut self, line: &str) -> Result<(), StoreError> {
        self.log_lines.push(String::from(line));
        Ok(())
    }

    fn next_outbox_file(&mut self) -> Option<PathName> {
        let name = &self.outbox.first()?.0;
        let mut path = PathName::new();
        let _ = path.push_str(name);
        Some(path)
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<(usize, usize), StoreError> {
        let data = self
            .outbox
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, data)| data)
            .ok_or(StoreError::Open)?;

        let copied = data.len().min(buf.len());
        buf[..copied].copy_from_slice(&data[..copied]);
        Ok((copied, data.len()))
    }

    fn delete(&mut self, path: &str) -> bool {
        self.outbox.retain(|(name, _)| name != path);
        self.deleted.push(String::from(path));
        true
    }

    fn mark_sent(&mut self, path: &str) -> bool {
        self.outbox.retain(|(name, _)| name != path);
        self.marked_sent.push(String::from(path));
        true
    }

    fn mark_error(&mut self, path: &str) -> bool {
        self.outbox.retain(|(name, _)| name != path);
        self.marked_error.push(String::from(path));
        true
    }

    fn copy_to_port3(&mut self, path: &str, _sub: SubDir) -> bool {
        self.copied.push(String::from(path));
        true
    }

    fn next_cis_line(&mut self) -> Option<&[u8]> {
        let line = self.cis_image.get(self.cis_image_index)?;
        self.cis_image_index += 1;
        Some(line)
    }

    fn rewind_cis_image(&mut self) {
        self.cis_image_index = 0;
    }

    fn cis_capture_push(&mut self, byte: u8) {
        self.cis_capture.push(byte);
    }

    fn cis_capture_commit(&mut self) {
        self.cis_capture_commits += 1;
    }
}

/// Driver, session, and bench wired together.
pub struct Rig {
    pub bench: Bench,
    pub modem: AtDriver<Instant>,
    pub session: Session<Instant>,
}

impl Rig {
    pub fn new() -> Self {
        let mut rig = Self {
            bench: Bench::new(),
            modem: AtDriver::new(),
            session: Session::new(),
        };
        rig.session.init(&mut rig.modem).unwrap();
        rig
    }

    pub fn tick(&mut self) {
        self.session.tick(&mut self.modem, &mut self.bench);
    }

    /// Injects bytes as the UART interrupt would.
    pub fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.modem.port_mut().isr_rx_push(*byte);
        }
    }

    /// Drains everything the driver queued for the wire.
    pub fn drain_wire(&mut self) -> Vec<u8> {
        let mut wire = Vec::new();
        while let Some(byte) = self.modem.port_mut().isr_tx_pop() {
            wire.push(byte);
        }
        wire
    }

    /// Runs the power-up script against scripted modem responses, landing
    /// the session in idle.
    pub fn boot_to_idle(&mut self) {
        self.bench.modem_on = true;
        self.tick();
        self.tick(); // IMEI query sent
        self.feed(b"300234010000000\r\n");
        self.tick();
        self.feed(b"0\r");
        self.tick(); // MT-alert config sent
        self.feed(b"0\r");
        self.tick();
        self.tick(); // auto-register sent
        self.feed(b"0\r");
        self.tick();
        self.tick(); // first session initiate sent
        self.feed(b"+SBDIX: 0, 0, 0, -1, 0, 0\r\n0\r");
        self.tick();
        self.tick(); // revision query sent
        self.feed(b"Call Processor Version: IS020C00\r\n");
        // The modem pads the revision response out to ~145 bytes.
        let filler = [b' '; 113];
        self.feed(&filler);
        self.tick();
        assert_eq!(self.session.state(), SessionState::Idle);
        self.drain_wire();
    }

    /// Answers the CIS resynchronisation queries and the immediate first
    /// signal poll that follow initialisation.
    pub fn settle_idle(&mut self) {
        for response in [
            b"CMD:set ringer\rRinger(s) On\r".as_slice(),
            b"CMD:set relay 0\rRelay[0] On\r".as_slice(),
            b"CMD:set relay 1\rRelay[1] Off\r".as_slice(),
        ] {
            self.tick();
            self.feed(response);
            self.tick();
            assert_eq!(self.session.state(), SessionState::Idle);
        }

        self.tick(); // first signal poll
        self.feed(b"+CSQF:5\r\n0\r");
        self.tick();
        self.tick();
        assert_eq!(self.session.state(), SessionState::Idle);
        self.drain_wire();
    }
}
