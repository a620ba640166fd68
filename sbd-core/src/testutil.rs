//! Shared test double for the platform and store seams.

use core::ops::Add;
use core::time::Duration;

use std::string::String as StdString;
use std::vec::Vec as StdVec;

use heapless::String;

use crate::platform::{
    DeviceDir, PathName, Platform, RemoteCommand, Store, StoreError, SubDir,
};

/// Millisecond virtual clock instant.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct TestInstant(pub u64);

impl Add<Duration> for TestInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.as_millis() as u64)
    }
}

/// Recording platform/store double with a virtual clock.
pub struct TestBench {
    pub now_ms: u64,
    pub wallclock: u32,
    pub boot_time: u32,
    pub modem_on: bool,
    pub cis_on: bool,
    pub imei_mirror: StdString,
    pub outbox: StdVec<(StdString, StdVec<u8>)>,
    pub files: StdVec<(StdString, StdVec<u8>)>,
    pub log_lines: StdVec<StdString>,
    pub syslog: StdVec<StdString>,
    pub hardware_errors: u32,
    pub remote_commands: StdVec<(RemoteCommand, u32)>,
    pub deleted: StdVec<StdString>,
    pub marked_sent: StdVec<StdString>,
    pub marked_error: StdVec<StdString>,
    pub copied: StdVec<StdString>,
    pub modem_power_cycles: u32,
    pub cis_power_cycles: u32,
    pub cis_power_cycle_ok: bool,
    pub cis_invalidated: bool,
    pub cis_image: StdVec<StdVec<u8>>,
    pub cis_image_index: usize,
    pub cis_rewinds: u32,
    pub cis_capture: StdVec<u8>,
    pub cis_capture_commits: u32,
    pub fail_mark_sent: bool,
    pub fail_mark_error: bool,
    pub fail_delete: bool,
    pub fail_create: bool,
    file_seq: u32,
}

impl TestBench {
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            wallclock: 1_000_000,
            boot_time: 999_000,
            modem_on: false,
            cis_on: true,
            imei_mirror: StdString::from("000000000000000"),
            outbox: StdVec::new(),
            files: StdVec::new(),
            log_lines: StdVec::new(),
            syslog: StdVec::new(),
            hardware_errors: 0,
            remote_commands: StdVec::new(),
            deleted: StdVec::new(),
            marked_sent: StdVec::new(),
            marked_error: StdVec::new(),
            copied: StdVec::new(),
            modem_power_cycles: 0,
            cis_power_cycles: 0,
            cis_power_cycle_ok: true,
            cis_invalidated: false,
            cis_image: StdVec::new(),
            cis_image_index: 0,
            cis_rewinds: 0,
            cis_capture: StdVec::new(),
            cis_capture_commits: 0,
            fail_mark_sent: false,
            fail_mark_error: false,
            fail_delete: false,
            fail_create: false,
            file_seq: 0,
        }
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.now_ms += ms;
        self.wallclock += (ms / 1000) as u32;
    }

    pub fn advance_secs(&mut self, secs: u64) {
        self.advance_ms(secs * 1000);
    }

    pub fn add_outbox_file(&mut self, name: &str, data: &[u8]) {
        self.outbox.push((StdString::from(name), data.to_vec()));
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

impl Platform for TestBench {
    type Instant = TestInstant;

    fn now(&self) -> TestInstant {
        TestInstant(self.now_ms)
    }

    fn timestamp(&self) -> u32 {
        self.wallclock
    }

    fn startup_timestamp(&self) -> u32 {
        self.boot_time
    }

    fn timestamp_str(&self, out: &mut String<24>) {
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
        self.cis_power_cycle_ok
    }

    fn imei_mirror(&self) -> String<15> {
        let mut out = String::new();
        let _ = out.push_str(&self.imei_mirror);
        out
    }

    fn store_imei_mirror(&mut self, imei: &str) {
        self.imei_mirror = StdString::from(imei);
    }

    fn invalidate_cis_config(&mut self) {
        self.cis_invalidated = true;
    }

    fn system_log(&mut self, message: &str) {
        self.syslog.push(StdString::from(message));
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

impl Store for TestBench {
    fn create(
        &mut self,
        dir: DeviceDir,
        sub: SubDir,
        msg_type: u16,
        data: &[u8],
    ) -> Result<PathName, StoreError> {
        if self.fail_create {
            return Err(StoreError::Open);
        }

        self.file_seq += 1;
        let name = std::format!(
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
        self.log_lines.push(StdString::from(line));
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
        if self.fail_delete {
            return false;
        }
        self.outbox.retain(|(name, _)| name != path);
        self.deleted.push(StdString::from(path));
        true
    }

    fn mark_sent(&mut self, path: &str) -> bool {
        if self.fail_mark_sent {
            return false;
        }
        self.outbox.retain(|(name, _)| name != path);
        self.marked_sent.push(StdString::from(path));
        true
    }

    fn mark_error(&mut self, path: &str) -> bool {
        if self.fail_mark_error {
            return false;
        }
        self.outbox.retain(|(name, _)| name != path);
        self.marked_error.push(StdString::from(path));
        true
    }

    fn copy_to_port3(&mut self, path: &str, _sub: SubDir) -> bool {
        self.copied.push(StdString::from(path));
        true
    }

    fn next_cis_line(&mut self) -> Option<&[u8]> {
        let line = self.cis_image.get(self.cis_image_index)?;
        self.cis_image_index += 1;
        Some(line)
    }

    fn rewind_cis_image(&mut self) {
        self.cis_image_index = 0;
        self.cis_rewinds += 1;
    }

    fn cis_capture_push(&mut self, byte: u8) {
        self.cis_capture.push(byte);
    }

    fn cis_capture_commit(&mut self) {
        self.cis_capture_commits += 1;
    }
}
