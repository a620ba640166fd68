//! Interactive emulator session: a virtual-clock platform, a scripted
//! Iridium/CIS endpoint on the far side of the wire, and a live driver
//! instance in between.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::ops::Add;
use std::path::PathBuf;
use std::time::Duration;

use sbd_core::at::{mt, AtDriver};
use sbd_core::platform::{
    DeviceDir, PathName, Platform, RemoteCommand, Store, StoreError, SubDir,
};
use sbd_core::session::{Session as TerminalSession, SessionState};

/// Milliseconds of virtual time per emulator step.
const STEP_MS: u64 = 100;

/// Upper bound on steps per `run`, a little over twenty virtual minutes.
const MAX_STEPS: usize = 12_500;

/// Scenario replayed by the scripted modem endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    /// Power-up, registration, and one clean report delivery.
    ColdBoot,
    /// A mobile-terminated message announced by the gateway and read out.
    MtReceive,
    /// The report session drops on RF once before going through.
    RfDrop,
}

impl TranscriptProfile {
    pub fn from_tag(tag: &str) -> Result<Self, String> {
        match tag {
            "cold-boot" => Ok(Self::ColdBoot),
            "mt-receive" => Ok(Self::MtReceive),
            "rf-drop" => Ok(Self::RfDrop),
            other => Err(format!("Unknown profile `{other}`.")),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::ColdBoot => "cold-boot",
            Self::MtReceive => "mt-receive",
            Self::RfDrop => "rf-drop",
        }
    }
}

/// Virtual monotonic instant, in milliseconds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct HostInstant(u64);

impl Add<Duration> for HostInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.as_millis() as u64)
    }
}

/// In-memory platform/store double with a virtual clock.
struct HostBench {
    now_ms: u64,
    wallclock: u32,
    modem_on: bool,
    imei_mirror: String,
    outbox: Vec<(String, Vec<u8>)>,
    files: Vec<(String, Vec<u8>)>,
    log_lines: Vec<String>,
    syslog: Vec<String>,
    remote_commands: Vec<(RemoteCommand, u32)>,
    deleted: Vec<String>,
    file_seq: u32,
}

impl HostBench {
    fn new() -> Self {
        Self {
            now_ms: 0,
            wallclock: 1_700_000_000,
            modem_on: false,
            imei_mirror: String::from("000000000000000"),
            outbox: Vec::new(),
            files: Vec::new(),
            log_lines: Vec::new(),
            syslog: Vec::new(),
            remote_commands: Vec::new(),
            deleted: Vec::new(),
            file_seq: 0,
        }
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

impl Platform for HostBench {
    type Instant = HostInstant;

    fn now(&self) -> HostInstant {
        HostInstant(self.now_ms)
    }

    fn timestamp(&self) -> u32 {
        self.wallclock + (self.now_ms / 1000) as u32
    }

    fn startup_timestamp(&self) -> u32 {
        self.wallclock
    }

    fn timestamp_str(&self, out: &mut heapless::String<24>) {
        use core::fmt::Write as _;
        let _ = write!(out, "{}", self.timestamp());
    }

    fn modem_running(&self) -> bool {
        self.modem_on
    }

    fn cis_powered(&self) -> bool {
        true
    }

    fn power_cycle_modem(&mut self) -> bool {
        true
    }

    fn power_cycle_cis(&mut self) -> bool {
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

    fn invalidate_cis_config(&mut self) {}

    fn system_log(&mut self, message: &str) {
        self.syslog.push(String::from(message));
    }

    fn hardware_error(&mut self) {
        self.syslog.push(String::from("hardware error"));
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

impl Store for HostBench {
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
        self.log_lines.push(line.trim_end().to_string());
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
        true
    }

    fn mark_error(&mut self, path: &str) -> bool {
        self.outbox.retain(|(name, _)| name != path);
        true
    }

    fn copy_to_port3(&mut self, _path: &str, _sub: SubDir) -> bool {
        true
    }

    fn next_cis_line(&mut self) -> Option<&[u8]> {
        None
    }

    fn rewind_cis_image(&mut self) {}

    fn cis_capture_push(&mut self, _byte: u8) {}

    fn cis_capture_commit(&mut self) {}
}

/// The far side of the wire: answers AT and CIS traffic per profile.
struct ModemEndpoint {
    profile: TranscriptProfile,
    pending: Vec<u8>,
    awaiting_payload: Option<usize>,
    sessions_served: u32,
    mt_announced: bool,
    mt_read: bool,
    momsn: u32,
}

impl ModemEndpoint {
    fn new(profile: TranscriptProfile) -> Self {
        Self {
            profile,
            pending: Vec::new(),
            awaiting_payload: None,
            sessions_served: 0,
            mt_announced: false,
            mt_read: false,
            momsn: 41,
        }
    }

    /// Feeds one host byte; returns a response once a command completes.
    fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.pending.push(byte);

        if let Some(expected) = self.awaiting_payload {
            if self.pending.len() >= expected + 2 {
                let payload = &self.pending[..expected];
                let wire_sum = u16::from_be_bytes([self.pending[expected], self.pending[expected + 1]]);
                let ok = wire_sum == mt::additive_checksum(payload);
                self.pending.clear();
                self.awaiting_payload = None;
                return Some(if ok { b"0\r".to_vec() } else { b"2\r".to_vec() });
            }
            return None;
        }

        if byte != b'\r' && byte != b'\n' {
            return None;
        }

        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if line.is_empty() {
            return None;
        }
        Some(self.respond(&line))
    }

    fn respond(&mut self, line: &str) -> Vec<u8> {
        if let Some(length) = line.strip_prefix("AT+SBDWB=") {
            self.awaiting_payload = length.trim().parse::<usize>().ok();
            return b"READY\r\n".to_vec();
        }

        match line {
            "AT+CGSN" => b"300234011234560\r\n0\r".to_vec(),
            "AT+SBDMTA=0" | "AT+SBDAREG=1" | "AT+SBDD0" | "AT+CHUP" => b"0\r".to_vec(),
            "AT+CSQF" => b"+CSQF:4\r\n0\r".to_vec(),
            "AT+CREG?" => b"+CREG:000,001\r\n0\r".to_vec(),
            "AT+CGMR" => {
                let mut response = b"Call Processor Version: IS020C00\r\n".to_vec();
                response.resize(145, b' ');
                response
            }
            "AT+CLCC" => b"+CLCC:006\r\n0\r".to_vec(),
            "AT+SBDSX" => {
                if self.profile == TranscriptProfile::MtReceive && !self.mt_announced {
                    self.mt_announced = true;
                    b"+SBDSX: 0, 41, 1, 7, 0, 1\r\n0\r".to_vec()
                } else {
                    b"+SBDSX: 0, 41, 0, -1, 0, 0\r\n".to_vec()
                }
            }
            "AT+SBDRB" => {
                self.mt_read = true;
                let mut payload = [0u8; 16];
                payload[2..4].copy_from_slice(&0x0025u16.to_be_bytes());
                payload[4..].fill(0x5A);
                let mut frame: heapless::Vec<u8, { mt::MAX_MT_FRAME + 1 }> = heapless::Vec::new();
                mt::encode_frame(&payload, &mut frame).unwrap();
                frame.to_vec()
            }
            "AT+SBDIX" | "AT+SBDIXA" => {
                self.sessions_served += 1;
                // The second session carries the report; in the RF-drop
                // profile the satellite link gives way exactly there.
                if self.profile == TranscriptProfile::RfDrop && self.sessions_served == 2 {
                    return b"+SBDIX: 18, 0, 0, -1, 0, 0\r\n0\r".to_vec();
                }
                self.momsn += 1;
                format!("+SBDIX: 1, {}, 0, -1, 0, 0\r\n0\r", self.momsn).into_bytes()
            }
            "set ringer" => b"CMD:set ringer\rRinger(s) On\r".to_vec(),
            "set relay 0" => b"CMD:set relay 0\rRelay[0] On\r".to_vec(),
            "set relay 1" => b"CMD:set relay 1\rRelay[1] Off\r".to_vec(),
            "~" => b"20400000 1B010000\r".to_vec(),
            "reset" | "reload flash" | "download config" => {
                format!("CMD:{line}\r").into_bytes()
            }
            other if other.starts_with("set ringer ") || other.starts_with("set relay ") => {
                format!("CMD:{other}\r").into_bytes()
            }
            _ => b"4\r".to_vec(),
        }
    }
}

/// Direction tags used in transcript lines.
enum TranscriptRole {
    Host,
    Modem,
}

impl TranscriptRole {
    fn tag(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "host ",
            TranscriptRole::Modem => "modem",
        }
    }
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let dir = PathBuf::from("transcripts");
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(dir.join(format!("{}.log", profile.tag())))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, elapsed_ms: u64, role: TranscriptRole, text: &str) -> io::Result<()> {
        writeln!(self.writer, "[{elapsed_ms:>8}ms] {} {text}", role.tag())?;
        self.writer.flush()
    }
}

fn printable(bytes: &[u8]) -> String {
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ' || *b == b'\r' || *b == b'\n') {
        String::from_utf8_lossy(bytes)
            .replace('\r', "<CR>")
            .replace('\n', "<LF>")
    } else {
        format!("<{} binary bytes>", bytes.len())
    }
}

/// One interactive emulator session.
pub struct Session {
    profile: TranscriptProfile,
    bench: HostBench,
    modem: AtDriver<HostInstant>,
    terminal: TerminalSession<HostInstant>,
    endpoint: ModemEndpoint,
    transcript: TranscriptLogger,
}

impl Session {
    pub fn new(profile: TranscriptProfile) -> io::Result<Self> {
        let mut bench = HostBench::new();
        if matches!(profile, TranscriptProfile::ColdBoot | TranscriptProfile::RfDrop) {
            bench
                .outbox
                .push((String::from("modem/outbox/A0001.rpt"), b"emulated summary report".to_vec()));
        }

        let mut modem = AtDriver::new();
        let mut terminal = TerminalSession::new();
        terminal
            .init(&mut modem)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, format!("{err:?}")))?;

        Ok(Self {
            profile,
            bench,
            modem,
            terminal,
            endpoint: ModemEndpoint::new(profile),
            transcript: TranscriptLogger::new(profile)?,
        })
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        match line {
            "run" => self.run(),
            "status" => Ok(self.status()),
            "log" => Ok(self.bench.log_lines.clone()),
            "help" => Ok(vec![
                "run    - replay the selected profile to completion".to_string(),
                "status - show driver and session state".to_string(),
                "log    - print the modem log lines recorded so far".to_string(),
                "exit   - leave the emulator".to_string(),
            ]),
            other => Ok(vec![format!("Unknown command `{other}`; try `help`.")]),
        }
    }

    fn status(&self) -> Vec<String> {
        vec![
            format!("profile:  {}", self.profile.tag()),
            format!("session:  {:?}", self.terminal.state()),
            format!("driver:   {:?}", self.modem.state()),
            format!("imei:     {}", self.modem.imei()),
            format!("version:  {}", self.modem.sw_version()),
            format!("signal:   {}", self.modem.signal_strength()),
            format!("momsn:    {}", self.modem.momsn()),
            format!("outbox:   {} file(s)", self.bench.outbox.len()),
            format!("received: {} file(s)", self.bench.files.len()),
        ]
    }

    fn run(&mut self) -> io::Result<Vec<String>> {
        self.bench.modem_on = true;
        let mut summary = Vec::new();

        for _ in 0..MAX_STEPS {
            self.terminal.tick(&mut self.modem, &mut self.bench);
            self.pump_wire()?;
            self.bench.now_ms += STEP_MS;

            if self.finished() {
                break;
            }
        }

        summary.push(format!(
            "profile `{}` finished at t+{}ms",
            self.profile.tag(),
            self.bench.now_ms
        ));
        summary.extend(self.status());
        summary.push(String::from("--- modem log ---"));
        summary.extend(self.bench.log_lines.iter().cloned());
        Ok(summary)
    }

    fn pump_wire(&mut self) -> io::Result<()> {
        let mut emitted = Vec::new();
        while let Some(byte) = self.modem.port_mut().isr_tx_pop() {
            emitted.push(byte);
        }
        if emitted.is_empty() {
            return Ok(());
        }

        self.transcript
            .append(self.bench.now_ms, TranscriptRole::Host, &printable(&emitted))?;

        let mut responses = Vec::new();
        for byte in emitted {
            if let Some(response) = self.endpoint.push(byte) {
                responses.push(response);
            }
        }

        for response in responses {
            self.transcript.append(
                self.bench.now_ms,
                TranscriptRole::Modem,
                &printable(&response),
            )?;
            for byte in response {
                self.modem.port_mut().isr_rx_push(byte);
            }
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        if self.terminal.state() != SessionState::Idle {
            return false;
        }
        match self.profile {
            TranscriptProfile::ColdBoot | TranscriptProfile::RfDrop => {
                self.bench.outbox.is_empty()
            }
            TranscriptProfile::MtReceive => self.endpoint.mt_read && !self.bench.files.is_empty(),
        }
    }
}
