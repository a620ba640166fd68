//! Terminal status log: rolling text file plus a deduplicated in-memory
//! summary that can be packaged into a binary snapshot on gateway request.
//!
//! Every text append opens, writes, and closes the file, so a power cut
//! costs at most the event in flight. The summary ring keeps the last
//! [`SUMMARY_SLOTS`] distinct event kinds with a repeat count each; a
//! repeated kind refreshes its slot instead of consuming a new one.

use core::fmt::Write as _;

use crc::{Crc, CRC_16_ARC};
use heapless::{String, Vec};

use crate::at::mt::MT_MODEM_LOG_SNAPSHOT;
use crate::at::ErrorKind;
use crate::platform::{DeviceDir, PathName, Platform, Store, StoreError, SubDir};
use crate::serial::SharedRing;

/// Distinct event kinds retained in the summary ring.
pub const SUMMARY_SLOTS: usize = 15;

/// Longest composed log line.
pub const MAX_LOG_LINE: usize = 192;

/// Capacity of the interrupt-side deferred event ring.
pub const DEFERRED_EVENTS: usize = 32;

/// Filename column used for events that concern no particular report.
pub const NO_REPORT: &str = "";

/// Binary snapshot size: header, summary slots, start-of-day stamp.
pub const SNAPSHOT_LEN: usize = 10 + SUMMARY_SLOTS * 6 + 4;

const SNAPSHOT_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Terminal status events recorded in the modem log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    ModemPowered,
    ModemPoweredDown,
    SendSuccessful,
    SendEnabled,
    SendFailure,
    SendDisabled,
    Send,
    RetrySend,
    Receive,
    ReceiveSuccessful,
    ReceiveFailure,
    UnexpectedResponse,
    MoveFailure,
    DeleteFailure,
    CopySuccess,
    CopyFailure,
    MailboxCheckSuccess,
    MailboxCheckFailure,
    SignalStrengthFailure,
    HangupSuccess,
    HangupFailure,
    PhoneOffHook,
    PhoneBackOnHook,
    IncomingCall,
    IncomingCallComplete,
}

impl EventKind {
    /// Phrase appended after the filename column.
    pub fn phrase(self) -> &'static str {
        match self {
            EventKind::ModemPowered => " modem is powered up",
            EventKind::ModemPoweredDown => " modem is powered down",
            EventKind::SendSuccessful => " file sent successfully",
            EventKind::SendEnabled => " transmission enabled",
            EventKind::SendFailure => " failed to send file",
            EventKind::SendDisabled => " transmission disabled!",
            EventKind::Send => " start sending report",
            EventKind::RetrySend => " resending file",
            EventKind::Receive => " start receiving file",
            EventKind::ReceiveSuccessful => " received successfully",
            EventKind::ReceiveFailure => " failed to receive file",
            EventKind::UnexpectedResponse => " unexpected response from modem",
            EventKind::MoveFailure => " could not move file",
            EventKind::DeleteFailure => " could not delete file",
            EventKind::CopySuccess => " copied for second port",
            EventKind::CopyFailure => " copy for second port failed",
            EventKind::MailboxCheckSuccess => " mailbox check complete",
            EventKind::MailboxCheckFailure => " mailbox check failed",
            EventKind::SignalStrengthFailure => " signal strength check failed",
            EventKind::HangupSuccess => " hung up call",
            EventKind::HangupFailure => " could not hang up call",
            EventKind::PhoneOffHook => " phone off hook",
            EventKind::PhoneBackOnHook => " phone back on hook",
            EventKind::IncomingCall => " incoming call",
            EventKind::IncomingCallComplete => " incoming call complete",
        }
    }

    fn code(self) -> u8 {
        self as u8
    }
}

/// Ring the UART/timer interrupts publish events through; drained by the
/// main loop one entry per pass.
pub type DeferredEventQueue = SharedRing<EventKind, DEFERRED_EVENTS>;

/// Per-line context the conversation layer supplies: cached signal strength
/// and the sequence numbers appended to successful send/receive lines.
#[derive(Copy, Clone, Debug)]
pub struct LogContext<'a> {
    pub signal: i8,
    pub momsn: &'a str,
    pub mtmsn: &'a str,
}

impl Default for LogContext<'_> {
    fn default() -> Self {
        Self {
            signal: -1,
            momsn: "",
            mtmsn: "",
        }
    }
}

/// One deduplicated summary entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SummaryEntry {
    pub timestamp: u32,
    pub kind: EventKind,
    pub repeats: u8,
}

/// The modem event log.
pub struct EventLog {
    slots: [Option<SummaryEntry>; SUMMARY_SLOTS],
    newest: usize,
}

impl EventLog {
    /// Creates an empty log.
    pub const fn new() -> Self {
        Self {
            slots: [None; SUMMARY_SLOTS],
            newest: 0,
        }
    }

    /// Records `kind` for `file` and appends the composed line.
    ///
    /// The summary ring is updated even when the card refuses the write;
    /// the in-memory view must survive a missing card.
    pub fn append<P: Platform + Store>(
        &mut self,
        p: &mut P,
        ctx: &LogContext<'_>,
        file: &str,
        kind: EventKind,
        sub_error: Option<ErrorKind>,
    ) {
        self.summarise(kind, p.timestamp());

        let mut line: String<MAX_LOG_LINE> = String::new();
        let mut stamp: String<24> = String::new();
        p.timestamp_str(&mut stamp);

        let _ = write!(line, "{} ({}): {}{}", stamp, ctx.signal, file, kind.phrase());
        if let Some(error) = sub_error {
            let _ = line.push_str(error.phrase());
        }
        match kind {
            EventKind::SendSuccessful => {
                let _ = write!(line, " MOMSN: {}", ctx.momsn);
            }
            EventKind::ReceiveSuccessful => {
                let _ = write!(line, " MTMSN: {}", ctx.mtmsn);
            }
            _ => {}
        }
        let _ = line.push_str("\r\n");

        let _ = p.append_modem_log(&line);
    }

    /// Reports one deferred interrupt-published event, if any is queued.
    pub fn drain_deferred<P: Platform + Store>(
        &mut self,
        queue: &DeferredEventQueue,
        p: &mut P,
        ctx: &LogContext<'_>,
    ) {
        if let Some(kind) = queue.pop() {
            self.append(p, ctx, NO_REPORT, kind, None);
        }
    }

    /// Iterates the summary ring, unspecified order.
    pub fn entries(&self) -> impl Iterator<Item = &SummaryEntry> {
        self.slots.iter().flatten()
    }

    /// Most recently touched summary entry.
    pub fn latest(&self) -> Option<&SummaryEntry> {
        self.slots[self.newest].as_ref()
    }

    /// Builds the binary snapshot, saves it into the modem outbox for
    /// transmission, and returns its path.
    ///
    /// Layout: message type, length, request time, CRC, the summary slots
    /// (timestamp, kind, repeat count each), start-of-day stamp. The CRC
    /// covers every byte after the CRC field.
    pub fn generate_log_message<P: Platform + Store>(
        &self,
        p: &mut P,
        requested_at: u32,
    ) -> Result<PathName, StoreError> {
        let mut data: Vec<u8, SNAPSHOT_LEN> = Vec::new();

        let _ = data.extend_from_slice(&MT_MODEM_LOG_SNAPSHOT.to_be_bytes());
        let _ = data.extend_from_slice(&(SNAPSHOT_LEN as u16).to_be_bytes());
        let _ = data.extend_from_slice(&requested_at.to_be_bytes());
        let _ = data.extend_from_slice(&[0, 0]); // CRC patched below

        for slot in &self.slots {
            match slot {
                Some(entry) => {
                    let _ = data.extend_from_slice(&entry.timestamp.to_be_bytes());
                    let _ = data.push(entry.kind.code());
                    let _ = data.push(entry.repeats);
                }
                None => {
                    let _ = data.extend_from_slice(&[0; 6]);
                }
            }
        }
        let _ = data.extend_from_slice(&p.startup_timestamp().to_be_bytes());

        let crc = SNAPSHOT_CRC.checksum(&data[10..]);
        data[8..10].copy_from_slice(&crc.to_be_bytes());

        p.create(DeviceDir::Modem, SubDir::Outbox, MT_MODEM_LOG_SNAPSHOT, &data)
    }

    fn summarise(&mut self, kind: EventKind, timestamp: u32) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot {
                if entry.kind == kind {
                    entry.repeats = entry.repeats.saturating_add(1);
                    entry.timestamp = timestamp;
                    self.newest = index;
                    return;
                }
            }
        }

        self.newest = (self.newest + 1) % SUMMARY_SLOTS;
        self.slots[self.newest] = Some(SummaryEntry {
            timestamp,
            kind,
            repeats: 1,
        });
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
