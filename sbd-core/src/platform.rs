//! Seams to the collaborators the driver does not own.
//!
//! The terminal core never touches hardware, the filesystem, or the clock
//! directly. Firmware and host targets implement [`Platform`] and [`Store`]
//! and hand them to the driver on every tick, so the same state machines run
//! against real flash-card storage or an in-memory test double.

use core::ops::Add;
use core::time::Duration;

use heapless::String;

/// Longest path the driver composes (device directory + subdirectory + name).
pub const MAX_PATH_LEN: usize = 64;

/// Path or file name handed back by the store.
pub type PathName = String<MAX_PATH_LEN>;

/// Monotonic instant bound shared by every deadline in the driver.
///
/// Mirrors the instant handling of the queue/scheduler traits: any copyable,
/// ordered timestamp that knows how to advance by a [`Duration`] will do, so
/// tests run on a plain counter while firmware supplies its tick type.
pub trait MonotonicInstant: Copy + Ord + Add<Duration, Output = Self> {}

impl<T> MonotonicInstant for T where T: Copy + Ord + Add<Duration, Output = T> {}

/// One-shot deadline handle over an externally supplied instant.
///
/// The timer service itself is outside the core; the driver only ever asks
/// "has this expired?" against the instant the caller passes in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Deadline<I> {
    armed_until: Option<I>,
}

impl<I: MonotonicInstant> Deadline<I> {
    /// Creates a deadline that is not armed.
    pub const fn idle() -> Self {
        Self { armed_until: None }
    }

    /// Arms the deadline `after` from `now`, replacing any previous arming.
    pub fn start(&mut self, now: I, after: Duration) {
        self.armed_until = Some(now + after);
    }

    /// Disarms the deadline.
    pub fn stop(&mut self) {
        self.armed_until = None;
    }

    /// Returns `true` while the deadline is armed and has passed.
    pub fn expired(&self, now: I) -> bool {
        matches!(self.armed_until, Some(deadline) if now >= deadline)
    }

    /// Returns `true` when the deadline is armed.
    pub fn is_armed(&self) -> bool {
        self.armed_until.is_some()
    }
}

impl<I: MonotonicInstant> Default for Deadline<I> {
    fn default() -> Self {
        Self::idle()
    }
}

/// Remote operations carried by mobile-terminated sentinel messages.
///
/// Each of these is executed by an external collaborator, which answers the
/// gateway with a command-acknowledge report of its own; none of them leaves
/// a saved file behind.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RemoteCommand {
    /// Full system reset once the in-flight work is flushed.
    ResetSystem,
    /// System reset without waiting for outstanding work.
    ResetSystemImmediate,
    /// Acknowledge a previously sent remote-operation acknowledgement.
    AckAck,
    /// Ship the current configuration image to the gateway.
    ConfigSnapshot,
    /// Power cycle the satellite modem.
    PowerCycleModem,
    /// Reformat the removable flash card.
    FormatCard,
    /// Power cycle the cabin-interface board.
    PowerCycleCis,
    /// Purge the in-memory rules image.
    PurgeRulesImage,
    /// Delete the rules file from the card.
    DeleteRulesFile,
    /// Pull the current configuration out of the cabin-interface board.
    DownloadCisConfig,
    /// Ship a system-log snapshot.
    SystemLogSnapshot,
    /// Ship a modem-log snapshot.
    ModemLogSnapshot,
    /// Ship the firmware version/serial report.
    VersionSnapshot,
    /// Ship the current GPS position report.
    GpsSnapshot,
    /// Reset the ARINC 573/717 acquisition bus.
    ResetDataBus,
    /// Begin transmitting recorder logs immediately.
    SendLogsNow { option: u16 },
    /// Transmit recorder logs once the recorder stops.
    SendLogsAfterRecorder { option: u16 },
}

/// Environment the driver runs in: clock, power signals, power manager,
/// EEPROM mirror, and the system log.
pub trait Platform {
    /// Monotonic timestamp used for every deadline.
    type Instant: MonotonicInstant;

    /// Current monotonic instant.
    fn now(&self) -> Self::Instant;

    /// Wall-clock seconds for log lines and snapshot headers.
    fn timestamp(&self) -> u32;

    /// Wall-clock seconds captured at power-up, for snapshot headers.
    fn startup_timestamp(&self) -> u32;

    /// Wall-clock rendered for the head of a modem-log line.
    fn timestamp_str(&self, out: &mut String<24>);

    /// `true` while the modem power-good signal is asserted.
    fn modem_running(&self) -> bool;

    /// `true` while the cabin-interface board has power.
    fn cis_powered(&self) -> bool;

    /// Requests a modem power cycle; `false` when the manager refuses.
    fn power_cycle_modem(&mut self) -> bool;

    /// Requests a CIS power cycle; `false` when unsupported.
    fn power_cycle_cis(&mut self) -> bool;

    /// Reads the EEPROM mirror of the modem serial number.
    fn imei_mirror(&self) -> String<15>;

    /// Rewrites the EEPROM mirror after the modem reported a different IMEI.
    fn store_imei_mirror(&mut self, imei: &str);

    /// Writes the invalidation marker over the CIS configuration bytes.
    fn invalidate_cis_config(&mut self);

    /// Appends one line to the system log.
    fn system_log(&mut self, message: &str);

    /// Records a system-level hardware error (SBD service blocked).
    fn hardware_error(&mut self);

    /// Fills `out` with the status report transmitted when the flash card
    /// is missing; returns the byte count, zero when unavailable.
    fn system_status_report(&mut self, out: &mut [u8]) -> usize;

    /// Executes a gateway-commanded operation and sends its acknowledgement.
    fn remote_command(&mut self, command: RemoteCommand, requested_at: u32);
}

/// Failures surfaced by the report store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// File could not be created or opened.
    Open,
    /// Short or failed read.
    Read,
    /// Short or failed write.
    Write,
}

/// Device directories on the removable card.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceDir {
    Root,
    Modem,
    Rs422Port2,
    Rs422Port3,
    Ela,
    Compress,
    Decompress,
    Firmware,
    System,
}

/// Subdirectories a device directory may carry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubDir {
    None,
    Inbox,
    Outbox,
    Error,
    Working,
    Sent,
    FdrLogs,
}

/// Removable-card report store.
///
/// Every call opens, acts, and closes; the card can disappear between any
/// two operations, so nothing here holds a handle.
pub trait Store {
    /// Creates a file under `dir`/`sub` with a generated name derived from
    /// the message type, writes `data`, and returns the path.
    fn create(
        &mut self,
        dir: DeviceDir,
        sub: SubDir,
        msg_type: u16,
        data: &[u8],
    ) -> Result<PathName, StoreError>;

    /// Appends one composed line to the modem log file.
    fn append_modem_log(&mut self, line: &str) -> Result<(), StoreError>;

    /// Lowest-named file currently waiting in the modem outbox.
    fn next_outbox_file(&mut self) -> Option<PathName>;

    /// Reads a file into `buf`; returns `(copied, total_length)`.
    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<(usize, usize), StoreError>;

    /// Deletes a file; `false` when it could not be removed.
    fn delete(&mut self, path: &str) -> bool;

    /// Moves a sent report into the sent subdirectory.
    fn mark_sent(&mut self, path: &str) -> bool;

    /// Moves a failed report into the error subdirectory.
    fn mark_error(&mut self, path: &str) -> bool;

    /// Copies a delivered port-2 file into the port-3 tree.
    fn copy_to_port3(&mut self, path: &str, sub: SubDir) -> bool;

    /// Next line of the CIS firmware image, `None` at end of image.
    fn next_cis_line(&mut self) -> Option<&[u8]>;

    /// Rewinds the CIS image to its first line after a recovered upload error.
    fn rewind_cis_image(&mut self);

    /// Accepts one byte of a bulk CIS configuration download.
    fn cis_capture_push(&mut self, byte: u8);

    /// Commits the captured CIS configuration.
    fn cis_capture_commit(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
    struct MillisInstant(u64);

    impl Add<Duration> for MillisInstant {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self {
            Self(self.0 + rhs.as_millis() as u64)
        }
    }

    #[test]
    fn deadline_expires_only_after_arming() {
        let mut deadline = Deadline::idle();
        let t0 = MillisInstant(0);

        assert!(!deadline.expired(t0));

        deadline.start(t0, Duration::from_millis(100));
        assert!(deadline.is_armed());
        assert!(!deadline.expired(MillisInstant(99)));
        assert!(deadline.expired(MillisInstant(100)));
        assert!(deadline.expired(MillisInstant(500)));

        deadline.stop();
        assert!(!deadline.expired(MillisInstant(500)));
    }

    #[test]
    fn restart_replaces_previous_deadline() {
        let mut deadline = Deadline::idle();
        deadline.start(MillisInstant(0), Duration::from_millis(10));
        deadline.start(MillisInstant(50), Duration::from_millis(10));

        assert!(!deadline.expired(MillisInstant(20)));
        assert!(deadline.expired(MillisInstant(60)));
    }
}
