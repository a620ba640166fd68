//! Session policy: decides which conversation to run next and cleans up
//! after each one.
//!
//! The session layer watches the conversation engine from a periodic tick.
//! In idle it works through a fixed priority ladder — deferred CIS
//! operations, the incoming-call wait window, pending mailbox traffic,
//! voice-call supervision, signal polling, then report files; in busy it
//! waits for a terminal outcome and runs the per-command cleanup, including
//! retry/backoff and the sent-file lifecycle.

use core::time::Duration;

use crate::at::{AtDriver, AtState, ErrorKind, MtStatus, Relay};
use crate::log::{EventKind, EventLog, LogContext, NO_REPORT};
use crate::platform::{Deadline, MonotonicInstant, PathName, Platform, Store};
use crate::serial::queue::DedupRing;
use crate::serial::{SerialConfig, SerialError};

/// Depth of the deferred-operation queue.
pub const DEFERRED_OPS: usize = 10;

/// Fixed gateway-status poll interval.
pub const GATEWAY_POLL: Duration = Duration::from_secs(10);

/// Fixed call-status poll interval while the handset is off hook.
pub const CALL_STATUS_POLL: Duration = Duration::from_secs(10);

/// Default signal-strength poll rate.
pub const DEFAULT_SIGNAL_POLL: Duration = Duration::from_secs(150);

/// Default delay before a failed signal check is retried.
pub const DEFAULT_CSQ_RETRY_DELAY: Duration = Duration::from_secs(25);

/// Default failed-signal-check debounce count.
pub const DEFAULT_CSQ_RETRIES: u8 = 3;

/// Default transmission retry count.
pub const DEFAULT_MSG_RETRIES: u8 = 5;

/// Default delay between transmission retries.
pub const DEFAULT_MSG_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Default incoming-call window after each exchange.
pub const DEFAULT_WAIT_FOR_CALLS: Duration = Duration::from_secs(45);

/// Default ceiling on back-to-back timeouts before the CIS is power cycled.
pub const DEFAULT_COMM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Top-level session state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    PoweredDown,
    Initialising,
    Idle,
    Busy,
}

/// Operations the session can have in flight or deferred.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Op {
    SendFile,
    SendBuffer,
    SendText,
    ReceiveFile,
    MailboxCheck,
    GatewayCheck,
    SignalQuery,
    CallStatus,
    Hangup,
    RingerOn,
    RingerOff,
    Relay1On,
    Relay1Off,
    Relay2On,
    Relay2Off,
    RingerStatus,
    Relay1Status,
    Relay2Status,
    ResetCis,
    ProgramCis,
    UploadCisConfig,
}

impl Op {
    /// Number of distinct operations, for the response table.
    pub const COUNT: usize = 21;

    fn index(self) -> usize {
        self as usize
    }
}

/// Last observed outcome of an operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpResponse {
    /// Never dispatched, or cleared by a power cycle.
    #[default]
    NoResponse,
    /// Dispatched or deferred, outcome pending.
    Waiting,
    Success,
    Failed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FileSend {
    Sending,
    WaitingToSend,
    NotSending,
}

/// The session/policy layer.
pub struct Session<I: MonotonicInstant> {
    state: SessionState,
    prev_state: SessionState,
    cmd: Option<Op>,
    rsp: [OpResponse; Op::COUNT],
    sending_enabled: bool,
    pcmcia_error: bool,
    transparent: bool,
    cis_action_complete: bool,
    prev_hook: bool,
    prev_ring: bool,
    file_in_flight: PathName,
    send_retries: u8,
    recv_retries: u8,
    csq_debounce: u8,
    deferred: DedupRing<Op, DEFERRED_OPS>,
    csq_deadline: Deadline<I>,
    retry_deadline: Deadline<I>,
    wait_deadline: Deadline<I>,
    gateway_deadline: Deadline<I>,
    call_deadline: Deadline<I>,
    comm_deadline: Deadline<I>,
    signal_poll: Duration,
    csq_retry_delay: Duration,
    csq_max_retries: u8,
    msg_max_retries: u8,
    msg_retry_delay: Duration,
    wait_for_calls: Duration,
    comm_timeout: Duration,
    keep_list: heapless::String<36>,
    log: EventLog,
}

impl<I: MonotonicInstant> Session<I> {
    /// Creates a powered-down session with default policy parameters.
    pub fn new() -> Self {
        Self {
            state: SessionState::PoweredDown,
            prev_state: SessionState::PoweredDown,
            cmd: None,
            rsp: [OpResponse::NoResponse; Op::COUNT],
            sending_enabled: false,
            pcmcia_error: false,
            transparent: false,
            cis_action_complete: false,
            prev_hook: false,
            prev_ring: false,
            file_in_flight: PathName::new(),
            send_retries: 0,
            recv_retries: 0,
            csq_debounce: 0,
            deferred: DedupRing::new(),
            csq_deadline: Deadline::idle(),
            retry_deadline: Deadline::idle(),
            wait_deadline: Deadline::idle(),
            gateway_deadline: Deadline::idle(),
            call_deadline: Deadline::idle(),
            comm_deadline: Deadline::idle(),
            signal_poll: DEFAULT_SIGNAL_POLL,
            csq_retry_delay: DEFAULT_CSQ_RETRY_DELAY,
            csq_max_retries: DEFAULT_CSQ_RETRIES,
            msg_max_retries: DEFAULT_MSG_RETRIES,
            msg_retry_delay: DEFAULT_MSG_RETRY_DELAY,
            wait_for_calls: DEFAULT_WAIT_FOR_CALLS,
            comm_timeout: DEFAULT_COMM_TIMEOUT,
            keep_list: heapless::String::new(),
            log: EventLog::new(),
        }
    }

    /// Opens the modem port with its negotiated defaults. The lower-level
    /// hardware must be up before this runs.
    pub fn init(&mut self, modem: &mut AtDriver<I>) -> Result<(), SerialError> {
        modem.port_mut().open(SerialConfig::modem_default())
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The event log owned by this session.
    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Mutable event-log access, for draining the deferred interrupt queue.
    pub fn event_log_mut(&mut self) -> &mut EventLog {
        &mut self.log
    }

    // ---- sending control ------------------------------------------------

    /// Allows report files to be picked from the outbox.
    pub fn enable_sending(&mut self) {
        self.sending_enabled = true;
    }

    /// Stops new file picks; a transmission already in flight completes.
    pub fn disable_sending(&mut self) {
        self.sending_enabled = false;
        self.wait_deadline.stop();
    }

    /// Returns `true` while outbox files may be picked.
    pub fn is_sending_enabled(&self) -> bool {
        self.sending_enabled
    }

    /// Suspends all processing while a maintenance console owns the UART.
    pub fn set_transparent_mode(&mut self, on: bool) {
        self.transparent = on;
    }

    /// Flags that the flash card is missing; the next send slot transmits
    /// a generated status report instead of a file, once per power-up.
    pub fn report_pcmcia_error(&mut self, card_error: bool) {
        self.pcmcia_error = card_error;
    }

    // ---- configurables --------------------------------------------------

    /// Signal-strength poll rate in seconds; zero keeps the previous value.
    pub fn set_signal_poll_rate(&mut self, seconds: u32) {
        if seconds > 0 {
            self.signal_poll = Duration::from_secs(seconds.into());
        }
    }

    pub fn signal_poll_rate(&self) -> u32 {
        self.signal_poll.as_secs() as u32
    }

    pub fn set_csq_retry_count(&mut self, count: u8) {
        self.csq_max_retries = count;
    }

    pub fn csq_retry_count(&self) -> u8 {
        self.csq_max_retries
    }

    /// Failed-signal-check retry delay in seconds; zero keeps the previous
    /// value.
    pub fn set_csq_retry_delay(&mut self, seconds: u32) {
        if seconds > 0 {
            self.csq_retry_delay = Duration::from_secs(seconds.into());
        }
    }

    pub fn csq_retry_delay(&self) -> u32 {
        self.csq_retry_delay.as_secs() as u32
    }

    /// Transmission retry count; zero keeps the previous value.
    pub fn set_msg_retry_count(&mut self, count: u8) {
        if count > 0 {
            self.msg_max_retries = count;
        }
    }

    pub fn msg_retry_count(&self) -> u8 {
        self.msg_max_retries
    }

    pub fn set_msg_retry_delay(&mut self, seconds: u32) {
        self.msg_retry_delay = Duration::from_secs(seconds.into());
    }

    pub fn msg_retry_delay(&self) -> u32 {
        self.msg_retry_delay.as_secs() as u32
    }

    pub fn set_incoming_call_delay(&mut self, seconds: u32) {
        self.wait_for_calls = Duration::from_secs(seconds.into());
    }

    pub fn incoming_call_delay(&self) -> u32 {
        self.wait_for_calls.as_secs() as u32
    }

    pub fn set_comm_timeout(&mut self, seconds: u32) {
        if seconds > 0 {
            self.comm_timeout = Duration::from_secs(seconds.into());
        }
    }

    pub fn comm_timeout(&self) -> u32 {
        self.comm_timeout.as_secs() as u32
    }

    /// Forwards the satellite response timer to the conversation engine.
    pub fn set_satellite_response_time(&mut self, modem: &mut AtDriver<I>, seconds: u8) -> bool {
        modem.set_satellite_timeout_secs(seconds)
    }

    /// Sets the sent-file keep list: empty deletes every sent report, `*`
    /// keeps them all, anything else keeps reports whose filename starts
    /// with one of the listed priority flags.
    pub fn keep_sent_files(&mut self, priority_flags: &str) {
        self.keep_list.clear();
        let _ = self.keep_list.push_str(priority_flags);
    }

    pub fn kept_file_flags(&self) -> &str {
        &self.keep_list
    }

    // ---- operations -----------------------------------------------------

    /// Sends a text message, or runs a mailbox check when `text` is empty.
    pub fn send_text<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
        text: &str,
    ) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        if text.is_empty() {
            if modem.check_mailbox(p) {
                self.set_busy(Op::MailboxCheck);
                return true;
            }
            return false;
        }
        if modem.send_text(p, text) {
            self.set_busy(Op::SendText);
            return true;
        }
        false
    }

    /// Sends a binary buffer, or runs a mailbox check when `data` is empty.
    pub fn send_binary<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
        data: &[u8],
    ) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        if data.is_empty() {
            if modem.check_mailbox(p) {
                self.set_busy(Op::MailboxCheck);
                return true;
            }
            return false;
        }
        if modem.send_buffer(p, data) {
            self.set_busy(Op::SendBuffer);
            return true;
        }
        false
    }

    /// Outcome of the last text transmission.
    pub fn get_text_response(&self) -> OpResponse {
        self.rsp[Op::SendText.index()]
    }

    /// Outcome of the last buffer transmission.
    pub fn get_binary_response(&self) -> OpResponse {
        self.rsp[Op::SendBuffer.index()]
    }

    /// Outcome of any operation.
    pub fn get_response(&self, op: Op) -> OpResponse {
        self.rsp[op.index()]
    }

    /// Hangs up the active voice call, deferring when busy.
    pub fn hangup_call<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
    ) -> bool {
        if modem.hang_up(p) {
            self.set_busy(Op::Hangup);
            return true;
        }
        self.enqueue(Op::Hangup);
        false
    }

    /// Switches the handset ringer, deferring when the driver is busy.
    pub fn toggle_ringer<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
        on: bool,
    ) -> bool {
        let op = if on { Op::RingerOn } else { Op::RingerOff };
        if self.cis_ready() && modem.set_ringer(p, on) {
            self.set_busy(op);
            return true;
        }
        self.enqueue(op);
        false
    }

    /// Switches a relay, deferring when the driver is busy.
    pub fn toggle_relay<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
        relay: Relay,
        on: bool,
    ) -> bool {
        let op = match (relay, on) {
            (Relay::Relay1, true) => Op::Relay1On,
            (Relay::Relay1, false) => Op::Relay1Off,
            (Relay::Relay2, true) => Op::Relay2On,
            (Relay::Relay2, false) => Op::Relay2Off,
        };
        if self.cis_ready() && modem.set_relay(p, relay, on) {
            self.set_busy(op);
            return true;
        }
        self.enqueue(op);
        false
    }

    /// Queries the ringer state from the board.
    pub fn send_ringer_status_query<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
    ) -> bool {
        if self.cis_ready() && modem.query_ringer(p) {
            self.set_busy(Op::RingerStatus);
            return true;
        }
        self.enqueue(Op::RingerStatus);
        false
    }

    /// Queries a relay state from the board.
    pub fn send_relay_status_query<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
        relay: Relay,
    ) -> bool {
        let op = match relay {
            Relay::Relay1 => Op::Relay1Status,
            Relay::Relay2 => Op::Relay2Status,
        };
        if self.cis_ready() && modem.query_relay(p, relay) {
            self.set_busy(op);
            return true;
        }
        self.enqueue(op);
        false
    }

    /// Cached ringer state; refresh with [`Session::send_ringer_status_query`].
    pub fn get_ringer_status(&self, modem: &AtDriver<I>) -> bool {
        modem.ringer_on()
    }

    /// Cached relay state; refresh with [`Session::send_relay_status_query`].
    pub fn get_relay_status(&self, modem: &AtDriver<I>, relay: Relay) -> bool {
        modem.relay_on(relay)
    }

    /// Soft-resets the CIS, saving the output states for restore and
    /// cycling the modem with it.
    pub fn reset_cis<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
    ) -> bool {
        if self.cis_ready() && modem.reset_cis(p) {
            self.save_cis_state(modem);
            self.set_busy(Op::ResetCis);
            p.power_cycle_modem();
            return true;
        }
        self.enqueue(Op::ResetCis);
        false
    }

    /// Pulls the current configuration out of the CIS board.
    pub fn upload_cis_config<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
    ) -> bool {
        self.cis_action_complete = false;
        if self.cis_ready() && modem.download_cis_config(p) {
            self.set_busy(Op::UploadCisConfig);
            return true;
        }
        self.enqueue(Op::UploadCisConfig);
        false
    }

    /// Reflashes the CIS from the stored image.
    pub fn program_cis<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
    ) -> bool {
        self.cis_action_complete = false;
        if self.cis_ready() && modem.program_cis(p) {
            self.set_busy(Op::ProgramCis);
            return true;
        }
        self.enqueue(Op::ProgramCis);
        false
    }

    /// `true` once a CIS upload or programming pass has finished.
    pub fn is_cis_action_complete(&self) -> bool {
        self.cis_action_complete
    }

    // ---- tick -----------------------------------------------------------

    /// Drives the conversation engine and the policy state machine. Call
    /// periodically from the main loop.
    pub fn tick<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
    ) {
        if self.transparent {
            return;
        }

        modem.tick(p, &mut self.log);

        let at = modem.state();
        let now = p.now();

        // A power-down at the lower level overrides whatever we were doing.
        if at == AtState::PoweredDown && self.state != SessionState::PoweredDown {
            self.state = SessionState::PoweredDown;
            self.log_line(modem, p, NO_REPORT, EventKind::ModemPoweredDown, None);
            self.rsp = [OpResponse::NoResponse; Op::COUNT];
        }

        match self.state {
            SessionState::Initialising => self.tick_initialising(modem, p, at, now),
            SessionState::Idle => self.tick_idle(modem, p, at, now),
            SessionState::Busy => self.tick_busy(modem, p, at, now),
            SessionState::PoweredDown => self.tick_powered_down(modem, p, at, now),
        }
    }

    fn tick_initialising<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
        at: AtState,
        now: I,
    ) {
        match at {
            AtState::Initialising => {}
            AtState::Succeeded => {
                modem.ack_idle();
                self.state = SessionState::Idle;
                self.prev_state = SessionState::Idle;
                self.cmd = None;
                self.send_retries = 0;
                self.recv_retries = 0;
                self.csq_debounce = 0;
                self.sending_enabled = true;

                // First signal check right away, and resynchronise the CIS
                // output cache.
                self.retry_deadline.stop();
                self.csq_deadline.start(now, Duration::ZERO);
                self.gateway_deadline.start(now, GATEWAY_POLL);
                self.call_deadline.start(now, CALL_STATUS_POLL);
                self.comm_deadline.start(now, self.comm_timeout);

                self.enqueue(Op::RingerStatus);
                self.enqueue(Op::Relay1Status);
                self.enqueue(Op::Relay2Status);
                self.rsp = [OpResponse::NoResponse; Op::COUNT];

                p.system_log("modem initialised");
            }
            AtState::Failed | AtState::TimedOut => {
                // Hold off re-initialising while the gateway still owes us
                // mail; the read preserves the alert in the queue count.
                if modem.take_mt_status() != MtStatus::Message {
                    self.handle_timeouts(at, modem, p, now);
                    modem.ack_init();
                }
            }
            _ => {
                modem.ack_init();
            }
        }
    }

    fn tick_idle<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
        at: AtState,
        now: I,
    ) {
        match at {
            AtState::Idle => {
                self.handle_queued_cis(modem, p);
                if self.wait_deadline.expired(now) {
                    self.wait_deadline.stop();
                    self.sending_enabled = true;
                }
            }
            _ => {
                modem.ack_init();
                self.log_line(modem, p, NO_REPORT, EventKind::UnexpectedResponse, None);
                self.state = SessionState::Initialising;
                return;
            }
        }

        if self.state != SessionState::Idle {
            // A deferred CIS operation went busy.
            return;
        }

        if self.service_pending_mt(modem, p) {
            return;
        }

        if modem.in_voice_call() {
            self.send_call_status(modem, p, now);
            if !self.prev_hook {
                self.prev_hook = true;
                self.log_line(modem, p, NO_REPORT, EventKind::PhoneOffHook, None);
            }
            return;
        } else if self.prev_hook {
            self.prev_hook = false;
            self.log_line(modem, p, NO_REPORT, EventKind::PhoneBackOnHook, None);
        }

        // A ring only gets logged; the modem itself refuses SBD traffic
        // while it is busy with the call.
        if modem.port().ri() {
            if !self.prev_ring {
                self.prev_ring = true;
                self.log_line(modem, p, NO_REPORT, EventKind::IncomingCall, None);
            }
        } else if self.prev_ring {
            self.prev_ring = false;
            self.log_line(modem, p, NO_REPORT, EventKind::IncomingCallComplete, None);
        }

        if self.csq_deadline.expired(now) && modem.query_signal(p) {
            self.set_busy(Op::SignalQuery);
            self.csq_deadline.start(now, self.signal_poll);
            return;
        }

        if self.sending_enabled {
            if self.send_file_to_modem(modem, p, now) == FileSend::Sending {
                return;
            }
            if self.gateway_deadline.expired(now) && modem.check_gateway(p) {
                self.set_busy(Op::GatewayCheck);
                self.gateway_deadline.start(now, GATEWAY_POLL);
            }
        }
    }

    fn tick_busy<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
        at: AtState,
        now: I,
    ) {
        match at {
            AtState::Succeeded | AtState::Failed | AtState::TimedOut => {
                let sub_error = modem.take_error();
                modem.ack_idle();
                self.state = SessionState::Idle;
                self.clean_up(modem, p, at, sub_error, now);
            }
            AtState::Sending | AtState::Receiving | AtState::Programming => {}
            _ => {
                modem.ack_init();
                self.log_line(modem, p, NO_REPORT, EventKind::UnexpectedResponse, None);
                self.state = SessionState::Initialising;
            }
        }
    }

    fn tick_powered_down<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
        at: AtState,
        now: I,
    ) {
        match at {
            AtState::Initialising => {
                self.log_line(modem, p, NO_REPORT, EventKind::ModemPowered, None);
                self.state = SessionState::Initialising;
            }
            AtState::PoweredDown => {
                // The CIS rail is independent; its operations still run.
                self.handle_queued_cis(modem, p);
                self.csq_deadline.stop();
                self.retry_deadline.stop();
                self.gateway_deadline.stop();
                self.call_deadline.stop();
                self.comm_deadline.start(now, self.comm_timeout);
            }
            AtState::TimedOut => {
                // A CIS exchange timed out while the modem rail was down.
                self.state = self.prev_state;
                if self.state != SessionState::Idle {
                    modem.ack_init();
                }
            }
            AtState::Programming => {}
            _ => {
                modem.ack_init();
                self.log_line(modem, p, NO_REPORT, EventKind::UnexpectedResponse, None);
                self.state = SessionState::Initialising;
            }
        }
    }

    // ---- cleanup --------------------------------------------------------

    fn clean_up<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
        at: AtState,
        sub_error: Option<ErrorKind>,
        now: I,
    ) {
        let op = match self.cmd {
            Some(op) => op,
            None => return,
        };

        self.rsp[op.index()] = if at == AtState::Succeeded {
            OpResponse::Success
        } else {
            OpResponse::Failed
        };
        self.handle_timeouts(at, modem, p, now);

        match op {
            Op::ReceiveFile => {
                self.cmd = None;
                if at == AtState::TimedOut {
                    self.log_line(modem, p, NO_REPORT, EventKind::ReceiveFailure, sub_error);
                    self.recv_retries += 1;
                    if self.recv_retries < self.msg_max_retries && modem.read_mt_binary(p) {
                        self.log_line(modem, p, NO_REPORT, EventKind::Receive, None);
                        self.set_busy(Op::ReceiveFile);
                        return;
                    }
                }
                self.recv_retries = 0;
                if at == AtState::Succeeded && modem.in_voice_call() {
                    self.hangup_call(modem, p);
                    return;
                }
                self.wait_for_incoming_calls(now);
            }
            Op::SendFile => self.clean_up_file_send(modem, p, at, sub_error, now),
            Op::SendBuffer | Op::SendText => {
                self.cmd = None;
                if at == AtState::Succeeded && modem.in_voice_call() {
                    self.hangup_call(modem, p);
                    return;
                }
                if !self.service_pending_mt(modem, p) {
                    self.wait_for_incoming_calls(now);
                }
            }
            Op::CallStatus => {
                self.cmd = None;
                self.wait_for_incoming_calls(now);
            }
            Op::MailboxCheck => {
                self.cmd = None;
                let kind = if at == AtState::Succeeded {
                    EventKind::MailboxCheckSuccess
                } else {
                    EventKind::MailboxCheckFailure
                };
                self.log_line(modem, p, NO_REPORT, kind, sub_error);
                if !self.service_pending_mt(modem, p) {
                    self.wait_for_incoming_calls(now);
                }
            }
            Op::GatewayCheck => {
                self.cmd = None;
                if at == AtState::Succeeded {
                    // A message already sitting in the modem buffer reads
                    // straight out; traffic still queued at the gateway
                    // needs an empty session to pull it down.
                    if self.service_pending_mt(modem, p) {
                        return;
                    }
                    if modem.check_mailbox(p) {
                        self.set_busy(Op::MailboxCheck);
                    }
                }
            }
            Op::SignalQuery => {
                self.cmd = None;
                if at == AtState::Succeeded {
                    self.csq_debounce = 0;
                } else {
                    self.csq_debounce += 1;
                    if self.csq_debounce < self.csq_max_retries {
                        self.csq_deadline.start(now, self.csq_retry_delay);
                    } else {
                        self.csq_debounce = 0;
                        modem.clear_signal_strength();
                        self.log_line(
                            modem,
                            p,
                            NO_REPORT,
                            EventKind::SignalStrengthFailure,
                            sub_error,
                        );
                        p.system_log("satellite signal lost");
                    }
                }
            }
            Op::Hangup => {
                self.cmd = None;
                self.wait_for_incoming_calls(now);
                let kind = if at == AtState::Succeeded {
                    EventKind::HangupSuccess
                } else {
                    EventKind::HangupFailure
                };
                self.log_line(modem, p, NO_REPORT, kind, sub_error);
            }
            Op::RingerOn
            | Op::RingerOff
            | Op::Relay1On
            | Op::Relay1Off
            | Op::Relay2On
            | Op::Relay2Off
            | Op::RingerStatus
            | Op::Relay1Status
            | Op::Relay2Status
            | Op::ResetCis => {
                // CIS operations retry through the queue and may have been
                // issued from powered-down; return to wherever we were.
                if at != AtState::Succeeded {
                    self.enqueue(op);
                }
                self.cmd = None;
                self.restore_prev_state(modem);
            }
            Op::UploadCisConfig => {
                self.cis_action_complete = true;
                self.cmd = None;
                self.restore_prev_state(modem);
            }
            Op::ProgramCis => {
                if at != AtState::Succeeded {
                    // Leave an invalid marker so the recovery image loads,
                    // and reset the board.
                    p.system_log("CIS configuration failed");
                    p.invalidate_cis_config();
                }
                self.cis_action_complete = true;
                self.cmd = None;
                self.restore_prev_state(modem);
                self.save_cis_state(modem);
                p.power_cycle_cis();
            }
        }
    }

    fn clean_up_file_send<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
        at: AtState,
        sub_error: Option<ErrorKind>,
        now: I,
    ) {
        let path = self.file_in_flight.clone();

        if at == AtState::Succeeded {
            self.send_retries = 0;
            self.cmd = None;
            self.log_line(modem, p, &path, EventKind::SendSuccessful, sub_error);

            if self.should_keep(&path) {
                if !p.mark_sent(&path) {
                    self.log_line(modem, p, &path, EventKind::MoveFailure, None);
                    if !p.delete(&path) {
                        p.system_log("sent report could not be removed");
                    }
                }
            } else if !p.delete(&path) {
                self.log_line(modem, p, &path, EventKind::DeleteFailure, None);
                let _ = p.mark_sent(&path);
            }

            if modem.in_voice_call() {
                self.hangup_call(modem, p);
                return;
            }
            if !self.service_pending_mt(modem, p) {
                self.wait_for_incoming_calls(now);
            }
        } else {
            self.cmd = None;
            self.send_retries += 1;
            if self.send_retries < self.msg_max_retries {
                self.retry_deadline.start(now, self.msg_retry_delay);
            } else {
                self.send_retries = 0;
                self.wait_for_incoming_calls(now);
                if p.mark_error(&path) {
                    self.log_line(modem, p, &path, EventKind::SendFailure, sub_error);
                } else {
                    self.log_line(modem, p, &path, EventKind::MoveFailure, None);
                    if !p.delete(&path) {
                        p.system_log("failed report could not be removed");
                    }
                }
            }
        }
    }

    // ---- helpers --------------------------------------------------------

    fn cis_ready(&self) -> bool {
        matches!(
            self.state,
            SessionState::Idle | SessionState::PoweredDown
        )
    }

    fn set_busy(&mut self, op: Op) {
        self.prev_state = self.state;
        self.state = SessionState::Busy;
        self.cmd = Some(op);
        self.rsp[op.index()] = OpResponse::Waiting;
    }

    fn enqueue(&mut self, op: Op) {
        if self.deferred.push(op) {
            self.rsp[op.index()] = OpResponse::Waiting;
        }
    }

    fn restore_prev_state(&mut self, modem: &mut AtDriver<I>) {
        self.state = self.prev_state;
        if self.state != SessionState::Idle {
            modem.ack_init();
        }
    }

    /// Queues set-commands matching the cached output states, so the board
    /// comes back configured after a reset.
    fn save_cis_state(&mut self, modem: &AtDriver<I>) {
        self.enqueue(if modem.ringer_on() {
            Op::RingerOn
        } else {
            Op::RingerOff
        });
        self.enqueue(if modem.relay_on(Relay::Relay1) {
            Op::Relay1On
        } else {
            Op::Relay1Off
        });
        self.enqueue(if modem.relay_on(Relay::Relay2) {
            Op::Relay2On
        } else {
            Op::Relay2Off
        });
    }

    /// Dispatches one deferred operation, if any is queued.
    fn handle_queued_cis<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
    ) -> bool {
        let op = match self.deferred.pop() {
            Some(op) => op,
            None => return false,
        };

        match op {
            Op::RingerOn => self.toggle_ringer(modem, p, true),
            Op::RingerOff => self.toggle_ringer(modem, p, false),
            Op::Relay1On => self.toggle_relay(modem, p, Relay::Relay1, true),
            Op::Relay1Off => self.toggle_relay(modem, p, Relay::Relay1, false),
            Op::Relay2On => self.toggle_relay(modem, p, Relay::Relay2, true),
            Op::Relay2Off => self.toggle_relay(modem, p, Relay::Relay2, false),
            Op::RingerStatus => self.send_ringer_status_query(modem, p),
            Op::Relay1Status => self.send_relay_status_query(modem, p, Relay::Relay1),
            Op::Relay2Status => self.send_relay_status_query(modem, p, Relay::Relay2),
            Op::ResetCis => self.reset_cis(modem, p),
            Op::ProgramCis => self.program_cis(modem, p),
            Op::UploadCisConfig => self.upload_cis_config(modem, p),
            Op::Hangup => {
                if self.state != SessionState::PoweredDown {
                    self.hangup_call(modem, p)
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn service_pending_mt<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
    ) -> bool {
        if modem.take_mt_status() == MtStatus::Message && modem.read_mt_binary(p) {
            self.log_line(modem, p, NO_REPORT, EventKind::Receive, None);
            self.set_busy(Op::ReceiveFile);
            return true;
        }
        false
    }

    fn send_call_status<P: Platform<Instant = I>>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &P,
        now: I,
    ) -> bool {
        if !self.call_deadline.expired(now) {
            return false;
        }
        if modem.query_call_status(p) {
            self.set_busy(Op::CallStatus);
            self.call_deadline.start(now, CALL_STATUS_POLL);
            return true;
        }
        false
    }

    fn send_file_to_modem<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &mut AtDriver<I>,
        p: &mut P,
        now: I,
    ) -> FileSend {
        if self.pcmcia_error {
            // No card: ship a generated status report instead of a file.
            let mut report = [0u8; 128];
            let len = p.system_status_report(&mut report);
            if len > 0 && modem.send_buffer(p, &report[..len]) {
                self.set_busy(Op::SendBuffer);
                self.pcmcia_error = false;
                return FileSend::Sending;
            }
        }

        if self.send_retries == 0 {
            let path = match p.next_outbox_file() {
                Some(path) => path,
                None => return FileSend::NotSending,
            };
            self.file_in_flight = path;
            let path = self.file_in_flight.clone();
            self.log_line(modem, p, &path, EventKind::Send, None);
        } else {
            if !self.retry_deadline.expired(now) {
                return FileSend::WaitingToSend;
            }
            self.retry_deadline.stop();
            let path = self.file_in_flight.clone();
            self.log_line(modem, p, &path, EventKind::RetrySend, None);
        }

        let path = self.file_in_flight.clone();
        if modem.send_file(p, &path) {
            self.set_busy(Op::SendFile);
            FileSend::Sending
        } else {
            // An unreadable or empty report would wedge the outbox; drop it.
            if p.delete(&path) {
                p.system_log("unsendable report deleted");
            } else {
                p.system_log("unsendable report could not be deleted");
            }
            FileSend::NotSending
        }
    }

    fn wait_for_incoming_calls(&mut self, now: I) {
        // Only pause senders that are actually running; the window re-arms
        // sending when it expires.
        if self.sending_enabled {
            self.sending_enabled = false;
            self.wait_deadline.start(now, self.wait_for_calls);
        }
    }

    fn handle_timeouts<P: Platform<Instant = I> + Store>(
        &mut self,
        at: AtState,
        modem: &AtDriver<I>,
        p: &mut P,
        now: I,
    ) {
        if at == AtState::TimedOut {
            if self.comm_deadline.expired(now) {
                if !modem.in_voice_call() {
                    p.system_log("modem communications error detected - power cycling CIS");
                    if !p.power_cycle_cis() {
                        self.enqueue(Op::ResetCis);
                    }
                }
                self.comm_deadline.start(now, self.comm_timeout);
            }
        } else {
            self.comm_deadline.start(now, self.comm_timeout);
        }
    }

    fn should_keep(&self, path: &str) -> bool {
        if self.keep_list.is_empty() {
            return false;
        }
        if self.keep_list.starts_with('*') {
            return true;
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.chars().next() {
            Some(first) => self.keep_list.chars().any(|flag| flag == first),
            None => false,
        }
    }

    fn log_line<P: Platform<Instant = I> + Store>(
        &mut self,
        modem: &AtDriver<I>,
        p: &mut P,
        file: &str,
        kind: EventKind,
        sub_error: Option<ErrorKind>,
    ) {
        let ctx = LogContext {
            signal: modem.signal_strength(),
            momsn: modem.momsn(),
            mtmsn: modem.mtmsn(),
        };
        self.log.append(p, &ctx, file, kind, sub_error);
    }
}

impl<I: MonotonicInstant> Default for Session<I> {
    fn default() -> Self {
        Self::new()
    }
}
