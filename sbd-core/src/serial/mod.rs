//! Serial port layer: byte queues, port configuration, discrete control
//! lines, and the data/programming port mux.
//!
//! The UART itself lives outside the core. This layer owns the transmit and
//! receive rings the interrupt handler exchanges bytes through, the logical
//! states of the RS-232 control lines (already de-inverted by the hardware
//! edge), and the discrete that steers the wire between the modem data port
//! and the CIS programming port.

pub mod queue;

pub use queue::{ByteQueue, DedupRing, SharedRing};

/// Receive ring capacity. Must exceed the longest single modem response
/// (the revision banner runs to ~145 bytes); sized generously so a burst of
/// unsolicited traffic cannot wrap a response mid-line.
pub const RX_QUEUE_LEN: usize = 4096;

/// Transmit ring capacity; covers the largest MO payload plus framing.
pub const TX_QUEUE_LEN: usize = 4096;

/// Word lengths the UART supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataBits {
    Eight,
    Nine,
}

/// Parity settings the UART supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Stop-bit settings the UART supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    One,
    OneAndHalf,
    Two,
}

/// Flow-control settings. Software flow control is not wired on this board.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowControl {
    None,
    XonXoff,
    RtsCts,
}

/// Serial parameters handed to [`SerialPort::open`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SerialConfig {
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl SerialConfig {
    /// 9600 8-N-1 with RTS/CTS, the modem's negotiated default.
    pub const fn modem_default() -> Self {
        Self {
            baud: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::RtsCts,
        }
    }
}

/// Failures reported by the serial layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SerialError {
    /// Parameter combination the hardware cannot express.
    BadParameter,
    /// Operation on a port that has not been opened.
    PortClosed,
}

/// Which endpoint the shared UART is steered to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortSelect {
    /// Modem data port.
    #[default]
    Data,
    /// CIS programming port.
    Programming,
}

/// Logical states of the discrete control lines.
///
/// The wire levels are RS-232 inverted; the hardware edge de-inverts them,
/// so `true` here always means "asserted".
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineStates {
    pub ri: bool,
    pub dcd: bool,
    pub dsr: bool,
    pub cts: bool,
    pub rts: bool,
    pub dtr: bool,
    pub tx_mark: bool,
    pub cis_power: bool,
}

/// The shared UART as the driver sees it: two byte rings, the control-line
/// latches, and the port mux.
#[derive(Debug)]
pub struct SerialPort {
    config: Option<SerialConfig>,
    rx: ByteQueue<RX_QUEUE_LEN>,
    tx: ByteQueue<TX_QUEUE_LEN>,
    lines: LineStates,
    selected: PortSelect,
}

impl SerialPort {
    /// Creates a closed port with empty queues and the data mux selected.
    pub const fn new() -> Self {
        Self {
            config: None,
            rx: ByteQueue::new(),
            tx: ByteQueue::new(),
            lines: LineStates {
                ri: false,
                dcd: false,
                dsr: false,
                cts: false,
                rts: false,
                dtr: false,
                tx_mark: false,
                cis_power: true,
            },
            selected: PortSelect::Data,
        }
    }

    /// Validates `config` and opens the port.
    ///
    /// XON/XOFF is rejected (not wired), as is 9-bit data combined with
    /// parity: the UART has no room for both a ninth data bit and a parity
    /// bit in one frame.
    pub fn open(&mut self, config: SerialConfig) -> Result<(), SerialError> {
        if config.flow_control == FlowControl::XonXoff {
            return Err(SerialError::BadParameter);
        }
        if config.data_bits == DataBits::Nine && config.parity != Parity::None {
            return Err(SerialError::BadParameter);
        }
        if config.baud == 0 {
            return Err(SerialError::BadParameter);
        }

        self.config = Some(config);
        Ok(())
    }

    /// Returns the active configuration, if the port is open.
    pub fn config(&self) -> Option<SerialConfig> {
        self.config
    }

    /// Queues `bytes` for transmission, in order.
    pub fn send(&mut self, bytes: &[u8]) {
        self.tx.extend(bytes);
    }

    /// Takes the next received byte, if any.
    pub fn recv_byte(&mut self) -> Option<u8> {
        self.rx.pop()
    }

    /// Discards everything waiting to transmit.
    pub fn flush_tx(&mut self) {
        self.tx.clear();
    }

    /// Discards everything received but not yet consumed.
    pub fn flush_rx(&mut self) {
        self.rx.clear();
    }

    /// Reads and clears the receive-overflow flag.
    pub fn take_rx_overflow(&mut self) -> bool {
        self.rx.take_overflow()
    }

    /// Steers the UART to `port`, flushing both queues.
    ///
    /// A stale byte from the previous endpoint must never be parsed as part
    /// of the next conversation.
    pub fn set_port(&mut self, port: PortSelect) {
        if self.selected != port {
            self.flush_tx();
            self.flush_rx();
        }
        self.selected = port;
    }

    /// Currently selected endpoint.
    pub fn port(&self) -> PortSelect {
        self.selected
    }

    /// Returns `true` while transmit data is still queued.
    pub fn sending(&self) -> bool {
        !self.tx.is_empty()
    }

    /// Current logical control-line states.
    pub fn lines(&self) -> LineStates {
        self.lines
    }

    pub fn ri(&self) -> bool {
        self.lines.ri
    }

    pub fn dcd(&self) -> bool {
        self.lines.dcd
    }

    pub fn dsr(&self) -> bool {
        self.lines.dsr
    }

    pub fn cts(&self) -> bool {
        self.lines.cts
    }

    pub fn rts(&self) -> bool {
        self.lines.rts
    }

    pub fn dtr(&self) -> bool {
        self.lines.dtr
    }

    pub fn set_rts(&mut self, asserted: bool) {
        self.lines.rts = asserted;
    }

    pub fn set_dtr(&mut self, asserted: bool) {
        self.lines.dtr = asserted;
    }

    /// Forces the TX line to a steady mark/space, for break signalling.
    pub fn set_tx_mark(&mut self, asserted: bool) {
        self.lines.tx_mark = asserted;
    }

    pub fn set_cis_power(&mut self, enabled: bool) {
        self.lines.cis_power = enabled;
    }

    pub fn cis_power(&self) -> bool {
        self.lines.cis_power
    }

    /// Latches input-line states observed by the hardware edge.
    pub fn set_input_lines(&mut self, ri: bool, dcd: bool, dsr: bool, cts: bool) {
        self.lines.ri = ri;
        self.lines.dcd = dcd;
        self.lines.dsr = dsr;
        self.lines.cts = cts;
    }

    /// Interrupt-side entry: one byte arrived from the wire.
    pub fn isr_rx_push(&mut self, byte: u8) {
        self.rx.push(byte);
    }

    /// Interrupt-side exit: next byte to shift out, if any is queued.
    pub fn isr_tx_pop(&mut self) -> Option<u8> {
        self.tx.pop()
    }
}

impl Default for SerialPort {
    fn default() -> Self {
        Self::new()
    }
}
