//! Mobile-terminated message frames and their dispatch.
//!
//! The gateway hands MT messages over as a binary frame: big-endian length,
//! payload, big-endian additive checksum, trailing `'0'`. The payload starts
//! with the report header — an internal checksum word followed by the
//! message-type word — and the type decides whether the message is a remote
//! command executed on the spot or a file routed into one of the card
//! directories.

use heapless::Vec;

use crate::platform::{DeviceDir, RemoteCommand, SubDir};

/// Largest MT payload the gateway will deliver.
pub const MAX_MT_PAYLOAD: usize = 1890;

/// Raw frame size: length word + payload + checksum word.
pub const MAX_MT_FRAME: usize = MAX_MT_PAYLOAD + 4;

/// Byte offset of the message-type word inside the payload.
pub const TYPE_OFFSET: usize = 2;

/// Each dispatch range spans this many consecutive type values.
pub const TYPE_RANGE: u16 = 0x1F;

// Remote-command sentinel types. These execute immediately and are never
// saved; the executing collaborator answers the gateway with its own
// command-acknowledge report.
pub const MT_RESET_SYSTEM: u16 = 0x7F01;
pub const MT_RESET_SYSTEM_IMMEDIATE: u16 = 0x7F02;
pub const MT_ACK_ACK: u16 = 0x7F03;
pub const MT_CONFIG_SNAPSHOT: u16 = 0x7F04;
pub const MT_POWER_CYCLE_MODEM: u16 = 0x7F05;
pub const MT_FORMAT_CARD: u16 = 0x7F06;
pub const MT_POWER_CYCLE_CIS: u16 = 0x7F07;
pub const MT_PURGE_RULES_IMAGE: u16 = 0x7F08;
pub const MT_DELETE_RULES_FILE: u16 = 0x7F09;
pub const MT_DOWNLOAD_CIS_CONFIG: u16 = 0x7F0A;
pub const MT_SYSTEM_LOG_SNAPSHOT: u16 = 0x7F0B;
pub const MT_MODEM_LOG_SNAPSHOT: u16 = 0x7F0C;
pub const MT_VERSION_SNAPSHOT: u16 = 0x7F0D;
pub const MT_GPS_SNAPSHOT: u16 = 0x7F0E;
pub const MT_RESET_DATA_BUS: u16 = 0x7F0F;
pub const MT_SEND_LOGS_NOW: u16 = 0x7F10;
pub const MT_SEND_LOGS_AFTER_RECORDER: u16 = 0x7F11;

/// Where a delivered MT message goes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MtDisposition {
    /// Execute a remote command; nothing is saved.
    Remote(RemoteCommand),
    /// Save the payload under the given directory pair.
    Save { dir: DeviceDir, sub: SubDir },
    /// Save under port 2 and mirror a copy into the port-3 tree.
    SaveAndCopy { dir: DeviceDir, sub: SubDir },
}

/// Frame decode failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer bytes than the length word promises.
    Truncated,
    /// Length word exceeds [`MAX_MT_PAYLOAD`].
    BadLength,
    /// Additive checksum mismatch.
    BadChecksum,
    /// Missing or wrong trailing status byte.
    BadTrailer,
}

/// Additive checksum over `data`, modulo 2^16.
pub fn additive_checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |sum, byte| sum.wrapping_add(u16::from(*byte)))
}

/// Formats `payload` into the on-wire MT frame, including the trailing
/// status byte the modem appends after the checksum.
pub fn encode_frame<const N: usize>(payload: &[u8], out: &mut Vec<u8, N>) -> Result<(), ()> {
    let len = u16::try_from(payload.len()).map_err(|_| ())?;
    out.clear();
    out.extend_from_slice(&len.to_be_bytes())?;
    out.extend_from_slice(payload)?;
    out.extend_from_slice(&additive_checksum(payload).to_be_bytes())?;
    out.push(b'0').map_err(|_| ())?;
    Ok(())
}

/// Validates a complete frame and returns the payload slice.
///
/// Left-inverse of [`encode_frame`]: any payload up to [`MAX_MT_PAYLOAD`]
/// bytes decodes back to itself.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < 2 {
        return Err(FrameError::Truncated);
    }
    let len = usize::from(u16::from_be_bytes([frame[0], frame[1]]));
    if len > MAX_MT_PAYLOAD {
        return Err(FrameError::BadLength);
    }
    if frame.len() < 2 + len + 2 {
        return Err(FrameError::Truncated);
    }
    let payload = &frame[2..2 + len];
    let checksum = u16::from_be_bytes([frame[2 + len], frame[3 + len]]);
    if checksum != additive_checksum(payload) {
        return Err(FrameError::BadChecksum);
    }
    match frame.get(4 + len) {
        Some(b'0') => Ok(payload),
        _ => Err(FrameError::BadTrailer),
    }
}

/// Message-type word of a payload, when the payload is long enough to
/// carry one.
pub fn message_type(payload: &[u8]) -> Option<u16> {
    let bytes = payload.get(TYPE_OFFSET..TYPE_OFFSET + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Gateway-side request timestamp carried by sentinel messages.
pub fn request_timestamp(payload: &[u8]) -> u32 {
    match payload.get(4..8) {
        Some(bytes) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        None => 0,
    }
}

fn request_option(payload: &[u8]) -> u16 {
    match payload.get(8..10) {
        Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
        None => 0,
    }
}

/// One contiguous dispatch range.
struct TypeRange {
    first: u16,
    dir: DeviceDir,
    sub: SubDir,
    copy_port3: bool,
}

const fn range(first: u16, dir: DeviceDir, sub: SubDir) -> TypeRange {
    TypeRange {
        first,
        dir,
        sub,
        copy_port3: false,
    }
}

const fn copy_range(first: u16, sub: SubDir) -> TypeRange {
    TypeRange {
        first,
        dir: DeviceDir::Rs422Port2,
        sub,
        copy_port3: true,
    }
}

// The full routing table, 0x20 types per slot. The modem device omits its
// error and working subdirectories; the system device carries only the root
// and recorder-log slots. Types outside every range land in the modem inbox.
const ROUTES: &[TypeRange] = &[
    range(0x0000, DeviceDir::Modem, SubDir::None),
    range(0x0020, DeviceDir::Modem, SubDir::Inbox),
    range(0x0040, DeviceDir::Modem, SubDir::Outbox),
    range(0x0060, DeviceDir::Modem, SubDir::Sent),
    copy_range(0x0080, SubDir::None),
    copy_range(0x00A0, SubDir::Inbox),
    copy_range(0x00C0, SubDir::Outbox),
    copy_range(0x00E0, SubDir::Error),
    copy_range(0x0100, SubDir::Working),
    range(0x0180, DeviceDir::Ela, SubDir::None),
    range(0x01A0, DeviceDir::Ela, SubDir::Inbox),
    range(0x01C0, DeviceDir::Ela, SubDir::Outbox),
    range(0x01E0, DeviceDir::Ela, SubDir::Error),
    range(0x0200, DeviceDir::Ela, SubDir::Working),
    range(0x0220, DeviceDir::Rs422Port3, SubDir::None),
    range(0x0240, DeviceDir::Rs422Port3, SubDir::Inbox),
    range(0x0260, DeviceDir::Rs422Port3, SubDir::Outbox),
    range(0x0280, DeviceDir::Rs422Port3, SubDir::Error),
    range(0x02A0, DeviceDir::Rs422Port3, SubDir::Working),
    range(0x02C0, DeviceDir::Compress, SubDir::None),
    range(0x02E0, DeviceDir::Compress, SubDir::Inbox),
    range(0x0300, DeviceDir::Compress, SubDir::Outbox),
    range(0x0320, DeviceDir::Compress, SubDir::Error),
    range(0x0340, DeviceDir::Compress, SubDir::Working),
    range(0x0360, DeviceDir::Decompress, SubDir::None),
    range(0x0380, DeviceDir::Decompress, SubDir::Inbox),
    range(0x03A0, DeviceDir::Decompress, SubDir::Outbox),
    range(0x03C0, DeviceDir::Decompress, SubDir::Error),
    range(0x03E0, DeviceDir::Decompress, SubDir::Working),
    range(0x0400, DeviceDir::Firmware, SubDir::None),
    range(0x0420, DeviceDir::Firmware, SubDir::Inbox),
    range(0x0440, DeviceDir::Firmware, SubDir::Outbox),
    range(0x0460, DeviceDir::Firmware, SubDir::Error),
    range(0x0480, DeviceDir::Firmware, SubDir::Working),
    range(0x04A0, DeviceDir::System, SubDir::None),
    range(0x04C0, DeviceDir::System, SubDir::FdrLogs),
    range(0x0700, DeviceDir::Root, SubDir::None),
];

/// Classifies a payload into its disposition.
pub fn classify(payload: &[u8]) -> MtDisposition {
    let msg_type = match message_type(payload) {
        Some(value) => value,
        // Too short to carry a type word; park it in the inbox.
        None => {
            return MtDisposition::Save {
                dir: DeviceDir::Modem,
                sub: SubDir::Inbox,
            }
        }
    };

    if let Some(command) = remote_command(msg_type, payload) {
        return MtDisposition::Remote(command);
    }

    for route in ROUTES {
        if (route.first..=route.first + TYPE_RANGE).contains(&msg_type) {
            return if route.copy_port3 {
                MtDisposition::SaveAndCopy {
                    dir: route.dir,
                    sub: route.sub,
                }
            } else {
                MtDisposition::Save {
                    dir: route.dir,
                    sub: route.sub,
                }
            };
        }
    }

    MtDisposition::Save {
        dir: DeviceDir::Modem,
        sub: SubDir::Inbox,
    }
}

fn remote_command(msg_type: u16, payload: &[u8]) -> Option<RemoteCommand> {
    Some(match msg_type {
        MT_RESET_SYSTEM => RemoteCommand::ResetSystem,
        MT_RESET_SYSTEM_IMMEDIATE => RemoteCommand::ResetSystemImmediate,
        MT_ACK_ACK => RemoteCommand::AckAck,
        MT_CONFIG_SNAPSHOT => RemoteCommand::ConfigSnapshot,
        MT_POWER_CYCLE_MODEM => RemoteCommand::PowerCycleModem,
        MT_FORMAT_CARD => RemoteCommand::FormatCard,
        MT_POWER_CYCLE_CIS => RemoteCommand::PowerCycleCis,
        MT_PURGE_RULES_IMAGE => RemoteCommand::PurgeRulesImage,
        MT_DELETE_RULES_FILE => RemoteCommand::DeleteRulesFile,
        MT_DOWNLOAD_CIS_CONFIG => RemoteCommand::DownloadCisConfig,
        MT_SYSTEM_LOG_SNAPSHOT => RemoteCommand::SystemLogSnapshot,
        MT_MODEM_LOG_SNAPSHOT => RemoteCommand::ModemLogSnapshot,
        MT_VERSION_SNAPSHOT => RemoteCommand::VersionSnapshot,
        MT_GPS_SNAPSHOT => RemoteCommand::GpsSnapshot,
        MT_RESET_DATA_BUS => RemoteCommand::ResetDataBus,
        MT_SEND_LOGS_NOW => RemoteCommand::SendLogsNow {
            option: request_option(payload),
        },
        MT_SEND_LOGS_AFTER_RECORDER => RemoteCommand::SendLogsAfterRecorder {
            option: request_option(payload),
        },
        _ => return None,
    })
}
