//! Wire format shared by every datagram.
//!
//! # Wire Format
//!
//! Each datagram is a fixed 35-byte little-endian header followed by at most
//! `max_packet_size - HEADER_SIZE` payload bytes:
//!
//! ```text
//! ┌───────────┬────────────┬────────────┬─────────────┬──────────────────┐
//! │ sender(4) │ msg_id(4)  │ total(4)   │ offset(4)   │ created_ns(8)    │
//! ├───────────┼────────────┼────────────┼─────────────┼──────────────────┤
//! │ count(2)  │ index(2)   │ size(2)    │ crc32(4)    │ type(1)          │
//! └───────────┴────────────┴────────────┴─────────────┴──────────────────┘
//! ```
//!
//! - `total` counts the whole payload plus one header per fragment.
//! - `size` is the length of this datagram, header included.
//! - `crc32` covers the header (with this field zeroed) and the payload.
//!   Zero means the sender did not compute one.
//!
//! Control payloads are tiny fixed layouts ([`Command`], [`Feedback`]) except
//! [`UdpConnectionSettings`], which is postcard-encoded.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoded size of [`WireHeader`].
pub const HEADER_SIZE: usize = 35;

/// Default datagram size, header included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 9000;

/// Largest datagram the header's `u16` size field can describe.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Per-type message ids wrap to zero once they pass this value.
pub const MAX_MESSAGE_ID: i32 = 1_000_000;

const CHECKSUM_OFFSET: usize = 30;

/// Kind of message carried by a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i8)]
pub enum MessageType {
    InitConnection = 0,
    UpdateDeviceSettings = 1,
    UpdateColorSettings = 2,
    UpdateFiltersSettings = 3,
    UpdateMiscSettings = 4,
    DataFrame = 5,
    Command = 6,
    Feedback = 7,
    Synchro = 8,
    Ping = 9,
}

impl MessageType {
    pub const ALL: [Self; 10] = [
        Self::InitConnection,
        Self::UpdateDeviceSettings,
        Self::UpdateColorSettings,
        Self::UpdateFiltersSettings,
        Self::UpdateMiscSettings,
        Self::DataFrame,
        Self::Command,
        Self::Feedback,
        Self::Synchro,
        Self::Ping,
    ];

    #[must_use]
    pub const fn as_i8(self) -> i8 {
        self as i8
    }

    /// Messages that the receiving side must acknowledge with feedback.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            Self::InitConnection
                | Self::UpdateDeviceSettings
                | Self::UpdateColorSettings
                | Self::UpdateFiltersSettings
                | Self::UpdateMiscSettings
                | Self::Command
        )
    }

    #[must_use]
    pub const fn is_settings(self) -> bool {
        matches!(
            self,
            Self::UpdateDeviceSettings
                | Self::UpdateColorSettings
                | Self::UpdateFiltersSettings
                | Self::UpdateMiscSettings
        )
    }
}

impl TryFrom<i8> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        usize::try_from(v)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(ProtocolError::UnknownMessageType(v))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitConnection => "init_connection",
            Self::UpdateDeviceSettings => "update_device_settings",
            Self::UpdateColorSettings => "update_color_settings",
            Self::UpdateFiltersSettings => "update_filters_settings",
            Self::UpdateMiscSettings => "update_misc_settings",
            Self::DataFrame => "data_frame",
            Self::Command => "command",
            Self::Feedback => "feedback",
            Self::Synchro => "synchro",
            Self::Ping => "ping",
        };
        f.write_str(name)
    }
}

/// Session commands, carried as a one-byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Disconnect = 0,
    Quit = 1,
    Shutdown = 2,
    Restart = 3,
}

impl Command {
    /// # Errors
    ///
    /// Fails on an empty payload or an unknown command byte.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.first() {
            Some(0) => Ok(Self::Disconnect),
            Some(1) => Ok(Self::Quit),
            Some(2) => Ok(Self::Shutdown),
            Some(3) => Ok(Self::Restart),
            Some(&other) => Err(ProtocolError::UnknownCommand(other)),
            None => Err(ProtocolError::BufferTooSmall { need: 1, have: 0 }),
        }
    }

    #[must_use]
    pub const fn encode(self) -> [u8; 1] {
        [self as u8]
    }

    /// Feedback kind that acknowledges this command.
    #[must_use]
    pub const fn feedback_kind(self) -> FeedbackKind {
        match self {
            Self::Disconnect => FeedbackKind::Disconnect,
            Self::Quit => FeedbackKind::Quit,
            Self::Shutdown => FeedbackKind::Shutdown,
            Self::Restart => FeedbackKind::Restart,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeedbackKind {
    MessageReceived = 0,
    Timeout = 1,
    Disconnect = 2,
    Quit = 3,
    Shutdown = 4,
    Restart = 5,
}

impl TryFrom<u8> for FeedbackKind {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::MessageReceived),
            1 => Ok(Self::Timeout),
            2 => Ok(Self::Disconnect),
            3 => Ok(Self::Quit),
            4 => Ok(Self::Shutdown),
            5 => Ok(Self::Restart),
            other => Err(ProtocolError::UnknownFeedback(other)),
        }
    }
}

impl FeedbackKind {
    /// Whether this acknowledgement closes the session.
    #[must_use]
    pub const fn ends_session(self) -> bool {
        matches!(
            self,
            Self::Disconnect | Self::Quit | Self::Shutdown | Self::Restart
        )
    }
}

/// Acknowledgement of a received control message.
///
/// `received` keeps the raw type byte so an unknown type can still be
/// acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Feedback {
    pub received: i8,
    pub kind: FeedbackKind,
}

impl Feedback {
    pub const ENCODED_LEN: usize = 2;

    #[must_use]
    pub const fn new(received: MessageType, kind: FeedbackKind) -> Self {
        Self {
            received: received.as_i8(),
            kind,
        }
    }

    /// The acknowledged type, if it is one this side knows.
    #[must_use]
    pub fn received_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.received).ok()
    }

    #[must_use]
    pub const fn encode(self) -> [u8; 2] {
        [self.received.to_le_bytes()[0], self.kind as u8]
    }

    /// # Errors
    ///
    /// Fails if the payload is shorter than two bytes or the kind is unknown.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let [received, kind, ..] = payload else {
            return Err(ProtocolError::BufferTooSmall {
                need: Self::ENCODED_LEN,
                have: payload.len(),
            });
        };
        Ok(Self {
            received: i8::from_le_bytes([*received]),
            kind: FeedbackKind::try_from(*kind)?,
        })
    }
}

/// Where and how a peer wants to receive replies.
///
/// Carried by `init_connection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpConnectionSettings {
    /// Reading address of the peer. Empty means "the address you saw me from".
    pub address: String,
    pub port: u16,
    pub max_packet_size: u16,
}

impl UdpConnectionSettings {
    /// # Errors
    ///
    /// Returns [`ProtocolError::Settings`] if postcard fails to encode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::Settings`] on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Errors raised while decoding or validating datagrams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("declared packet size {declared} does not match datagram length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("header declares zero packets")]
    ZeroPackets,
    #[error("packet index {index} out of range for {total} packets")]
    PacketIndexOutOfRange { index: u16, total: u16 },
    #[error("total size {total_size} cannot hold {packets} headers")]
    TotalSizeTooSmall { total_size: u32, packets: u16 },
    #[error("fragment [{offset}, {offset}+{len}) exceeds message data size {data_size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        data_size: usize,
    },
    #[error("checksum mismatch: header says {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("checksum required but missing")]
    MissingChecksum,
    #[error("unknown message type: {0}")]
    UnknownMessageType(i8),
    #[error("unknown command: 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("unknown feedback kind: 0x{0:02x}")]
    UnknownFeedback(u8),
    #[error("invalid connection settings: {0}")]
    Settings(#[from] postcard::Error),
}

/// Fixed header prefixed to every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub sender_id: u32,
    pub message_id: i32,
    pub total_size_bytes: u32,
    pub data_offset: u32,
    pub creation_timestamp_ns: i64,
    pub total_number_packets: u16,
    pub current_packet_id: u16,
    pub current_packet_size_bytes: u16,
    pub checksum: u32,
    pub message_type: i8,
}

impl WireHeader {
    /// Payload bytes of the whole message, excluding per-fragment headers.
    #[must_use]
    pub const fn data_size(&self) -> usize {
        (self.total_size_bytes as usize)
            .saturating_sub(self.total_number_packets as usize * HEADER_SIZE)
    }

    /// Payload bytes carried by this datagram.
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        (self.current_packet_size_bytes as usize).saturating_sub(HEADER_SIZE)
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownMessageType`] for ids this side
    /// does not know.
    pub fn kind(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.message_type)
    }

    /// Writes the header into the first [`HEADER_SIZE`] bytes of `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`HEADER_SIZE`].
    pub fn write_to(&self, out: &mut [u8]) {
        let mut w = HeaderWriter {
            buf: &mut out[..HEADER_SIZE],
            cursor: 0,
        };
        w.put(&self.sender_id.to_le_bytes());
        w.put(&self.message_id.to_le_bytes());
        w.put(&self.total_size_bytes.to_le_bytes());
        w.put(&self.data_offset.to_le_bytes());
        w.put(&self.creation_timestamp_ns.to_le_bytes());
        w.put(&self.total_number_packets.to_le_bytes());
        w.put(&self.current_packet_id.to_le_bytes());
        w.put(&self.current_packet_size_bytes.to_le_bytes());
        w.put(&self.checksum.to_le_bytes());
        w.put(&self.message_type.to_le_bytes());
    }

    /// Decodes a header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferTooSmall`] for short input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let mut r = HeaderReader { buf: bytes, cursor: 0 };
        Ok(Self {
            sender_id: u32::from_le_bytes(r.take()),
            message_id: i32::from_le_bytes(r.take()),
            total_size_bytes: u32::from_le_bytes(r.take()),
            data_offset: u32::from_le_bytes(r.take()),
            creation_timestamp_ns: i64::from_le_bytes(r.take()),
            total_number_packets: u16::from_le_bytes(r.take()),
            current_packet_id: u16::from_le_bytes(r.take()),
            current_packet_size_bytes: u16::from_le_bytes(r.take()),
            checksum: u32::from_le_bytes(r.take()),
            message_type: i8::from_le_bytes(r.take()),
        })
    }

    /// Checks the structural invariants of a fragment header.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn check_bounds(&self) -> Result<(), ProtocolError> {
        if self.total_number_packets == 0 {
            return Err(ProtocolError::ZeroPackets);
        }
        if self.current_packet_id >= self.total_number_packets {
            return Err(ProtocolError::PacketIndexOutOfRange {
                index: self.current_packet_id,
                total: self.total_number_packets,
            });
        }
        if (self.total_size_bytes as usize) < self.total_number_packets as usize * HEADER_SIZE {
            return Err(ProtocolError::TotalSizeTooSmall {
                total_size: self.total_size_bytes,
                packets: self.total_number_packets,
            });
        }
        let offset = self.data_offset as usize;
        let len = self.payload_len();
        let data_size = self.data_size();
        if offset.checked_add(len).is_none_or(|end| end > data_size) {
            return Err(ProtocolError::OutOfBounds {
                offset,
                len,
                data_size,
            });
        }
        Ok(())
    }
}

/// CRC32 over `datagram` with the checksum field treated as zero.
///
/// Never returns zero, which is reserved for "not computed".
///
/// # Panics
///
/// Panics if `datagram` is shorter than [`HEADER_SIZE`].
#[must_use]
pub fn compute_checksum(datagram: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&datagram[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&datagram[CHECKSUM_OFFSET + 4..]);
    match hasher.finalize() {
        0 => 1,
        crc => crc,
    }
}

/// Stamps the checksum of an encoded datagram in place.
pub fn seal_checksum(datagram: &mut [u8]) {
    let crc = compute_checksum(datagram);
    datagram[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
}

/// Decodes and validates one received datagram.
///
/// Returns the header and the payload slice on success.
///
/// # Errors
///
/// Any header, size, bounds or checksum violation.
pub fn parse_datagram(
    datagram: &[u8],
    require_checksum: bool,
) -> Result<(WireHeader, &[u8]), ProtocolError> {
    let header = WireHeader::decode(datagram)?;
    let declared = header.current_packet_size_bytes as usize;
    if declared != datagram.len() {
        return Err(ProtocolError::SizeMismatch {
            declared,
            actual: datagram.len(),
        });
    }
    header.check_bounds()?;

    if header.checksum != 0 {
        let computed = compute_checksum(datagram);
        if computed != header.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: header.checksum,
                computed,
            });
        }
    } else if require_checksum {
        return Err(ProtocolError::MissingChecksum);
    }

    Ok((header, &datagram[HEADER_SIZE..]))
}

struct HeaderWriter<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl HeaderWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
    }
}

/// Reader over a buffer already checked to hold a full header.
struct HeaderReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl HeaderReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        arr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload_len: usize) -> WireHeader {
        WireHeader {
            sender_id: 0xA1B2_C3D4,
            message_id: 42,
            total_size_bytes: (HEADER_SIZE + payload_len) as u32,
            data_offset: 0,
            creation_timestamp_ns: 1_700_000_000_123_456_789,
            total_number_packets: 1,
            current_packet_id: 0,
            current_packet_size_bytes: (HEADER_SIZE + payload_len) as u16,
            checksum: 0,
            message_type: MessageType::DataFrame.as_i8(),
        }
    }

    fn datagram(h: &WireHeader, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
        h.write_to(&mut buf);
        buf[HEADER_SIZE..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn header_field_layout_is_little_endian() {
        let h = header(0);
        let mut buf = [0u8; HEADER_SIZE];
        h.write_to(&mut buf);
        assert_eq!(&buf[0..4], &0xA1B2_C3D4u32.to_le_bytes());
        assert_eq!(&buf[4..8], &42i32.to_le_bytes());
        assert_eq!(&buf[16..24], &h.creation_timestamp_ns.to_le_bytes());
        assert_eq!(buf[34], 5);
        assert_eq!(WireHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn decode_short_buffer() {
        assert!(matches!(
            WireHeader::decode(&[0u8; 10]),
            Err(ProtocolError::BufferTooSmall { need: HEADER_SIZE, have: 10 })
        ));
    }

    #[test]
    fn parse_rejects_size_mismatch() {
        let h = header(4);
        let mut buf = datagram(&h, b"abcd");
        buf.push(0);
        assert!(matches!(
            parse_datagram(&buf, false),
            Err(ProtocolError::SizeMismatch { declared: 39, actual: 40 })
        ));
    }

    #[test]
    fn parse_rejects_bad_bounds() {
        let mut h = header(4);
        h.total_number_packets = 0;
        assert!(matches!(
            parse_datagram(&datagram(&h, b"abcd"), false),
            Err(ProtocolError::ZeroPackets)
        ));

        let mut h = header(4);
        h.current_packet_id = 1;
        assert!(matches!(
            parse_datagram(&datagram(&h, b"abcd"), false),
            Err(ProtocolError::PacketIndexOutOfRange { index: 1, total: 1 })
        ));

        let mut h = header(4);
        h.data_offset = 1;
        assert!(matches!(
            parse_datagram(&datagram(&h, b"abcd"), false),
            Err(ProtocolError::OutOfBounds { offset: 1, len: 4, data_size: 4 })
        ));
    }

    #[test]
    fn checksum_detects_corruption() {
        let h = header(5);
        let mut buf = datagram(&h, b"frame");
        seal_checksum(&mut buf);
        let (parsed, payload) = parse_datagram(&buf, true).unwrap();
        assert_ne!(parsed.checksum, 0);
        assert_eq!(payload, b"frame");

        buf[HEADER_SIZE + 2] ^= 0xFF;
        assert!(matches!(
            parse_datagram(&buf, false),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_checksum_only_fails_when_required() {
        let buf = datagram(&header(3), b"abc");
        assert!(parse_datagram(&buf, false).is_ok());
        assert!(matches!(
            parse_datagram(&buf, true),
            Err(ProtocolError::MissingChecksum)
        ));
    }

    #[test]
    fn message_type_ids() {
        for (i, ty) in MessageType::ALL.iter().enumerate() {
            assert_eq!(ty.as_i8() as usize, i);
            assert_eq!(MessageType::try_from(ty.as_i8()).unwrap(), *ty);
        }
        assert!(matches!(
            MessageType::try_from(42),
            Err(ProtocolError::UnknownMessageType(42))
        ));
        assert!(MessageType::try_from(-1).is_err());
        assert!(MessageType::Command.is_control());
        assert!(!MessageType::Synchro.is_control());
    }

    #[test]
    fn command_and_feedback_payloads() {
        assert_eq!(Command::decode(&Command::Restart.encode()).unwrap(), Command::Restart);
        assert!(matches!(Command::decode(&[9]), Err(ProtocolError::UnknownCommand(9))));
        assert!(Command::decode(&[]).is_err());

        let fb = Feedback::new(MessageType::Command, FeedbackKind::Disconnect);
        assert_eq!(fb.encode(), [6, 2]);
        assert_eq!(Feedback::decode(&fb.encode()).unwrap(), fb);
        assert_eq!(fb.received_type(), Some(MessageType::Command));
        assert!(Feedback::decode(&[6]).is_err());
        assert!(matches!(Feedback::decode(&[6, 77]), Err(ProtocolError::UnknownFeedback(77))));
    }

    #[test]
    fn connection_settings_postcard() {
        let settings = UdpConnectionSettings {
            address: "192.168.1.10".into(),
            port: 8889,
            max_packet_size: 9000,
        };
        let bytes = settings.to_bytes().unwrap();
        assert_eq!(UdpConnectionSettings::from_bytes(&bytes).unwrap(), settings);
        assert!(UdpConnectionSettings::from_bytes(&[0xFF]).is_err());
    }
}
