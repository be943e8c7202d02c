//! PTP message wire formats
//!
//! The 34-byte common header plus the message bodies this crate speaks:
//! Sync, Follow-Up, Delay-Req, Delay-Resp, and Announce. Timestamps are
//! the 10-byte seconds/nanoseconds pair; the sub-nanosecond residual
//! travels in the header's correctionField. Unknown TLVs in a message
//! suffix are skipped by length, per the standard.

use getset::CopyGetters;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::time::{Time, SUBNS_PER_NSEC};

pub const HEADER_LEN: usize = 34;
pub const PTP_VERSION: u8 = 2;

/// Codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum WireError {
    #[cfg_attr(feature = "std", error("a buffer is too short"))]
    BufferTooShort,
    #[cfg_attr(feature = "std", error("unrecognized enum value"))]
    EnumConversion,
    #[cfg_attr(feature = "std", error("inconsistent length field"))]
    BadLength,
}

impl<E: num_enum::TryFromPrimitive> From<num_enum::TryFromPrimitiveError<E>> for WireError {
    fn from(_: num_enum::TryFromPrimitiveError<E>) -> Self {
        WireError::EnumConversion
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    FollowUp = 0x8,
    DelayResp = 0x9,
    Announce = 0xB,
}

impl MessageType {
    /// Event messages are timestamped at the wire; general messages are
    /// not.
    pub fn is_event(&self) -> bool {
        matches!(self, MessageType::Sync | MessageType::DelayReq)
    }
}

/// EUI-64 clock identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// Derive from a MAC address per the EUI-64 mapping.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5]])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl PortIdentity {
    fn serialize(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.clock_identity.0);
        buf[8..10].copy_from_slice(&self.port_number.to_be_bytes());
    }

    fn deserialize(buf: &[u8]) -> Self {
        PortIdentity {
            clock_identity: ClockIdentity(buf[0..8].try_into().unwrap()),
            port_number: u16::from_be_bytes(buf[8..10].try_into().unwrap()),
        }
    }
}

fn write_timestamp(buf: &mut [u8], t: Time) {
    buf[0..6].copy_from_slice(&t.field_secs().to_be_bytes()[2..8]);
    buf[6..10].copy_from_slice(&t.field_nsec().to_be_bytes());
}

fn read_timestamp(buf: &[u8]) -> Time {
    let mut secs = [0u8; 8];
    secs[2..8].copy_from_slice(&buf[0..6]);
    let nanos = u32::from_be_bytes(buf[6..10].try_into().unwrap());
    Time::from_fields(u64::from_be_bytes(secs), nanos, 0)
}

/// Common message header.
///
/// The correction field is carried as a [Time] (it is a signed
/// subnanosecond count on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Header {
    pub(crate) domain: u8,
    pub(crate) two_step: bool,
    pub(crate) correction: Time,
    pub(crate) source_port_identity: PortIdentity,
    pub(crate) sequence_id: u16,
    pub(crate) log_message_interval: i8,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            domain: 0,
            two_step: false,
            correction: Time::ZERO,
            source_port_identity: PortIdentity::default(),
            sequence_id: 0,
            log_message_interval: 0x7F,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeserializedHeader {
    pub header: Header,
    pub message_type: MessageType,
    pub message_length: u16,
}

impl Header {
    fn serialize_header(
        &self,
        content_type: MessageType,
        content_len: usize,
        buf: &mut [u8],
    ) -> Result<(), WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::BufferTooShort);
        }
        buf[..HEADER_LEN].fill(0);
        buf[0] = u8::from(content_type) & 0x0F;
        buf[1] = PTP_VERSION;
        buf[2..4].copy_from_slice(&((HEADER_LEN + content_len) as u16).to_be_bytes());
        buf[4] = self.domain;
        buf[6] = (self.two_step as u8) << 1;
        let correction_subns = self.correction.delta_subns();
        buf[8..16].copy_from_slice(&correction_subns.to_be_bytes());
        self.source_port_identity.serialize(&mut buf[20..30]);
        buf[30..32].copy_from_slice(&self.sequence_id.to_be_bytes());
        buf[32] = control_field(content_type);
        buf[33] = self.log_message_interval as u8;
        Ok(())
    }

    pub fn deserialize_header(buf: &[u8]) -> Result<DeserializedHeader, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::BufferTooShort);
        }
        let message_type = MessageType::try_from(buf[0] & 0x0F)?;
        let correction = i64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok(DeserializedHeader {
            header: Header {
                domain: buf[4],
                two_step: buf[6] & 0x02 != 0,
                correction: Time::from_subns(correction),
                source_port_identity: PortIdentity::deserialize(&buf[20..30]),
                sequence_id: u16::from_be_bytes(buf[30..32].try_into().unwrap()),
                log_message_interval: buf[33] as i8,
            },
            message_type,
            message_length: u16::from_be_bytes(buf[2..4].try_into().unwrap()),
        })
    }
}

/// Legacy control field, kept for v1 interoperability.
fn control_field(t: MessageType) -> u8 {
    match t {
        MessageType::Sync => 0x00,
        MessageType::DelayReq => 0x01,
        MessageType::FollowUp => 0x02,
        MessageType::DelayResp => 0x03,
        MessageType::Announce => 0x05,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMessage {
    pub origin_timestamp: Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowUpMessage {
    pub precise_origin_timestamp: Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayReqMessage {
    pub origin_timestamp: Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRespMessage {
    pub receive_timestamp: Time,
    pub requesting_port_identity: PortIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceMessage {
    pub origin_timestamp: Time,
    pub current_utc_offset: i16,
    pub grandmaster_priority_1: u8,
    pub grandmaster_clock_quality: u32,
    pub grandmaster_priority_2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody {
    Sync(SyncMessage),
    DelayReq(DelayReqMessage),
    FollowUp(FollowUpMessage),
    DelayResp(DelayRespMessage),
    Announce(AnnounceMessage),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Sync(_) => MessageType::Sync,
            MessageBody::DelayReq(_) => MessageType::DelayReq,
            MessageBody::FollowUp(_) => MessageType::FollowUp,
            MessageBody::DelayResp(_) => MessageType::DelayResp,
            MessageBody::Announce(_) => MessageType::Announce,
        }
    }

    fn wire_size(&self) -> usize {
        match self {
            MessageBody::Sync(_) | MessageBody::DelayReq(_) | MessageBody::FollowUp(_) => 10,
            MessageBody::DelayResp(_) => 20,
            MessageBody::Announce(_) => 30,
        }
    }

    fn serialize(&self, buf: &mut [u8]) {
        match self {
            MessageBody::Sync(m) => write_timestamp(buf, m.origin_timestamp),
            MessageBody::DelayReq(m) => write_timestamp(buf, m.origin_timestamp),
            MessageBody::FollowUp(m) => write_timestamp(buf, m.precise_origin_timestamp),
            MessageBody::DelayResp(m) => {
                write_timestamp(buf, m.receive_timestamp);
                m.requesting_port_identity.serialize(&mut buf[10..20]);
            }
            MessageBody::Announce(m) => {
                write_timestamp(buf, m.origin_timestamp);
                buf[10..12].copy_from_slice(&m.current_utc_offset.to_be_bytes());
                buf[13] = m.grandmaster_priority_1;
                buf[14..18].copy_from_slice(&m.grandmaster_clock_quality.to_be_bytes());
                buf[18] = m.grandmaster_priority_2;
                buf[19..27].copy_from_slice(&m.grandmaster_identity.0);
                buf[27..29].copy_from_slice(&m.steps_removed.to_be_bytes());
                buf[29] = m.time_source;
            }
        }
    }

    fn deserialize(t: MessageType, buf: &[u8]) -> Result<Self, WireError> {
        let need = match t {
            MessageType::Sync | MessageType::DelayReq | MessageType::FollowUp => 10,
            MessageType::DelayResp => 20,
            MessageType::Announce => 30,
        };
        if buf.len() < need {
            return Err(WireError::BufferTooShort);
        }
        Ok(match t {
            MessageType::Sync => MessageBody::Sync(SyncMessage {
                origin_timestamp: read_timestamp(buf),
            }),
            MessageType::DelayReq => MessageBody::DelayReq(DelayReqMessage {
                origin_timestamp: read_timestamp(buf),
            }),
            MessageType::FollowUp => MessageBody::FollowUp(FollowUpMessage {
                precise_origin_timestamp: read_timestamp(buf),
            }),
            MessageType::DelayResp => MessageBody::DelayResp(DelayRespMessage {
                receive_timestamp: read_timestamp(buf),
                requesting_port_identity: PortIdentity::deserialize(&buf[10..20]),
            }),
            MessageType::Announce => MessageBody::Announce(AnnounceMessage {
                origin_timestamp: read_timestamp(buf),
                current_utc_offset: i16::from_be_bytes(buf[10..12].try_into().unwrap()),
                grandmaster_priority_1: buf[13],
                grandmaster_clock_quality: u32::from_be_bytes(buf[14..18].try_into().unwrap()),
                grandmaster_priority_2: buf[18],
                grandmaster_identity: ClockIdentity(buf[19..27].try_into().unwrap()),
                steps_removed: u16::from_be_bytes(buf[27..29].try_into().unwrap()),
                time_source: buf[29],
            }),
        })
    }
}

/// A complete message; `suffix` is the raw TLV region, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub header: Header,
    pub body: MessageBody,
    pub suffix: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn deserialize(buf: &'a [u8]) -> Result<Self, WireError> {
        let d = Header::deserialize_header(buf)?;
        let total = d.message_length as usize;
        if total < HEADER_LEN || total > buf.len() {
            return Err(WireError::BadLength);
        }
        let body = MessageBody::deserialize(d.message_type, &buf[HEADER_LEN..total])?;
        let body_len = body.wire_size();
        Ok(Message {
            header: d.header,
            body,
            suffix: &buf[HEADER_LEN + body_len..total],
        })
    }

    /// Serialize without TLVs; returns the wire length.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        let body_len = self.body.wire_size();
        let total = HEADER_LEN + body_len;
        if buf.len() < total {
            return Err(WireError::BufferTooShort);
        }
        self.header
            .serialize_header(self.body.message_type(), body_len, buf)?;
        buf[HEADER_LEN..total].fill(0);
        self.body.serialize(&mut buf[HEADER_LEN..total]);
        Ok(total)
    }

    /// Iterate the suffix TLVs, skipping malformed tails.
    pub fn tlvs(&self) -> TlvIter<'a> {
        TlvIter { rest: self.suffix }
    }
}

/// One type-length-value entry from a message suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tlv_type: u16,
    pub value: &'a [u8],
}

pub struct TlvIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Tlv<'a>> {
        if self.rest.len() < 4 {
            return None;
        }
        let tlv_type = u16::from_be_bytes(self.rest[0..2].try_into().unwrap());
        let len = u16::from_be_bytes(self.rest[2..4].try_into().unwrap()) as usize;
        if self.rest.len() < 4 + len {
            self.rest = &[];
            return None; // Truncated TLV: skip the tail.
        }
        let value = &self.rest[4..4 + len];
        self.rest = &self.rest[4 + len..];
        Some(Tlv { tlv_type, value })
    }
}

/// Convert a header correction plus timestamp into full-precision time.
pub fn timestamp_with_correction(ts: Time, correction: Time) -> Time {
    ts + correction
}

/// The sub-nanosecond residual of `t`, as a correction-field [Time].
pub fn residual_correction(t: Time) -> Time {
    Time::from_subns((t.field_subns() % SUBNS_PER_NSEC as u64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: MessageBody, header: Header) -> Message<'static> {
        Message { header, body, suffix: &[] }
    }

    #[test]
    fn sync_roundtrip() {
        let m = msg(
            MessageBody::Sync(SyncMessage {
                origin_timestamp: Time::from_fields(0x0000_0012_3456, 0x0ABC_DEF0, 0),
            }),
            Header {
                domain: 3,
                two_step: true,
                correction: Time::from_subns(0x1234),
                source_port_identity: PortIdentity {
                    clock_identity: ClockIdentity([1, 2, 3, 4, 5, 6, 7, 8]),
                    port_number: 2,
                },
                sequence_id: 0xBEEF,
                log_message_interval: -3,
            },
        );
        let mut buf = [0u8; 64];
        let n = m.serialize(&mut buf).unwrap();
        assert_eq!(n, 44);
        let parsed = Message::deserialize(&buf[..n]).unwrap();
        assert_eq!(parsed, m);
        assert_eq!(buf[0] & 0x0F, 0x0);
        assert_eq!(buf[1], PTP_VERSION);
        assert_eq!(&buf[2..4], &44u16.to_be_bytes());
        assert!(buf[6] & 0x02 != 0);
    }

    #[test]
    fn delay_resp_roundtrip() {
        let m = msg(
            MessageBody::DelayResp(DelayRespMessage {
                receive_timestamp: Time::from_fields(7, 500, 0),
                requesting_port_identity: PortIdentity {
                    clock_identity: ClockIdentity([9; 8]),
                    port_number: 1,
                },
            }),
            Header::default(),
        );
        let mut buf = [0u8; 64];
        let n = m.serialize(&mut buf).unwrap();
        assert_eq!(n, 54);
        assert_eq!(Message::deserialize(&buf[..n]).unwrap(), m);
    }

    #[test]
    fn announce_roundtrip() {
        let m = msg(
            MessageBody::Announce(AnnounceMessage {
                origin_timestamp: Time::ZERO,
                current_utc_offset: 37,
                grandmaster_priority_1: 128,
                grandmaster_clock_quality: 0xF8FE_436A,
                grandmaster_priority_2: 128,
                grandmaster_identity: ClockIdentity([0xAB; 8]),
                steps_removed: 1,
                time_source: 0xA0,
            }),
            Header::default(),
        );
        let mut buf = [0u8; 80];
        let n = m.serialize(&mut buf).unwrap();
        assert_eq!(n, 64);
        assert_eq!(Message::deserialize(&buf[..n]).unwrap(), m);
    }

    #[test]
    fn negative_correction_field() {
        let m = msg(
            MessageBody::Sync(SyncMessage { origin_timestamp: Time::ZERO }),
            Header {
                correction: Time::from_subns(-65_536),
                ..Header::default()
            },
        );
        let mut buf = [0u8; 64];
        let n = m.serialize(&mut buf).unwrap();
        assert_eq!(
            &buf[8..16],
            &(-65_536i64).to_be_bytes(),
            "correction is a signed subns count"
        );
        let parsed = Message::deserialize(&buf[..n]).unwrap();
        assert_eq!(parsed.header.correction(), Time::from_subns(-65_536));
    }

    #[test]
    fn unknown_tlvs_skipped() {
        let m = msg(
            MessageBody::Sync(SyncMessage { origin_timestamp: Time::ZERO }),
            Header::default(),
        );
        let mut buf = [0u8; 80];
        let n = m.serialize(&mut buf).unwrap();
        // Append two TLVs and patch the length field.
        buf[n..n + 4].copy_from_slice(&[0x80, 0x01, 0x00, 0x02]);
        buf[n + 4..n + 6].copy_from_slice(&[0xAA, 0xBB]);
        buf[n + 6..n + 10].copy_from_slice(&[0x80, 0x02, 0x00, 0x00]);
        let total = n + 10;
        buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());

        let parsed = Message::deserialize(&buf[..total]).unwrap();
        let tlvs: alloc::vec::Vec<Tlv> = parsed.tlvs().collect();
        assert_eq!(tlvs.len(), 2);
        assert_eq!(tlvs[0].tlv_type, 0x8001);
        assert_eq!(tlvs[0].value, &[0xAA, 0xBB]);
        assert_eq!(tlvs[1].value.len(), 0);
    }

    #[test]
    fn truncated_and_garbage_rejected() {
        assert_eq!(
            Message::deserialize(&[0u8; 10]),
            Err(WireError::BufferTooShort)
        );
        let mut buf = [0u8; 44];
        let m = msg(
            MessageBody::Sync(SyncMessage { origin_timestamp: Time::ZERO }),
            Header::default(),
        );
        m.serialize(&mut buf).unwrap();
        buf[0] = 0x07; // unassigned message type
        assert_eq!(Message::deserialize(&buf), Err(WireError::EnumConversion));
        m.serialize(&mut buf).unwrap();
        buf[2..4].copy_from_slice(&200u16.to_be_bytes()); // length beyond buffer
        assert_eq!(Message::deserialize(&buf), Err(WireError::BadLength));
    }
}
