//! Header and AVP decoding.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::error::CodecError;
use super::{avp_code, avp_flags, command, flags, BASE_APPLICATION_ID, DIAMETER_VERSION, HEADER_LEN};

/// Fixed 20-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageHeader {
    pub version: u8,
    /// Total message length in bytes, header included.
    pub length: u32,
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop: u32,
    pub end_to_end: u32,
}

impl MessageHeader {
    pub fn is_request(&self) -> bool {
        self.flags & flags::REQUEST != 0
    }

    /// A Capabilities-Exchange-Request of the base protocol.
    pub fn is_capabilities_exchange_request(&self) -> bool {
        self.command_code == command::CAPABILITIES_EXCHANGE
            && self.application_id == BASE_APPLICATION_ID
            && self.is_request()
    }

    /// Decode the header at the start of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::malformed(format!(
                "{} bytes is shorter than the header",
                buf.len()
            )));
        }
        let version = buf.get_u8();
        if version != DIAMETER_VERSION {
            return Err(CodecError::malformed(format!("unsupported version {version}")));
        }
        let length = read_u24(&mut buf);
        let flags = buf.get_u8();
        let command_code = read_u24(&mut buf);
        Ok(Self {
            version,
            length,
            flags,
            command_code,
            application_id: buf.get_u32(),
            hop_by_hop: buf.get_u32(),
            end_to_end: buf.get_u32(),
        })
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.version);
        put_u24(out, self.length);
        out.put_u8(self.flags);
        put_u24(out, self.command_code);
        out.put_u32(self.application_id);
        out.put_u32(self.hop_by_hop);
        out.put_u32(self.end_to_end);
    }
}

/// One decoded attribute-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub data: Bytes,
}

impl Avp {
    pub fn is_mandatory(&self) -> bool {
        self.flags & avp_flags::MANDATORY != 0
    }

    /// Payload as UTF-8 (DiameterIdentity, UTF8String).
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Payload as Unsigned32 / Enumerated.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Payload as an Address (IPv4 or IPv6 family only).
    pub fn as_address(&self) -> Option<IpAddr> {
        let (family, addr) = self.data.split_first_chunk::<2>()?;
        match (u16::from_be_bytes(*family), addr.len()) {
            (1, 4) => {
                let octets: [u8; 4] = addr.try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            (2, 16) => {
                let octets: [u8; 16] = addr.try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

/// A decoded message. Keeps the original frame for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiameterMessage {
    pub header: MessageHeader,
    pub avps: Vec<Avp>,
    raw: Bytes,
}

impl DiameterMessage {
    /// Decode a complete frame.
    pub fn decode(raw: Bytes) -> Result<Self, CodecError> {
        let header = MessageHeader::decode(&raw)?;
        let declared = header.length as usize;
        if declared != raw.len() {
            return Err(CodecError::malformed(format!(
                "header declares {declared} bytes, frame holds {}",
                raw.len()
            )));
        }
        if declared % 4 != 0 {
            return Err(CodecError::malformed(format!(
                "length {declared} is not a multiple of 4"
            )));
        }

        let mut avps = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < raw.len() {
            let (avp, consumed) = decode_avp(&raw, offset)?;
            avps.push(avp);
            offset += consumed;
        }

        Ok(Self { header, avps, raw })
    }

    /// The frame this message was decoded from.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// First top-level AVP with `code`.
    pub fn find(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|avp| avp.code == code)
    }

    /// Number of top-level AVPs with `code`.
    pub fn count(&self, code: u32) -> usize {
        self.avps.iter().filter(|avp| avp.code == code).count()
    }

    pub fn origin_host(&self) -> Option<&str> {
        self.find(avp_code::ORIGIN_HOST).and_then(Avp::as_str)
    }

    pub fn origin_realm(&self) -> Option<&str> {
        self.find(avp_code::ORIGIN_REALM).and_then(Avp::as_str)
    }
}

fn decode_avp(raw: &Bytes, offset: usize) -> Result<(Avp, usize), CodecError> {
    let mut buf = &raw[offset..];
    if buf.len() < 8 {
        return Err(CodecError::malformed(format!("truncated AVP header at offset {offset}")));
    }
    let code = buf.get_u32();
    let flag_bits = buf.get_u8();
    let length = read_u24(&mut buf) as usize;

    let vendor_id = if flag_bits & avp_flags::VENDOR != 0 {
        if buf.len() < 4 {
            return Err(CodecError::malformed(format!("AVP {code}: truncated vendor id")));
        }
        Some(buf.get_u32())
    } else {
        None
    };
    let header_len = if vendor_id.is_some() { 12 } else { 8 };

    if length < header_len {
        return Err(CodecError::malformed(format!("AVP {code}: length {length} below header size")));
    }
    if offset + length > raw.len() {
        return Err(CodecError::malformed(format!(
            "AVP {code}: length {length} overruns the message"
        )));
    }

    let data = raw.slice(offset + header_len..offset + length);
    let padded = (length + 3) & !3;
    let consumed = padded.min(raw.len() - offset);
    Ok((
        Avp {
            code,
            flags: flag_bits,
            vendor_id,
            data,
        },
        consumed,
    ))
}

fn read_u24(buf: &mut &[u8]) -> u32 {
    let hi = buf.get_u8() as u32;
    let lo = buf.get_u16() as u32;
    (hi << 16) | lo
}

pub(crate) fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u16(value as u16);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageBuilder;

    #[test]
    fn decodes_header_fields() {
        let raw = MessageBuilder::request(command::DEVICE_WATCHDOG, 0)
            .hop_by_hop(0xdead_beef)
            .end_to_end(7)
            .build();
        let header = MessageHeader::decode(&raw).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.length as usize, raw.len());
        assert_eq!(header.command_code, command::DEVICE_WATCHDOG);
        assert_eq!(header.hop_by_hop, 0xdead_beef);
        assert_eq!(header.end_to_end, 7);
        assert!(header.is_request());
        assert!(!header.is_capabilities_exchange_request());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut raw = BytesMut::from(&MessageBuilder::request(280, 0).build()[..]);
        raw[0] = 2;
        assert!(matches!(
            MessageHeader::decode(&raw),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn decodes_avps_with_padding_and_vendor() {
        let raw = MessageBuilder::request(command::CAPABILITIES_EXCHANGE, 0)
            .avp_utf8(avp_code::ORIGIN_HOST, "a.example")
            .vendor_avp(1000, 10415, b"xy")
            .avp_u32(avp_code::VENDOR_ID, 10415)
            .build();
        let message = DiameterMessage::decode(raw).unwrap();

        assert_eq!(message.avps.len(), 3);
        assert_eq!(message.origin_host(), Some("a.example"));
        assert_eq!(message.avps[1].vendor_id, Some(10415));
        assert_eq!(&message.avps[1].data[..], b"xy");
        assert_eq!(message.find(avp_code::VENDOR_ID).and_then(Avp::as_u32), Some(10415));
    }

    #[test]
    fn address_avp_round_trips_both_families() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let raw = MessageBuilder::request(257, 0)
            .avp_address(avp_code::HOST_IP_ADDRESS, v4)
            .avp_address(avp_code::HOST_IP_ADDRESS, v6)
            .build();
        let message = DiameterMessage::decode(raw).unwrap();
        let addrs: Vec<_> = message.avps.iter().filter_map(Avp::as_address).collect();
        assert_eq!(addrs, vec![v4, v6]);
    }

    #[test]
    fn rejects_overrunning_avp() {
        let mut raw = BytesMut::from(
            &MessageBuilder::request(280, 0)
                .avp_utf8(avp_code::ORIGIN_HOST, "host")
                .build()[..],
        );
        // Low byte of the first AVP's length field.
        raw[HEADER_LEN + 7] = 0xff;
        assert!(matches!(
            DiameterMessage::decode(raw.freeze()),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut raw = BytesMut::from(&MessageBuilder::request(280, 0).build()[..]);
        raw.extend_from_slice(&[0, 0, 0, 0]);
        assert!(DiameterMessage::decode(raw.freeze()).is_err());
    }
}
