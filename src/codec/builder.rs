//! Message encoding.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use super::message::{put_u24, MessageHeader};
use super::{avp_code, avp_flags, command, flags, BASE_APPLICATION_ID, DIAMETER_VERSION, HEADER_LEN};

static NEXT_HOP_BY_HOP: AtomicU32 = AtomicU32::new(1);

/// Incremental builder for one Diameter message.
///
/// AVPs are appended in call order and padded to 4 bytes; `build` fills in
/// the header length.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    flags: u8,
    command_code: u32,
    application_id: u32,
    hop_by_hop: u32,
    end_to_end: u32,
    avps: BytesMut,
}

impl MessageBuilder {
    pub fn request(command_code: u32, application_id: u32) -> Self {
        Self::with_flags(flags::REQUEST, command_code, application_id)
    }

    pub fn answer(command_code: u32, application_id: u32) -> Self {
        Self::with_flags(0, command_code, application_id)
    }

    fn with_flags(flags: u8, command_code: u32, application_id: u32) -> Self {
        let id = NEXT_HOP_BY_HOP.fetch_add(1, Ordering::Relaxed);
        Self {
            flags,
            command_code,
            application_id,
            hop_by_hop: id,
            end_to_end: id,
            avps: BytesMut::new(),
        }
    }

    /// A CER carrying every AVP the base grammar requires.
    pub fn capabilities_exchange_request(origin_host: &str, origin_realm: &str, host_ip: IpAddr) -> Self {
        Self::request(command::CAPABILITIES_EXCHANGE, BASE_APPLICATION_ID)
            .avp_utf8(avp_code::ORIGIN_HOST, origin_host)
            .avp_utf8(avp_code::ORIGIN_REALM, origin_realm)
            .avp_address(avp_code::HOST_IP_ADDRESS, host_ip)
            .avp_u32(avp_code::VENDOR_ID, 0)
            .avp_utf8(avp_code::PRODUCT_NAME, env!("CARGO_PKG_NAME"))
    }

    pub fn device_watchdog_request(origin_host: &str, origin_realm: &str) -> Self {
        Self::request(command::DEVICE_WATCHDOG, BASE_APPLICATION_ID)
            .avp_utf8(avp_code::ORIGIN_HOST, origin_host)
            .avp_utf8(avp_code::ORIGIN_REALM, origin_realm)
    }

    pub fn hop_by_hop(mut self, id: u32) -> Self {
        self.hop_by_hop = id;
        self
    }

    pub fn end_to_end(mut self, id: u32) -> Self {
        self.end_to_end = id;
        self
    }

    /// Append an AVP with the mandatory bit set.
    pub fn avp_bytes(self, code: u32, data: &[u8]) -> Self {
        self.push_avp(code, avp_flags::MANDATORY, None, data)
    }

    pub fn avp_utf8(self, code: u32, value: &str) -> Self {
        self.avp_bytes(code, value.as_bytes())
    }

    pub fn avp_u32(self, code: u32, value: u32) -> Self {
        self.avp_bytes(code, &value.to_be_bytes())
    }

    pub fn avp_address(self, code: u32, addr: IpAddr) -> Self {
        let mut data = Vec::with_capacity(18);
        match addr {
            IpAddr::V4(v4) => {
                data.extend_from_slice(&1u16.to_be_bytes());
                data.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                data.extend_from_slice(&2u16.to_be_bytes());
                data.extend_from_slice(&v6.octets());
            }
        }
        self.avp_bytes(code, &data)
    }

    /// Append a vendor-specific AVP.
    pub fn vendor_avp(self, code: u32, vendor_id: u32, data: &[u8]) -> Self {
        self.push_avp(code, avp_flags::VENDOR, Some(vendor_id), data)
    }

    fn push_avp(mut self, code: u32, flag_bits: u8, vendor_id: Option<u32>, data: &[u8]) -> Self {
        let header_len = if vendor_id.is_some() { 12 } else { 8 };
        let length = header_len + data.len();
        self.avps.put_u32(code);
        self.avps.put_u8(flag_bits);
        put_u24(&mut self.avps, length as u32);
        if let Some(vendor) = vendor_id {
            self.avps.put_u32(vendor);
        }
        self.avps.put_slice(data);
        let padding = (4 - length % 4) % 4;
        self.avps.put_bytes(0, padding);
        self
    }

    /// Encode the message.
    pub fn build(self) -> Bytes {
        let header = MessageHeader {
            version: DIAMETER_VERSION,
            length: (HEADER_LEN + self.avps.len()) as u32,
            flags: self.flags,
            command_code: self.command_code,
            application_id: self.application_id,
            hop_by_hop: self.hop_by_hop,
            end_to_end: self.end_to_end,
        };
        let mut out = BytesMut::with_capacity(header.length as usize);
        header.encode(&mut out);
        out.extend_from_slice(&self.avps);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_avps_to_four_bytes() {
        let raw = MessageBuilder::request(280, 0).avp_utf8(264, "abcde").build();
        assert_eq!(raw.len(), HEADER_LEN + 16);
        assert_eq!(&raw[HEADER_LEN + 13..], &[0, 0, 0]);
        // AVP length excludes padding.
        assert_eq!(raw[HEADER_LEN + 7], 13);
    }

    #[test]
    fn answers_clear_the_request_bit() {
        let raw = MessageBuilder::answer(280, 0).build();
        assert_eq!(raw[4] & flags::REQUEST, 0);
    }
}
