//! Command grammars and the base protocol codec.

use std::collections::HashMap;

use bytes::Bytes;

use super::error::CodecError;
use super::message::DiameterMessage;
use super::{avp_code, command, MessageCodec, HEADER_LEN};

/// Cardinality constraint for one AVP in a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvpRule {
    pub code: u32,
    pub min: usize,
    /// `None` means unbounded.
    pub max: Option<usize>,
}

impl AvpRule {
    /// `< AVP >` / `{ AVP }`: exactly one.
    pub const fn required(code: u32) -> Self {
        Self { code, min: 1, max: Some(1) }
    }

    /// `1* { AVP }`.
    pub const fn one_or_more(code: u32) -> Self {
        Self { code, min: 1, max: None }
    }
}

/// Request and answer grammar of one command.
#[derive(Debug, Clone)]
pub struct CommandGrammar {
    pub name: &'static str,
    pub request: Vec<AvpRule>,
    pub answer: Vec<AvpRule>,
}

/// Known command grammars, keyed by command code.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    commands: HashMap<u32, CommandGrammar>,
}

impl Dictionary {
    /// An empty dictionary: every command validates.
    pub fn new() -> Self {
        Self::default()
    }

    /// The base protocol commands exchanged between peers.
    pub fn base_protocol() -> Self {
        use avp_code::*;

        let mut dict = Self::new();
        dict.insert(
            command::CAPABILITIES_EXCHANGE,
            CommandGrammar {
                name: "Capabilities-Exchange",
                request: vec![
                    AvpRule::required(ORIGIN_HOST),
                    AvpRule::required(ORIGIN_REALM),
                    AvpRule::one_or_more(HOST_IP_ADDRESS),
                    AvpRule::required(VENDOR_ID),
                    AvpRule::required(PRODUCT_NAME),
                ],
                answer: vec![
                    AvpRule::required(RESULT_CODE),
                    AvpRule::required(ORIGIN_HOST),
                    AvpRule::required(ORIGIN_REALM),
                    AvpRule::one_or_more(HOST_IP_ADDRESS),
                    AvpRule::required(VENDOR_ID),
                    AvpRule::required(PRODUCT_NAME),
                ],
            },
        );
        dict.insert(
            command::DEVICE_WATCHDOG,
            CommandGrammar {
                name: "Device-Watchdog",
                request: vec![AvpRule::required(ORIGIN_HOST), AvpRule::required(ORIGIN_REALM)],
                answer: vec![
                    AvpRule::required(RESULT_CODE),
                    AvpRule::required(ORIGIN_HOST),
                    AvpRule::required(ORIGIN_REALM),
                ],
            },
        );
        dict.insert(
            command::DISCONNECT_PEER,
            CommandGrammar {
                name: "Disconnect-Peer",
                request: vec![
                    AvpRule::required(ORIGIN_HOST),
                    AvpRule::required(ORIGIN_REALM),
                    AvpRule::required(DISCONNECT_CAUSE),
                ],
                answer: vec![
                    AvpRule::required(RESULT_CODE),
                    AvpRule::required(ORIGIN_HOST),
                    AvpRule::required(ORIGIN_REALM),
                ],
            },
        );
        dict
    }

    pub fn insert(&mut self, code: u32, grammar: CommandGrammar) {
        self.commands.insert(code, grammar);
    }

    pub fn grammar(&self, code: u32) -> Option<&CommandGrammar> {
        self.commands.get(&code)
    }

    /// Check `message` against the grammar of its command, if any.
    pub fn check(&self, message: &DiameterMessage) -> Result<(), CodecError> {
        let command = message.header.command_code;
        let Some(grammar) = self.grammar(command) else {
            return Ok(());
        };
        let rules = if message.header.is_request() {
            &grammar.request
        } else {
            &grammar.answer
        };

        for rule in rules {
            let count = message.count(rule.code);
            if count < rule.min {
                return Err(CodecError::MissingAvp {
                    command,
                    avp: rule.code,
                });
            }
            if let Some(max) = rule.max {
                if count > max {
                    return Err(CodecError::TooManyAvps {
                        command,
                        avp: rule.code,
                        count,
                        max,
                    });
                }
            }
        }

        for code in [avp_code::ORIGIN_HOST, avp_code::ORIGIN_REALM] {
            if let Some(avp) = message.find(code) {
                if avp.data.is_empty() || avp.as_str().is_none() {
                    return Err(CodecError::InvalidAvp {
                        avp: code,
                        reason: "not a valid DiameterIdentity".to_string(),
                    });
                }
            }
        }
        for avp in message.avps.iter().filter(|a| a.code == avp_code::HOST_IP_ADDRESS) {
            if avp.as_address().is_none() {
                return Err(CodecError::InvalidAvp {
                    avp: avp.code,
                    reason: "not an IPv4 or IPv6 address".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Codec for the base protocol, backed by a [`Dictionary`].
#[derive(Debug, Clone)]
pub struct BaseProtocolCodec {
    dictionary: Dictionary,
}

impl BaseProtocolCodec {
    pub fn new(dictionary: Dictionary) -> Self {
        Self { dictionary }
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }
}

impl Default for BaseProtocolCodec {
    fn default() -> Self {
        Self::new(Dictionary::base_protocol())
    }
}

impl MessageCodec for BaseProtocolCodec {
    fn parse(&self, raw: Bytes) -> Result<DiameterMessage, CodecError> {
        if raw.len() < HEADER_LEN {
            return Err(CodecError::malformed("frame shorter than the header"));
        }
        DiameterMessage::decode(raw)
    }

    fn validate(&self, message: &DiameterMessage) -> Result<(), CodecError> {
        self.dictionary.check(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageBuilder;

    fn codec() -> BaseProtocolCodec {
        BaseProtocolCodec::default()
    }

    #[test]
    fn accepts_complete_cer() {
        let raw = MessageBuilder::capabilities_exchange_request(
            "client.example",
            "example",
            "10.0.0.1".parse().unwrap(),
        )
        .build();
        let message = codec().parse(raw).unwrap();
        codec().validate(&message).unwrap();
        assert!(codec().header(&message).is_capabilities_exchange_request());
    }

    #[test]
    fn cer_without_origin_realm_is_rejected() {
        let raw = MessageBuilder::request(command::CAPABILITIES_EXCHANGE, 0)
            .avp_utf8(avp_code::ORIGIN_HOST, "client.example")
            .avp_address(avp_code::HOST_IP_ADDRESS, "10.0.0.1".parse().unwrap())
            .avp_u32(avp_code::VENDOR_ID, 0)
            .avp_utf8(avp_code::PRODUCT_NAME, "probe")
            .build();
        let message = codec().parse(raw).unwrap();
        assert_eq!(
            codec().validate(&message),
            Err(CodecError::MissingAvp {
                command: command::CAPABILITIES_EXCHANGE,
                avp: avp_code::ORIGIN_REALM,
            })
        );
    }

    #[test]
    fn duplicate_origin_host_is_rejected() {
        let raw = MessageBuilder::device_watchdog_request("a.example", "example")
            .avp_utf8(avp_code::ORIGIN_HOST, "b.example")
            .build();
        let message = codec().parse(raw).unwrap();
        assert!(matches!(
            codec().validate(&message),
            Err(CodecError::TooManyAvps { count: 2, .. })
        ));
    }

    #[test]
    fn unknown_commands_validate() {
        let raw = MessageBuilder::request(316, 16_777_251).build();
        let message = codec().parse(raw).unwrap();
        assert!(codec().validate(&message).is_ok());
    }

    #[test]
    fn garbage_does_not_parse() {
        let err = codec().parse(Bytes::from_static(b"hello, diameter")).unwrap_err();
        assert!(!err.is_fatal());
    }
}
