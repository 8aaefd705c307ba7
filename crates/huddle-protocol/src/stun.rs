//! Minimal STUN message codec (RFC 5389 framing, RFC 5766 Allocate).
//!
//! Only what a TURN authentication probe needs: building Allocate requests,
//! long-term credential MESSAGE-INTEGRITY, and parsing responses into a
//! typed attribute list. Attributes this codec does not interpret are kept
//! as raw TLVs.
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Transaction ID (96 bits)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

/// Fixed STUN header size.
pub const HEADER_SIZE: usize = 20;

/// Magic cookie present in every RFC 5389 message.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of a transaction id.
pub const TRANSACTION_ID_SIZE: usize = 12;

/// Binding method.
pub const METHOD_BINDING: u16 = 0x001;

/// Allocate method (TURN).
pub const METHOD_ALLOCATE: u16 = 0x003;

/// IANA protocol number for UDP, used in REQUESTED-TRANSPORT.
pub const PROTOCOL_UDP: u8 = 17;

/// Value sent in the SOFTWARE attribute.
pub const SOFTWARE_NAME: &str = concat!("huddle-turn-probe/", env!("CARGO_PKG_VERSION"));

/// Encoded size of a MESSAGE-INTEGRITY attribute (header + HMAC-SHA1).
const INTEGRITY_ATTR_SIZE: usize = 4 + 20;

type HmacSha1 = Hmac<Sha1>;

/// Attribute type codes.
pub mod attr {
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000D;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
}

/// STUN codec errors.
#[derive(Debug, Error)]
pub enum StunError {
    /// Fewer bytes than the header or an attribute declares.
    #[error("Truncated STUN message")]
    Truncated,

    /// The two leading bits were not zero.
    #[error("Not a STUN message")]
    NotStun,

    /// Wrong magic cookie.
    #[error("Bad magic cookie: {0:#010x}")]
    BadMagicCookie(u32),

    /// Header length disagrees with the datagram/stream length.
    #[error("Length mismatch: header declares {declared}, body has {actual}")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },

    /// An attribute value could not be interpreted.
    #[error("Invalid attribute {kind:#06x}: {reason}")]
    InvalidAttribute {
        /// Attribute type.
        kind: u16,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// An attribute value does not fit in the 16-bit length field.
    #[error("Attribute {0:#06x} is too long")]
    AttributeTooLong(u16),

    /// The encoded body does not fit in the 16-bit header length.
    #[error("STUN message body of {0} bytes is too long")]
    MessageTooLong(usize),

    /// HMAC key rejected.
    #[error("Invalid integrity key")]
    IntegrityKey,
}

/// Message class bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

/// Interleave method and class bits into the 14-bit message type.
#[must_use]
pub fn message_type(method: u16, class: MessageClass) -> u16 {
    let c = class.bits();
    (method & 0x000F)
        | ((method & 0x0070) << 1)
        | ((method & 0x0F80) << 2)
        | ((c & 0b01) << 4)
        | ((c & 0b10) << 7)
}

/// Split a message type back into method and class.
#[must_use]
pub fn split_message_type(value: u16) -> (u16, MessageClass) {
    let method = (value & 0x000F) | ((value >> 1) & 0x0070) | ((value >> 2) & 0x0F80);
    let class = ((value >> 4) & 0b01) | ((value >> 7) & 0b10);
    (method, MessageClass::from_bits(class))
}

/// Long-term credential key: `MD5(username ":" realm ":" password)`.
#[must_use]
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());

    let mut key = [0u8; 16];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// A STUN attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    ErrorCode { code: u16, reason: String },
    RequestedTransport(u8),
    Lifetime(u32),
    MessageIntegrity([u8; 20]),
    /// Anything not interpreted above, value without padding.
    Raw { kind: u16, value: Bytes },
}

impl Attribute {
    /// Attribute type code.
    #[must_use]
    pub fn kind(&self) -> u16 {
        match self {
            Attribute::Username(_) => attr::USERNAME,
            Attribute::Realm(_) => attr::REALM,
            Attribute::Nonce(_) => attr::NONCE,
            Attribute::Software(_) => attr::SOFTWARE,
            Attribute::ErrorCode { .. } => attr::ERROR_CODE,
            Attribute::RequestedTransport(_) => attr::REQUESTED_TRANSPORT,
            Attribute::Lifetime(_) => attr::LIFETIME,
            Attribute::MessageIntegrity(_) => attr::MESSAGE_INTEGRITY,
            Attribute::Raw { kind, .. } => *kind,
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            Attribute::Username(s)
            | Attribute::Realm(s)
            | Attribute::Nonce(s)
            | Attribute::Software(s) => s.as_bytes().to_vec(),
            Attribute::ErrorCode { code, reason } => {
                let mut v = Vec::with_capacity(4 + reason.len());
                v.extend_from_slice(&[0, 0, (code / 100) as u8 & 0x07, (code % 100) as u8]);
                v.extend_from_slice(reason.as_bytes());
                v
            }
            Attribute::RequestedTransport(proto) => vec![*proto, 0, 0, 0],
            Attribute::Lifetime(secs) => secs.to_be_bytes().to_vec(),
            Attribute::MessageIntegrity(mac) => mac.to_vec(),
            Attribute::Raw { value, .. } => value.to_vec(),
        }
    }

    fn parse(kind: u16, value: &[u8]) -> Result<Self, StunError> {
        let text = |value: &[u8]| {
            String::from_utf8(value.to_vec()).map_err(|_| StunError::InvalidAttribute {
                kind,
                reason: "not UTF-8",
            })
        };

        let attribute = match kind {
            attr::USERNAME => Attribute::Username(text(value)?),
            attr::REALM => Attribute::Realm(text(value)?),
            attr::NONCE => Attribute::Nonce(text(value)?),
            attr::SOFTWARE => Attribute::Software(text(value)?),
            attr::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute {
                        kind,
                        reason: "error code shorter than 4 bytes",
                    });
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                Attribute::ErrorCode {
                    code,
                    reason: String::from_utf8_lossy(&value[4..]).into_owned(),
                }
            }
            attr::REQUESTED_TRANSPORT => match value {
                [proto, _, _, _] => Attribute::RequestedTransport(*proto),
                _ => {
                    return Err(StunError::InvalidAttribute {
                        kind,
                        reason: "requested transport must be 4 bytes",
                    })
                }
            },
            attr::LIFETIME => match <[u8; 4]>::try_from(value) {
                Ok(raw) => Attribute::Lifetime(u32::from_be_bytes(raw)),
                Err(_) => {
                    return Err(StunError::InvalidAttribute {
                        kind,
                        reason: "lifetime must be 4 bytes",
                    })
                }
            },
            attr::MESSAGE_INTEGRITY => match <[u8; 20]>::try_from(value) {
                Ok(mac) => Attribute::MessageIntegrity(mac),
                Err(_) => {
                    return Err(StunError::InvalidAttribute {
                        kind,
                        reason: "message integrity must be 20 bytes",
                    })
                }
            },
            _ => Attribute::Raw {
                kind,
                value: Bytes::copy_from_slice(value),
            },
        };

        Ok(attribute)
    }
}

fn write_attribute(buf: &mut BytesMut, kind: u16, value: &[u8]) -> Result<(), StunError> {
    let len = u16::try_from(value.len()).map_err(|_| StunError::AttributeTooLong(kind))?;
    buf.put_u16(kind);
    buf.put_u16(len);
    buf.extend_from_slice(value);
    buf.put_bytes(0, padding(value.len()));
    Ok(())
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn set_length(buf: &mut [u8], len: usize) -> Result<(), StunError> {
    let len = u16::try_from(len).map_err(|_| StunError::MessageTooLong(len))?;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; 20], StunError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::IntegrityKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// A STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: u16,
    pub class: MessageClass,
    pub transaction_id: [u8; TRANSACTION_ID_SIZE],
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// A request with a fresh random transaction id.
    #[must_use]
    pub fn request(method: u16) -> Self {
        Self {
            method,
            class: MessageClass::Request,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    /// An unauthenticated TURN Allocate request for a UDP relay.
    #[must_use]
    pub fn allocate_request() -> Self {
        Self::request(METHOD_ALLOCATE)
            .with_attribute(Attribute::RequestedTransport(PROTOCOL_UDP))
            .with_attribute(Attribute::Software(SOFTWARE_NAME.to_string()))
    }

    /// A response to `request` sharing its method and transaction id.
    #[must_use]
    pub fn response_to(request: &Message, class: MessageClass) -> Self {
        Self {
            method: request.method,
            class,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute.
    #[must_use]
    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// First attribute of the given type.
    #[must_use]
    pub fn attribute(&self, kind: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.kind() == kind)
    }

    #[must_use]
    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(realm) => Some(realm.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(nonce) => Some(nonce.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// ERROR-CODE as `(code, reason)`.
    #[must_use]
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// Encode the message.
    ///
    /// With an `integrity_key`, a MESSAGE-INTEGRITY attribute is computed and
    /// appended last; any `MessageIntegrity` already in `attributes` is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute or the whole message is too long.
    pub fn encode(&self, integrity_key: Option<&[u8]>) -> Result<Bytes, StunError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 128);
        buf.put_u16(message_type(self.method, self.class));
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.extend_from_slice(&self.transaction_id);

        for attribute in &self.attributes {
            if matches!(attribute, Attribute::MessageIntegrity(_)) {
                continue;
            }
            write_attribute(&mut buf, attribute.kind(), &attribute.value())?;
        }

        if let Some(key) = integrity_key {
            // The HMAC covers a header whose length already counts the
            // integrity attribute itself.
            let len = buf.len() - HEADER_SIZE + INTEGRITY_ATTR_SIZE;
            set_length(&mut buf, len)?;
            let mac = hmac_sha1(key, &buf)?;
            write_attribute(&mut buf, attr::MESSAGE_INTEGRITY, &mac)?;
        }

        let len = buf.len() - HEADER_SIZE;
        set_length(&mut buf, len)?;
        Ok(buf.freeze())
    }

    /// Decode a complete message.
    ///
    /// # Errors
    ///
    /// Returns an error on bad framing or malformed attributes.
    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        scan(data).map(|(message, _)| message)
    }
}

/// Body length declared by a STUN header, used by stream transports to
/// know how many bytes follow the fixed header.
///
/// # Errors
///
/// Returns an error if the header is short or not STUN.
pub fn declared_length(header: &[u8]) -> Result<usize, StunError> {
    if header.len() < HEADER_SIZE {
        return Err(StunError::Truncated);
    }
    if header[0] & 0xC0 != 0 {
        return Err(StunError::NotStun);
    }
    let cookie = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::BadMagicCookie(cookie));
    }
    Ok(usize::from(u16::from_be_bytes([header[2], header[3]])))
}

/// Check the MESSAGE-INTEGRITY of a raw message.
///
/// Returns `Ok(false)` if the message has no integrity attribute or the
/// HMAC does not match.
///
/// # Errors
///
/// Returns an error if the message cannot be parsed.
pub fn verify_integrity(data: &[u8], key: &[u8]) -> Result<bool, StunError> {
    let (message, offset) = scan(data)?;
    let (Some(offset), Some(Attribute::MessageIntegrity(expected))) =
        (offset, message.attribute(attr::MESSAGE_INTEGRITY))
    else {
        return Ok(false);
    };

    let mut covered = data[..offset].to_vec();
    set_length(&mut covered, offset - HEADER_SIZE + INTEGRITY_ATTR_SIZE)?;
    Ok(hmac_sha1(key, &covered)? == *expected)
}

fn scan(data: &[u8]) -> Result<(Message, Option<usize>), StunError> {
    let declared = declared_length(data)?;
    let actual = data.len() - HEADER_SIZE;
    if declared != actual || declared % 4 != 0 {
        return Err(StunError::LengthMismatch { declared, actual });
    }

    let (method, class) = split_message_type(u16::from_be_bytes([data[0], data[1]]));
    let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
    transaction_id.copy_from_slice(&data[8..HEADER_SIZE]);

    let mut attributes = Vec::new();
    let mut integrity_offset = None;
    let mut offset = HEADER_SIZE;

    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(StunError::Truncated);
        }
        let kind = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = usize::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        let start = offset + 4;
        let end = start + len;
        if end > data.len() {
            return Err(StunError::Truncated);
        }

        if kind == attr::MESSAGE_INTEGRITY && integrity_offset.is_none() {
            integrity_offset = Some(offset);
        }
        attributes.push(Attribute::parse(kind, &data[start..end])?);
        offset = end + padding(len);
    }

    let message = Message {
        method,
        class,
        transaction_id,
        attributes,
    };
    Ok((message, integrity_offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn fixed_request() -> Message {
        Message {
            method: METHOD_ALLOCATE,
            class: MessageClass::Request,
            transaction_id: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
            attributes: vec![
                Attribute::RequestedTransport(PROTOCOL_UDP),
                Attribute::Username("alice".into()),
                Attribute::Realm("example.org".into()),
                Attribute::Nonce("abc123".into()),
            ],
        }
    }

    #[test]
    fn test_message_type_bits() {
        assert_eq!(message_type(METHOD_ALLOCATE, MessageClass::Request), 0x0003);
        assert_eq!(message_type(METHOD_ALLOCATE, MessageClass::SuccessResponse), 0x0103);
        assert_eq!(message_type(METHOD_ALLOCATE, MessageClass::ErrorResponse), 0x0113);
        assert_eq!(message_type(METHOD_BINDING, MessageClass::SuccessResponse), 0x0101);
        assert_eq!(
            split_message_type(0x0113),
            (METHOD_ALLOCATE, MessageClass::ErrorResponse)
        );
    }

    #[test]
    fn test_long_term_key() {
        assert_eq!(
            long_term_key("alice", "example.org", "secret").to_vec(),
            hex("543e1aec5d3614f03141652d6ada51b2")
        );
    }

    #[test]
    fn test_encode_with_integrity_matches_reference_bytes() {
        let key = long_term_key("alice", "example.org", "secret");
        let encoded = fixed_request().encode(Some(&key)).unwrap();

        let expected = hex(concat!(
            "000300482112a4420102030405060708090a0b0c",
            "0019000411000000",
            "00060005616c696365000000",
            "0014000b6578616d706c652e6f726700",
            "0015000661626331323300",
            "00",
            "0008001469e83340347669f068811d97d188457c1098beaf"
        ));
        assert_eq!(encoded.to_vec(), expected);
        assert!(verify_integrity(&encoded, &key).unwrap());
    }

    #[test]
    fn test_integrity_rejects_wrong_key() {
        let key = long_term_key("alice", "example.org", "secret");
        let wrong = long_term_key("alice", "example.org", "guess");
        let encoded = fixed_request().encode(Some(&key)).unwrap();

        assert!(!verify_integrity(&encoded, &wrong).unwrap());
        let unsigned = fixed_request().encode(None).unwrap();
        assert!(!verify_integrity(&unsigned, &key).unwrap());
    }

    #[test]
    fn test_decode_error_response() {
        let request = Message::allocate_request();
        let response = Message::response_to(&request, MessageClass::ErrorResponse)
            .with_attribute(Attribute::ErrorCode {
                code: 401,
                reason: "Unauthorized".into(),
            })
            .with_attribute(Attribute::Realm("turn.example.org".into()))
            .with_attribute(Attribute::Nonce("n0nce".into()));

        let decoded = Message::decode(&response.encode(None).unwrap()).unwrap();
        assert_eq!(decoded.class, MessageClass::ErrorResponse);
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert_eq!(decoded.error_code(), Some((401, "Unauthorized")));
        assert_eq!(decoded.realm(), Some("turn.example.org"));
        assert_eq!(decoded.nonce(), Some("n0nce"));
    }

    #[test]
    fn test_unknown_attributes_are_preserved() {
        let request = Message::request(METHOD_BINDING).with_attribute(Attribute::Raw {
            kind: attr::XOR_MAPPED_ADDRESS,
            value: Bytes::from_static(&[0, 1, 0x21, 0x12, 1, 2, 3, 4]),
        });
        let decoded = Message::decode(&request.encode(None).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_decode_rejects_bad_framing() {
        assert!(matches!(Message::decode(&[0u8; 8]), Err(StunError::Truncated)));

        let mut encoded = Message::allocate_request().encode(None).unwrap().to_vec();
        encoded[4] = 0;
        assert!(matches!(
            Message::decode(&encoded),
            Err(StunError::BadMagicCookie(_))
        ));

        let mut encoded = Message::allocate_request().encode(None).unwrap().to_vec();
        encoded.truncate(encoded.len() - 4);
        assert!(matches!(
            Message::decode(&encoded),
            Err(StunError::LengthMismatch { .. })
        ));

        let mut encoded = Message::allocate_request().encode(None).unwrap().to_vec();
        encoded[0] = 0x80;
        assert!(matches!(Message::decode(&encoded), Err(StunError::NotStun)));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let half = "x".repeat(40_000);
        let message = Message::allocate_request()
            .with_attribute(Attribute::Software(half.clone()))
            .with_attribute(Attribute::Software(half));
        assert!(matches!(
            message.encode(None),
            Err(StunError::MessageTooLong(len)) if len > usize::from(u16::MAX)
        ));
    }
}
