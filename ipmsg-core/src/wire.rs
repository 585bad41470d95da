//! Framing: `version:packet_no:login:host:command:` header, NUL-terminated message, optional
//! NUL-terminated extension.

use crate::protocol::{Command, PROTOCOL_VERSION};

/// Largest payload that fits one UDP datagram.
pub const MAX_PACKET_LEN: usize = 65_507;

const HEADER_FIELDS: usize = 6;

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u32,
    pub packet_no: u64,
    pub login_name: String,
    pub host_name: String,
    pub command: Command,
    pub message: String,
    pub extension: String,
}

impl Packet {
    pub fn new(
        packet_no: u64,
        login_name: &str,
        host_name: &str,
        command: Command,
        message: impl Into<String>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_no,
            login_name: login_name.to_string(),
            host_name: host_name.to_string(),
            command,
            message: message.into(),
            extension: String::new(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }
}

/// Encode a packet. Header fields may not contain `:` or NUL; message and extension may not contain NUL.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, PacketEncodeError> {
    for field in [&packet.login_name, &packet.host_name] {
        if field.contains(':') || field.contains('\0') {
            return Err(PacketEncodeError::InvalidField);
        }
    }
    if packet.message.contains('\0') || packet.extension.contains('\0') {
        return Err(PacketEncodeError::InvalidField);
    }
    let header = format!(
        "{}:{}:{}:{}:{}:",
        packet.version, packet.packet_no, packet.login_name, packet.host_name, packet.command.0
    );
    let mut out =
        Vec::with_capacity(header.len() + packet.message.len() + packet.extension.len() + 2);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(packet.message.as_bytes());
    out.push(0);
    if !packet.extension.is_empty() {
        out.extend_from_slice(packet.extension.as_bytes());
        out.push(0);
    }
    if out.len() > MAX_PACKET_LEN {
        return Err(PacketEncodeError::TooLarge);
    }
    Ok(out)
}

/// Error encoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketEncodeError {
    #[error("field contains a reserved separator")]
    InvalidField,
    #[error("packet too large")]
    TooLarge,
}

/// Decode one packet. Bytes that are not valid UTF-8 are replaced rather than rejected.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, PacketDecodeError> {
    if bytes.len() > MAX_PACKET_LEN {
        return Err(PacketDecodeError::TooLarge);
    }
    let (head, rest) = match bytes.iter().position(|&b| b == 0) {
        Some(i) => (&bytes[..i], &bytes[i + 1..]),
        None => (bytes, &[][..]),
    };
    let extension = match rest.iter().position(|&b| b == 0) {
        Some(i) => &rest[..i],
        None => rest,
    };
    let head = String::from_utf8_lossy(head);
    let fields: Vec<&str> = head.splitn(HEADER_FIELDS, ':').collect();
    if fields.len() < HEADER_FIELDS {
        return Err(PacketDecodeError::MissingField);
    }
    let version = fields[0]
        .trim()
        .parse::<u32>()
        .map_err(|_| PacketDecodeError::BadNumber("version"))?;
    let packet_no = fields[1]
        .trim()
        .parse::<u64>()
        .map_err(|_| PacketDecodeError::BadNumber("packet number"))?;
    let command = fields[4]
        .trim()
        .parse::<u32>()
        .map_err(|_| PacketDecodeError::BadNumber("command"))?;
    Ok(Packet {
        version,
        packet_no,
        login_name: fields[2].to_string(),
        host_name: fields[3].to_string(),
        command: Command(command),
        message: fields[5].to_string(),
        extension: String::from_utf8_lossy(extension).into_owned(),
    })
}

/// Error decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("packet too large")]
    TooLarge,
    #[error("missing header field")]
    MissingField,
    #[error("malformed {0}")]
    BadNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{opt, Mode};
    use proptest::prelude::*;

    fn sample_entry() -> Packet {
        Packet::new(
            1001,
            "alice",
            "alice-pc",
            Command::new(Mode::BrEntry).with(opt::UTF8),
            "Alice",
        )
        .with_extension("Sales")
    }

    #[test]
    fn roundtrip_entry() {
        let packet = sample_entry();
        let bytes = encode_packet(&packet).unwrap();
        assert!(bytes.starts_with(b"1:1001:alice:alice-pc:"));
        let decoded = decode_packet(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn message_keeps_colons() {
        let packet = Packet::new(7, "bob", "host", Command::new(Mode::SendMsg), "a:b:c");
        let decoded = decode_packet(&encode_packet(&packet).unwrap()).unwrap();
        assert_eq!(decoded.message, "a:b:c");
        assert!(decoded.extension.is_empty());
    }

    #[test]
    fn rejects_separator_in_header() {
        let packet = Packet::new(7, "bo:b", "host", Command::new(Mode::SendMsg), "");
        assert!(matches!(
            encode_packet(&packet),
            Err(PacketEncodeError::InvalidField)
        ));
    }

    #[test]
    fn rejects_oversized() {
        let packet = Packet::new(
            7,
            "bob",
            "host",
            Command::new(Mode::SendMsg),
            "x".repeat(MAX_PACKET_LEN),
        );
        assert!(matches!(
            encode_packet(&packet),
            Err(PacketEncodeError::TooLarge)
        ));
    }

    #[test]
    fn truncated_header_is_error() {
        assert!(matches!(
            decode_packet(b"1:22:bob:host"),
            Err(PacketDecodeError::MissingField)
        ));
        assert!(matches!(
            decode_packet(b"1:abc:bob:host:32:hi\0"),
            Err(PacketDecodeError::BadNumber(_))
        ));
    }

    #[test]
    fn unknown_mode_still_decodes() {
        let decoded = decode_packet(b"1:5:bob:host:127:hello\0").unwrap();
        assert_eq!(decoded.command.mode(), None);
        assert_eq!(decoded.message, "hello");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let decoded = decode_packet(b"1:5:bob:host:32:\xff\xfehi\0").unwrap();
        assert!(decoded.message.ends_with("hi"));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode_packet(&bytes);
        }
    }
}
