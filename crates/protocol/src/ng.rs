//! Framing and reply handling for the engine's ng control channel.
//!
//! One request per datagram:
//! ```text
//! <cookie> SP <bencoded-dict>
//! ```
//! The cookie is ASCII and opaque; replies are framed the same way. The
//! transport serializes requests, so the reply cookie is never correlated —
//! only the separator is required.

use crate::bencode::{Bencode, BencodeError};

/// A control datagram never exceeds one UDP payload.
pub const MAX_DATAGRAM: usize = 65535;

#[derive(Debug, thiserror::Error)]
pub enum NgError {
    #[error("datagram has no cookie separator")]
    MissingSeparator,
    #[error("reply payload is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("reply payload is not a dictionary")]
    NotADictionary,
    #[error("reply is missing field `{0}`")]
    MissingField(&'static str),
    #[error("engine rejected the request: {0}")]
    Engine(String),
}

/// Build the wire form of one request. The command is placed into the
/// argument dictionary under `command` before encoding.
pub fn frame(cookie: &str, command: &str, args: Bencode) -> Vec<u8> {
    let mut dict = match args {
        Bencode::Dict(map) => map,
        _ => Default::default(),
    };
    dict.insert(b"command".to_vec(), Bencode::str(command));

    let mut out = Vec::with_capacity(cookie.len() + 1 + 128);
    out.extend_from_slice(cookie.as_bytes());
    out.push(b' ');
    Bencode::Dict(dict).encode_into(&mut out);
    out
}

/// Parse one reply datagram into its dictionary.
///
/// Locates the first space byte, bencode-decodes the remainder, and checks
/// for an engine-level failure (`result == "error"`, reason under
/// `error-reason`). The cookie before the separator is ignored.
pub fn parse_reply(datagram: &[u8]) -> Result<Bencode, NgError> {
    let sep = datagram
        .iter()
        .position(|&b| b == b' ')
        .ok_or(NgError::MissingSeparator)?;
    let reply = Bencode::decode(&datagram[sep + 1..])?;
    if reply.as_dict().is_none() {
        return Err(NgError::NotADictionary);
    }
    if reply.get("result").and_then(Bencode::as_str) == Some("error") {
        let reason = reply
            .get("error-reason")
            .and_then(Bencode::as_str)
            .unwrap_or("unknown engine error")
            .to_owned();
        return Err(NgError::Engine(reason));
    }
    Ok(reply)
}

/// Mandatory string field of a reply dictionary.
pub fn want_str<'a>(reply: &'a Bencode, key: &'static str) -> Result<&'a str, NgError> {
    reply
        .get(key)
        .and_then(Bencode::as_str)
        .ok_or(NgError::MissingField(key))
}

/// Mandatory list field of a reply dictionary.
pub fn want_list<'a>(reply: &'a Bencode, key: &'static str) -> Result<&'a [Bencode], NgError> {
    reply
        .get(key)
        .and_then(Bencode::as_list)
        .ok_or(NgError::MissingField(key))
}

/// Mandatory dictionary field of a reply dictionary.
pub fn want_dict<'a>(reply: &'a Bencode, key: &'static str) -> Result<&'a Bencode, NgError> {
    let value = reply.get(key).ok_or(NgError::MissingField(key))?;
    if value.as_dict().is_none() {
        return Err(NgError::MissingField(key));
    }
    Ok(value)
}

/// Mandatory integer field of a dictionary.
pub fn want_int(reply: &Bencode, key: &'static str) -> Result<i64, NgError> {
    reply
        .get(key)
        .and_then(Bencode::as_int)
        .ok_or(NgError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cookie_space_dict() {
        let wire = frame("deadbeef00112233", "ping", Bencode::dict([]));
        assert!(wire.starts_with(b"deadbeef00112233 d"));
        assert_eq!(&wire[16..], b" d7:command4:pinge");
    }

    #[test]
    fn frame_merges_command_into_args() {
        let wire = frame(
            "0000000000000000",
            "query",
            Bencode::dict([("call-id", Bencode::str("x"))]),
        );
        let reply = parse_reply(&wire).unwrap();
        assert_eq!(reply.get("command").and_then(Bencode::as_str), Some("query"));
        assert_eq!(reply.get("call-id").and_then(Bencode::as_str), Some("x"));
    }

    #[test]
    fn reply_without_separator_is_protocol_error() {
        assert!(matches!(parse_reply(b"abc"), Err(NgError::MissingSeparator)));
    }

    #[test]
    fn reply_with_non_dict_payload_is_protocol_error() {
        assert!(matches!(
            parse_reply(b"cookie i42e"),
            Err(NgError::NotADictionary)
        ));
        assert!(matches!(
            parse_reply(b"cookie garbage"),
            Err(NgError::Bencode(_))
        ));
    }

    #[test]
    fn engine_error_carries_reason() {
        let wire = b"c0ffee d6:result5:error12:error-reason12:no such calle";
        match parse_reply(wire) {
            Err(NgError::Engine(reason)) => assert_eq!(reason, "no such call"),
            other => panic!("expected engine error, got {other:?}"),
        }
    }

    #[test]
    fn engine_error_without_reason_still_surfaces() {
        let wire = b"c0ffee d6:result5:errore";
        match parse_reply(wire) {
            Err(NgError::Engine(reason)) => assert_eq!(reason, "unknown engine error"),
            other => panic!("expected engine error, got {other:?}"),
        }
    }

    #[test]
    fn ok_reply_passes_through() {
        let reply_dict = Bencode::dict([
            ("result", Bencode::str("ok")),
            ("calls", Bencode::str_list(["a", "b"])),
        ]);
        let mut wire = b"c0ffee ".to_vec();
        reply_dict.encode_into(&mut wire);
        let reply = parse_reply(&wire).unwrap();
        assert_eq!(want_list(&reply, "calls").unwrap().len(), 2);
    }

    #[test]
    fn want_helpers_report_missing_fields() {
        let reply = Bencode::dict([("sdp", Bencode::str("v=0"))]);
        assert_eq!(want_str(&reply, "sdp").unwrap(), "v=0");
        assert!(matches!(
            want_str(&reply, "to-tag"),
            Err(NgError::MissingField("to-tag"))
        ));
        assert!(matches!(
            want_dict(&reply, "sdp"),
            Err(NgError::MissingField("sdp"))
        ));
        assert!(matches!(
            want_int(&reply, "created"),
            Err(NgError::MissingField("created"))
        ));
    }
}
