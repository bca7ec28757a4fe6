// Header, subject, and body conventions shared by the stream adapter and proxy.
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown network family: {0}")]
    UnknownFamily(String),
    #[error("invalid address: {0}")]
    InvalidAddr(String),
    #[error("invalid write count: {0:?}")]
    InvalidWriteCount(String),
    #[error("token entropy: {0}")]
    TokenEntropy(#[from] rand::Error),
}

// Header keys are case-sensitive and must match on both sides of the bus.
pub const NETWORK_HEADER: &str = "network";
pub const ADDR_HEADER: &str = "addr";
pub const ERR_HEADER: &str = "err";
pub const READ_SIZE_HEADER: &str = "read-size";
pub const READ_DEADLINE_HEADER: &str = "read-deadline";
pub const WRITE_DEADLINE_HEADER: &str = "write-deadline";
pub const CONN_TOKEN_HEADER: &str = "conn-uuid";

// A failed write replies with a parseable zero so clients never see an empty count.
pub const WRITE_FAILURE_BODY: &[u8] = b"0";

/// Tunnel operation, one bus request/reply each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Close,
}

impl Op {
    pub fn suffix(self) -> &'static str {
        match self {
            Op::Read => ".read",
            Op::Write => ".write",
            Op::Close => ".close",
        }
    }
}

/// Subject an operation is published on, derived from the shared prefix.
///
/// ```
/// use culvert_wire::{Op, operation_subject};
///
/// assert_eq!(operation_subject("px", Op::Read), "px.read");
/// ```
pub fn operation_subject(prefix: &str, op: Op) -> String {
    format!("{prefix}{}", op.suffix())
}

/// Network family of a target endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Tcp => "tcp",
            Family::Tcp4 => "tcp4",
            Family::Tcp6 => "tcp6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "tcp" => Ok(Family::Tcp),
            "tcp4" => Ok(Family::Tcp4),
            "tcp6" => Ok(Family::Tcp6),
            other => Err(Error::UnknownFamily(other.to_string())),
        }
    }
}

/// Target a pooled stream is dialed to: a network family plus a `host:port`
/// address.
///
/// ```
/// use culvert_wire::{Endpoint, Family};
///
/// let endpoint = Endpoint::new(Family::Tcp, "127.0.0.1:7000").expect("endpoint");
/// assert_eq!(endpoint.to_string(), "tcp!127.0.0.1:7000");
/// assert_eq!(endpoint, "tcp!127.0.0.1:7000".parse().expect("parse"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    family: Family,
    addr: String,
}

impl Endpoint {
    pub fn new(family: Family, addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        // Require a parseable port; the host part is resolved at dial time.
        let port_ok = addr
            .rsplit_once(':')
            .map(|(_, port)| port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !port_ok {
            return Err(Error::InvalidAddr(addr));
        }
        Ok(Self { family, addr })
    }

    // Build an endpoint from the `network` and `addr` operation headers.
    pub fn from_parts(network: &str, addr: &str) -> Result<Self> {
        Self::new(network.parse()?, addr)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.family, self.addr)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let (family, addr) = input
            .split_once('!')
            .ok_or_else(|| Error::InvalidAddr(input.to_string()))?;
        Self::from_parts(family, addr)
    }
}

/// Serialize an absolute deadline for the `read-deadline` / `write-deadline`
/// headers. `None` ("no deadline") encodes as the empty string. The format is
/// RFC 3339 with nanosecond precision and both sides must agree on it exactly.
///
/// ```
/// use culvert_wire::{decode_deadline, encode_deadline};
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let at = UNIX_EPOCH + Duration::new(1_772_713_845, 123_456_789);
/// let encoded = encode_deadline(Some(at));
/// assert_eq!(encoded, "2026-03-05T12:30:45.123456789Z");
/// assert_eq!(decode_deadline(&encoded), Some(at));
/// assert_eq!(encode_deadline(None), "");
/// ```
pub fn encode_deadline(deadline: Option<SystemTime>) -> String {
    match deadline {
        Some(at) => DateTime::<Utc>::from(at).to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => String::new(),
    }
}

// Empty or unparseable header values mean "no deadline".
pub fn decode_deadline(value: &str) -> Option<SystemTime> {
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(SystemTime::from)
}

/// Encode the WRITE success body: the byte count as ASCII decimal.
pub fn encode_write_count(count: usize) -> Bytes {
    Bytes::from(count.to_string())
}

/// Parse a WRITE reply body back into a byte count.
pub fn parse_write_count(body: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::InvalidWriteCount(String::from_utf8_lossy(body).into_owned()))?;
    text.parse()
        .map_err(|_| Error::InvalidWriteCount(text.to_string()))
}

const TOKEN_GROUPS: [usize; 4] = [4, 6, 8, 10];
const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Per-stream identity token: 16 bytes of OS randomness rendered as grouped
/// uppercase hex. The token keys the proxy's pool so concurrent logical
/// streams to one endpoint never share a real connection.
///
/// ```
/// use culvert_wire::ConnToken;
///
/// let token = ConnToken::generate().expect("token");
/// assert_eq!(token.as_str().len(), 36);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnToken(String);

impl ConnToken {
    pub fn generate() -> Result<Self> {
        let mut raw = [0u8; 16];
        OsRng.try_fill_bytes(&mut raw)?;
        Ok(Self(render_token(&raw)))
    }

    // Wrap a token received in the `conn-uuid` header; the proxy treats it as
    // opaque and never re-parses it.
    pub fn from_header(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn render_token(raw: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (index, byte) in raw.iter().enumerate() {
        if TOKEN_GROUPS.contains(&index) {
            out.push('-');
        }
        out.push(HEX_UPPER[(byte >> 4) as usize] as char);
        out.push(HEX_UPPER[(byte & 0x0F) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn operation_subjects_use_fixed_suffixes() {
        assert_eq!(operation_subject("px", Op::Read), "px.read");
        assert_eq!(operation_subject("px", Op::Write), "px.write");
        assert_eq!(operation_subject("px", Op::Close), "px.close");
    }

    #[test]
    fn family_round_trips_through_str() {
        for family in [Family::Tcp, Family::Tcp4, Family::Tcp6] {
            let parsed: Family = family.as_str().parse().expect("parse");
            assert_eq!(parsed, family);
        }
    }

    #[test]
    fn family_rejects_unknown_token() {
        let err = "udp".parse::<Family>().expect_err("unknown");
        assert!(matches!(err, Error::UnknownFamily(s) if s == "udp"));
    }

    #[test]
    fn endpoint_round_trips_through_display() {
        let endpoint = Endpoint::new(Family::Tcp, "localhost:6379").expect("endpoint");
        let parsed: Endpoint = endpoint.to_string().parse().expect("parse");
        assert_eq!(parsed, endpoint);
        assert_eq!(parsed.addr(), "localhost:6379");
        assert_eq!(parsed.family(), Family::Tcp);
    }

    #[test]
    fn endpoint_requires_a_port() {
        assert!(Endpoint::new(Family::Tcp, "localhost").is_err());
        assert!(Endpoint::new(Family::Tcp, "localhost:notaport").is_err());
        assert!(Endpoint::new(Family::Tcp, ":6379").is_ok());
    }

    #[test]
    fn deadline_round_trips_with_nanosecond_precision() {
        let at = UNIX_EPOCH + Duration::new(1_000_000_000, 500);
        let encoded = encode_deadline(Some(at));
        assert_eq!(decode_deadline(&encoded), Some(at));
    }

    #[test]
    fn deadline_none_encodes_empty() {
        assert_eq!(encode_deadline(None), "");
        assert_eq!(decode_deadline(""), None);
    }

    #[test]
    fn deadline_garbage_decodes_as_no_deadline() {
        assert_eq!(decode_deadline("not-a-timestamp"), None);
    }

    #[test]
    fn write_count_round_trips() {
        let body = encode_write_count(8192);
        assert_eq!(body.as_ref(), b"8192");
        assert_eq!(parse_write_count(&body).expect("parse"), 8192);
    }

    #[test]
    fn write_count_rejects_non_decimal_body() {
        let err = parse_write_count(b"eight").expect_err("invalid");
        assert!(matches!(err, Error::InvalidWriteCount(s) if s == "eight"));
        assert!(parse_write_count(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn failure_body_is_a_parseable_zero() {
        assert_eq!(parse_write_count(WRITE_FAILURE_BODY).expect("parse"), 0);
    }

    #[test]
    fn token_renders_grouped_uppercase_hex() {
        let token = render_token(&[
            0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
            0x0B, 0x0C,
        ]);
        assert_eq!(token, "DEADBEEF-0102-0304-0506-0708090A0B0C");
    }

    #[test]
    fn generated_tokens_have_the_expected_shape() {
        let token = ConnToken::generate().expect("token");
        let text = token.as_str();
        assert_eq!(text.len(), 36);
        for (index, ch) in text.chars().enumerate() {
            if matches!(index, 8 | 13 | 18 | 23) {
                assert_eq!(ch, '-', "dash expected at {index}");
            } else {
                assert!(ch.is_ascii_hexdigit() && !ch.is_ascii_lowercase());
            }
        }
    }

    #[test]
    fn generated_tokens_differ() {
        let a = ConnToken::generate().expect("token");
        let b = ConnToken::generate().expect("token");
        assert_ne!(a, b);
    }
}
