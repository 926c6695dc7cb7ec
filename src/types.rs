// Common SIP types and identifiers

use std::collections::HashMap;
use std::fmt;

use rand::Rng;

use crate::{Error, Result};

// SIP URI implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub parameters: HashMap<String, Option<String>>,
}

impl SipUri {
    pub fn new(host: &str) -> Self {
        SipUri {
            scheme: "sip".to_string(),
            user: None,
            host: host.to_string(),
            port: None,
            parameters: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        let scheme_end = uri
            .find(':')
            .ok_or_else(|| Error::InvalidUri("no scheme".to_string()))?;
        let scheme = uri[..scheme_end].to_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(Error::InvalidUri(format!("unsupported scheme: {}", scheme)));
        }

        let rest = &uri[scheme_end + 1..];

        // Split off URI parameters first
        let (addr_part, param_part) = match rest.find(';') {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };

        let (user, host_part) = match addr_part.find('@') {
            Some(at) => {
                let user_part = &addr_part[..at];
                // Password in userinfo is obsolete; keep only the user
                let user = user_part.split(':').next().unwrap_or(user_part);
                (Some(user.to_string()), &addr_part[at + 1..])
            }
            None => (None, addr_part),
        };

        let (host, port) = if let Some(stripped) = host_part.strip_prefix('[') {
            // IPv6 reference
            let end = stripped
                .find(']')
                .ok_or_else(|| Error::InvalidUri("unterminated IPv6 host".to_string()))?;
            let host = stripped[..end].to_string();
            let port = stripped[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            (host, port)
        } else {
            let mut parts = host_part.splitn(2, ':');
            let host = parts.next().unwrap_or("").to_string();
            let port = parts.next().and_then(|p| p.parse().ok());
            (host, port)
        };

        if host.is_empty() {
            return Err(Error::InvalidUri("empty host".to_string()));
        }

        let mut parameters = HashMap::new();
        if let Some(params) = param_part {
            for param in params.split(';') {
                if param.is_empty() {
                    continue;
                }
                match param.split_once('=') {
                    Some((k, v)) => parameters.insert(k.to_string(), Some(v.to_string())),
                    None => parameters.insert(param.to_string(), None),
                };
            }
        }

        Ok(SipUri {
            scheme,
            user,
            host,
            port,
            parameters,
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(ref user) = self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (key, value) in &self.parameters {
            match value {
                Some(v) => write!(f, ";{}={}", key, v)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}

// SIP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Message,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "CANCEL" => Ok(SipMethod::Cancel),
            "OPTIONS" => Ok(SipMethod::Options),
            "REGISTER" => Ok(SipMethod::Register),
            "MESSAGE" => Ok(SipMethod::Message),
            "INFO" => Ok(SipMethod::Info),
            "UPDATE" => Ok(SipMethod::Update),
            "PRACK" => Ok(SipMethod::Prack),
            "SUBSCRIBE" => Ok(SipMethod::Subscribe),
            "NOTIFY" => Ok(SipMethod::Notify),
            "REFER" => Ok(SipMethod::Refer),
            _ => Err(Error::Parse(format!("unknown method: {}", s))),
        }
    }

    /// Methods this server actually serves; everything else gets 501.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            SipMethod::Invite
                | SipMethod::Ack
                | SipMethod::Bye
                | SipMethod::Cancel
                | SipMethod::Options
                | SipMethod::Register
                | SipMethod::Message
        )
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Header name type (case-insensitive, compact forms expanded)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderName(pub String);

impl HeaderName {
    pub fn new(name: &str) -> Self {
        let lower = name.to_lowercase();
        // RFC 3261 compact forms
        let expanded = match lower.as_str() {
            "v" => "via",
            "f" => "from",
            "t" => "to",
            "i" => "call-id",
            "m" => "contact",
            "l" => "content-length",
            "c" => "content-type",
            "k" => "supported",
            "s" => "subject",
            other => other,
        };
        HeaderName(expanded.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Common header names
impl HeaderName {
    pub const VIA: &'static str = "via";
    pub const FROM: &'static str = "from";
    pub const TO: &'static str = "to";
    pub const CALL_ID: &'static str = "call-id";
    pub const CSEQ: &'static str = "cseq";
    pub const CONTACT: &'static str = "contact";
    pub const MAX_FORWARDS: &'static str = "max-forwards";
    pub const CONTENT_TYPE: &'static str = "content-type";
    pub const CONTENT_LENGTH: &'static str = "content-length";
    pub const AUTHORIZATION: &'static str = "authorization";
    pub const WWW_AUTHENTICATE: &'static str = "www-authenticate";
    pub const PROXY_AUTHENTICATE: &'static str = "proxy-authenticate";
    pub const PROXY_AUTHORIZATION: &'static str = "proxy-authorization";
    pub const EXPIRES: &'static str = "expires";
    pub const ALLOW: &'static str = "allow";
    pub const SUPPORTED: &'static str = "supported";
    pub const USER_AGENT: &'static str = "user-agent";
    pub const ROUTE: &'static str = "route";
    pub const RECORD_ROUTE: &'static str = "record-route";
    pub const RETRY_AFTER: &'static str = "retry-after";
}

// Via header
#[derive(Debug, Clone)]
pub struct ViaHeader {
    pub protocol: String,
    pub version: String,
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
    pub rport: Option<u16>,
    pub received: Option<String>,
}

impl ViaHeader {
    pub fn new(transport: &str, host: &str, port: u16, branch: &str) -> Self {
        ViaHeader {
            protocol: "SIP".to_string(),
            version: "2.0".to_string(),
            transport: transport.to_uppercase(),
            host: host.to_string(),
            port: Some(port),
            branch: branch.to_string(),
            rport: None,
            received: None,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let sent_protocol = parts
            .next()
            .ok_or_else(|| Error::InvalidHeader("empty Via".to_string()))?;
        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            return Err(Error::InvalidHeader("Via missing sent-by".to_string()));
        }

        let proto: Vec<&str> = sent_protocol.split('/').collect();
        if proto.len() != 3 {
            return Err(Error::InvalidHeader("bad Via protocol".to_string()));
        }

        // sent-by plus ;-separated parameters (whitespace around ';' tolerated)
        let joined = rest.join(" ");
        let mut segments = joined.split(';').map(str::trim);
        let sent_by = segments
            .next()
            .ok_or_else(|| Error::InvalidHeader("Via missing sent-by".to_string()))?;

        let (host, port) = match sent_by.rfind(':') {
            Some(pos) if !sent_by[..pos].contains(':') || sent_by.starts_with('[') => {
                let host = sent_by[..pos].trim_matches(|c| c == '[' || c == ']').to_string();
                (host, sent_by[pos + 1..].parse().ok())
            }
            _ => (sent_by.to_string(), None),
        };

        let mut via = ViaHeader {
            protocol: proto[0].to_string(),
            version: proto[1].to_string(),
            transport: proto[2].to_uppercase(),
            host,
            port,
            branch: String::new(),
            rport: None,
            received: None,
        };

        for seg in segments {
            match seg.split_once('=') {
                Some(("branch", v)) => via.branch = v.to_string(),
                Some(("rport", v)) => via.rport = v.parse().ok(),
                Some(("received", v)) => via.received = Some(v.to_string()),
                None if seg == "rport" => via.rport = Some(0),
                _ => {}
            }
        }

        Ok(via)
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {}",
            self.protocol, self.version, self.transport, self.host
        )?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if !self.branch.is_empty() {
            write!(f, ";branch={}", self.branch)?;
        }
        match self.rport {
            Some(0) => write!(f, ";rport")?,
            Some(p) => write!(f, ";rport={}", p)?,
            None => {}
        }
        if let Some(ref received) = self.received {
            write!(f, ";received={}", received)?;
        }
        Ok(())
    }
}

// CSeq header
#[derive(Debug, Clone, Copy)]
pub struct CSeqHeader {
    pub sequence: u32,
    pub method: SipMethod,
}

impl CSeqHeader {
    pub fn new(sequence: u32, method: SipMethod) -> Self {
        CSeqHeader { sequence, method }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(Error::InvalidHeader("bad CSeq".to_string()));
        }
        let sequence = parts[0]
            .parse()
            .map_err(|_| Error::InvalidHeader("bad CSeq number".to_string()))?;
        let method = SipMethod::from_str(parts[1])?;
        Ok(CSeqHeader { sequence, method })
    }
}

impl fmt::Display for CSeqHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sequence, self.method)
    }
}

// Contact / name-addr header value
#[derive(Debug, Clone)]
pub struct ContactHeader {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub expires: Option<u32>,
}

impl ContactHeader {
    pub fn new(uri: SipUri) -> Self {
        ContactHeader {
            display_name: None,
            uri,
            expires: None,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();

        let (display_name, rest) = if let Some(stripped) = value.strip_prefix('"') {
            let end = stripped
                .find('"')
                .ok_or_else(|| Error::InvalidHeader("unterminated quoted string".to_string()))?;
            (
                Some(stripped[..end].to_string()),
                stripped[end + 1..].trim_start(),
            )
        } else if let Some(lt) = value.find('<') {
            let display = value[..lt].trim();
            (
                if display.is_empty() {
                    None
                } else {
                    Some(display.to_string())
                },
                &value[lt..],
            )
        } else {
            (None, value)
        };

        let mut expires = None;
        let uri_str = if let Some(start) = rest.find('<') {
            let end = rest
                .find('>')
                .ok_or_else(|| Error::InvalidHeader("unterminated angle bracket".to_string()))?;
            // Header parameters follow the closing bracket
            for param in rest[end + 1..].split(';').map(str::trim) {
                if let Some(("expires", v)) = param.split_once('=') {
                    expires = v.trim().parse().ok();
                }
            }
            &rest[start + 1..end]
        } else {
            // Without angle brackets, ';' separates header parameters
            match rest.split_once(';') {
                Some((uri, params)) => {
                    for param in params.split(';').map(str::trim) {
                        if let Some(("expires", v)) = param.split_once('=') {
                            expires = v.trim().parse().ok();
                        }
                    }
                    uri
                }
                None => rest,
            }
        };

        Ok(ContactHeader {
            display_name,
            uri: SipUri::parse(uri_str)?,
            expires,
        })
    }
}

impl fmt::Display for ContactHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref name) = self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        Ok(())
    }
}

/// Extract the `tag` parameter from a From/To header value.
pub fn extract_tag(header_value: &str) -> Option<String> {
    // The tag is a header parameter, outside any <...> bracket
    let after = match header_value.rfind('>') {
        Some(pos) => &header_value[pos + 1..],
        None => header_value,
    };
    for param in after.split(';').map(str::trim) {
        if let Some(("tag", v)) = param.split_once('=') {
            return Some(v.trim().to_string());
        }
    }
    None
}

/// Extract the URI embedded in a From/To/Contact header value.
pub fn extract_uri(header_value: &str) -> Result<SipUri> {
    ContactHeader::parse(header_value).map(|c| c.uri)
}

// Identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(pub String);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new(method: &SipMethod, branch: &str) -> Self {
        // CANCEL shares the INVITE branch but forms its own transaction
        TransactionId(format!("{}:{}", method.as_str(), branch))
    }
}

// Call lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Init,
    Ringing,
    Answered,
    Bridged,
    Holding,
    Ending,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Init => "init",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Bridged => "bridged",
            CallState::Holding => "holding",
            CallState::Ending => "ending",
            CallState::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Normal,
    Cancelled,
    RingTimeout,
    RtpTimeout,
    AuthFailed,
    MediaSocketError,
    BridgeUnrecoverable,
    Rejected(u16),
    Stale,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Normal => "normal",
            EndReason::Cancelled => "cancelled",
            EndReason::RingTimeout => "ring_timeout",
            EndReason::RtpTimeout => "rtp_timeout",
            EndReason::AuthFailed => "auth_failed",
            EndReason::MediaSocketError => "media_socket_error",
            EndReason::BridgeUnrecoverable => "bridge_unrecoverable",
            EndReason::Rejected(_) => "rejected",
            EndReason::Stale => "stale",
            EndReason::Shutdown => "shutdown",
        }
    }
}

// RFC 3261 timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    TimerA, // INVITE request retransmit
    TimerB, // INVITE transaction timeout
    TimerD, // wait for response retransmits (client INVITE)
    TimerE, // non-INVITE request retransmit
    TimerF, // non-INVITE transaction timeout
    TimerG, // INVITE response retransmit
    TimerH, // wait for ACK receipt
    TimerI, // wait for ACK retransmits
    TimerJ, // wait for non-INVITE request retransmits
    TimerK, // wait for response retransmits (non-INVITE client)
    TimerL, // wait in Accepted for 2xx retransmissions
}

pub const T1_MS: u64 = 500;
pub const T2_MS: u64 = 4_000;
pub const T4_MS: u64 = 5_000;

impl TimerType {
    pub fn duration_ms(&self) -> u64 {
        match self {
            TimerType::TimerA => T1_MS,
            TimerType::TimerB => 64 * T1_MS,
            TimerType::TimerD => 32_000,
            TimerType::TimerE => T1_MS,
            TimerType::TimerF => 64 * T1_MS,
            TimerType::TimerG => T1_MS,
            TimerType::TimerH => 64 * T1_MS,
            TimerType::TimerI => T4_MS,
            TimerType::TimerJ => 64 * T1_MS,
            TimerType::TimerK => T4_MS,
            TimerType::TimerL => 64 * T1_MS,
        }
    }
}

// Token generators
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    format!("z9hG4bK{:016x}", rng.gen::<u64>())
}

pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

pub fn generate_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parsing() {
        let uri = SipUri::parse("sip:alice@example.com:5080;transport=tcp").unwrap();
        assert_eq!(uri.scheme, "sip");
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5080));
        assert_eq!(
            uri.parameters.get("transport"),
            Some(&Some("tcp".to_string()))
        );
    }

    #[test]
    fn test_uri_roundtrip() {
        let uri = SipUri::parse("sip:+15550001@10.0.0.1").unwrap();
        assert_eq!(uri.to_string(), "sip:+15550001@10.0.0.1");
    }

    #[test]
    fn test_uri_rejects_bad_scheme() {
        assert!(SipUri::parse("http://example.com").is_err());
        assert!(SipUri::parse("nonsense").is_err());
    }

    #[test]
    fn test_via_roundtrip() {
        let via = ViaHeader::parse("SIP/2.0/UDP 192.168.1.5:5060;branch=z9hG4bKabc;rport").unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.host, "192.168.1.5");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch, "z9hG4bKabc");
        assert_eq!(via.rport, Some(0));

        let text = via.to_string();
        let reparsed = ViaHeader::parse(&text).unwrap();
        assert_eq!(reparsed.branch, via.branch);
        assert_eq!(reparsed.host, via.host);
    }

    #[test]
    fn test_cseq() {
        let cseq = CSeqHeader::parse("314159 INVITE").unwrap();
        assert_eq!(cseq.sequence, 314159);
        assert_eq!(cseq.method, SipMethod::Invite);
        assert_eq!(cseq.to_string(), "314159 INVITE");
        assert!(CSeqHeader::parse("oops").is_err());
    }

    #[test]
    fn test_contact_forms() {
        let c = ContactHeader::parse("\"Alice\" <sip:alice@1.2.3.4>;expires=60").unwrap();
        assert_eq!(c.display_name.as_deref(), Some("Alice"));
        assert_eq!(c.uri.user.as_deref(), Some("alice"));
        assert_eq!(c.expires, Some(60));

        let bare = ContactHeader::parse("sip:bob@example.com;expires=0").unwrap();
        assert_eq!(bare.uri.user.as_deref(), Some("bob"));
        assert_eq!(bare.expires, Some(0));
    }

    #[test]
    fn test_tag_extraction() {
        assert_eq!(
            extract_tag("Alice <sip:alice@example.com>;tag=1928301774").as_deref(),
            Some("1928301774")
        );
        assert_eq!(extract_tag("<sip:bob@example.com>"), None);
    }

    #[test]
    fn test_branch_format() {
        let b = generate_branch();
        assert!(b.starts_with("z9hG4bK"));
        assert_ne!(generate_branch(), generate_branch());
    }

    #[test]
    fn test_compact_header_names() {
        assert_eq!(HeaderName::new("v").as_str(), "via");
        assert_eq!(HeaderName::new("i").as_str(), "call-id");
        assert_eq!(HeaderName::new("M").as_str(), "contact");
        assert_eq!(HeaderName::new("Content-Length").as_str(), "content-length");
    }
}
