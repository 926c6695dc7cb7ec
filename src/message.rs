// SIP message model, parser and serializer

use std::collections::HashMap;

use crate::{
    CSeqHeader, ContactHeader, Error, HeaderName, Result, SipMethod, SipUri, ViaHeader,
};

// SIP Message structure
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: HeaderMap,
    pub body: Option<MessageBody>,
}

#[derive(Debug, Clone)]
pub enum StartLine {
    Request(RequestLine),
    Response(StatusLine),
}

#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: SipMethod,
    pub uri: SipUri,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct StatusLine {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
}

// Header storage preserving insertion order and repeated values
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    headers: HashMap<HeaderName, Vec<String>>,
    order: Vec<HeaderName>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap::default()
    }

    pub fn add(&mut self, name: HeaderName, value: String) {
        let values = self.headers.entry(name.clone()).or_default();
        values.push(value);
        if values.len() == 1 {
            self.order.push(name);
        }
    }

    pub fn set(&mut self, name: HeaderName, value: String) {
        if self.headers.insert(name.clone(), vec![value]).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.headers.get(&HeaderName::new(name)).and_then(|v| v.first())
    }

    pub fn get_all(&self, name: &str) -> Option<&Vec<String>> {
        self.headers.get(&HeaderName::new(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let name = HeaderName::new(name);
        self.order.retain(|n| n != &name);
        self.headers.remove(&name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.contains_key(&HeaderName::new(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &Vec<String>)> {
        self.order
            .iter()
            .filter_map(move |name| self.headers.get(name).map(|values| (name, values)))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MessageBody {
    pub content_type: String,
    pub content: Vec<u8>,
}

impl MessageBody {
    pub fn new(content_type: String, content: Vec<u8>) -> Self {
        MessageBody {
            content_type,
            content,
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.content)
            .map_err(|_| Error::Parse("non-UTF-8 message body".to_string()))
    }
}

impl SipMessage {
    pub fn new_request(method: SipMethod, uri: SipUri) -> Self {
        let mut headers = HeaderMap::new();
        headers.set(HeaderName::new(HeaderName::MAX_FORWARDS), "70".to_string());
        SipMessage {
            start_line: StartLine::Request(RequestLine {
                method,
                uri,
                version: "SIP/2.0".to_string(),
            }),
            headers,
            body: None,
        }
    }

    pub fn new_response(status_code: u16, reason_phrase: &str) -> Self {
        SipMessage {
            start_line: StartLine::Response(StatusLine {
                version: "SIP/2.0".to_string(),
                status_code,
                reason_phrase: reason_phrase.to_string(),
            }),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, StartLine::Response(_))
    }

    pub fn method(&self) -> Option<SipMethod> {
        match &self.start_line {
            StartLine::Request(req) => Some(req.method),
            _ => None,
        }
    }

    pub fn request_uri(&self) -> Option<&SipUri> {
        match &self.start_line {
            StartLine::Request(req) => Some(&req.uri),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response(resp) => Some(resp.status_code),
            _ => None,
        }
    }

    pub fn get_via(&self) -> Option<ViaHeader> {
        self.headers
            .get(HeaderName::VIA)
            .and_then(|v| ViaHeader::parse(v).ok())
    }

    pub fn get_from(&self) -> Option<&String> {
        self.headers.get(HeaderName::FROM)
    }

    pub fn get_to(&self) -> Option<&String> {
        self.headers.get(HeaderName::TO)
    }

    pub fn get_call_id(&self) -> Option<&String> {
        self.headers.get(HeaderName::CALL_ID)
    }

    pub fn get_cseq(&self) -> Option<CSeqHeader> {
        self.headers
            .get(HeaderName::CSEQ)
            .and_then(|v| CSeqHeader::parse(v).ok())
    }

    pub fn get_contact(&self) -> Option<ContactHeader> {
        self.headers
            .get(HeaderName::CONTACT)
            .and_then(|v| ContactHeader::parse(v).ok())
    }

    /// Record-Route values in received (top-to-bottom) order.
    pub fn record_routes(&self) -> Vec<String> {
        self.headers
            .get_all(HeaderName::RECORD_ROUTE)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_via(&mut self, via: &ViaHeader) {
        // New Via goes on top
        let mut vias = vec![via.to_string()];
        if let Some(existing) = self.headers.remove(HeaderName::VIA) {
            vias.extend(existing);
        }
        for v in vias {
            self.headers.add(HeaderName::new(HeaderName::VIA), v);
        }
    }

    pub fn set_body(&mut self, content_type: &str, content: Vec<u8>) {
        self.headers.set(
            HeaderName::new(HeaderName::CONTENT_TYPE),
            content_type.to_string(),
        );
        self.headers.set(
            HeaderName::new(HeaderName::CONTENT_LENGTH),
            content.len().to_string(),
        );
        self.body = Some(MessageBody::new(content_type.to_string(), content));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);

        match &self.start_line {
            StartLine::Request(req) => {
                out.extend_from_slice(req.method.as_str().as_bytes());
                out.push(b' ');
                out.extend_from_slice(req.uri.to_string().as_bytes());
                out.push(b' ');
                out.extend_from_slice(req.version.as_bytes());
            }
            StartLine::Response(resp) => {
                out.extend_from_slice(resp.version.as_bytes());
                out.push(b' ');
                out.extend_from_slice(resp.status_code.to_string().as_bytes());
                out.push(b' ');
                out.extend_from_slice(resp.reason_phrase.as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");

        for (name, values) in self.headers.iter() {
            for value in values {
                out.extend_from_slice(canonical_header_name(name.as_str()).as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }

        out.extend_from_slice(b"\r\n");

        if let Some(ref body) = self.body {
            out.extend_from_slice(&body.content);
        }

        out
    }
}

// Canonical capitalization for well-known headers; Train-Case otherwise
fn canonical_header_name(name: &str) -> String {
    match name {
        "via" => "Via".to_string(),
        "from" => "From".to_string(),
        "to" => "To".to_string(),
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "contact" => "Contact".to_string(),
        "content-type" => "Content-Type".to_string(),
        "content-length" => "Content-Length".to_string(),
        "max-forwards" => "Max-Forwards".to_string(),
        "user-agent" => "User-Agent".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        "proxy-authenticate" => "Proxy-Authenticate".to_string(),
        "proxy-authorization" => "Proxy-Authorization".to_string(),
        "record-route" => "Record-Route".to_string(),
        "retry-after" => "Retry-After".to_string(),
        other => other
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

// SIP Message Parser
pub struct SipParser;

impl SipParser {
    /// Parse a complete message. Truncated input is an error; use
    /// [`SipParser::try_parse`] for stream transports.
    pub fn parse(data: &[u8]) -> Result<(SipMessage, usize)> {
        match Self::try_parse(data)? {
            Some(result) => Ok(result),
            None => Err(Error::Parse("truncated message".to_string())),
        }
    }

    /// Parse from a byte stream. Returns `Ok(None)` when the buffer does not
    /// yet hold a complete message (TCP framing), `Err` when it never will.
    pub fn try_parse(data: &[u8]) -> Result<Option<(SipMessage, usize)>> {
        let head_end = match find_header_end(data) {
            Some(pos) => pos,
            None => {
                // An implausibly large header block is malformed, not pending
                if data.len() > 64 * 1024 {
                    return Err(Error::Parse("oversized header block".to_string()));
                }
                return Ok(None);
            }
        };

        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| Error::Parse("non-UTF-8 header block".to_string()))?;
        let mut lines = head.split("\r\n");

        let start = lines
            .next()
            .ok_or_else(|| Error::Parse("empty message".to_string()))?;
        let start_line = parse_start_line(start)?;

        let mut headers = HeaderMap::new();
        let mut pending: Option<(HeaderName, String)> = None;
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header
                if let Some((_, ref mut value)) = pending {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                return Err(Error::Parse("continuation without header".to_string()));
            }
            if let Some((name, value)) = pending.take() {
                headers.add(name, value);
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("malformed header: {}", line)))?;
            pending = Some((HeaderName::new(name.trim()), value.trim().to_string()));
        }
        if let Some((name, value)) = pending {
            headers.add(name, value);
        }

        let body_start = head_end + 4;
        let content_length = headers
            .get(HeaderName::CONTENT_LENGTH)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        if data.len() < body_start + content_length {
            return Ok(None);
        }

        let body = if content_length > 0 {
            let content_type = headers
                .get(HeaderName::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            Some(MessageBody::new(
                content_type,
                data[body_start..body_start + content_length].to_vec(),
            ))
        } else {
            None
        };

        Ok(Some((
            SipMessage {
                start_line,
                headers,
                body,
            },
            body_start + content_length,
        )))
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() < 3 {
        return Err(Error::Parse("bad start line".to_string()));
    }

    if parts[0].starts_with("SIP/") {
        let status_code = parts[1]
            .parse()
            .map_err(|_| Error::Parse("bad status code".to_string()))?;
        Ok(StartLine::Response(StatusLine {
            version: parts[0].to_string(),
            status_code,
            reason_phrase: parts[2].to_string(),
        }))
    } else {
        Ok(StartLine::Request(RequestLine {
            method: SipMethod::from_str(parts[0])?,
            uri: SipUri::parse(parts[1])?,
            version: parts[2].to_string(),
        }))
    }
}

/// Build a response echoing the request's Via, From, To, Call-ID and CSeq.
/// Dialog-establishing responses get a To tag if the request carried none.
pub fn response_for(request: &SipMessage, status_code: u16, to_tag: Option<&str>) -> SipMessage {
    let mut response = SipMessage::new_response(status_code, reason_phrase(status_code));

    if let Some(vias) = request.headers.get_all(HeaderName::VIA) {
        for via in vias {
            response
                .headers
                .add(HeaderName::new(HeaderName::VIA), via.clone());
        }
    }
    if let Some(from) = request.get_from() {
        response
            .headers
            .set(HeaderName::new(HeaderName::FROM), from.clone());
    }
    if let Some(to) = request.get_to() {
        let to_value = match to_tag {
            Some(tag) if !to.contains("tag=") => format!("{};tag={}", to, tag),
            _ => to.clone(),
        };
        response.headers.set(HeaderName::new(HeaderName::TO), to_value);
    }
    if let Some(call_id) = request.get_call_id() {
        response
            .headers
            .set(HeaderName::new(HeaderName::CALL_ID), call_id.clone());
    }
    if let Some(cseq) = request.headers.get(HeaderName::CSEQ) {
        response
            .headers
            .set(HeaderName::new(HeaderName::CSEQ), cseq.clone());
    }
    response.headers.set(
        HeaderName::new(HeaderName::CONTENT_LENGTH),
        "0".to_string(),
    );

    response
}

// Response reason phrases
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        To: Bob <sip:bob@example.com>\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 INVITE\r\n\
        Max-Forwards: 70\r\n\
        Contact: <sip:alice@192.168.1.100>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        test";

    #[test]
    fn test_request_parsing() {
        let (msg, size) = SipParser::parse(INVITE).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(SipMethod::Invite));
        assert_eq!(msg.get_call_id().unwrap(), "a84b4c76e66710@pc33.example.com");
        assert_eq!(msg.body.unwrap().content, b"test");
        assert_eq!(size, INVITE.len());
    }

    #[test]
    fn test_compact_form_expansion() {
        let raw = b"OPTIONS sip:server SIP/2.0\r\n\
            v: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKx\r\n\
            f: <sip:a@b>;tag=1\r\n\
            t: <sip:c@d>\r\n\
            i: compact-test\r\n\
            CSeq: 1 OPTIONS\r\n\
            l: 0\r\n\
            \r\n";
        let (msg, _) = SipParser::parse(raw).unwrap();
        assert_eq!(msg.get_call_id().unwrap(), "compact-test");
        assert!(msg.get_via().is_some());
        assert!(msg.get_from().is_some());
    }

    #[test]
    fn test_incremental_parse_for_streams() {
        // A prefix of a valid message is pending, not malformed
        assert!(SipParser::try_parse(&INVITE[..40]).unwrap().is_none());
        assert!(SipParser::try_parse(&INVITE[..INVITE.len() - 2])
            .unwrap()
            .is_none());
        let (msg, consumed) = SipParser::try_parse(INVITE).unwrap().unwrap();
        assert_eq!(consumed, INVITE.len());
        assert_eq!(msg.method(), Some(SipMethod::Invite));
    }

    #[test]
    fn test_serializer_roundtrip() {
        let (msg, _) = SipParser::parse(INVITE).unwrap();
        let bytes = msg.to_bytes();
        let (reparsed, _) = SipParser::parse(&bytes).unwrap();

        assert_eq!(reparsed.method(), msg.method());
        assert_eq!(reparsed.get_call_id(), msg.get_call_id());
        assert_eq!(reparsed.get_from(), msg.get_from());
        assert_eq!(reparsed.get_to(), msg.get_to());
        assert_eq!(
            reparsed.get_cseq().unwrap().sequence,
            msg.get_cseq().unwrap().sequence
        );
        assert_eq!(reparsed.headers.len(), msg.headers.len());
        assert_eq!(
            reparsed.body.as_ref().map(|b| &b.content),
            msg.body.as_ref().map(|b| &b.content)
        );
    }

    #[test]
    fn test_unknown_headers_preserved() {
        let raw = b"OPTIONS sip:server SIP/2.0\r\n\
            Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKx\r\n\
            X-Custom-Thing: opaque-value\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\
            \r\n";
        let (msg, _) = SipParser::parse(raw).unwrap();
        assert_eq!(msg.headers.get("x-custom-thing").unwrap(), "opaque-value");
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.contains("X-Custom-Thing: opaque-value"));
    }

    #[test]
    fn test_multiple_vias_kept_in_order() {
        let raw = b"BYE sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP first:5060;branch=z9hG4bK1\r\n\
            Via: SIP/2.0/UDP second:5060;branch=z9hG4bK2\r\n\
            From: <sip:a@b>;tag=1\r\n\
            To: <sip:c@d>;tag=2\r\n\
            Call-ID: x\r\n\
            CSeq: 2 BYE\r\n\
            Content-Length: 0\r\n\
            \r\n";
        let (msg, _) = SipParser::parse(raw).unwrap();
        let vias = msg.headers.get_all("via").unwrap();
        assert_eq!(vias.len(), 2);
        assert!(vias[0].contains("first"));
        assert!(vias[1].contains("second"));
    }

    #[test]
    fn test_response_for_adds_to_tag() {
        let (msg, _) = SipParser::parse(INVITE).unwrap();
        let resp = response_for(&msg, 200, Some("abcd"));
        assert_eq!(resp.status_code(), Some(200));
        assert!(resp.get_to().unwrap().contains("tag=abcd"));
        // From tag untouched
        assert!(resp.get_from().unwrap().contains("tag=1928301774"));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(SipParser::parse(b"not sip at all\r\n\r\n").is_err());
        let bad_header = b"OPTIONS sip:server SIP/2.0\r\nno-colon-here\r\n\r\n";
        assert!(SipParser::parse(bad_header).is_err());
    }
}
