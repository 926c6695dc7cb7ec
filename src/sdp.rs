// SDP parsing, serialization and offer/answer negotiation

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use rand::Rng;

use crate::codec::CodecKind;
use crate::rtp::TELEPHONE_EVENT_PT;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    /// Whether the peer intends to stop listening to our media (hold).
    pub fn is_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub version: u32,
    pub origin: SessionOrigin,
    pub name: String,
    pub connection: Option<ConnectionData>,
    pub timing: Vec<(u64, u64)>,
    pub media: Vec<MediaDescription>,
    pub attributes: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone)]
pub struct SessionOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionData {
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<ConnectionData>,
    pub attributes: HashMap<String, Option<String>>,
    pub direction: MediaDirection,
}

// SDP Parser
pub struct SdpParser;

impl SdpParser {
    pub fn parse(sdp: &str) -> Result<Session> {
        let mut session = Session {
            version: 0,
            origin: SessionOrigin {
                username: "-".to_string(),
                session_id: "0".to_string(),
                session_version: "0".to_string(),
                address: "0.0.0.0".to_string(),
            },
            name: "-".to_string(),
            connection: None,
            timing: vec![],
            media: vec![],
            attributes: HashMap::new(),
        };

        let mut current_media: Option<MediaDescription> = None;

        for line in sdp.lines() {
            let line = line.trim_end();
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }
            let type_char = line.as_bytes()[0];
            let value = &line[2..];

            match type_char {
                b'v' => {
                    session.version = value
                        .parse()
                        .map_err(|_| Error::Parse("bad SDP version".to_string()))?;
                }
                b'o' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() != 6 {
                        return Err(Error::Parse("bad origin line".to_string()));
                    }
                    session.origin = SessionOrigin {
                        username: parts[0].to_string(),
                        session_id: parts[1].to_string(),
                        session_version: parts[2].to_string(),
                        address: parts[5].to_string(),
                    };
                }
                b's' => {
                    if current_media.is_none() {
                        session.name = value.to_string();
                    }
                }
                b'c' => {
                    let conn = parse_connection(value)?;
                    match current_media {
                        Some(ref mut media) => media.connection = Some(conn),
                        None => session.connection = Some(conn),
                    }
                }
                b't' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 2 {
                        let start = parts[0].parse().unwrap_or(0);
                        let stop = parts[1].parse().unwrap_or(0);
                        session.timing.push((start, stop));
                    }
                }
                b'm' => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }
                    current_media = Some(parse_media(value)?);
                }
                b'a' => {
                    let (name, attr_value) = match value.split_once(':') {
                        Some((n, v)) => (n.to_string(), Some(v.to_string())),
                        None => (value.to_string(), None),
                    };
                    match current_media {
                        Some(ref mut media) => match name.as_str() {
                            "sendrecv" => media.direction = MediaDirection::SendRecv,
                            "sendonly" => media.direction = MediaDirection::SendOnly,
                            "recvonly" => media.direction = MediaDirection::RecvOnly,
                            "inactive" => media.direction = MediaDirection::Inactive,
                            _ => {
                                media.attributes.insert(name, attr_value);
                            }
                        },
                        None => {
                            session.attributes.insert(name, attr_value);
                        }
                    }
                }
                _ => {
                    // Lines outside the supported subset are skipped
                }
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }
        if session.timing.is_empty() {
            session.timing.push((0, 0));
        }

        Ok(session)
    }
}

fn parse_connection(value: &str) -> Result<ConnectionData> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 3 || parts[0] != "IN" {
        return Err(Error::Parse("bad connection line".to_string()));
    }
    Ok(ConnectionData {
        address_type: parts[1].to_string(),
        address: parts[2].to_string(),
    })
}

fn parse_media(value: &str) -> Result<MediaDescription> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(Error::Parse("bad media line".to_string()));
    }
    let port = parts[1]
        .split('/')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::Parse("bad media port".to_string()))?;

    Ok(MediaDescription {
        media_type: parts[0].to_string(),
        port,
        protocol: parts[2].to_string(),
        formats: parts[3..].iter().map(|s| s.to_string()).collect(),
        connection: None,
        attributes: HashMap::new(),
        direction: MediaDirection::SendRecv,
    })
}

impl Session {
    pub fn to_sdp(&self) -> String {
        let mut sdp = String::new();
        sdp.push_str(&format!("v={}\r\n", self.version));
        sdp.push_str(&format!(
            "o={} {} {} IN IP4 {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address
        ));
        sdp.push_str(&format!("s={}\r\n", self.name));
        if let Some(ref conn) = self.connection {
            sdp.push_str(&format!("c=IN {} {}\r\n", conn.address_type, conn.address));
        }
        for (start, stop) in &self.timing {
            sdp.push_str(&format!("t={} {}\r\n", start, stop));
        }
        for (name, value) in &self.attributes {
            match value {
                Some(v) => sdp.push_str(&format!("a={}:{}\r\n", name, v)),
                None => sdp.push_str(&format!("a={}\r\n", name)),
            }
        }
        for media in &self.media {
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            ));
            if let Some(ref conn) = media.connection {
                sdp.push_str(&format!("c=IN {} {}\r\n", conn.address_type, conn.address));
            }
            // rtpmap lines first, in payload order, then the rest
            for format in &media.formats {
                let key = format!("rtpmap:{}", format);
                if let Some(Some(v)) = media.attributes.get(&key) {
                    sdp.push_str(&format!("a={}:{}\r\n", key, v));
                }
            }
            for (name, value) in &media.attributes {
                if name.starts_with("rtpmap:") {
                    continue;
                }
                match value {
                    Some(v) => sdp.push_str(&format!("a={}:{}\r\n", name, v)),
                    None => sdp.push_str(&format!("a={}\r\n", name)),
                }
            }
            sdp.push_str(&format!("a={}\r\n", media.direction.as_str()));
        }
        sdp
    }

    /// The remote RTP endpoint advertised by this description.
    pub fn remote_media_addr(&self) -> Result<SocketAddr> {
        let audio = self
            .audio()
            .ok_or_else(|| Error::Parse("no audio media in SDP".to_string()))?;
        let address = audio
            .connection
            .as_ref()
            .or(self.connection.as_ref())
            .ok_or_else(|| Error::Parse("no connection address in SDP".to_string()))?
            .address
            .clone();
        let ip: IpAddr = address
            .parse()
            .map_err(|_| Error::Parse(format!("bad connection address: {}", address)))?;
        Ok(SocketAddr::new(ip, audio.port))
    }

    pub fn audio(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media_type == "audio")
    }
}

/// The outcome of audio offer/answer negotiation.
#[derive(Debug, Clone)]
pub struct NegotiatedAudio {
    pub codec: CodecKind,
    /// telephone-event payload type offered by the peer, if any.
    pub dtmf_payload_type: Option<u8>,
    pub remote_addr: SocketAddr,
    pub direction: MediaDirection,
}

/// Select a codec from the offer by local preference order {PCMU, PCMA} and
/// discover the peer's telephone-event payload type.
pub fn negotiate_offer(offer: &Session) -> Result<NegotiatedAudio> {
    let audio = offer.audio().ok_or(Error::NoCommonCodec)?;

    let offered: Vec<u8> = audio
        .formats
        .iter()
        .filter_map(|f| f.parse::<u8>().ok())
        .collect();

    let codec = [CodecKind::Pcmu, CodecKind::Pcma]
        .into_iter()
        .find(|c| offered.contains(&c.payload_type()))
        .ok_or(Error::NoCommonCodec)?;

    // telephone-event may ride any dynamic payload type; match by rtpmap
    let dtmf_payload_type = offered
        .iter()
        .copied()
        .find(|pt| {
            audio
                .attributes
                .get(&format!("rtpmap:{}", pt))
                .and_then(|v| v.as_deref())
                .map(|v| v.to_ascii_lowercase().starts_with("telephone-event"))
                .unwrap_or(*pt == TELEPHONE_EVENT_PT)
        })
        .filter(|pt| CodecKind::from_payload_type(*pt).is_none());

    Ok(NegotiatedAudio {
        codec,
        dtmf_payload_type,
        remote_addr: offer.remote_media_addr()?,
        direction: audio.direction,
    })
}

/// Build the SDP answer advertising our bound media address and the selected
/// codec (plus telephone-event echo when the offer carried one).
pub fn build_answer(
    media_ip: IpAddr,
    rtp_port: u16,
    negotiated: &NegotiatedAudio,
) -> Session {
    let mut formats = vec![negotiated.codec.payload_type().to_string()];
    let mut attributes = HashMap::new();
    attributes.insert(
        format!("rtpmap:{}", negotiated.codec.payload_type()),
        Some(format!("{}/8000", negotiated.codec.name())),
    );
    if let Some(pt) = negotiated.dtmf_payload_type {
        formats.push(pt.to_string());
        attributes.insert(format!("rtpmap:{}", pt), Some("telephone-event/8000".to_string()));
        attributes.insert(format!("fmtp:{}", pt), Some("0-16".to_string()));
    }

    Session {
        version: 0,
        origin: SessionOrigin {
            username: "-".to_string(),
            session_id: new_session_id(),
            session_version: "1".to_string(),
            address: media_ip.to_string(),
        },
        name: "-".to_string(),
        connection: Some(ConnectionData {
            address_type: "IP4".to_string(),
            address: media_ip.to_string(),
        }),
        timing: vec![(0, 0)],
        media: vec![MediaDescription {
            media_type: "audio".to_string(),
            port: rtp_port,
            protocol: "RTP/AVP".to_string(),
            formats,
            connection: None,
            attributes,
            direction: MediaDirection::SendRecv,
        }],
        attributes: HashMap::new(),
    }
}

/// Build an SDP offer for an outbound leg, listing both G.711 variants in
/// preference order plus telephone-event.
pub fn build_offer(media_ip: IpAddr, rtp_port: u16) -> Session {
    let mut attributes = HashMap::new();
    attributes.insert("rtpmap:0".to_string(), Some("PCMU/8000".to_string()));
    attributes.insert("rtpmap:8".to_string(), Some("PCMA/8000".to_string()));
    attributes.insert(
        format!("rtpmap:{}", TELEPHONE_EVENT_PT),
        Some("telephone-event/8000".to_string()),
    );
    attributes.insert(
        format!("fmtp:{}", TELEPHONE_EVENT_PT),
        Some("0-16".to_string()),
    );

    Session {
        version: 0,
        origin: SessionOrigin {
            username: "-".to_string(),
            session_id: new_session_id(),
            session_version: "1".to_string(),
            address: media_ip.to_string(),
        },
        name: "-".to_string(),
        connection: Some(ConnectionData {
            address_type: "IP4".to_string(),
            address: media_ip.to_string(),
        }),
        timing: vec![(0, 0)],
        media: vec![MediaDescription {
            media_type: "audio".to_string(),
            port: rtp_port,
            protocol: "RTP/AVP".to_string(),
            formats: vec!["0".to_string(), "8".to_string(), TELEPHONE_EVENT_PT.to_string()],
            connection: None,
            attributes,
            direction: MediaDirection::SendRecv,
        }],
        attributes: HashMap::new(),
    }
}

fn new_session_id() -> String {
    rand::thread_rng().gen_range(1_000_000u64..1_000_000_000).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 10.0.0.5\r\n\
        s=-\r\n\
        c=IN IP4 10.0.0.5\r\n\
        t=0 0\r\n\
        m=audio 10000 RTP/AVP 0 8 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:101 telephone-event/8000\r\n\
        a=fmtp:101 0-16\r\n\
        a=sendrecv\r\n";

    #[test]
    fn test_parse_offer() {
        let session = SdpParser::parse(OFFER).unwrap();
        assert_eq!(session.origin.username, "alice");
        assert_eq!(session.media.len(), 1);
        let audio = session.audio().unwrap();
        assert_eq!(audio.port, 10000);
        assert_eq!(audio.formats, vec!["0", "8", "101"]);
        assert_eq!(audio.direction, MediaDirection::SendRecv);
        assert_eq!(
            session.remote_media_addr().unwrap(),
            "10.0.0.5:10000".parse().unwrap()
        );
    }

    #[test]
    fn test_negotiation_prefers_pcmu() {
        let offer = SdpParser::parse(OFFER).unwrap();
        let negotiated = negotiate_offer(&offer).unwrap();
        assert_eq!(negotiated.codec, CodecKind::Pcmu);
        assert_eq!(negotiated.dtmf_payload_type, Some(101));
    }

    #[test]
    fn test_negotiation_falls_back_to_pcma() {
        let sdp = OFFER.replace("RTP/AVP 0 8 101", "RTP/AVP 8 101");
        let offer = SdpParser::parse(&sdp).unwrap();
        let negotiated = negotiate_offer(&offer).unwrap();
        assert_eq!(negotiated.codec, CodecKind::Pcma);
    }

    #[test]
    fn test_negotiation_rejects_foreign_codecs() {
        let sdp = "v=0\r\n\
            o=x 1 1 IN IP4 10.0.0.5\r\n\
            s=-\r\n\
            c=IN IP4 10.0.0.5\r\n\
            t=0 0\r\n\
            m=audio 4000 RTP/AVP 9 111\r\n\
            a=rtpmap:9 G722/8000\r\n\
            a=rtpmap:111 opus/48000/2\r\n";
        let offer = SdpParser::parse(sdp).unwrap();
        assert!(matches!(
            negotiate_offer(&offer).unwrap_err(),
            Error::NoCommonCodec
        ));
    }

    #[test]
    fn test_answer_shape() {
        let offer = SdpParser::parse(OFFER).unwrap();
        let negotiated = negotiate_offer(&offer).unwrap();
        let answer = build_answer("192.168.7.1".parse().unwrap(), 12000, &negotiated);
        let text = answer.to_sdp();

        assert!(text.contains("c=IN IP4 192.168.7.1"));
        assert!(text.contains("m=audio 12000 RTP/AVP 0 101"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000"));
        assert!(text.contains("a=rtpmap:101 telephone-event/8000"));
        assert!(text.contains("a=sendrecv"));

        // The answer we emit parses back
        let reparsed = SdpParser::parse(&text).unwrap();
        assert_eq!(reparsed.audio().unwrap().port, 12000);
    }

    #[test]
    fn test_hold_direction_detected() {
        let sdp = OFFER.replace("a=sendrecv", "a=sendonly");
        let offer = SdpParser::parse(&sdp).unwrap();
        let negotiated = negotiate_offer(&offer).unwrap();
        assert!(negotiated.direction.is_hold());

        let inactive = OFFER.replace("a=sendrecv", "a=inactive");
        let offer = SdpParser::parse(&inactive).unwrap();
        assert!(negotiate_offer(&offer).unwrap().direction.is_hold());
    }
}
