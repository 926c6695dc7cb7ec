// SIP digest authentication (RFC 2617 MD5)

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// HA1 = MD5(username:realm:password); stored instead of the password.
pub fn compute_ha1(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{}:{}:{}", username, realm, password))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

// Time-bucketed nonces: bucket index plus an HMAC over it, so validity is
// checked without per-nonce server state.
pub struct NonceAuthority {
    secret: Vec<u8>,
    window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    Fresh,
    /// Correctly minted but outside the window: challenge again with
    /// `stale=true`.
    Stale,
    Invalid,
}

impl NonceAuthority {
    pub fn new(secret: &str, window_secs: u64) -> Self {
        NonceAuthority {
            secret: secret.as_bytes().to_vec(),
            window_secs: window_secs.max(1),
        }
    }

    fn bucket_now(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now / self.window_secs
    }

    fn tag_for(&self, bucket: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(bucket.to_string().as_bytes());
        hex(&mac.finalize().into_bytes())
    }

    pub fn mint(&self) -> String {
        let bucket = self.bucket_now();
        format!("{}.{}", bucket, self.tag_for(bucket))
    }

    pub fn verify(&self, nonce: &str) -> NonceStatus {
        let (bucket_str, tag) = match nonce.split_once('.') {
            Some(parts) => parts,
            None => return NonceStatus::Invalid,
        };
        let bucket: u64 = match bucket_str.parse() {
            Ok(b) => b,
            Err(_) => return NonceStatus::Invalid,
        };
        if self.tag_for(bucket) != tag {
            return NonceStatus::Invalid;
        }
        let now = self.bucket_now();
        // The previous bucket gets a grace period so requests spanning a
        // bucket edge still authenticate
        if bucket == now || bucket + 1 == now {
            NonceStatus::Fresh
        } else {
            NonceStatus::Stale
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// Parsed Authorization / Proxy-Authorization credentials
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

impl DigestCredentials {
    pub fn parse(header_value: &str) -> Result<Self> {
        let trimmed = header_value.trim();
        let params_str = trimmed
            .strip_prefix("Digest ")
            .or_else(|| trimmed.strip_prefix("digest "))
            .ok_or_else(|| Error::InvalidHeader("not a Digest header".to_string()))?;
        let params = parse_auth_params(params_str);

        let field = |name: &str| -> Result<String> {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| Error::InvalidHeader(format!("missing {} in credentials", name)))
        };

        Ok(DigestCredentials {
            username: field("username")?,
            realm: field("realm")?,
            nonce: field("nonce")?,
            uri: field("uri")?,
            response: field("response")?,
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
            opaque: params.get("opaque").cloned(),
        })
    }

    /// Check the response value against a stored HA1.
    pub fn verify(&self, ha1: &str, method: &str) -> bool {
        if !self.algorithm.eq_ignore_ascii_case("md5") {
            return false;
        }
        let ha2 = md5_hex(&format!("{}:{}", method, self.uri));
        let expected = match (self.qop.as_deref(), &self.nc, &self.cnonce) {
            (Some("auth"), Some(nc), Some(cnonce)) => md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            )),
            (None, _, _) => md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
            // qop present but incomplete parameters
            _ => return false,
        };
        // Case-insensitive hex comparison
        expected.eq_ignore_ascii_case(&self.response)
    }
}

// key="value" parameter list. Split into pairs at the commas that sit
// outside quoted strings, then unquote each value.
fn parse_auth_params(params_str: &str) -> HashMap<String, String> {
    split_outside_quotes(params_str)
        .into_iter()
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), unquote(value.trim())))
        })
        .collect()
}

fn split_outside_quotes(input: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            ',' if !quoted => pieces.push(std::mem::take(&mut current)),
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            '\\' if quoted => {
                // Keep the escape pair intact for unquoting later
                current.push(ch);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Strip surrounding quotes and resolve backslash escapes; bare tokens pass
/// through unchanged.
fn unquote(value: &str) -> String {
    let inner = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner,
        None => return value.to_string(),
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// WWW-Authenticate value for a 401 challenge.
pub fn build_challenge(realm: &str, nonce: &str, stale: bool) -> String {
    format!(
        "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\", stale={}",
        realm, nonce, stale
    )
}

// UAC side: answering a challenge from an upstream peer (trunk)

#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub stale: bool,
    pub algorithm: String,
    pub qop: Option<Vec<String>>,
}

pub fn parse_digest_challenge(header_value: &str) -> Result<DigestChallenge> {
    let trimmed = header_value.trim();
    let params_str = trimmed
        .strip_prefix("Digest ")
        .or_else(|| trimmed.strip_prefix("digest "))
        .ok_or_else(|| Error::InvalidHeader("not a Digest challenge".to_string()))?;
    let params = parse_auth_params(params_str);

    Ok(DigestChallenge {
        realm: params
            .get("realm")
            .cloned()
            .ok_or_else(|| Error::InvalidHeader("challenge missing realm".to_string()))?,
        nonce: params
            .get("nonce")
            .cloned()
            .ok_or_else(|| Error::InvalidHeader("challenge missing nonce".to_string()))?,
        opaque: params.get("opaque").cloned(),
        stale: params
            .get("stale")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        algorithm: params
            .get("algorithm")
            .cloned()
            .unwrap_or_else(|| "MD5".to_string()),
        qop: params
            .get("qop")
            .map(|q| q.split(',').map(|s| s.trim().to_string()).collect()),
    })
}

/// Authorization header value answering `challenge` for one request.
pub fn answer_challenge(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
) -> Result<String> {
    if !challenge.algorithm.eq_ignore_ascii_case("md5") {
        return Err(Error::AuthenticationFailed);
    }

    let ha1 = compute_ha1(username, &challenge.realm, password);
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    let use_qop = challenge
        .qop
        .as_ref()
        .map(|opts| opts.iter().any(|q| q == "auth"))
        .unwrap_or(false);

    let mut header;
    if use_qop {
        let cnonce = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let nc = "00000001";
        let response = md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ));
        header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5, qop=auth, nc={}, cnonce=\"{}\"",
            username, challenge.realm, challenge.nonce, uri, response, nc, cnonce
        );
    } else {
        let response = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));
        header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, challenge.realm, challenge.nonce, uri, response
        );
    }
    if let Some(ref opaque) = challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ha1_matches_rfc2617_shape() {
        // MD5("Mufasa:testrealm@host.com:Circle Of Life") from RFC 2617
        let ha1 = compute_ha1("Mufasa", "testrealm@host.com", "Circle Of Life");
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");
    }

    #[test]
    fn test_nonce_mint_verify() {
        let authority = NonceAuthority::new("secret", 300);
        let nonce = authority.mint();
        assert_eq!(authority.verify(&nonce), NonceStatus::Fresh);

        assert_eq!(authority.verify("garbage"), NonceStatus::Invalid);
        assert_eq!(authority.verify("123.deadbeef"), NonceStatus::Invalid);

        // A foreign secret cannot mint acceptable nonces
        let other = NonceAuthority::new("other-secret", 300);
        assert_eq!(authority.verify(&other.mint()), NonceStatus::Invalid);
    }

    #[test]
    fn test_nonce_staleness() {
        let authority = NonceAuthority::new("secret", 300);
        // Forge an old-but-correctly-signed nonce by signing an old bucket
        let old_bucket = authority.bucket_now() - 10;
        let stale = format!("{}.{}", old_bucket, authority.tag_for(old_bucket));
        assert_eq!(authority.verify(&stale), NonceStatus::Stale);

        // The immediately previous bucket is still fresh (grace)
        let prev = authority.bucket_now() - 1;
        let recent = format!("{}.{}", prev, authority.tag_for(prev));
        assert_eq!(authority.verify(&recent), NonceStatus::Fresh);
    }

    #[test]
    fn test_credentials_parse_and_verify() {
        let ha1 = compute_ha1("alice", "voicebridge", "wonderland");
        let nonce = "42.abcdef";
        let uri = "sip:voicebridge";
        let ha2 = md5_hex(&format!("REGISTER:{}", uri));
        let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));

        let header = format!(
            "Digest username=\"alice\", realm=\"voicebridge\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            nonce, uri, response
        );
        let creds = DigestCredentials::parse(&header).unwrap();
        assert_eq!(creds.username, "alice");
        assert!(creds.verify(&ha1, "REGISTER"));

        // Wrong password produces a mismatching response
        let wrong = compute_ha1("alice", "voicebridge", "guessing");
        assert!(!creds.verify(&wrong, "REGISTER"));
        // Right hash, wrong method
        assert!(!creds.verify(&ha1, "INVITE"));
    }

    #[test]
    fn test_credentials_verify_with_qop() {
        let ha1 = compute_ha1("bob", "voicebridge", "builder");
        let nonce = "7.beef";
        let uri = "sip:voicebridge";
        let cnonce = "0a4f113b";
        let nc = "00000001";
        let ha2 = md5_hex(&format!("REGISTER:{}", uri));
        let response = md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2));

        let header = format!(
            "Digest username=\"bob\", realm=\"voicebridge\", nonce=\"{}\", uri=\"{}\", qop=auth, nc={}, cnonce=\"{}\", response=\"{}\"",
            nonce, uri, nc, cnonce, response
        );
        let creds = DigestCredentials::parse(&header).unwrap();
        assert!(creds.verify(&ha1, "REGISTER"));
    }

    #[test]
    fn test_challenge_roundtrip_with_uac_answer() {
        // Server mints a challenge; the UAC side answers it; the server
        // verifies the answer against the same HA1.
        let authority = NonceAuthority::new("s3cret", 300);
        let nonce = authority.mint();
        let challenge_header = build_challenge("voicebridge", &nonce, false);

        let challenge = parse_digest_challenge(&challenge_header).unwrap();
        assert_eq!(challenge.realm, "voicebridge");
        assert!(!challenge.stale);

        let authorization =
            answer_challenge("trunkuser", "trunkpass", "INVITE", "sip:+15550001@peer", &challenge)
                .unwrap();
        let creds = DigestCredentials::parse(&authorization).unwrap();
        let ha1 = compute_ha1("trunkuser", "voicebridge", "trunkpass");
        assert!(creds.verify(&ha1, "INVITE"));
    }

    #[test]
    fn test_quoted_commas_inside_params() {
        let header = r#"Digest username="we,ird", realm="r", nonce="n", uri="sip:x", response="00", algorithm=MD5"#;
        let creds = DigestCredentials::parse(header).unwrap();
        assert_eq!(creds.username, "we,ird");
    }

    #[test]
    fn test_escaped_quotes_inside_params() {
        let header =
            r#"Digest username="say \"hi\"", realm="r", nonce="n", uri="sip:x", response="00""#;
        let creds = DigestCredentials::parse(header).unwrap();
        assert_eq!(creds.username, "say \"hi\"");
        // Bare tokens and base64-style padding survive untouched
        let challenge = parse_digest_challenge(r#"Digest realm="r", nonce="aGk=", stale=true"#).unwrap();
        assert_eq!(challenge.nonce, "aGk=");
        assert!(challenge.stale);
    }
}
