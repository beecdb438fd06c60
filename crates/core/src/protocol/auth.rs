//! RTSP authentication for the push role.
//!
//! Supports the RFC 2069 subset of HTTP Digest (MD5, no `qop`) and Basic.
//! A [`Challenge`] is parsed fresh from every `401` response and never
//! mutated, so each connection attempt authenticates against its own nonce.

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{Result, RtspError};

/// Username and password for an ingest server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Digest parameters offered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Digest(DigestChallenge),
    Basic { realm: Option<String> },
}

impl Challenge {
    /// Parse a `WWW-Authenticate` value.
    ///
    /// ```
    /// use rtsp_stream::protocol::auth::Challenge;
    ///
    /// let c = Challenge::parse(r#"Digest realm="Streaming Server", nonce="abc""#).unwrap();
    /// assert!(matches!(c, Challenge::Digest(_)));
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        for part in split_params(params) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" if !value.eq_ignore_ascii_case("MD5") => {
                    return Err(RtspError::Authentication(format!(
                        "unsupported digest algorithm {value}"
                    )));
                }
                _ => {}
            }
        }

        if scheme.eq_ignore_ascii_case("Basic") {
            return Ok(Self::Basic { realm });
        }
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(RtspError::Authentication(format!(
                "unsupported authentication scheme {scheme}"
            )));
        }
        match (realm, nonce) {
            (Some(realm), Some(nonce)) => Ok(Self::Digest(DigestChallenge {
                realm,
                nonce,
                opaque,
            })),
            _ => Err(RtspError::Authentication(
                "digest challenge without realm or nonce".into(),
            )),
        }
    }

    /// Value of the `Authorization` header answering this challenge for one
    /// request.
    pub fn authorization(&self, credentials: &Credentials, method: &str, uri: &str) -> String {
        match self {
            Self::Basic { .. } => {
                let token = BASE64_STANDARD.encode(format!(
                    "{}:{}",
                    credentials.username, credentials.password
                ));
                format!("Basic {token}")
            }
            Self::Digest(challenge) => {
                let response = digest_response(credentials, challenge, method, uri);
                let mut value = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
                    credentials.username, challenge.realm, challenge.nonce
                );
                if let Some(opaque) = &challenge.opaque {
                    value.push_str(&format!(", opaque=\"{opaque}\""));
                }
                value
            }
        }
    }
}

/// RFC 2069 response: `MD5(MD5(user:realm:pass):nonce:MD5(method:uri))`.
pub fn digest_response(
    credentials: &Credentials,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        credentials.username, challenge.realm, credentials.password
    ));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Split on commas outside quoted strings.
fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < input.len() {
        parts.push(input[start..].trim());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_challenge() {
        let c = Challenge::parse(
            r#"Digest realm="Streaming Server", nonce="5a1b, quoted", opaque="xyz""#,
        )
        .unwrap();
        assert_eq!(
            c,
            Challenge::Digest(DigestChallenge {
                realm: "Streaming Server".into(),
                nonce: "5a1b, quoted".into(),
                opaque: Some("xyz".into()),
            })
        );
    }

    #[test]
    fn digest_without_nonce_is_rejected() {
        assert!(Challenge::parse(r#"Digest realm="r""#).is_err());
        assert!(Challenge::parse(r#"Digest realm="r", nonce="n", algorithm=SHA-256"#).is_err());
        assert!(Challenge::parse("Bearer token").is_err());
    }

    #[test]
    fn rfc2069_reference_vector() {
        let creds = Credentials::new("Mufasa", "CircleOfLife");
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            opaque: None,
        };
        assert_eq!(
            digest_response(&creds, &challenge, "GET", "/dir/index.html"),
            "1949323746fe6a43ef61f9606e7febea"
        );
    }

    #[test]
    fn digest_authorization_header() {
        let creds = Credentials::new("user", "pass");
        let c = Challenge::parse(r#"Digest realm="r", nonce="n""#).unwrap();
        let header = c.authorization(&creds, "ANNOUNCE", "rtsp://h/live");
        let Challenge::Digest(d) = &c else {
            panic!("expected digest");
        };
        let expected = digest_response(&creds, d, "ANNOUNCE", "rtsp://h/live");
        assert!(header.starts_with("Digest username=\"user\", realm=\"r\", nonce=\"n\""));
        assert!(header.contains(&format!("response=\"{expected}\"")));
    }

    #[test]
    fn basic_authorization_header() {
        let creds = Credentials::new("Aladdin", "open sesame");
        let c = Challenge::parse(r#"Basic realm="x""#).unwrap();
        assert_eq!(
            c.authorization(&creds, "ANNOUNCE", "rtsp://h/live"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn debug_hides_password() {
        let creds = Credentials::new("u", "secret");
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
