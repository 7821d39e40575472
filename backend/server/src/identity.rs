//! # Visitor Identity
//!
//! Every visitor carries one long-lived cookie holding a random nonce, the time
//! it was issued and an HMAC-SHA256 signature over both.
//!
//! ```text
//! upvote_id=<nonce hex>.<issued_at unix secs>.<signature hex>
//! ```
//!
//! - The identity used for vote de-duplication is derived from the nonce and the
//!   server secret, so it stays stable when the cookie is re-issued
//! - A missing, tampered or expired cookie is never an error, a fresh nonce is
//!   minted instead and the response carries the new cookie
//! - Forging a cookie at best yields another throwaway identity, votes are keyed
//!   by identity value so nobody else's record can be touched
//! - Rotating the secret invalidates every identity, resetting de-duplication
use std::time::Duration;

use axum::http::{HeaderMap, header::COOKIE};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 32;
const IDENTITY_BYTES: usize = 16;
const CLOCK_SKEW_SECS: i64 = 300;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VisitorIdentity(String);

impl VisitorIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn for_test(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityToken {
    nonce: String,
    issued_at: i64,
}

impl IdentityToken {
    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }
}

/// Outcome of resolving a request's identity.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub identity: VisitorIdentity,
    pub token: IdentityToken,
    /// The request carried no usable cookie and `token` was just minted.
    pub minted: bool,
}

#[derive(Clone)]
pub struct IdentityIssuer {
    secret: Vec<u8>,
    cookie_name: String,
    cookie_domain: Option<String>,
    max_age: Duration,
}

impl IdentityIssuer {
    pub fn new(
        secret: &str,
        cookie_name: &str,
        cookie_domain: Option<String>,
        max_age: Duration,
    ) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            cookie_name: cookie_name.to_string(),
            cookie_domain,
            max_age,
        }
    }

    pub fn from_config(config: &Config, secret: &str) -> Self {
        Self::new(
            secret,
            &config.cookie_name,
            config.cookie_domain.clone(),
            config.cookie_max_age,
        )
    }

    pub fn resolve(&self, headers: &HeaderMap) -> Resolved {
        self.resolve_at(headers, Utc::now().timestamp())
    }

    pub fn resolve_at(&self, headers: &HeaderMap, now: i64) -> Resolved {
        let verified = cookie_values(headers, &self.cookie_name)
            .into_iter()
            .find_map(|value| self.verify(value, now));

        let (token, minted) = match verified {
            Some(token) => (token, false),
            None => (self.mint(now), true),
        };

        Resolved {
            identity: self.identity(&token),
            token,
            minted,
        }
    }

    pub fn mint(&self, now: i64) -> IdentityToken {
        let nonce: [u8; NONCE_BYTES] = rand::random();

        IdentityToken {
            nonce: hex::encode(nonce),
            issued_at: now,
        }
    }

    /// Same nonce, new issue time. The identity does not change.
    pub fn refresh(&self, token: &IdentityToken, now: i64) -> IdentityToken {
        IdentityToken {
            nonce: token.nonce.clone(),
            issued_at: now,
        }
    }

    pub fn identity(&self, token: &IdentityToken) -> VisitorIdentity {
        let mut mac = self.mac();
        mac.update(b"visitor:");
        mac.update(token.nonce.as_bytes());

        let digest = mac.finalize().into_bytes();
        VisitorIdentity(hex::encode(&digest[..IDENTITY_BYTES]))
    }

    pub fn encode(&self, token: &IdentityToken) -> String {
        let payload = format!("{}.{}", token.nonce, token.issued_at);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());

        format!("{payload}.{}", hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, value: &str, now: i64) -> Option<IdentityToken> {
        let mut segments = value.split('.');
        let (nonce, issued, signature) = (segments.next()?, segments.next()?, segments.next()?);
        if segments.next().is_some() {
            return None;
        }

        if nonce.len() != NONCE_BYTES * 2 || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        if issued.is_empty() || !issued.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let issued_at: i64 = issued.parse().ok()?;

        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        if issued_at > now + CLOCK_SKEW_SECS || now - issued_at > max_age {
            return None;
        }

        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac();
        mac.update(format!("{nonce}.{issued}").as_bytes());
        mac.verify_slice(&signature).ok()?;

        Some(IdentityToken {
            nonce: nonce.to_string(),
            issued_at,
        })
    }

    pub fn set_cookie(&self, token: &IdentityToken) -> String {
        let mut cookie = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; Secure; SameSite=Lax",
            self.cookie_name,
            self.encode(token),
            self.max_age.as_secs()
        );

        if let Some(domain) = &self.cookie_domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }

        cookie
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC takes keys of any size")
    }
}

/// 64 random bytes, hex encoded.
pub fn generate_secret() -> String {
    let head: [u8; 32] = rand::random();
    let tail: [u8; 32] = rand::random();

    format!("{}{}", hex::encode(head), hex::encode(tail))
}

fn cookie_values<'a>(headers: &'a HeaderMap, name: &str) -> Vec<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim())
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn issuer() -> IdentityIssuer {
        IdentityIssuer::new(
            "test-secret",
            "upvote_id",
            None,
            Duration::from_secs(15_552_000),
        )
    }

    fn headers_with(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_mints_without_cookie() {
        let resolved = issuer().resolve_at(&HeaderMap::new(), NOW);

        assert!(resolved.minted);
        assert_eq!(resolved.token.issued_at(), NOW);
        assert_eq!(resolved.identity.as_str().len(), IDENTITY_BYTES * 2);
    }

    #[test]
    fn test_cookie_round_trip() {
        let issuer = issuer();
        let first = issuer.resolve_at(&HeaderMap::new(), NOW);

        let cookie = format!("theme=dark; upvote_id={}", issuer.encode(&first.token));
        let second = issuer.resolve_at(&headers_with(&cookie), NOW + 60);

        assert!(!second.minted);
        assert_eq!(first.identity, second.identity);
    }

    #[test]
    fn test_refresh_keeps_identity() {
        let issuer = issuer();
        let token = issuer.mint(NOW);
        let refreshed = issuer.refresh(&token, NOW + 1000);

        assert_eq!(refreshed.issued_at(), NOW + 1000);
        assert_eq!(issuer.identity(&token), issuer.identity(&refreshed));
        assert_ne!(issuer.encode(&token), issuer.encode(&refreshed));
    }

    #[test]
    fn test_tampered_cookie_is_absent() {
        let issuer = issuer();
        let token = issuer.mint(NOW);
        let encoded = issuer.encode(&token);

        let mut forged = encoded.clone().into_bytes();
        let last = forged.len() - 1;
        forged[last] = if forged[last] == b'0' { b'1' } else { b'0' };
        let forged = String::from_utf8(forged).unwrap();

        assert!(issuer.verify(&encoded, NOW).is_some());
        assert!(issuer.verify(&forged, NOW).is_none());
        assert!(issuer.verify("garbage", NOW).is_none());
        assert!(issuer.verify("a.b.c.d", NOW).is_none());

        let resolved = issuer.resolve_at(&headers_with(&format!("upvote_id={forged}")), NOW);
        assert!(resolved.minted);
        assert_ne!(resolved.identity, issuer.identity(&token));
    }

    #[test]
    fn test_other_secret_rejected() {
        let token = issuer().mint(NOW);
        let encoded = issuer().encode(&token);

        let rotated = IdentityIssuer::new("rotated", "upvote_id", None, Duration::from_secs(60));
        assert!(rotated.verify(&encoded, NOW).is_none());
    }

    #[test]
    fn test_expired_and_future_tokens() {
        let issuer = IdentityIssuer::new("s", "upvote_id", None, Duration::from_secs(100));
        let token = issuer.mint(NOW);
        let encoded = issuer.encode(&token);

        assert!(issuer.verify(&encoded, NOW + 100).is_some());
        assert!(issuer.verify(&encoded, NOW + 101).is_none());
        assert!(issuer.verify(&encoded, NOW - CLOCK_SKEW_SECS - 1).is_none());
    }

    #[test]
    fn test_huge_max_age_does_not_reject() {
        let issuer = IdentityIssuer::new("s", "upvote_id", None, Duration::from_secs(u64::MAX));
        let encoded = issuer.encode(&issuer.mint(NOW));

        assert!(issuer.verify(&encoded, NOW).is_some());
        assert!(issuer.verify(&encoded, NOW + 10_000_000).is_some());
    }

    #[test]
    fn test_set_cookie_attributes() {
        let issuer = IdentityIssuer::new(
            "s",
            "upvote_id",
            Some("example.com".to_string()),
            Duration::from_secs(42),
        );
        let cookie = issuer.set_cookie(&issuer.mint(NOW));

        assert!(cookie.starts_with("upvote_id="));
        assert!(cookie.contains("Max-Age=42"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.ends_with("; Domain=example.com"));
    }

    #[test]
    fn test_generated_secret() {
        let secret = generate_secret();

        assert_eq!(secret.len(), 128);
        assert_ne!(secret, generate_secret());
    }
}
