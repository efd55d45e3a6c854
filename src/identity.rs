//! Identity provider boundary.
//!
//! The signed-in user arrives as an OpenID Connect ID token. Tokens are
//! RS256-signed; public keys come from the provider's JWKS endpoint and are
//! cached process-wide by key id.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use futures::lock::Mutex;
use isahc::AsyncReadResponseExt;
use lazy_static::lazy_static;
use log::{log, Level};
use openssl::{
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Public},
    rsa::Rsa,
    sign::Verifier,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::SECURITY_ENABLED,
    error::{CampusError, CampusResult},
};

lazy_static! {
    static ref KEY_CACHE: Arc<Mutex<HashMap<String, PKey<Public>>>> =
        Arc::new(Mutex::new(HashMap::new()));
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default)]
    kid: String,
    #[serde(default)]
    typ: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::One(aud) => aud == expected,
            Audience::Many(auds) => auds.iter().any(|a| a == expected),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdClaims {
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<Audience>,
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// The signed-in user as the identity provider describes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub avatar: Option<String>,
}

impl From<IdClaims> for Identity {
    fn from(claims: IdClaims) -> Self {
        let email = claims.email.unwrap_or_default();
        let display_name = claims
            .name
            .or(claims.preferred_username)
            .unwrap_or_else(|| {
                if email.is_empty() {
                    claims.sub.clone()
                } else {
                    email.clone()
                }
            });
        Identity {
            id: claims.sub,
            display_name,
            email,
            avatar: claims.picture,
        }
    }
}

/// The three dot-separated segments of a compact JWS. The encoded header
/// and payload are kept because the signature covers them verbatim.
struct TokenPieces<'a> {
    header: TokenHeader,
    claims: IdClaims,
    signed: (&'a str, &'a str),
    signature: Vec<u8>,
}

fn decode_segment<D: serde::de::DeserializeOwned>(segment: &str) -> Result<D> {
    let bytes = general_purpose::URL_SAFE_NO_PAD.decode(segment)?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl<'a> TokenPieces<'a> {
    fn parse(token: &'a str) -> Result<Self> {
        let mut segments = token.split('.');
        let header_64 = segments.next().ok_or(anyhow!("!header"))?;
        let payload_64 = segments.next().ok_or(anyhow!("!body"))?;
        let signature_64 = segments.next().ok_or(anyhow!("!signature"))?;
        if segments.next().is_some() {
            return Err(anyhow!("trailing segment"));
        }
        Ok(Self {
            header: decode_segment(header_64)?,
            claims: decode_segment(payload_64)?,
            signed: (header_64, payload_64),
            signature: general_purpose::URL_SAFE_NO_PAD.decode(signature_64)?,
        })
    }
}

fn signature_matches(pkey: &PKey<Public>, header_64: &str, payload_64: &str, sig: &[u8]) -> bool {
    let mut verifier = match Verifier::new(MessageDigest::sha256(), pkey) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if verifier.update(header_64.as_bytes()).is_err()
        || verifier.update(b".").is_err()
        || verifier.update(payload_64.as_bytes()).is_err()
    {
        return false;
    }
    verifier.verify(sig).unwrap_or(false)
}

#[derive(Serialize, Deserialize, Debug)]
struct CertKey {
    kid: String,
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    r#use: Option<String>,
    n: String,
    e: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct CertData {
    keys: Vec<CertKey>,
}

fn decode_component(value: &str) -> Result<BigNum> {
    let bytes = general_purpose::URL_SAFE_NO_PAD.decode(value.as_bytes())?;
    Ok(BigNum::from_slice(&bytes)?)
}

async fn update_cache(jwks_url: &str, cache: &mut HashMap<String, PKey<Public>>) -> Result<()> {
    let cert_data: CertData = isahc::get_async(jwks_url).await?.json().await?;

    for key in cert_data.keys {
        if key.kty != "RSA" || cache.contains_key(key.kid.as_str()) {
            continue;
        }
        let rsa = Rsa::from_public_components(decode_component(&key.n)?, decode_component(&key.e)?)?;
        cache.insert(key.kid, PKey::from_rsa(rsa)?);
    }
    Ok(())
}

/// Turns ID tokens into [`Identity`] values.
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    jwks_url: Option<String>,
    audience: Option<String>,
    enabled: bool,
}

impl TokenVerifier {
    pub fn new(jwks_url: Option<String>, audience: Option<String>) -> Self {
        Self {
            jwks_url,
            audience,
            enabled: *SECURITY_ENABLED,
        }
    }

    pub fn with_security(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Pins a public key under `kid` without consulting the JWKS endpoint.
    pub async fn install_key(kid: &str, key: PKey<Public>) {
        KEY_CACHE.lock().await.insert(kid.to_string(), key);
    }

    pub async fn verify(&self, token: &str) -> CampusResult<Identity> {
        let token = token.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let TokenPieces {
            header,
            claims,
            signed: (header_64, payload_64),
            signature,
        } = TokenPieces::parse(token).map_err(|e| {
            log!(Level::Debug, "Malformed ID token: {e}");
            CampusError::AuthRequired
        })?;

        if !self.enabled {
            return Ok(claims.into());
        }

        if claims.exp < chrono::Utc::now().timestamp() {
            log!(Level::Debug, "Token for {} has expired", claims.sub);
            return Err(CampusError::AuthRequired);
        }
        if header.alg != "RS256" {
            log!(Level::Debug, "Rejected token signed with {}", header.alg);
            return Err(CampusError::AuthRequired);
        }
        if let Some(expected) = &self.audience {
            if !claims.aud.as_ref().is_some_and(|aud| aud.contains(expected)) {
                log!(Level::Debug, "Token audience does not include {expected}");
                return Err(CampusError::AuthRequired);
            }
        }

        let mut cache = KEY_CACHE.lock().await;
        if !cache.contains_key(header.kid.as_str()) {
            if let Some(url) = &self.jwks_url {
                if let Err(e) = update_cache(url, &mut cache).await {
                    log!(Level::Warn, "Failed to refresh signing keys: {e}");
                }
            }
        }
        let verified = cache
            .get(header.kid.as_str())
            .is_some_and(|pkey| signature_matches(pkey, header_64, payload_64, &signature));
        drop(cache);

        if verified {
            Ok(claims.into())
        } else {
            log!(Level::Debug, "Token signature rejected for {}", claims.sub);
            Err(CampusError::AuthRequired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::{pkey::Private, sign::Signer};
    use serde_json::{json, Value};

    fn keypair() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
    }

    fn public(key: &PKey<Private>) -> PKey<Public> {
        PKey::public_key_from_pem(&key.public_key_to_pem().unwrap()).unwrap()
    }

    fn sign(key: &PKey<Private>, header: Value, claims: Value) -> String {
        let header = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let claims = general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
        let mut signer = Signer::new(MessageDigest::sha256(), key).unwrap();
        signer.update(format!("{header}.{claims}").as_bytes()).unwrap();
        let sig = general_purpose::URL_SAFE_NO_PAD.encode(signer.sign_to_vec().unwrap());
        format!("{header}.{claims}.{sig}")
    }

    fn claims(exp_offset: i64) -> Value {
        json!({
            "sub": "u-42",
            "name": "Priya Raman",
            "email": "priya@campus.edu",
            "aud": ["campus"],
            "exp": chrono::Utc::now().timestamp() + exp_offset,
        })
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(None, Some("campus".into())).with_security(true)
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let key = keypair();
        TokenVerifier::install_key("valid", public(&key)).await;
        let token = sign(&key, json!({ "alg": "RS256", "kid": "valid" }), claims(600));

        let identity = verifier().verify(&format!("Bearer {token}")).await.unwrap();
        assert_eq!(identity.id, "u-42");
        assert_eq!(identity.display_name, "Priya Raman");
        assert_eq!(identity.email, "priya@campus.edu");
    }

    #[tokio::test]
    async fn expired_and_foreign_tokens_are_rejected() {
        let key = keypair();
        TokenVerifier::install_key("expiry", public(&key)).await;

        let expired = sign(&key, json!({ "alg": "RS256", "kid": "expiry" }), claims(-60));
        assert_eq!(verifier().verify(&expired).await, Err(CampusError::AuthRequired));

        let wrong_alg = sign(&key, json!({ "alg": "HS256", "kid": "expiry" }), claims(600));
        assert_eq!(verifier().verify(&wrong_alg).await, Err(CampusError::AuthRequired));

        let mut other_aud = claims(600);
        other_aud["aud"] = json!("someone-else");
        let other_aud = sign(&key, json!({ "alg": "RS256", "kid": "expiry" }), other_aud);
        assert_eq!(verifier().verify(&other_aud).await, Err(CampusError::AuthRequired));
    }

    #[tokio::test]
    async fn tampered_payload_fails_signature() {
        let key = keypair();
        TokenVerifier::install_key("tamper", public(&key)).await;
        let token = sign(&key, json!({ "alg": "RS256", "kid": "tamper" }), claims(600));

        let mut forged = claims(600);
        forged["sub"] = json!("admin");
        let forged_payload = general_purpose::URL_SAFE_NO_PAD.encode(forged.to_string());
        let pieces: Vec<&str> = token.split('.').collect();
        let forged_token = format!("{}.{}.{}", pieces[0], forged_payload, pieces[2]);

        assert_eq!(
            verifier().verify(&forged_token).await,
            Err(CampusError::AuthRequired)
        );
    }

    #[tokio::test]
    async fn disabled_security_only_parses() {
        let key = keypair();
        let token = sign(&key, json!({ "alg": "RS256", "kid": "unknown" }), claims(-60));
        let identity = verifier().with_security(false).verify(&token).await.unwrap();
        assert_eq!(identity.id, "u-42");
        assert!(verifier().verify("not-a-token").await.is_err());
        assert!(verifier()
            .with_security(false)
            .verify(&format!("{token}.extra"))
            .await
            .is_err());
    }
}
