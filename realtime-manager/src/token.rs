//! Access tokens: the service's token envelope and the [`TokenStore`].
//!
//! A token is URL-safe base64 (padding optional) wrapping a MessagePack map:
//! `{v, t, ttl, res: {chan: {name: bits}, grp: {name: bits}}, meta, sig}`.
//! `t` is the issue time in Unix seconds and `ttl` is in minutes. Expiry is
//! never enforced locally; the service rejects stale tokens and the manager
//! learns about it through an access-denied status.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// Permission bits carried per resource.
pub mod permission {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const MANAGE: u32 = 0x04;
    pub const DELETE: u32 = 0x08;
    pub const GET: u32 = 0x20;
    pub const UPDATE: u32 = 0x40;
    pub const JOIN: u32 = 0x80;
}

// ---------------------------------------------------------------------------
// Wire claims
// ---------------------------------------------------------------------------

// Options are serialized as nil rather than skipped: rmp_serde fails to
// deserialize structs whose Option fields were omitted from the map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenClaims {
    pub v: u8,
    pub t: i64,
    pub ttl: u32,
    pub res: TokenResources,
    pub meta: Option<serde_json::Value>,
    pub sig: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenResources {
    pub chan: BTreeMap<String, u32>,
    pub grp: BTreeMap<String, u32>,
}

/// What a token authorizes, as returned by a token parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Read flag per channel named in the token.
    pub channel_read: BTreeMap<String, bool>,
    /// Unix seconds.
    pub issued_at: i64,
    pub ttl_minutes: u32,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidTokenFormat(message.into())
}

/// Encode claims into a token string.
pub fn encode_token(claims: &TokenClaims) -> Result<String> {
    let bytes = rmp_serde::to_vec_named(claims).map_err(|e| invalid(format!("encode: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Decode a token string into its raw claims.
pub fn decode_claims(raw: &str) -> Result<TokenClaims> {
    let body = raw.trim().trim_end_matches('=');
    if body.is_empty() {
        return Err(invalid("empty token"));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(body)
        .or_else(|_| STANDARD_NO_PAD.decode(body))
        .map_err(|e| invalid(format!("base64: {e}")))?;

    // msgpack → rmpv::Value → serde_json::Value → TokenClaims, so that binary
    // fields such as `sig` decode as base64 strings instead of failing.
    let mut reader = std::io::Cursor::new(bytes.as_slice());
    let value =
        rmpv::decode::read_value(&mut reader).map_err(|e| invalid(format!("msgpack: {e}")))?;
    if !value.is_map() {
        return Err(invalid("token payload is not a map"));
    }
    let claims: TokenClaims = serde_json::from_value(msgpack_to_json(value))
        .map_err(|e| invalid(format!("claims: {e}")))?;

    if claims.t <= 0 {
        return Err(invalid("missing issue time"));
    }
    if claims.ttl == 0 {
        return Err(invalid("missing ttl"));
    }
    Ok(claims)
}

/// Default token parser: decode the envelope and extract channel read grants.
pub fn decode_token(raw: &str) -> Result<TokenGrant> {
    let claims = decode_claims(raw)?;
    let channel_read = claims
        .res
        .chan
        .into_iter()
        .map(|(channel, bits)| (channel, bits & permission::READ != 0))
        .collect();
    Ok(TokenGrant {
        channel_read,
        issued_at: claims.t,
        ttl_minutes: claims.ttl,
    })
}

fn msgpack_to_json(value: rmpv::Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        rmpv::Value::Nil => Json::Null,
        rmpv::Value::Boolean(b) => Json::Bool(b),
        rmpv::Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
            (Some(n), _) => Json::from(n),
            (None, Some(n)) => Json::from(n),
            (None, None) => Json::Null,
        },
        rmpv::Value::F32(f) => {
            serde_json::Number::from_f64(f64::from(f)).map_or(Json::Null, Json::Number)
        }
        rmpv::Value::F64(f) => {
            serde_json::Number::from_f64(f).map_or(Json::Null, Json::Number)
        }
        rmpv::Value::String(s) => s.into_str().map_or(Json::Null, Json::String),
        rmpv::Value::Binary(bytes) => Json::String(STANDARD_NO_PAD.encode(bytes)),
        rmpv::Value::Array(items) => Json::Array(items.into_iter().map(msgpack_to_json).collect()),
        rmpv::Value::Map(entries) => Json::Object(
            entries
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => s.into_str().unwrap_or_default(),
                        other => other.to_string(),
                    };
                    (key, msgpack_to_json(v))
                })
                .collect(),
        ),
        rmpv::Value::Ext(_, _) => Json::Null,
    }
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

/// The token currently in use, with its derived grant set and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    raw: String,
    granted_channels: BTreeSet<String>,
    issued_at: DateTime<Utc>,
    ttl_minutes: u32,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn from_grant(raw: &str, grant: TokenGrant) -> Result<Self> {
        let issued_at = DateTime::from_timestamp(grant.issued_at, 0)
            .ok_or_else(|| invalid("issue time out of range"))?;
        let expires_at = TimeDelta::try_minutes(i64::from(grant.ttl_minutes))
            .and_then(|ttl| issued_at.checked_add_signed(ttl))
            .ok_or_else(|| invalid("expiry out of range"))?;
        let granted_channels = grant
            .channel_read
            .into_iter()
            .filter_map(|(channel, read)| read.then_some(channel))
            .collect();
        Ok(Self {
            raw: raw.to_string(),
            granted_channels,
            issued_at,
            ttl_minutes: grant.ttl_minutes,
            expires_at,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn granted_channels(&self) -> &BTreeSet<String> {
        &self.granted_channels
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn ttl_minutes(&self) -> u32 {
        self.ttl_minutes
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Holds the current access token. Only [`TokenStore::set`] replaces it.
#[derive(Debug, Default)]
pub struct TokenStore {
    current: Option<AccessToken>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `raw` with the default codec and make it the current token.
    pub fn set(&mut self, raw: &str) -> Result<&AccessToken> {
        self.set_with(raw, decode_token)
    }

    /// Parse `raw` with `parse` and make it the current token.
    ///
    /// On failure the previous token stays active.
    pub fn set_with(
        &mut self,
        raw: &str,
        parse: impl FnOnce(&str) -> Result<TokenGrant>,
    ) -> Result<&AccessToken> {
        let grant = parse(raw).map_err(|e| match e {
            Error::InvalidTokenFormat(message) => Error::InvalidTokenFormat(message),
            other => invalid(other.to_string()),
        })?;
        let token = AccessToken::from_grant(raw, grant)?;
        let expires_in_ms = (token.expires_at - Utc::now()).num_milliseconds();
        tracing::info!(
            expires_in_ms,
            expires_at = %token.expires_at,
            channels = ?token.granted_channels,
            "Access token set",
        );
        Ok(&*self.current.insert(token))
    }

    pub fn current(&self) -> Option<&AccessToken> {
        self.current.as_ref()
    }

    pub fn granted_channels(&self) -> Option<&BTreeSet<String>> {
        self.current.as_ref().map(AccessToken::granted_channels)
    }

    /// Milliseconds until expiry relative to `now`; negative once expired.
    /// Diagnostics only.
    pub fn expires_in_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.current
            .as_ref()
            .map(|t| (t.expires_at - now).num_milliseconds())
    }

    /// Whether the current token grants read access to any of `channels`.
    pub fn covers_any<'a>(&self, channels: impl IntoIterator<Item = &'a String>) -> bool {
        let Some(granted) = self.granted_channels() else {
            return false;
        };
        channels.into_iter().any(|c| granted.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(t: i64, ttl: u32, channels: &[(&str, u32)]) -> TokenClaims {
        TokenClaims {
            v: 2,
            t,
            ttl,
            res: TokenResources {
                chan: channels
                    .iter()
                    .map(|(name, bits)| ((*name).to_string(), *bits))
                    .collect(),
                grp: BTreeMap::new(),
            },
            meta: None,
            sig: Some("c2lnbmF0dXJl".to_string()),
        }
    }

    #[test]
    fn encode_decode_token() {
        let raw = encode_token(&claims(
            1_700_000_000,
            60,
            &[("room1", permission::READ), ("room2", permission::WRITE)],
        ))
        .unwrap();
        let grant = decode_token(&raw).unwrap();
        assert_eq!(grant.issued_at, 1_700_000_000);
        assert_eq!(grant.ttl_minutes, 60);
        assert_eq!(grant.channel_read.get("room1"), Some(&true));
        assert_eq!(grant.channel_read.get("room2"), Some(&false));
    }

    #[test]
    fn decode_accepts_padding_and_standard_alphabet() {
        let raw = encode_token(&claims(1_700_000_000, 5, &[("a", permission::READ)])).unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(&raw).unwrap();
        let padded = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(decode_token(&padded).is_ok());
    }

    #[test]
    fn decode_binary_signature() {
        let value = rmpv::Value::Map(vec![
            (rmpv::Value::from("v"), rmpv::Value::from(2)),
            (rmpv::Value::from("t"), rmpv::Value::from(1_700_000_000_i64)),
            (rmpv::Value::from("ttl"), rmpv::Value::from(30)),
            (
                rmpv::Value::from("res"),
                rmpv::Value::Map(vec![(
                    rmpv::Value::from("chan"),
                    rmpv::Value::Map(vec![(rmpv::Value::from("room1"), rmpv::Value::from(3))]),
                )]),
            ),
            (rmpv::Value::from("sig"), rmpv::Value::Binary(vec![1, 2, 3, 4])),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &value).unwrap();
        let raw = URL_SAFE_NO_PAD.encode(bytes);

        let decoded = decode_claims(&raw).unwrap();
        assert_eq!(decoded.sig.as_deref(), Some("AQIDBA"));
        assert_eq!(decode_token(&raw).unwrap().channel_read.get("room1"), Some(&true));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_token(""), Err(Error::InvalidTokenFormat(_))));
        assert!(matches!(decode_token("!!!not base64!!!"), Err(Error::InvalidTokenFormat(_))));
        // Valid base64 of a msgpack integer, not a map.
        let raw = URL_SAFE_NO_PAD.encode([0x07]);
        assert!(matches!(decode_token(&raw), Err(Error::InvalidTokenFormat(_))));
    }

    #[test]
    fn decode_rejects_missing_ttl() {
        let raw = encode_token(&claims(1_700_000_000, 0, &[("a", permission::READ)])).unwrap();
        assert!(matches!(decode_token(&raw), Err(Error::InvalidTokenFormat(_))));
    }

    #[test]
    fn store_computes_expiry() {
        let mut store = TokenStore::new();
        let raw = encode_token(&claims(1_700_000_000, 60, &[("room1", permission::READ)])).unwrap();
        let token = store.set(&raw).unwrap();
        assert_eq!(token.expires_at().timestamp_millis(), 1_700_000_000_000 + 60 * 60 * 1000);
        assert_eq!(token.raw(), raw);

        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(store.expires_in_ms(now), Some(3_600_000));
        let later = DateTime::from_timestamp(1_700_007_200, 0).unwrap();
        assert_eq!(store.expires_in_ms(later), Some(-3_600_000));
    }

    #[test]
    fn store_keeps_previous_token_on_failure() {
        let mut store = TokenStore::new();
        let raw = encode_token(&claims(1_700_000_000, 60, &[("room1", permission::READ)])).unwrap();
        store.set(&raw).unwrap();

        assert!(store.set("garbage").is_err());
        assert_eq!(store.current().map(AccessToken::raw), Some(raw.as_str()));
    }

    #[test]
    fn store_granted_channels_only_include_read() {
        let mut store = TokenStore::new();
        let raw = encode_token(&claims(
            1_700_000_000,
            60,
            &[
                ("room1", permission::READ | permission::WRITE),
                ("room2", permission::WRITE),
            ],
        ))
        .unwrap();
        store.set(&raw).unwrap();

        let granted = store.granted_channels().unwrap();
        assert!(granted.contains("room1"));
        assert!(!granted.contains("room2"));
        assert!(store.covers_any(&["room2".to_string(), "room1".to_string()]));
        assert!(!store.covers_any(&["room2".to_string()]));
    }

    #[test]
    fn store_without_token_covers_nothing() {
        let store = TokenStore::new();
        assert!(!store.covers_any(&["room1".to_string()]));
        assert_eq!(store.expires_in_ms(Utc::now()), None);
    }

    #[test]
    fn set_with_maps_parser_errors_to_invalid_format() {
        let mut store = TokenStore::new();
        let result = store.set_with("tok", |_| Err(Error::Disposed));
        assert!(matches!(result, Err(Error::InvalidTokenFormat(_))));
    }
}
