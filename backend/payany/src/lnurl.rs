//! LNURL-pay (LUD-06 / LUD-16) client.

use std::net::IpAddr;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::{PayanyError, Result};

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LnurlpConfig {
    pub callback: String,
    #[serde(rename = "maxSendable")]
    pub max_sendable: u64,
    #[serde(rename = "minSendable")]
    pub min_sendable: u64,
    pub metadata: String,
    pub tag: String,
    #[serde(rename = "commentAllowed", default)]
    pub comment_allowed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LnurlpCallback {
    pub pr: String,
    #[serde(default)]
    pub routes: Vec<Value>,
}

/// LNURL services report failures as `{"status":"ERROR","reason":...}`,
/// often with a 200 status code.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LnurlResponse<T> {
    Ok(T),
    Error { status: String, reason: String },
}

impl<T> LnurlResponse<T> {
    fn into_result(self) -> Result<T> {
        match self {
            LnurlResponse::Ok(body) => Ok(body),
            LnurlResponse::Error { status, reason } => Err(PayanyError::resolution(format!(
                "LNURL service returned {status}: {reason}"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────

impl LnurlpConfig {
    /// Check the pay request against the amount we intend to send and, for
    /// lightning addresses, the identity the metadata claims.
    pub fn validate(&self, amount_msat: u64, address: Option<&str>, strict: bool) -> Result<()> {
        if !self.tag.eq_ignore_ascii_case("payRequest") {
            return Err(PayanyError::resolution(format!(
                "LNURL config is not for a payRequest: {}",
                self.tag
            )));
        }
        if amount_msat < self.min_sendable {
            return Err(PayanyError::resolution(format!(
                "Amount is below minimum sendable! {amount_msat}<{}",
                self.min_sendable
            )));
        }
        if amount_msat > self.max_sendable {
            return Err(PayanyError::resolution(format!(
                "Amount is above maximum sendable! {amount_msat}>{}",
                self.max_sendable
            )));
        }
        if let Some(address) = address {
            if !metadata_identifies(&self.metadata, address)? {
                if strict {
                    return Err(PayanyError::resolution(format!(
                        "Lnaddress not found in metadata!: {}",
                        self.metadata
                    )));
                }
                info!(
                    "Lnaddress not found in metadata, please report to lnaddress \
                     service provider they are violating LUD-16"
                );
            }
        }
        Ok(())
    }

    /// The comment to send along with the callback, if any.
    pub fn comment_for<'a>(&self, message: Option<&'a str>) -> Result<Option<&'a str>> {
        let Some(message) = message else {
            return Ok(None);
        };
        match self.comment_allowed {
            Some(allowed) if allowed >= message.chars().count() as u64 => Ok(Some(message)),
            Some(allowed) => Err(PayanyError::resolution(format!(
                "LNURL: message too long for this address! {}>{allowed}",
                message.chars().count()
            ))),
            None => Err(PayanyError::resolution(
                "LNURL: message not supported for this address!",
            )),
        }
    }

    /// Hex sha256 of the metadata string, which is what the invoice's
    /// description hash commits to.
    pub fn metadata_hash(&self) -> String {
        hex::encode(Sha256::digest(self.metadata.as_bytes()))
    }

    pub fn check_description_hash(&self, description_hash: Option<&str>, strict: bool) -> Result<()> {
        let Some(got) = description_hash else {
            if strict {
                return Err(PayanyError::resolution("Lnurl: missing description hash!"));
            }
            info!(
                "Lnurl: missing description hash, please report to lnaddress \
                 service provider they are violating LUD-06"
            );
            return Ok(());
        };
        let expected = self.metadata_hash();
        debug!("Lnurl: metadata_hashed:{expected} description_hash:{got}");
        if !expected.eq_ignore_ascii_case(got) {
            return Err(PayanyError::resolution(format!(
                "Lnurl: description hash not matching metadata! {expected} != {got}"
            )));
        }
        Ok(())
    }
}

/// Whether the metadata carries a `text/identifier` or `text/email` entry
/// equal to `address`.
fn metadata_identifies(metadata: &str, address: &str) -> Result<bool> {
    let entries: Vec<Value> = serde_json::from_str(metadata)
        .map_err(|_| PayanyError::resolution(format!("metadata not an array!: {metadata}")))?;
    for entry in entries {
        let pair = entry
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| {
                PayanyError::resolution(format!("inner metadata is not a pair!: {entry}"))
            })?;
        let (Some(kind), Some(content)) = (pair[0].as_str(), pair[1].as_str()) else {
            continue;
        };
        if (kind.eq_ignore_ascii_case("text/identifier") || kind.eq_ignore_ascii_case("text/email"))
            && content.eq_ignore_ascii_case(address)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

// ─────────────────────────────────────────────────────────
// Addressing
// ─────────────────────────────────────────────────────────

/// Well-known LNURL-pay endpoint of a lightning address. IP literals and
/// localhost are reached over plain http.
pub fn lnurlp_url(user: &str, host: &str) -> String {
    let scheme = if is_local_host(host) { "http" } else { "https" };
    format!("{scheme}://{host}/.well-known/lnurlp/{user}")
}

fn is_local_host(host: &str) -> bool {
    if host.starts_with('[') {
        return true;
    }
    let name = host.rsplit_once(':').map_or(host, |(name, _port)| name);
    name == "localhost" || name.parse::<IpAddr>().is_ok()
}

/// Decode a bech32 `lnurl1...` string into the URL it wraps.
pub fn decode_lnurl(encoded: &str) -> Result<String> {
    let (hrp, data) = bech32::decode(encoded)
        .map_err(|e| PayanyError::resolution(format!("invalid lnurl {encoded}: {e}")))?;
    if !hrp.to_string().eq_ignore_ascii_case("lnurl") {
        return Err(PayanyError::resolution(format!(
            "invalid lnurl prefix: {hrp}"
        )));
    }
    let url = String::from_utf8(data)
        .map_err(|_| PayanyError::resolution("lnurl does not contain a URL"))?;
    debug!("lnurl hrp:{hrp} url:{url}");
    Ok(url)
}

// ─────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait LnurlService: Send + Sync {
    async fn pay_request(&self, url: &str) -> Result<LnurlpConfig>;

    async fn callback(
        &self,
        callback: &str,
        amount_msat: u64,
        comment: Option<&str>,
    ) -> Result<LnurlpCallback>;
}

#[derive(Clone)]
pub struct HttpLnurl {
    client: Client,
}

impl HttpLnurl {
    pub fn new(client: Client) -> Self {
        HttpLnurl { client }
    }

    async fn get_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let body: LnurlResponse<T> = request.send().await?.error_for_status()?.json().await?;
        body.into_result()
    }
}

#[async_trait]
impl LnurlService for HttpLnurl {
    async fn pay_request(&self, url: &str) -> Result<LnurlpConfig> {
        let config: LnurlpConfig = self.get_json(self.client.get(url)).await?;
        debug!("lnurl config: {:?}", config);
        Ok(config)
    }

    async fn callback(
        &self,
        callback: &str,
        amount_msat: u64,
        comment: Option<&str>,
    ) -> Result<LnurlpCallback> {
        let mut request = self
            .client
            .get(callback)
            .query(&[("amount", amount_msat.to_string())]);
        if let Some(comment) = comment {
            request = request.query(&[("comment", comment)]);
        }
        self.get_json(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const METADATA: &str = r#"[["text/plain","hi"],["text/identifier","alice@example.com"]]"#;

    fn config(comment_allowed: Option<u64>) -> LnurlpConfig {
        LnurlpConfig {
            callback: "https://example.com/cb".to_string(),
            max_sendable: 10_000,
            min_sendable: 1_000,
            metadata: METADATA.to_string(),
            tag: "payRequest".to_string(),
            comment_allowed,
        }
    }

    #[test]
    fn sendable_range_is_enforced() {
        let c = config(None);
        assert!(c.validate(1_000, None, false).is_ok());
        assert!(c.validate(10_000, None, false).is_ok());
        assert!(c
            .validate(999, None, false)
            .unwrap_err()
            .to_string()
            .contains("below minimum"));
        assert!(c
            .validate(10_001, None, false)
            .unwrap_err()
            .to_string()
            .contains("above maximum"));
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let mut c = config(None);
        c.tag = "withdrawRequest".to_string();
        assert!(c.validate(5_000, None, false).is_err());
    }

    #[test]
    fn identifier_is_required_only_in_strict_mode() {
        let c = config(None);
        assert!(c.validate(5_000, Some("alice@example.com"), true).is_ok());
        assert!(c.validate(5_000, Some("bob@example.com"), false).is_ok());
        assert!(c.validate(5_000, Some("bob@example.com"), true).is_err());
    }

    #[test]
    fn comment_must_fit() {
        assert_eq!(config(Some(5)).comment_for(Some("hello")).unwrap(), Some("hello"));
        assert!(config(Some(4)).comment_for(Some("hello")).is_err());
        assert!(config(None).comment_for(Some("hello")).is_err());
        assert_eq!(config(None).comment_for(None).unwrap(), None);
    }

    #[test]
    fn description_hash_checks() {
        let c = config(None);
        let hash = c.metadata_hash();
        assert_eq!(hash.len(), 64);
        assert!(c.check_description_hash(Some(&hash), true).is_ok());
        assert!(c.check_description_hash(Some(&"00".repeat(32)), false).is_err());
        assert!(c.check_description_hash(None, false).is_ok());
        assert!(c.check_description_hash(None, true).is_err());
    }

    #[test]
    fn well_known_urls() {
        assert_eq!(
            lnurlp_url("alice", "example.com"),
            "https://example.com/.well-known/lnurlp/alice"
        );
        assert_eq!(
            lnurlp_url("test", "127.0.0.1:8080"),
            "http://127.0.0.1:8080/.well-known/lnurlp/test"
        );
        assert_eq!(
            lnurlp_url("test", "localhost:3000"),
            "http://localhost:3000/.well-known/lnurlp/test"
        );
    }

    #[test]
    fn bech32_lnurl_decodes_to_url() {
        // LUD-01 example
        let url = decode_lnurl(
            "lnurl1dp68gurn8ghj7um9wfmxjcm99e3k7mf0v9cxj0m385ekvcenxc6r2c35xvukxefcv5mkvv34x5ekzd3ev56nyd3hxqurzepexejxxepnxscrvwfnv9nxzcn9xq6xyefhvgcxxcmyxymnserxfq5fns",
        )
        .unwrap();
        assert_eq!(
            url,
            "https://service.com/api?q=3fc3645b439ce8e7f2553a69e5267081d96dcd340693afabe04be7b0ccd178df"
        );
    }

    #[test]
    fn error_responses_become_resolution_errors() {
        let body: LnurlResponse<LnurlpCallback> =
            serde_json::from_value(json!({"status": "ERROR", "reason": "no such user"})).unwrap();
        let err = body.into_result().unwrap_err();
        assert!(err.is_resolution());
        assert!(err.to_string().contains("no such user"));

        let ok: LnurlResponse<LnurlpCallback> =
            serde_json::from_value(json!({"pr": "lnbc1", "routes": []})).unwrap();
        assert_eq!(ok.into_result().unwrap().pr, "lnbc1");
    }
}
