//! Lightning node JSON-RPC client and the collaborator traits the core
//! depends on.
//!
//! The resolver, dispatcher and arbiter only see [`InvoiceSource`],
//! [`PaymentEngine`] and [`ConfigStore`]. [`ClnNode`] implements all three on
//! top of lightningd's unix socket; tests substitute in-memory fakes.

use std::path::PathBuf;

use async_trait::async_trait;
use cln_rpc::{ClnRpc, RpcError};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::errors::{EngineFailure, PayanyError, Result};
use crate::target::{msat_value, Engine};

// ─────────────────────────────────────────────────────────
// Collaborator traits
// ─────────────────────────────────────────────────────────

/// Invoice/offer decoding and BOLT12 invoice fetching.
#[async_trait]
pub trait InvoiceSource: Send + Sync {
    async fn decode(&self, string: &str) -> Result<Decoded>;

    /// Request an invoice for `offer`. `amount_msat` is only sent for offers
    /// without a fixed amount; `payer_note` is omitted when `None`.
    async fn fetch_invoice(
        &self,
        offer: &str,
        amount_msat: Option<u64>,
        payer_note: Option<&str>,
    ) -> Result<String>;
}

/// The routing engines that actually send payments.
#[async_trait]
pub trait PaymentEngine: Send + Sync {
    /// Run `engine` with `params`. Engine errors come back as
    /// [`PayanyError::DownstreamPaymentFailed`].
    async fn submit(&self, engine: Engine, params: Map<String, Value>) -> Result<Value>;

    /// (Re)create a temporary askrene layer named `layer` that disables the
    /// given nodes and directed channels.
    async fn exclusion_layer(&self, layer: &str, nodes: &[String], channels: &[String])
        -> Result<()>;
}

/// The node's configuration store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current value of a boolean option, `None` if the node doesn't know it.
    async fn read_flag(&self, key: &str) -> Result<Option<bool>>;

    async fn write_flag(&self, key: &str, value: bool, transient: bool) -> Result<()>;

    /// The node's version string, e.g. `v25.02`.
    async fn node_version(&self) -> Result<String>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

/// Output of the node's `decode` command, reduced to what we use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Decoded {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub valid: Option<bool>,
    #[serde(default, deserialize_with = "de_msat")]
    pub amount_msat: Option<u64>,
    #[serde(default, deserialize_with = "de_msat")]
    pub offer_amount_msat: Option<u64>,
    #[serde(default)]
    pub offer_currency: Option<String>,
    #[serde(default, deserialize_with = "de_msat")]
    pub invoice_amount_msat: Option<u64>,
    #[serde(default)]
    pub payment_hash: Option<String>,
    #[serde(default)]
    pub description_hash: Option<String>,
}

impl Decoded {
    pub fn is_offer(&self) -> bool {
        self.item_type == "bolt12 offer"
    }

    pub fn is_invoice(&self) -> bool {
        self.item_type == "bolt11 invoice" || self.item_type == "bolt12 invoice"
    }

    /// Amount of a BOLT11 or BOLT12 invoice, `None` for amountless BOLT11.
    pub fn invoice_amount(&self) -> Option<u64> {
        self.invoice_amount_msat.or(self.amount_msat)
    }
}

fn de_msat<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => msat_value(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("not an msat amount: {v}"))),
    }
}

#[derive(Debug, Deserialize)]
struct FetchInvoiceResponse {
    invoice: String,
}

#[derive(Debug, Deserialize)]
struct GetinfoResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct HelpResponse {
    help: Vec<HelpEntry>,
}

#[derive(Debug, Deserialize)]
struct HelpEntry {
    command: String,
}

// ─────────────────────────────────────────────────────────
// lightningd client
// ─────────────────────────────────────────────────────────

/// Talks to lightningd over its JSON-RPC socket. A fresh connection is
/// opened per call so concurrent requests never share one.
#[derive(Debug, Clone)]
pub struct ClnNode {
    rpc_path: PathBuf,
}

impl ClnNode {
    pub fn new(rpc_path: PathBuf) -> Self {
        ClnNode { rpc_path }
    }

    async fn call(&self, method: &str, params: Value) -> Result<std::result::Result<Value, RpcError>> {
        let mut rpc = ClnRpc::new(&self.rpc_path)
            .await
            .map_err(|e| PayanyError::Node(format!("could not connect to lightningd: {e}")))?;
        debug!("calling {method}: {params}");
        Ok(rpc.call_raw::<Value, Value>(method, &params).await)
    }

    async fn call_node(&self, method: &str, params: Value) -> Result<Value> {
        self.call(method, params)
            .await?
            .map_err(|e| PayanyError::Node(format!("{method}: {}", e.message)))
    }

    /// First line of `help <command>`, or `None` when the command does not
    /// exist on this node.
    pub async fn help(&self, command: &str) -> Result<Option<String>> {
        match self.call("help", json!({ "command": command })).await? {
            Ok(value) => {
                let help: HelpResponse = serde_json::from_value(value)?;
                Ok(help.help.into_iter().next().map(|h| h.command))
            }
            Err(e) => {
                debug!("help {command} unavailable: {}", e.message);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl InvoiceSource for ClnNode {
    async fn decode(&self, string: &str) -> Result<Decoded> {
        let value = self
            .call("decode", json!({ "string": string }))
            .await?
            .map_err(|e| PayanyError::resolution(format!("could not decode {string}: {}", e.message)))?;
        let decoded: Decoded = serde_json::from_value(value)?;
        if decoded.valid == Some(false) {
            return Err(PayanyError::resolution(format!(
                "not a valid invoice or offer: {string}"
            )));
        }
        Ok(decoded)
    }

    async fn fetch_invoice(
        &self,
        offer: &str,
        amount_msat: Option<u64>,
        payer_note: Option<&str>,
    ) -> Result<String> {
        let mut params = json!({ "offer": offer });
        if let Some(amount) = amount_msat {
            params["amount_msat"] = json!(amount);
        }
        if let Some(note) = payer_note {
            params["payer_note"] = json!(note);
        }
        let value = self
            .call("fetchinvoice", params)
            .await?
            .map_err(|e| PayanyError::resolution(e.message))?;
        let response: FetchInvoiceResponse = serde_json::from_value(value)?;
        Ok(response.invoice)
    }
}

#[async_trait]
impl PaymentEngine for ClnNode {
    async fn submit(&self, engine: Engine, params: Map<String, Value>) -> Result<Value> {
        self.call(engine.as_str(), Value::Object(params))
            .await?
            .map_err(|e| PayanyError::DownstreamPaymentFailed(EngineFailure::from(e)))
    }

    async fn exclusion_layer(
        &self,
        layer: &str,
        nodes: &[String],
        channels: &[String],
    ) -> Result<()> {
        // A leftover layer from an earlier attempt would be reused otherwise.
        let _ = self
            .call("askrene-remove-layer", json!({ "layer": layer }))
            .await?;
        self.call_node(
            "askrene-create-layer",
            json!({ "layer": layer, "persistent": false }),
        )
        .await?;
        for node in nodes {
            self.call_node(
                "askrene-disable-node",
                json!({ "layer": layer, "node": node }),
            )
            .await?;
        }
        for channel in channels {
            self.call_node(
                "askrene-update-channel",
                json!({ "layer": layer, "short_channel_id_dir": channel, "enabled": false }),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for ClnNode {
    async fn read_flag(&self, key: &str) -> Result<Option<bool>> {
        let value = self.call_node("listconfigs", json!({})).await?;
        Ok(config_flag(&value, key))
    }

    async fn write_flag(&self, key: &str, value: bool, transient: bool) -> Result<()> {
        let mut params = json!({ "config": key, "val": value.to_string() });
        if transient {
            params["transient"] = json!(true);
        }
        self.call_node("setconfig", params).await?;
        Ok(())
    }

    async fn node_version(&self) -> Result<String> {
        let value = self.call_node("getinfo", json!({})).await?;
        let info: GetinfoResponse = serde_json::from_value(value)?;
        Ok(info.version)
    }
}

/// Pull `configs.<key>.value_bool` out of a `listconfigs` response.
fn config_flag(listconfigs: &Value, key: &str) -> Option<bool> {
    listconfigs
        .get("configs")?
        .get(key)?
        .get("value_bool")?
        .as_bool()
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_bolt11_with_amount() {
        let decoded: Decoded = serde_json::from_value(json!({
            "type": "bolt11 invoice",
            "valid": true,
            "amount_msat": 950000,
            "payment_hash": "ab".repeat(32),
            "description_hash": "cd".repeat(32),
        }))
        .unwrap();
        assert!(decoded.is_invoice());
        assert_eq!(decoded.invoice_amount(), Some(950_000));
        assert_eq!(decoded.payment_hash.as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[test]
    fn decode_offer_amount_forms() {
        let fixed: Decoded = serde_json::from_value(json!({
            "type": "bolt12 offer",
            "valid": true,
            "offer_amount_msat": "2000msat",
        }))
        .unwrap();
        assert!(fixed.is_offer());
        assert_eq!(fixed.offer_amount_msat, Some(2000));

        let any: Decoded = serde_json::from_value(json!({
            "type": "bolt12 offer",
            "valid": true,
        }))
        .unwrap();
        assert_eq!(any.offer_amount_msat, None);
    }

    #[test]
    fn decode_bolt12_invoice_prefers_invoice_amount() {
        let decoded: Decoded = serde_json::from_value(json!({
            "type": "bolt12 invoice",
            "invoice_amount_msat": 3000,
        }))
        .unwrap();
        assert_eq!(decoded.invoice_amount(), Some(3000));
    }

    #[test]
    fn config_flag_lookup() {
        let listconfigs = json!({
            "configs": {
                "xpay-handle-pay": { "value_bool": true, "source": "cmdline" },
                "alias": { "value_str": "node" }
            }
        });
        assert_eq!(config_flag(&listconfigs, "xpay-handle-pay"), Some(true));
        assert_eq!(config_flag(&listconfigs, "alias"), None);
        assert_eq!(config_flag(&listconfigs, "missing"), None);
    }
}
