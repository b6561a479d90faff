//! Payment targets and the invoices they resolve to.
//!
//! A [`PaymentTarget`] is what the caller handed us: an invoice, an offer, a
//! lightning address or an LNURL, plus an optional amount, payer note and the
//! routing parameters meant for the engine. A [`ResolvedInvoice`] is what we
//! actually pay.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{PayanyError, Result};

/// URI prefixes stripped before classification.
pub const URI_SCHEMES: [&str; 3] = ["lightning:", "lno:", "lnurl:"];

/// Parameter name of the payer note; never forwarded to an engine.
pub const MESSAGE_FIELD: &str = "message";
pub const AMOUNT_FIELD: &str = "amount_msat";

const PAY_ARGS: [&str; 14] = [
    "bolt11",
    "amount_msat",
    "label",
    "riskfactor",
    "maxfeepercent",
    "retry_for",
    "maxdelay",
    "exemptfee",
    "localinvreqid",
    "exclude",
    "maxfee",
    "description",
    "partial_msat",
    "message",
];

const XPAY_ARGS: [&str; 8] = [
    "invstring",
    "amount_msat",
    "maxfee",
    "layers",
    "retry_for",
    "partial_msat",
    "maxdelay",
    "message",
];

const RENEPAY_ARGS: [&str; 9] = [
    "invstring",
    "amount_msat",
    "maxfee",
    "maxdelay",
    "retry_for",
    "description",
    "label",
    "exclude",
    "message",
];

/// The payment engines a resolved invoice can be handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Pay,
    Xpay,
    Renepay,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Pay, Engine::Xpay, Engine::Renepay];

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "pay" => Some(Self::Pay),
            "xpay" => Some(Self::Xpay),
            "renepay" => Some(Self::Renepay),
            _ => None,
        }
    }

    /// The RPC method name of the engine.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pay => "pay",
            Self::Xpay => "xpay",
            Self::Renepay => "renepay",
        }
    }

    /// Name of the parameter carrying the invoice string.
    pub fn invstring_field(&self) -> &'static str {
        match self {
            Self::Pay => "bolt11",
            Self::Xpay | Self::Renepay => "invstring",
        }
    }

    /// Positional argument order used until `help` tells us otherwise.
    pub fn default_args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Pay => &PAY_ARGS,
            Self::Xpay => &XPAY_ARGS,
            Self::Renepay => &RENEPAY_ARGS,
        };
        args.iter().map(|a| a.to_string()).collect()
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an msat amount the way lightningd accepts it: a bare integer, or a
/// string with an optional `msat` / `sat` suffix.
pub fn msat_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            if let Some(msat) = s.strip_suffix("msat") {
                msat.parse().ok()
            } else if let Some(sat) = s.strip_suffix("sat") {
                sat.parse::<u64>().ok()?.checked_mul(1000)
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

/// Everything in a payment call that isn't the target, amount or note. These
/// pass through to the engine untouched unless a conversion rewrites them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingHints(Map<String, Value>);

impl RoutingHints {
    pub fn new(params: Map<String, Value>) -> Self {
        RoutingHints(params)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn maxfee(&self) -> Option<&Value> {
        self.get("maxfee")
    }

    pub fn maxfeepercent(&self) -> Option<&Value> {
        self.get("maxfeepercent")
    }

    pub fn exemptfee(&self) -> Option<&Value> {
        self.get("exemptfee")
    }

    pub fn exclude(&self) -> Option<&Value> {
        self.get("exclude")
    }

    /// True when the caller constrained fees in any of the supported ways.
    pub fn has_fee_limit(&self) -> bool {
        self.maxfee().is_some() || self.maxfeepercent().is_some() || self.exemptfee().is_some()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// A payment request as received, after call-shape normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentTarget {
    pub invstring: String,
    pub amount_msat: Option<u64>,
    pub message: Option<String>,
    pub hints: RoutingHints,
}

impl PaymentTarget {
    /// Build a target from a canonical parameter map. `field` names the
    /// parameter holding the invoice string for the called entry point.
    pub fn from_params(mut params: Map<String, Value>, field: &str) -> Result<Self> {
        let invstring = match params.remove(field) {
            None | Some(Value::Null) => {
                return Err(PayanyError::MissingParameter(field.to_string()))
            }
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(PayanyError::InvalidParameter(format!(
                    "{field}: should be a string: {other}"
                )))
            }
        };

        let amount_msat = match params.remove(AMOUNT_FIELD) {
            None | Some(Value::Null) => None,
            Some(v) => Some(msat_value(&v).ok_or_else(|| {
                PayanyError::InvalidParameter(format!(
                    "{AMOUNT_FIELD}: should be a millisatoshi amount: {v}"
                ))
            })?),
        };

        let message = match params.remove(MESSAGE_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(PayanyError::InvalidParameter(format!(
                    "{MESSAGE_FIELD}: should be a string: {other}"
                )))
            }
        };

        Ok(PaymentTarget {
            invstring,
            amount_msat,
            message,
            hints: RoutingHints::new(params),
        })
    }
}

/// How a lightning address or LNURL is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressTarget {
    /// `user@host`, resolved via BIP-353 or LNURL-pay.
    LightningAddress { user: String, host: String },
    /// A bech32-encoded LNURL (`lnurl1…`).
    Lnurl { encoded: String },
}

/// The shape of a target string, determined without any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetForm {
    Invoice(String),
    Offer(String),
    Address(AddressTarget),
}

impl TargetForm {
    /// Classify a raw target string. URI schemes are stripped and the string
    /// is lower-cased.
    pub fn classify(raw: &str) -> Result<Self> {
        let mut s = raw.trim().to_lowercase();
        for scheme in URI_SCHEMES {
            if let Some(rest) = s.strip_prefix(scheme) {
                s = rest.to_string();
                break;
            }
        }

        if s.starts_with("lnurl") && !s.contains('@') {
            return Ok(Self::Address(AddressTarget::Lnurl { encoded: s }));
        }
        if s.contains('@') {
            return match s.split('@').collect::<Vec<_>>().as_slice() {
                [user, host] if !user.is_empty() && !host.is_empty() => {
                    Ok(Self::Address(AddressTarget::LightningAddress {
                        user: user.to_string(),
                        host: host.to_string(),
                    }))
                }
                _ => Err(PayanyError::resolution(format!("LN-address invalid: {s}"))),
            };
        }
        if s.starts_with("lno") {
            return Ok(Self::Offer(s));
        }
        Ok(Self::Invoice(s))
    }
}

/// What kind of payment a target turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    /// A BOLT11 or BOLT12 invoice; `None` for an amountless BOLT11.
    FixedInvoice { amount_msat: Option<u64> },
    AnyAmountOffer,
    FixedAmountOffer { amount_msat: u64 },
    AddressLookup(AddressTarget),
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedInvoice { .. } => "fixed_invoice",
            Self::AnyAmountOffer => "any_amount_offer",
            Self::FixedAmountOffer { .. } => "fixed_amount_offer",
            Self::AddressLookup(_) => "address_lookup",
        }
    }
}

/// A concrete invoice with the amount that will be paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInvoice {
    pub invoice: String,
    pub amount_msat: u64,
    pub payer_note: Option<String>,
    pub payment_hash: Option<String>,
    /// False only for amountless invoices, where the engine needs
    /// `amount_msat` alongside the invoice.
    pub amount_in_invoice: bool,
}

impl ResolvedInvoice {
    pub fn new(invoice: String, amount_msat: u64, amount_in_invoice: bool) -> Result<Self> {
        if amount_msat == 0 {
            return Err(PayanyError::InvalidParameter(
                "amount_msat: must be greater than 0".to_string(),
            ));
        }
        Ok(ResolvedInvoice {
            invoice,
            amount_msat,
            payer_note: None,
            payment_hash: None,
            amount_in_invoice,
        })
    }

    pub fn with_payer_note(mut self, note: Option<String>) -> Self {
        self.payer_note = note;
        self
    }

    pub fn with_payment_hash(mut self, hash: Option<String>) -> Self {
        self.payment_hash = hash;
        self
    }

    /// Response body of the `payany` method.
    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "invoice": self.invoice,
            "amount_msat": self.amount_msat,
        });
        if let Some(hash) = &self.payment_hash {
            out["payment_hash"] = json!(hash);
        }
        if let Some(note) = &self.payer_note {
            out["payer_note"] = json!(note);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn engine_from_method() {
        assert_eq!(Engine::from_method("pay"), Some(Engine::Pay));
        assert_eq!(Engine::from_method("xpay"), Some(Engine::Xpay));
        assert_eq!(Engine::from_method("renepay"), Some(Engine::Renepay));
        assert_eq!(Engine::from_method("keysend"), None);
        assert_eq!(Engine::Pay.invstring_field(), "bolt11");
        assert_eq!(Engine::Renepay.invstring_field(), "invstring");
    }

    #[test]
    fn msat_value_forms() {
        assert_eq!(msat_value(&json!(2500)), Some(2500));
        assert_eq!(msat_value(&json!("2500msat")), Some(2500));
        assert_eq!(msat_value(&json!("3sat")), Some(3000));
        assert_eq!(msat_value(&json!("42")), Some(42));
        assert_eq!(msat_value(&json!(-1)), None);
        assert_eq!(msat_value(&json!("lots")), None);
    }

    #[test]
    fn target_from_params_splits_fields() {
        let target = PaymentTarget::from_params(
            params(json!({
                "bolt11": "lnbc1xyz",
                "amount_msat": 2000,
                "message": "hi",
                "riskfactor": 5,
            })),
            "bolt11",
        )
        .unwrap();
        assert_eq!(target.invstring, "lnbc1xyz");
        assert_eq!(target.amount_msat, Some(2000));
        assert_eq!(target.message.as_deref(), Some("hi"));
        assert_eq!(target.hints.get("riskfactor"), Some(&json!(5)));
        assert!(target.hints.get("bolt11").is_none());
    }

    #[test]
    fn omitted_message_is_not_empty_message() {
        let omitted =
            PaymentTarget::from_params(params(json!({"invstring": "lno1x"})), "invstring")
                .unwrap();
        let empty = PaymentTarget::from_params(
            params(json!({"invstring": "lno1x", "message": ""})),
            "invstring",
        )
        .unwrap();
        assert_eq!(omitted.message, None);
        assert_eq!(empty.message.as_deref(), Some(""));
    }

    #[test]
    fn missing_target_names_the_field() {
        let err = PaymentTarget::from_params(Map::new(), "invstring").unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: invstring");
        let err =
            PaymentTarget::from_params(params(json!({"bolt11": null})), "bolt11").unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: bolt11");
    }

    #[test]
    fn classify_forms() {
        assert_eq!(
            TargetForm::classify("LIGHTNING:LNBC10N1ABC").unwrap(),
            TargetForm::Invoice("lnbc10n1abc".to_string())
        );
        assert_eq!(
            TargetForm::classify("lno:lno1qgsq").unwrap(),
            TargetForm::Offer("lno1qgsq".to_string())
        );
        assert_eq!(
            TargetForm::classify("TestUser@127.0.0.1:8080").unwrap(),
            TargetForm::Address(AddressTarget::LightningAddress {
                user: "testuser".to_string(),
                host: "127.0.0.1:8080".to_string(),
            })
        );
        assert!(matches!(
            TargetForm::classify("lightning:LNURL1DP68GURN8GHJ7").unwrap(),
            TargetForm::Address(AddressTarget::Lnurl { .. })
        ));
        assert!(TargetForm::classify("a@b@c").is_err());
        assert!(TargetForm::classify("@host").is_err());
    }

    #[test]
    fn resolved_invoice_rejects_zero_amount() {
        assert!(ResolvedInvoice::new("lnbc".to_string(), 0, true).is_err());
        let inv = ResolvedInvoice::new("lnbc".to_string(), 1000, true)
            .unwrap()
            .with_payer_note(Some("note".to_string()));
        let body = inv.to_json();
        assert_eq!(body["amount_msat"], 1000);
        assert_eq!(body["payer_note"], "note");
        assert!(body.get("payment_hash").is_none());
    }
}
