//! Call-shape normalization.
//!
//! lightningd hands us parameters as a JSON object, a positional array or a
//! bare string. Everything past this module works on one canonical
//! `Map<String, Value>`.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::errors::{PayanyError, Result};
use crate::target::MESSAGE_FIELD;

/// Positional order of the `payany` method.
pub const PAYANY_ARGS: [&str; 3] = ["invstring", "amount_msat", "message"];

/// Positional order of lightningd's `setconfig`.
pub const SETCONFIG_ARGS: [&str; 3] = ["config", "val", "transient"];

/// Body of an `rpc_command` hook call.
#[derive(Debug, Deserialize)]
pub struct RpcCommand {
    pub rpc_command: RpcDetails,
}

#[derive(Debug, Deserialize)]
pub struct RpcDetails {
    pub method: String,
    #[serde(default)]
    pub params: ParamValue,
}

/// The three call shapes lightningd forwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Array(Vec<Value>),
    Object(Map<String, Value>),
    String(String),
}

impl Default for ParamValue {
    fn default() -> Self {
        ParamValue::Object(Map::new())
    }
}

impl ParamValue {
    /// Parse a raw JSON params value; `null` counts as no parameters.
    pub fn from_json(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(ParamValue::default());
        }
        serde_json::from_value(value).map_err(|_| {
            PayanyError::InvalidParameter("params must be an object, array or string".to_string())
        })
    }

    /// Name positional parameters after `args`. Objects pass through
    /// unchanged; a bare string fills the first argument.
    pub fn to_map<S: AsRef<str>>(&self, method: &str, args: &[S]) -> Result<Map<String, Value>> {
        let mut params = Map::new();
        match self {
            ParamValue::Object(map) => params = map.clone(),
            ParamValue::Array(values) => {
                if values.len() > args.len() {
                    return Err(PayanyError::InvalidParameter(format!(
                        "payany: too many arguments for {method}: {} > {}",
                        values.len(),
                        args.len()
                    )));
                }
                for (name, value) in args.iter().zip(values) {
                    params.insert(name.as_ref().to_string(), value.clone());
                }
            }
            ParamValue::String(s) => {
                let first = args.first().ok_or_else(|| {
                    PayanyError::InvalidParameter(format!("{method} takes no arguments"))
                })?;
                params.insert(first.as_ref().to_string(), json!(s));
            }
        }
        Ok(params)
    }
}

/// Turn the synopsis line of `help <command>` (e.g.
/// `xpay invstring [amount_msat] [maxfee]`) into positional argument names.
/// `message` is appended since every intercepted command accepts it.
pub fn parse_help_args(synopsis: &str, method: &str) -> Vec<String> {
    let mut args: Vec<String> = synopsis
        .split_whitespace()
        .filter(|arg| *arg != method)
        .map(|arg| arg.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|arg| !arg.is_empty())
        .collect();
    if !args.iter().any(|a| a == MESSAGE_FIELD) {
        args.push(MESSAGE_FIELD.to_string());
    }
    args
}

/// A normalized `setconfig` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub key: String,
    /// `None` when the caller gave just the key, which lightningd treats as
    /// setting a flag to true.
    pub value: Option<Value>,
}

impl ConfigChange {
    pub fn from_params(params: &ParamValue) -> Result<Self> {
        let mut map = params.to_map("setconfig", &SETCONFIG_ARGS)?;
        let key = match map.remove("config") {
            Some(Value::String(key)) => key,
            Some(other) => {
                return Err(PayanyError::InvalidParameter(format!(
                    "config: should be a string: {other}"
                )))
            }
            None => return Err(PayanyError::MissingParameter("config".to_string())),
        };
        let value = map.remove("val").filter(|v| !v.is_null());
        Ok(ConfigChange { key, value })
    }

    /// True only for an unambiguous `false`.
    pub fn sets_false(&self) -> bool {
        match &self.value {
            Some(Value::Bool(b)) => !b,
            Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("false"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(v: Value) -> ParamValue {
        ParamValue::from_json(v).unwrap()
    }

    #[test]
    fn object_shape_passes_through() {
        let map = shape(json!({"bolt11": "lnbc1", "riskfactor": 3}))
            .to_map("pay", &["bolt11", "amount_msat"])
            .unwrap();
        assert_eq!(map["bolt11"], "lnbc1");
        assert_eq!(map["riskfactor"], 3);
    }

    #[test]
    fn array_shape_is_named_positionally() {
        let map = shape(json!(["lno1abc", 5000, "hi"]))
            .to_map("payany", &PAYANY_ARGS)
            .unwrap();
        assert_eq!(map["invstring"], "lno1abc");
        assert_eq!(map["amount_msat"], 5000);
        assert_eq!(map["message"], "hi");
    }

    #[test]
    fn too_many_positional_arguments() {
        let err = shape(json!(["a", 1, "m", "extra"]))
            .to_map("payany", &PAYANY_ARGS)
            .unwrap_err();
        assert!(err.to_string().starts_with("payany: too many arguments"));
    }

    #[test]
    fn bare_string_and_null_shapes() {
        let map = shape(json!("lnbc1")).to_map("pay", &["bolt11"]).unwrap();
        assert_eq!(map["bolt11"], "lnbc1");
        assert!(shape(Value::Null).to_map("pay", &["bolt11"]).unwrap().is_empty());
        assert!(shape(json!([])).to_map("pay", &["bolt11"]).unwrap().is_empty());
        assert!(ParamValue::from_json(json!(42)).is_err());
    }

    #[test]
    fn help_synopsis_becomes_arg_names() {
        let args = parse_help_args(
            "xpay invstring [amount_msat] [maxfee] [layers] [retry_for] [partial_msat]",
            "xpay",
        );
        assert_eq!(
            args,
            vec![
                "invstring",
                "amount_msat",
                "maxfee",
                "layers",
                "retry_for",
                "partial_msat",
                "message"
            ]
        );
    }

    #[test]
    fn rpc_command_without_params() {
        let cmd: RpcCommand =
            serde_json::from_value(json!({"rpc_command": {"id": 1, "method": "getinfo"}}))
                .unwrap();
        assert_eq!(cmd.rpc_command.method, "getinfo");
        assert_eq!(cmd.rpc_command.params, ParamValue::default());
    }

    #[test]
    fn setconfig_call_shapes() {
        let object = ConfigChange::from_params(&shape(
            json!({"config": "xpay-handle-pay", "val": true}),
        ))
        .unwrap();
        assert_eq!(object.key, "xpay-handle-pay");
        assert!(!object.sets_false());

        let bare_key =
            ConfigChange::from_params(&shape(json!({"config": "xpay-handle-pay"}))).unwrap();
        assert_eq!(bare_key.value, None);
        assert!(!bare_key.sets_false());

        let array = ConfigChange::from_params(&shape(json!(["xpay-handle-pay", "false"]))).unwrap();
        assert!(array.sets_false());

        let string = ConfigChange::from_params(&shape(json!("xpay-handle-pay"))).unwrap();
        assert_eq!(string.key, "xpay-handle-pay");
        assert!(!string.sets_false());

        let off = ConfigChange::from_params(&shape(
            json!({"config": "xpay-handle-pay", "val": false}),
        ))
        .unwrap();
        assert!(off.sets_false());

        assert!(matches!(
            ConfigChange::from_params(&shape(json!({}))),
            Err(PayanyError::MissingParameter(_))
        ));
    }
}
