//! Plugin configuration loaded from lightningd options.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use cln_plugin::options;
use regex::Regex;
use serde_json::Value;

use crate::errors::{PayanyError, Result};
use crate::ledger::BudgetConfig;
use crate::target::Engine;

pub const OPT_BUDGET_PER: &str = "payany-budget-per";
pub const OPT_BUDGET_AMOUNT_MSAT: &str = "payany-budget-amount-msat";
pub const OPT_XPAY_HANDLE_PAY: &str = "payany-xpay-handle-pay";
pub const OPT_STRICT_LNURL: &str = "payany-strict-lnurl";
pub const OPT_DNS_SERVER: &str = "payany-dns-server";
pub const OPT_LEDGER_DB: &str = "payany-ledger-db";
pub const OPT_INTERCEPT_PAY: &str = "payany-intercept-pay";
pub const OPT_INTERCEPT_XPAY: &str = "payany-intercept-xpay";
pub const OPT_INTERCEPT_RENEPAY: &str = "payany-intercept-renepay";

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl TimeUnit {
    fn seconds(self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 60 * 60,
            TimeUnit::Day => 24 * 60 * 60,
            TimeUnit::Week => 7 * 24 * 60 * 60,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = PayanyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(TimeUnit::Second),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(TimeUnit::Minute),
            "h" | "hour" | "hours" => Ok(TimeUnit::Hour),
            "d" | "day" | "days" => Ok(TimeUnit::Day),
            "w" | "week" | "weeks" => Ok(TimeUnit::Week),
            _ => Err(PayanyError::Config(format!("Unsupported time unit: {s}"))),
        }
    }
}

/// Parse a period like `5 hours` or `3d` into seconds.
pub fn parse_time_period(input: &str) -> Result<u64> {
    let re = Regex::new(r"^\s*(\d+)\s*([a-zA-Z]+)\s*$")
        .map_err(|e| PayanyError::Config(e.to_string()))?;
    let caps = re
        .captures(input)
        .ok_or_else(|| PayanyError::Config(format!("Invalid time format: {input}")))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|_| PayanyError::Config(format!("Invalid time format: {input}")))?;
    let unit: TimeUnit = caps[2].to_lowercase().parse()?;
    value
        .checked_mul(unit.seconds())
        .ok_or_else(|| PayanyError::Config(format!("Time period too long: {input}")))
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Length of the rolling budget window, in seconds
    pub budget_per: Option<u64>,
    /// Maximum spend inside one window
    pub budget_amount_msat: Option<u64>,
    /// Serve the `pay` entry point with `xpay`
    pub xpay_handle_pay: bool,
    pub strict_lnurl: bool,
    /// Upstream DNS server for BIP-353 lookups. `None` uses the resolver's
    /// defaults.
    pub dns_server: Option<SocketAddr>,
    /// Optional SQLite file persisting ledger entries
    pub ledger_db: Option<String>,
    intercept: HashMap<Engine, bool>,
    /// Positional argument names per engine, filled in once `help` has been
    /// consulted. Engines the node doesn't have are absent.
    engine_args: HashMap<Engine, Vec<String>>,
    /// Set once every engine has been looked up with `help`.
    engines_discovered: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            budget_per: None,
            budget_amount_msat: None,
            xpay_handle_pay: false,
            strict_lnurl: false,
            dns_server: None,
            ledger_db: None,
            intercept: Engine::ALL.iter().map(|e| (*e, true)).collect(),
            engine_args: HashMap::new(),
            engines_discovered: false,
        }
    }
}

impl Config {
    /// Build the startup configuration from `(name, value)` pairs as
    /// returned by `ConfiguredPlugin::option_str`.
    pub fn from_options<'a, I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, options::Value)>,
    {
        let mut config = Config::default();
        for (name, value) in values {
            config.apply(name, &value)?;
        }
        match (config.budget_per, config.budget_amount_msat) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => return Err(PayanyError::Config("Incomplete Budget options!".to_string())),
        }
        config.budget()?;
        Ok(config)
    }

    /// Store one option value.
    pub fn apply(&mut self, name: &str, value: &options::Value) -> Result<()> {
        match name {
            OPT_BUDGET_PER => self.budget_per = Some(parse_time_period(expect_str(name, value)?)?),
            OPT_BUDGET_AMOUNT_MSAT => {
                let amount = value
                    .as_i64()
                    .ok_or_else(|| PayanyError::Config(format!("{name} is not a valid integer!")))?;
                let amount = u64::try_from(amount).map_err(|_| {
                    PayanyError::Config(format!(
                        "{name} needs to be a positive number and not `{amount}`."
                    ))
                })?;
                self.budget_amount_msat = Some(amount);
            }
            OPT_XPAY_HANDLE_PAY => self.xpay_handle_pay = expect_bool(name, value)?,
            OPT_STRICT_LNURL => self.strict_lnurl = expect_bool(name, value)?,
            OPT_DNS_SERVER => {
                self.dns_server = parse_dns_server(name, expect_str(name, value)?)?;
            }
            OPT_LEDGER_DB => self.ledger_db = Some(expect_str(name, value)?.to_string()),
            OPT_INTERCEPT_PAY => self.set_intercept(Engine::Pay, expect_bool(name, value)?),
            OPT_INTERCEPT_XPAY => self.set_intercept(Engine::Xpay, expect_bool(name, value)?),
            OPT_INTERCEPT_RENEPAY => self.set_intercept(Engine::Renepay, expect_bool(name, value)?),
            _ => return Err(PayanyError::Config(format!("Unknown option: {name}"))),
        }
        Ok(())
    }

    /// The active budget, `None` unless both budget options are set.
    pub fn budget(&self) -> Result<Option<BudgetConfig>> {
        match (self.budget_per, self.budget_amount_msat) {
            (Some(per), Some(amount)) => Ok(Some(BudgetConfig::new(per, amount)?)),
            _ => Ok(None),
        }
    }

    fn set_intercept(&mut self, engine: Engine, on: bool) {
        self.intercept.insert(engine, on);
    }

    pub fn set_engine_args(&mut self, engine: Engine, args: Vec<String>) {
        self.engine_args.insert(engine, args);
    }

    /// Discovery is over: engines without arguments are not on this node.
    pub fn mark_engines_discovered(&mut self) {
        self.engines_discovered = true;
    }

    /// Argument names to read positional calls with. Until discovery ends
    /// every engine is assumed present with its built-in argument list.
    pub fn call_args(&self, engine: Engine) -> Option<Vec<String>> {
        match self.engine_args.get(&engine) {
            Some(args) => Some(args.clone()),
            None if !self.engines_discovered => Some(engine.default_args()),
            None => None,
        }
    }

    /// Whether calls to `engine` go through payany. Requires the option to
    /// be on and the engine to exist on this node, or discovery to still be
    /// running so no payment slips past the budget.
    pub fn intercepts(&self, engine: Engine) -> bool {
        self.intercept_configured(engine) && self.call_args(engine).is_some()
    }

    pub fn intercept_configured(&self, engine: Engine) -> bool {
        self.intercept.get(&engine).copied().unwrap_or(false)
    }

    /// `pay` calls are sent to `xpay` only when asked for and xpay exists.
    pub fn xpay_serves_pay(&self) -> bool {
        self.xpay_handle_pay && self.call_args(Engine::Xpay).is_some()
    }
}

/// Convert a `setconfig` value into the option type `name` expects. Only
/// the dynamic options are accepted.
pub fn parse_option(name: &str, value: &Value) -> Result<options::Value> {
    match name {
        OPT_BUDGET_AMOUNT_MSAT => value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(options::Value::Integer)
            .ok_or_else(|| PayanyError::Config(format!("{name} is not a valid integer!"))),
        OPT_XPAY_HANDLE_PAY | OPT_STRICT_LNURL => value
            .as_bool()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(options::Value::Boolean)
            .ok_or_else(|| PayanyError::Config(format!("{name} is not a valid boolean!"))),
        OPT_BUDGET_PER | OPT_DNS_SERVER => value
            .as_str()
            .map(|s| options::Value::String(s.to_string()))
            .ok_or_else(|| PayanyError::Config(format!("{name} is not a valid string!"))),
        _ => Err(PayanyError::Config(format!("{name} cannot be changed at runtime"))),
    }
}

/// `ip` or `ip:port` (`[v6]:port` for IPv6). Port 53 when omitted, an empty
/// value clears the setting.
fn parse_dns_server(name: &str, value: &str) -> Result<Option<SocketAddr>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<SocketAddr>()
        .or_else(|_| value.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
        .map(Some)
        .map_err(|_| PayanyError::Config(format!("{name} is not a valid ip or ip:port: {value}")))
}

fn expect_str<'a>(name: &str, value: &'a options::Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| PayanyError::Config(format!("{name} is not a valid string!")))
}

fn expect_bool(name: &str, value: &options::Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| PayanyError::Config(format!("{name} is not a valid boolean!")))
}
