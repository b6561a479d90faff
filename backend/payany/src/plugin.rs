//! lightningd-facing handlers: the `payany` and `payany-budget` methods,
//! the `rpc_command` hook and the `setconfig` callback.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use cln_plugin::{options, Plugin};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::arbiter::{self, OwnershipState};
use crate::bip353::{DnssecResolver, PaymentInstructions};
use crate::config::{self, Config, OPT_BUDGET_AMOUNT_MSAT, OPT_BUDGET_PER};
use crate::db::LedgerStore;
use crate::dispatcher::{Dispatcher, PassThrough};
use crate::errors::{PayanyError, Result};
use crate::ledger::BudgetLedger;
use crate::lnurl::{HttpLnurl, LnurlService};
use crate::node::{ClnNode, ConfigStore, InvoiceSource, PaymentEngine};
use crate::params::{ConfigChange, ParamValue, RpcCommand, PAYANY_ARGS};
use crate::resolver::Resolver;
use crate::target::{Engine, PaymentTarget};

/// Everything payany talks to outside the process.
#[derive(Clone)]
pub struct Services {
    pub invoices: Arc<dyn InvoiceSource>,
    pub engine: Arc<dyn PaymentEngine>,
    pub settings: Arc<dyn ConfigStore>,
    pub lnurl: Arc<dyn LnurlService>,
    pub names: Arc<dyn PaymentInstructions>,
}

impl Services {
    pub fn live(node: Arc<ClnNode>, client: Client, config: Arc<Mutex<Config>>) -> Self {
        Services {
            invoices: node.clone(),
            engine: node.clone(),
            settings: node,
            lnurl: Arc::new(HttpLnurl::new(client)),
            names: Arc::new(DnssecResolver::new(config)),
        }
    }
}

#[derive(Clone)]
pub struct PluginState {
    pub config: Arc<Mutex<Config>>,
    pub ledger: BudgetLedger,
    pub ownership: OwnershipState,
    pub tokens: PassThrough,
    pub store: Option<LedgerStore>,
    pub services: Services,
}

// ─────────────────────────────────────────────────────────
// Hook responses
// ─────────────────────────────────────────────────────────

fn continue_command() -> Value {
    json!({"result": "continue"})
}

fn return_result(result: Value) -> Value {
    json!({"return": {"result": result}})
}

fn return_error(error: Value) -> Value {
    json!({"return": {"error": error}})
}

impl PluginState {
    pub fn new(
        config: Arc<Mutex<Config>>,
        ledger: BudgetLedger,
        store: Option<LedgerStore>,
        services: Services,
    ) -> Self {
        PluginState {
            config,
            ledger,
            ownership: OwnershipState::default(),
            tokens: PassThrough::default(),
            store,
            services,
        }
    }

    fn resolver(&self, strict_lnurl: bool) -> Resolver {
        Resolver::new(
            self.services.invoices.clone(),
            self.services.lnurl.clone(),
            self.services.names.clone(),
        )
        .strict_lnurl(strict_lnurl)
    }

    fn dispatcher(&self, config: &Config) -> Dispatcher {
        let intercepted: HashSet<Engine> = Engine::ALL
            .into_iter()
            .filter(|e| config.intercepts(*e))
            .collect();
        let xpay_args = config
            .xpay_serves_pay()
            .then(|| config.call_args(Engine::Xpay))
            .flatten();
        Dispatcher::new(
            self.resolver(config.strict_lnurl),
            self.services.engine.clone(),
            self.ledger.clone(),
        )
        .with_store(self.store.clone())
        .with_pass_through(self.tokens.clone(), intercepted)
        .with_xpay_for_pay(xpay_args)
    }

    /// `payany`: resolve a target into an invoice without paying it.
    pub async fn resolve_only(&self, params: Value) -> Result<Value> {
        let params = ParamValue::from_json(params)?.to_map("payany", &PAYANY_ARGS)?;
        let target = PaymentTarget::from_params(params, PAYANY_ARGS[0])?;
        let strict = self.config.lock().strict_lnurl;
        let resolved = self.resolver(strict).resolve(&target).await?;
        Ok(resolved.to_json())
    }

    /// Decide what lightningd should do with an incoming command.
    pub async fn on_rpc_command(&self, args: Value) -> Value {
        let command = match serde_json::from_value::<RpcCommand>(args) {
            Ok(c) => c.rpc_command,
            Err(e) => {
                debug!("unparseable rpc_command: {e}");
                return continue_command();
            }
        };

        if command.method == "setconfig" {
            return self.vet_setconfig(&command.params);
        }
        match Engine::from_method(&command.method) {
            Some(engine) => self.intercept_payment(engine, &command.params).await,
            None => continue_command(),
        }
    }

    fn vet_setconfig(&self, params: &ParamValue) -> Value {
        let change = match ConfigChange::from_params(params) {
            Ok(change) => change,
            // Let lightningd produce its own error for malformed calls.
            Err(_) => return continue_command(),
        };
        match arbiter::guard_config_change(&self.ownership, &change) {
            Ok(()) => continue_command(),
            Err(e) => return_error(e.to_rpc_error()),
        }
    }

    async fn intercept_payment(&self, engine: Engine, params: &ParamValue) -> Value {
        let prepared = {
            let config = self.config.lock();
            let args = match config.call_args(engine) {
                Some(args) if config.intercept_configured(engine) => args,
                _ => return continue_command(),
            };
            (args, self.dispatcher(&config))
        };
        let (args, dispatcher) = prepared;

        debug!("{engine} params: {params:?}");
        let params = match params.to_map(engine.as_str(), &args) {
            Ok(p) => p,
            Err(e) => {
                info!("{e}");
                return return_error(e.to_rpc_error());
            }
        };

        if let Some(Value::String(invstring)) = params.get(engine.invstring_field()) {
            if self.tokens.take(invstring) {
                debug!(
                    "passing own {engine} call through, {} tokens outstanding",
                    self.tokens.outstanding()
                );
                return continue_command();
            }
        }

        match dispatcher.dispatch(params, engine).await {
            Ok(result) => return_result(result),
            Err(e) => {
                info!("payany {engine} failed: {e}");
                return_error(e.to_rpc_error_with_context())
            }
        }
    }

    /// Validate and store a runtime option change. Returns the value to hand
    /// back to lightningd.
    pub fn apply_setconfig(&self, args: &Value) -> Result<(String, options::Value)> {
        let name = args
            .get("config")
            .and_then(Value::as_str)
            .ok_or_else(|| PayanyError::Config("Bad CLN object. No option name found!".to_string()))?;
        let value = args.get("val").ok_or_else(|| {
            PayanyError::Config(format!("Bad CLN object. No value found for option: {name}"))
        })?;
        let opt_value = config::parse_option(name, value)?;

        let budget = {
            let mut config = self.config.lock();
            let mut next = config.clone();
            next.apply(name, &opt_value)?;
            let budget = next.budget()?;
            *config = next;
            budget
        };
        if name == OPT_BUDGET_PER || name == OPT_BUDGET_AMOUNT_MSAT {
            self.ledger.reconfigure(budget);
        }
        info!("{name} set to {value}");
        Ok((name.to_string(), opt_value))
    }
}

// ─────────────────────────────────────────────────────────
// cln-plugin callbacks
// ─────────────────────────────────────────────────────────

/// `payany invstring [amount_msat] [message]`
pub async fn payany_method(plugin: Plugin<PluginState>, args: Value) -> anyhow::Result<Value> {
    plugin.state().resolve_only(args).await.map_err(|e| {
        info!("payany could not fetch invoice: {e}");
        anyhow!(e.to_rpc_error())
    })
}

/// `payany-budget`
pub async fn budget_method(plugin: Plugin<PluginState>, _args: Value) -> anyhow::Result<Value> {
    Ok(json!(plugin.state().ledger.usage()))
}

pub async fn rpc_command_hook(plugin: Plugin<PluginState>, args: Value) -> anyhow::Result<Value> {
    Ok(plugin.state().on_rpc_command(args).await)
}

pub async fn setconfig_callback(plugin: Plugin<PluginState>, args: Value) -> anyhow::Result<Value> {
    let (name, value) = plugin.state().apply_setconfig(&args).map_err(|e| {
        warn!("setconfig rejected: {e}");
        anyhow!(e.to_rpc_error())
    })?;
    plugin
        .set_option_str(&name, value)
        .map_err(|e| anyhow!(PayanyError::Config(e.to_string()).to_rpc_error()))?;
    Ok(json!({}))
}
