//! payany: a Core Lightning plugin that lets `pay`, `xpay` and `renepay`
//! accept BOLT12 offers, LNURL and lightning addresses, with an optional
//! rolling spend budget.
//!
//! Payment calls are caught in the `rpc_command` hook, resolved into a
//! concrete invoice, checked against the budget and handed to the engine.

mod arbiter;
mod bip353;
mod config;
mod db;
mod dispatcher;
mod errors;
mod ledger;
mod lnurl;
mod node;
mod params;
mod plugin;
mod resolver;
mod startup;
mod target;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use cln_plugin::options::ConfigOption;
use cln_plugin::Builder;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{
    Config, OPT_BUDGET_AMOUNT_MSAT, OPT_BUDGET_PER, OPT_DNS_SERVER, OPT_INTERCEPT_PAY,
    OPT_INTERCEPT_RENEPAY, OPT_INTERCEPT_XPAY, OPT_LEDGER_DB, OPT_STRICT_LNURL,
    OPT_XPAY_HANDLE_PAY,
};
use db::LedgerStore;
use ledger::BudgetLedger;
use node::ClnNode;
use plugin::{PluginState, Services};

const OPTION_NAMES: [&str; 9] = [
    OPT_BUDGET_PER,
    OPT_BUDGET_AMOUNT_MSAT,
    OPT_XPAY_HANDLE_PAY,
    OPT_STRICT_LNURL,
    OPT_DNS_SERVER,
    OPT_LEDGER_DB,
    OPT_INTERCEPT_PAY,
    OPT_INTERCEPT_XPAY,
    OPT_INTERCEPT_RENEPAY,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // cln-plugin forwards `log` records to lightningd; tracing events reach
    // it through tracing's `log-always` feature.
    std::env::set_var("CLN_PLUGIN_LOG", "payany=debug,info");
    // stdout belongs to the JSON-RPC stream, so the subscriber writes to
    // stderr. Installed without `init()` to leave the `log` logger alone.
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("payany=debug,info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(configured) = Builder::new(tokio::io::stdin(), tokio::io::stdout())
        .option(
            ConfigOption::new_str_no_default(
                OPT_BUDGET_PER,
                "Rolling budget window, e.g. `1 day` or `12h`",
            )
            .dynamic(),
        )
        .option(
            ConfigOption::new_i64_no_default(
                OPT_BUDGET_AMOUNT_MSAT,
                "Maximum msat payany may spend per budget window",
            )
            .dynamic(),
        )
        .option(
            ConfigOption::new_bool_with_default(
                OPT_XPAY_HANDLE_PAY,
                false,
                "Send intercepted `pay` calls to xpay",
            )
            .dynamic(),
        )
        .option(
            ConfigOption::new_bool_with_default(
                OPT_STRICT_LNURL,
                false,
                "Enforce LUD-06/LUD-16 checks on LNURL responses",
            )
            .dynamic(),
        )
        .option(
            ConfigOption::new_str_no_default(
                OPT_DNS_SERVER,
                "DNS server (ip or ip:port) for DNSSEC-validated BIP-353 lookups",
            )
            .dynamic(),
        )
        .option(ConfigOption::new_str_no_default(
            OPT_LEDGER_DB,
            "SQLite file keeping budget spend across restarts",
        ))
        .option(ConfigOption::new_bool_with_default(
            OPT_INTERCEPT_PAY,
            true,
            "Intercept `pay`",
        ))
        .option(ConfigOption::new_bool_with_default(
            OPT_INTERCEPT_XPAY,
            true,
            "Intercept `xpay`",
        ))
        .option(ConfigOption::new_bool_with_default(
            OPT_INTERCEPT_RENEPAY,
            true,
            "Intercept `renepay`",
        ))
        .rpcmethod(
            "payany",
            "fetch invoice for static ln payment method",
            plugin::payany_method,
        )
        .rpcmethod(
            "payany-budget",
            "show budget window, spend and what is left",
            plugin::budget_method,
        )
        .hook("rpc_command", plugin::rpc_command_hook)
        .setconfig_callback(plugin::setconfig_callback)
        .dynamic()
        .configure()
        .await?
    else {
        return Ok(());
    };

    let mut options = Vec::with_capacity(OPTION_NAMES.len());
    for name in OPTION_NAMES {
        if let Some(value) = configured.option_str(name)? {
            options.push((name, value));
        }
    }
    let config = match Config::from_options(options) {
        Ok(config) => config,
        Err(e) => {
            warn!("payany disabled: {e}");
            return configured.disable(&e.to_string()).await;
        }
    };

    let cln = configured.configuration();
    let ledger = BudgetLedger::new(config.budget()?);
    let store = match &config.ledger_db {
        Some(file) => {
            let path = Path::new(&cln.lightning_dir).join(file);
            let store = LedgerStore::open(&path.to_string_lossy()).await?;
            startup::restore_ledger(&store, &ledger).await?;
            Some(store)
        }
        None => None,
    };

    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    let node = Arc::new(ClnNode::new(
        Path::new(&cln.lightning_dir).join(&cln.rpc_file),
    ));
    let config = Arc::new(Mutex::new(config));
    let services = Services::live(node.clone(), client, config.clone());
    let state = PluginState::new(config, ledger, store, services);

    let plugin = configured
        .start(state.clone())
        .await
        .map_err(|e| anyhow!("Error starting payany: {e}"))?;
    info!("payany started");
    tokio::spawn(startup::run(state, node));
    plugin.join().await
}
