//! One-shot tasks run once the plugin is up: learn the argument lists of
//! the payment engines, settle ownership of `pay`, and reload the ledger.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::arbiter;
use crate::db::LedgerStore;
use crate::errors::Result;
use crate::ledger::{BudgetLedger, RETENTION_SECS};
use crate::node::ClnNode;
use crate::params::parse_help_args;
use crate::plugin::PluginState;
use crate::target::Engine;

/// Run the startup tasks. Failures are logged. Until discovery ends every
/// engine is intercepted with its built-in argument list, and `pay`
/// ownership stays pending (which blocks `xpay-handle-pay` changes) until
/// negotiation ends.
pub async fn run(state: PluginState, node: Arc<ClnNode>) {
    for engine in Engine::ALL {
        let help = node.help(engine.as_str()).await;
        if let Some(args) = engine_args_from_help(engine, help) {
            state.config.lock().set_engine_args(engine, args);
        }
    }
    state.config.lock().mark_engines_discovered();

    let intercept_pay = state.config.lock().intercept_configured(Engine::Pay);
    match arbiter::negotiate_on_startup(
        &state.ownership,
        state.services.settings.as_ref(),
        intercept_pay,
    )
    .await
    {
        Ok(owner) => info!("`pay` owner after startup: {owner:?}"),
        Err(e) => error!("Could not settle `pay` ownership: {e}"),
    }
}

/// Positional argument names for `engine` given the outcome of
/// `help <engine>`. `None` means the engine is not on this node.
fn engine_args_from_help(engine: Engine, help: Result<Option<String>>) -> Option<Vec<String>> {
    match help {
        Ok(Some(synopsis)) => {
            let args = parse_help_args(&synopsis, engine.as_str());
            info!("{engine} arguments: {args:?}");
            Some(args)
        }
        Ok(None) => {
            info!("{engine} not available, not intercepting it");
            None
        }
        Err(e) => {
            warn!("help {engine} failed, using default arguments: {e}");
            Some(engine.default_args())
        }
    }
}

/// Drop expired rows from `store` and feed the rest into `ledger`.
pub async fn restore_ledger(store: &LedgerStore, ledger: &BudgetLedger) -> Result<usize> {
    let keep = ledger
        .config()
        .map_or(RETENTION_SECS, |c| c.window_secs.max(RETENTION_SECS));
    let horizon = ledger.now().saturating_sub(keep as i64);

    let pruned = store.prune_before(horizon).await?;
    let restored = ledger.restore(store.load_since(horizon).await?);
    info!("Ledger restored: {restored} entries kept, {pruned} expired rows removed");
    Ok(restored)
}
