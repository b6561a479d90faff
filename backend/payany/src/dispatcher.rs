//! Payment dispatch: resolve, reserve budget, submit, then finalize or
//! release.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::db::LedgerStore;
use crate::errors::{PayanyError, Result};
use crate::ledger::{BudgetLedger, LedgerEntry};
use crate::node::PaymentEngine;
use crate::resolver::Resolver;
use crate::target::{
    msat_value, Engine, PaymentTarget, ResolvedInvoice, RoutingHints, AMOUNT_FIELD, MESSAGE_FIELD,
};

pub const DEFAULT_EXEMPT_FEE_MSAT: u64 = 5000;
pub const DEFAULT_MAX_FEE_PERCENT: f64 = 1.0;

/// Upper bound on the routing fee a payment may spend: `maxfee` when given,
/// else the larger of `exemptfee` and `maxfeepercent` of the amount.
pub fn fee_cap(hints: &RoutingHints, amount_msat: u64) -> Result<u64> {
    if hints.maxfee().is_some() && (hints.maxfeepercent().is_some() || hints.exemptfee().is_some())
    {
        return Err(PayanyError::InvalidParameter(
            "Can only set maxfee OR (maxfeepercent/exemptfee)".to_string(),
        ));
    }
    if let Some(maxfee) = hints.maxfee() {
        return msat_value(maxfee).ok_or_else(|| {
            PayanyError::InvalidParameter("maxfee: should be a millisatoshi amount".to_string())
        });
    }

    let percent = match hints.maxfeepercent() {
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|p: &f64| p.is_finite() && *p >= 0.0)
            .ok_or_else(|| {
                PayanyError::InvalidParameter(format!(
                    "maxfeepercent: should be a non-negative floating-point number: {v}"
                ))
            })?,
        None => DEFAULT_MAX_FEE_PERCENT,
    };
    let proportional = ((percent / 100.0) * amount_msat as f64).ceil() as u64;
    let exemptfee = match hints.exemptfee() {
        Some(v) => msat_value(v).ok_or_else(|| {
            PayanyError::InvalidParameter("exemptfee: should be a millisatoshi amount".to_string())
        })?,
        None => DEFAULT_EXEMPT_FEE_MSAT,
    };
    Ok(exemptfee.max(proportional))
}

/// Split `exclude` entries into node ids and directed short channel ids.
fn split_exclusions(exclude: &Value) -> Result<(Vec<String>, Vec<String>)> {
    let entries = exclude
        .as_array()
        .ok_or_else(|| PayanyError::InvalidParameter("exclude is not an array".to_string()))?;
    let mut nodes = Vec::new();
    let mut channels = Vec::new();
    for entry in entries {
        match entry.as_str() {
            Some(s) if is_scid_dir(s) => channels.push(s.to_string()),
            Some(s) if s.len() == 66 && s.chars().all(|c| c.is_ascii_hexdigit()) => {
                nodes.push(s.to_lowercase())
            }
            _ => {
                return Err(PayanyError::InvalidParameter(format!(
                    "Could not parse exclude channel/peer:{entry}"
                )))
            }
        }
    }
    Ok((nodes, channels))
}

fn is_scid_dir(s: &str) -> bool {
    let Some((scid, dir)) = s.split_once('/') else {
        return false;
    };
    let parts: Vec<&str> = scid.split('x').collect();
    (dir == "0" || dir == "1")
        && parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Invoices the plugin is about to submit itself. Its own engine call comes
/// back through the `rpc_command` hook and must be let through exactly once.
#[derive(Debug, Clone, Default)]
pub struct PassThrough(Arc<Mutex<TokenTable>>);

#[derive(Debug, Default)]
struct TokenTable {
    next_id: u64,
    /// Unused token ids per invoice, oldest first.
    unused: HashMap<String, VecDeque<u64>>,
}

impl PassThrough {
    pub(crate) fn issue(&self, invoice: &str) -> PassToken {
        let mut table = self.0.lock();
        let id = table.next_id;
        table.next_id += 1;
        table
            .unused
            .entry(invoice.to_string())
            .or_default()
            .push_back(id);
        PassToken {
            table: self.clone(),
            invoice: invoice.to_string(),
            id,
        }
    }

    /// Consume the oldest unused token for `invoice`; true if there was one.
    pub fn take(&self, invoice: &str) -> bool {
        let mut table = self.0.lock();
        let Some(ids) = table.unused.get_mut(invoice) else {
            return false;
        };
        let taken = ids.pop_front().is_some();
        if ids.is_empty() {
            table.unused.remove(invoice);
        }
        taken
    }

    /// Drop token `id` unless the hook already used it.
    fn revoke(&self, invoice: &str, id: u64) {
        let mut table = self.0.lock();
        if let Some(ids) = table.unused.get_mut(invoice) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                table.unused.remove(invoice);
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.0.lock().unused.values().map(VecDeque::len).sum()
    }
}

/// Revokes its token once the submission is over, if it went unused.
pub(crate) struct PassToken {
    table: PassThrough,
    invoice: String,
    id: u64,
}

impl Drop for PassToken {
    fn drop(&mut self) {
        self.table.revoke(&self.invoice, self.id);
    }
}

pub struct Dispatcher {
    resolver: Resolver,
    engine: Arc<dyn PaymentEngine>,
    ledger: BudgetLedger,
    store: Option<LedgerStore>,
    tokens: PassThrough,
    /// Engines whose calls re-enter our hook.
    intercepted: HashSet<Engine>,
    /// Argument names `xpay` accepts, set when `pay` is served by xpay.
    xpay_args: Option<Vec<String>>,
}

impl Dispatcher {
    pub fn new(resolver: Resolver, engine: Arc<dyn PaymentEngine>, ledger: BudgetLedger) -> Self {
        Dispatcher {
            resolver,
            engine,
            ledger,
            store: None,
            tokens: PassThrough::default(),
            intercepted: HashSet::new(),
            xpay_args: None,
        }
    }

    pub fn with_store(mut self, store: Option<LedgerStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_pass_through(mut self, tokens: PassThrough, intercepted: HashSet<Engine>) -> Self {
        self.tokens = tokens;
        self.intercepted = intercepted;
        self
    }

    /// Send `pay` calls to xpay, keeping only the arguments it knows.
    pub fn with_xpay_for_pay(mut self, xpay_args: Option<Vec<String>>) -> Self {
        self.xpay_args = xpay_args;
        self
    }

    /// Run one payment through `engine`. `params` is the canonical map of the
    /// intercepted call.
    pub async fn dispatch(&self, params: Map<String, Value>, engine: Engine) -> Result<Value> {
        let target = PaymentTarget::from_params(params, engine.invstring_field())?;
        let resolved = self.resolver.resolve(&target).await?;

        let max_fee = fee_cap(&target.hints, resolved.amount_msat)?;
        let candidate = resolved.amount_msat.saturating_add(max_fee);
        let reservation = self.ledger.try_reserve(candidate)?;

        let (engine, engine_params) = self.engine_params(engine, &resolved, target.hints).await?;
        info!(
            "Paying {}msat through {engine} (reserved {}msat)",
            resolved.amount_msat,
            reservation.amount_msat()
        );

        let _token = self
            .intercepted
            .contains(&engine)
            .then(|| self.tokens.issue(&resolved.invoice));
        match self.engine.submit(engine, engine_params).await {
            Ok(result) => {
                let spent = result
                    .get("amount_sent_msat")
                    .and_then(msat_value)
                    .unwrap_or(candidate);
                let entry = self.ledger.finalize(reservation, spent);
                self.persist(&entry, resolved.payment_hash.as_deref()).await;
                Ok(result)
            }
            Err(e) => {
                debug!("{engine} failed, releasing {}msat: {e}", reservation.amount_msat());
                self.ledger.release(reservation);
                Err(e)
            }
        }
    }

    async fn persist(&self, entry: &LedgerEntry, payment_hash: Option<&str>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.insert_entry(entry, payment_hash).await {
                warn!("Could not persist ledger entry: {e}");
            }
        }
    }

    /// Parameters for the engine call, plus the engine actually used.
    async fn engine_params(
        &self,
        engine: Engine,
        resolved: &ResolvedInvoice,
        hints: RoutingHints,
    ) -> Result<(Engine, Map<String, Value>)> {
        if engine == Engine::Pay {
            if let Some(xpay_args) = &self.xpay_args {
                let params = self.pay_as_xpay(resolved, hints, xpay_args).await?;
                return Ok((Engine::Xpay, params));
            }
        }
        let mut params = hints.into_map();
        params.remove(MESSAGE_FIELD);
        params.insert(engine.invstring_field().to_string(), json!(resolved.invoice));
        if resolved.amount_in_invoice {
            params.remove(AMOUNT_FIELD);
        } else {
            params.insert(AMOUNT_FIELD.to_string(), json!(resolved.amount_msat));
        }
        Ok((engine, params))
    }

    /// Rewrite `pay` parameters for xpay: fees collapse into `maxfee`,
    /// `exclude` turns into an askrene layer, unknown arguments are dropped.
    async fn pay_as_xpay(
        &self,
        resolved: &ResolvedInvoice,
        hints: RoutingHints,
        xpay_args: &[String],
    ) -> Result<Map<String, Value>> {
        let maxfee = if hints.has_fee_limit() {
            Some(fee_cap(&hints, resolved.amount_msat)?)
        } else {
            None
        };
        let exclude = hints.exclude().cloned();

        let mut params = hints.into_map();
        params.retain(|key, _| xpay_args.iter().any(|a| a == key) && key != MESSAGE_FIELD);
        if let Some(maxfee) = maxfee {
            params.insert("maxfee".to_string(), json!(maxfee));
        }

        if let Some(exclude) = exclude {
            let (nodes, channels) = split_exclusions(&exclude)?;
            let layer = resolved.payment_hash.clone().ok_or_else(|| {
                PayanyError::InvalidParameter("exclude: invoice has no payment hash".to_string())
            })?;
            self.engine
                .exclusion_layer(&layer, &nodes, &channels)
                .await?;
            params.insert("layers".to_string(), json!([layer]));
        }

        params.insert(
            Engine::Xpay.invstring_field().to_string(),
            json!(resolved.invoice),
        );
        if resolved.amount_in_invoice {
            params.remove(AMOUNT_FIELD);
        } else {
            params.insert(AMOUNT_FIELD.to_string(), json!(resolved.amount_msat));
        }
        Ok(params)
    }
}
