//! Turns a payment target into one concrete, amount-bound invoice.
//!
//! Resolution talks to the node (decode, fetchinvoice), to LNURL services and
//! to DNS, but never touches the budget and never pays anything.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bip353::{offer_from_uri, PaymentInstructions};
use crate::errors::{PayanyError, Result};
use crate::lnurl::{decode_lnurl, lnurlp_url, LnurlService};
use crate::node::InvoiceSource;
use crate::target::{AddressTarget, PaymentTarget, ResolvedInvoice, TargetForm, TargetKind};

/// A target after classification and, for invoices and offers, decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Detected {
    pub invstring: String,
    pub kind: TargetKind,
    pub payment_hash: Option<String>,
}

#[derive(Clone)]
pub struct Resolver {
    invoices: Arc<dyn InvoiceSource>,
    lnurl: Arc<dyn LnurlService>,
    names: Arc<dyn PaymentInstructions>,
    strict_lnurl: bool,
}

impl Resolver {
    pub fn new(
        invoices: Arc<dyn InvoiceSource>,
        lnurl: Arc<dyn LnurlService>,
        names: Arc<dyn PaymentInstructions>,
    ) -> Self {
        Resolver {
            invoices,
            lnurl,
            names,
            strict_lnurl: false,
        }
    }

    pub fn strict_lnurl(mut self, strict: bool) -> Self {
        self.strict_lnurl = strict;
        self
    }

    pub async fn resolve(&self, target: &PaymentTarget) -> Result<ResolvedInvoice> {
        let detected = self.detect(&target.invstring).await?;
        debug!("{} detected", detected.kind.as_str());
        let amount = target.amount_msat;
        let note = target.message.as_deref();

        match detected.kind {
            TargetKind::FixedInvoice { amount_msat } => {
                self.fixed_invoice(detected.invstring, amount_msat, amount, detected.payment_hash)
            }
            TargetKind::AnyAmountOffer => {
                self.any_amount_offer(&detected.invstring, amount, note).await
            }
            TargetKind::FixedAmountOffer { amount_msat } => {
                self.fixed_amount_offer(&detected.invstring, amount_msat, amount, note)
                    .await
            }
            TargetKind::AddressLookup(address) => {
                self.address_lookup(&address, amount, note).await
            }
        }
    }

    /// Classify `raw` and decode it when it is an invoice or offer.
    pub async fn detect(&self, raw: &str) -> Result<Detected> {
        match TargetForm::classify(raw)? {
            TargetForm::Address(address) => Ok(Detected {
                invstring: raw.to_string(),
                kind: TargetKind::AddressLookup(address),
                payment_hash: None,
            }),
            TargetForm::Offer(offer) => {
                let kind = self.offer_kind(&offer).await?;
                Ok(Detected {
                    invstring: offer,
                    kind,
                    payment_hash: None,
                })
            }
            TargetForm::Invoice(invoice) => {
                let decoded = self.invoices.decode(&invoice).await?;
                if !decoded.is_invoice() {
                    return Err(PayanyError::resolution(format!(
                        "unsupported payment target: {}",
                        decoded.item_type
                    )));
                }
                Ok(Detected {
                    invstring: invoice,
                    kind: TargetKind::FixedInvoice {
                        amount_msat: decoded.invoice_amount(),
                    },
                    payment_hash: decoded.payment_hash,
                })
            }
        }
    }

    async fn offer_kind(&self, offer: &str) -> Result<TargetKind> {
        let decoded = self.invoices.decode(offer).await?;
        if !decoded.is_offer() {
            return Err(PayanyError::resolution(format!(
                "expected a bolt12 offer, got {}",
                decoded.item_type
            )));
        }
        if let Some(currency) = decoded.offer_currency {
            return Err(PayanyError::resolution(format!(
                "offer: amounts in {currency} are not supported"
            )));
        }
        Ok(match decoded.offer_amount_msat {
            Some(amount_msat) => TargetKind::FixedAmountOffer { amount_msat },
            None => TargetKind::AnyAmountOffer,
        })
    }

    fn fixed_invoice(
        &self,
        invoice: String,
        invoice_amount: Option<u64>,
        requested: Option<u64>,
        payment_hash: Option<String>,
    ) -> Result<ResolvedInvoice> {
        let resolved = match (invoice_amount, requested) {
            (Some(fixed), Some(requested)) if fixed != requested => {
                return Err(PayanyError::AmountMismatch {
                    kind: "invoice",
                    fixed_msat: fixed,
                    requested_msat: requested,
                })
            }
            (Some(fixed), _) => ResolvedInvoice::new(invoice, fixed, true)?,
            (None, Some(requested)) => ResolvedInvoice::new(invoice, requested, false)?,
            (None, None) => return Err(PayanyError::AmountRequired("invoice has no amount")),
        };
        Ok(resolved.with_payment_hash(payment_hash))
    }

    async fn any_amount_offer(
        &self,
        offer: &str,
        requested: Option<u64>,
        note: Option<&str>,
    ) -> Result<ResolvedInvoice> {
        let amount = requested.ok_or(PayanyError::AmountRequired("offer has `any` amount"))?;
        self.fetch_offer_invoice(offer, Some(amount), amount, note)
            .await
    }

    async fn fixed_amount_offer(
        &self,
        offer: &str,
        fixed: u64,
        requested: Option<u64>,
        note: Option<&str>,
    ) -> Result<ResolvedInvoice> {
        if let Some(requested) = requested.filter(|r| *r != fixed) {
            return Err(PayanyError::AmountMismatch {
                kind: "offer",
                fixed_msat: fixed,
                requested_msat: requested,
            });
        }
        self.fetch_offer_invoice(offer, None, fixed, note).await
    }

    /// Resolve an offer whose kind isn't known yet, e.g. one published
    /// through BIP-353.
    async fn offer(
        &self,
        offer: &str,
        requested: Option<u64>,
        note: Option<&str>,
    ) -> Result<ResolvedInvoice> {
        match self.offer_kind(offer).await? {
            TargetKind::FixedAmountOffer { amount_msat } => {
                self.fixed_amount_offer(offer, amount_msat, requested, note)
                    .await
            }
            _ => self.any_amount_offer(offer, requested, note).await,
        }
    }

    async fn fetch_offer_invoice(
        &self,
        offer: &str,
        fetch_amount: Option<u64>,
        bound: u64,
        note: Option<&str>,
    ) -> Result<ResolvedInvoice> {
        let invoice = self
            .invoices
            .fetch_invoice(offer, fetch_amount, note)
            .await?;
        let decoded = self.invoices.decode(&invoice).await?;
        let got = decoded.invoice_amount().unwrap_or(0);
        if got != bound {
            return Err(PayanyError::resolution(format!(
                "offers: got invoice with different amount_msat!: {got} != {bound}"
            )));
        }
        Ok(ResolvedInvoice::new(invoice, bound, true)?
            .with_payer_note(note.map(str::to_string))
            .with_payment_hash(decoded.payment_hash))
    }

    async fn address_lookup(
        &self,
        address: &AddressTarget,
        requested: Option<u64>,
        note: Option<&str>,
    ) -> Result<ResolvedInvoice> {
        match address {
            AddressTarget::Lnurl { encoded } => {
                let amount = requested.ok_or(PayanyError::AmountRequired("lnurl has no amount"))?;
                let url = decode_lnurl(encoded)?;
                self.lnurl_pay(&url, None, amount, note).await
            }
            AddressTarget::LightningAddress { user, host } => {
                let amount = requested
                    .ok_or(PayanyError::AmountRequired("lightning address has no amount"))?;
                let bip353_error = match self.bip353(user, host, amount, note).await {
                    Ok(resolved) => return Ok(resolved),
                    Err(e) => e,
                };
                debug!("bip353 lookup for {user}@{host} failed: {bip353_error}");

                let lnaddress = format!("{user}@{host}");
                self.lnurl_pay(&lnurlp_url(user, host), Some(&lnaddress), amount, note)
                    .await
                    .map_err(|lnurl_error| {
                        PayanyError::resolution(format!(
                            "Error fetching invoice from bip353: {bip353_error} and error \
                             fetching invoice from lnurl: {lnurl_error}"
                        ))
                    })
            }
        }
    }

    async fn bip353(
        &self,
        user: &str,
        host: &str,
        amount: u64,
        note: Option<&str>,
    ) -> Result<ResolvedInvoice> {
        let uri = self.names.lookup(user, host).await?;
        let offer = offer_from_uri(&uri)?.to_lowercase();
        info!("bip353 offer for {user}@{host}: {offer}");
        self.offer(&offer, Some(amount), note).await
    }

    async fn lnurl_pay(
        &self,
        url: &str,
        lnaddress: Option<&str>,
        amount: u64,
        note: Option<&str>,
    ) -> Result<ResolvedInvoice> {
        let config = self.lnurl.pay_request(url).await?;
        config.validate(amount, lnaddress, self.strict_lnurl)?;
        let comment = config.comment_for(note)?;

        let callback = self.lnurl.callback(&config.callback, amount, comment).await?;
        let decoded = self.invoices.decode(&callback.pr).await?;
        if decoded.invoice_amount() != Some(amount) {
            return Err(PayanyError::resolution(format!(
                "Lnurl: wrong amount in invoice: {}!={amount}",
                decoded.invoice_amount().unwrap_or(0)
            )));
        }
        config.check_description_hash(decoded.description_hash.as_deref(), self.strict_lnurl)?;

        Ok(ResolvedInvoice::new(callback.pr, amount, true)?
            .with_payer_note(comment.map(str::to_string))
            .with_payment_hash(decoded.payment_hash))
    }
}
