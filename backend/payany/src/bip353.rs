//! BIP-353 payment instructions looked up in DNSSEC-signed TXT records.
//!
//! `user@host` maps to a TXT record at `user.user._bitcoin-payment.host`
//! holding a `bitcoin:` URI. The resolver validates the DNSSEC chain itself;
//! unsigned or badly signed answers fail the lookup.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::errors::{PayanyError, Result};

pub fn bip353_name(user: &str, host: &str) -> String {
    let host = host.rsplit_once(':').map_or(host, |(name, _port)| name);
    format!("{user}.user._bitcoin-payment.{host}")
}

/// Join the character-strings of one TXT record. Records that aren't UTF-8
/// are skipped.
fn txt_string(parts: &[Box<[u8]>]) -> Option<String> {
    let bytes: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
    String::from_utf8(bytes).ok()
}

/// The single `bitcoin:` URI among a name's TXT records.
pub fn bitcoin_uri<I>(records: I) -> Result<String>
where
    I: IntoIterator<Item = String>,
{
    let mut found = None;
    for txt in records {
        if !txt.to_lowercase().starts_with("bitcoin:") {
            continue;
        }
        if found.is_some() {
            return Err(PayanyError::resolution(
                "multiple bip21 entries found in txt records!",
            ));
        }
        found = Some(txt);
    }
    found.ok_or_else(|| PayanyError::resolution("bip353 offer not found"))
}

/// The BOLT12 offer carried in a `bitcoin:` URI's `lno` parameter.
pub fn offer_from_uri(uri: &str) -> Result<String> {
    let query = uri
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| PayanyError::resolution("no offer found in txt dns entry"))?;
    query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case("lno"))
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| PayanyError::resolution("no offer found in txt dns entry"))
}

/// Upstream servers for the validating resolver: the configured one, or
/// hickory's defaults.
fn resolver_config(server: Option<SocketAddr>) -> ResolverConfig {
    match server {
        Some(addr) => ResolverConfig::from_parts(
            None,
            vec![],
            NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true),
        ),
        None => ResolverConfig::default(),
    }
}

fn lookup_error(name: &str, err: ResolveError) -> PayanyError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => PayanyError::resolution("bip353 offer not found"),
        _ => PayanyError::resolution(format!("DNSSEC lookup of {name} failed: {err}")),
    }
}

#[async_trait]
pub trait PaymentInstructions: Send + Sync {
    /// The `bitcoin:` URI published for `user@host`.
    async fn lookup(&self, user: &str, host: &str) -> Result<String>;
}

/// Validating DNS resolver that follows `payany-dns-server`.
#[derive(Clone)]
pub struct DnssecResolver {
    config: Arc<Mutex<Config>>,
}

impl DnssecResolver {
    pub fn new(config: Arc<Mutex<Config>>) -> Self {
        DnssecResolver { config }
    }

    fn resolver(&self) -> TokioAsyncResolver {
        let server = self.config.lock().dns_server;
        let mut opts = ResolverOpts::default();
        opts.validate = true;
        TokioAsyncResolver::tokio(resolver_config(server), opts)
    }
}

#[async_trait]
impl PaymentInstructions for DnssecResolver {
    async fn lookup(&self, user: &str, host: &str) -> Result<String> {
        let name = bip353_name(user, host);
        // CNAMEs are followed and validated by the resolver.
        let answer = self
            .resolver()
            .txt_lookup(name.as_str())
            .await
            .map_err(|e| lookup_error(&name, e))?;
        let uri = bitcoin_uri(answer.iter().filter_map(|txt| txt_string(txt.txt_data())))?;
        debug!("bip353 record for {name}: {uri}");
        Ok(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(txts: &[&str]) -> Vec<String> {
        txts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn name_drops_port() {
        assert_eq!(
            bip353_name("alice", "example.com"),
            "alice.user._bitcoin-payment.example.com"
        );
        assert_eq!(
            bip353_name("test", "127.0.0.1:8080"),
            "test.user._bitcoin-payment.127.0.0.1"
        );
    }

    #[test]
    fn single_bitcoin_record_is_picked() {
        let uri = bitcoin_uri(records(&["v=spf1 -all", "bitcoin:?lno=lno1qgsq"])).unwrap();
        assert_eq!(offer_from_uri(&uri).unwrap(), "lno1qgsq");
    }

    #[test]
    fn split_txt_strings_are_joined() {
        let parts: Vec<Box<[u8]>> = vec![
            b"bitcoin:?lno=lno1abc".to_vec().into_boxed_slice(),
            b"def".to_vec().into_boxed_slice(),
        ];
        assert_eq!(txt_string(&parts).unwrap(), "bitcoin:?lno=lno1abcdef");

        let invalid: Vec<Box<[u8]>> = vec![vec![0xff, 0xfe].into_boxed_slice()];
        assert!(txt_string(&invalid).is_none());
    }

    #[test]
    fn ambiguous_or_missing_records_fail() {
        let twice = bitcoin_uri(records(&["bitcoin:?lno=lno1a", "BITCOIN:?lno=lno1b"]));
        assert_eq!(
            twice.unwrap_err().to_string(),
            "multiple bip21 entries found in txt records!"
        );
        let none = bitcoin_uri(records(&["v=spf1 -all"]));
        assert_eq!(none.unwrap_err().to_string(), "bip353 offer not found");
    }

    #[test]
    fn configured_server_replaces_defaults() {
        let addr: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let config = resolver_config(Some(addr));
        let servers: Vec<SocketAddr> = config.name_servers().iter().map(|s| s.socket_addr).collect();
        assert!(!servers.is_empty());
        assert!(servers.iter().all(|s| *s == addr));

        assert!(!resolver_config(None).name_servers().is_empty());
    }

    #[test]
    fn offer_parameter_lookup() {
        assert_eq!(
            offer_from_uri("bitcoin:bc1qxyz?amount=1&LNO=lno1zz").unwrap(),
            "lno1zz"
        );
        assert!(offer_from_uri("bitcoin:bc1qxyz").is_err());
        assert!(offer_from_uri("bitcoin:?sp=sp1qq").is_err());
    }
}
