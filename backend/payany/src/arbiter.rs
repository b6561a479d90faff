//! Single ownership of the `pay` entry point.
//!
//! lightningd's `xpay-handle-pay` reroutes `pay` to xpay before any plugin
//! sees it. While payany owns `pay` that flag has to stay off.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::errors::{PayanyError, Result};
use crate::node::ConfigStore;
use crate::params::ConfigChange;

pub const XPAY_HANDLE_PAY: &str = "xpay-handle-pay";

/// First lightningd release accepting `transient` on `setconfig`.
const TRANSIENT_SETCONFIG_SINCE: &str = "25.02";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Startup negotiation hasn't finished.
    Pending,
    Payany,
    Competitor,
}

/// Shared handle on who currently owns `pay`.
#[derive(Debug, Clone)]
pub struct OwnershipState(Arc<Mutex<Owner>>);

impl Default for OwnershipState {
    fn default() -> Self {
        OwnershipState(Arc::new(Mutex::new(Owner::Pending)))
    }
}

impl OwnershipState {
    pub fn owner(&self) -> Owner {
        *self.0.lock()
    }

    fn set(&self, owner: Owner) {
        *self.0.lock() = owner;
    }
}

/// Claim `pay` for payany, switching off `xpay-handle-pay` if it is on.
/// With `pay` interception disabled the competitor keeps it.
pub async fn negotiate_on_startup(
    state: &OwnershipState,
    store: &dyn ConfigStore,
    intercept_pay: bool,
) -> Result<Owner> {
    if !intercept_pay {
        state.set(Owner::Competitor);
        info!("`pay` interception disabled, leaving `{XPAY_HANDLE_PAY}` alone");
        return Ok(Owner::Competitor);
    }

    if store.read_flag(XPAY_HANDLE_PAY).await? == Some(true) {
        let version = store.node_version().await?;
        let transient = at_or_above_version(&version, TRANSIENT_SETCONFIG_SINCE)?;
        store.write_flag(XPAY_HANDLE_PAY, false, transient).await?;
        info!("Found activated `{XPAY_HANDLE_PAY}`, `payany` deactivated it!");
    }
    state.set(Owner::Payany);
    Ok(Owner::Payany)
}

/// Vet a `setconfig` call. Anything that could switch `xpay-handle-pay` on
/// is refused unless the competitor owns `pay`.
pub fn guard_config_change(state: &OwnershipState, change: &ConfigChange) -> Result<()> {
    if change.key != XPAY_HANDLE_PAY || change.sets_false() {
        return Ok(());
    }
    if state.owner() == Owner::Competitor {
        return Ok(());
    }
    warn!(
        "Blocked setconfig {} {:?} while payany owns `pay`",
        change.key, change.value
    );
    Err(PayanyError::OwnershipConflict {
        key: change.key.clone(),
    })
}

/// Compare a lightningd version string like `v25.02.1-12-gabcdef` against
/// `major.minor`.
pub fn at_or_above_version(version: &str, min_version: &str) -> Result<bool> {
    let parse_error = || PayanyError::Node(format!("Version string parse error: {version}"));
    let numeric: String = version
        .split_once('v')
        .ok_or_else(parse_error)?
        .1
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mine: Vec<u32> = numeric
        .split('.')
        .filter(|p| !p.is_empty())
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| parse_error())?;
    if mine.len() < 2 || mine.len() > 3 {
        return Err(parse_error());
    }
    let min: Vec<u32> = min_version
        .split('.')
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| PayanyError::Node(format!("bad minimum version: {min_version}")))?;

    for (m, n) in mine.iter().zip(&min) {
        if m != n {
            return Ok(m > n);
        }
    }
    Ok(mine.len() >= min.len())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::params::ParamValue;

    pub(crate) struct FakeConfigStore {
        pub flag: Mutex<Option<bool>>,
        pub version: String,
        pub writes: Mutex<Vec<(String, bool, bool)>>,
    }

    impl FakeConfigStore {
        pub fn new(flag: Option<bool>, version: &str) -> Self {
            FakeConfigStore {
                flag: Mutex::new(flag),
                version: version.to_string(),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConfigStore for FakeConfigStore {
        async fn read_flag(&self, _key: &str) -> Result<Option<bool>> {
            Ok(*self.flag.lock())
        }

        async fn write_flag(&self, key: &str, value: bool, transient: bool) -> Result<()> {
            *self.flag.lock() = Some(value);
            self.writes.lock().push((key.to_string(), value, transient));
            Ok(())
        }

        async fn node_version(&self) -> Result<String> {
            Ok(self.version.clone())
        }
    }

    fn change(params: serde_json::Value) -> ConfigChange {
        ConfigChange::from_params(&ParamValue::from_json(params).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn startup_turns_competitor_flag_off() {
        let state = OwnershipState::default();
        let store = FakeConfigStore::new(Some(true), "v25.02");
        let owner = negotiate_on_startup(&state, &store, true).await.unwrap();
        assert_eq!(owner, Owner::Payany);
        assert_eq!(
            store.writes.lock().as_slice(),
            &[(XPAY_HANDLE_PAY.to_string(), false, true)]
        );
    }

    #[tokio::test]
    async fn older_nodes_get_a_persistent_setconfig() {
        let state = OwnershipState::default();
        let store = FakeConfigStore::new(Some(true), "v24.11.1");
        negotiate_on_startup(&state, &store, true).await.unwrap();
        assert!(!store.writes.lock()[0].2);
    }

    #[tokio::test]
    async fn flag_already_off_is_left_alone() {
        let state = OwnershipState::default();
        let store = FakeConfigStore::new(Some(false), "v25.05");
        negotiate_on_startup(&state, &store, true).await.unwrap();
        assert!(store.writes.lock().is_empty());
        assert_eq!(state.owner(), Owner::Payany);
    }

    #[tokio::test]
    async fn disabled_interception_yields_to_competitor() {
        let state = OwnershipState::default();
        let store = FakeConfigStore::new(Some(true), "v25.02");
        let owner = negotiate_on_startup(&state, &store, false).await.unwrap();
        assert_eq!(owner, Owner::Competitor);
        assert!(store.writes.lock().is_empty());
        assert!(guard_config_change(
            &state,
            &change(json!({"config": XPAY_HANDLE_PAY, "val": true}))
        )
        .is_ok());
    }

    #[tokio::test]
    async fn enabling_competitor_is_blocked_in_every_shape() {
        let state = OwnershipState::default();
        let store = FakeConfigStore::new(None, "v25.02");
        negotiate_on_startup(&state, &store, true).await.unwrap();

        for params in [
            json!({"config": XPAY_HANDLE_PAY, "val": true}),
            json!({"config": XPAY_HANDLE_PAY, "val": "true"}),
            json!({"config": XPAY_HANDLE_PAY}),
            json!([XPAY_HANDLE_PAY, true]),
            json!([XPAY_HANDLE_PAY]),
            json!(XPAY_HANDLE_PAY),
        ] {
            let err = guard_config_change(&state, &change(params.clone())).unwrap_err();
            assert_eq!(
                err.to_string(),
                "Setting xpay-handle-pay to true when payany is active is blocked",
                "{params}"
            );
        }
        assert_eq!(*store.flag.lock(), None);
    }

    #[test]
    fn disabling_and_other_keys_are_allowed() {
        let state = OwnershipState::default();
        assert!(guard_config_change(
            &state,
            &change(json!({"config": XPAY_HANDLE_PAY, "val": false}))
        )
        .is_ok());
        assert!(guard_config_change(&state, &change(json!([XPAY_HANDLE_PAY, "false"]))).is_ok());
        assert!(guard_config_change(
            &state,
            &change(json!({"config": "payany-budget-amount-msat", "val": 5}))
        )
        .is_ok());
    }

    #[test]
    fn pending_owner_fails_closed() {
        let state = OwnershipState::default();
        assert_eq!(state.owner(), Owner::Pending);
        assert!(guard_config_change(&state, &change(json!({"config": XPAY_HANDLE_PAY}))).is_err());
    }

    #[test]
    fn version_comparison() {
        assert!(at_or_above_version("v25.02", "25.02").unwrap());
        assert!(at_or_above_version("v25.02.1", "25.02").unwrap());
        assert!(at_or_above_version("v25.05-12-gabcdef", "25.02").unwrap());
        assert!(at_or_above_version("v26.00", "25.02").unwrap());
        assert!(!at_or_above_version("v24.11.1", "25.02").unwrap());
        assert!(!at_or_above_version("v25.01", "25.02").unwrap());
        assert!(at_or_above_version("25.02", "25.02").is_err());
        assert!(at_or_above_version("v25", "25.02").is_err());
    }
}
