use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use crate::error::PoolError;
use crate::models::{Account, LeaseState, Secret, SessionState};
use crate::store::{SnapshotFile, StoreError};

/// What happened to a leased account, reported on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountOutcome {
    /// The account was not at fault. Stamps `last_used_at` and stores the
    /// refreshed session when one is supplied.
    Success { session_state: Option<SessionState> },
    /// The platform rejected the credentials or session.
    AuthFailure,
}

impl AccountOutcome {
    pub fn success() -> Self {
        AccountOutcome::Success {
            session_state: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountUpdate {
    pub secret: Option<Secret>,
    pub session_state: Option<SessionState>,
}

/// Single owner of every account row. All field changes go through here.
#[derive(Debug)]
pub struct AccountPool {
    accounts: Mutex<BTreeMap<String, Account>>,
    snapshot: SnapshotFile<Account>,
}

impl AccountPool {
    pub fn open(snapshot: SnapshotFile<Account>) -> Result<Self, StoreError> {
        let rows = snapshot.load()?;
        let stuck = rows.iter().filter(|a| !a.lease_state.is_free()).count();
        if stuck > 0 {
            warn!(stuck, path = %snapshot.path().display(), "Loaded accounts with outstanding leases");
        }
        info!(count = rows.len(), "Account pool loaded");

        Ok(Self {
            accounts: Mutex::new(rows.into_iter().map(|a| (a.login.clone(), a)).collect()),
            snapshot,
        })
    }

    /// Leases the valid, free account used least recently (never-used first).
    pub fn lease(self: &Arc<Self>) -> Result<AccountLease, PoolError> {
        let mut accounts = self.lock();
        let login = accounts
            .values()
            .filter(|a| a.is_leasable())
            .min_by_key(|a| a.last_used_at)
            .map(|a| a.login.clone())
            .ok_or(PoolError::NoAccountAvailable)?;

        self.mark_leased(&mut accounts, &login)
    }

    /// Leases one specific account whatever its validity, for diagnostics.
    pub fn lease_login(self: &Arc<Self>, login: &str) -> Result<AccountLease, PoolError> {
        let mut accounts = self.lock();
        let account = accounts
            .get(login)
            .ok_or_else(|| PoolError::AccountNotFound(login.to_string()))?;
        if !account.lease_state.is_free() {
            return Err(PoolError::AccountBusy(login.to_string()));
        }

        self.mark_leased(&mut accounts, login)
    }

    fn mark_leased(
        self: &Arc<Self>,
        accounts: &mut BTreeMap<String, Account>,
        login: &str,
    ) -> Result<AccountLease, PoolError> {
        let account = accounts
            .get_mut(login)
            .ok_or_else(|| PoolError::AccountNotFound(login.to_string()))?;
        account.lease_state = LeaseState::Leased { since: Utc::now() };
        let leased = account.clone();

        if let Err(e) = self.persist(accounts) {
            if let Some(account) = accounts.get_mut(login) {
                account.lease_state = LeaseState::Free;
            }
            return Err(e.into());
        }

        info!(login = %login, "Account leased");
        Ok(AccountLease {
            pool: Arc::clone(self),
            account: leased,
            released: false,
        })
    }

    fn release(&self, login: &str, outcome: AccountOutcome) {
        let mut accounts = self.lock();
        let Some(account) = accounts.get_mut(login) else {
            warn!(login = %login, "Released account no longer exists");
            return;
        };
        if account.lease_state.is_free() {
            warn!(login = %login, "Account released while not leased");
            return;
        }

        account.lease_state = LeaseState::Free;
        match outcome {
            AccountOutcome::Success { session_state } => {
                account.last_used_at = Some(Utc::now());
                if let Some(state) = session_state {
                    account.session_state = Some(state);
                }
                info!(login = %login, "Account released");
            }
            AccountOutcome::AuthFailure => {
                account.valid = false;
                warn!(login = %login, "Account released and invalidated after authentication failure");
            }
        }

        if let Err(e) = self.persist(&accounts) {
            error!(login = %login, error = %e, "Failed to persist account release");
        }
    }

    pub fn list(&self) -> Vec<Account> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, login: &str) -> Option<Account> {
        self.lock().get(login).cloned()
    }

    pub fn contains(&self, login: &str) -> bool {
        self.lock().contains_key(login)
    }

    pub fn insert(&self, account: Account) -> Result<Account, PoolError> {
        let mut accounts = self.lock();
        if accounts.contains_key(&account.login) {
            return Err(PoolError::AccountExists(account.login));
        }

        let login = account.login.clone();
        accounts.insert(login.clone(), account.clone());
        if let Err(e) = self.persist(&accounts) {
            accounts.remove(&login);
            return Err(e.into());
        }

        info!(login = %login, "Account added");
        Ok(account)
    }

    pub fn update(&self, login: &str, update: AccountUpdate) -> Result<Account, PoolError> {
        self.modify(login, |account| {
            if let Some(secret) = update.secret {
                account.secret = secret;
            }
            if let Some(state) = update.session_state {
                account.session_state = Some(state);
            }
        })
    }

    pub fn set_valid(&self, login: &str, valid: bool) -> Result<Account, PoolError> {
        let account = self.modify(login, |account| account.valid = valid)?;
        info!(login = %login, valid, "Account validity updated");
        Ok(account)
    }

    pub fn delete(&self, login: &str) -> Result<Account, PoolError> {
        let mut accounts = self.lock();
        match accounts.get(login) {
            None => return Err(PoolError::AccountNotFound(login.to_string())),
            Some(a) if !a.lease_state.is_free() => {
                return Err(PoolError::AccountBusy(login.to_string()))
            }
            Some(_) => {}
        }

        let removed = accounts
            .remove(login)
            .ok_or_else(|| PoolError::AccountNotFound(login.to_string()))?;
        if let Err(e) = self.persist(&accounts) {
            accounts.insert(login.to_string(), removed);
            return Err(e.into());
        }

        info!(login = %login, "Account deleted");
        Ok(removed)
    }

    fn modify<F>(&self, login: &str, change: F) -> Result<Account, PoolError>
    where
        F: FnOnce(&mut Account),
    {
        let mut accounts = self.lock();
        let account = accounts
            .get_mut(login)
            .ok_or_else(|| PoolError::AccountNotFound(login.to_string()))?;
        let before = account.clone();
        change(account);
        let after = account.clone();

        if let Err(e) = self.persist(&accounts) {
            accounts.insert(login.to_string(), before);
            return Err(e.into());
        }
        Ok(after)
    }

    fn persist(&self, accounts: &BTreeMap<String, Account>) -> Result<(), StoreError> {
        self.snapshot.save(accounts.values())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one account. Released exactly once: explicitly through
/// [`AccountLease::release`], or with a success outcome when dropped.
#[derive(Debug)]
pub struct AccountLease {
    pool: Arc<AccountPool>,
    account: Account,
    released: bool,
}

impl AccountLease {
    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn login(&self) -> &str {
        &self.account.login
    }

    pub fn release(mut self, outcome: AccountOutcome) {
        self.released = true;
        self.pool.release(&self.account.login, outcome);
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(login = %self.account.login, "Account lease dropped without release, releasing");
            self.pool.release(&self.account.login, AccountOutcome::success());
        }
    }
}
