use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use crate::error::PoolError;
use crate::models::{LeaseState, Proxy, ProxyId, ProxyProtocol, Secret};
use crate::store::{SnapshotFile, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    /// The network path itself failed; the proxy gets blocked.
    ProxyFailure,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyUpdate {
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub protocol: Option<ProxyProtocol>,
}

#[derive(Debug)]
pub struct ProxyPool {
    proxies: Mutex<BTreeMap<ProxyId, Proxy>>,
    snapshot: SnapshotFile<Proxy>,
}

impl ProxyPool {
    pub fn open(snapshot: SnapshotFile<Proxy>) -> Result<Self, StoreError> {
        let rows = snapshot.load()?;
        let stuck = rows.iter().filter(|p| !p.lease_state.is_free()).count();
        if stuck > 0 {
            warn!(stuck, path = %snapshot.path().display(), "Loaded proxies with outstanding leases");
        }
        info!(
            count = rows.len(),
            blocked = rows.iter().filter(|p| p.is_blocked).count(),
            "Proxy pool loaded"
        );

        Ok(Self {
            proxies: Mutex::new(rows.into_iter().map(|p| (p.id(), p)).collect()),
            snapshot,
        })
    }

    /// Leases the unblocked, free proxy with the fewest recorded uses.
    pub fn lease(self: &Arc<Self>) -> Result<ProxyLease, PoolError> {
        let mut proxies = self.lock();
        let id = proxies
            .values()
            .filter(|p| p.is_leasable())
            .min_by_key(|p| p.request_count)
            .map(Proxy::id)
            .ok_or(PoolError::NoProxyAvailable)?;

        let proxy = proxies
            .get_mut(&id)
            .ok_or_else(|| PoolError::ProxyNotFound(id.clone()))?;
        proxy.lease_state = LeaseState::Leased { since: Utc::now() };
        let leased = proxy.clone();

        if let Err(e) = self.persist(&proxies) {
            if let Some(proxy) = proxies.get_mut(&id) {
                proxy.lease_state = LeaseState::Free;
            }
            return Err(e.into());
        }

        info!(proxy = %id, request_count = leased.request_count, "Proxy leased");
        Ok(ProxyLease {
            pool: Arc::clone(self),
            proxy: leased,
            released: false,
        })
    }

    fn release(&self, id: &ProxyId, outcome: ProxyOutcome) {
        let mut proxies = self.lock();
        let Some(proxy) = proxies.get_mut(id) else {
            warn!(proxy = %id, "Released proxy no longer exists");
            return;
        };
        if proxy.lease_state.is_free() {
            warn!(proxy = %id, "Proxy released while not leased");
            return;
        }

        proxy.lease_state = LeaseState::Free;
        proxy.request_count = proxy.request_count.saturating_add(1);
        match outcome {
            ProxyOutcome::Success => {
                info!(proxy = %id, request_count = proxy.request_count, "Proxy released");
            }
            ProxyOutcome::ProxyFailure => {
                proxy.is_blocked = true;
                warn!(proxy = %id, request_count = proxy.request_count, "Proxy released and blocked after network failure");
            }
        }

        if let Err(e) = self.persist(&proxies) {
            error!(proxy = %id, error = %e, "Failed to persist proxy release");
        }
    }

    pub fn list(&self) -> Vec<Proxy> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &ProxyId) -> Option<Proxy> {
        self.lock().get(id).cloned()
    }

    pub fn insert(&self, proxy: Proxy) -> Result<Proxy, PoolError> {
        let mut proxies = self.lock();
        let id = proxy.id();
        if proxies.contains_key(&id) {
            return Err(PoolError::ProxyExists(id));
        }

        proxies.insert(id.clone(), proxy.clone());
        if let Err(e) = self.persist(&proxies) {
            proxies.remove(&id);
            return Err(e.into());
        }

        info!(proxy = %id, "Proxy added");
        Ok(proxy)
    }

    pub fn update(&self, id: &ProxyId, update: ProxyUpdate) -> Result<Proxy, PoolError> {
        self.modify(id, |proxy| {
            if let Some(username) = update.username {
                proxy.username = Some(username);
            }
            if let Some(password) = update.password {
                proxy.password = Some(password);
            }
            if let Some(protocol) = update.protocol {
                proxy.protocol = protocol;
            }
        })
    }

    /// Operator block. Sticky until [`ProxyPool::unblock`].
    pub fn block(&self, id: &ProxyId) -> Result<Proxy, PoolError> {
        let proxy = self.modify(id, |proxy| proxy.is_blocked = true)?;
        info!(proxy = %id, "Proxy blocked");
        Ok(proxy)
    }

    pub fn unblock(&self, id: &ProxyId) -> Result<Proxy, PoolError> {
        let proxy = self.modify(id, |proxy| proxy.is_blocked = false)?;
        info!(proxy = %id, "Proxy unblocked");
        Ok(proxy)
    }

    pub fn delete(&self, id: &ProxyId) -> Result<Proxy, PoolError> {
        let mut proxies = self.lock();
        match proxies.get(id) {
            None => return Err(PoolError::ProxyNotFound(id.clone())),
            Some(p) if !p.lease_state.is_free() => return Err(PoolError::ProxyBusy(id.clone())),
            Some(_) => {}
        }

        let removed = proxies
            .remove(id)
            .ok_or_else(|| PoolError::ProxyNotFound(id.clone()))?;
        if let Err(e) = self.persist(&proxies) {
            proxies.insert(id.clone(), removed);
            return Err(e.into());
        }

        info!(proxy = %id, "Proxy deleted");
        Ok(removed)
    }

    fn modify<F>(&self, id: &ProxyId, change: F) -> Result<Proxy, PoolError>
    where
        F: FnOnce(&mut Proxy),
    {
        let mut proxies = self.lock();
        let proxy = proxies
            .get_mut(id)
            .ok_or_else(|| PoolError::ProxyNotFound(id.clone()))?;
        let before = proxy.clone();
        change(proxy);
        let after = proxy.clone();

        if let Err(e) = self.persist(&proxies) {
            proxies.insert(id.clone(), before);
            return Err(e.into());
        }
        Ok(after)
    }

    fn persist(&self, proxies: &BTreeMap<ProxyId, Proxy>) -> Result<(), StoreError> {
        self.snapshot.save(proxies.values())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ProxyId, Proxy>> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one proxy; see [`crate::account_pool::AccountLease`].
#[derive(Debug)]
pub struct ProxyLease {
    pool: Arc<ProxyPool>,
    proxy: Proxy,
    released: bool,
}

impl ProxyLease {
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn id(&self) -> ProxyId {
        self.proxy.id()
    }

    pub fn release(mut self, outcome: ProxyOutcome) {
        self.released = true;
        self.pool.release(&self.proxy.id(), outcome);
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(proxy = %self.proxy.id(), "Proxy lease dropped without release, releasing");
            self.pool.release(&self.proxy.id(), ProxyOutcome::Success);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn pool_with(dir: &std::path::Path, proxies: Vec<Proxy>) -> Arc<ProxyPool> {
        let snapshot = SnapshotFile::in_dir(dir, "proxies.json");
        snapshot.save(&proxies).unwrap();
        Arc::new(ProxyPool::open(snapshot).unwrap())
    }

    fn proxy(host: &str, request_count: u64) -> Proxy {
        let mut proxy = Proxy::new(host, 8080);
        proxy.request_count = request_count;
        proxy
    }

    #[test]
    fn lease_prefers_least_used_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(
            dir.path(),
            vec![proxy("busy", 40), proxy("idle", 2), proxy("warm", 9)],
        );

        let first = pool.lease().unwrap();
        let second = pool.lease().unwrap();

        assert_eq!(first.proxy().host, "idle");
        assert_eq!(second.proxy().host, "warm");
    }

    #[test]
    fn blocked_proxies_are_never_leased() {
        let dir = tempfile::tempdir().unwrap();
        let mut blocked = proxy("blocked", 0);
        blocked.is_blocked = true;
        let pool = pool_with(dir.path(), vec![blocked]);

        assert!(matches!(pool.lease(), Err(PoolError::NoProxyAvailable)));
    }

    #[test]
    fn every_release_counts_one_use() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![proxy("p", 0)]);
        let id = ProxyId::new("p", 8080);

        pool.lease().unwrap().release(ProxyOutcome::Success);
        assert_eq!(pool.get(&id).unwrap().request_count, 1);

        pool.lease().unwrap().release(ProxyOutcome::ProxyFailure);
        let stored = pool.get(&id).unwrap();
        assert_eq!(stored.request_count, 2);
        assert!(stored.is_blocked);
        assert!(stored.lease_state.is_free());
    }

    #[test]
    fn blocking_is_sticky_until_unblocked() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![proxy("p", 0)]);
        let id = ProxyId::new("p", 8080);

        pool.lease().unwrap().release(ProxyOutcome::ProxyFailure);
        assert!(matches!(pool.lease(), Err(PoolError::NoProxyAvailable)));
        assert!(matches!(pool.lease(), Err(PoolError::NoProxyAvailable)));

        pool.unblock(&id).unwrap();
        assert!(pool.lease().is_ok());
    }

    #[test]
    fn dropped_lease_is_released_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![proxy("p", 0)]);

        drop(pool.lease().unwrap());

        let stored = pool.get(&ProxyId::new("p", 8080)).unwrap();
        assert!(stored.lease_state.is_free());
        assert!(!stored.is_blocked);
        assert_eq!(stored.request_count, 1);
    }

    #[test]
    fn concurrent_leases_hand_out_one_proxy_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![proxy("only", 0)]);
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let lease = pool.lease().ok();
                    barrier.wait();
                    lease.is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(pool.get(&ProxyId::new("only", 8080)).unwrap().request_count, 1);
    }

    #[test]
    fn operator_block_update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![proxy("p", 0)]);
        let id = ProxyId::new("p", 8080);

        assert!(matches!(
            pool.insert(proxy("p", 0)),
            Err(PoolError::ProxyExists(_))
        ));
        pool.block(&id).unwrap();
        pool.update(
            &id,
            ProxyUpdate {
                username: Some("user".into()),
                password: Some(Secret::new("pass")),
                protocol: Some(ProxyProtocol::Socks5),
            },
        )
        .unwrap();

        let reopened = ProxyPool::open(SnapshotFile::in_dir(dir.path(), "proxies.json")).unwrap();
        let stored = reopened.get(&id).unwrap();
        assert!(stored.is_blocked);
        assert_eq!(stored.protocol, ProxyProtocol::Socks5);
        assert_eq!(stored.username.as_deref(), Some("user"));

        pool.delete(&id).unwrap();
        assert!(pool.get(&id).is_none());
        assert!(matches!(pool.block(&id), Err(PoolError::ProxyNotFound(_))));
    }

    #[test]
    fn leased_proxy_cannot_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![proxy("p", 0)]);
        let lease = pool.lease().unwrap();

        assert!(matches!(pool.delete(&lease.id()), Err(PoolError::ProxyBusy(_))));
    }

    #[test]
    fn failed_snapshot_write_rolls_back_lease_but_keeps_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![proxy("p", 0)]);
        let id = pool.list()[0].id();
        let blocker = dir.path().join("proxies.json.tmp");

        std::fs::create_dir(&blocker).unwrap();
        assert!(matches!(pool.lease(), Err(PoolError::Store(_))));
        assert!(pool.get(&id).unwrap().lease_state.is_free());

        std::fs::remove_dir(&blocker).unwrap();
        let lease = pool.lease().unwrap();
        std::fs::create_dir(&blocker).unwrap();
        lease.release(ProxyOutcome::ProxyFailure);

        let stored = pool.get(&id).unwrap();
        assert!(stored.lease_state.is_free());
        assert!(stored.is_blocked);
        assert_eq!(stored.request_count, 1);

        std::fs::remove_dir(&blocker).unwrap();
        let on_disk = ProxyPool::open(SnapshotFile::in_dir(dir.path(), "proxies.json")).unwrap();
        let stale = on_disk.get(&id).unwrap();
        assert!(!stale.lease_state.is_free());
        assert!(!stale.is_blocked);
    }
}
