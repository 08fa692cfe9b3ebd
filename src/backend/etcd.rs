//! etcd v3 coordination backend
//!
//! Registry entries are plain keys attached to the member lease; locks use
//! the etcd lock service with the same lease, so a lost lease releases every
//! lock the node holds without any action on its part.

use super::{CoordinationBackend, KeyValue, LeaseId, LockKey, Page};
use crate::common::{Error, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, GetOptions, LockOptions, PutOptions, SortOrder, SortTarget,
};
use std::time::Duration;

fn unavailable(e: etcd_client::Error) -> Error {
    Error::BackendUnavailable(format!("etcd: {}", e))
}

/// First key after every key starting with `prefix` (etcd range end).
/// Key etcd's lock service writes for `lease` waiting on or holding `name`.
pub(crate) fn lock_token(name: &str, lease: LeaseId) -> Vec<u8> {
    format!("{}/{:x}", name, lease).into_bytes()
}

pub(crate) fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // all 0xff: scan to the end of the keyspace
    vec![0]
}

#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        tracing::info!("Connecting to etcd: {}", endpoints.join(","));
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(unavailable)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationBackend for EtcdBackend {
    fn kind(&self) -> &'static str {
        "etcd"
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str, after: Option<&str>, limit: u32) -> Result<Page> {
        let start = match after {
            Some(key) => {
                let mut start = key.as_bytes().to_vec();
                start.push(0);
                start
            }
            None => prefix.as_bytes().to_vec(),
        };

        let mut options = GetOptions::new()
            .with_range(prefix_range_end(prefix))
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        if limit > 0 {
            options = options.with_limit(i64::from(limit));
        }

        let mut client = self.client.clone();
        let resp = client.get(start, Some(options)).await.map_err(unavailable)?;

        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            kvs.push(KeyValue {
                key: kv.key_str().map_err(unavailable)?.to_string(),
                value: kv.value_str().map_err(unavailable)?.to_string(),
            });
        }

        Ok(Page {
            kvs,
            more: resp.more(),
        })
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        let ttl = i64::try_from(ttl.as_secs().max(1))
            .map_err(|_| Error::InvalidConfig(format!("lease TTL too large: {:?}", ttl)))?;
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await.map_err(unavailable)?;
        Ok(resp.id())
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await.map_err(unavailable)?;
        keeper.keep_alive().await.map_err(unavailable)?;

        match stream.message().await.map_err(unavailable)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            // etcd answers TTL 0 for leases it no longer knows
            _ => Err(Error::LeaseExpired(lease)),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await.map_err(unavailable)?;
        Ok(())
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey> {
        let mut client = self.client.clone();
        let resp = client
            .lock(name, Some(LockOptions::new().with_lease(lease)))
            .await
            .map_err(unavailable)?;
        Ok(LockKey {
            name: name.to_string(),
            lease,
            token: resp.key().to_vec(),
        })
    }

    /// The lock service stores a held lock under `{name}/{lease:x}`.
    fn lock_key(&self, name: &str, lease: LeaseId) -> LockKey {
        LockKey {
            name: name.to_string(),
            lease,
            token: lock_token(name, lease),
        }
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        let mut client = self.client.clone();
        client
            .unlock(key.token.clone())
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
