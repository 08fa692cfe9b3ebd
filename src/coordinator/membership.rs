//! Membership registry
//!
//! Members advertise themselves under
//! `/services/{service}/members/{member_id}` with their lease attached, so an
//! entry disappears on its own once the member stops renewing.

use crate::backend::{CoordinationBackend, LeaseId};
use crate::common::utils::bounded;
use crate::common::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// One registered node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub service_name: String,
    pub member_id: String,
    /// host:port advertised to peers
    pub address: String,
    pub lease: LeaseId,
}

impl Member {
    pub fn key(&self) -> String {
        member_key(&self.service_name, &self.member_id)
    }
}

pub fn members_prefix(service_name: &str) -> String {
    format!("/services/{}/members/", service_name)
}

pub fn member_key(service_name: &str, member_id: &str) -> String {
    format!("{}{}", members_prefix(service_name), member_id)
}

pub struct MembershipRegistry {
    backend: Arc<dyn CoordinationBackend>,
    service_name: String,
    op_timeout: Duration,
    page_limit: u32,
}

impl MembershipRegistry {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        service_name: impl Into<String>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            service_name: service_name.into(),
            op_timeout,
            page_limit: 0,
        }
    }

    /// Request pages of at most `page_limit` keys (0 = backend default).
    pub fn with_page_limit(mut self, page_limit: u32) -> Self {
        self.page_limit = page_limit;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Advertise `member`. Idempotent; re-registering overwrites the entry.
    pub async fn register(&self, member: &Member) -> Result<()> {
        if member.service_name != self.service_name {
            return Err(Error::InvalidConfig(format!(
                "member {} belongs to service {}, registry serves {}",
                member.member_id, member.service_name, self.service_name
            )));
        }

        let key = member.key();
        bounded(
            "register",
            self.op_timeout,
            self.backend.put(&key, &member.address, member.lease),
        )
        .await?;

        tracing::info!(
            service = %self.service_name,
            member = %member.member_id,
            address = %member.address,
            lease = member.lease,
            "Registered member"
        );
        Ok(())
    }

    /// One bounded single-key read, to tell a hung backend from lock contention.
    pub async fn ping(&self) -> Result<()> {
        let prefix = members_prefix(&self.service_name);
        bounded("ping", self.op_timeout, self.backend.get_prefix(&prefix, None, 1)).await?;
        Ok(())
    }

    /// Addresses of every live member, in key order, without duplicates.
    pub async fn list_peers(&self) -> Result<Vec<String>> {
        let prefix = members_prefix(&self.service_name);
        let mut peers = Vec::new();
        let mut seen = HashSet::new();
        let mut after: Option<String> = None;

        loop {
            let page = bounded(
                "list peers",
                self.op_timeout,
                self.backend
                    .get_prefix(&prefix, after.as_deref(), self.page_limit),
            )
            .await?;

            let Some(last) = page.kvs.last() else {
                break;
            };
            after = Some(last.key.clone());

            for kv in page.kvs {
                if seen.insert(kv.value.clone()) {
                    peers.push(kv.value);
                }
            }

            if !page.more {
                break;
            }
        }

        tracing::debug!(service = %self.service_name, peers = peers.len(), "Listed peers");
        Ok(peers)
    }
}
