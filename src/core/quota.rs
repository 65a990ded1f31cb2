//! Quota and allowed-port lifecycle
//!
//! Quotas live in the configured output chain. When a quota's port is also the
//! source port of an enabled forward, the same limit is mirrored by a shadow rule
//! in `ip filter forward` that counts traffic returning from the forward's backend.
//! The shadow rule is derived state: it is rebuilt in the same transaction as every
//! quota Add/Modify/Reset and removed with every Delete.

use crate::core::codec::{self, NftRule};
use crate::core::compiler::{self, Op};
use crate::core::control::{self, ControlPlane};
use crate::core::error::{Error, Result};
use crate::core::forward::ForwardingManager;
use crate::core::marker;
use crate::core::model::{AllowedPort, Protocol, QuotaRule};
use crate::core::topology::Topology;
use crate::core::txn;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct QuotaManager<C: ControlPlane> {
    cp: Arc<C>,
    topo: Topology,
    forwards: Arc<ForwardingManager<C>>,
    lock: Mutex<()>,
}

/// A decoded quota together with the rule it came from
struct Located {
    quota: QuotaRule,
    rule: NftRule,
    /// Every port the rule matches
    ports: Vec<u16>,
}

impl<C: ControlPlane> QuotaManager<C> {
    pub fn new(cp: Arc<C>, topo: Topology, forwards: Arc<ForwardingManager<C>>) -> Self {
        Self {
            cp,
            topo,
            forwards,
            lock: Mutex::new(()),
        }
    }

    /// All quotas, with shadow-rule usage folded into their used bytes.
    pub async fn list(&self) -> Result<Vec<QuotaRule>> {
        let _guard = self.lock.lock().await;

        let rules = control::list_rules(self.cp.as_ref(), &self.topo.quota.chain).await?;
        let mut quotas = codec::decode_quotas(&rules);

        match control::list_rules(self.cp.as_ref(), &self.topo.forward.chain).await {
            Ok(forward_rules) => {
                let usage = codec::shadow_usage(&forward_rules);
                for quota in &mut quotas {
                    if let Some(bytes) = usage.get(&quota.port) {
                        quota.add_usage(*bytes);
                    }
                }
            }
            Err(e) => warn!("Forward chain usage unavailable: {e}"),
        }

        Ok(quotas)
    }

    async fn locate(&self, id: &str) -> Result<Located> {
        let rules = control::list_rules(self.cp.as_ref(), &self.topo.quota.chain).await?;
        let quotas = codec::decode_quotas(&rules);
        let quota = quotas
            .iter()
            .find(|q| q.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("quota {id}")))?;
        let rule = rules
            .iter()
            .find(|r| r.handle == quota.handle)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("rule for {id} vanished from listing")))?;
        let ports = quotas
            .iter()
            .filter(|q| q.handle == quota.handle && q.port != 0)
            .map(|q| q.port)
            .collect();
        Ok(Located { quota, rule, ports })
    }

    /// Ops that bring the shadow rule of `port` in line with a `bytes` limit.
    ///
    /// Without an enabled forward on the port, existing shadow rules are removed.
    async fn shadow_ops(&self, port: u16, bytes: Option<u64>) -> Result<Vec<Op>> {
        let forward_rules = control::list_rules(self.cp.as_ref(), &self.topo.forward.chain).await?;
        let existing = codec::shadow_rules_for(&forward_rules, port);

        let target = match bytes {
            Some(bytes) => self
                .forwards
                .find_enabled(port)
                .await?
                .map(|fwd| (fwd, bytes)),
            None => None,
        };

        match target {
            Some((fwd, bytes)) => {
                control::ensure_chain(self.cp.as_ref(), &self.topo.forward).await?;
                Ok(compiler::compile_resync_shadow(
                    &existing,
                    &self.topo,
                    &fwd.spec(),
                    bytes,
                ))
            }
            None => Ok(compiler::compile_delete_rules(&existing)),
        }
    }

    async fn shadow_ops_for_ports(&self, ports: &[u16], bytes: Option<u64>) -> Result<Vec<Op>> {
        let mut ops = Vec::new();
        for port in ports {
            ops.extend(self.shadow_ops(*port, bytes).await?);
        }
        Ok(ops)
    }

    /// Adds a quota on a local source port.
    pub async fn add(
        &self,
        port: u16,
        protocol: Protocol,
        bytes: u64,
        comment: &str,
    ) -> Result<QuotaRule> {
        let _guard = self.lock.lock().await;

        control::ensure_chain(self.cp.as_ref(), &self.topo.quota).await?;
        let mut ops = compiler::compile_add_quota(&self.topo, port, protocol, bytes, comment);
        ops.extend(self.shadow_ops(port, Some(bytes)).await?);

        let outcome = txn::execute(self.cp.as_ref(), &ops).await?;
        let handle = outcome
            .handle_in(&self.topo.quota.chain)
            .ok_or_else(|| Error::Internal("quota add produced no handle".into()))?;

        info!("Added quota on port {port}: {bytes} bytes");
        Ok(QuotaRule::new(
            &self.topo.quota.chain,
            handle,
            port,
            protocol,
            compiler::mbytes_ceil(bytes) * 1_000_000,
            0,
            comment.to_string(),
        ))
    }

    /// Recreates the quota `id` with a new limit and a zeroed counter.
    ///
    /// On failure the transaction restores the previous rule, counter included.
    pub async fn modify(&self, id: &str, bytes: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.recreate(id, Some(bytes)).await
    }

    /// Zeroes the counter of quota `id`, keeping its limit.
    pub async fn reset(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.recreate(id, None).await
    }

    async fn recreate(&self, id: &str, bytes: Option<u64>) -> Result<()> {
        let located = self.locate(id).await?;
        let bytes = bytes.unwrap_or(located.quota.quota_bytes);

        let mut ops = compiler::compile_recreate_quota(&located.rule, bytes);
        ops.extend(self.shadow_ops_for_ports(&located.ports, Some(bytes)).await?);
        txn::execute(self.cp.as_ref(), &ops).await?;

        info!("Recreated quota {id} with {bytes} bytes");
        Ok(())
    }

    /// Resets each id in order. The first failure stops the batch; earlier
    /// resets stay applied.
    pub async fn batch_reset(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.reset(id).await.map_err(|e| Error::BatchItem {
                id: id.clone(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Deletes quota `id` and, unconditionally, its shadow rules.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let located = self.locate(id).await?;
        let mut ops = vec![Op::delete(located.rule)];
        ops.extend(self.shadow_ops_for_ports(&located.ports, None).await?);
        txn::execute(self.cp.as_ref(), &ops).await?;

        info!("Deleted quota {id}");
        Ok(())
    }

    /// Rebuilds the shadow rule of `port` after its forward changed.
    ///
    /// Called after forward mutations, never while the forwarding lock is held.
    pub async fn sync_shadow(&self, port: u16) -> Result<()> {
        let _guard = self.lock.lock().await;

        let rules = control::list_rules(self.cp.as_ref(), &self.topo.quota.chain).await?;
        let limit = codec::decode_quotas(&rules)
            .into_iter()
            .find(|q| q.port == port)
            .map(|q| q.quota_bytes);

        let ops = self.shadow_ops(port, limit).await?;
        if !ops.is_empty() {
            txn::execute(self.cp.as_ref(), &ops).await?;
            info!("Resynced shadow quota for port {port}");
        }
        Ok(())
    }

    pub async fn list_allowed_ports(&self) -> Result<Vec<AllowedPort>> {
        let _guard = self.lock.lock().await;
        let rules = control::list_rules(self.cp.as_ref(), &self.topo.input.chain).await?;
        Ok(codec::decode_allowed_ports(&rules))
    }

    /// Inserts a managed accept rule for `port`.
    pub async fn add_allowed_port(&self, port: u16) -> Result<AllowedPort> {
        let _guard = self.lock.lock().await;

        control::ensure_chain(self.cp.as_ref(), &self.topo.input).await?;
        let rules = control::list_rules(self.cp.as_ref(), &self.topo.input.chain).await?;
        if codec::decode_allowed_ports(&rules)
            .iter()
            .any(|p| p.port == port)
        {
            return Err(Error::Conflict(format!("port {port} is already allowed")));
        }

        let outcome = txn::execute(
            self.cp.as_ref(),
            &compiler::compile_allow_port(&self.topo, port),
        )
        .await?;
        let handle = outcome
            .handle_in(&self.topo.input.chain)
            .ok_or_else(|| Error::Internal("allow-port add produced no handle".into()))?;

        info!("Allowed inbound port {port}");
        Ok(AllowedPort {
            port,
            handle,
            managed: true,
            comment: marker::MANAGED.to_string(),
        })
    }

    /// Deletes the managed accept rule with `handle`.
    ///
    /// # Errors
    ///
    /// [`Error::NotManaged`] if the rule was not created by nftgate.
    pub async fn delete_allowed_port(&self, handle: u64) -> Result<()> {
        let _guard = self.lock.lock().await;

        let rules = control::list_rules(self.cp.as_ref(), &self.topo.input.chain).await?;
        let allowed = codec::decode_allowed_ports(&rules);
        let entry = allowed
            .iter()
            .find(|p| p.handle == handle)
            .ok_or_else(|| Error::NotFound(format!("allowed port with handle {handle}")))?;
        if !entry.managed {
            return Err(Error::NotManaged(handle));
        }
        let rule = rules
            .iter()
            .find(|r| r.handle == handle)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("rule {handle} vanished from listing")))?;

        txn::execute(self.cp.as_ref(), &[Op::delete(rule)]).await?;
        info!("Removed allowed port {} (handle {handle})", entry.port);
        Ok(())
    }
}
