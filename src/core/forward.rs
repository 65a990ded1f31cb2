//! Forwarding lifecycle
//!
//! A forward is either **enabled** (three rules in the `ip nat` chains, tagged with
//! the forwarding marker) or **disabled** (one record in the
//! [`DisabledForwardStore`], nothing in the firewall). Enable and Disable move a
//! forward between the two; Edit and Delete act on whichever side holds it.
//!
//! Every method except [`ForwardingManager::find_enabled`] holds the manager's lock
//! from the first listing to the last mutation, so a duplicate check can never be
//! raced by a concurrent Add.

use crate::core::codec::{self, NftRule};
use crate::core::compiler;
use crate::core::control::{self, ControlPlane};
use crate::core::error::{Error, Result};
use crate::core::model::{ForwardSpec, ForwardingRule};
use crate::core::store::DisabledForwardStore;
use crate::core::topology::Topology;
use crate::core::txn;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct ForwardingManager<C: ControlPlane> {
    cp: Arc<C>,
    topo: Topology,
    store: DisabledForwardStore,
    lock: Mutex<()>,
}

impl<C: ControlPlane> ForwardingManager<C> {
    pub fn new(cp: Arc<C>, topo: Topology, store: DisabledForwardStore) -> Self {
        Self {
            cp,
            topo,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Live forwards decoded from the prerouting/postrouting chains.
    async fn live(&self) -> Result<Vec<ForwardingRule>> {
        let pre = control::list_rules(self.cp.as_ref(), &self.topo.prerouting.chain).await?;
        let post = control::list_rules(self.cp.as_ref(), &self.topo.postrouting.chain).await?;
        Ok(codec::decode_forwards(&pre, &post))
    }

    /// Every rule in the three nat chains tagged for `src_port`, in install order.
    async fn tagged_rules(&self, src_port: u16) -> Result<Vec<NftRule>> {
        let mut tagged = Vec::new();
        for base in self.topo.nat_chains() {
            let rules = control::list_rules(self.cp.as_ref(), &base.chain).await?;
            tagged.extend(codec::forward_rules_for(&rules, src_port));
        }
        Ok(tagged)
    }

    async fn ensure_nat(&self) -> Result<()> {
        for base in self.topo.nat_chains() {
            control::ensure_chain(self.cp.as_ref(), base).await?;
        }
        Ok(())
    }

    async fn install(&self, spec: &ForwardSpec, replacing: &[NftRule]) -> Result<ForwardingRule> {
        self.ensure_nat().await?;
        let ops = compiler::compile_edit_forward(replacing, &self.topo, spec);
        let outcome = txn::execute(self.cp.as_ref(), &ops).await?;
        Ok(ForwardingRule {
            enabled: true,
            pre_handle: outcome.handle_in(&self.topo.prerouting.chain),
            post_handle: outcome.handle_in(&self.topo.postrouting.chain),
            ..ForwardingRule::disabled(spec)
        })
    }

    /// All forwards: live ones first, then disabled ones.
    pub async fn list(&self) -> Result<Vec<ForwardingRule>> {
        let _guard = self.lock.lock().await;
        let mut rules = self.live().await?;
        rules.extend(self.store.load().await?);
        Ok(rules)
    }

    /// Enabled forward on `src_port`, read without taking the lock.
    ///
    /// Used by the quota side for shadow-rule sync. The result may be stale with
    /// respect to a concurrent forwarding mutation.
    pub async fn find_enabled(&self, src_port: u16) -> Result<Option<ForwardingRule>> {
        Ok(self
            .live()
            .await?
            .into_iter()
            .find(|r| r.src_port == src_port))
    }

    /// Installs a new forward.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if the source port is used by a live or a disabled forward.
    pub async fn add(&self, spec: &ForwardSpec) -> Result<ForwardingRule> {
        let _guard = self.lock.lock().await;

        let in_use_live = self.live().await?.iter().any(|r| r.src_port == spec.src_port);
        let in_use_disabled = self
            .store
            .load()
            .await?
            .iter()
            .any(|r| r.src_port == spec.src_port);
        if in_use_live || in_use_disabled {
            return Err(Error::Conflict(format!(
                "source port {} is already in use{}",
                spec.src_port,
                if in_use_disabled { " (disabled rule)" } else { "" }
            )));
        }

        let rule = self.install(spec, &[]).await?;
        info!(
            "Added forward {} -> {}:{} ({})",
            spec.src_port, spec.dst_ip, spec.dst_port, spec.protocol
        );
        Ok(rule)
    }

    /// Replaces destination, protocol, comment and limit of the forward on `spec.src_port`.
    ///
    /// A disabled forward is updated in the store only.
    pub async fn edit(&self, spec: &ForwardSpec) -> Result<ForwardingRule> {
        let _guard = self.lock.lock().await;

        let mut disabled = self.store.load().await?;
        if let Some(slot) = disabled.iter_mut().find(|r| r.src_port == spec.src_port) {
            *slot = ForwardingRule::disabled(spec);
            let updated = slot.clone();
            self.store.save(&disabled).await?;
            info!("Edited disabled forward {}", updated.id);
            return Ok(updated);
        }

        let current = self.require_live(spec.src_port).await?;
        let tagged = self.tagged_rules(spec.src_port).await?;
        let rule = self.install(spec, &tagged).await?;
        info!("Edited forward {}", current.id);
        Ok(rule)
    }

    /// Removes a forward from wherever it lives.
    pub async fn delete(&self, src_port: u16) -> Result<ForwardingRule> {
        let _guard = self.lock.lock().await;

        let mut disabled = self.store.load().await?;
        if let Some(pos) = disabled.iter().position(|r| r.src_port == src_port) {
            let removed = disabled.remove(pos);
            self.store.save(&disabled).await?;
            info!("Deleted disabled forward {}", removed.id);
            return Ok(removed);
        }

        let current = self.require_live(src_port).await?;
        let tagged = self.tagged_rules(src_port).await?;
        txn::execute(self.cp.as_ref(), &compiler::compile_delete_rules(&tagged)).await?;
        info!("Deleted forward {}", current.id);
        Ok(current)
    }

    /// Moves a disabled forward from the store into the firewall.
    pub async fn enable(&self, src_port: u16) -> Result<ForwardingRule> {
        let _guard = self.lock.lock().await;

        // Another rule may have claimed the port while this one was disabled
        if self.live().await?.iter().any(|r| r.src_port == src_port) {
            return Err(Error::Conflict(format!(
                "source port {src_port} already has a live forward"
            )));
        }

        let mut disabled = self.store.load().await?;
        let Some(pos) = disabled.iter().position(|r| r.src_port == src_port) else {
            return Err(Error::NotFound(format!("disabled forward on port {src_port}")));
        };

        let spec = disabled[pos].spec();
        self.ensure_nat().await?;
        let ops = compiler::compile_add_forward(&self.topo, &spec);
        let outcome = txn::execute(self.cp.as_ref(), &ops).await?;

        let enabled = disabled.remove(pos);
        if let Err(e) = self.store.save(&disabled).await {
            warn!("Could not drop port {src_port} from the store, reverting enable: {e}");
            txn::undo(self.cp.as_ref(), &outcome).await;
            return Err(e);
        }

        info!("Enabled forward {}", enabled.id);
        Ok(ForwardingRule {
            enabled: true,
            pre_handle: outcome.handle_in(&self.topo.prerouting.chain),
            post_handle: outcome.handle_in(&self.topo.postrouting.chain),
            ..enabled
        })
    }

    /// Moves a live managed forward from the firewall into the store.
    ///
    /// The store is written first, so a failure in either step never loses the forward.
    pub async fn disable(&self, src_port: u16) -> Result<ForwardingRule> {
        let _guard = self.lock.lock().await;

        let current = self.require_live(src_port).await?;
        let tagged = self.tagged_rules(src_port).await?;

        let previous = self.store.load().await?;
        let record = ForwardingRule::disabled(&current.spec());
        let mut disabled = previous.clone();
        disabled.push(record.clone());
        self.store.save(&disabled).await?;

        if let Err(e) =
            txn::execute(self.cp.as_ref(), &compiler::compile_delete_rules(&tagged)).await
        {
            if let Err(restore) = self.store.save(&previous).await {
                warn!("Could not restore the store after a failed disable: {restore}");
            }
            return Err(e);
        }

        info!("Disabled forward {}", record.id);
        Ok(record)
    }

    /// The live managed forward on `src_port`.
    async fn require_live(&self, src_port: u16) -> Result<ForwardingRule> {
        let current = self
            .live()
            .await?
            .into_iter()
            .find(|r| r.src_port == src_port)
            .ok_or_else(|| Error::NotFound(format!("forward on port {src_port}")))?;
        if !current.managed {
            return Err(Error::NotManaged(current.pre_handle.unwrap_or_default()));
        }
        Ok(current)
    }
}
