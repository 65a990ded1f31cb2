//! Caller-facing facade over the lifecycle managers
//!
//! [`Controller`] validates raw inputs, dispatches to the quota or forwarding
//! manager, re-syncs shadow quotas after forwarding changes and records every
//! mutation in the audit trail.

use crate::audit::{AuditLog, EventType};
use crate::config::Config;
use crate::core::control::{self, ControlPlane, NftClient};
use crate::core::error::Result;
use crate::core::forward::ForwardingManager;
use crate::core::model::{AllowedPort, ForwardSpec, ForwardingRule, QuotaRule};
use crate::core::quota::QuotaManager;
use crate::core::snapshot;
use crate::core::store::DisabledForwardStore;
use crate::core::topology::Topology;
use crate::validators::{
    parse_forward_id, parse_protocol, sanitize_comment, validate_forward, validate_port,
    validate_quota_bytes,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Parameters of a new forward, as received from a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub src_port: u16,
    #[serde(flatten)]
    pub target: ForwardTarget,
}

/// Everything about a forward except its source port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub dst_ip: String,
    pub dst_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub limit_mbps: u32,
}

fn default_protocol() -> String {
    "both".to_string()
}

impl ForwardTarget {
    fn validate(&self, src_port: u16) -> Result<ForwardSpec> {
        validate_forward(
            src_port,
            &self.dst_ip,
            self.dst_port,
            &self.protocol,
            &self.comment,
            self.limit_mbps,
        )
    }
}

/// Forwarding operations addressed by id alone
#[derive(Debug, Clone, Copy)]
enum Transition {
    Enable,
    Disable,
    Delete,
}

impl Transition {
    fn event(self) -> EventType {
        match self {
            Transition::Enable => EventType::EnableForward,
            Transition::Disable => EventType::DisableForward,
            Transition::Delete => EventType::DeleteForward,
        }
    }
}

pub struct Controller<C: ControlPlane> {
    cp: Arc<C>,
    quotas: QuotaManager<C>,
    forwards: Arc<ForwardingManager<C>>,
    audit: AuditLog,
    ruleset_path: PathBuf,
}

impl Controller<NftClient> {
    pub fn from_config(config: &Config) -> Self {
        Self::new(NftClient::from_config(config), config)
    }
}

impl<C: ControlPlane> Controller<C> {
    pub fn new(cp: C, config: &Config) -> Self {
        let cp = Arc::new(cp);
        let topo = Topology::from_config(config);
        let forwards = Arc::new(ForwardingManager::new(
            Arc::clone(&cp),
            topo.clone(),
            DisabledForwardStore::new(&config.disabled_forwards_path),
        ));
        Self {
            quotas: QuotaManager::new(Arc::clone(&cp), topo, Arc::clone(&forwards)),
            forwards,
            cp,
            audit: AuditLog::new(config.audit_log_path.clone()),
            ruleset_path: config.ruleset_path.clone(),
        }
    }

    pub fn control_plane(&self) -> &C {
        &self.cp
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    // Quotas

    pub async fn list_quotas(&self) -> Result<Vec<QuotaRule>> {
        self.quotas.list().await
    }

    pub async fn add_quota(
        &self,
        port: u16,
        protocol: &str,
        bytes: u64,
        comment: &str,
    ) -> Result<QuotaRule> {
        let result = async {
            let port = validate_port("port", port)?;
            let protocol = parse_protocol(protocol)?;
            let bytes = validate_quota_bytes(bytes)?;
            self.quotas
                .add(port, protocol, bytes, &sanitize_comment(comment))
                .await
        }
        .await;
        self.audit
            .record(
                EventType::AddQuota,
                json!({"port": port, "protocol": protocol, "bytes": bytes}),
                &result,
            )
            .await;
        result
    }

    pub async fn modify_quota(&self, id: &str, bytes: u64) -> Result<()> {
        let result = async {
            let bytes = validate_quota_bytes(bytes)?;
            self.quotas.modify(id, bytes).await
        }
        .await;
        self.audit
            .record(
                EventType::ModifyQuota,
                json!({"id": id, "bytes": bytes}),
                &result,
            )
            .await;
        result
    }

    pub async fn reset_quota(&self, id: &str) -> Result<()> {
        let result = self.quotas.reset(id).await;
        self.audit
            .record(EventType::ResetQuota, json!({"id": id}), &result)
            .await;
        result
    }

    pub async fn batch_reset(&self, ids: &[String]) -> Result<()> {
        let result = self.quotas.batch_reset(ids).await;
        self.audit
            .record(EventType::ResetQuota, json!({"ids": ids}), &result)
            .await;
        result
    }

    pub async fn delete_quota(&self, id: &str) -> Result<()> {
        let result = self.quotas.delete(id).await;
        self.audit
            .record(EventType::DeleteQuota, json!({"id": id}), &result)
            .await;
        result
    }

    // Allowed ports

    pub async fn list_allowed_ports(&self) -> Result<Vec<AllowedPort>> {
        self.quotas.list_allowed_ports().await
    }

    pub async fn add_allowed_port(&self, port: u16) -> Result<AllowedPort> {
        let result = match validate_port("port", port) {
            Ok(port) => self.quotas.add_allowed_port(port).await,
            Err(e) => Err(e),
        };
        self.audit
            .record(EventType::AddAllowedPort, json!({"port": port}), &result)
            .await;
        result
    }

    pub async fn delete_allowed_port(&self, handle: u64) -> Result<()> {
        let result = self.quotas.delete_allowed_port(handle).await;
        self.audit
            .record(
                EventType::DeleteAllowedPort,
                json!({"handle": handle}),
                &result,
            )
            .await;
        result
    }

    // Forwards

    pub async fn list_forwards(&self) -> Result<Vec<ForwardingRule>> {
        self.forwards.list().await
    }

    pub async fn add_forward(&self, request: &ForwardRequest) -> Result<ForwardingRule> {
        let result = async {
            let spec = request.target.validate(request.src_port)?;
            self.forwards.add(&spec).await
        }
        .await;
        self.after_forward_change(EventType::AddForward, request.src_port, &result)
            .await;
        result
    }

    pub async fn edit_forward(&self, id: &str, target: &ForwardTarget) -> Result<ForwardingRule> {
        let port = self.forward_port(EventType::EditForward, id).await?;
        let result = async {
            let spec = target.validate(port)?;
            self.forwards.edit(&spec).await
        }
        .await;
        self.after_forward_change(EventType::EditForward, port, &result)
            .await;
        result
    }

    pub async fn delete_forward(&self, id: &str) -> Result<ForwardingRule> {
        self.forward_transition(Transition::Delete, id).await
    }

    pub async fn enable_forward(&self, id: &str) -> Result<ForwardingRule> {
        self.forward_transition(Transition::Enable, id).await
    }

    pub async fn disable_forward(&self, id: &str) -> Result<ForwardingRule> {
        self.forward_transition(Transition::Disable, id).await
    }

    async fn forward_transition(&self, op: Transition, id: &str) -> Result<ForwardingRule> {
        let event = op.event();
        let port = self.forward_port(event, id).await?;
        let result = match op {
            Transition::Enable => self.forwards.enable(port).await,
            Transition::Disable => self.forwards.disable(port).await,
            Transition::Delete => self.forwards.delete(port).await,
        };
        self.after_forward_change(event, port, &result).await;
        result
    }

    /// Source port of a forwarding id; a malformed id is audited as a failed `event`.
    async fn forward_port(&self, event: EventType, id: &str) -> Result<u16> {
        let port = parse_forward_id(id);
        if port.is_err() {
            self.audit.record(event, json!({"id": id}), &port).await;
        }
        port
    }

    /// Audits a forwarding mutation and, when it took effect, brings the
    /// port's shadow quota in line with the new forwarding state.
    async fn after_forward_change(
        &self,
        event: EventType,
        port: u16,
        result: &Result<ForwardingRule>,
    ) {
        self.audit
            .record(event, json!({"src_port": port}), result)
            .await;
        if result.is_ok()
            && let Err(e) = self.quotas.sync_shadow(port).await
        {
            warn!("Shadow quota for port {port} is out of sync: {e}");
        }
    }

    // Ruleset

    /// `nft list ruleset`, verbatim.
    pub async fn raw_ruleset(&self) -> Result<String> {
        control::list_ruleset(self.cp.as_ref()).await
    }

    pub async fn save_ruleset(&self) -> Result<String> {
        let result = snapshot::save_ruleset(self.cp.as_ref(), &self.ruleset_path).await;
        self.audit
            .record(
                EventType::SaveRuleset,
                json!({"path": self.ruleset_path}),
                &result,
            )
            .await;
        result
    }

    pub async fn restore_ruleset(&self) -> Result<bool> {
        let result = snapshot::restore_ruleset(self.cp.as_ref(), &self.ruleset_path).await;
        self.audit
            .record(
                EventType::RestoreRuleset,
                json!({"path": self.ruleset_path}),
                &result,
            )
            .await;
        result
    }
}
