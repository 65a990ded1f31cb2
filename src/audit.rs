/// Audit logging for firewall mutations
///
/// Every mutation nftgate performs (quotas, allowed ports, forwards, snapshots) is
/// appended as one JSON object per line. Writing the trail never fails the
/// operation being audited: write errors are only logged.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AddQuota,
    ModifyQuota,
    ResetQuota,
    DeleteQuota,
    AddAllowedPort,
    DeleteAllowedPort,
    AddForward,
    EditForward,
    DeleteForward,
    EnableForward,
    DisableForward,
    SaveRuleset,
    RestoreRuleset,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer; disabled when no path is configured
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    log_path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(log_path: Option<PathBuf>) -> Self {
        Self { log_path }
    }

    pub fn disabled() -> Self {
        Self { log_path: None }
    }

    /// Appends an event to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let json = serde_json::to_string(event)?;
        crate::utils::ensure_parent(path)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Records the outcome of an operation, logging write failures instead of returning them.
    pub async fn record<T>(
        &self,
        event_type: EventType,
        details: serde_json::Value,
        result: &crate::core::error::Result<T>,
    ) {
        let event = AuditEvent::new(
            event_type,
            result.is_ok(),
            details,
            result.as_ref().err().map(ToString::to_string),
        );
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let Some(path) = &self.log_path else {
            return Ok(Vec::new());
        };
        let content = tokio::fs::read_to_string(path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;

    #[tokio::test]
    async fn test_audit_event_creation() {
        let event = AuditEvent::new(
            EventType::AddQuota,
            true,
            serde_json::json!({"port": 8080}),
            None,
        );

        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.details["port"], 8080);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::DisableForward,
            false,
            serde_json::json!({"id": "fwd_9000"}),
            Some("not found".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("disable_forward"));
        assert!(json.contains("not found"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"reset_quota","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::ResetQuota);
    }

    #[tokio::test]
    async fn test_record_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(Some(dir.path().join("logs/audit.log")));

        let ok: crate::core::error::Result<()> = Ok(());
        let failed: crate::core::error::Result<()> = Err(Error::NotFound("fwd_1".into()));
        log.record(EventType::AddForward, serde_json::json!({"src_port": 1}), &ok)
            .await;
        log.record(EventType::DeleteForward, serde_json::json!({"id": "fwd_1"}), &failed)
            .await;

        let events = log.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::DeleteForward);
        assert!(!events[0].success);
        assert_eq!(events[0].error.as_deref(), Some("Not found: fwd_1"));
        assert!(events[1].success);
    }

    #[tokio::test]
    async fn test_disabled_log_is_noop() {
        let log = AuditLog::disabled();
        let ok: crate::core::error::Result<()> = Ok(());
        log.record(EventType::SaveRuleset, serde_json::json!({}), &ok)
            .await;
        assert!(log.read_recent(5).await.unwrap().is_empty());
    }
}
