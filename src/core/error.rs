use thiserror::Error;

/// Core error types for nftgate
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input rejected before any control-plane call
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Unknown quota id, forwarding id or handle
    #[error("Not found: {0}")]
    NotFound(String),

    /// Source port or allowed port already in use
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Refusal to touch an accept rule this tool did not create
    #[error("Rule with handle {0} is not managed by nftgate")]
    NotManaged(u64),

    /// nft exited with a non-zero status
    #[error("nft {} failed: {message}", .args.join(" "))]
    Nftables {
        args: Vec<String>,
        message: String,
        exit_code: Option<i32>,
    },

    /// nft did not finish within the configured timeout
    #[error("nft {} timed out after {secs}s", .args.join(" "))]
    Timeout { args: Vec<String>, secs: u64 },

    /// nft produced output that is not a valid rule listing
    #[error("Malformed nft output: {0}")]
    Decode(String),

    /// Disabled-forward store could not be read or written
    #[error("Store error: {0}")]
    Store(String),

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// One item of a batch failed; earlier items stay applied
    #[error("Failed to reset {id}: {source}")]
    BatchItem {
        id: String,
        #[source]
        source: Box<Error>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Coarse category a caller can map onto a status code.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. } => ErrorCategory::Validation,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::Conflict(_) | Error::NotManaged(_) => ErrorCategory::Conflict,
            Error::Nftables { .. }
            | Error::Timeout { .. }
            | Error::Decode(_)
            | Error::Elevation(_) => ErrorCategory::ControlPlane,
            Error::BatchItem { source, .. } => source.category(),
            Error::Io(_)
            | Error::Serialization(_)
            | Error::Store(_)
            | Error::Snapshot(_)
            | Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// True when nft reported that the listed table or chain is absent.
    pub fn is_missing_object(&self) -> bool {
        match self {
            // Spawn failures carry no exit code and must not read as a missing chain
            Error::Nftables {
                message,
                exit_code: Some(_),
                ..
            } => {
                message.contains("No such file or directory")
                    || message.contains("does not exist")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ErrorCategory {
    #[strum(serialize = "validation")]
    Validation,
    #[strum(serialize = "not-found")]
    NotFound,
    #[strum(serialize = "conflict")]
    Conflict,
    #[strum(serialize = "control-plane")]
    ControlPlane,
    #[strum(serialize = "internal")]
    Internal,
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot is empty")]
    Empty,

    #[error("Snapshot restore failed: {0}")]
    RestoreFailed(String),
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run nftgate as root or allow sudo/run0 for the nft binary")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("This usually means nft was started without root privileges")
            .with_suggestion("Set NFTGATE_ELEVATION_METHOD=sudo to force elevation");
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The nft process did not answer in time and was killed")
                .with_suggestion("Check system load: uptime")
                .with_suggestion("Raise command_timeout_secs in the configuration");
        }

        if lower.contains("command not found")
            || (lower.contains("no such file") && lower.contains("spawn"))
        {
            return ErrorTranslation::new("nftables is not installed or not found")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install nftables  (Fedora/RHEL)")
                .with_suggestion("Verify nft_binary in the configuration");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("Adding a quota, port or forward creates the table on demand");
        }

        if lower.contains("chain")
            && (lower.contains("does not exist") || lower.contains("not found"))
        {
            return ErrorTranslation::new("Firewall chain not found").with_suggestion(
                "Check table_family, table_name and chain_name in the configuration",
            );
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("nft rejected the generated rule")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Ensure the destination is a plain IPv4 address");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables");
        }

        if lower.contains("resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying nftables")
                .with_suggestion("Wait a moment and try again");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify nftables is working: sudo nft list ruleset")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nftables_missing_command() {
        let translation = NftablesErrorPattern::match_error("command not found: nft");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_timeout_translation() {
        let err = Error::Timeout {
            args: vec!["list".into(), "ruleset".into()],
            secs: 10,
        };
        let translation = NftablesErrorPattern::match_error(&err.to_string());
        assert_eq!(translation.user_message, "Operation timed out");
    }

    #[test]
    fn test_missing_chain_translation() {
        let translation = NftablesErrorPattern::match_error(
            "Error: No such file or directory; chain output does not exist",
        );
        assert!(translation.user_message.contains("chain"));
    }

    #[test]
    fn test_nftables_error_carries_args() {
        let err = Error::Nftables {
            args: vec!["-j".into(), "-a".into(), "list".into(), "chain".into()],
            message: "boom".into(),
            exit_code: Some(1),
        };
        assert_eq!(err.to_string(), "nft -j -a list chain failed: boom");
        assert_eq!(err.category(), ErrorCategory::ControlPlane);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::validation("port", "bad").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            Error::NotFound("fwd_1".into()).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(Error::NotManaged(3).category(), ErrorCategory::Conflict);
        assert_eq!(ErrorCategory::NotFound.to_string(), "not-found");
    }

    #[test]
    fn test_batch_item_keeps_inner_category() {
        let err = Error::BatchItem {
            id: "inet_filter_output_4_80".into(),
            source: Box::new(Error::NotFound("inet_filter_output_4_80".into())),
        };
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(err.to_string().starts_with("Failed to reset inet_filter_output_4_80"));
    }

    #[test]
    fn test_missing_object_detection() {
        let err = Error::Nftables {
            args: vec![],
            message: "Error: No such file or directory".into(),
            exit_code: Some(1),
        };
        assert!(err.is_missing_object());
        assert!(!Error::Internal("x".into()).is_missing_object());

        let spawn = Error::Nftables {
            args: vec![],
            message: "failed to spawn /usr/sbin/nft: No such file or directory (os error 2)".into(),
            exit_code: None,
        };
        assert!(!spawn.is_missing_object());
    }
}
