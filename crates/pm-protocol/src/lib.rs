//! Wire types shared between the PrintMaster server and agent:
//! the control-channel message envelope, the signed manifest payload and its
//! transport envelope, the update policy model, and the update telemetry
//! report with its error-code taxonomy.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod msg {
    //! Control-channel message type strings.

    pub const HEARTBEAT: &str = "heartbeat";
    pub const PONG: &str = "pong";
    pub const PROXY_REQUEST: &str = "proxy_request";
    pub const PROXY_RESPONSE: &str = "proxy_response";
    pub const UPDATE_PROGRESS: &str = "update_progress";
    pub const JOB_PROGRESS: &str = "job_progress";
    pub const DEVICE_DELETED: &str = "device_deleted";
    pub const POLICY_UPDATE: &str = "policy_update";
    pub const ERROR: &str = "error";

    // Out-of-band event bus topics.
    pub const AGENT_CONNECTED: &str = "agent_connected";
    pub const AGENT_DISCONNECTED: &str = "agent_disconnected";
}

/// JSON message envelope carried on the control channel (both directions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl WsMessage {
    pub fn new(kind: &str, data: serde_json::Value) -> Self {
        let data = match data {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Error reply sent for unknown or malformed messages.
    pub fn error(message: &str) -> Self {
        Self::new(msg::ERROR, serde_json::json!({ "message": message }))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// The canonical signed payload describing one release artifact.
///
/// Field order is the serialization order; the bytes produced by
/// `canonical_json` are the bytes that get signed and stored, so this struct
/// must not be reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub manifest_version: u32,
    pub component: String,
    pub version: String,
    pub minor_line: String,
    pub platform: String,
    pub arch: String,
    pub channel: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub source_url: String,
    pub published_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

impl ManifestPayload {
    /// Serialize to the canonical byte form used for signing and storage.
    pub fn canonical_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Signed manifest as delivered to agents: the canonical payload bytes, the
/// signature over exactly those bytes, and where to fetch the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedManifest {
    /// Canonical payload JSON (the signed bytes, verbatim).
    pub manifest_json: String,
    /// Base64 Ed25519 signature over `manifest_json`.
    pub signature: String,
    /// Id of the signing key, for key lookup during verification.
    pub signing_key_id: String,
    /// URL the agent fetches the artifact from (supports Range).
    pub download_url: String,
}

impl SignedManifest {
    pub fn payload(&self) -> serde_json::Result<ManifestPayload> {
        serde_json::from_str(&self.manifest_json)
    }
}

// ─── Update policy ───────────────────────────────────────────

/// How far an automatic update may move the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinStrategy {
    #[default]
    None,
    Major,
    Minor,
    Patch,
}

/// Maintenance window within which updates may run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub enabled: bool,
    /// IANA timezone name; UTC when empty or invalid.
    #[serde(default)]
    pub timezone: String,
    /// Allowed weekdays, 0 = Sunday … 6 = Saturday. Empty = every day.
    #[serde(default)]
    pub days_of_week: BTreeSet<u8>,
    pub start_hour: u8,
    pub start_min: u8,
    pub end_hour: u8,
    pub end_min: u8,
}

/// A complete update policy as stored on the server or configured locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Days between update checks; 0 disables automatic updates.
    pub update_check_days: u32,
    #[serde(default)]
    pub version_pin_strategy: PinStrategy,
    #[serde(default)]
    pub allow_major_upgrade: bool,
    /// Exact version pin; overrides the pin strategy when set.
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub maintenance_window: Option<MaintenanceWindow>,
}

impl PolicySpec {
    pub fn enabled(&self) -> bool {
        self.update_check_days > 0
    }
}

// ─── Telemetry ───────────────────────────────────────────────

/// Lifecycle state of one update run. Terminal states are `Succeeded`,
/// `Failed`, and `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    Checking,
    Pending,
    Downloading,
    Staging,
    Applying,
    Restarting,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
    RolledBack,
}

impl UpdateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Staging => "staging",
            Self::Applying => "applying",
            Self::Restarting => "restarting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Error taxonomy shared by the update run record and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateErrorCode {
    DiskSpace,
    DownloadFailed,
    HashMismatch,
    StagingFailed,
    ApplyFailed,
    RestartFailed,
    /// Reserved for a post-restart health probe; never emitted today.
    HealthCheck,
    RollbackFailed,
    ManifestError,
    PolicyDisabled,
    OutsideWindow,
    ServerError,
}

impl UpdateErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiskSpace => "DISK_SPACE",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::HashMismatch => "HASH_MISMATCH",
            Self::StagingFailed => "STAGING_FAILED",
            Self::ApplyFailed => "APPLY_FAILED",
            Self::RestartFailed => "RESTART_FAILED",
            Self::HealthCheck => "HEALTH_CHECK",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::ManifestError => "MANIFEST_ERROR",
            Self::PolicyDisabled => "POLICY_DISABLED",
            Self::OutsideWindow => "OUTSIDE_WINDOW",
            Self::ServerError => "SERVER_ERROR",
        }
    }
}

/// Status event shipped from the agent to the server for each run phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReport {
    pub agent_id: String,
    pub run_id: String,
    pub status: UpdateStatus,
    pub current_version: String,
    #[serde(default)]
    pub target_version: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub download_time_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<UpdateErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Heartbeat payload sent by the agent with host metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub agent_version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub cpu_usage: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub uptime_secs: u64,
}
