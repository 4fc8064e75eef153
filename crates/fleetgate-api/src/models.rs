//! API request/response payloads

use fleetgate_types::{EdgeJobId, EdgeJobLogsStatus, TunnelStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error payload returned by every failing handler.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Service health information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Read-only tunnel state for status views. The locally bound forwarding
/// port is deliberately not part of this payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelStatusView {
    pub status: TunnelStatus,
    /// Seconds since the tunnel last carried traffic.
    pub seconds_since_activity: u64,
    /// Whether the endpoint's agent currently holds a control channel.
    pub agent_connected: bool,
}

/// One scheduled job as delivered to a polling agent.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeJobView {
    pub id: EdgeJobId,
    pub cron_expression: String,
    pub script_path: String,
    pub collect_logs: bool,
    pub logs_status: EdgeJobLogsStatus,
}

/// Poll response for edge agents: tunnel state plus pending work.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EdgeStatusResponse {
    pub status: TunnelStatus,
    /// How often the agent should check in, in seconds.
    pub checkin_interval_secs: u64,
    pub schedules: Vec<EdgeJobView>,
}

/// Uploaded job log content.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogsPayload {
    pub file_content: String,
}
