//! Edge job metadata delivered to polling agents

use crate::endpoint::EndpointId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a scheduled edge job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EdgeJobId(pub u32);

impl fmt::Display for EdgeJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log collection state of a job on one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum EdgeJobLogsStatus {
    #[default]
    Idle,
    Pending,
    Collected,
}

/// Per-endpoint execution metadata of an edge job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EdgeJobEndpointMeta {
    /// Agent should upload the job's log file on its next run.
    pub collect_logs: bool,
    pub logs_status: EdgeJobLogsStatus,
}

/// A job scheduled on one or more edge endpoints.
///
/// Attached to an endpoint's tunnel record so pending work can be delivered
/// when the agent connects or polls, without a separate channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EdgeJob {
    pub id: EdgeJobId,
    pub cron_expression: String,
    /// Where the job script lives on the control plane.
    pub script_path: String,
    /// Execution metadata keyed by endpoint.
    #[serde(default)]
    pub endpoints: HashMap<EndpointId, EdgeJobEndpointMeta>,
}

impl EdgeJob {
    /// Metadata of this job for one endpoint, defaulting when the endpoint
    /// has not been recorded yet.
    pub fn meta_for(&self, endpoint_id: EndpointId) -> EdgeJobEndpointMeta {
        self.endpoints.get(&endpoint_id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_for_missing_endpoint_defaults() {
        let job = EdgeJob {
            id: EdgeJobId(1),
            cron_expression: "*/5 * * * *".to_string(),
            script_path: "jobs/1/script".to_string(),
            endpoints: HashMap::new(),
        };

        let meta = job.meta_for(EndpointId(9));
        assert!(!meta.collect_logs);
        assert_eq!(meta.logs_status, EdgeJobLogsStatus::Idle);
    }

    #[test]
    fn test_meta_for_recorded_endpoint() {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            EndpointId(2),
            EdgeJobEndpointMeta {
                collect_logs: true,
                logs_status: EdgeJobLogsStatus::Pending,
            },
        );
        let job = EdgeJob {
            id: EdgeJobId(7),
            cron_expression: "0 * * * *".to_string(),
            script_path: "jobs/7/script".to_string(),
            endpoints,
        };

        let meta = job.meta_for(EndpointId(2));
        assert!(meta.collect_logs);
        assert_eq!(meta.logs_status, EdgeJobLogsStatus::Pending);
    }
}
