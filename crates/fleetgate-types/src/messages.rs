//! Control channel message types
//!
//! Messages are bincode-encoded and carried over a length-delimited TCP
//! framing. The first message on a connection classifies it: `AgentHello`
//! opens a control channel, `DataHello` attaches a data channel to a
//! pending activation.

use crate::edge::EdgeJob;
use crate::endpoint::EndpointId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level encode/decode errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Messages exchanged between the control plane and agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Agent opens its long-lived control connection.
    AgentHello {
        endpoint_id: EndpointId,
        node_name: String,
        agent_version: String,
    },
    /// Control plane accepts the control connection.
    HelloAck {
        heartbeat_interval_secs: u64,
        pending_jobs: Vec<EdgeJob>,
    },
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    /// Control plane asks the agent to dial a data connection, presenting
    /// the one-time token when it does.
    OpenDataChannel {
        token: String,
    },
    /// First message on an agent-initiated data connection.
    DataHello {
        token: String,
    },
    /// Job schedule update pushed over the control channel.
    PendingJobs {
        jobs: Vec<EdgeJob>,
    },
    Disconnect {
        reason: String,
    },
}

/// Encode a control message for a length-delimited frame.
pub fn encode_message(message: &ControlMessage) -> Result<Bytes, WireError> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

/// Decode a control message from a length-delimited frame.
pub fn decode_message(payload: &[u8]) -> Result<ControlMessage, WireError> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{EdgeJobEndpointMeta, EdgeJobId, EdgeJobLogsStatus};
    use std::collections::HashMap;

    #[test]
    fn test_hello_round_trip() {
        let message = ControlMessage::AgentHello {
            endpoint_id: EndpointId(12),
            node_name: "edge-12".to_string(),
            agent_version: "1.4.0".to_string(),
        };

        let encoded = encode_message(&message).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_hello_ack_carries_jobs() {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            EndpointId(12),
            EdgeJobEndpointMeta {
                collect_logs: true,
                logs_status: EdgeJobLogsStatus::Pending,
            },
        );
        let message = ControlMessage::HelloAck {
            heartbeat_interval_secs: 10,
            pending_jobs: vec![EdgeJob {
                id: EdgeJobId(4),
                cron_expression: "@hourly".to_string(),
                script_path: "jobs/4/script".to_string(),
                endpoints,
            }],
        };

        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        match decoded {
            ControlMessage::HelloAck { pending_jobs, .. } => {
                assert_eq!(pending_jobs.len(), 1);
                assert_eq!(pending_jobs[0].id, EdgeJobId(4));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_message(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
