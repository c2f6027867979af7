//! Envelope: the unit carried by the message bus.
//!
//! Wire shape follows spec.md §6 exactly. Envelopes are immutable once
//! published — updates are new envelopes referencing the same `task_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Execution priority, ordered low to critical for event-handler dispatch
/// (spec.md §4.3 "sorted by priority descending").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Envelope lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

/// Timeout/retry/attempt bookkeeping carried on every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConstraints {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub attempt: u32,
}

/// W3C-ish trace propagation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a fresh trace (no parent span).
    pub fn new_root(ids: &dyn crate::ids::IdGenerator) -> Self {
        Self {
            trace_id: ids.next_id(),
            span_id: ids.next_id(),
            parent_span_id: None,
        }
    }

    /// Derive a child span within the same trace.
    pub fn child(&self, ids: &dyn crate::ids::IdGenerator) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: ids.next_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// The small subset of workflow domain state the scheduler and CAS
/// primitive need to coordinate (spec.md §1 out-of-scope note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub name: String,
    pub current_stage: String,
    pub stage_outputs: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// The self-describing unit published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub task_id: String,
    pub workflow_id: String,
    pub agent_type: String,
    pub priority: Priority,
    pub status: EnvelopeStatus,
    pub execution_constraints: ExecutionConstraints,
    pub trace_context: TraceContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_context: Option<WorkflowContext>,
    pub metadata: EnvelopeMetadata,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a new pending envelope for dispatch onto `agent-invoke.<handler>`.
    pub fn new_invocation(
        ids: &dyn crate::ids::IdGenerator,
        task_id: String,
        workflow_id: String,
        agent_type: String,
        priority: Priority,
        constraints: ExecutionConstraints,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: ids.next_id(),
            task_id,
            workflow_id,
            agent_type,
            priority,
            status: EnvelopeStatus::Pending,
            execution_constraints: constraints,
            trace_context: TraceContext::new_root(ids),
            workflow_context: None,
            metadata: EnvelopeMetadata {
                version: "1.0.0".to_string(),
                created_at: Utc::now(),
                created_by: "scheduler".to_string(),
            },
            payload,
        }
    }
}

/// Historic stream wrapper shape, which readers must tolerate per
/// spec.md §6/§9: `{"key": ..., "msg": <envelope>}`.
#[derive(Debug, Clone, Deserialize)]
struct LegacyWrapper {
    #[allow(dead_code)]
    key: serde_json::Value,
    msg: Envelope,
}

/// Decode a stream entry's raw JSON payload into an [`Envelope`],
/// tolerating both the direct form and the legacy `{key, msg}` wrapper.
/// Publishers SHOULD only ever emit the direct form (spec.md §9).
pub fn decode_envelope(raw: &[u8]) -> Result<Envelope, serde_json::Error> {
    if let Ok(direct) = serde_json::from_slice::<Envelope>(raw) {
        return Ok(direct);
    }
    let wrapped: LegacyWrapper = serde_json::from_slice(raw)?;
    Ok(wrapped.msg)
}

/// Serialize an envelope in the direct wire form.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialGenerator;

    fn sample() -> Envelope {
        let ids = SequentialGenerator::new("env");
        Envelope::new_invocation(
            &ids,
            "task-1".to_string(),
            "wf-1".to_string(),
            "echo-agent".to_string(),
            Priority::High,
            ExecutionConstraints {
                timeout_ms: 5_000,
                max_retries: 2,
                attempt: 0,
            },
            serde_json::json!({"hello": "world"}),
        )
    }

    #[test]
    fn round_trip_direct_form() {
        let envelope = sample();
        let bytes = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.task_id, envelope.task_id);
        assert_eq!(decoded.agent_type, envelope.agent_type);
    }

    #[test]
    fn decodes_legacy_key_msg_wrapper() {
        let envelope = sample();
        let wrapped = serde_json::json!({
            "key": envelope.task_id,
            "msg": envelope,
        });
        let bytes = serde_json::to_vec(&wrapped).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.task_id, envelope.task_id);
    }

    #[test]
    fn priority_ordering_is_ascending() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }
}
