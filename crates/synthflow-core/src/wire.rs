use crate::model::{ActivityLogEntry, AgentUpdate, TransformationRecord, WorkflowStatusUpdate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// One push-channel frame. `workflow_id` is optional on the wire so that frames
/// without one can be rejected by the reconciler instead of failing to decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub msg: ChannelMsg,
}

impl ChannelEnvelope {
    pub fn new(workflow_id: impl Into<String>, msg: ChannelMsg) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            timestamp: None,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChannelMsg {
    WorkflowStatus(WorkflowStatusUpdate),
    AgentUpdate(AgentUpdate),
    DataTransformation(TransformationRecord),
    AgentLog(ActivityLogEntry),
}

impl ChannelMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMsg::WorkflowStatus(_) => "workflow_status",
            ChannelMsg::AgentUpdate(_) => "agent_update",
            ChannelMsg::DataTransformation(_) => "data_transformation",
            ChannelMsg::AgentLog(_) => "agent_log",
        }
    }
}

/// Client → server intents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { workflow_id: String },
    Unsubscribe { workflow_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, LogLevel, WorkflowStatus};

    #[test]
    fn decodes_every_push_kind() {
        let frames = [
            (
                r#"{"type":"workflow_status","workflow_id":"wf_1","data":{"status":"running","progress":12.5,"stages_completed":["data_processing"]}}"#,
                "workflow_status",
            ),
            (
                r#"{"type":"agent_update","workflow_id":"wf_1","data":{"agent_id":"synthetic_data","status":"completed","progress":100}}"#,
                "agent_update",
            ),
            (
                r#"{"type":"data_transformation","workflow_id":"wf_1","data":{"before":[{"age":41}],"after":[{"age":42}],"changed_fields":["age"],"transformation_type":"perturb"}}"#,
                "data_transformation",
            ),
            (
                r#"{"type":"agent_log","workflow_id":"wf_1","timestamp":"2026-10-17T10:00:00Z","data":{"timestamp":"2026-10-17T10:00:00Z","level":"error","message":"boom"}}"#,
                "agent_log",
            ),
        ];

        for (raw, kind) in frames {
            let envelope: ChannelEnvelope = decode_frame(raw, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(envelope.workflow_id.as_deref(), Some("wf_1"));
            assert_eq!(envelope.msg.kind(), kind);
        }
    }

    #[test]
    fn typed_payloads_survive_encoding() {
        let envelope = ChannelEnvelope::new(
            "wf_1",
            ChannelMsg::AgentUpdate(AgentUpdate {
                status: Some(AgentStatus::Running),
                ..AgentUpdate::new("synthetic_data")
            }),
        );
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(frame.contains(r#""type":"agent_update""#));
        let decoded: ChannelEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, envelope);

        let status = ChannelEnvelope::new(
            "wf_1",
            ChannelMsg::WorkflowStatus(WorkflowStatusUpdate {
                status: Some(WorkflowStatus::Failed),
                error: Some("generator crashed".to_string()),
                ..WorkflowStatusUpdate::default()
            }),
        );
        let frame = encode_frame(&status, DEFAULT_MAX_FRAME_BYTES).expect("encode status");
        let decoded: ChannelEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode status");
        assert_eq!(decoded, status);
    }

    #[test]
    fn missing_workflow_id_still_decodes() {
        let envelope: ChannelEnvelope = decode_frame(
            r#"{"type":"agent_log","data":{"level":"info","message":"hello"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert!(envelope.workflow_id.is_none());
        match envelope.msg {
            ChannelMsg::AgentLog(entry) => assert_eq!(entry.level, LogLevel::Info),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let result: Result<ChannelEnvelope, _> = decode_frame(
            r#"{"type":"chart_render","workflow_id":"wf_1","data":{}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let huge = ChannelEnvelope::new(
            "wf_1",
            ChannelMsg::AgentLog(ActivityLogEntry::new("", LogLevel::Info, "x".repeat(256))),
        );
        assert!(matches!(
            encode_frame(&huge, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let raw = format!("{{\"blob\":\"{}\"}}", "x".repeat(2_000));
        let result: Result<ChannelEnvelope, _> = decode_frame(&raw, 1_024);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn subscribe_frame_matches_wire_shape() {
        let frame = encode_frame(
            &ClientFrame::Subscribe {
                workflow_id: "wf_9".to_string(),
            },
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value, serde_json::json!({"type": "subscribe", "workflow_id": "wf_9"}));
    }
}
