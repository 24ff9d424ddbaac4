//! Step *definitions*: the serializable half of the definition/implementation
//! split spec.md section 9 calls out. `mockrtc-core::runtime` holds the
//! dispatch function that turns each variant into a running handler; this
//! type itself carries no behaviour, so it can cross an RPC boundary as-is.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Either shape a `send` step's message can take; preserves the text/binary
/// distinction spec.md section 4.1 insists travels end-to-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageData {
    Text(String),
    Binary(Bytes),
}

/// An opaque handle to an out-of-band `answerResolver` callback. The RPC
/// layer that owns the actual request/response round-trip hands this token
/// to a `peer-proxy` step definition; `mockrtc-core` resolves it by asking
/// whatever implements [`AnswerResolver`](crate::steps::AnswerResolver) to
/// produce the answer when the step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerResolverToken(pub String);

/// The closed set of step variants from spec.md sections 3 and 4.6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum StepDefinition {
    WaitForDuration {
        duration_ms: u64,
    },
    WaitForChannel {
        channel_label: Option<String>,
    },
    WaitForMessage {
        channel_label: Option<String>,
    },
    WaitForTrack,
    WaitForMedia,
    CreateChannel {
        channel_label: String,
    },
    Send {
        channel_label: Option<String>,
        message: MessageData,
    },
    Close,
    /// Terminal: pipes every channel and track into itself.
    Echo,
    /// Terminal: mirrors the remote SDP onto a fresh external connection and
    /// bridges traffic once the resolver supplies an answer.
    PeerProxy {
        answer_resolver: AnswerResolverToken,
    },
    /// Terminal: forwards to whatever external connection gets attached via
    /// the control channel.
    DynamicProxy,
}

impl StepDefinition {
    /// Terminal steps resolve only on `connection-closed` and must be the
    /// last entry in a valid step list (spec.md section 4.6).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepDefinition::Echo | StepDefinition::PeerProxy { .. } | StepDefinition::DynamicProxy
        )
    }
}

/// Validate that only the last step (if any) is terminal. Mirrors the
/// invariant spec.md states without prescribing how list construction
/// should enforce it -- callers building a peer/rule should run this before
/// accepting an operator-supplied step list.
pub fn validate_step_list(steps: &[StepDefinition]) -> Result<(), String> {
    for (idx, step) in steps.iter().enumerate() {
        if step.is_terminal() && idx != steps.len() - 1 {
            return Err(format!(
                "terminal step at index {idx} is not the last step in the list"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_steps_are_flagged() {
        assert!(StepDefinition::Echo.is_terminal());
        assert!(StepDefinition::DynamicProxy.is_terminal());
        assert!(!StepDefinition::Close.is_terminal());
    }

    #[test]
    fn validate_rejects_terminal_step_followed_by_more_steps() {
        let steps = vec![StepDefinition::Echo, StepDefinition::Close];
        assert!(validate_step_list(&steps).is_err());
    }

    #[test]
    fn validate_accepts_terminal_step_as_last() {
        let steps = vec![
            StepDefinition::WaitForDuration { duration_ms: 10 },
            StepDefinition::Echo,
        ];
        assert!(validate_step_list(&steps).is_ok());
    }

    #[test]
    fn step_definition_serializes_with_step_tag() {
        let step = StepDefinition::WaitForDuration { duration_ms: 500 };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains(r#""step":"wait-for-duration""#));
    }
}
