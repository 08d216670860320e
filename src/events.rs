use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::phase::Phase;

/// Urgency of a macro call. Ordering is priority order: `Urgent` sorts
/// before `Suggestion`, which sorts before `Info`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Urgent,
    Suggestion,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroCall {
    pub id: String,
    pub urgency: Urgency,
    pub call_type: String,
    pub message: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    pub game_time: f64,
    #[serde(default)]
    pub window_seconds: Option<u32>,
    pub at: DateTime<Utc>,
}

impl MacroCall {
    pub fn new(
        urgency: Urgency,
        call_type: impl Into<String>,
        message: impl Into<String>,
        game_time: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            urgency,
            call_type: call_type.into(),
            message: message.into(),
            reasoning: None,
            game_time,
            window_seconds: None,
            at: Utc::now(),
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_window(mut self, window_seconds: u32) -> Self {
        self.window_seconds = Some(window_seconds);
        self
    }
}

/// Outbound overlay boundary. Each variant is one named channel; transport
/// behind the sink is the overlay host's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "kebab-case")]
pub enum OverlayMessage {
    GamePhaseChanged {
        phase: Phase,
    },
    DraftRecommendation {
        text: String,
        #[serde(default)]
        error: Option<String>,
    },
    DraftPhaseUpdate {
        actions_completed: usize,
        local_pick_committed: bool,
    },
    DraftFinalized,
    MacroCall(MacroCall),
    PostAnalysis {
        score: f64,
        win: bool,
        text: String,
    },
    StatusUpdate {
        text: String,
    },
    Raw {
        name: String,
        data: Value,
    },
}

pub type OverlaySink = crossbeam_channel::Sender<OverlayMessage>;

#[cfg(test)]
mod tests {
    use super::{MacroCall, OverlayMessage, Urgency};

    #[test]
    fn urgency_orders_urgent_first() {
        let mut urgencies = vec![Urgency::Info, Urgency::Urgent, Urgency::Suggestion];
        urgencies.sort();
        assert_eq!(
            urgencies,
            vec![Urgency::Urgent, Urgency::Suggestion, Urgency::Info]
        );
    }

    #[test]
    fn macro_call_serializes_with_channel_tag() {
        let call =
            MacroCall::new(Urgency::Urgent, "RESET_NOW", "Reset and defend.", 900.0).with_window(30);
        let message = OverlayMessage::MacroCall(call);
        let json = serde_json::to_value(&message).expect("macro call should serialize");
        assert_eq!(json["channel"], "macro-call");
        assert_eq!(json["call_type"], "RESET_NOW");
        assert_eq!(json["urgency"], "urgent");
        assert_eq!(json["window_seconds"], 30);
    }

    #[test]
    fn fresh_macro_calls_get_distinct_ids() {
        let a = MacroCall::new(Urgency::Info, "X", "x", 0.0);
        let b = MacroCall::new(Urgency::Info, "X", "x", 0.0);
        assert_ne!(a.id, b.id);
    }
}
