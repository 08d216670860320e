use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    advisors::Advisor,
    events::{MacroCall, OverlayMessage, OverlaySink, Urgency},
    llm::ToolSchema,
};

/// Live-game advisor. It has no pipeline of its own: the trigger engine
/// decides when it is worth waking, and the orchestrator hands it the
/// compact game context. Its macro calls flow straight to the overlay bus.
pub struct LiveAdvisor {
    overlay: OverlaySink,
}

impl LiveAdvisor {
    pub fn new(overlay: OverlaySink) -> Self {
        Self { overlay }
    }
}

#[async_trait]
impl Advisor for LiveAdvisor {
    fn name(&self) -> &'static str {
        "live"
    }

    fn system_prompt(&self) -> String {
        "You are a live macro coach. You receive a compact game state with \
         the triggers that woke you. Decide whether a shotcall is warranted \
         and, if so, issue exactly one macro_call with a short imperative \
         message. Prefer silence over noise."
            .to_owned()
    }

    fn tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "macro_call".to_owned(),
            description: "Dispatch one strategic call to the in-game overlay".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "urgency": {"type": "string", "enum": ["urgent", "suggestion", "info"]},
                    "call_type": {"type": "string"},
                    "message": {"type": "string"},
                    "reasoning": {"type": "string"},
                    "game_time": {"type": "number"},
                    "window_seconds": {"type": "integer"}
                },
                "required": ["call_type", "message"]
            }),
        }]
    }

    async fn on_activate(&self) -> Result<()> {
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        Ok(())
    }

    async fn handle_tool(&self, name: &str, input: Value) -> Result<Value> {
        match name {
            "macro_call" => {
                let call_type = input
                    .get("call_type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("macro_call requires a call_type"))?;
                let message = input
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("macro_call requires a message"))?;
                let urgency = match input.get("urgency").and_then(Value::as_str) {
                    Some("urgent") => Urgency::Urgent,
                    Some("info") => Urgency::Info,
                    _ => Urgency::Suggestion,
                };
                let game_time = input
                    .get("game_time")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let mut call = MacroCall::new(urgency, call_type, message, game_time);
                if let Some(reasoning) = input.get("reasoning").and_then(Value::as_str) {
                    call = call.with_reasoning(reasoning);
                }
                if let Some(window) = input.get("window_seconds").and_then(Value::as_u64) {
                    call = call.with_window(window as u32);
                }
                let id = call.id.clone();
                let _ = self.overlay.send(OverlayMessage::MacroCall(call));
                Ok(json!({"dispatched": true, "id": id}))
            }
            other => Err(anyhow!("unknown live tool: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::LiveAdvisor;
    use crate::{
        advisors::Advisor,
        events::{OverlayMessage, Urgency},
    };

    #[tokio::test]
    async fn macro_call_tool_dispatches_to_the_overlay_bus() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let advisor = LiveAdvisor::new(tx);

        let result = advisor
            .handle_tool(
                "macro_call",
                json!({
                    "urgency": "urgent",
                    "call_type": "BARON_WINDOW",
                    "message": "Start baron now.",
                    "reasoning": "Enemy jungler dead for 22s.",
                    "game_time": 1340.0,
                    "window_seconds": 22
                }),
            )
            .await
            .expect("tool should dispatch");
        assert_eq!(result["dispatched"], true);

        let message = rx.try_recv().expect("overlay should receive a macro call");
        match message {
            OverlayMessage::MacroCall(call) => {
                assert_eq!(call.call_type, "BARON_WINDOW");
                assert_eq!(call.urgency, Urgency::Urgent);
                assert_eq!(call.window_seconds, Some(22));
                assert_eq!(result["id"], call.id.as_str());
            }
            other => panic!("expected macro call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_fields_and_unknown_tools_error() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let advisor = LiveAdvisor::new(tx);
        assert!(advisor
            .handle_tool("macro_call", json!({"message": "x"}))
            .await
            .is_err());
        assert!(advisor.handle_tool("nope", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn urgency_defaults_to_suggestion() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let advisor = LiveAdvisor::new(tx);
        advisor
            .handle_tool(
                "macro_call",
                json!({"call_type": "GOLD_SWING", "message": "Play for picks."}),
            )
            .await
            .expect("tool should dispatch");
        match rx.try_recv().expect("overlay should receive a macro call") {
            OverlayMessage::MacroCall(call) => assert_eq!(call.urgency, Urgency::Suggestion),
            other => panic!("expected macro call, got {other:?}"),
        }
    }
}
