use std::{sync::Mutex, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, warn};

use crate::{
    advisors::{Advisor, AdvisorKind, AdvisorRequest},
    client::SessionHandle,
    events::{OverlayMessage, OverlaySink},
    llm::ToolSchema,
};

const CHAMP_SELECT_SESSION: &str = "/lol-champ-select/v1/session";
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Draft-time advisor. Its pipeline polls the champ-select session every 3 s,
/// hashes the action list, asks for a recommendation only on change, and
/// closes itself once the local pick is committed.
pub struct DraftAdvisor {
    session: SessionHandle,
    overlay: OverlaySink,
    requests: mpsc::UnboundedSender<AdvisorRequest>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DraftAdvisor {
    pub fn new(
        session: SessionHandle,
        overlay: OverlaySink,
        requests: mpsc::UnboundedSender<AdvisorRequest>,
    ) -> Self {
        Self {
            session,
            overlay,
            requests,
            task: Mutex::new(None),
        }
    }

    fn abort_pipeline(&self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Advisor for DraftAdvisor {
    fn name(&self) -> &'static str {
        "draft"
    }

    fn system_prompt(&self) -> String {
        "You are a drafting coach for a ranked League match. Read the draft \
         state, weigh team composition and counters, and call the recommend \
         tool with one concrete pick or ban suggestion."
            .to_owned()
    }

    fn tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "recommend".to_owned(),
            description: "Surface a pick or ban recommendation to the player".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "champion": {"type": "string"}
                },
                "required": ["message"]
            }),
        }]
    }

    async fn on_activate(&self) -> Result<()> {
        self.abort_pipeline();
        let session = self.session.clone();
        let overlay = self.overlay.clone();
        let requests = self.requests.clone();
        let task = tokio::spawn(async move {
            run_draft_loop(session, overlay, requests).await;
        });
        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(task);
        }
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.abort_pipeline();
        Ok(())
    }

    async fn handle_tool(&self, name: &str, input: Value) -> Result<Value> {
        match name {
            "recommend" => {
                let message = input
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("recommend requires a message"))?;
                let _ = self.overlay.send(OverlayMessage::DraftRecommendation {
                    text: message.to_owned(),
                    error: None,
                });
                Ok(json!({"delivered": true}))
            }
            other => Err(anyhow!("unknown draft tool: {other}")),
        }
    }
}

async fn run_draft_loop(
    session: SessionHandle,
    overlay: OverlaySink,
    requests: mpsc::UnboundedSender<AdvisorRequest>,
) {
    let mut last_digest: Option<String> = None;
    loop {
        match session.get(CHAMP_SELECT_SESSION).await {
            Ok(payload) => {
                let observation = observe_session(&payload);
                let _ = overlay.send(OverlayMessage::DraftPhaseUpdate {
                    actions_completed: observation.actions_completed,
                    local_pick_committed: observation.local_pick_committed,
                });
                if draft_changed(&last_digest, &observation.digest) {
                    last_digest = Some(observation.digest.clone());
                    if requests
                        .send(AdvisorRequest {
                            kind: AdvisorKind::Draft,
                            context: observation.context.clone(),
                            phase_tag: "champ_select".to_owned(),
                        })
                        .is_err()
                    {
                        warn!("advisor request channel closed, stopping draft loop");
                        return;
                    }
                }
                if observation.local_pick_committed {
                    let _ = overlay.send(OverlayMessage::DraftFinalized);
                    debug!("local pick committed, draft pipeline closing");
                    return;
                }
            }
            Err(err) => {
                debug!(?err, "champ select poll missed");
            }
        }
        sleep(POLL_INTERVAL).await;
    }
}

fn draft_changed(last_digest: &Option<String>, digest: &str) -> bool {
    last_digest.as_deref() != Some(digest)
}

#[derive(Debug)]
struct DraftObservation {
    digest: String,
    actions_completed: usize,
    local_pick_committed: bool,
    context: String,
}

fn observe_session(session: &Value) -> DraftObservation {
    let actions = session.get("actions").cloned().unwrap_or(Value::Null);
    let digest = hash_actions(&actions);
    let local_cell = session
        .get("localPlayerCellId")
        .and_then(Value::as_i64)
        .unwrap_or(-1);

    let mut actions_completed = 0usize;
    let mut local_pick_committed = false;
    if let Some(rounds) = actions.as_array() {
        for round in rounds.iter().filter_map(Value::as_array) {
            for action in round {
                let completed = action
                    .get("completed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if completed {
                    actions_completed += 1;
                }
                let is_local_pick = action.get("type").and_then(Value::as_str) == Some("pick")
                    && action.get("actorCellId").and_then(Value::as_i64) == Some(local_cell);
                if is_local_pick && completed {
                    local_pick_committed = true;
                }
            }
        }
    }

    let context = json!({
        "draft_phase": {
            "actions": actions,
            "my_team": session.get("myTeam").cloned().unwrap_or(Value::Null),
            "their_team": session.get("theirTeam").cloned().unwrap_or(Value::Null),
            "local_cell": local_cell,
        }
    })
    .to_string();

    DraftObservation {
        digest,
        actions_completed,
        local_pick_committed,
        context,
    }
}

fn hash_actions(actions: &Value) -> String {
    let serialized = actions.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{draft_changed, observe_session};

    fn session(local_pick_completed: bool, champion_id: u32) -> serde_json::Value {
        json!({
            "localPlayerCellId": 2,
            "myTeam": [{"cellId": 2, "championId": champion_id}],
            "theirTeam": [{"cellId": 7, "championId": 0}],
            "actions": [
                [
                    {"type": "ban", "actorCellId": 0, "championId": 51, "completed": true},
                    {"type": "ban", "actorCellId": 7, "championId": 23, "completed": true}
                ],
                [
                    {"type": "pick", "actorCellId": 0, "championId": 12, "completed": true},
                    {"type": "pick", "actorCellId": 2, "championId": champion_id,
                     "completed": local_pick_completed}
                ]
            ]
        })
    }

    #[test]
    fn invokes_once_per_action_list_change() {
        let first = observe_session(&session(false, 0));
        let mut last = None;
        assert!(draft_changed(&last, &first.digest));
        last = Some(first.digest.clone());

        // Same action list again: no new invocation.
        let repeat = observe_session(&session(false, 0));
        assert!(!draft_changed(&last, &repeat.digest));

        // The list changes once more.
        let changed = observe_session(&session(false, 103));
        assert!(draft_changed(&last, &changed.digest));
    }

    #[test]
    fn context_carries_the_draft_phase_payload() {
        let observation = observe_session(&session(false, 0));
        assert!(observation.context.contains("draft_phase"));
        assert!(observation.context.contains("my_team"));
        assert_eq!(observation.actions_completed, 3);
        assert!(!observation.local_pick_committed);
    }

    #[test]
    fn committed_local_pick_closes_the_draft() {
        let observation = observe_session(&session(true, 103));
        assert!(observation.local_pick_committed);
        assert_eq!(observation.actions_completed, 4);
    }

    #[test]
    fn hash_is_stable_for_identical_sessions() {
        let a = observe_session(&session(false, 0));
        let b = observe_session(&session(false, 0));
        assert_eq!(a.digest, b.digest);
    }
}
