use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    advisors::{Advisor, AdvisorKind, AdvisorRequest},
    client::SessionHandle,
    events::{OverlayMessage, OverlaySink},
    llm::ToolSchema,
    store::SettingsStore,
};

const EOG_STATS_BLOCK: &str = "/lol-end-of-game/v1/eog-stats-block";
const RECENT_RECORDS: usize = 5;

/// Post-game advisor. On phase entry it fetches the end-of-game blob once,
/// derives a deterministic performance score, persists the match record,
/// then asks for a single review.
pub struct PostAdvisor {
    session: SessionHandle,
    overlay: OverlaySink,
    requests: mpsc::UnboundedSender<AdvisorRequest>,
    store: SettingsStore,
    last_result: Arc<Mutex<Option<(f64, bool)>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PostAdvisor {
    pub fn new(
        session: SessionHandle,
        overlay: OverlaySink,
        requests: mpsc::UnboundedSender<AdvisorRequest>,
        store: SettingsStore,
    ) -> Self {
        Self {
            session,
            overlay,
            requests,
            store,
            last_result: Arc::new(Mutex::new(None)),
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
impl Advisor for PostAdvisor {
    fn name(&self) -> &'static str {
        "post"
    }

    fn system_prompt(&self) -> String {
        "You are a post-game reviewer. You receive the final scoreboard, a \
         locally computed performance score and the player's recent score \
         history. Call publish_review once with two or three sentences of \
         constructive, specific feedback."
            .to_owned()
    }

    fn tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "publish_review".to_owned(),
            description: "Publish the post-game review to the overlay".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        }]
    }

    async fn on_activate(&self) -> Result<()> {
        self.abort_pipeline();
        let session = self.session.clone();
        let requests = self.requests.clone();
        let store = self.store.clone();
        let last_result = self.last_result.clone();
        let task = tokio::spawn(async move {
            run_post_pipeline(session, requests, store, last_result).await;
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
            "publish_review" => {
                let text = input
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("publish_review requires text"))?;
                let (score, win) = self
                    .last_result
                    .lock()
                    .ok()
                    .and_then(|guard| *guard)
                    .unwrap_or((0.0, false));
                let _ = self.overlay.send(OverlayMessage::PostAnalysis {
                    score,
                    win,
                    text: text.to_owned(),
                });
                Ok(json!({"published": true}))
            }
            other => Err(anyhow!("unknown post tool: {other}")),
        }
    }
}

async fn run_post_pipeline(
    session: SessionHandle,
    requests: mpsc::UnboundedSender<AdvisorRequest>,
    store: SettingsStore,
    last_result: Arc<Mutex<Option<(f64, bool)>>>,
) {
    let payload = match session.get(EOG_STATS_BLOCK).await {
        Ok(payload) => payload,
        Err(err) => {
            warn!(?err, "end-of-game stats fetch failed");
            return;
        }
    };
    let Some(summary) = score_end_of_game(&payload) else {
        warn!("end-of-game blob did not contain a scoreable local player");
        return;
    };
    if let Ok(mut guard) = last_result.lock() {
        *guard = Some((summary.score, summary.win));
    }
    if let Err(err) = store.insert_match_record(&summary.puuid, summary.score, summary.win) {
        warn!(?err, "failed persisting match record");
    }
    let recent: Vec<f64> = store
        .recent_match_records(RECENT_RECORDS)
        .map(|records| records.iter().map(|record| record.score).collect())
        .unwrap_or_default();
    debug!(score = summary.score, win = summary.win, "post-game score computed");
    let context = json!({
        "post_game": {
            "score": summary.score,
            "win": summary.win,
            "kills": summary.kills,
            "deaths": summary.deaths,
            "assists": summary.assists,
            "damage_share": summary.damage_share,
            "recent_scores": recent,
        }
    })
    .to_string();
    let _ = requests.send(AdvisorRequest {
        kind: AdvisorKind::Post,
        context,
        phase_tag: "post_game".to_owned(),
    });
}

#[derive(Debug, Clone)]
pub struct EndOfGameSummary {
    pub puuid: String,
    pub score: f64,
    pub win: bool,
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
    pub damage_share: f64,
}

/// Deterministic performance score from the end-of-game blob: KDA weighted
/// against the local player's share of team damage, clamped to 0..10.
pub fn score_end_of_game(blob: &Value) -> Option<EndOfGameSummary> {
    let teams = blob.get("teams")?.as_array()?;
    let player_team = teams
        .iter()
        .find(|team| team.get("isPlayerTeam").and_then(Value::as_bool) == Some(true))?;
    let win = player_team
        .get("isWinningTeam")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let local = blob.get("localPlayer")?;
    let stats = local.get("stats")?;
    let kills = stats
        .get("CHAMPIONS_KILLED")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let deaths = stats.get("NUM_DEATHS").and_then(Value::as_u64).unwrap_or(0) as u32;
    let assists = stats.get("ASSISTS").and_then(Value::as_u64).unwrap_or(0) as u32;
    let local_damage = stats
        .get("TOTAL_DAMAGE_DEALT_TO_CHAMPIONS")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let team_damage: f64 = player_team
        .get("players")
        .and_then(Value::as_array)
        .map(|players| {
            players
                .iter()
                .filter_map(|player| {
                    player
                        .get("stats")?
                        .get("TOTAL_DAMAGE_DEALT_TO_CHAMPIONS")?
                        .as_f64()
                })
                .sum()
        })
        .unwrap_or(0.0);
    let damage_share = if team_damage > 0.0 {
        local_damage / team_damage
    } else {
        0.0
    };
    let kda = (kills + assists) as f64 / deaths.max(1) as f64;
    let score = (kda * 1.5 + damage_share * 8.0).clamp(0.0, 10.0);
    let puuid = local
        .get("puuid")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    Some(EndOfGameSummary {
        puuid,
        score,
        win,
        kills,
        deaths,
        assists,
        damage_share,
    })
}
