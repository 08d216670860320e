use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub const LIVE_CLIENT_BASE: &str = "https://127.0.0.1:2999/liveclientdata";

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);
const EVENT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "activePlayer")]
    pub active_player: ActivePlayer,
    #[serde(rename = "allPlayers")]
    pub all_players: Vec<PlayerSlot>,
    #[serde(rename = "gameData")]
    pub game_data: GameData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivePlayer {
    #[serde(rename = "summonerName")]
    pub summoner_name: String,
    #[serde(default)]
    pub level: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerSlot {
    #[serde(rename = "summonerName")]
    pub summoner_name: String,
    #[serde(rename = "championName", default)]
    pub champion_name: String,
    pub team: String,
    #[serde(rename = "isDead", default)]
    pub is_dead: bool,
    #[serde(rename = "respawnTimer", default)]
    pub respawn_timer: f64,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub scores: Scores,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub kills: u32,
    #[serde(default)]
    pub deaths: u32,
    #[serde(default)]
    pub assists: u32,
    #[serde(rename = "creepScore", default)]
    pub creep_score: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameData {
    #[serde(rename = "gameTime")]
    pub game_time: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameEvent {
    #[serde(rename = "EventID")]
    pub event_id: u64,
    #[serde(rename = "EventName")]
    pub event_name: String,
    #[serde(rename = "EventTime", default)]
    pub event_time: f64,
    #[serde(rename = "KillerName", default)]
    pub killer_name: String,
    #[serde(rename = "VictimName", default)]
    pub victim_name: String,
    #[serde(rename = "TurretKilled", default)]
    pub turret_killed: String,
    #[serde(rename = "InhibKilled", default)]
    pub inhib_killed: String,
    #[serde(rename = "InhibRespawned", default)]
    pub inhib_respawned: String,
}

#[derive(Debug, Deserialize)]
struct EventFeed {
    #[serde(rename = "Events", default)]
    events: Vec<GameEvent>,
}

#[derive(Debug, Clone)]
pub enum TelemetryUpdate {
    Available,
    Unavailable,
    Snapshot(Box<Snapshot>),
    NewEvents(Vec<GameEvent>),
}

/// Read-only poller against the in-match data source on the fixed loopback
/// port. Full snapshots every 10 s, the event feed every 5 s; transient
/// misses are absorbed since the next tick is soon.
pub fn spawn_live_client_worker(tx: mpsc::Sender<TelemetryUpdate>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_live_client_loop(tx).await;
    })
}

async fn run_live_client_loop(tx: mpsc::Sender<TelemetryUpdate>) {
    let client = match loopback_client() {
        Ok(client) => client,
        Err(err) => {
            warn!(?err, "failed building live client http client");
            return;
        }
    };

    let mut snapshot_tick = interval(SNAPSHOT_INTERVAL);
    let mut event_tick = interval(EVENT_INTERVAL);
    snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    event_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut available = false;
    let mut max_event_id: Option<u64> = None;

    loop {
        tokio::select! {
            _ = snapshot_tick.tick() => {
                match fetch_snapshot(&client).await {
                    Ok(snapshot) => {
                        mark_available(&mut available, &mut max_event_id, &tx, true);
                        // Snapshots are idempotent; when the consumer is behind,
                        // dropping one is harmless.
                        if tx.try_send(TelemetryUpdate::Snapshot(Box::new(snapshot))).is_err() {
                            debug!("telemetry consumer behind, dropped snapshot");
                        }
                    }
                    Err(err) => {
                        debug!(?err, "snapshot poll missed");
                        mark_available(&mut available, &mut max_event_id, &tx, false);
                    }
                }
            }
            _ = event_tick.tick() => {
                match fetch_events(&client).await {
                    Ok(feed) => {
                        mark_available(&mut available, &mut max_event_id, &tx, true);
                        let fresh = select_new_events(feed, &mut max_event_id);
                        if !fresh.is_empty()
                            && tx.try_send(TelemetryUpdate::NewEvents(fresh)).is_err()
                        {
                            warn!("telemetry consumer behind, dropped event batch");
                        }
                    }
                    Err(err) => {
                        debug!(?err, "event poll missed");
                        mark_available(&mut available, &mut max_event_id, &tx, false);
                    }
                }
            }
        }
    }
}

fn mark_available(
    available: &mut bool,
    max_event_id: &mut Option<u64>,
    tx: &mpsc::Sender<TelemetryUpdate>,
    reachable: bool,
) {
    if *available == reachable {
        return;
    }
    *available = reachable;
    if reachable {
        info!("live client data available");
        let _ = tx.try_send(TelemetryUpdate::Available);
    } else {
        info!("live client data unavailable");
        // Event ids restart with the next match.
        *max_event_id = None;
        let _ = tx.try_send(TelemetryUpdate::Unavailable);
    }
}

/// Keeps only events beyond the high-water mark, in strictly increasing
/// event-id order.
fn select_new_events(mut events: Vec<GameEvent>, max_event_id: &mut Option<u64>) -> Vec<GameEvent> {
    events.sort_by_key(|event| event.event_id);
    let floor = *max_event_id;
    let fresh: Vec<GameEvent> = events
        .into_iter()
        .filter(|event| floor.map(|seen| event.event_id > seen).unwrap_or(true))
        .collect();
    if let Some(last) = fresh.last() {
        *max_event_id = Some(last.event_id);
    }
    fresh
}

fn loopback_client() -> Result<reqwest::Client> {
    // Self-signed loopback endpoint; never reuse this client for the cloud.
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(3))
        .build()
        .context("failed building loopback telemetry client")
}

async fn fetch_snapshot(client: &reqwest::Client) -> Result<Snapshot> {
    let snapshot = client
        .get(format!("{LIVE_CLIENT_BASE}/allgamedata"))
        .send()
        .await
        .context("allgamedata request failed")?
        .error_for_status()
        .context("allgamedata returned error status")?
        .json::<Snapshot>()
        .await
        .context("allgamedata payload did not parse")?;
    Ok(snapshot)
}

async fn fetch_events(client: &reqwest::Client) -> Result<Vec<GameEvent>> {
    let feed = client
        .get(format!("{LIVE_CLIENT_BASE}/eventdata"))
        .send()
        .await
        .context("eventdata request failed")?
        .error_for_status()
        .context("eventdata returned error status")?
        .json::<EventFeed>()
        .await
        .context("eventdata payload did not parse")?;
    Ok(feed.events)
}

#[cfg(test)]
mod tests {
    use super::{select_new_events, GameEvent, Snapshot};

    fn event(id: u64, name: &str) -> GameEvent {
        GameEvent {
            event_id: id,
            event_name: name.to_owned(),
            event_time: id as f64,
            killer_name: String::new(),
            victim_name: String::new(),
            turret_killed: String::new(),
            inhib_killed: String::new(),
            inhib_respawned: String::new(),
        }
    }

    #[test]
    fn emits_only_events_beyond_high_water_mark() {
        let mut max = None;
        let first = select_new_events(vec![event(3, "A"), event(1, "B"), event(2, "C")], &mut max);
        assert_eq!(
            first.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(max, Some(3));

        let second = select_new_events(vec![event(2, "B"), event(4, "D"), event(5, "E")], &mut max);
        assert_eq!(
            second.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(max, Some(5));

        let third = select_new_events(vec![event(5, "E")], &mut max);
        assert!(third.is_empty());
        assert_eq!(max, Some(5));
    }

    #[test]
    fn snapshot_parses_live_client_payload() {
        let raw = r#"{
            "activePlayer": {"summonerName": "Blue Mid", "level": 9},
            "allPlayers": [
                {
                    "summonerName": "Blue Mid",
                    "championName": "Ahri",
                    "team": "ORDER",
                    "isDead": false,
                    "respawnTimer": 0.0,
                    "position": "MIDDLE",
                    "level": 9,
                    "scores": {"kills": 3, "deaths": 1, "assists": 2, "creepScore": 112}
                },
                {
                    "summonerName": "Red Jungle",
                    "championName": "Lee Sin",
                    "team": "CHAOS",
                    "isDead": true,
                    "respawnTimer": 22.5,
                    "position": "JUNGLE",
                    "level": 8,
                    "scores": {"kills": 1, "deaths": 4, "assists": 1, "creepScore": 88}
                }
            ],
            "gameData": {"gameTime": 913.2}
        }"#;
        let snapshot: Snapshot = serde_json::from_str(raw).expect("snapshot should parse");
        assert_eq!(snapshot.active_player.summoner_name, "Blue Mid");
        assert_eq!(snapshot.all_players.len(), 2);
        assert_eq!(snapshot.all_players[1].team, "CHAOS");
        assert!(snapshot.all_players[1].is_dead);
        assert_eq!(snapshot.all_players[0].scores.creep_score, 112);
        assert!((snapshot.game_data.game_time - 913.2).abs() < f64::EPSILON);
    }

    #[test]
    fn event_feed_defaults_optional_fields() {
        let raw = r#"{"EventID": 7, "EventName": "DragonKill", "EventTime": 611.0, "KillerName": "Blue Jungle"}"#;
        let event: GameEvent = serde_json::from_str(raw).expect("event should parse");
        assert_eq!(event.event_id, 7);
        assert_eq!(event.event_name, "DragonKill");
        assert!(event.turret_killed.is_empty());
    }
}
