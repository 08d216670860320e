use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{json, Value};
use tracing::debug;

use crate::{
    events::{MacroCall, Urgency},
    livegame::{GameEvent, PlayerSlot, Snapshot},
};

const GOLD_PER_CS: i64 = 20;
const GOLD_PER_KILL: i64 = 300;
const GOLD_PER_ASSIST: i64 = 150;
const GOLD_SWING_THRESHOLD: i64 = 1000;
const THROW_GUARD_LEAD: i64 = 3000;
const DEATH_WINDOW_SECS: f64 = 30.0;
const BARON_FIRST_SPAWN: f64 = 1200.0;
const BARON_RESPAWN: f64 = 360.0;
const MID_GAME_START: f64 = 840.0;
const LATE_GAME_START: f64 = 1500.0;
const ADVICE_COOLDOWN_MS: u64 = 60_000;
const GOLD_HISTORY_CAP: usize = 256;
const POWER_SPIKE_LEVELS: &[u32] = &[6, 11, 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Team {
    Order,
    Chaos,
}

impl Team {
    pub fn opponent(self) -> Team {
        match self {
            Team::Order => Team::Chaos,
            Team::Chaos => Team::Order,
        }
    }

    fn from_scoreboard(tag: &str) -> Option<Team> {
        match tag {
            "ORDER" => Some(Team::Order),
            "CHAOS" => Some(Team::Chaos),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Top,
    Mid,
    Bot,
}

impl Lane {
    fn as_str(self) -> &'static str {
        match self {
            Lane::Top => "top",
            Lane::Mid => "mid",
            Lane::Bot => "bot",
        }
    }

    fn assigned_position(self) -> &'static str {
        match self {
            Lane::Top => "TOP",
            Lane::Mid => "MIDDLE",
            Lane::Bot => "BOTTOM",
        }
    }
}

/// Parses a structure name like `Turret_T1_R_03_A` or `Barracks_T2_L1` into
/// its owning team and lane. `T1` is ORDER; `_L`/`_C`/`_R` are top/mid/bot.
pub fn parse_structure_name(name: &str) -> Option<(Team, Lane)> {
    let (team, rest) = if let Some(idx) = name.find("_T1") {
        (Team::Order, &name[idx + 3..])
    } else if let Some(idx) = name.find("_T2") {
        (Team::Chaos, &name[idx + 3..])
    } else {
        return None;
    };
    let lane = if rest.contains("_L") || rest.starts_with('L') {
        Lane::Top
    } else if rest.contains("_C") || rest.starts_with('C') {
        Lane::Mid
    } else if rest.contains("_R") || rest.starts_with('R') {
        Lane::Bot
    } else {
        return None;
    };
    Some((team, lane))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    ResetNow,
    BaronWindow,
    ContestObjective,
    BaronCall,
    CatchWave,
    WinCondition,
    BaronBait,
    Ace,
    GoldSwing,
    DeathTimers,
    PowerSpike,
    ObjectiveTaken,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::ResetNow => "RESET_NOW",
            TriggerKind::BaronWindow => "BARON_WINDOW",
            TriggerKind::ContestObjective => "CONTEST_OBJECTIVE",
            TriggerKind::BaronCall => "BARON_CALL",
            TriggerKind::CatchWave => "CATCH_WAVE",
            TriggerKind::WinCondition => "WIN_CONDITION",
            TriggerKind::BaronBait => "BARON_BAIT",
            TriggerKind::Ace => "ACE",
            TriggerKind::GoldSwing => "GOLD_SWING",
            TriggerKind::DeathTimers => "DEATH_TIMERS",
            TriggerKind::PowerSpike => "POWER_SPIKE",
            TriggerKind::ObjectiveTaken => "OBJECTIVE_TAKEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalAdvice {
    pub message: String,
    pub window_seconds: u32,
}

/// One classified state change. A set `local` payload marks a deterministic
/// result that bypasses the LLM entirely.
#[derive(Debug, Clone)]
pub struct TriggerResult {
    pub kind: TriggerKind,
    pub detail: String,
    pub urgency: Urgency,
    pub local: Option<LocalAdvice>,
    pub llm_worthy: bool,
}

impl TriggerResult {
    fn local(
        kind: TriggerKind,
        detail: impl Into<String>,
        urgency: Urgency,
        message: impl Into<String>,
        window_seconds: u32,
    ) -> Self {
        Self {
            kind,
            detail: detail.into(),
            urgency,
            local: Some(LocalAdvice {
                message: message.into(),
                window_seconds,
            }),
            llm_worthy: false,
        }
    }

    fn llm(kind: TriggerKind, detail: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            kind,
            detail: detail.into(),
            urgency,
            local: None,
            llm_worthy: true,
        }
    }
}

/// What one evaluation round produced, after the dispatch policy.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    Local(MacroCall),
    LlmRequest {
        context: String,
        phase_tag: &'static str,
    },
}

fn phase_tag_for(game_time: f64) -> &'static str {
    if game_time <= MID_GAME_START {
        "early"
    } else if game_time <= LATE_GAME_START {
        "mid"
    } else {
        "late"
    }
}

#[derive(Debug, Default)]
struct TriggerState {
    ally_team: Option<Team>,
    name_team: HashMap<String, Team>,
    gold_history: VecDeque<(f64, i64)>,
    ally_drakes: u32,
    enemy_drakes: u32,
    last_baron_kill: Option<f64>,
    ally_death_times: VecDeque<f64>,
    turrets_down: HashMap<(Team, Lane), u32>,
    ally_inhibs_down: HashSet<Lane>,
    enemy_inhibs_down: HashSet<Lane>,
    player_levels: HashMap<String, u32>,
    seen_events: HashSet<String>,
    last_reported_lead: i64,
    last_advice_ms: Option<u64>,
    last_game_time: f64,
    active_summary: Option<Value>,
}

/// Stateful detector over the live-telemetry stream. Single-writer: only
/// snapshot/event callbacks mutate it, serialized by the caller.
#[derive(Debug, Default)]
pub struct TriggerEngine {
    state: TriggerState,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all per-match state; call on match entry.
    pub fn reset(&mut self) {
        self.state = TriggerState::default();
    }

    pub fn handle_snapshot(&mut self, snapshot: &Snapshot, now_ms: u64) -> Option<EngineOutput> {
        self.ingest_snapshot(snapshot);
        let triggers = self.evaluate_snapshot(snapshot);
        self.dispatch(triggers, snapshot.game_data.game_time, now_ms)
    }

    pub fn handle_events(&mut self, events: &[GameEvent], now_ms: u64) -> Option<EngineOutput> {
        let triggers = self.apply_events(events);
        let game_time = self.state.last_game_time;
        self.dispatch(triggers, game_time, now_ms)
    }

    fn ingest_snapshot(&mut self, snapshot: &Snapshot) {
        let state = &mut self.state;
        state.last_game_time = snapshot.game_data.game_time;

        for player in &snapshot.all_players {
            if let Some(team) = Team::from_scoreboard(&player.team) {
                state.name_team.insert(player.summoner_name.clone(), team);
            }
        }
        if state.ally_team.is_none() {
            state.ally_team = snapshot
                .all_players
                .iter()
                .find(|player| player.summoner_name == snapshot.active_player.summoner_name)
                .and_then(|player| Team::from_scoreboard(&player.team));
            if let Some(team) = state.ally_team {
                debug!(?team, "locked local team from first snapshot");
            }
        }

        if let Some(ally) = state.ally_team {
            let lead = gold_lead(&snapshot.all_players, ally);
            state.gold_history.push_back((snapshot.game_data.game_time, lead));
            while state.gold_history.len() > GOLD_HISTORY_CAP {
                state.gold_history.pop_front();
            }
        }

        let horizon = snapshot.game_data.game_time - DEATH_WINDOW_SECS;
        while let Some(oldest) = state.ally_death_times.front() {
            if *oldest < horizon {
                state.ally_death_times.pop_front();
            } else {
                break;
            }
        }

        let active_scores = snapshot
            .all_players
            .iter()
            .find(|player| player.summoner_name == snapshot.active_player.summoner_name)
            .map(|player| {
                json!({
                    "kills": player.scores.kills,
                    "deaths": player.scores.deaths,
                    "assists": player.scores.assists,
                    "creep_score": player.scores.creep_score,
                })
            })
            .unwrap_or(Value::Null);
        state.active_summary = Some(json!({
            "name": snapshot.active_player.summoner_name,
            "level": snapshot.active_player.level,
            "scores": active_scores,
        }));
    }

    fn evaluate_snapshot(&mut self, snapshot: &Snapshot) -> Vec<TriggerResult> {
        let Some(ally) = self.state.ally_team else {
            return Vec::new();
        };
        let game_time = snapshot.game_data.game_time;
        let enemy = ally.opponent();
        let enemies: Vec<&PlayerSlot> = snapshot
            .all_players
            .iter()
            .filter(|player| Team::from_scoreboard(&player.team) == Some(enemy))
            .collect();
        let allies: Vec<&PlayerSlot> = snapshot
            .all_players
            .iter()
            .filter(|player| Team::from_scoreboard(&player.team) == Some(ally))
            .collect();
        let dead_enemies: Vec<&&PlayerSlot> =
            enemies.iter().filter(|player| player.is_dead).collect();
        let enemy_jungler = enemies.iter().find(|player| player.position == "JUNGLE");
        let lead = gold_lead(&snapshot.all_players, ally);
        let baron_up = self.baron_up(game_time);
        let rush_baron = baron_up && self.state.ally_drakes >= 3;

        let mut out = Vec::new();

        // 1. Throw-guard: far ahead and bleeding deaths means stop forcing.
        if lead > THROW_GUARD_LEAD && self.state.ally_death_times.len() >= 2 {
            out.push(TriggerResult::local(
                TriggerKind::ResetNow,
                format!("lead {lead} with {} recent deaths", self.state.ally_death_times.len()),
                Urgency::Urgent,
                "Stop fighting. Reset, regroup and hold your lead.",
                20,
            ));
        }

        // 2. Baron window: enemy jungler down long enough to start it.
        if baron_up {
            if let Some(jungler) = enemy_jungler {
                if jungler.is_dead && jungler.respawn_timer > 15.0 {
                    out.push(TriggerResult::llm(
                        TriggerKind::BaronWindow,
                        format!(
                            "enemy jungler {} dead for {:.0}s more",
                            jungler.champion_name, jungler.respawn_timer
                        ),
                        Urgency::Urgent,
                    ));
                }
            }
        }

        // 3. Contest soul point.
        if baron_up && self.state.enemy_drakes >= 3 {
            out.push(TriggerResult::local(
                TriggerKind::ContestObjective,
                format!("enemy at {} drakes", self.state.enemy_drakes),
                Urgency::Urgent,
                "Enemy is on soul point. Group and contest the next drake.",
                45,
            ));
        }

        // 4. Rush baron off our own soul point.
        if rush_baron {
            out.push(TriggerResult::local(
                TriggerKind::BaronCall,
                format!("ally at {} drakes with baron up", self.state.ally_drakes),
                Urgency::Urgent,
                "You have drake priority. Force baron now.",
                45,
            ));
        }

        // 5. Side-lane catch.
        if game_time > MID_GAME_START {
            for lane in [Lane::Top, Lane::Bot] {
                let ours_down = self
                    .state
                    .turrets_down
                    .get(&(ally, lane))
                    .copied()
                    .unwrap_or(0);
                if ours_down < 2 {
                    continue;
                }
                let assigned_dead = allies.iter().any(|player| {
                    player.position == lane.assigned_position() && player.is_dead
                });
                if assigned_dead {
                    out.push(TriggerResult::local(
                        TriggerKind::CatchWave,
                        format!("{} lane open with its ally dead", lane.as_str()),
                        Urgency::Suggestion,
                        format!("Catch the {} wave before it crashes.", lane.as_str()),
                        30,
                    ));
                }
            }
        }

        // 6. Win condition: enough of them dead long enough to end.
        if game_time > LATE_GAME_START && dead_enemies.len() >= 3 {
            let jungler_dead = enemy_jungler.map(|player| player.is_dead).unwrap_or(false);
            let min_respawn = dead_enemies
                .iter()
                .map(|player| player.respawn_timer)
                .fold(f64::INFINITY, f64::min);
            if jungler_dead && min_respawn >= 15.0 {
                let push_time = self.estimated_push_time(enemy);
                if push_time < min_respawn {
                    out.push(TriggerResult::local(
                        TriggerKind::WinCondition,
                        format!(
                            "{} dead, min respawn {min_respawn:.0}s, push {push_time:.0}s",
                            dead_enemies.len()
                        ),
                        Urgency::Urgent,
                        "They cannot answer. Push mid and end the game.",
                        min_respawn as u32,
                    ));
                }
            }
        }

        // 7. Baron bait off an open inhibitor.
        if !self.state.enemy_inhibs_down.is_empty() && baron_up && !rush_baron {
            out.push(TriggerResult::local(
                TriggerKind::BaronBait,
                "enemy inhibitor down with baron up".to_owned(),
                Urgency::Suggestion,
                "Their inhib is open. Posture at baron and punish the response.",
                40,
            ));
        }

        // 8. Ace.
        if !enemies.is_empty() && dead_enemies.len() == enemies.len() {
            out.push(TriggerResult::llm(
                TriggerKind::Ace,
                "all enemies dead".to_owned(),
                Urgency::Urgent,
            ));
        }

        // 9. Gold swing since the last report.
        if (lead - self.state.last_reported_lead).abs() >= GOLD_SWING_THRESHOLD {
            out.push(TriggerResult::llm(
                TriggerKind::GoldSwing,
                format!(
                    "lead moved {} -> {}",
                    self.state.last_reported_lead, lead
                ),
                Urgency::Suggestion,
            ));
            self.state.last_reported_lead = lead;
        }

        // 10. Long enemy death timers.
        let long_timers = dead_enemies
            .iter()
            .filter(|player| player.respawn_timer > 30.0)
            .count();
        if long_timers >= 2 {
            out.push(TriggerResult::llm(
                TriggerKind::DeathTimers,
                format!("{long_timers} enemies on long respawns"),
                Urgency::Suggestion,
            ));
        }

        // 11. Power spike on the active player.
        let level = snapshot.active_player.level;
        let previous = self
            .state
            .player_levels
            .insert(snapshot.active_player.summoner_name.clone(), level)
            .unwrap_or(level);
        for player in &snapshot.all_players {
            self.state
                .player_levels
                .insert(player.summoner_name.clone(), player.level);
        }
        if POWER_SPIKE_LEVELS
            .iter()
            .any(|spike| previous < *spike && level >= *spike)
        {
            out.push(TriggerResult::llm(
                TriggerKind::PowerSpike,
                format!("reached level {level}"),
                Urgency::Info,
            ));
        }

        out
    }

    fn apply_events(&mut self, events: &[GameEvent]) -> Vec<TriggerResult> {
        let mut out = Vec::new();
        for event in events {
            let key = format!("{}:{}", event.event_name, event.event_id);
            if !self.state.seen_events.insert(key) {
                continue;
            }
            self.state.last_game_time = self.state.last_game_time.max(event.event_time);
            match event.event_name.as_str() {
                "ChampionKill" => {
                    let victim_team = self.state.name_team.get(&event.victim_name).copied();
                    if victim_team.is_some() && victim_team == self.state.ally_team {
                        self.state.ally_death_times.push_back(event.event_time);
                    }
                }
                "DragonKill" => {
                    match self.killer_side(&event.killer_name) {
                        Some(true) => self.state.ally_drakes += 1,
                        Some(false) => self.state.enemy_drakes += 1,
                        None => {}
                    }
                    out.push(TriggerResult::llm(
                        TriggerKind::ObjectiveTaken,
                        format!("dragon taken by {}", event.killer_name),
                        Urgency::Suggestion,
                    ));
                }
                "BaronKill" => {
                    self.state.last_baron_kill = Some(event.event_time);
                    out.push(TriggerResult::llm(
                        TriggerKind::ObjectiveTaken,
                        format!("baron taken by {}", event.killer_name),
                        Urgency::Urgent,
                    ));
                }
                "HeraldKill" => {
                    out.push(TriggerResult::llm(
                        TriggerKind::ObjectiveTaken,
                        format!("herald taken by {}", event.killer_name),
                        Urgency::Info,
                    ));
                }
                "TurretKilled" => {
                    if let Some((team, lane)) = parse_structure_name(&event.turret_killed) {
                        *self.state.turrets_down.entry((team, lane)).or_insert(0) += 1;
                    }
                }
                "InhibKilled" => {
                    if let Some((team, lane)) = parse_structure_name(&event.inhib_killed) {
                        if Some(team) == self.state.ally_team {
                            self.state.ally_inhibs_down.insert(lane);
                        } else {
                            self.state.enemy_inhibs_down.insert(lane);
                        }
                    }
                }
                "InhibRespawned" => {
                    if let Some((team, lane)) = parse_structure_name(&event.inhib_respawned) {
                        if Some(team) == self.state.ally_team {
                            self.state.ally_inhibs_down.remove(&lane);
                        } else {
                            self.state.enemy_inhibs_down.remove(&lane);
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Sorts by urgency (deterministic locals ahead of LLM candidates at the
    /// same urgency), enforces the global cooldown, and routes the winner.
    fn dispatch(
        &mut self,
        mut triggers: Vec<TriggerResult>,
        game_time: f64,
        now_ms: u64,
    ) -> Option<EngineOutput> {
        if triggers.is_empty() {
            return None;
        }
        triggers.sort_by_key(|trigger| (trigger.urgency, trigger.local.is_none()));

        if let Some(last) = self.state.last_advice_ms {
            if now_ms.saturating_sub(last) < ADVICE_COOLDOWN_MS {
                debug!(
                    suppressed = triggers.len(),
                    "advice cooldown active, dropping triggers"
                );
                return None;
            }
        }

        let top = &triggers[0];
        if let Some(advice) = &top.local {
            let call = MacroCall::new(top.urgency, top.kind.as_str(), advice.message.clone(), game_time)
                .with_reasoning(top.detail.clone())
                .with_window(advice.window_seconds);
            self.state.last_advice_ms = Some(now_ms);
            return Some(EngineOutput::Local(call));
        }

        let worthy: Vec<&TriggerResult> =
            triggers.iter().filter(|trigger| trigger.llm_worthy).collect();
        // Informational results ride along but never initiate an LLM call.
        if !worthy
            .iter()
            .any(|trigger| trigger.urgency <= Urgency::Suggestion)
        {
            return None;
        }
        let context = self.build_context(game_time, &worthy);
        self.state.last_advice_ms = Some(now_ms);
        Some(EngineOutput::LlmRequest {
            context: context.to_string(),
            phase_tag: phase_tag_for(game_time),
        })
    }

    fn build_context(&self, game_time: f64, triggers: &[&TriggerResult]) -> Value {
        let phase_tag = phase_tag_for(game_time);
        json!({
            "game_time": game_time,
            "phase": phase_tag,
            "triggers": triggers
                .iter()
                .map(|trigger| json!({
                    "kind": trigger.kind.as_str(),
                    "detail": trigger.detail,
                    "urgency": trigger.urgency,
                }))
                .collect::<Vec<_>>(),
            "gold_lead": self.state.gold_history.back().map(|(_, lead)| *lead).unwrap_or(0),
            "drakes": {"ally": self.state.ally_drakes, "enemy": self.state.enemy_drakes},
            "baron_up": self.baron_up(game_time),
            "inhibs_down": {
                "ally": self.state.ally_inhibs_down.iter().map(|lane| lane.as_str()).collect::<Vec<_>>(),
                "enemy": self.state.enemy_inhibs_down.iter().map(|lane| lane.as_str()).collect::<Vec<_>>(),
            },
            "active_player": self.state.active_summary.clone().unwrap_or(Value::Null),
        })
    }

    fn baron_up(&self, game_time: f64) -> bool {
        if game_time < BARON_FIRST_SPAWN {
            return false;
        }
        match self.state.last_baron_kill {
            Some(killed_at) => game_time >= killed_at + BARON_RESPAWN,
            None => true,
        }
    }

    /// Time to close out a push against the weakest enemy lane.
    fn estimated_push_time(&self, enemy: Team) -> f64 {
        let max_down = [Lane::Top, Lane::Mid, Lane::Bot]
            .into_iter()
            .map(|lane| {
                self.state
                    .turrets_down
                    .get(&(enemy, lane))
                    .copied()
                    .unwrap_or(0)
            })
            .max()
            .unwrap_or(0);
        let mut push = (5u32.saturating_sub(max_down)) as f64 * 18.0 + 10.0;
        if !self.state.enemy_inhibs_down.is_empty() {
            push *= 0.7;
        }
        push
    }

    fn killer_side(&self, killer_name: &str) -> Option<bool> {
        let ally = self.state.ally_team?;
        let team = self.state.name_team.get(killer_name).copied()?;
        Some(team == ally)
    }
}

fn gold_lead(players: &[PlayerSlot], ally: Team) -> i64 {
    let mut ally_gold = 0i64;
    let mut enemy_gold = 0i64;
    for player in players {
        let Some(team) = Team::from_scoreboard(&player.team) else {
            continue;
        };
        let estimate = player.scores.creep_score as i64 * GOLD_PER_CS
            + player.scores.kills as i64 * GOLD_PER_KILL
            + player.scores.assists as i64 * GOLD_PER_ASSIST;
        if team == ally {
            ally_gold += estimate;
        } else {
            enemy_gold += estimate;
        }
    }
    ally_gold - enemy_gold
}
