use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Canonical match phases. Exactly one is current at any time; only the
/// phase machine mutates it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Lobby,
    ChampSelect,
    Loading,
    InGame,
    PostGame,
}

/// Reduces a raw client gameflow string to a canonical phase. Unknown
/// strings map to `Idle`.
pub fn map_gameflow_phase(raw: &str) -> Phase {
    match raw {
        "None" => Phase::Idle,
        "Lobby" => Phase::Lobby,
        "Matchmaking" | "ReadyCheck" => Phase::Lobby,
        "ChampSelect" => Phase::ChampSelect,
        "GameStart" => Phase::Loading,
        "InProgress" => Phase::InGame,
        "WaitingForStats" | "PreEndOfGame" | "EndOfGame" => Phase::PostGame,
        _ => Phase::Idle,
    }
}

/// Advisory edges. The client remains the source of truth: a transition
/// outside this set is logged and applied anyway.
fn is_advisory_edge(from: Phase, to: Phase) -> bool {
    use Phase::*;
    matches!(
        (from, to),
        (Idle, Lobby)
            | (Lobby, ChampSelect)
            | (Lobby, Idle)
            | (ChampSelect, Loading)
            | (ChampSelect, Lobby)
            | (Loading, InGame)
            | (InGame, PostGame)
            | (PostGame, Idle)
            | (PostGame, Lobby)
    )
}

#[derive(Debug)]
pub struct PhaseMachine {
    current: Phase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: Phase::Idle,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Ingest a raw client phase string. Returns the `(from, to)` transition
    /// if the canonical phase changed, `None` on a same-phase no-op.
    pub fn apply_raw(&mut self, raw: &str) -> Option<(Phase, Phase)> {
        self.apply(map_gameflow_phase(raw))
    }

    pub fn apply(&mut self, next: Phase) -> Option<(Phase, Phase)> {
        let from = self.current;
        if next == from {
            return None;
        }
        if !is_advisory_edge(from, next) {
            warn!(?from, to = ?next, "applying non-advisory phase transition");
        } else {
            debug!(?from, to = ?next, "phase transition");
        }
        self.current = next;
        Some((from, next))
    }

    /// Force the machine back to `Idle`, emitting a transition if the prior
    /// state was non-idle.
    pub fn reset(&mut self) -> Option<(Phase, Phase)> {
        let from = self.current;
        if from == Phase::Idle {
            return None;
        }
        self.current = Phase::Idle;
        Some((from, Phase::Idle))
    }
}

#[cfg(test)]
mod tests {
    use super::{map_gameflow_phase, Phase, PhaseMachine};

    #[test]
    fn maps_client_strings_to_canonical_phases() {
        assert_eq!(map_gameflow_phase("None"), Phase::Idle);
        assert_eq!(map_gameflow_phase("Lobby"), Phase::Lobby);
        assert_eq!(map_gameflow_phase("Matchmaking"), Phase::Lobby);
        assert_eq!(map_gameflow_phase("ReadyCheck"), Phase::Lobby);
        assert_eq!(map_gameflow_phase("ChampSelect"), Phase::ChampSelect);
        assert_eq!(map_gameflow_phase("GameStart"), Phase::Loading);
        assert_eq!(map_gameflow_phase("InProgress"), Phase::InGame);
        assert_eq!(map_gameflow_phase("WaitingForStats"), Phase::PostGame);
        assert_eq!(map_gameflow_phase("PreEndOfGame"), Phase::PostGame);
        assert_eq!(map_gameflow_phase("EndOfGame"), Phase::PostGame);
        assert_eq!(map_gameflow_phase("ChampSelect2"), Phase::Idle);
        assert_eq!(map_gameflow_phase(""), Phase::Idle);
    }

    #[test]
    fn first_transition_starts_from_idle() {
        let mut machine = PhaseMachine::new();
        let (from, to) = machine
            .apply_raw("Lobby")
            .expect("expected transition from fresh machine");
        assert_eq!(from, Phase::Idle);
        assert_eq!(to, Phase::Lobby);
    }

    #[test]
    fn same_phase_input_is_a_no_op() {
        let mut machine = PhaseMachine::new();
        machine.apply_raw("Lobby");
        assert!(machine.apply_raw("Lobby").is_none());
        assert!(machine.apply_raw("Matchmaking").is_none());
        assert_eq!(machine.current(), Phase::Lobby);
    }

    #[test]
    fn transitions_chain_so_from_equals_previous_to() {
        let mut machine = PhaseMachine::new();
        let inputs = ["Lobby", "ChampSelect", "GameStart", "InProgress", "EndOfGame"];
        let mut previous_to = Phase::Idle;
        for input in inputs {
            let (from, to) = machine.apply_raw(input).expect("expected transition");
            assert_eq!(from, previous_to);
            previous_to = to;
        }
        assert_eq!(machine.current(), Phase::PostGame);
    }

    #[test]
    fn non_advisory_edge_is_still_applied() {
        let mut machine = PhaseMachine::new();
        machine.apply_raw("InProgress");
        assert_eq!(machine.current(), Phase::InGame);
        let (from, to) = machine
            .apply_raw("ChampSelect")
            .expect("client-authoritative transition must apply");
        assert_eq!(from, Phase::InGame);
        assert_eq!(to, Phase::ChampSelect);
    }

    #[test]
    fn dodge_returns_to_lobby() {
        let mut machine = PhaseMachine::new();
        machine.apply_raw("Lobby");
        machine.apply_raw("ChampSelect");
        let (from, to) = machine.apply_raw("Lobby").expect("dodge should transition");
        assert_eq!((from, to), (Phase::ChampSelect, Phase::Lobby));
    }

    #[test]
    fn reset_forces_idle_and_emits_once() {
        let mut machine = PhaseMachine::new();
        machine.apply_raw("InProgress");
        let (from, to) = machine.reset().expect("reset from non-idle should emit");
        assert_eq!((from, to), (Phase::InGame, Phase::Idle));
        assert!(machine.reset().is_none());
    }
}
