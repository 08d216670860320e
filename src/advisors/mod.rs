pub mod draft;
pub mod live;
pub mod post;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    llm::{ChatMessage, ChatModel, ChatRequest, ChatResponse, ContentBlock, Role, ToolSchema},
    phase::Phase,
    store::SettingsStore,
};

const MAX_TOOL_ROUNDS: u32 = 10;
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
const MAX_REQUEST_RETRIES: u32 = 2;
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvisorKind {
    Draft,
    Live,
    Post,
}

impl AdvisorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AdvisorKind::Draft => "draft",
            AdvisorKind::Live => "live",
            AdvisorKind::Post => "post",
        }
    }
}

/// Static phase-to-advisor mapping.
pub fn advisor_for_phase(phase: Phase) -> Option<AdvisorKind> {
    match phase {
        Phase::ChampSelect => Some(AdvisorKind::Draft),
        Phase::InGame => Some(AdvisorKind::Live),
        Phase::PostGame => Some(AdvisorKind::Post),
        Phase::Idle | Phase::Lobby | Phase::Loading => None,
    }
}

/// Capability set every advisor exposes to the runtime.
#[async_trait]
pub trait Advisor: Send + Sync {
    fn name(&self) -> &'static str;
    fn system_prompt(&self) -> String;
    fn tools(&self) -> Vec<ToolSchema>;
    async fn on_activate(&self) -> Result<()>;
    async fn on_deactivate(&self) -> Result<()>;
    async fn handle_tool(&self, name: &str, input: Value) -> Result<Value>;
}

/// Work order from an advisor pipeline to the runtime.
#[derive(Debug, Clone)]
pub struct AdvisorRequest {
    pub kind: AdvisorKind,
    pub context: String,
    pub phase_tag: String,
}

/// Result of one tool-loop invocation. Failures come back as partial
/// results with `error` set, never as panics past the advisor boundary.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub text: String,
    pub rounds: u32,
    pub error: Option<String>,
}

struct RuntimeInner {
    model: Arc<dyn ChatModel>,
    advisors: HashMap<AdvisorKind, Arc<dyn Advisor>>,
    in_flight: HashMap<AdvisorKind, AtomicBool>,
}

/// Lifecycle manager for the three advisor instances. At most one is active
/// at a time; deactivation of the outgoing advisor completes before the
/// incoming one starts.
pub struct AdvisorRuntime {
    inner: Arc<RuntimeInner>,
    store: SettingsStore,
    active: Option<AdvisorKind>,
    paused: bool,
}

impl AdvisorRuntime {
    pub fn new(
        model: Arc<dyn ChatModel>,
        store: SettingsStore,
        advisors: Vec<(AdvisorKind, Arc<dyn Advisor>)>,
    ) -> Self {
        let mut registry = HashMap::new();
        let mut in_flight = HashMap::new();
        for (kind, advisor) in advisors {
            registry.insert(kind, advisor);
            in_flight.insert(kind, AtomicBool::new(false));
        }
        Self {
            inner: Arc::new(RuntimeInner {
                model,
                advisors: registry,
                in_flight,
            }),
            store,
            active: None,
            paused: false,
        }
    }

    pub fn invoker(&self) -> AdvisorInvoker {
        AdvisorInvoker {
            inner: self.inner.clone(),
        }
    }

    pub fn active(&self) -> Option<AdvisorKind> {
        self.active
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Activates the advisor mapped to `phase`, consulting the persisted
    /// per-advisor enable flag. Idempotent for the already-active advisor.
    pub async fn on_phase(&mut self, phase: Phase) {
        let target = if self.paused {
            None
        } else {
            advisor_for_phase(phase).filter(|kind| {
                let enabled = self
                    .store
                    .advisor_enabled(kind.as_str())
                    .unwrap_or(true);
                if !enabled {
                    info!(advisor = kind.as_str(), "advisor disabled by settings flag");
                }
                enabled
            })
        };
        self.set_active(target).await;
    }

    pub async fn deactivate_all(&mut self) {
        self.set_active(None).await;
    }

    /// Short-circuits activation without changing the phase; used on
    /// credential loss and rate-limit pauses.
    pub async fn pause(&mut self) {
        self.paused = true;
        self.set_active(None).await;
    }

    pub async fn resume(&mut self, phase: Phase) {
        self.paused = false;
        self.on_phase(phase).await;
    }

    async fn set_active(&mut self, target: Option<AdvisorKind>) {
        if self.active == target {
            return;
        }
        if let Some(outgoing) = self.active.take() {
            if let Some(advisor) = self.inner.advisors.get(&outgoing) {
                if let Err(err) = advisor.on_deactivate().await {
                    warn!(?err, advisor = outgoing.as_str(), "advisor deactivation failed");
                }
                info!(advisor = outgoing.as_str(), "advisor deactivated");
            }
        }
        let Some(incoming) = target else {
            return;
        };
        let Some(advisor) = self.inner.advisors.get(&incoming) else {
            warn!(advisor = incoming.as_str(), "no advisor registered for phase");
            return;
        };
        match advisor.on_activate().await {
            Ok(()) => {
                info!(advisor = incoming.as_str(), "advisor activated");
                self.active = Some(incoming);
            }
            Err(err) => {
                warn!(?err, advisor = incoming.as_str(), "advisor activation failed");
            }
        }
    }
}

/// Cloneable handle that runs the tool loop on an advisor's behalf. One
/// in-flight invocation per advisor; overlapping requests are dropped.
#[derive(Clone)]
pub struct AdvisorInvoker {
    inner: Arc<RuntimeInner>,
}

impl AdvisorInvoker {
    pub async fn invoke(
        &self,
        kind: AdvisorKind,
        context: &str,
        phase_tag: &str,
    ) -> Option<InvokeOutcome> {
        let advisor = self.inner.advisors.get(&kind)?.clone();
        let flag = self.inner.in_flight.get(&kind)?;
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(advisor = kind.as_str(), "invocation already in flight, dropping");
            return None;
        }
        let outcome = self.run_tool_loop(advisor, context, phase_tag).await;
        flag.store(false, Ordering::Release);
        Some(outcome)
    }

    async fn run_tool_loop(
        &self,
        advisor: Arc<dyn Advisor>,
        context: &str,
        phase_tag: &str,
    ) -> InvokeOutcome {
        let mut messages = vec![ChatMessage::user_text(format!(
            "phase_tag: {phase_tag}\n{context}"
        ))];
        let tools = advisor.tools();
        let system = advisor.system_prompt();
        let mut transcript = Vec::new();

        for round in 1..=MAX_TOOL_ROUNDS {
            let request = ChatRequest {
                system: system.clone(),
                tools: tools.clone(),
                messages: messages.clone(),
                max_tokens: MAX_TOKENS,
            };
            let response = match self.request_with_retry(&request).await {
                Ok(response) => response,
                Err(err) => {
                    return InvokeOutcome {
                        text: transcript.join("\n"),
                        rounds: round,
                        error: Some(err.to_string()),
                    }
                }
            };
            debug!(round, stop_reason = ?response.stop_reason, "model response received");
            let text = response.text();
            if !text.is_empty() {
                transcript.push(text);
            }
            let tool_uses: Vec<(String, String, Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_owned(), name.to_owned(), input.clone()))
                .collect();
            if tool_uses.is_empty() {
                return InvokeOutcome {
                    text: transcript.join("\n"),
                    rounds: round,
                    error: None,
                };
            }
            messages.push(ChatMessage {
                role: Role::Assistant,
                content: response.content.clone(),
            });
            let mut results = Vec::new();
            for (id, name, input) in tool_uses {
                // Tool-handler failures go back to the model as error results
                // so the loop can continue.
                let block = match advisor.handle_tool(&name, input).await {
                    Ok(value) => ContentBlock::ToolResult {
                        tool_use_id: id,
                        content: value.to_string(),
                        is_error: false,
                    },
                    Err(err) => ContentBlock::ToolResult {
                        tool_use_id: id,
                        content: json!({"error": err.to_string()}).to_string(),
                        is_error: true,
                    },
                };
                results.push(block);
            }
            messages.push(ChatMessage {
                role: Role::User,
                content: results,
            });
        }

        InvokeOutcome {
            text: transcript.join("\n"),
            rounds: MAX_TOOL_ROUNDS,
            error: Some(format!("tool loop exceeded {MAX_TOOL_ROUNDS} rounds")),
        }
    }

    async fn request_with_retry(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let mut last_error = None;
        for attempt in 0..=MAX_REQUEST_RETRIES {
            if attempt > 0 {
                debug!(attempt, "retrying advisor llm request");
            }
            match timeout(REQUEST_DEADLINE, self.inner.model.complete(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => last_error = Some(anyhow::anyhow!("llm request deadline exceeded")),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("llm request failed")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingAdvisor {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        tool_results: Mutex<Vec<Result<Value>>>,
    }

    impl RecordingAdvisor {
        fn new(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                log,
                tool_results: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Advisor for RecordingAdvisor {
        fn name(&self) -> &'static str {
            self.label
        }

        fn system_prompt(&self) -> String {
            format!("You are the {} advisor.", self.label)
        }

        fn tools(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "note".to_owned(),
                description: "record a note".to_owned(),
                input_schema: json!({"type": "object"}),
            }]
        }

        async fn on_activate(&self) -> Result<()> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("activate:{}", self.label));
            Ok(())
        }

        async fn on_deactivate(&self) -> Result<()> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("deactivate:{}", self.label));
            Ok(())
        }

        async fn handle_tool(&self, _name: &str, _input: Value) -> Result<Value> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("tool:{}", self.label));
            let mut results = self.tool_results.lock().expect("tool results lock");
            if results.is_empty() {
                Ok(json!({"ok": true}))
            } else {
                results.remove(0)
            }
        }
    }

    struct ScriptedModel {
        responses: Mutex<Vec<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        fn gated(responses: Vec<ChatResponse>, gate: Arc<tokio::sync::Notify>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.requests
                .lock()
                .expect("request log lock")
                .push(request.clone());
            let mut responses = self.responses.lock().expect("response script lock");
            if responses.is_empty() {
                return Ok(text_response("done"));
            }
            Ok(responses.remove(0))
        }
    }

    fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: vec![ContentBlock::Text {
                text: text.to_owned(),
            }],
            stop_reason: Some("end_turn".to_owned()),
        }
    }

    fn tool_use_response(name: &str) -> ChatResponse {
        ChatResponse {
            content: vec![ContentBlock::ToolUse {
                id: "toolu_1".to_owned(),
                name: name.to_owned(),
                input: json!({}),
            }],
            stop_reason: Some("tool_use".to_owned()),
        }
    }

    fn temp_store() -> SettingsStore {
        let unique = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        SettingsStore::open(std::env::temp_dir().join(format!("rift_coach_adv_{unique}.db")))
            .expect("store should open")
    }

    fn runtime_with(
        model: Arc<dyn ChatModel>,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> AdvisorRuntime {
        AdvisorRuntime::new(
            model,
            temp_store(),
            vec![
                (
                    AdvisorKind::Draft,
                    RecordingAdvisor::new("draft", log.clone()) as Arc<dyn Advisor>,
                ),
                (
                    AdvisorKind::Live,
                    RecordingAdvisor::new("live", log.clone()) as Arc<dyn Advisor>,
                ),
                (
                    AdvisorKind::Post,
                    RecordingAdvisor::new("post", log.clone()) as Arc<dyn Advisor>,
                ),
            ],
        )
    }

    #[test]
    fn phase_map_matches_contract() {
        assert_eq!(advisor_for_phase(Phase::ChampSelect), Some(AdvisorKind::Draft));
        assert_eq!(advisor_for_phase(Phase::InGame), Some(AdvisorKind::Live));
        assert_eq!(advisor_for_phase(Phase::PostGame), Some(AdvisorKind::Post));
        assert_eq!(advisor_for_phase(Phase::Idle), None);
        assert_eq!(advisor_for_phase(Phase::Lobby), None);
        assert_eq!(advisor_for_phase(Phase::Loading), None);
    }

    #[tokio::test]
    async fn deactivation_completes_before_next_activation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = runtime_with(ScriptedModel::new(Vec::new()), &log);

        runtime.on_phase(Phase::ChampSelect).await;
        runtime.on_phase(Phase::InGame).await;
        runtime.on_phase(Phase::PostGame).await;
        runtime.deactivate_all().await;

        let entries = log.lock().expect("log lock").clone();
        assert_eq!(
            entries,
            vec![
                "activate:draft",
                "deactivate:draft",
                "activate:live",
                "deactivate:live",
                "activate:post",
                "deactivate:post",
            ]
        );
    }

    #[tokio::test]
    async fn activation_is_idempotent_for_the_active_advisor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = runtime_with(ScriptedModel::new(Vec::new()), &log);

        runtime.on_phase(Phase::ChampSelect).await;
        runtime.on_phase(Phase::ChampSelect).await;
        assert_eq!(log.lock().expect("log lock").len(), 1);
        assert_eq!(runtime.active(), Some(AdvisorKind::Draft));
    }

    #[tokio::test]
    async fn pause_short_circuits_activation_until_resume() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut runtime = runtime_with(ScriptedModel::new(Vec::new()), &log);

        runtime.on_phase(Phase::InGame).await;
        runtime.pause().await;
        assert_eq!(runtime.active(), None);
        runtime.on_phase(Phase::ChampSelect).await;
        assert_eq!(runtime.active(), None);
        runtime.resume(Phase::ChampSelect).await;
        assert_eq!(runtime.active(), Some(AdvisorKind::Draft));
    }

    #[tokio::test]
    async fn disabled_advisor_is_not_activated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = ScriptedModel::new(Vec::new());
        let store = temp_store();
        store
            .set_advisor_enabled("draft", false)
            .expect("flag write");
        let mut runtime = AdvisorRuntime::new(
            model,
            store,
            vec![(
                AdvisorKind::Draft,
                RecordingAdvisor::new("draft", log.clone()) as Arc<dyn Advisor>,
            )],
        );
        runtime.on_phase(Phase::ChampSelect).await;
        assert_eq!(runtime.active(), None);
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back_until_text() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = ScriptedModel::new(vec![
            tool_use_response("note"),
            text_response("all wrapped up"),
        ]);
        let runtime = runtime_with(model.clone(), &log);
        let invoker = runtime.invoker();

        let outcome = invoker
            .invoke(AdvisorKind::Draft, "{\"draft_phase\": 1}", "champ_select")
            .await
            .expect("invocation should run");
        assert_eq!(outcome.text, "all wrapped up");
        assert_eq!(outcome.rounds, 2);
        assert!(outcome.error.is_none());
        assert!(log
            .lock()
            .expect("log lock")
            .contains(&"tool:draft".to_owned()));

        // The second request must carry the tool result back to the model.
        let requests = model.requests.lock().expect("request log lock");
        assert_eq!(requests.len(), 2);
        let followup = &requests[1].messages;
        assert!(followup.iter().any(|message| message
            .content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolResult { is_error: false, .. }))));
        assert!(requests[0].messages[0]
            .content
            .iter()
            .any(|block| matches!(block, ContentBlock::Text { text } if text.contains("draft_phase"))));
    }

    #[tokio::test]
    async fn tool_handler_failure_returns_error_result_to_model() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let advisor = RecordingAdvisor::new("draft", log.clone());
        advisor
            .tool_results
            .lock()
            .expect("tool results lock")
            .push(Err(anyhow::anyhow!("boom")));
        let model = ScriptedModel::new(vec![tool_use_response("note"), text_response("ok")]);
        let runtime = AdvisorRuntime::new(
            model.clone(),
            temp_store(),
            vec![(AdvisorKind::Draft, advisor as Arc<dyn Advisor>)],
        );

        let outcome = runtime
            .invoker()
            .invoke(AdvisorKind::Draft, "{}", "champ_select")
            .await
            .expect("invocation should run");
        assert!(outcome.error.is_none(), "loop should continue past tool error");

        let requests = model.requests.lock().expect("request log lock");
        assert!(requests[1].messages.iter().any(|message| message
            .content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolResult { is_error: true, content, .. }
                if content.contains("boom")))));
    }

    #[tokio::test]
    async fn tool_loop_is_bounded_by_round_limit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let responses = (0..20).map(|_| tool_use_response("note")).collect();
        let model = ScriptedModel::new(responses);
        let runtime = runtime_with(model, &log);

        let outcome = runtime
            .invoker()
            .invoke(AdvisorKind::Live, "{}", "mid")
            .await
            .expect("invocation should run");
        assert_eq!(outcome.rounds, MAX_TOOL_ROUNDS);
        assert!(outcome
            .error
            .as_deref()
            .expect("round limit should surface")
            .contains("rounds"));
    }

    #[tokio::test]
    async fn overlapping_invocations_are_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());
        let model = ScriptedModel::gated(vec![text_response("first")], gate.clone());
        let runtime = runtime_with(model, &log);
        let invoker = runtime.invoker();

        let busy = invoker.clone();
        let first = tokio::spawn(async move { busy.invoke(AdvisorKind::Live, "{}", "mid").await });
        // Let the first invocation claim its slot before the second arrives.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let second = invoker.invoke(AdvisorKind::Live, "{}", "mid").await;
        assert!(second.is_none(), "overlapping invocation must be dropped");

        gate.notify_one();
        let outcome = first
            .await
            .expect("task should join")
            .expect("first invocation should run");
        assert_eq!(outcome.text, "first");
    }
}
