mod advisors;
mod client;
mod config;
mod error;
mod events;
mod livegame;
mod lockfile;
mod llm;
mod phase;
mod scheduler;
mod secrets;
mod store;
mod triggers;

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::{signal, sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    advisors::{
        draft::DraftAdvisor, live::LiveAdvisor, post::PostAdvisor, Advisor, AdvisorInvoker,
        AdvisorKind, AdvisorRequest, AdvisorRuntime,
    },
    client::{spawn_session_worker, SessionEvent, SessionHandle},
    config::{env_or_dotenv, load_dotenv_fallback, CoachConfig},
    events::{OverlayMessage, OverlaySink},
    livegame::{spawn_live_client_worker, TelemetryUpdate},
    llm::{AnthropicConfig, AnthropicModel},
    lockfile::ProcessScanLocator,
    phase::{Phase, PhaseMachine},
    scheduler::{ApiRequest, CloudScheduler, HttpTransport, SchedulerSignal},
    store::SettingsStore,
    triggers::{EngineOutput, TriggerEngine},
};

const KEY_PROPAGATION_DELAY: Duration = Duration::from_secs(5);
const KEY_WATCH_INTERVAL: Duration = Duration::from_secs(30);
const MIN_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (config, config_path) = CoachConfig::load_or_create()?;
    info!(path = %config_path.display(), "loaded config");
    let store = SettingsStore::open_default()?;
    let dotenv = load_dotenv_fallback();

    let region = secrets::region(&config.region);
    let routing = secrets::routing(&config.routing);
    info!(%region, %routing, "cloud endpoints configured");
    if let Ok(Some(patch)) = store.meta_patch_marker() {
        info!(%patch, "cached meta patch marker");
    }
    if let Some(disabled) = env_or_dotenv("RIFT_COACH_DISABLED_ADVISORS", &dotenv) {
        for name in disabled.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if let Err(err) = store.set_advisor_enabled(name, false) {
                warn!(?err, advisor = name, "failed persisting advisor disable flag");
            }
        }
    }

    let riot_key = secrets::riot_api_key()
        .ok()
        .or_else(|| env_or_dotenv("RIOT_API_KEY", &dotenv))
        .unwrap_or_default();
    if riot_key.is_empty() {
        warn!("no riot api key configured; cloud calls will fail until one is provided");
    }
    let anthropic_key = secrets::anthropic_api_key()
        .or_else(|| env_or_dotenv("ANTHROPIC_API_KEY", &dotenv))
        .unwrap_or_default();
    if anthropic_key.is_empty() {
        warn!("no llm api key configured; advisors will return errors until one is provided");
    }

    let (overlay_tx, overlay_rx) = crossbeam_channel::unbounded::<OverlayMessage>();
    spawn_overlay_bridge(overlay_rx);

    let session = SessionHandle::new()?;
    let locator = Arc::new(
        ProcessScanLocator::default().with_extra_dirs(config.extra_install_dirs.clone()),
    );
    let (session_tx, session_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let session_task = spawn_session_worker(locator, session.clone(), session_tx);

    let (telemetry_tx, telemetry_rx) =
        mpsc::channel::<TelemetryUpdate>(config.telemetry_channel_capacity.max(2));
    let telemetry_task = spawn_live_client_worker(telemetry_tx);

    let (signal_tx, signal_rx) = mpsc::unbounded_channel::<SchedulerSignal>();
    let transport = Arc::new(HttpTransport::new()?);
    let (cloud, scheduler_task) = CloudScheduler::spawn(
        transport,
        riot_key.clone(),
        config.soft_throttle_ceiling,
        signal_tx,
    );

    let model = Arc::new(
        AnthropicModel::new(AnthropicConfig {
            api_key: anthropic_key,
            model: config.llm_model.clone(),
            ..AnthropicConfig::default()
        })
        .context("failed building llm client")?,
    );

    let (request_tx, request_rx) = mpsc::unbounded_channel::<AdvisorRequest>();
    let runtime = AdvisorRuntime::new(
        model,
        store.clone(),
        vec![
            (
                AdvisorKind::Draft,
                Arc::new(DraftAdvisor::new(
                    session.clone(),
                    overlay_tx.clone(),
                    request_tx.clone(),
                )) as Arc<dyn Advisor>,
            ),
            (
                AdvisorKind::Live,
                Arc::new(LiveAdvisor::new(overlay_tx.clone())) as Arc<dyn Advisor>,
            ),
            (
                AdvisorKind::Post,
                Arc::new(PostAdvisor::new(
                    session.clone(),
                    overlay_tx.clone(),
                    request_tx.clone(),
                    store.clone(),
                )) as Arc<dyn Advisor>,
            ),
        ],
    );

    let mut workers = CoachHandles {
        session: Some(session_task),
        telemetry: Some(telemetry_task),
        scheduler: Some(scheduler_task),
    };

    let orchestrator = Orchestrator {
        machine: PhaseMachine::new(),
        engine: TriggerEngine::new(),
        runtime,
        overlay: overlay_tx,
        session,
        cloud,
        region,
        current_key: riot_key,
        request_tx,
    };

    tokio::select! {
        _ = orchestrator.run(session_rx, telemetry_rx, signal_rx, request_rx) => {
            error!("orchestrator loop ended unexpectedly");
        }
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!(?err, "failed waiting for shutdown signal");
            }
            info!("shutdown requested, stopping workers");
        }
    }

    workers.abort_all();
    Ok(())
}

#[derive(Default)]
struct CoachHandles {
    session: Option<JoinHandle<()>>,
    telemetry: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

impl CoachHandles {
    fn abort_all(&mut self) {
        abort_handle(&mut self.session);
        abort_handle(&mut self.telemetry);
        abort_handle(&mut self.scheduler);
    }
}

fn abort_handle(handle: &mut Option<JoinHandle<()>>) {
    if let Some(task) = handle.take() {
        task.abort();
    }
}

/// The overlay host boundary: an outbound-only sink. Here each typed message
/// is published as one JSON line; a windowed host would render it instead.
fn spawn_overlay_bridge(rx: crossbeam_channel::Receiver<OverlayMessage>) {
    std::thread::spawn(move || {
        while let Ok(message) = rx.recv() {
            match serde_json::to_string(&message) {
                Ok(line) => info!(target: "overlay", "{line}"),
                Err(err) => warn!(?err, "overlay message failed to serialize"),
            }
        }
    });
}

enum ControlMessage {
    KeyReloaded(String),
    ResumeAdvisors,
}

struct Orchestrator {
    machine: PhaseMachine,
    engine: TriggerEngine,
    runtime: AdvisorRuntime,
    overlay: OverlaySink,
    session: SessionHandle,
    cloud: CloudScheduler,
    region: String,
    current_key: String,
    request_tx: mpsc::UnboundedSender<AdvisorRequest>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut telemetry_rx: mpsc::Receiver<TelemetryUpdate>,
        mut signal_rx: mpsc::UnboundedReceiver<SchedulerSignal>,
        mut request_rx: mpsc::UnboundedReceiver<AdvisorRequest>,
    ) {
        let invoker = self.runtime.invoker();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
        loop {
            tokio::select! {
                Some(event) = session_rx.recv() => self.on_session_event(event).await,
                Some(update) = telemetry_rx.recv() => self.on_telemetry(update).await,
                Some(signal) = signal_rx.recv() => self.on_scheduler_signal(signal, &control_tx).await,
                Some(request) = request_rx.recv() => self.on_advisor_request(request, &invoker),
                Some(control) = control_rx.recv() => self.on_control(control, &control_tx).await,
                else => return,
            }
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.status("Connected to client");
                self.spawn_identity_probe();
            }
            SessionEvent::Disconnected => {
                self.status("Waiting for client");
                if let Some((from, to)) = self.machine.reset() {
                    self.emit_phase_transition(from, to).await;
                }
                self.runtime.deactivate_all().await;
            }
            SessionEvent::GameflowPhase(raw) => {
                if let Some((from, to)) = self.machine.apply_raw(&raw) {
                    self.emit_phase_transition(from, to).await;
                }
            }
        }
    }

    async fn emit_phase_transition(&mut self, from: Phase, to: Phase) {
        info!(?from, ?to, "phase transition");
        let _ = self.overlay.send(OverlayMessage::GamePhaseChanged { phase: to });
        if to == Phase::InGame {
            self.engine.reset();
        }
        self.runtime.on_phase(to).await;
    }

    async fn on_telemetry(&mut self, update: TelemetryUpdate) {
        if self.machine.current() != Phase::InGame || !self.session.is_connected() {
            return;
        }
        let output = match update {
            TelemetryUpdate::Snapshot(snapshot) => {
                self.engine.handle_snapshot(&snapshot, now_ms())
            }
            TelemetryUpdate::NewEvents(events) => self.engine.handle_events(&events, now_ms()),
            TelemetryUpdate::Available => {
                debug!("live telemetry available");
                None
            }
            TelemetryUpdate::Unavailable => {
                debug!("live telemetry unavailable");
                None
            }
        };
        match output {
            Some(EngineOutput::Local(call)) => {
                info!(call_type = %call.call_type, "local macro dispatch");
                let _ = self.overlay.send(OverlayMessage::MacroCall(call));
            }
            Some(EngineOutput::LlmRequest { context, phase_tag }) => {
                if self.runtime.active() == Some(AdvisorKind::Live) {
                    let _ = self.request_tx.send(AdvisorRequest {
                        kind: AdvisorKind::Live,
                        context,
                        phase_tag: phase_tag.to_owned(),
                    });
                } else {
                    debug!("live advisor inactive, dropping llm-worthy triggers");
                }
            }
            None => {}
        }
    }

    async fn on_scheduler_signal(
        &mut self,
        signal: SchedulerSignal,
        control_tx: &mpsc::UnboundedSender<ControlMessage>,
    ) {
        match signal {
            SchedulerSignal::RateLimited { retry_after_secs } => {
                warn!(
                    retry_after_secs,
                    window_usage = self.cloud.window_usage(),
                    pending = self.cloud.pending(),
                    "cloud api rate limited"
                );
                self.status("Rate Limited — pausing 2 min");
                self.runtime.pause().await;
                let pause = MIN_RATE_LIMIT_PAUSE.max(Duration::from_secs(retry_after_secs));
                let control_tx = control_tx.clone();
                tokio::spawn(async move {
                    sleep(pause).await;
                    let _ = control_tx.send(ControlMessage::ResumeAdvisors);
                });
            }
            SchedulerSignal::KeyExpired => {
                self.status("API KEY EXPIRED");
                self.runtime.pause().await;
                self.spawn_key_watcher(control_tx.clone());
            }
        }
    }

    fn on_advisor_request(&self, request: AdvisorRequest, invoker: &AdvisorInvoker) {
        let invoker = invoker.clone();
        let overlay = self.overlay.clone();
        tokio::spawn(async move {
            let Some(outcome) = invoker
                .invoke(request.kind, &request.context, &request.phase_tag)
                .await
            else {
                return;
            };
            match &outcome.error {
                Some(error) => {
                    warn!(
                        advisor = request.kind.as_str(),
                        rounds = outcome.rounds,
                        error = %error,
                        "advisor invocation ended with error"
                    );
                    if request.kind == AdvisorKind::Draft {
                        let _ = overlay.send(OverlayMessage::DraftRecommendation {
                            text: outcome.text.clone(),
                            error: Some(error.clone()),
                        });
                    }
                }
                None => {
                    debug!(
                        advisor = request.kind.as_str(),
                        rounds = outcome.rounds,
                        "advisor invocation complete"
                    );
                }
            }
        });
    }

    async fn on_control(
        &mut self,
        control: ControlMessage,
        control_tx: &mpsc::UnboundedSender<ControlMessage>,
    ) {
        match control {
            ControlMessage::KeyReloaded(key) => {
                self.cloud.reload_key(key.clone());
                self.current_key = key;
                self.status("API key reloaded");
                // Give the fresh key time to propagate before advisors resume.
                let control_tx = control_tx.clone();
                tokio::spawn(async move {
                    sleep(KEY_PROPAGATION_DELAY).await;
                    let _ = control_tx.send(ControlMessage::ResumeAdvisors);
                });
            }
            ControlMessage::ResumeAdvisors => {
                if self.runtime.is_paused() {
                    let phase = self.machine.current();
                    self.runtime.resume(phase).await;
                    self.status("Advisors resumed");
                }
            }
        }
    }

    /// Resolves the local identity on connect and confirms the cloud key by
    /// fetching the same summoner through the scheduler.
    fn spawn_identity_probe(&self) {
        let session = self.session.clone();
        let cloud = self.cloud.clone();
        let region = self.region.clone();
        tokio::spawn(async move {
            let identity = match session.get("/lol-summoner/v1/current-summoner").await {
                Ok(identity) => identity,
                Err(err) => {
                    debug!(?err, "current summoner fetch failed");
                    return;
                }
            };
            let game_name = identity
                .get("gameName")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let tag_line = identity
                .get("tagLine")
                .and_then(Value::as_str)
                .unwrap_or("");
            info!(summoner = %format!("{game_name}#{tag_line}"), "resolved local identity");
            let Some(puuid) = identity.get("puuid").and_then(Value::as_str) else {
                return;
            };
            match cloud
                .enqueue(ApiRequest::get(cloud_summoner_url(&region, puuid)))
                .await
            {
                Ok(summoner) => {
                    let level = summoner.get("summonerLevel").and_then(Value::as_u64);
                    debug!(?level, "cloud summoner lookup succeeded");
                }
                Err(err) => warn!(?err, "cloud summoner lookup failed"),
            }
        });
    }

    fn spawn_key_watcher(&self, control_tx: mpsc::UnboundedSender<ControlMessage>) {
        let expired_key = self.current_key.clone();
        tokio::spawn(async move {
            loop {
                sleep(KEY_WATCH_INTERVAL).await;
                match secrets::riot_api_key() {
                    Ok(key) if key != expired_key => {
                        info!("replacement riot api key found");
                        let _ = control_tx.send(ControlMessage::KeyReloaded(key));
                        return;
                    }
                    _ => debug!("waiting for a replacement riot api key"),
                }
            }
        });
    }

    fn status(&self, text: &str) {
        info!(status = text, "status update");
        let _ = self.overlay.send(OverlayMessage::StatusUpdate {
            text: text.to_owned(),
        });
    }
}

fn cloud_summoner_url(region: &str, puuid: &str) -> String {
    format!("https://{region}.api.riotgames.com/lol/summoner/v4/summoners/by-puuid/{puuid}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
