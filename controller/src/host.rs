use std::{
    collections::BTreeMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use loadctl_common::{
    Clock, ControllerAction, ControllerStatus, DeviceIdentity, FetchOutcome, FetchRequest,
    HttpResponse, LoadController, RandomJitter, RelayActuator, RelayCommand, RuntimeConfig,
    ScheduleDocument, TransportFailure, UnixTime,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::AbortHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::clock::TimezoneClock;

/// Exit status that asks the supervisor to restart the process.
const REBOOT_EXIT_CODE: i32 = 75;
const TRANSPORT_TIMEOUT: i32 = -2;
const TRANSPORT_OTHER: i32 = -1;

#[derive(Clone)]
struct AppState {
    snapshot: watch::Receiver<Snapshot>,
    timezone: &'static str,
}

struct AppStore {
    runtime_path: PathBuf,
}

#[derive(Debug, Clone)]
struct Snapshot {
    status: ControllerStatus,
    document: Option<Arc<ScheduleDocument>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    timezone: &'static str,
    #[serde(flatten)]
    status: ControllerStatus,
}

struct FetchCompletion {
    request_id: u64,
    result: Result<HttpResponse, TransportFailure>,
}

/// Relay outputs that only exist in the log.
#[derive(Debug, Default)]
struct SimulatedRelays {
    states: BTreeMap<u8, bool>,
}

impl RelayActuator for SimulatedRelays {
    fn set_relay(&mut self, switch_index: u8, on: bool) {
        let previous = self.states.insert(switch_index, on);
        info!(
            switch = switch_index,
            on,
            changed = previous != Some(on),
            "relay set"
        );
    }
}

#[derive(Clone)]
struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(loadctl_common::fetcher::CLIENT_VERSION)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn get(&self, request: &FetchRequest) -> Result<HttpResponse, TransportFailure> {
        let response = self
            .client
            .get(&request.url)
            .timeout(Duration::from_secs(u64::from(request.timeout_sec)))
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport_failure)?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let identity = DeviceIdentity::new(
        &std::env::var("LOADCTL_DEVICE_MAC").unwrap_or_default(),
        "host",
        env!("CARGO_PKG_VERSION"),
    );
    if !identity.has_mac() {
        anyhow::bail!(
            "LOADCTL_DEVICE_MAC must be set to the device MAC registered with the service"
        );
    }

    let clock = TimezoneClock::new(&runtime.timezone);
    if clock.name() != runtime.timezone {
        warn!("unknown timezone `{}`, using {}", runtime.timezone, clock.name());
    }

    info!(
        endpoint = %runtime.controller.api_endpoint,
        mac = %identity.mac,
        period_ms = runtime.controller.update_period_ms,
        "controller configured"
    );

    let transport = ReqwestTransport::new()?;
    let controller = LoadController::new(
        runtime.controller.clone(),
        identity,
        RandomJitter::from_os_rng(),
    );
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::capture(&controller));

    tokio::spawn(control_loop(
        controller,
        clock,
        SimulatedRelays::default(),
        transport,
        snapshot_tx,
    ));

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/schedule", get(handle_get_schedule))
        .with_state(AppState {
            snapshot: snapshot_rx,
            timezone: clock.name(),
        });

    let port = std::env::var("LOADCTL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind diagnostics server at {addr}"))?;

    info!("diagnostics listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn control_loop(
    mut controller: LoadController<RandomJitter>,
    clock: TimezoneClock,
    mut relays: SimulatedRelays,
    transport: ReqwestTransport,
    snapshot_tx: watch::Sender<Snapshot>,
) {
    let (done_tx, mut done_rx) = mpsc::channel::<FetchCompletion>(4);
    let mut in_flight: Option<(u64, AbortHandle)> = None;

    let mut interval =
        tokio::time::interval(Duration::from_millis(controller.config().update_period_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let reading = clock.now();
                if !reading.is_plausible() {
                    warn!(unix = reading.unix, "clock not synchronized, skipping tick");
                    continue;
                }

                for action in controller.tick(reading) {
                    match action {
                        ControllerAction::Fetch(request) => {
                            debug!(id = request.id, url = %request.url, "schedule fetch issued");
                            let id = request.id;
                            let transport = transport.clone();
                            let done_tx = done_tx.clone();
                            let task = tokio::spawn(async move {
                                let result = transport.get(&request).await;
                                let _ = done_tx
                                    .send(FetchCompletion {
                                        request_id: request.id,
                                        result,
                                    })
                                    .await;
                            });
                            in_flight = Some((id, task.abort_handle()));
                        }
                        ControllerAction::AbandonFetch { request_id } => {
                            warn!(id = request_id, "schedule fetch hung, abandoning");
                            if let Some((id, task)) = in_flight.take() {
                                if id == request_id {
                                    task.abort();
                                } else {
                                    in_flight = Some((id, task));
                                }
                            }
                        }
                        ControllerAction::SetRelay(command) => apply_relay(&mut relays, &command),
                        ControllerAction::Reboot { valid_until } => reboot(valid_until),
                    }
                }
            }
            Some(completion) = done_rx.recv() => {
                if in_flight.as_ref().map(|(id, _)| *id) == Some(completion.request_id) {
                    in_flight = None;
                }
                let outcome = controller.complete_fetch(completion.request_id, completion.result);
                log_outcome(completion.request_id, &outcome);
            }
        }

        snapshot_tx.send_replace(Snapshot::capture(&controller));
    }
}

fn apply_relay(relays: &mut SimulatedRelays, command: &RelayCommand) {
    debug!(
        switch = command.switch_index,
        on = command.on,
        cause = command.cause.as_str(),
        "relay command"
    );
    relays.apply(command);
}

fn log_outcome(request_id: u64, outcome: &FetchOutcome) {
    match outcome {
        FetchOutcome::Updated { .. } => info!(id = request_id, "{}", outcome.describe()),
        FetchOutcome::NotModified | FetchOutcome::Superseded => {
            debug!(id = request_id, "{}", outcome.describe())
        }
        FetchOutcome::Rejected { .. }
        | FetchOutcome::TransportError(_)
        | FetchOutcome::Malformed(_) => warn!(id = request_id, "{}", outcome.describe()),
    }
}

fn reboot(valid_until: UnixTime) -> ! {
    error!(valid_until, "schedule expired without refresh, restarting");
    std::process::exit(REBOOT_EXIT_CODE)
}

fn transport_failure(err: reqwest::Error) -> TransportFailure {
    let code = if err.is_timeout() {
        TRANSPORT_TIMEOUT
    } else {
        TRANSPORT_OTHER
    };
    TransportFailure::new(code, err.to_string())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(endpoint) = std::env::var("LOADCTL_API_ENDPOINT") {
        runtime.controller.api_endpoint = endpoint;
    }
    if let Ok(timezone) = std::env::var("LOADCTL_TIMEZONE") {
        runtime.timezone = timezone;
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.snapshot.borrow().status.clone();
    Json(StatusView {
        timezone: state.timezone,
        status,
    })
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let document = state.snapshot.borrow().document.clone();
    match document {
        Some(document) => Json(&*document).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No schedule loaded yet"),
    }
}

impl Snapshot {
    fn capture(controller: &LoadController<RandomJitter>) -> Self {
        Self {
            status: controller.status(),
            document: controller.document(),
        }
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("LOADCTL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.loadctl"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw).with_context(|| {
                format!("invalid runtime config at {}", self.runtime_path.display())
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
