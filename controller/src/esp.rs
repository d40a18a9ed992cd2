use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};

use loadctl_common::{
    config::NetworkConfig, Clock, ControllerAction, DeviceIdentity, FetchOutcome, FetchRequest,
    HttpResponse, LoadController, RandomJitter, RelayActuator, RelayHardwareConfig, RuntimeConfig,
    Transport, TransportFailure, UnixTime,
};

use crate::clock::TimezoneClock;

const NVS_NAMESPACE: &str = "loadctl";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_SCHEDULE_BODY: usize = 32 * 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const STATUS_LOG_INTERVAL_MS: u64 = 60_000;
const LOOP_SLEEP_MS: u64 = 200;
const TRANSPORT_CONNECT: i32 = -1;
const TRANSPORT_READ: i32 = -2;
const TRANSPORT_BODY_TOO_LARGE: i32 = -3;

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

struct FetchCompletion {
    request_id: u64,
    result: Result<HttpResponse, TransportFailure>,
}

/// Relay outputs on GPIO. Switch index `i` drives `pins[i]`.
struct GpioRelays {
    outputs: Vec<Option<PinDriver<'static, AnyOutputPin, Output>>>,
    active_low: bool,
}

impl GpioRelays {
    fn new(config: &RelayHardwareConfig) -> Self {
        let outputs = config
            .pins
            .iter()
            .map(|pin| match unsafe { PinDriver::output(AnyOutputPin::new(*pin)) } {
                Ok(driver) => Some(driver),
                Err(err) => {
                    warn!("relay output unavailable on GPIO{pin}: {err}");
                    None
                }
            })
            .collect();

        Self {
            outputs,
            active_low: config.active_low,
        }
    }
}

impl RelayActuator for GpioRelays {
    fn set_relay(&mut self, switch_index: u8, on: bool) {
        let Some(Some(output)) = self.outputs.get_mut(switch_index as usize) else {
            warn!("no relay output configured for switch {switch_index}, ignoring");
            return;
        };

        let result = if on != self.active_low {
            output.set_high()
        } else {
            output.set_low()
        };

        match result {
            Ok(()) => info!("switch {switch_index} -> {}", if on { "ON" } else { "OFF" }),
            Err(err) => warn!("failed to drive relay for switch {switch_index}: {err}"),
        }
    }
}

struct EspTransport;

impl Transport for EspTransport {
    fn get(&mut self, request: &FetchRequest) -> Result<HttpResponse, TransportFailure> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(u64::from(request.timeout_sec))),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf)
            .map_err(|err| TransportFailure::new(TRANSPORT_CONNECT, format!("{err:?}")))?;
        let mut client = HttpClient::wrap(connection);

        let mut response = client
            .request(Method::Get, &request.url, &[])
            .and_then(|req| req.submit())
            .map_err(|err| TransportFailure::new(TRANSPORT_CONNECT, format!("{err:?}")))?;
        let status = response.status();

        let mut body = Vec::new();
        let mut chunk = [0_u8; 1024];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| TransportFailure::new(TRANSPORT_READ, format!("{err:?}")))?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_SCHEDULE_BODY {
                return Err(TransportFailure::new(
                    TRANSPORT_BODY_TOO_LARGE,
                    format!("schedule body exceeds {MAX_SCHEDULE_BODY} bytes"),
                ));
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse { status, body })
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, endpoint=`{}`, relays={:?}",
        runtime.network.wifi_ssid, runtime.controller.api_endpoint, runtime.relays.pins,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let relays = GpioRelays::new(&runtime.relays);

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    let mac = wifi
        .sta_netif()
        .get_mac()
        .context("failed to read station MAC")?;
    let identity = DeviceIdentity::new(
        &mac.iter().map(|byte| format!("{byte:02X}")).collect::<String>(),
        chip_model(),
        env!("CARGO_PKG_VERSION"),
    );
    if !identity.has_mac() {
        return Err(anyhow!("station MAC is empty"));
    }
    info!("device identity: mac={} model={}", identity.mac, identity.model);

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let clock = TimezoneClock::new(&runtime.timezone);
    if clock.name() != runtime.timezone {
        warn!("unknown timezone `{}`, using {}", runtime.timezone, clock.name());
    }

    let (request_tx, request_rx) = mpsc::channel::<FetchRequest>();
    let (done_tx, done_rx) = mpsc::channel::<FetchCompletion>();
    spawn_fetch_worker(EspTransport, request_rx, done_tx)?;

    let controller = LoadController::new(
        runtime.controller.clone(),
        identity,
        RandomJitter::from_os_rng(),
    );
    spawn_control_loop(controller, clock, relays, request_tx, done_rx)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn chip_model() -> &'static str {
    if cfg!(esp32s3) {
        "ESP32-S3"
    } else {
        "ESP32"
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn spawn_fetch_worker(
    mut transport: impl Transport + Send + 'static,
    requests: Receiver<FetchRequest>,
    completions: Sender<FetchCompletion>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("schedule-fetch".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            for request in requests {
                debug!("fetching {}", request.url);
                let result = transport.get(&request);
                if completions
                    .send(FetchCompletion {
                        request_id: request.id,
                        result,
                    })
                    .is_err()
                {
                    break;
                }
            }
        })
        .context("failed to spawn fetch worker thread")?;
    Ok(())
}

fn spawn_control_loop(
    mut controller: LoadController<RandomJitter>,
    clock: TimezoneClock,
    mut relays: GpioRelays,
    requests: Sender<FetchRequest>,
    completions: Receiver<FetchCompletion>,
) -> anyhow::Result<()> {
    let period_ms = controller.config().update_period_ms;

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_tick_ms: Option<u64> = None;
            let mut last_status_log_ms = 0_u64;
            let mut wifi_disconnected_since_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if is_wifi_station_connected() {
                    wifi_disconnected_since_ms = None;
                } else if let Some(disconnected_since_ms) = wifi_disconnected_since_ms {
                    if now_ms.saturating_sub(disconnected_since_ms) >= WIFI_RESTART_GRACE_MS {
                        warn!(
                            "wifi disconnected for {}s; restarting device for recovery",
                            WIFI_RESTART_GRACE_MS / 1000
                        );
                        restart();
                    }
                } else {
                    wifi_disconnected_since_ms = Some(now_ms);
                }

                loop {
                    match completions.try_recv() {
                        Ok(completion) => {
                            let outcome = controller
                                .complete_fetch(completion.request_id, completion.result);
                            log_outcome(completion.request_id, &outcome);
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            error!("fetch worker exited; restarting");
                            restart();
                        }
                    }
                }

                let due = last_tick_ms
                    .map_or(true, |last| now_ms.saturating_sub(last) >= period_ms);
                if due {
                    last_tick_ms = Some(now_ms);
                    let reading = clock.now();
                    if reading.is_plausible() {
                        for action in controller.tick(reading) {
                            match action {
                                ControllerAction::Fetch(request) => {
                                    if requests.send(request).is_err() {
                                        error!("fetch worker exited; restarting");
                                        restart();
                                    }
                                }
                                ControllerAction::AbandonFetch { request_id } => {
                                    warn!("schedule fetch {request_id} hung, abandoning");
                                }
                                ControllerAction::SetRelay(command) => {
                                    debug!(
                                        "switch {} command ({})",
                                        command.switch_index,
                                        command.cause.as_str()
                                    );
                                    relays.apply(&command);
                                }
                                ControllerAction::Reboot { valid_until } => reboot(valid_until),
                            }
                        }
                    } else {
                        warn!("clock not synchronized yet ({}), skipping tick", reading.unix);
                    }
                }

                if now_ms.saturating_sub(last_status_log_ms) >= STATUS_LOG_INTERVAL_MS {
                    last_status_log_ms = now_ms;
                    match serde_json::to_string(&controller.status()) {
                        Ok(status) => info!("status {status}"),
                        Err(err) => warn!("status serialization failed: {err}"),
                    }
                }

                thread::sleep(Duration::from_millis(LOOP_SLEEP_MS));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn log_outcome(request_id: u64, outcome: &FetchOutcome) {
    match outcome {
        FetchOutcome::Updated { .. } => info!("fetch {request_id}: {}", outcome.describe()),
        FetchOutcome::NotModified | FetchOutcome::Superseded => {
            debug!("fetch {request_id}: {}", outcome.describe())
        }
        FetchOutcome::Rejected { .. }
        | FetchOutcome::TransportError(_)
        | FetchOutcome::Malformed(_) => warn!("fetch {request_id}: {}", outcome.describe()),
    }
}

fn reboot(valid_until: UnixTime) -> ! {
    error!("schedule expired at {valid_until} without refresh, restarting");
    restart()
}

fn restart() -> ! {
    thread::sleep(Duration::from_millis(100));
    esp_idf_svc::hal::reset::restart()
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
