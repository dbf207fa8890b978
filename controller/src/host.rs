use std::{
    future::IntoFuture,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use heating_common::{
    config::NetworkConfig, HeatingEngine, RelayDriver, RelayOutput, RuntimeConfig, Schedule,
    TemperatureAggregator, TriggerSink, TOPIC_OUTSIDE_TEMP, TOPIC_SENSOR_WILDCARD,
};

use crate::{
    calendar::FileCalendar,
    error::FatalError,
    relay::UsbRelayBoard,
    sensors::{find_sensors, poll_sensors, MqttSensor, SensorHub},
    triggers::{Request, RequestQueue, TokioTriggers},
};

type Relay = RelayOutput<Box<dyn RelayDriver>>;

const GOOG_CHANNEL_ID: &str = "x-goog-channel-id";
const GOOG_RESOURCE_STATE: &str = "x-goog-resource-state";

/// Engine plus its trigger table; locked together for every evaluation.
struct Processor {
    engine: HeatingEngine,
    triggers: TokioTriggers,
}

#[derive(Clone)]
struct AppState {
    processor: Arc<Mutex<Processor>>,
    relay: Arc<Relay>,
    hub: SensorHub,
    calendar: Arc<FileCalendar>,
    refresh_lock: Arc<Mutex<()>>,
    queue: RequestQueue,
    runtime: Arc<RuntimeConfig>,
}

#[derive(Clone)]
struct AppStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
}

/// Switches every relay channel off when dropped, including while unwinding
/// from a panic.
struct RelaysOffGuard(Arc<Relay>);

impl Drop for RelaysOffGuard {
    fn drop(&mut self) {
        if let Err(err) = self.0.force_all_off() {
            error!(alert = true, "failed to switch relays off on exit: {err}");
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> Result<(), FatalError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.network);
    runtime.sanitize();

    let board: Box<dyn RelayDriver> = Box::new(UsbRelayBoard::find(&runtime.relay)?);
    let relay: Arc<Relay> = Arc::new(RelayOutput::new(board));
    relay.force_all_off()?;

    let _relays_off = RelaysOffGuard(relay.clone());
    serve(&store, runtime, relay).await
}

async fn serve(
    store: &AppStore,
    runtime: RuntimeConfig,
    relay: Arc<Relay>,
) -> Result<(), FatalError> {
    let hub = SensorHub::new(Duration::from_secs(runtime.sensors.stale_seconds));
    let sensors = find_sensors(&runtime.sensors, &hub)?;
    let aggregator =
        TemperatureAggregator::new(runtime.sensors.ids.clone(), runtime.sensors.max_failures)?;

    let (queue, requests) = RequestQueue::new();
    let processor = Processor {
        engine: HeatingEngine::new(runtime.heating.clone()),
        triggers: TokioTriggers::new(queue.clone()),
    };

    let mut mqtt_options = MqttOptions::new(
        "heating-controller",
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    subscribe_topics(&mqtt).await?;

    let port = runtime.network.http_port;
    let app_state = AppState {
        processor: Arc::new(Mutex::new(processor)),
        relay,
        hub,
        calendar: Arc::new(FileCalendar::new(&store.data_dir, &runtime.calendar)),
        refresh_lock: Arc::new(Mutex::new(())),
        queue,
        runtime: Arc::new(runtime),
    };

    let app = Router::new()
        .route("/current_temp", get(handle_current_temp))
        .route("/desired_temp", get(handle_desired_temp))
        .route("/proportion", get(handle_proportion))
        .route("/heating_status", get(handle_heating_status))
        .route("/preheat_status", get(handle_preheat_status))
        .route("/outside_temp", get(handle_outside_temp))
        .route("/api/status", get(handle_get_status))
        .route("/refresh/events", post(handle_refresh_events))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;
    info!("status server listening on http://{addr}");

    // Every loop lives inside this select so none can touch the relays once
    // it returns.
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("shutdown requested");
                Ok(())
            }
            Err(err) => Err(FatalError::Other(
                anyhow::Error::new(err).context("failed to listen for shutdown signal"),
            )),
        },
        result = drain_requests(app_state.clone(), requests) => result,
        result = run_sensor_loop(app_state.clone(), sensors, aggregator) => result,
        result = run_calendar_loop(app_state.clone()) => result,
        result = run_process_tick(app_state.clone()) => result,
        result = run_mqtt_loop(app_state.hub.clone(), eventloop) => result,
        result = axum::serve(listener, app).into_future() => {
            result.context("status server failed").map_err(FatalError::from)
        }
    };

    app_state.processor.lock().await.triggers.cancel_all();
    outcome
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_SENSOR_WILDCARD, TOPIC_OUTSIDE_TEMP] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

async fn run_mqtt_loop(
    hub: SensorHub,
    mut eventloop: rumqttc::EventLoop,
) -> Result<(), FatalError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                if let Err(err) = hub.handle_message(&message.topic, &message.payload) {
                    warn!("mqtt message handling error: {err:#}");
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("mqtt connected");
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Serially applies queued requests so evaluations never interleave.
///
/// Calendar refreshes run on their own task; they enqueue a re-evaluation
/// once the new schedule is installed.
async fn drain_requests(
    state: AppState,
    mut requests: mpsc::Receiver<Request>,
) -> Result<(), FatalError> {
    while let Some(request) = requests.recv().await {
        match request {
            Request::Reevaluate => process(&state).await,
            Request::RefreshEvents => {
                let state = state.clone();
                tokio::spawn(async move { refresh_events(&state).await });
            }
        }
    }
    Err(anyhow::anyhow!("request queue closed").into())
}

async fn process(state: &AppState) {
    let mut processor = state.processor.lock().await;
    let Processor { engine, triggers } = &mut *processor;
    match engine.process(Utc::now(), state.relay.as_ref(), triggers) {
        Ok(decision) => debug!("processed: {decision:?}"),
        Err(err) => warn!("relay command failed, next pass retries: {err}"),
    }
}

async fn refresh_events(state: &AppState) {
    let max_events = state.runtime.heating.max_events;
    let entries = {
        let _guard = state.refresh_lock.lock().await;
        match state
            .calendar
            .fetch_upcoming_events(Utc::now(), max_events)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!("calendar refresh failed, keeping current schedule: {err:#}");
                return;
            }
        }
    };

    let now = Utc::now();
    let schedule = Schedule::from_entries(&entries, now, max_events);
    {
        let mut processor = state.processor.lock().await;
        let Processor { engine, triggers } = &mut *processor;
        engine.update_schedule(schedule, now, triggers);
    }
    state.queue.request(Request::Reevaluate);
}

async fn run_sensor_loop(
    state: AppState,
    sensors: Vec<MqttSensor>,
    mut aggregator: TemperatureAggregator,
) -> Result<(), FatalError> {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.runtime.update_temperature_interval_seconds,
    ));
    loop {
        interval.tick().await;
        let current = poll_sensors(&sensors, &state.runtime.sensors, &mut aggregator).await?;
        debug!("inside temperature {current:?}");
        state
            .processor
            .lock()
            .await
            .engine
            .update_temperature(current);
        state.queue.request(Request::Reevaluate);
    }
}

async fn run_calendar_loop(state: AppState) -> Result<(), FatalError> {
    let mut interval = tokio::time::interval(Duration::from_secs(
        state.runtime.update_calendar_interval_seconds,
    ));
    loop {
        interval.tick().await;
        refresh_events(&state).await;
    }
}

async fn run_process_tick(state: AppState) -> Result<(), FatalError> {
    let mut interval =
        tokio::time::interval(Duration::from_secs(state.runtime.process_interval_seconds));
    loop {
        interval.tick().await;
        state.queue.request(Request::Reevaluate);
    }
}

fn render_reading(value: Option<f32>) -> String {
    match value {
        Some(value) => format!("{value}\n"),
        None => "unknown\n".to_string(),
    }
}

fn render_switch(on: bool) -> String {
    if on { "on\n" } else { "off\n" }.to_string()
}

async fn handle_current_temp(State(state): State<AppState>) -> String {
    let processor = state.processor.lock().await;
    render_reading(processor.engine.state().current_temperature)
}

async fn handle_desired_temp(State(state): State<AppState>) -> String {
    let processor = state.processor.lock().await;
    format!("{}\n", processor.engine.state().desired)
}

async fn handle_proportion(State(state): State<AppState>) -> String {
    let processor = state.processor.lock().await;
    format!("{}\n", processor.engine.state().proportional_minutes)
}

async fn handle_heating_status(State(state): State<AppState>) -> String {
    let processor = state.processor.lock().await;
    render_switch(processor.engine.state().relay_status)
}

async fn handle_preheat_status(State(state): State<AppState>) -> String {
    let processor = state.processor.lock().await;
    render_switch(processor.engine.state().preheat_status)
}

async fn handle_outside_temp(State(state): State<AppState>) -> String {
    render_reading(state.hub.outside())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = state.runtime.timezone.as_str();
    let offset = timezone_offset(timezone).unwrap_or_else(|| Utc.fix());
    let outside = state.hub.outside();

    let status = {
        let processor = state.processor.lock().await;
        processor.engine.status(outside, timezone, &offset)
    };
    Json(status)
}

async fn handle_refresh_events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::response::Response {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    let expected = state.runtime.calendar.webhook_channel_id.as_str();
    if !expected.is_empty() && header(GOOG_CHANNEL_ID) != Some(expected) {
        warn!(
            "ignoring calendar notification for channel {:?}",
            header(GOOG_CHANNEL_ID)
        );
        return error_response(StatusCode::NOT_FOUND, "unknown channel");
    }
    if header(GOOG_RESOURCE_STATE) == Some("sync") {
        debug!("calendar notification channel synced");
        return StatusCode::OK.into_response();
    }

    info!("calendar changed, refreshing events");
    state.queue.request(Request::RefreshEvents);
    StatusCode::OK.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATING_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heating"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir: Arc::new(data_dir),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        load_runtime_config(&self.runtime_path).await
    }
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("malformed {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    let port = |name: &str| {
        std::env::var(name)
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
    };
    if let Some(mqtt_port) = port("MQTT_PORT") {
        network.mqtt_port = mqtt_port;
    }
    if let Some(http_port) = port("HEATING_HTTP_PORT") {
        network.http_port = http_port;
    }
}

fn timezone_offset(timezone: &str) -> Option<FixedOffset> {
    let tz: Tz = timezone.parse().ok()?;
    Some(Utc::now().with_timezone(&tz).offset().fix())
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
