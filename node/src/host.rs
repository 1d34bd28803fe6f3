use std::{
    io::ErrorKind,
    net::{IpAddr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use iothub_node_common::{
    http::{Method as PortalMethod, TransportError},
    mqtt_username, ActivePortal, ByteStorage, ConfigPortal, ConfigStore, DeviceConfig,
    InertPortal, NetworkLink, NodeAction, NodeRuntime, NodeTimings, PendingRequest,
    PortalRequest, PortalResponse, Reading, RegionBuffer, RequestQueue, StorageError,
    BUILD_OPTIONS,
};

use crate::clock::Uptime;

const EEPROM_FILE: &str = "eeprom.bin";
const REQUEST_QUEUE_DEPTH: usize = 16;
const MQTT_QUEUE_DEPTH: usize = 32;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let uptime = Uptime::start();

    let options = BUILD_OPTIONS;
    let data_dir = std::env::var("NODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.iothub-node"));

    let mut store = ConfigStore::new(FileRegion::new(data_dir.join(EEPROM_FILE)), options);
    let mut config = DeviceConfig::default();
    match store.load(&mut config) {
        Ok(outcome) => info!("configuration loaded ({outcome:?})"),
        Err(err) => warn!("failed to seed configuration storage, using defaults: {err}"),
    }

    let mut timings = NodeTimings::default();
    if let Some(interval) = env_parse::<u64>("NODE_TELEMETRY_INTERVAL_MS") {
        timings.telemetry_interval_ms = interval;
    }

    let portal: Box<dyn ConfigPortal> = if options.http_config_server {
        let port = env_parse::<u16>("NODE_HTTP_PORT").unwrap_or(8080);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        Box::new(ActivePortal::new(AxumQueue::new(addr), store))
    } else {
        info!("http configuration server disabled at build time");
        Box::new(InertPortal)
    };

    let publisher = Publisher::from_env(&config);
    let link = HostLink::detect();
    let mut runtime = NodeRuntime::new(config, portal, timings);
    info!(
        "node started, telemetry every {} ms, address {:?}",
        timings.telemetry_interval_ms,
        link.local_address()
    );

    let mut interval = tokio::time::interval(Duration::from_millis(timings.poll_interval_ms));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut samples: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
        }

        let actions = runtime.tick(uptime.now_ms(), Utc::now(), &link, || {
            samples = samples.wrapping_add(1);
            // Hardware integration point: no sensor on the host build.
            Reading::simulated(samples)
        });

        for action in actions {
            apply_action(&publisher, action);
        }
    }
}

fn apply_action(publisher: &Publisher, action: NodeAction) {
    match action {
        NodeAction::PortalStarted => info!("configuration portal listening"),
        NodeAction::PortalFailed { error } => {
            warn!("configuration portal failed to start: {error}")
        }
        NodeAction::PortalServed { requests, saved } => {
            debug!("portal answered {requests} request(s), {saved} save(s)")
        }
        NodeAction::Reconnect { ssid, .. } => {
            info!("wifi credentials updated for `{ssid}`; host networking is left as is")
        }
        NodeAction::Publish { topic, payload } => {
            if let Err(err) = publisher.publish(&topic, payload) {
                warn!("telemetry dropped: {err:#}");
            }
        }
        NodeAction::TelemetryDropped { error } => warn!("telemetry dropped: {error}"),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse::<T>().ok())
}

/// Flash emulation backed by a single file.
struct FileRegion {
    path: PathBuf,
    shadow: RegionBuffer,
}

impl FileRegion {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            shadow: RegionBuffer::new(),
        }
    }
}

impl ByteStorage for FileRegion {
    fn begin(&mut self, size: usize) -> Result<(), StorageError> {
        let path = &self.path;
        self.shadow.begin(size, |bytes| match std::fs::read(path) {
            Ok(raw) => {
                let len = raw.len().min(bytes.len());
                bytes[..len].copy_from_slice(&raw[..len]);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(file_error("read", path, err)),
        })
    }

    fn get(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        self.shadow.get(offset, buf)
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StorageError> {
        self.shadow.put(offset, bytes)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let bytes = self.shadow.bytes()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| file_error("create", parent, err))?;
        }

        // Write aside, then rename over the old record.
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, bytes).map_err(|err| file_error("write", &staging, err))?;
        std::fs::rename(&staging, &self.path).map_err(|err| file_error("rename", &staging, err))
    }
}

fn file_error(op: &str, path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Backend(format!("failed to {op} {}: {err}", path.display()))
}

/// Portal transport on axum. Every request, whatever its route, is handed to
/// the main loop, which owns the configuration and writes the answer.
struct AxumQueue {
    addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    sender: mpsc::Sender<PendingRequest>,
    receiver: mpsc::Receiver<PendingRequest>,
}

impl AxumQueue {
    fn new(addr: SocketAddr) -> Self {
        let (sender, receiver) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        Self {
            addr,
            local_addr: None,
            sender,
            receiver,
        }
    }
}

impl RequestQueue for AxumQueue {
    fn start(&mut self) -> Result<(), TransportError> {
        let listener = std::net::TcpListener::bind(self.addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        let app = Router::new()
            .fallback(forward_request)
            .with_state(self.sender.clone());

        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("portal http server stopped: {err}");
            }
        });

        self.local_addr = Some(local_addr);
        info!("portal listening on http://{local_addr}");
        Ok(())
    }

    fn try_next(&mut self) -> Option<PendingRequest> {
        self.receiver.try_recv().ok()
    }
}

async fn forward_request(
    State(queue): State<mpsc::Sender<PendingRequest>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let target = uri
        .path_and_query()
        .map(|target| target.as_str())
        .unwrap_or("/");
    let request = PortalRequest::from_target(PortalMethod::parse(method.as_str()), target, &body);

    let (reply, answer) = oneshot::channel();
    let pending = PendingRequest::new(request, move |response| {
        let _ = reply.send(response);
    });
    if queue.send(pending).await.is_err() {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "Node is shutting down");
    }

    match answer.await {
        Ok(response) => portal_response(response),
        Err(_) => text_response(StatusCode::SERVICE_UNAVAILABLE, "Node is shutting down"),
    }
}

fn portal_response(response: PortalResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response()
}

fn text_response(status: StatusCode, message: &'static str) -> Response {
    portal_response(PortalResponse::text(status.as_u16(), message))
}

/// The host is assumed to be online; the address is only reported in
/// telemetry.
struct HostLink {
    address: Option<IpAddr>,
}

impl HostLink {
    fn detect() -> Self {
        let address = env_parse::<IpAddr>("NODE_IP_ADDRESS").or_else(outbound_address);
        Self { address }
    }
}

impl NetworkLink for HostLink {
    fn is_connected(&self) -> bool {
        true
    }

    fn local_address(&self) -> Option<IpAddr> {
        self.address
    }
}

/// Source address the OS would pick for outbound traffic. Connecting a UDP
/// socket sends nothing.
fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

enum Publisher {
    Mqtt(AsyncClient),
    Log,
}

impl Publisher {
    /// Connects to `MQTT_HOST` when set. Without it, payloads are only logged.
    fn from_env(config: &DeviceConfig) -> Self {
        let Ok(mqtt_host) = std::env::var("MQTT_HOST") else {
            info!("MQTT_HOST not set; telemetry will be logged only");
            return Self::Log;
        };
        let mqtt_port = env_parse::<u16>("MQTT_PORT").unwrap_or(1883);

        let client_id = match config.device_id.as_str() {
            "" => "iothub-node",
            device_id => device_id,
        };
        let mut mqtt_options = MqttOptions::new(client_id, mqtt_host, mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let user = std::env::var("MQTT_USER").unwrap_or_else(|_| {
            mqtt_username(config.iothub_host.as_str(), config.device_id.as_str())
        });
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, MQTT_QUEUE_DEPTH);
        tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    warn!("node mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        });

        Self::Mqtt(client)
    }

    /// Never waits on the broker: while it is unreachable the request queue
    /// fills and further messages are refused.
    fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        match self {
            Self::Mqtt(client) => client
                .try_publish(topic, QoS::AtLeastOnce, false, payload)
                .with_context(|| format!("mqtt queue refused publish on {topic}")),
            Self::Log => {
                info!("telemetry {topic}: {payload}");
                Ok(())
            }
        }
    }
}
