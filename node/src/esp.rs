use core::convert::TryInto;
use std::{
    net::IpAddr,
    sync::mpsc::{self, Receiver, SyncSender},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{modem::Modem, prelude::Peripherals};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use iothub_node_common::{
    http::{Method as PortalMethod, TransportError},
    mqtt_username, ActivePortal, ByteStorage, ConfigPortal, ConfigStore, DeviceConfig,
    InertPortal, NetworkLink, NodeAction, NodeRuntime, NodeTimings, PendingRequest,
    PortalRequest, PortalResponse, Reading, RegionBuffer, RequestQueue, StorageError,
    BUILD_OPTIONS, IOTHUB_MQTT_PORT,
};

use crate::clock::Uptime;

const NVS_NAMESPACE: &str = "iothub";
const NVS_RECORD_KEY: &str = "config";

/// Pre-generated SAS token; signing one on the device is not supported.
const IOTHUB_SAS_TOKEN: Option<&str> = option_env!("IOTHUB_SAS_TOKEN");

const MAX_HTTP_BODY: usize = 4096;
const REQUEST_QUEUE_DEPTH: usize = 4;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
// Every method is registered so the portal, not the IDF server, answers
// unrouted requests with 404.
const ROUTED_METHODS: [(Method, PortalMethod); 7] = [
    (Method::Get, PortalMethod::Get),
    (Method::Post, PortalMethod::Post),
    (Method::Put, PortalMethod::Other),
    (Method::Delete, PortalMethod::Other),
    (Method::Head, PortalMethod::Other),
    (Method::Options, PortalMethod::Other),
    (Method::Patch, PortalMethod::Other),
];

const WATCHDOG_TIMEOUT_MS: u32 = 90_000;
const LINK_RESTART_AFTER_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    EspLogger::initialize_default();
    let uptime = Uptime::start();

    let options = BUILD_OPTIONS;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let region = NvsRegion::new(nvs_partition.clone()).context("failed to open nvs namespace")?;
    let mut store = ConfigStore::new(region, options);
    let mut config = DeviceConfig::default();
    match store.load(&mut config) {
        Ok(outcome) => info!("configuration loaded ({outcome:?})"),
        Err(err) => warn!("failed to seed configuration storage, using defaults: {err}"),
    }

    let watchdog = TaskWatchdog::arm(WATCHDOG_TIMEOUT_MS)?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut network = StationNetwork::start(modem, sys_loop, nvs_partition, watchdog)
        .context("wifi startup failed")?;
    if let Err(err) = network.connect(config.wifi_ssid.as_str(), config.wifi_password.as_str()) {
        warn!("wifi unavailable at boot, will keep retrying: {err:#}");
    }

    let _sntp = EspSntp::new_default().context("failed to start sntp")?;

    let timings = NodeTimings::default();
    let portal: Box<dyn ConfigPortal> = if options.http_config_server {
        Box::new(ActivePortal::new(EspQueue::new(), store))
    } else {
        info!("http configuration server disabled at build time");
        Box::new(InertPortal)
    };
    let mut runtime = NodeRuntime::new(config, portal, timings);
    let mut publisher = IotHubPublisher::default();

    let mut samples: u64 = 0;
    let mut supervisor = LinkSupervisor::default();

    loop {
        watchdog.feed();
        let now_ms = uptime.now_ms();
        if supervisor.outage_exceeded(network.is_connected(), now_ms) {
            warn!(
                "station link down for over {} s, rebooting",
                LINK_RESTART_AFTER_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            esp_idf_hal::reset::restart();
        }

        let actions = runtime.tick(now_ms, Utc::now(), &network, || {
            samples = samples.wrapping_add(1);
            // Hardware integration point: replace with a real sensor driver.
            Reading::simulated(samples)
        });

        for action in actions {
            match action {
                NodeAction::PortalStarted => info!("configuration portal listening on port 80"),
                NodeAction::PortalFailed { error } => {
                    warn!("configuration portal failed to start: {error}")
                }
                NodeAction::PortalServed { requests, saved } => {
                    debug!("portal answered {requests} request(s), {saved} save(s)")
                }
                NodeAction::Reconnect { ssid, password } => {
                    info!("configuration saved, reconnecting to `{ssid}`");
                    publisher.reset();
                    if let Err(err) = network.connect(&ssid, &password) {
                        warn!("wifi reconnect failed: {err:#}");
                    }
                }
                NodeAction::Publish { topic, payload } => {
                    let config = runtime.config();
                    let config = config.borrow();
                    match publisher.publish(&config, &topic, &payload) {
                        Ok(()) => info!("telemetry sent: {payload}"),
                        Err(err) => {
                            warn!("failed to publish telemetry: {err:#}");
                            publisher.reset();
                        }
                    }
                }
                NodeAction::TelemetryDropped { error } => warn!("telemetry dropped: {error}"),
            }
        }

        thread::sleep(Duration::from_millis(timings.poll_interval_ms));
    }
}

/// EEPROM-style region kept as one NVS blob.
struct NvsRegion {
    nvs: EspNvs<NvsDefault>,
    shadow: RegionBuffer,
}

impl NvsRegion {
    fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        Ok(Self {
            nvs: EspNvs::new(partition, NVS_NAMESPACE, true)?,
            shadow: RegionBuffer::new(),
        })
    }
}

impl ByteStorage for NvsRegion {
    fn begin(&mut self, size: usize) -> Result<(), StorageError> {
        let nvs = &self.nvs;
        self.shadow.begin(size, |bytes| {
            let stored_len = nvs
                .blob_len(NVS_RECORD_KEY)
                .map_err(|err| nvs_error("size", err))?;
            let Some(stored_len) = stored_len else {
                return Ok(());
            };

            let mut raw = vec![0_u8; stored_len];
            if let Some(stored) = nvs
                .get_raw(NVS_RECORD_KEY, &mut raw)
                .map_err(|err| nvs_error("read", err))?
            {
                let len = stored.len().min(bytes.len());
                bytes[..len].copy_from_slice(&stored[..len]);
            }
            Ok(())
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
        self.nvs
            .set_raw(NVS_RECORD_KEY, bytes)
            .map_err(|err| nvs_error("write", err))?;
        Ok(())
    }
}

fn nvs_error(op: &str, err: esp_idf_sys::EspError) -> StorageError {
    StorageError::Backend(format!("nvs {op} of `{NVS_RECORD_KEY}` failed: {err}"))
}

/// Portal transport on the IDF HTTP server. Handlers run on the server task
/// and block until the main loop has answered.
struct EspQueue {
    sender: SyncSender<PendingRequest>,
    receiver: Receiver<PendingRequest>,
    server: Option<EspHttpServer<'static>>,
}

impl EspQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::sync_channel(REQUEST_QUEUE_DEPTH);
        Self {
            sender,
            receiver,
            server: None,
        }
    }
}

impl RequestQueue for EspQueue {
    fn start(&mut self) -> Result<(), TransportError> {
        let conf = HttpConfiguration {
            stack_size: 10 * 1024,
            uri_match_wildcard: true,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        for (method, portal_method) in ROUTED_METHODS {
            let sender = self.sender.clone();
            server.fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
                let target = req.uri().to_owned();
                let response = match read_body(&mut req)? {
                    Some(body) => forward(
                        &sender,
                        PortalRequest::from_target(portal_method, &target, &body),
                    ),
                    None => PortalResponse::text(413, "Request body too large"),
                };

                req.into_response(
                    response.status,
                    None,
                    &[("Content-Type", response.content_type)],
                )?
                .write_all(response.body.as_bytes())?;
                Ok(())
            })?;
        }

        self.server = Some(server);
        Ok(())
    }

    fn try_next(&mut self) -> Option<PendingRequest> {
        self.receiver.try_recv().ok()
    }
}

fn forward(sender: &SyncSender<PendingRequest>, request: PortalRequest) -> PortalResponse {
    let (reply, answer) = mpsc::channel();
    let pending = PendingRequest::new(request, move |response| {
        let _ = reply.send(response);
    });
    let abandon = pending.abandon_flag();
    if sender.try_send(pending).is_err() {
        return PortalResponse::text(503, "Device busy");
    }

    answer.recv_timeout(RESPONSE_TIMEOUT).unwrap_or_else(|_| {
        // The client already got its answer; the main loop must not apply it.
        abandon.abandon();
        PortalResponse::text(503, "Device busy")
    })
}

/// Reads the declared body, or `None` when it is larger than the portal accepts.
fn read_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Option<Vec<u8>>> {
    let declared = req.content_len().unwrap_or(0);
    let Some(len) = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= MAX_HTTP_BODY)
    else {
        debug!("rejecting portal body of {declared} bytes");
        return Ok(None);
    };

    let mut body = vec![0_u8; len];
    req.read_exact(&mut body)?;
    Ok(Some(body))
}

struct StationNetwork {
    wifi: BlockingWifi<EspWifi<'static>>,
    watchdog: TaskWatchdog,
}

impl StationNetwork {
    fn start(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        watchdog: TaskWatchdog,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self { wifi, watchdog })
    }

    /// Applies station credentials and joins, dropping any current
    /// association first.
    fn connect(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        if ssid.is_empty() {
            return Err(anyhow!("wifi ssid is empty"));
        }

        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        if self.wifi.is_started()? {
            let _ = self.wifi.disconnect();
        }
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        info!("wifi started, connecting to `{ssid}`");

        let mut last_err = None;
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            self.watchdog.feed();
            match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err}");
                    last_err = Some(err);
                }
            }

            if attempt < WIFI_CONNECT_ATTEMPTS {
                let _ = self.wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }

        Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {last_err:?}"
        ))
    }
}

impl NetworkLink for StationNetwork {
    fn is_connected(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn local_address(&self) -> Option<IpAddr> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| IpAddr::V4(info.ip))
    }
}

/// IoT Hub MQTT session, opened on first publish and dropped whenever the
/// credentials or the link change.
#[derive(Default)]
struct IotHubPublisher {
    client: Option<EspMqttClient<'static>>,
}

impl IotHubPublisher {
    fn publish(&mut self, config: &DeviceConfig, topic: &str, payload: &str) -> anyhow::Result<()> {
        if self.client.is_none() {
            self.client = Some(connect_iothub(config)?);
        }
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow!("mqtt client unavailable"))?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes())
            .with_context(|| format!("failed to publish on {topic}"))?;
        Ok(())
    }

    fn reset(&mut self) {
        self.client = None;
    }
}

fn connect_iothub(config: &DeviceConfig) -> anyhow::Result<EspMqttClient<'static>> {
    let url = format!("mqtts://{}:{IOTHUB_MQTT_PORT}", config.iothub_host);
    let username = mqtt_username(config.iothub_host.as_str(), config.device_id.as_str());

    let conf = MqttClientConfiguration {
        client_id: Some(config.device_id.as_str()),
        username: Some(username.as_str()),
        password: IOTHUB_SAS_TOKEN,
        crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
        ..Default::default()
    };

    let (client, mut conn) = EspMqttClient::new(&url, &conf)?;
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(6144)
        .spawn(move || {
            // Ends once the client is dropped.
            while let Ok(event) = conn.next() {
                debug!("mqtt event: {:?}", event.payload());
            }
        })
        .context("failed to spawn mqtt thread")?;

    info!("mqtt session opened to {url}");
    Ok(client)
}

/// Main task's subscription to the IDF task watchdog. The device panics if
/// `feed` is not called within the armed timeout.
#[derive(Debug, Clone, Copy)]
struct TaskWatchdog;

impl TaskWatchdog {
    fn arm(timeout_ms: u32) -> anyhow::Result<Self> {
        let config = esp_idf_sys::esp_task_wdt_config_t {
            timeout_ms,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        wdt_result("init", unsafe { esp_idf_sys::esp_task_wdt_init(&config) })?;
        wdt_result("subscribe", unsafe {
            esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut())
        })?;
        info!("task watchdog armed ({} s)", timeout_ms / 1000);
        Ok(Self)
    }

    fn feed(self) {
        unsafe { esp_idf_sys::esp_task_wdt_reset() };
    }
}

// INVALID_STATE means the bootloader configuration already did this step.
fn wdt_result(step: &str, code: esp_idf_sys::esp_err_t) -> anyhow::Result<()> {
    if code == esp_idf_sys::ESP_OK || code == esp_idf_sys::ESP_ERR_INVALID_STATE {
        Ok(())
    } else {
        Err(anyhow!("task watchdog {step} failed with code {code}"))
    }
}

/// Tracks how long the station link has been down. Short outages are left to
/// the driver's own reconnect.
#[derive(Debug, Default)]
struct LinkSupervisor {
    down_since_ms: Option<u64>,
}

impl LinkSupervisor {
    fn outage_exceeded(&mut self, connected: bool, now_ms: u64) -> bool {
        if connected {
            self.down_since_ms = None;
            return false;
        }
        let down_since = *self.down_since_ms.get_or_insert(now_ms);
        now_ms.saturating_sub(down_since) >= LINK_RESTART_AFTER_MS
    }
}
