//! HTTP configuration portal bound to the live device configuration.

use std::{cell::RefCell, net::IpAddr, rc::Rc};

use thiserror::Error;

use crate::{
    config::{ConfigField, DeviceConfig},
    form::FormArgs,
    http::{Method, PortalRequest, PortalResponse, RequestQueue, TransportError},
    page::{render_config_page, SAVED_BANNER},
    storage::{ByteStorage, StorageError},
    store::ConfigStore,
};

/// The single live configuration, owned by the application and lent to the
/// portal and the telemetry formatter. All access happens on the main loop.
pub type SharedConfig = Rc<RefCell<DeviceConfig>>;

/// Upper bound on requests answered per `handle` call, so one tick stays
/// short even if clients keep queueing.
pub const MAX_REQUESTS_PER_TICK: usize = 8;

pub trait NetworkLink {
    fn is_connected(&self) -> bool;

    fn local_address(&self) -> Option<IpAddr> {
        None
    }
}

/// Level-triggered "reconnect requested" signal. Raising it twice still
/// leaves exactly one pending request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectFlag {
    raised: bool,
}

impl ReconnectFlag {
    pub fn raise(&mut self) {
        self.raised = true;
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }

    pub fn clear(&mut self) {
        self.raised = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Uninitialized,
    Serving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalTick {
    /// Nothing was pending, or the portal is not serving.
    Idle,
    Served { requests: usize, saved: usize },
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("failed to start http listener")]
    Transport(#[source] TransportError),
    #[error("failed to prepare configuration storage")]
    Storage(#[from] StorageError),
}

/// Operations every portal variant offers, active or inert.
pub trait ConfigPortal {
    /// Binds `config`, then starts serving if the network is up. Calling it
    /// again once serving, without a configuration, or while offline only
    /// updates the binding.
    fn begin(
        &mut self,
        config: Option<SharedConfig>,
        link: &dyn NetworkLink,
    ) -> Result<PortalState, PortalError>;

    /// Answers the requests currently queued, dropping the ones their client
    /// gave up on. Does nothing while offline.
    fn handle(&mut self, link: &dyn NetworkLink) -> PortalTick;

    fn state(&self) -> PortalState;

    fn should_reconnect(&self) -> bool;

    fn clear_reconnect_flag(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Root,
    Save,
    NotFound,
}

impl Route {
    fn resolve(method: Method, path: &str) -> Self {
        match (method, path) {
            (Method::Get, "/") => Self::Root,
            (Method::Post, "/save") => Self::Save,
            _ => Self::NotFound,
        }
    }
}

/// Portal backed by a real request queue and configuration store.
pub struct ActivePortal<Q, S> {
    queue: Q,
    store: ConfigStore<S>,
    config: Option<SharedConfig>,
    state: PortalState,
    reconnect: ReconnectFlag,
}

impl<Q: RequestQueue, S: ByteStorage> ActivePortal<Q, S> {
    pub fn new(queue: Q, store: ConfigStore<S>) -> Self {
        Self {
            queue,
            store,
            config: None,
            state: PortalState::Uninitialized,
            reconnect: ReconnectFlag::default(),
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn dispatch(&mut self, request: &PortalRequest) -> PortalResponse {
        match Route::resolve(request.method, &request.path) {
            Route::Root => self.render_root(),
            Route::Save => self.save(&request.args),
            Route::NotFound => PortalResponse::not_found(),
        }
    }

    pub fn render_root(&self) -> PortalResponse {
        match &self.config {
            Some(config) => PortalResponse::html(200, render_config_page(&config.borrow(), None)),
            None => PortalResponse::text(500, "Configuration unavailable"),
        }
    }

    /// Merges the submitted fields into a copy of the live configuration and
    /// persists it. Only a successful commit replaces the live values and
    /// raises the reconnect flag. Fields missing from `args` keep their
    /// current value.
    pub fn save(&mut self, args: &FormArgs) -> PortalResponse {
        let Some(config) = &self.config else {
            return PortalResponse::text(500, "Configuration unavailable");
        };

        let mut merged = *config.borrow();
        for field in ConfigField::ALL {
            if let Some(value) = args.get(field.form_name()) {
                merged.set(field, Some(value));
            }
        }

        if self.store.save(&merged).is_err() {
            return PortalResponse::text(500, "Failed to persist configuration");
        }

        *config.borrow_mut() = merged;
        self.reconnect.raise();
        PortalResponse::html(200, render_config_page(&merged, Some(SAVED_BANNER)))
    }
}

impl<Q: RequestQueue, S: ByteStorage> ConfigPortal for ActivePortal<Q, S> {
    fn begin(
        &mut self,
        config: Option<SharedConfig>,
        link: &dyn NetworkLink,
    ) -> Result<PortalState, PortalError> {
        self.config = config;
        if self.state == PortalState::Serving || self.config.is_none() || !link.is_connected() {
            return Ok(self.state);
        }

        self.store.ensure_ready()?;
        self.queue.start().map_err(PortalError::Transport)?;
        self.state = PortalState::Serving;
        Ok(self.state)
    }

    fn handle(&mut self, link: &dyn NetworkLink) -> PortalTick {
        if self.state != PortalState::Serving || !link.is_connected() {
            return PortalTick::Idle;
        }

        let mut polled = 0;
        let mut requests = 0;
        let mut saved = 0;
        while polled < MAX_REQUESTS_PER_TICK {
            let Some(pending) = self.queue.try_next() else {
                break;
            };
            polled += 1;
            if pending.is_abandoned() {
                continue;
            }

            let response = self.dispatch(&pending.request);
            if Route::resolve(pending.request.method, &pending.request.path) == Route::Save
                && response.status == 200
            {
                saved += 1;
            }
            pending.respond(response);
            requests += 1;
        }

        if requests == 0 {
            PortalTick::Idle
        } else {
            PortalTick::Served { requests, saved }
        }
    }

    fn state(&self) -> PortalState {
        self.state
    }

    fn should_reconnect(&self) -> bool {
        self.reconnect.is_raised()
    }

    fn clear_reconnect_flag(&mut self) {
        self.reconnect.clear();
    }
}

/// Portal for builds with the HTTP configuration server switched off. It
/// never listens, never touches storage and never requests a reconnect.
#[derive(Debug, Clone, Copy, Default)]
pub struct InertPortal;

impl ConfigPortal for InertPortal {
    fn begin(
        &mut self,
        _config: Option<SharedConfig>,
        _link: &dyn NetworkLink,
    ) -> Result<PortalState, PortalError> {
        Ok(PortalState::Uninitialized)
    }

    fn handle(&mut self, _link: &dyn NetworkLink) -> PortalTick {
        PortalTick::Idle
    }

    fn state(&self) -> PortalState {
        PortalState::Uninitialized
    }

    fn should_reconnect(&self) -> bool {
        false
    }

    fn clear_reconnect_flag(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{MemoryQueue, PendingRequest},
        options::BuildOptions,
        storage::MemoryRegion,
    };
    use pretty_assertions::assert_eq;
    use std::{cell::Cell, sync::mpsc};

    struct FakeLink {
        connected: Cell<bool>,
    }

    impl FakeLink {
        fn up() -> Self {
            Self {
                connected: Cell::new(true),
            }
        }

        fn down() -> Self {
            Self {
                connected: Cell::new(false),
            }
        }
    }

    impl NetworkLink for FakeLink {
        fn is_connected(&self) -> bool {
            self.connected.get()
        }
    }

    fn options() -> BuildOptions {
        BuildOptions {
            wifi_ssid: Some("factory-ssid"),
            wifi_password: Some("factory-pass"),
            iothub_fqdn: Some("hub.azure-devices.net"),
            device_id: Some("factory-device"),
            device_key: Some("factory-key"),
            device_latitude: Some("-23.5505"),
            device_longitude: Some("-46.6333"),
            http_config_server: true,
            storage_version: 2,
        }
    }

    fn shared_defaults() -> SharedConfig {
        Rc::new(RefCell::new(DeviceConfig::from_defaults(&options())))
    }

    fn portal() -> ActivePortal<MemoryQueue, MemoryRegion> {
        ActivePortal::new(
            MemoryQueue::new(),
            ConfigStore::new(MemoryRegion::erased(), options()),
        )
    }

    fn serving_portal(config: &SharedConfig) -> ActivePortal<MemoryQueue, MemoryRegion> {
        let mut portal = portal();
        let state = portal.begin(Some(config.clone()), &FakeLink::up()).unwrap();
        assert_eq!(state, PortalState::Serving);
        portal
    }

    fn enqueue(
        portal: &mut ActivePortal<MemoryQueue, MemoryRegion>,
        request: PortalRequest,
    ) -> mpsc::Receiver<PortalResponse> {
        let (tx, rx) = mpsc::channel();
        portal.queue_mut().push(PendingRequest::new(request, move |response| {
            let _ = tx.send(response);
        }));
        rx
    }

    fn save_request(pairs: &[(&str, &str)]) -> PortalRequest {
        PortalRequest::new(
            Method::Post,
            "/save",
            FormArgs::from_pairs(pairs.iter().copied()),
        )
    }

    #[test]
    fn begin_waits_for_network_and_configuration() {
        let config = shared_defaults();
        let mut portal = portal();

        assert_eq!(
            portal.begin(Some(config.clone()), &FakeLink::down()).unwrap(),
            PortalState::Uninitialized
        );
        assert_eq!(
            portal.begin(None, &FakeLink::up()).unwrap(),
            PortalState::Uninitialized
        );
        assert!(!portal.queue().is_started());

        assert_eq!(
            portal.begin(Some(config.clone()), &FakeLink::up()).unwrap(),
            PortalState::Serving
        );
        assert!(portal.queue().is_started());

        // Idempotent once serving.
        assert_eq!(
            portal.begin(Some(config), &FakeLink::up()).unwrap(),
            PortalState::Serving
        );
    }

    #[test]
    fn failed_transport_start_stays_uninitialized() {
        let config = shared_defaults();
        let mut portal = portal();
        portal.queue_mut().set_fail_start(true);

        let err = portal.begin(Some(config.clone()), &FakeLink::up()).unwrap_err();
        assert!(matches!(err, PortalError::Transport(_)));
        assert_eq!(portal.state(), PortalState::Uninitialized);

        portal.queue_mut().set_fail_start(false);
        assert_eq!(
            portal.begin(Some(config), &FakeLink::up()).unwrap(),
            PortalState::Serving
        );
    }

    #[test]
    fn root_renders_live_values() {
        let config = shared_defaults();
        let mut portal = serving_portal(&config);
        config
            .borrow_mut()
            .set(ConfigField::DeviceId, Some("renamed-node"));

        let rx = enqueue(&mut portal, PortalRequest::new(Method::Get, "/", FormArgs::default()));
        assert_eq!(
            portal.handle(&FakeLink::up()),
            PortalTick::Served {
                requests: 1,
                saved: 0
            }
        );

        let response = rx.recv().unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.contains("value='renamed-node'"));
        assert!(!response.body.contains(SAVED_BANNER));
    }

    #[test]
    fn partial_save_changes_only_submitted_field() {
        let config = shared_defaults();
        let before = *config.borrow();
        let mut portal = serving_portal(&config);

        let rx = enqueue(&mut portal, save_request(&[("device_id", "sensor-42")]));
        portal.handle(&FakeLink::up());

        let response = rx.recv().unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.contains(SAVED_BANNER));

        let mut expected = before;
        expected.set(ConfigField::DeviceId, Some("sensor-42"));
        assert_eq!(*config.borrow(), expected);
        assert!(portal.should_reconnect());
    }

    #[test]
    fn save_persists_merged_configuration() {
        let config = shared_defaults();
        let mut portal = serving_portal(&config);

        portal.save(&FormArgs::from_pairs([
            ("wifi_ssid", "field-net"),
            ("latitude", "-22.9068"),
            ("unknown", "ignored"),
        ]));

        let mut rebooted = ConfigStore::new(portal.store().storage().clone(), options());
        let mut reloaded = DeviceConfig::default();
        rebooted.load(&mut reloaded).unwrap();
        assert_eq!(reloaded, *config.borrow());
        assert_eq!(reloaded.get(ConfigField::WifiSsid), "field-net");
        assert_eq!(reloaded.get(ConfigField::Latitude), "-22.9068");
    }

    #[test]
    fn oversized_value_is_truncated() {
        let config = shared_defaults();
        let mut portal = serving_portal(&config);
        let long = "x".repeat(100);

        portal.save(&FormArgs::from_pairs([("latitude", long.as_str())]));

        assert_eq!(config.borrow().get(ConfigField::Latitude), "x".repeat(15));
    }

    #[test]
    fn reconnect_flag_is_a_level() {
        let config = shared_defaults();
        let mut portal = serving_portal(&config);

        portal.save(&FormArgs::from_pairs([("device_id", "a")]));
        portal.save(&FormArgs::from_pairs([("device_id", "b")]));
        assert!(portal.should_reconnect());

        portal.clear_reconnect_flag();
        assert!(!portal.should_reconnect());
    }

    #[test]
    fn save_without_configuration_is_server_error() {
        let mut portal = portal();

        let response = portal.save(&FormArgs::from_pairs([("device_id", "sensor-42")]));

        assert_eq!(response.status, 500);
        assert_eq!(response.content_type, crate::http::CONTENT_TYPE_TEXT);
        assert!(!portal.should_reconnect());
        assert_eq!(portal.store().storage().commit_count(), 0);
    }

    #[test]
    fn storage_failure_leaves_live_config_and_flag_alone() {
        let config = shared_defaults();
        let before = *config.borrow();
        let mut portal = ActivePortal::new(MemoryQueue::new(), {
            let mut region = MemoryRegion::erased();
            region.set_fail_commits(true);
            ConfigStore::new(region, options())
        });
        portal.begin(Some(config.clone()), &FakeLink::up()).unwrap();

        let response = portal.save(&FormArgs::from_pairs([
            ("wifi_ssid", "new-net"),
            ("device_id", "sensor-42"),
        ]));

        assert_eq!(response.status, 500);
        assert_eq!(response.body, "Failed to persist configuration");
        assert!(!portal.should_reconnect());
        assert_eq!(*config.borrow(), before);
    }

    #[test]
    fn abandoned_save_is_skipped() {
        let config = shared_defaults();
        let before = *config.borrow();
        let mut portal = serving_portal(&config);

        let (tx, rx) = mpsc::channel();
        let pending = PendingRequest::new(
            save_request(&[("wifi_ssid", "late-net"), ("device_id", "late-node")]),
            move |response| {
                let _ = tx.send(response);
            },
        );
        pending.abandon_flag().abandon();
        portal.queue_mut().push(pending);
        let commits = portal.store().storage().commit_count();

        assert_eq!(portal.handle(&FakeLink::up()), PortalTick::Idle);
        assert_eq!(portal.queue().pending(), 0);
        assert_eq!(*config.borrow(), before);
        assert!(!portal.should_reconnect());
        assert_eq!(portal.store().storage().commit_count(), commits);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_routes_are_not_found() {
        let config = shared_defaults();
        let mut portal = serving_portal(&config);

        for request in [
            PortalRequest::new(Method::Get, "/favicon.ico", FormArgs::default()),
            PortalRequest::new(Method::Post, "/", FormArgs::default()),
            PortalRequest::new(Method::Get, "/save", FormArgs::default()),
            PortalRequest::new(Method::Other, "/save", FormArgs::default()),
        ] {
            let response = portal.dispatch(&request);
            assert_eq!(response, PortalResponse::not_found());
        }
        assert!(!portal.should_reconnect());
    }

    #[test]
    fn handle_is_a_no_op_while_offline() {
        let config = shared_defaults();
        let mut portal = serving_portal(&config);
        let rx = enqueue(&mut portal, save_request(&[("device_id", "sensor-42")]));

        assert_eq!(portal.handle(&FakeLink::down()), PortalTick::Idle);
        assert_eq!(portal.queue().pending(), 1);
        assert_eq!(portal.state(), PortalState::Serving);

        assert_eq!(
            portal.handle(&FakeLink::up()),
            PortalTick::Served {
                requests: 1,
                saved: 1
            }
        );
        assert_eq!(rx.recv().unwrap().status, 200);
    }

    #[test]
    fn handle_before_begin_leaves_queue_alone() {
        let mut portal = portal();
        let _rx = enqueue(&mut portal, save_request(&[("device_id", "sensor-42")]));

        assert_eq!(portal.handle(&FakeLink::up()), PortalTick::Idle);
        assert_eq!(portal.queue().pending(), 1);
    }

    #[test]
    fn handle_is_bounded_per_tick() {
        let config = shared_defaults();
        let mut portal = serving_portal(&config);
        let receivers: Vec<_> = (0..MAX_REQUESTS_PER_TICK + 2)
            .map(|_| enqueue(&mut portal, PortalRequest::new(Method::Get, "/", FormArgs::default())))
            .collect();

        assert_eq!(
            portal.handle(&FakeLink::up()),
            PortalTick::Served {
                requests: MAX_REQUESTS_PER_TICK,
                saved: 0
            }
        );
        assert_eq!(portal.queue().pending(), 2);

        portal.handle(&FakeLink::up());
        for rx in receivers {
            assert_eq!(rx.recv().unwrap().status, 200);
        }
    }

    #[test]
    fn inert_portal_has_no_effects() {
        let config = shared_defaults();
        let before = *config.borrow();
        let mut portal = InertPortal;

        assert_eq!(
            portal.begin(Some(config.clone()), &FakeLink::up()).unwrap(),
            PortalState::Uninitialized
        );
        assert_eq!(portal.handle(&FakeLink::up()), PortalTick::Idle);
        assert!(!portal.should_reconnect());
        portal.clear_reconnect_flag();
        assert!(!portal.should_reconnect());
        assert_eq!(*config.borrow(), before);
        assert_eq!(Rc::strong_count(&config), 1);
    }
}
