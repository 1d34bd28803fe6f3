use std::{cell::RefCell, rc::Rc};

use chrono::{DateTime, Utc};

use crate::{
    config::DeviceConfig,
    portal::{ConfigPortal, NetworkLink, PortalState, PortalTick, SharedConfig},
    telemetry::{Reading, TelemetryFormatter},
    topics::telemetry_topic,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    PortalStarted,
    PortalFailed { error: String },
    PortalServed { requests: usize, saved: usize },
    /// Drop the current Wi-Fi association and join again with these
    /// credentials.
    Reconnect { ssid: String, password: String },
    Publish { topic: String, payload: String },
    TelemetryDropped { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTimings {
    pub telemetry_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Wait between attempts to start the portal after a failure.
    pub portal_retry_ms: u64,
}

impl Default for NodeTimings {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: 30_000,
            poll_interval_ms: 100,
            portal_retry_ms: 5_000,
        }
    }
}

/// Cooperative main-loop state: owns the live configuration, the portal
/// strategy and the telemetry counter. Platform code calls [`tick`] on every
/// poll and carries out the returned actions.
///
/// [`tick`]: NodeRuntime::tick
pub struct NodeRuntime {
    config: SharedConfig,
    portal: Box<dyn ConfigPortal>,
    formatter: TelemetryFormatter,
    timings: NodeTimings,
    next_portal_attempt_ms: u64,
    next_telemetry_ms: u64,
}

impl NodeRuntime {
    pub fn new(config: DeviceConfig, portal: Box<dyn ConfigPortal>, timings: NodeTimings) -> Self {
        Self {
            config: Rc::new(RefCell::new(config)),
            portal,
            formatter: TelemetryFormatter::new(),
            timings,
            next_portal_attempt_ms: 0,
            next_telemetry_ms: 0,
        }
    }

    pub fn config(&self) -> SharedConfig {
        self.config.clone()
    }

    pub fn timings(&self) -> NodeTimings {
        self.timings
    }

    pub fn portal_state(&self) -> PortalState {
        self.portal.state()
    }

    pub fn messages_sent(&self) -> u32 {
        self.formatter.sent()
    }

    /// Runs one pass of the loop. `sample` is only called when a telemetry
    /// message is due.
    pub fn tick<F>(
        &mut self,
        now_ms: u64,
        wall_clock: DateTime<Utc>,
        link: &dyn NetworkLink,
        sample: F,
    ) -> Vec<NodeAction>
    where
        F: FnOnce() -> Reading,
    {
        let mut actions = Vec::new();

        self.start_portal_if_needed(now_ms, link, &mut actions);
        if let PortalTick::Served { requests, saved } = self.portal.handle(link) {
            actions.push(NodeAction::PortalServed { requests, saved });
        }
        if self.portal.should_reconnect() {
            let config = self.config.borrow();
            actions.push(NodeAction::Reconnect {
                ssid: config.wifi_ssid.as_str().to_owned(),
                password: config.wifi_password.as_str().to_owned(),
            });
            drop(config);
            self.portal.clear_reconnect_flag();
        }
        if self.telemetry_due(now_ms, link) {
            actions.push(self.telemetry(now_ms, sample(), link, wall_clock));
        }

        actions
    }

    pub fn telemetry_due(&self, now_ms: u64, link: &dyn NetworkLink) -> bool {
        link.is_connected() && now_ms >= self.next_telemetry_ms
    }

    /// Formats one message and schedules the next. A message that cannot be
    /// formatted is dropped but still consumes the period.
    pub fn telemetry(
        &mut self,
        now_ms: u64,
        reading: Reading,
        link: &dyn NetworkLink,
        wall_clock: DateTime<Utc>,
    ) -> NodeAction {
        self.next_telemetry_ms = now_ms.saturating_add(self.timings.telemetry_interval_ms);

        let config = self.config.borrow();
        match self
            .formatter
            .format(&config, reading, link.local_address(), wall_clock)
        {
            Ok(payload) => NodeAction::Publish {
                topic: telemetry_topic(config.device_id.as_str()),
                payload,
            },
            Err(err) => NodeAction::TelemetryDropped {
                error: err.to_string(),
            },
        }
    }

    fn start_portal_if_needed(
        &mut self,
        now_ms: u64,
        link: &dyn NetworkLink,
        actions: &mut Vec<NodeAction>,
    ) {
        if self.portal.state() == PortalState::Serving || now_ms < self.next_portal_attempt_ms {
            return;
        }

        match self.portal.begin(Some(self.config.clone()), link) {
            Ok(PortalState::Serving) => actions.push(NodeAction::PortalStarted),
            Ok(PortalState::Uninitialized) => {}
            Err(err) => {
                self.next_portal_attempt_ms = now_ms.saturating_add(self.timings.portal_retry_ms);
                actions.push(NodeAction::PortalFailed {
                    error: format!("{err}: {}", error_source(&err)),
                });
            }
        }
    }
}

fn error_source(err: &dyn std::error::Error) -> String {
    match err.source() {
        Some(source) => source.to_string(),
        None => "unknown cause".to_owned(),
    }
}
