// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Session manager
//!
//! Owns the one live broker session. Each [`SessionManager::step`]:
//!
//! - drops a session the broker or the network closed
//! - opens a new one when the link is up, a broker is configured and the
//!   retry interval has elapsed
//! - hands inbound messages to the [`InboundHandler`]
//! - drains the [`TransportQueue`] head first while connected, and keeps the
//!   queue's online flag in step with the session
//!
//! The manager never blocks on the queue and never waits for a retry; the
//! caller drives it from a loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::broker::{BrokerConnector, BrokerLink, ConnectOptions, InboundMessage};
use crate::config::LiveConfig;
use crate::platform::LinkControl;
use crate::protocol::{last_will_payload, online_payload, Topics};
use crate::queue::TransportQueue;
use crate::store::ConfigStore;
use crate::tls::TrustMaterial;

/// Receives messages from the command topics
pub trait InboundHandler {
    fn handle(&self, message: &InboundMessage);
}

/// Session tunables
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// First component of the client identifier
    pub app_name: String,
    /// Delay before the first attempt after start-up
    pub initial_delay: Duration,
    /// Delay between failed attempts
    pub retry_interval: Duration,
    /// Pause between loop iterations in [`SessionManager::run`]
    pub tick: Duration,
    /// Inbound messages handled per step
    pub max_inbound_per_step: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_name: "solarmon".to_string(),
            initial_delay: Duration::from_secs(10),
            retry_interval: Duration::from_secs(60),
            tick: Duration::from_millis(5),
            max_inbound_per_step: 8,
        }
    }
}

/// Observable state of the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkMonitor {
    /// A session is open
    pub connected: bool,
    /// Attempts since the last confirmed connection
    pub connection_attempts: u32,
    /// Sessions opened since start-up
    pub sessions: u64,
    /// Messages published from the queue
    pub published: u64,
    /// Queue publishes that failed
    pub failed_publishes: u64,
}

/// Owner of the live broker session
pub struct SessionManager {
    connector: Arc<dyn BrokerConnector>,
    live: LiveConfig,
    store: ConfigStore,
    queue: Arc<TransportQueue>,
    link_control: Arc<dyn LinkControl>,
    config: SessionConfig,
    link: Option<Box<dyn BrokerLink>>,
    topics: Option<Topics>,
    next_attempt: Instant,
    monitor: LinkMonitor,
}

impl SessionManager {
    /// Manager whose first attempt is due `initial_delay` after `start`
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        live: LiveConfig,
        store: ConfigStore,
        queue: Arc<TransportQueue>,
        link_control: Arc<dyn LinkControl>,
        config: SessionConfig,
        start: Instant,
    ) -> Self {
        let next_attempt = start + config.initial_delay;
        queue.set_online(false);
        Self {
            connector,
            live,
            store,
            queue,
            link_control,
            config,
            link: None,
            topics: None,
            next_attempt,
            monitor: LinkMonitor::default(),
        }
    }

    /// Current state
    pub fn monitor(&self) -> LinkMonitor {
        self.monitor
    }

    /// Whether a session is open
    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.is_connected())
    }

    /// Client identifier of the live session
    pub fn client_id(&self) -> String {
        let device_id = self.live.read(|c| c.device_id());
        format!(
            "{}-{}-{}",
            self.config.app_name,
            device_id,
            self.link_control.hardware_id()
        )
    }

    /// One iteration of the session loop
    pub fn step(&mut self, now: Instant, handler: &dyn InboundHandler) {
        // The retry interval counts from the last attempt, lost sessions included
        if self.link.is_some() && !self.is_connected() {
            warn!("Broker session lost");
            self.close();
        }
        if self.link.is_none() && now >= self.next_attempt {
            self.connect(now);
        }
        self.receive(handler);
        self.drain();
    }

    /// Drive [`Self::step`] until `stop` is set
    pub fn run(&mut self, handler: &dyn InboundHandler, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.step(Instant::now(), handler);
            thread::sleep(self.config.tick);
        }
        self.disconnect();
    }

    /// Close the live session cleanly (no last will)
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.disconnect();
            info!("Disconnected from broker");
        }
        self.close();
    }

    fn close(&mut self) {
        self.queue.set_online(false);
        self.link = None;
        self.topics = None;
        self.monitor.connected = false;
    }

    fn connect(&mut self, now: Instant) {
        self.next_attempt = now + self.config.retry_interval;
        if !self.link_control.is_link_up() {
            debug!("Network link down, not connecting");
            return;
        }
        let settings = self.live.broker_settings();
        if settings.is_local_only() {
            debug!("No broker configured");
            return;
        }

        self.monitor.connection_attempts += 1;
        let topics = Topics::from_settings(&settings);
        let trust = TrustMaterial::load(self.store.backend().as_ref());
        let options = ConnectOptions::from_settings(&settings, self.client_id(), trust)
            .with_last_will(topics.up_status(), last_will_payload());
        info!(
            "Connecting to {}:{} as {} (attempt {})",
            options.host, options.port, options.client_id, self.monitor.connection_attempts
        );

        let mut link = match self.connector.connect(&options) {
            Ok(link) => link,
            Err(e) => {
                warn!("Broker connection failed: {}", e);
                return;
            }
        };
        for filter in [topics.down_device(), topics.down_all()] {
            if let Err(e) = link.subscribe(&filter) {
                warn!("Subscribing to {} failed: {}", filter, e);
                return;
            }
        }
        match link.publish(
            &topics.up_status(),
            &online_payload(self.monitor.connection_attempts),
        ) {
            Ok(()) => self.monitor.connection_attempts = 0,
            Err(e) => warn!("Online announcement failed: {}", e),
        }

        self.monitor.connected = true;
        self.monitor.sessions += 1;
        self.queue.set_online(true);
        self.link = Some(link);
        self.topics = Some(topics);
    }

    fn receive(&mut self, handler: &dyn InboundHandler) {
        for _ in 0..self.config.max_inbound_per_step {
            let Some(link) = self.link.as_mut() else {
                return;
            };
            match link.poll() {
                Ok(Some(message)) => {
                    debug!("Inbound message on {}", message.topic);
                    handler.handle(&message);
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    self.close();
                    return;
                }
            }
        }
    }

    fn drain(&mut self) {
        let (Some(link), Some(topics)) = (self.link.as_mut(), self.topics.as_ref()) else {
            return;
        };
        // Bounded by the queue length so concurrent producers cannot starve the loop
        for _ in 0..self.queue.len() {
            let Some(message) = self.queue.peek() else {
                return;
            };
            let topic = message.class.topic(topics);
            let published = match link.publish(&topic, &message.payload) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Publish on {} failed: {}", topic, e);
                    false
                }
            };
            self.queue.complete_head(published);
            if published {
                self.monitor.published += 1;
            } else {
                self.monitor.failed_publishes += 1;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::{device_registry, ids, DeviceConfig};
    use crate::param::Document;
    use crate::platform::StaticLink;
    use crate::queue::{MessageClass, OutboundMessage};
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        topics: Mutex<Vec<String>>,
    }

    impl InboundHandler for Recorder {
        fn handle(&self, message: &InboundMessage) {
            self.topics.lock().unwrap().push(message.topic.clone());
        }
    }

    struct Fixture {
        broker: MemoryBroker,
        queue: Arc<TransportQueue>,
        link: Arc<StaticLink>,
        manager: SessionManager,
        start: Instant,
    }

    fn fixture(host: &str) -> Fixture {
        let registry = device_registry().unwrap();
        let mut config = DeviceConfig::with_defaults(&registry);
        registry.get(ids::MQTT_HOST).unwrap().parse_and_apply(&mut config, host);
        registry.get(ids::DEVICE_ID).unwrap().parse_and_apply(&mut config, "7");
        let broker = MemoryBroker::new();
        broker.reachable("broker-a", 1883);
        let queue = Arc::new(TransportQueue::new());
        let link = Arc::new(StaticLink::new("aabbcc"));
        let start = Instant::now();
        let manager = SessionManager::new(
            Arc::new(broker.clone()),
            LiveConfig::new(config),
            ConfigStore::new(Arc::new(MemoryStore::new())),
            queue.clone(),
            link.clone(),
            SessionConfig::default(),
            start,
        );
        Fixture {
            broker,
            queue,
            link,
            manager,
            start,
        }
    }

    fn after(f: &Fixture, secs: u64) -> Instant {
        f.start + Duration::from_secs(secs)
    }

    #[test]
    fn test_first_attempt_waits_initial_delay() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.manager.step(f.start, &handler);
        assert_eq!(f.broker.connect_attempts(), 0);
        f.manager.step(after(&f, 10), &handler);
        assert!(f.manager.is_connected());
        assert_eq!(f.broker.connected_clients(), vec!["solarmon-7-aabbcc".to_string()]);
        assert_eq!(
            f.broker.subscriptions("solarmon-7-aabbcc"),
            vec!["solarmonitor/7/down/#".to_string(), "solarmonitor/down/#".to_string()]
        );
    }

    #[test]
    fn test_online_announcement_resets_attempts() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.manager.step(after(&f, 10), &handler);
        assert_eq!(
            f.broker.published_on("solarmonitor/7/up/status"),
            vec![br#"{"online":true,"connectionAttempts":1}"#.to_vec()]
        );
        assert_eq!(f.manager.monitor().connection_attempts, 0);
        assert_eq!(f.manager.monitor().sessions, 1);
    }

    #[test]
    fn test_failed_announcement_keeps_count() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.broker.fail_publishes(true);
        f.manager.step(after(&f, 10), &handler);
        assert_eq!(f.manager.monitor().connection_attempts, 1);

        f.broker.fail_publishes(false);
        f.broker.drop_all();
        f.manager.step(after(&f, 70), &handler);
        assert!(f
            .broker
            .published_on("solarmonitor/7/up/status")
            .contains(&br#"{"online":true,"connectionAttempts":2}"#.to_vec()));
        assert_eq!(f.manager.monitor().connection_attempts, 0);
    }

    #[test]
    fn test_retry_interval_after_failure() {
        let mut f = fixture("broker-b");
        let handler = Recorder::default();
        f.manager.step(after(&f, 10), &handler);
        f.manager.step(after(&f, 30), &handler);
        assert_eq!(f.broker.connect_attempts(), 1);
        f.manager.step(after(&f, 70), &handler);
        assert_eq!(f.broker.connect_attempts(), 2);
        assert_eq!(f.manager.monitor().connection_attempts, 2);
    }

    #[test]
    fn test_local_only_never_connects() {
        let mut f = fixture("127.0.0.1");
        let handler = Recorder::default();
        f.manager.step(after(&f, 100), &handler);
        assert_eq!(f.broker.connect_attempts(), 0);
    }

    #[test]
    fn test_link_down_defers_connection() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.link.set_up(false);
        f.manager.step(after(&f, 10), &handler);
        assert_eq!(f.broker.connect_attempts(), 0);
        f.link.set_up(true);
        f.manager.step(after(&f, 70), &handler);
        assert!(f.manager.is_connected());
    }

    #[test]
    fn test_queue_drained_in_order() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        let mut doc = Document::new();
        doc.insert("panel_mV".to_string(), 18000.into());
        f.queue.push_status("hello");
        f.manager.step(f.start, &handler);
        assert_eq!(f.queue.len(), 1);

        f.manager.step(after(&f, 10), &handler);
        f.queue.enqueue(OutboundMessage::data(&doc).unwrap()).unwrap();
        f.manager.step(after(&f, 11), &handler);
        assert!(f.queue.is_empty());
        assert_eq!(
            f.broker.published_on("solarmonitor/7/up/data"),
            vec![br#"{"panel_mV":18000}"#.to_vec()]
        );
        assert_eq!(f.manager.monitor().published, 2);
    }

    #[test]
    fn test_telemetry_refused_while_offline() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        let data = || OutboundMessage::data(&Document::new()).unwrap();
        assert!(!f.queue.is_online());
        for _ in 0..30 {
            assert!(f.queue.enqueue(data()).is_err());
        }
        assert!(f.queue.push_status("still queued"));

        f.manager.step(after(&f, 10), &handler);
        assert!(f.queue.is_online());
        f.broker.drop_all();
        f.manager.step(after(&f, 11), &handler);
        assert!(!f.queue.is_online());
        assert!(f.queue.enqueue(data()).is_err());
    }

    #[test]
    fn test_failed_publish_keeps_status_drops_data() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.manager.step(after(&f, 10), &handler);
        f.broker.fail_publishes(true);
        f.queue.enqueue(OutboundMessage::data(&Document::new()).unwrap()).unwrap();
        f.queue.push_status("keep me");
        f.manager.step(after(&f, 11), &handler);
        assert_eq!(f.queue.classes(), vec![MessageClass::Status]);
        f.manager.step(after(&f, 12), &handler);
        assert_eq!(f.queue.classes(), vec![MessageClass::Status]);
        f.broker.fail_publishes(false);
        f.manager.step(after(&f, 13), &handler);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_lost_session_reconnects_and_sends_will() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.manager.step(after(&f, 10), &handler);
        f.broker.drop_all();
        assert!(f
            .broker
            .published_on("solarmonitor/7/up/status")
            .contains(&br#"{"msg":"disconnected"}"#.to_vec()));
        f.manager.step(after(&f, 11), &handler);
        assert!(!f.manager.is_connected());
        assert_eq!(f.broker.connect_attempts(), 1);
        f.manager.step(after(&f, 70), &handler);
        assert!(f.manager.is_connected());
        assert_eq!(f.manager.monitor().sessions, 2);
    }

    #[test]
    fn test_flapping_broker_waits_retry_interval() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        for tick in 0..200 {
            f.manager
                .step(after(&f, 10) + Duration::from_millis(5 * tick), &handler);
            f.broker.drop_all();
        }
        assert_eq!(f.broker.connect_attempts(), 1);
        f.manager.step(after(&f, 70), &handler);
        assert_eq!(f.broker.connect_attempts(), 2);
    }

    #[test]
    fn test_inbound_messages_dispatched() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.manager.step(after(&f, 10), &handler);
        f.broker.publish("solarmonitor/7/down/getConfig", b"");
        f.broker.publish("solarmonitor/down/reboot", b"");
        f.broker.publish("solarmonitor/8/down/reboot", b"");
        f.manager.step(after(&f, 11), &handler);
        assert_eq!(
            *handler.topics.lock().unwrap(),
            vec![
                "solarmonitor/7/down/getConfig".to_string(),
                "solarmonitor/down/reboot".to_string()
            ]
        );
    }

    #[test]
    fn test_disconnect_sends_no_will() {
        let mut f = fixture("broker-a");
        let handler = Recorder::default();
        f.manager.step(after(&f, 10), &handler);
        f.manager.disconnect();
        assert!(!f.manager.is_connected());
        assert!(f.broker.connected_clients().is_empty());
        assert_eq!(f.broker.published_on("solarmonitor/7/up/status").len(), 1);
    }
}
