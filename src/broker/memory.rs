// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! In-process broker
//!
//! Routes publishes between sessions opened on the same [`MemoryBroker`] and
//! lets tests decide which hosts are reachable, which root certificates the
//! server chain validates against and which credentials are accepted.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use super::{topic_matches, BrokerConnector, BrokerLink, ConnectOptions, InboundMessage, LastWill};
use crate::error::TransportError;

/// A message seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Publishing client, empty for [`MemoryBroker::publish`]
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct Session {
    id: u64,
    client_id: String,
    subscriptions: Vec<String>,
    inbox: VecDeque<InboundMessage>,
    connected: bool,
    last_will: Option<LastWill>,
}

#[derive(Debug, Default)]
struct BrokerState {
    reachable: HashSet<(String, u16)>,
    accepted_root_cas: Vec<Vec<u8>>,
    trust_web_roots: bool,
    credentials: Option<(String, String)>,
    fail_publishes: bool,
    sessions: Vec<Session>,
    published: Vec<PublishedMessage>,
    connect_attempts: usize,
    next_id: u64,
}

impl BrokerState {
    fn route(&mut self, message: PublishedMessage) {
        for session in self.sessions.iter_mut().filter(|s| s.connected) {
            if session
                .subscriptions
                .iter()
                .any(|f| topic_matches(f, &message.topic))
            {
                session.inbox.push_back(InboundMessage {
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                });
            }
        }
        self.published.push(message);
    }

    fn drop_session(&mut self, id: u64, send_will: bool) {
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) else {
            return;
        };
        if !session.connected {
            return;
        }
        session.connected = false;
        let will = session.last_will.take().filter(|_| send_will);
        let client_id = session.client_id.clone();
        if let Some(will) = will {
            self.route(PublishedMessage {
                client_id,
                topic: will.topic,
                payload: will.payload,
            });
        }
    }
}

/// Shared handle on an in-process broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Broker with no reachable address
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept connections to `host:port`
    pub fn reachable(&self, host: &str, port: u16) -> &Self {
        self.state().reachable.insert((host.to_string(), port));
        self
    }

    /// Refuse connections to every port of `host`
    pub fn unreachable(&self, host: &str) -> &Self {
        self.state().reachable.retain(|(h, _)| h != host);
        self
    }

    /// Server chain validates against this root certificate
    pub fn accept_root_ca(&self, pem: &[u8]) -> &Self {
        self.state().accepted_root_cas.push(pem.to_vec());
        self
    }

    /// Server chain validates against the bundled web roots
    pub fn trust_web_roots(&self, trust: bool) -> &Self {
        self.state().trust_web_roots = trust;
        self
    }

    /// Only accept these credentials
    pub fn require_credentials(&self, username: &str, password: &str) -> &Self {
        self.state().credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Make every publish fail while set
    pub fn fail_publishes(&self, fail: bool) -> &Self {
        self.state().fail_publishes = fail;
        self
    }

    /// Publish from the operator side
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        self.state().route(PublishedMessage {
            client_id: String::new(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Every message routed so far
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Payloads published on `topic`
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Connection attempts, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    /// Client ids of the open sessions
    pub fn connected_clients(&self) -> Vec<String> {
        self.state()
            .sessions
            .iter()
            .filter(|s| s.connected)
            .map(|s| s.client_id.clone())
            .collect()
    }

    /// Subscriptions of the open session of `client_id`
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.state()
            .sessions
            .iter()
            .filter(|s| s.connected && s.client_id == client_id)
            .flat_map(|s| s.subscriptions.clone())
            .collect()
    }

    /// Drop every open session as a network failure would (wills are sent)
    pub fn drop_all(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.sessions.iter().map(|s| s.id).collect();
        for id in ids {
            state.drop_session(id, true);
        }
    }

    fn check(state: &BrokerState, options: &ConnectOptions) -> Result<(), TransportError> {
        if !state
            .reachable
            .contains(&(options.host.clone(), options.port))
        {
            return Err(TransportError::ConnectFailed {
                host: options.host.clone(),
                port: options.port,
                reason: "host unreachable".to_string(),
            });
        }
        if options.validates_certificate() {
            let trusted = match &options.trust.root_ca {
                Some(ca) => state.accepted_root_cas.iter().any(|a| a == ca),
                None => state.trust_web_roots,
            };
            if !trusted {
                return Err(TransportError::Tls(
                    "server certificate not trusted".to_string(),
                ));
            }
        }
        if let Some((user, pass)) = &state.credentials {
            let matches = options.username.as_deref() == Some(user.as_str())
                && options.password.as_deref() == Some(pass.as_str());
            if !matches {
                // CONNACK 0x04: bad user name or password
                return Err(TransportError::Refused(4));
            }
        }
        Ok(())
    }
}

impl BrokerConnector for MemoryBroker {
    fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn BrokerLink>, TransportError> {
        let mut state = self.state();
        state.connect_attempts += 1;
        Self::check(&state, options)?;

        // A new session with the same client id takes over the old one
        let stale: Vec<u64> = state
            .sessions
            .iter()
            .filter(|s| s.connected && s.client_id == options.client_id)
            .map(|s| s.id)
            .collect();
        for id in stale {
            state.drop_session(id, false);
        }

        state.next_id += 1;
        let id = state.next_id;
        state.sessions.push(Session {
            id,
            client_id: options.client_id.clone(),
            subscriptions: Vec::new(),
            inbox: VecDeque::new(),
            connected: true,
            last_will: options.last_will.clone(),
        });
        debug!("Memory broker: {} connected", options.client_id);
        Ok(Box::new(MemoryLink {
            broker: self.clone(),
            id,
            client_id: options.client_id.clone(),
        }))
    }
}

/// Session opened on a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryLink {
    broker: MemoryBroker,
    id: u64,
    client_id: String,
}

impl MemoryLink {
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut BrokerState, usize) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut state = self.broker.state();
        let index = state
            .sessions
            .iter()
            .position(|s| s.id == self.id && s.connected)
            .ok_or(TransportError::NotConnected)?;
        f(&mut *state, index)
    }
}

impl BrokerLink for MemoryLink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let client_id = self.client_id.clone();
        self.with_session(|state, _| {
            if state.fail_publishes {
                return Err(TransportError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "broker rejected publish".to_string(),
                });
            }
            state.route(PublishedMessage {
                client_id,
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
            Ok(())
        })
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.with_session(|state, index| {
            state.sessions[index].subscriptions.push(filter.to_string());
            Ok(())
        })
    }

    fn poll(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        self.with_session(|state, index| Ok(state.sessions[index].inbox.pop_front()))
    }

    fn is_connected(&self) -> bool {
        self.with_session(|_, _| Ok(())).is_ok()
    }

    fn disconnect(&mut self) {
        self.broker.state().drop_session(self.id, false);
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.broker.state().drop_session(self.id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TrustMaterial;
    use std::time::Duration;

    fn options(host: &str, client_id: &str) -> ConnectOptions {
        ConnectOptions {
            host: host.to_string(),
            port: 1883,
            client_id: client_id.to_string(),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            use_tls: false,
            insecure: false,
            trust: TrustMaterial::new(),
            last_will: None,
            keep_alive: Duration::from_secs(60),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_unreachable_host() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.connect(&options("nowhere", "a")),
            Err(TransportError::ConnectFailed { .. })
        ));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[test]
    fn test_publish_routes_to_subscribers() {
        let broker = MemoryBroker::new();
        broker.reachable("broker", 1883);
        let mut device = broker.connect(&options("broker", "device")).unwrap();
        device.subscribe("t/1/down/#").unwrap();
        broker.publish("t/1/down/getConfig", b"");
        broker.publish("t/2/down/getConfig", b"");
        let msg = device.poll().unwrap().unwrap();
        assert_eq!(msg.topic, "t/1/down/getConfig");
        assert!(device.poll().unwrap().is_none());

        device.publish("t/1/up/status", b"{}").unwrap();
        assert_eq!(broker.published_on("t/1/up/status"), vec![b"{}".to_vec()]);
    }

    #[test]
    fn test_certificate_validation() {
        let broker = MemoryBroker::new();
        broker.reachable("broker", 1883).accept_root_ca(b"good-ca");
        let mut opts = options("broker", "device");
        opts.use_tls = true;
        opts.trust = TrustMaterial::new().with_root_ca("bad-ca");
        assert!(matches!(broker.connect(&opts), Err(TransportError::Tls(_))));
        opts.insecure = true;
        assert!(broker.connect(&opts).is_ok());
        opts.insecure = false;
        opts.trust = TrustMaterial::new().with_root_ca("good-ca");
        assert!(broker.connect(&opts).is_ok());
    }

    #[test]
    fn test_credentials_refused() {
        let broker = MemoryBroker::new();
        broker.reachable("broker", 1883).require_credentials("user", "other");
        assert!(matches!(
            broker.connect(&options("broker", "device")),
            Err(TransportError::Refused(4))
        ));
    }

    #[test]
    fn test_drop_all_sends_will() {
        let broker = MemoryBroker::new();
        broker.reachable("broker", 1883);
        let mut watcher = broker.connect(&options("broker", "watcher")).unwrap();
        watcher.subscribe("t/#").unwrap();
        let mut opts = options("broker", "device");
        opts.last_will = Some(LastWill {
            topic: "t/1/up/status".to_string(),
            payload: b"gone".to_vec(),
        });
        let mut device = broker.connect(&opts).unwrap();
        broker.drop_all();
        assert!(!device.is_connected());
        assert!(matches!(device.publish("x", b""), Err(TransportError::NotConnected)));
        assert_eq!(broker.published_on("t/1/up/status"), vec![b"gone".to_vec()]);
    }

    #[test]
    fn test_clean_disconnect_and_drop() {
        let broker = MemoryBroker::new();
        broker.reachable("broker", 1883);
        {
            let _trial = broker.connect(&options("broker", "trial")).unwrap();
            assert_eq!(broker.connected_clients(), vec!["trial".to_string()]);
        }
        assert!(broker.connected_clients().is_empty());
    }
}
