// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! MQTT over TCP
//!
//! Blocking socket with a short read timeout so that [`BrokerLink::poll`]
//! returns quickly. TLS is available with the `tls` feature.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::mqtt::{Connect, Packet};
use super::{BrokerConnector, BrokerLink, ConnectOptions, InboundMessage};
use crate::error::TransportError;

/// Socket read timeout used while polling
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(20);

enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Stream {
    fn socket(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            #[cfg(feature = "tls")]
            Stream::Tls(s) => &s.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// Opens MQTT sessions over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }

    fn open_socket(options: &ConnectOptions) -> Result<TcpStream, TransportError> {
        let failed = |reason: String| TransportError::ConnectFailed {
            host: options.host.clone(),
            port: options.port,
            reason,
        };
        let addr = (options.host.as_str(), options.port)
            .to_socket_addrs()
            .map_err(|e| failed(e.to_string()))?
            .next()
            .ok_or_else(|| failed("no address".to_string()))?;
        let socket =
            TcpStream::connect_timeout(&addr, options.timeout).map_err(|e| failed(e.to_string()))?;
        socket
            .set_write_timeout(Some(options.timeout))
            .map_err(|e| failed(e.to_string()))?;
        socket
            .set_read_timeout(Some(options.timeout))
            .map_err(|e| failed(e.to_string()))?;
        socket.set_nodelay(true).map_err(|e| failed(e.to_string()))?;
        Ok(socket)
    }

    #[cfg(feature = "tls")]
    fn wrap_tls(options: &ConnectOptions, mut socket: TcpStream) -> Result<Stream, TransportError> {
        let config = options.trust.client_config(options.insecure)?;
        let server_name = rustls::ServerName::try_from(options.host.as_str())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut conn = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut socket)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        }
        Ok(Stream::Tls(Box::new(rustls::StreamOwned::new(conn, socket))))
    }

    #[cfg(not(feature = "tls"))]
    fn wrap_tls(_options: &ConnectOptions, _socket: TcpStream) -> Result<Stream, TransportError> {
        Err(TransportError::Tls(
            "built without the tls feature".to_string(),
        ))
    }
}

impl BrokerConnector for TcpConnector {
    fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn BrokerLink>, TransportError> {
        let socket = Self::open_socket(options)?;
        let stream = if options.use_tls {
            Self::wrap_tls(options, socket)?
        } else {
            Stream::Plain(socket)
        };
        let mut link = TcpLink {
            stream,
            buf: Vec::new(),
            pending: VecDeque::new(),
            connected: true,
            keep_alive: options.keep_alive,
            timeout: options.timeout,
            last_sent: Instant::now(),
            next_packet_id: 1,
        };

        link.send(&Packet::Connect(Connect {
            client_id: options.client_id.clone(),
            keep_alive_secs: options.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            username: options.username.clone(),
            password: options.password.clone(),
            will: options.last_will.clone(),
        }))?;
        match link.wait_for(|p| matches!(p, Packet::ConnAck { .. }))? {
            Packet::ConnAck { code: 0, .. } => {}
            Packet::ConnAck { code, .. } => return Err(TransportError::Refused(code)),
            _ => return Err(TransportError::Malformed("expected CONNACK".to_string())),
        }
        link.stream
            .socket()
            .set_read_timeout(Some(POLL_READ_TIMEOUT))
            .map_err(|e| TransportError::ConnectFailed {
                host: options.host.clone(),
                port: options.port,
                reason: e.to_string(),
            })?;
        debug!("Connected to {}:{} as {}", options.host, options.port, options.client_id);
        Ok(Box::new(link))
    }
}

/// An open MQTT session
pub struct TcpLink {
    stream: Stream,
    buf: Vec<u8>,
    pending: VecDeque<InboundMessage>,
    connected: bool,
    keep_alive: Duration,
    timeout: Duration,
    last_sent: Instant,
    next_packet_id: u16,
}

impl TcpLink {
    fn lost(&mut self, e: std::io::Error) -> TransportError {
        warn!("Broker connection lost: {}", e);
        self.connected = false;
        TransportError::NotConnected
    }

    fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let bytes = packet.to_bytes()?;
        if let Err(e) = self.stream.write_all(&bytes).and_then(|_| self.stream.flush()) {
            return Err(self.lost(e));
        }
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Read once from the socket; `false` when nothing arrived in time
    fn fill(&mut self) -> Result<bool, TransportError> {
        let mut chunk = [0u8; 1024];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(self.lost(ErrorKind::UnexpectedEof.into())),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(self.lost(e)),
        }
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, TransportError> {
        match Packet::decode(&self.buf)? {
            Some((packet, used)) => {
                self.buf.drain(..used);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    fn stash(&mut self, packet: Packet) {
        if let Packet::Publish { topic, payload } = packet {
            self.pending.push_back(InboundMessage { topic, payload });
        }
    }

    fn wait_for(&mut self, wanted: impl Fn(&Packet) -> bool) -> Result<Packet, TransportError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            while let Some(packet) = self.next_packet()? {
                if wanted(&packet) {
                    return Ok(packet);
                }
                self.stash(packet);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Malformed(
                    "timed out waiting for broker".to_string(),
                ));
            }
            self.fill()?;
        }
    }

    fn keep_alive(&mut self) -> Result<(), TransportError> {
        if !self.keep_alive.is_zero() && self.last_sent.elapsed() >= self.keep_alive / 2 {
            self.send(&Packet::PingReq)?;
        }
        Ok(())
    }
}

impl BrokerLink for TcpLink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.send(&Packet::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
        .map_err(|e| TransportError::PublishFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        self.send(&Packet::Subscribe {
            packet_id,
            filters: vec![filter.to_string()],
        })?;
        match self.wait_for(|p| matches!(p, Packet::SubAck { packet_id: id, .. } if *id == packet_id))? {
            Packet::SubAck { codes, .. } if codes.iter().all(|&c| c < 0x80) => Ok(()),
            _ => Err(TransportError::Malformed(format!(
                "subscription to {} refused",
                filter
            ))),
        }
    }

    fn poll(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        self.keep_alive()?;
        self.fill()?;
        while let Some(packet) = self.next_packet()? {
            self.stash(packet);
        }
        Ok(self.pending.pop_front())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        if self.connected {
            let _ = self.send(&Packet::Disconnect);
            let _ = self.stream.socket().shutdown(std::net::Shutdown::Both);
            self.connected = false;
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}
