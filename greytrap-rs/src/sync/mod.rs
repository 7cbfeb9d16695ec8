//! Multicast/UDP replication of grey, white and trap updates.
//!
//! Updates are broadcast to the configured multicast group and unicast to
//! each listed peer. Received datagrams are authenticated, guarded against
//! counter replay and fed to the greylister as ordinary protocol messages
//! with `sync = 0` so they are not re-broadcast.

pub mod wire;

pub use wire::{SyncUpdate, SYNC_MAXSIZE};

use crate::config::SyncConfig;
use crate::error::{GreytrapError, Result};
use crate::grey::{GREY_MSG_GREY, GREY_MSG_TRAP, GREY_MSG_WHITE};
use crate::proto::Message;
use ring::hmac;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SYNC_MCASTADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 241);
pub const SYNC_MCASTTTL: u32 = 1;

struct SyncInner {
    socket: UdpSocket,
    key: hmac::Key,
    verify: bool,
    counter: AtomicU32,
    hosts: Vec<SocketAddr>,
    mcast: Option<SocketAddr>,
}

/// The running sync engine. `sender()` hands out lightweight handles for
/// the greylister's broadcast path; `run_recv` is the receive loop.
pub struct SyncEngine {
    inner: Arc<SyncInner>,
}

/// Broadcast handle held by the greylister reader.
#[derive(Clone)]
pub struct SyncSender {
    inner: Arc<SyncInner>,
}

impl SyncEngine {
    /// Parse configuration, resolve the key file and peers, bind the
    /// socket and join the multicast group when an interface is given.
    pub async fn start(config: &SyncConfig) -> Result<Self> {
        let key_bytes = match std::fs::read(&config.key) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if config.verify {
                    warn!("sync key {} not found, using empty key", config.key);
                }
                Vec::new()
            }
            Err(e) => {
                return Err(GreytrapError::Sync(format!(
                    "failed to open sync key: {e}"
                )))
            }
        };
        let key = wire::derive_key(&key_bytes);

        let bind_ip: Ipv4Addr = match &config.bind_address {
            Some(addr) => addr
                .parse()
                .map_err(|_| GreytrapError::Sync(format!("bad sync bind address {addr}")))?,
            None => Ipv4Addr::UNSPECIFIED,
        };

        // Bind the sync port only when we expect to receive.
        let port = if config.bind_address.is_some() || config.interface.is_some() {
            config.port
        } else {
            0
        };
        let socket = UdpSocket::bind(SocketAddr::from((bind_ip, port))).await?;

        let mut mcast = None;
        if let Some(interface) = &config.interface {
            let (iface_addr, ttl) = parse_interface(interface)?;
            socket
                .join_multicast_v4(SYNC_MCASTADDR, iface_addr)
                .map_err(|e| {
                    GreytrapError::Sync(format!(
                        "failed to add multicast membership to {SYNC_MCASTADDR}: {e}"
                    ))
                })?;
            socket
                .set_multicast_ttl_v4(ttl)
                .map_err(|e| GreytrapError::Sync(format!("failed to set multicast ttl: {e}")))?;
            mcast = Some(SocketAddr::from((SYNC_MCASTADDR, config.port)));
            debug!(
                "using multicast spam sync (ttl {ttl}, group {SYNC_MCASTADDR}, port {})",
                config.port
            );
        }

        let mut hosts = Vec::new();
        for name in &config.hosts {
            let target = format!("{name}:{}", config.port);
            let mut resolved = lookup_host(&target)
                .await
                .map_err(|e| GreytrapError::Sync(format!("cannot resolve {name}: {e}")))?;
            match resolved.find(|a| a.is_ipv4()) {
                Some(addr) => {
                    info!("added spam sync host {name} (address {addr})");
                    hosts.push(addr);
                }
                None => {
                    return Err(GreytrapError::Sync(format!(
                        "no IPv4 address for sync host {name}"
                    )))
                }
            }
        }

        Ok(SyncEngine {
            inner: Arc::new(SyncInner {
                socket,
                key,
                verify: config.verify,
                counter: AtomicU32::new(0),
                hosts,
                mcast,
            }),
        })
    }

    pub fn sender(&self) -> SyncSender {
        SyncSender {
            inner: self.inner.clone(),
        }
    }

    /// Receive datagrams until shutdown, forwarding verified updates to
    /// the greylister pipe. Bad datagrams are dropped with a warning.
    pub async fn run_recv(
        self,
        grey_tx: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) {
        let mut peers: HashMap<IpAddr, u32> = HashMap::new();
        let mut buf = vec![0u8; SYNC_MAXSIZE + 64];

        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = self.inner.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("sync receive error: {e}");
                        continue;
                    }
                },
            };

            let (counter, updates) =
                match wire::decode(&buf[..len], &self.inner.key, self.inner.verify) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("dropping sync datagram from {peer}: {e}");
                        continue;
                    }
                };

            if self.inner.verify {
                let last = peers.get(&peer.ip()).copied();
                // Counter 0 resets peer state so a restarted or wrapped
                // peer can resume.
                if counter != 0 && last.is_some_and(|last| counter <= last) {
                    warn!("dropping sync datagram from {peer}: stale counter {counter}");
                    continue;
                }
                peers.insert(peer.ip(), counter);
            }

            for update in updates {
                let message = update_to_message(&update, &peer);
                if grey_tx.send(message.emit()).is_err() {
                    return;
                }
            }
        }
    }
}

impl SyncSender {
    async fn send(&self, update: SyncUpdate) {
        let counter = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let buf = match wire::encode(&[update], counter, &self.inner.key) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("sync encode failed: {e}");
                return;
            }
        };

        if let Some(mcast) = self.inner.mcast {
            if let Err(e) = self.inner.socket.send_to(&buf, mcast).await {
                warn!("sync multicast send failed: {e}");
            }
        }
        for host in &self.inner.hosts {
            if let Err(e) = self.inner.socket.send_to(&buf, *host).await {
                warn!("sync send to {host} failed: {e}");
            }
        }
    }

    /// Notify peers of a new or refreshed grey entry.
    pub async fn update(&self, now: i64, ip: &str, helo: &str, from: &str, to: &str) {
        if let Ok(ip) = ip.parse::<Ipv4Addr>() {
            self.send(SyncUpdate::Grey {
                timestamp: now as u32,
                ip,
                from: from.to_string(),
                to: to.to_string(),
                helo: helo.to_string(),
            })
            .await;
        }
    }

    /// Notify peers of a whitelist entry.
    pub async fn white(&self, now: i64, expire: i64, ip: &str) {
        if let Ok(ip) = ip.parse::<Ipv4Addr>() {
            self.send(SyncUpdate::White {
                timestamp: now as u32,
                expire: expire as u32,
                ip,
            })
            .await;
        }
    }

    /// Notify peers of a trapped address.
    pub async fn trapped(&self, now: i64, expire: i64, ip: &str) {
        if let Ok(ip) = ip.parse::<Ipv4Addr>() {
            self.send(SyncUpdate::Trapped {
                timestamp: now as u32,
                expire: expire as u32,
                ip,
            })
            .await;
        }
    }
}

/// Translate a received update into the greylister pipe message, flagged
/// `sync = 0` so the reader does not broadcast it again.
fn update_to_message(update: &SyncUpdate, peer: &SocketAddr) -> Message {
    match update {
        SyncUpdate::Grey {
            ip,
            from,
            to,
            helo,
            ..
        } => Message::new()
            .set_int("type", GREY_MSG_GREY)
            .set_str("ip", &ip.to_string())
            .set_str("helo", helo)
            .set_str("from", from)
            .set_str("to", to)
            .set_int("sync", 0),
        SyncUpdate::White { expire, ip, .. } => Message::new()
            .set_int("type", GREY_MSG_WHITE)
            .set_str("ip", &ip.to_string())
            .set_str("source", &peer.ip().to_string())
            .set_str("expires", &expire.to_string())
            .set_int("sync", 0),
        SyncUpdate::Trapped { expire, ip, .. } => Message::new()
            .set_int("type", GREY_MSG_TRAP)
            .set_str("ip", &ip.to_string())
            .set_str("source", &peer.ip().to_string())
            .set_str("expires", &expire.to_string())
            .set_int("sync", 0),
    }
}

fn parse_interface(interface: &str) -> Result<(Ipv4Addr, u32)> {
    let (addr, ttl) = match interface.split_once(':') {
        Some((addr, ttl)) => {
            let ttl: u32 = ttl
                .parse()
                .map_err(|_| GreytrapError::Sync(format!("invalid multicast ttl {ttl}")))?;
            (addr, ttl)
        }
        None => (interface, SYNC_MCASTTTL),
    };

    let addr: Ipv4Addr = addr.parse().map_err(|_| {
        GreytrapError::Sync(format!("sync interface must be an IPv4 address: {addr}"))
    })?;

    Ok((addr, ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto;

    #[test]
    fn test_parse_interface() {
        assert_eq!(
            parse_interface("10.0.0.1").unwrap(),
            (Ipv4Addr::new(10, 0, 0, 1), SYNC_MCASTTTL)
        );
        assert_eq!(
            parse_interface("10.0.0.1:8").unwrap(),
            (Ipv4Addr::new(10, 0, 0, 1), 8)
        );
        assert!(parse_interface("eth0").is_err());
        assert!(parse_interface("10.0.0.1:lots").is_err());
    }

    #[test]
    fn test_update_to_message_sets_sync_zero() {
        let peer: SocketAddr = "203.0.113.9:8025".parse().unwrap();
        let update = SyncUpdate::Trapped {
            timestamp: 100,
            expire: 90000,
            ip: Ipv4Addr::new(192, 0, 2, 66),
        };

        let message = update_to_message(&update, &peer);
        assert_eq!(message.get_int("type"), Some(GREY_MSG_TRAP));
        assert_eq!(message.get_int("sync"), Some(0));
        assert_eq!(message.get_str("source"), Some("203.0.113.9"));
        assert_eq!(message.get_str("expires"), Some("90000"));

        // The emitted text parses back on the reader side.
        let parsed = proto::parse(&message.emit()).unwrap();
        assert_eq!(parsed.get_str("ip"), Some("192.0.2.66"));
    }

    #[tokio::test]
    async fn test_unicast_send_and_recv_loop() {
        let receiver_config = SyncConfig {
            verify: true,
            key: "/nonexistent/greytrap.key".to_string(),
            port: 0,
            hosts: Vec::new(),
            bind_address: Some("127.0.0.1".to_string()),
            interface: None,
        };
        let receiver = SyncEngine::start(&receiver_config).await.unwrap();
        let local_port = receiver.inner.socket.local_addr().unwrap().port();

        let sender_config = SyncConfig {
            verify: true,
            key: "/nonexistent/greytrap.key".to_string(),
            port: local_port,
            hosts: vec!["127.0.0.1".to_string()],
            bind_address: None,
            interface: None,
        };
        let sender_engine = SyncEngine::start(&sender_config).await.unwrap();
        let sender = sender_engine.sender();

        let (grey_tx, mut grey_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let recv_task = tokio::spawn(receiver.run_recv(grey_tx, shutdown.clone()));

        sender.trapped(1000, 90000, "192.0.2.66").await;

        let text = grey_rx.recv().await.unwrap();
        let message = proto::parse(&text).unwrap();
        assert_eq!(message.get_int("type"), Some(GREY_MSG_TRAP));
        assert_eq!(message.get_str("ip"), Some("192.0.2.66"));
        assert_eq!(message.get_int("sync"), Some(0));

        shutdown.cancel();
        recv_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        // Counters 5 then 4: the second datagram must be dropped.
        let key = wire::derive_key(b"");
        let receiver_config = SyncConfig {
            verify: true,
            key: "/nonexistent/greytrap.key".to_string(),
            port: 0,
            hosts: Vec::new(),
            bind_address: Some("127.0.0.1".to_string()),
            interface: None,
        };
        let receiver = SyncEngine::start(&receiver_config).await.unwrap();
        let target = receiver.inner.socket.local_addr().unwrap();

        let (grey_tx, mut grey_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let recv_task = tokio::spawn(receiver.run_recv(grey_tx, shutdown.clone()));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let update = |ip: u8| SyncUpdate::White {
            timestamp: 1,
            expire: 1000,
            ip: Ipv4Addr::new(10, 0, 0, ip),
        };

        let first = wire::encode(&[update(1)], 5, &key).unwrap();
        socket.send_to(&first, target).await.unwrap();
        let replayed = wire::encode(&[update(2)], 4, &key).unwrap();
        socket.send_to(&replayed, target).await.unwrap();
        let fresh = wire::encode(&[update(3)], 6, &key).unwrap();
        socket.send_to(&fresh, target).await.unwrap();

        let first_msg = proto::parse(&grey_rx.recv().await.unwrap()).unwrap();
        assert_eq!(first_msg.get_str("ip"), Some("10.0.0.1"));

        // The stale counter-4 datagram is dropped; the next delivery is
        // the counter-6 one.
        let second_msg = proto::parse(&grey_rx.recv().await.unwrap()).unwrap();
        assert_eq!(second_msg.get_str("ip"), Some("10.0.0.3"));

        shutdown.cancel();
        recv_task.await.unwrap();
    }
}
