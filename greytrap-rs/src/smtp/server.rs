//! The daemon's accept loop and shared connection-engine state.
//!
//! One listener per address family feeds sessions into tokio tasks; a
//! loopback-only configuration listener and the scanner's trap pipe both
//! install blacklists into the shared index at runtime.

use super::session::Session;
use super::MatchedList;
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::error::Result;
use crate::firewall::FwRequest;
use crate::net::Addr;
use crate::proto::{Message, MessageReader, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every connection and the control listeners.
pub struct ServerShared {
    pub hostname: String,
    pub banner: String,
    pub reply_code: String,
    pub grey_enabled: bool,
    pub stutter: u64,
    pub grey_stutter: u64,
    pub verbose: bool,
    pub max_cons: usize,
    pub max_black: usize,
    pub clients: AtomicUsize,
    pub black_clients: AtomicUsize,
    pub grey_tx: mpsc::UnboundedSender<String>,
    pub fw_tx: mpsc::UnboundedSender<FwRequest>,
    /// Cancelled on daemon shutdown; live sessions observe it and close.
    pub shutdown: CancellationToken,
    blacklists: RwLock<HashMap<String, Arc<Blacklist>>>,
}

impl ServerShared {
    pub fn from_config(
        config: &Config,
        grey_tx: mpsc::UnboundedSender<String>,
        fw_tx: mpsc::UnboundedSender<FwRequest>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let max_cons = config.server.max_cons;
        let mut max_black = config.server.max_black;

        if !config.grey.enable {
            max_black = max_cons;
        } else if max_black >= max_cons {
            // Grey connections must outweigh the blacklisted.
            max_black = max_cons.saturating_sub(100);
            if max_black == 0 {
                warn!("maximum blacklisted connections is 0");
            }
        }

        Arc::new(ServerShared {
            hostname: config.hostname(),
            banner: config.server.banner.clone(),
            reply_code: config.server.reply_code.clone(),
            grey_enabled: config.grey.enable,
            stutter: config.server.stutter,
            grey_stutter: config.grey.stutter,
            verbose: config.server.verbose,
            max_cons,
            max_black,
            clients: AtomicUsize::new(0),
            black_clients: AtomicUsize::new(0),
            grey_tx,
            fw_tx,
            shutdown,
            blacklists: RwLock::new(HashMap::new()),
        })
    }

    /// Install (or overwrite) a named blacklist.
    pub async fn add_blacklist(&self, blacklist: Blacklist) {
        let mut blacklists = self.blacklists.write().await;
        blacklists.insert(blacklist.name.clone(), Arc::new(blacklist));
    }

    /// Build and install a blacklist from a `name`/`message`/`ips`
    /// protocol message, as sent by the scanner and the config port.
    pub async fn install_blacklist(&self, message: &Message) {
        let (name, text, ips) = match (
            message.get_str("name"),
            message.get_str("message"),
            message.get_list("ips"),
        ) {
            (Some(name), Some(text), Some(ips)) => (name, text, ips),
            _ => {
                warn!("ignoring malformed blacklist configuration message");
                return;
            }
        };

        let mut blacklist = Blacklist::new_trie(name, text);
        for value in ips {
            if let Value::Str(addr) = value {
                if let Err(e) = blacklist.add(addr) {
                    warn!("blacklist {name}: skipping {addr}: {e}");
                }
            }
        }

        debug!("loaded blacklist {name} with {} addresses", ips.len());
        self.add_blacklist(blacklist).await;
    }

    /// Every installed blacklist containing the source address.
    pub async fn matching_lists(&self, ip: &IpAddr) -> Vec<MatchedList> {
        let (addr, family) = Addr::from_ip(*ip);
        let blacklists = self.blacklists.read().await;

        let mut matched: Vec<MatchedList> = blacklists
            .values()
            .filter(|bl| bl.matches(&addr, family))
            .map(|bl| MatchedList {
                name: bl.name.clone(),
                message: bl.message.clone(),
            })
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        matched
    }
}

pub struct SmtpServer {
    shared: Arc<ServerShared>,
    bind_address: Option<String>,
    bind_address_ipv6: Option<String>,
    enable_ipv6: bool,
    port: u16,
}

impl SmtpServer {
    pub fn new(config: &Config, shared: Arc<ServerShared>) -> Self {
        SmtpServer {
            shared,
            bind_address: config.server.bind_address.clone(),
            bind_address_ipv6: config.server.bind_address_ipv6.clone(),
            enable_ipv6: config.server.enable_ipv6,
            port: config.server.port,
        }
    }

    /// Accept connections until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let bind4: Ipv4Addr = match &self.bind_address {
            Some(addr) => addr
                .parse()
                .map_err(|_| crate::error::GreytrapError::Config(format!("bad bind address {addr}")))?,
            None => Ipv4Addr::UNSPECIFIED,
        };
        let listener = TcpListener::bind(SocketAddr::from((bind4, self.port))).await?;
        info!("listening for incoming connections");

        let listener6 = if self.enable_ipv6 {
            let bind6: Ipv6Addr = match &self.bind_address_ipv6 {
                Some(addr) => addr.parse().map_err(|_| {
                    crate::error::GreytrapError::Config(format!("bad IPv6 bind address {addr}"))
                })?,
                None => Ipv6Addr::UNSPECIFIED,
            };
            let listener6 = TcpListener::bind(SocketAddr::from((bind6, self.port))).await?;
            info!("listening for incoming IPv6 connections");
            Some(listener6)
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => self.handle_accept(accepted).await,
                accepted = accept_v6(&listener6), if listener6.is_some() => {
                    self.handle_accept(accepted).await
                }
            }
        }
    }

    async fn handle_accept(&self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // Out of descriptors: throttle accepting for a second.
                if matches!(e.raw_os_error(), Some(23) | Some(24)) {
                    warn!("accept failed ({e}), throttling");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                } else {
                    warn!("accept failed: {e}");
                }
                return;
            }
        };

        if self.shared.clients.load(Ordering::Relaxed) + 1 >= self.shared.max_cons {
            // At capacity; close the new connection immediately.
            drop(stream);
            return;
        }

        let local = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)));
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let session = Session::new(shared, peer, local).await;
            if let Err(e) = session.handle(stream).await {
                debug!("{}: session ended: {e}", peer.ip());
            }
        });
    }
}

async fn accept_v6(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// The loopback configuration listener: accepts one connection at a time
/// from reserved source ports and installs the blacklists it carries.
pub async fn run_config_listener(
    shared: Arc<ServerShared>,
    config_port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, config_port))).await?;

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("config accept failed: {e}");
                    continue;
                }
            },
        };

        if peer.port() >= 1024 {
            // Config connections must come from a reserved port.
            drop(stream);
            continue;
        }

        let mut reader = MessageReader::new(BufReader::new(stream));
        loop {
            match reader.next_message().await {
                Ok(Some(message)) => shared.install_blacklist(&message).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("config connection: {e}");
                    break;
                }
            }
        }
    }
}

/// Drain traplist pushes from the scanner and install them as the
/// greytrap blacklist.
pub async fn run_trap_intake(
    shared: Arc<ServerShared>,
    mut trap_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = trap_rx.recv() => match received {
                Some(text) => text,
                None => return,
            },
        };

        match crate::proto::parse(&text) {
            Ok(message) => shared.install_blacklist(&message).await,
            Err(e) => warn!("malformed traplist message: {e}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A ServerShared for unit tests: stutter off, hostname pinned, and
    /// one /24 blacklist entry per requested matched list covering
    /// 192.0.2.0/24.
    pub(crate) async fn test_shared(lists: Vec<MatchedList>) -> Arc<ServerShared> {
        let mut config = Config::default();
        config.server.hostname = Some("greytrap.test".to_string());
        config.server.stutter = 0;

        let (grey_tx, _grey_rx) = mpsc::unbounded_channel();
        let (fw_tx, _fw_rx) = mpsc::unbounded_channel();
        // Keep the receivers alive for the lifetime of the test shared.
        std::mem::forget(_grey_rx);
        std::mem::forget(_fw_rx);

        let shared =
            ServerShared::from_config(&config, grey_tx, fw_tx, CancellationToken::new());
        for list in lists {
            let mut blacklist = Blacklist::new_trie(&list.name, &list.message);
            blacklist.add("192.0.2.0/24").unwrap();
            shared.add_blacklist(blacklist).await;
        }
        shared
    }

    #[tokio::test]
    async fn test_matching_lists() {
        let shared = test_shared(vec![MatchedList {
            name: "bl".to_string(),
            message: "no".to_string(),
        }])
        .await;

        let inside: IpAddr = "192.0.2.55".parse().unwrap();
        let outside: IpAddr = "198.51.100.1".parse().unwrap();

        assert_eq!(shared.matching_lists(&inside).await.len(), 1);
        assert!(shared.matching_lists(&outside).await.is_empty());
    }

    #[tokio::test]
    async fn test_install_blacklist_from_message() {
        let shared = test_shared(Vec::new()).await;

        let message = Message::new()
            .set_str("name", "greytrap-traplist")
            .set_str("message", "trapped %A")
            .set_str_list(
                "ips",
                &["203.0.113.7/32".to_string(), "2001:db8::7/128".to_string()],
            );
        shared.install_blacklist(&message).await;

        let v4: IpAddr = "203.0.113.7".parse().unwrap();
        let v6: IpAddr = "2001:db8::7".parse().unwrap();
        let other: IpAddr = "203.0.113.8".parse().unwrap();

        assert_eq!(shared.matching_lists(&v4).await.len(), 1);
        assert_eq!(shared.matching_lists(&v6).await.len(), 1);
        assert!(shared.matching_lists(&other).await.is_empty());
    }

    #[tokio::test]
    async fn test_install_blacklist_overwrites() {
        let shared = test_shared(Vec::new()).await;

        let first = Message::new()
            .set_str("name", "bl")
            .set_str("message", "old")
            .set_str_list("ips", &["203.0.113.7/32".to_string()]);
        shared.install_blacklist(&first).await;

        let second = Message::new()
            .set_str("name", "bl")
            .set_str("message", "new")
            .set_str_list("ips", &["203.0.113.8/32".to_string()]);
        shared.install_blacklist(&second).await;

        let old: IpAddr = "203.0.113.7".parse().unwrap();
        let new: IpAddr = "203.0.113.8".parse().unwrap();
        assert!(shared.matching_lists(&old).await.is_empty());
        let matched = shared.matching_lists(&new).await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].message, "new");
    }

    #[tokio::test]
    async fn test_max_black_clamped_under_max_cons() {
        let mut config = Config::default();
        config.server.max_cons = 500;
        config.server.max_black = 800;
        let (grey_tx, _rx1) = mpsc::unbounded_channel();
        let (fw_tx, _rx2) = mpsc::unbounded_channel();

        let shared =
            ServerShared::from_config(&config, grey_tx, fw_tx, CancellationToken::new());
        assert_eq!(shared.max_black, 400);
    }

    #[tokio::test]
    async fn test_blacklist_only_mode_lifts_max_black() {
        let mut config = Config::default();
        config.grey.enable = false;
        config.server.max_cons = 500;
        config.server.max_black = 100;
        let (grey_tx, _rx1) = mpsc::unbounded_channel();
        let (fw_tx, _rx2) = mpsc::unbounded_channel();

        let shared =
            ServerShared::from_config(&config, grey_tx, fw_tx, CancellationToken::new());
        assert_eq!(shared.max_black, 500);
    }
}
