//! Daemon wiring: channels between the connection engine, greylister,
//! firewall helper and sync engine, plus signal handling and the pid-file.

use crate::blacklist;
use crate::config::Config;
use crate::error::{GreytrapError, Result};
use crate::firewall::{open_firewall, run_firewall_task, Firewall};
use crate::grey::Greylister;
use crate::net::Family;
use crate::smtp::server::{run_config_listener, run_trap_intake};
use crate::smtp::{ServerShared, SmtpServer};
use crate::store::open_driver;
use crate::sync::SyncEngine;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Descriptors held back from the system ceiling for everything that is
/// not a client connection.
const MAX_FILES_THRESHOLD: usize = 200;

pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Daemon { config }
    }

    pub async fn run(self) -> Result<()> {
        let mut config = self.config;

        // Fit the connection budget under the system descriptor ceiling
        // and raise our own soft limit to match.
        let max_files = max_files()?;
        if config.server.max_cons > max_files {
            warn!(
                "{} > system max of {} connections",
                config.server.max_cons, max_files
            );
            config.server.max_cons = max_files;
        }
        config.server.max_black = config.server.max_black.min(config.server.max_cons);
        raise_fd_limit(config.server.max_cons);

        let config = &config;
        let shutdown = CancellationToken::new();
        spawn_signal_handler(shutdown.clone());

        let pidfile = config.server.pidfile.clone();
        if let Some(path) = &pidfile {
            write_pidfile(path)?;
        }

        let (grey_tx, grey_rx) = mpsc::unbounded_channel();
        let (fw_tx, fw_rx) = mpsc::unbounded_channel();
        let (trap_tx, trap_rx) = mpsc::unbounded_channel();

        let shared =
            ServerShared::from_config(config, grey_tx.clone(), fw_tx, shutdown.clone());

        // The helper holds the privileged firewall handle; boot-time
        // blacklist sets are pushed through it before it starts serving
        // NAT lookups.
        let mut fw = open_firewall(&config.firewall).await?;
        compile_blacklists(config, &shared, fw.as_mut()).await?;
        tokio::spawn(run_firewall_task(fw, fw_rx));

        // Sync engine, when peers or a listen address are configured.
        let mut sync_sender = None;
        if config.sync_send() || config.sync_recv() {
            match SyncEngine::start(&config.sync).await {
                Ok(engine) => {
                    if config.sync_send() {
                        sync_sender = Some(engine.sender());
                    }
                    if config.sync_recv() {
                        tokio::spawn(engine.run_recv(grey_tx.clone(), shutdown.clone()));
                    }
                }
                Err(e) => warn!("sync disabled: {e}"),
            }
        }

        // Greylister reader and scanner.
        if config.grey.enable {
            let db = open_driver(&config.store).await?;
            let greylister = Arc::new(Greylister::new(config, db, sync_sender));

            tokio::spawn(
                greylister
                    .clone()
                    .run_reader(grey_rx, shutdown.clone()),
            );

            let scanner_fw = open_firewall(&config.firewall).await?;
            tokio::spawn(greylister.run_scanner(trap_tx, scanner_fw, shutdown.clone()));
        }

        tokio::spawn(run_trap_intake(shared.clone(), trap_rx, shutdown.clone()));

        {
            let shared = shared.clone();
            let config_port = config.server.config_port;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = run_config_listener(shared, config_port, shutdown).await {
                    error!("config listener failed: {e}");
                }
            });
        }

        let server = SmtpServer::new(config, shared);
        let result = server.run(shutdown.clone()).await;

        info!("stopping main process");
        shutdown.cancel();
        if let Some(path) = &pidfile {
            remove_pidfile(path);
        }

        result
    }
}

/// Compile the configured feed files into runtime blacklists: each one is
/// installed for connection matching and shipped to the firewall as a
/// named set.
async fn compile_blacklists(
    config: &Config,
    shared: &Arc<ServerShared>,
    fw: &mut dyn Firewall,
) -> Result<()> {
    if config.blacklists.is_empty() {
        return Ok(());
    }

    let mut white_feeds = Vec::new();
    for feed in &config.whitelists {
        white_feeds.push(read_feed(&feed.file)?);
    }

    for feed in &config.blacklists {
        let black = read_feed(&feed.file)?;
        let (runtime, cidrs) =
            blacklist::feed::compile(&feed.name, &feed.message, &[black], &white_feeds)?;
        info!("blacklist {}: {} collapsed blocks", feed.name, cidrs.len());

        let blocks: Vec<String> = cidrs.iter().map(|c| c.to_string()).collect();
        fw.replace(&feed.name, &blocks, Family::V4).await?;
        shared.add_blacklist(runtime).await;
    }

    Ok(())
}

/// System descriptor ceiling the connection budget must fit under.
fn max_files() -> Result<usize> {
    let mut max_files = crate::smtp::CON_DEFAULT_MAX;

    if let Ok(text) = std::fs::read_to_string("/proc/sys/fs/file-max") {
        if let Ok(value) = text.trim().parse::<usize>() {
            max_files = value;
        }
    }

    if max_files.saturating_sub(MAX_FILES_THRESHOLD) < 10 {
        return Err(GreytrapError::Config(format!(
            "max files is only {max_files}, refusing to continue"
        )));
    }

    Ok(max_files - MAX_FILES_THRESHOLD)
}

/// Lift the soft fd limit to cover every connection plus bookkeeping.
fn raise_fd_limit(max_cons: usize) {
    let wanted = (max_cons + 15) as libc::rlim_t;
    let limit = libc::rlimit {
        rlim_cur: wanted,
        rlim_max: wanted,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        warn!(
            "could not raise RLIMIT_NOFILE to {wanted}: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(int) => int,
            Err(e) => {
                error!("cannot install SIGINT handler: {e}");
                return;
            }
        };
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(hup) => hup,
            Err(e) => {
                error!("cannot install SIGHUP handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv() => info!("received SIGINT"),
            _ = hup.recv() => info!("received SIGHUP"),
        }
        shutdown.cancel();
    });
}

fn read_feed(path: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| GreytrapError::Config(format!("cannot read feed {path}: {e}")))
}

/// Refuse to start over an apparently live pid-file, then record our pid.
fn write_pidfile(path: &str) -> Result<()> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if Path::new(&format!("/proc/{pid}")).exists() {
                return Err(GreytrapError::Config(format!(
                    "already running as pid {pid} (per {path})"
                )));
            }
        }
    }

    std::fs::write(path, format!("{}\n", std::process::id()))
        .map_err(|e| GreytrapError::Config(format!("could not write pidfile {path}: {e}")))
}

fn remove_pidfile(path: &str) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("could not remove pidfile {path}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greytrap.pid");
        let path = path.to_str().unwrap();

        write_pidfile(path).unwrap();
        // Our own pid is alive, so a second start must refuse.
        assert!(write_pidfile(path).is_err());

        remove_pidfile(path);
        assert!(!Path::new(path).exists());
    }

    #[test]
    fn test_stale_pidfile_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greytrap.pid");
        let path = path.to_str().unwrap();

        // No such pid: 2^22 is above the default kernel pid_max.
        std::fs::write(path, "4194304\n").unwrap();
        write_pidfile(path).unwrap();

        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());
    }
}
