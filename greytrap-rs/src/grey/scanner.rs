//! The scanner half of the greylister: periodic store scans, traplist
//! pushes to the daemon and whitelist pushes to the firewall.

use super::Greylister;
use crate::error::Result;
use crate::firewall::Firewall;
use crate::net::{addr_family, Family};
use crate::proto::Message;
use crate::store::scan;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl Greylister {
    /// Scan immediately and then on every interval tick until shutdown.
    /// A failed pass is logged and retried at the next tick.
    pub async fn run_scanner(
        self: Arc<Self>,
        trap_tx: mpsc::UnboundedSender<String>,
        mut fw: Box<dyn Firewall>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.scan_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.scan_once(&trap_tx, fw.as_mut()).await {
                warn!("db scan failed: {e}");
            }
        }
    }

    /// One scan pass: expire and promote store entries, ship the traplist
    /// to the daemon and replace the firewall whitelist sets.
    pub async fn scan_once(
        &self,
        trap_tx: &mpsc::UnboundedSender<String>,
        fw: &mut dyn Firewall,
    ) -> Result<()> {
        let now = super::unix_now();

        let outcome = {
            let mut db = self.db().lock().await;
            scan(&mut **db, now, self.white_exp).await?
        };

        if !outcome.traplist.is_empty() {
            let ips: Vec<String> = outcome
                .traplist
                .iter()
                .map(|ip| {
                    let bits = match addr_family(ip) {
                        Some(Family::V6) => 128,
                        _ => 32,
                    };
                    format!("{ip}/{bits}")
                })
                .collect();

            let message = Message::new()
                .set_str("name", &self.traplist_name)
                .set_str("message", &self.traplist_msg)
                .set_str_list("ips", &ips);
            let _ = trap_tx.send(message.emit());
        }

        fw.replace(&self.whitelist_name, &outcome.whitelist4, Family::V4)
            .await?;
        if self.enable_ipv6 {
            fw.replace(&self.whitelist_name_ipv6, &outcome.whitelist6, Family::V6)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::GreytrapError;
    use crate::proto;
    use crate::store::{Driver, GreyData, GreyTuple, Key, MemoryDriver, SharedDriver, Val};
    use async_trait::async_trait;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    const NOW_OFFSET: i64 = 10_000;

    /// Records replace calls for assertions.
    #[derive(Default)]
    struct RecordingFirewall {
        replaced: StdMutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl Firewall for RecordingFirewall {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
        async fn replace(
            &mut self,
            set: &str,
            cidrs: &[String],
            _family: Family,
        ) -> Result<()> {
            self.replaced
                .lock()
                .unwrap()
                .push((set.to_string(), cidrs.to_vec()));
            Ok(())
        }
        async fn lookup_orig_dst(
            &mut self,
            _src: &SocketAddr,
            _proxy: &SocketAddr,
        ) -> Result<Option<IpAddr>> {
            Ok(None)
        }
        async fn start_log_capture(&mut self) -> Result<()> {
            Ok(())
        }
        async fn end_log_capture(&mut self) -> Result<()> {
            Ok(())
        }
        async fn capture_log(&mut self) -> Result<Vec<String>> {
            Err(GreytrapError::Firewall("no log capture".to_string()))
        }
    }

    async fn greylister_with_db() -> (Arc<Greylister>, SharedDriver) {
        let mut db = MemoryDriver::new();
        db.open(false).await.unwrap();
        let db: SharedDriver = Arc::new(Mutex::new(Box::new(db)));
        let grey = Arc::new(Greylister::new(&Config::default(), db.clone(), None));
        (grey, db)
    }

    #[tokio::test]
    async fn test_scan_once_ships_traplist_and_whitelist() {
        let (grey, db) = greylister_with_db().await;
        let now = super::super::unix_now();

        {
            let mut db = db.lock().await;
            db.put(
                &Key::Ip("192.0.2.66".to_string()),
                &Val::Grey(GreyData {
                    first: now - 100,
                    pass: now + NOW_OFFSET,
                    expire: now + NOW_OFFSET,
                    bcount: 3,
                    pcount: -1,
                }),
            )
            .await
            .unwrap();
            db.put(
                &Key::Tuple(GreyTuple {
                    ip: "198.51.100.2".to_string(),
                    helo: "h".to_string(),
                    from: "a@b".to_string(),
                    to: "c@d".to_string(),
                }),
                &Val::Grey(GreyData {
                    first: now - 3000,
                    pass: now - 10,
                    expire: now + NOW_OFFSET,
                    bcount: 2,
                    pcount: 0,
                }),
            )
            .await
            .unwrap();
        }

        let (trap_tx, mut trap_rx) = mpsc::unbounded_channel();
        let mut fw = RecordingFirewall::default();
        grey.scan_once(&trap_tx, &mut fw).await.unwrap();

        let trap_msg = proto::parse(&trap_rx.recv().await.unwrap()).unwrap();
        assert_eq!(trap_msg.get_str("name"), Some("greytrap-traplist"));
        let ips = trap_msg.get_list("ips").unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(
            ips[0],
            crate::proto::Value::Str("192.0.2.66/32".to_string())
        );

        let replaced = fw.replaced.lock().unwrap();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].0, "greytrap-whitelist");
        assert_eq!(replaced[0].1, vec!["198.51.100.2".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_once_quiet_without_traps() {
        let (grey, _db) = greylister_with_db().await;

        let (trap_tx, mut trap_rx) = mpsc::unbounded_channel();
        let mut fw = RecordingFirewall::default();
        grey.scan_once(&trap_tx, &mut fw).await.unwrap();

        // No traplist message when there are no trapped addresses, but the
        // whitelist set is still replaced (with nothing).
        assert!(trap_rx.try_recv().is_err());
        assert_eq!(fw.replaced.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_once_replaces_v6_when_enabled() {
        let mut db = MemoryDriver::new();
        db.open(false).await.unwrap();
        let db: SharedDriver = Arc::new(Mutex::new(Box::new(db)));

        let mut config = Config::default();
        config.server.enable_ipv6 = true;
        let grey = Arc::new(Greylister::new(&config, db, None));

        let (trap_tx, _trap_rx) = mpsc::unbounded_channel();
        let mut fw = RecordingFirewall::default();
        grey.scan_once(&trap_tx, &mut fw).await.unwrap();

        let replaced = fw.replaced.lock().unwrap();
        assert_eq!(replaced.len(), 2);
        assert_eq!(replaced[1].0, "greytrap-whitelist-ipv6");
    }
}
