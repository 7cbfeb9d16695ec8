//! The reader half of the greylister: consumes grey/trap/white messages
//! from the daemon pipe and applies them to the tuple store.

use super::{Greylister, GREY_MSG_GREY, GREY_MSG_TRAP, GREY_MSG_WHITE};
use crate::error::{GreytrapError, Result};
use crate::proto::{self, Message};
use crate::store::{Driver, GreyData, GreyTuple, Key, Val};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl Greylister {
    /// Drain the greylister pipe until shutdown. A malformed or failing
    /// message is logged and skipped, never fatal.
    pub async fn run_reader(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
        shutdown: CancellationToken,
    ) {
        loop {
            let text = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = rx.recv() => match received {
                    Some(text) => text,
                    None => return,
                },
            };

            match proto::parse(&text) {
                Ok(message) => {
                    if let Err(e) = self.process_message(&message).await {
                        warn!("greylist update failed: {e}");
                    }
                }
                Err(e) => warn!("malformed greylist message: {e}"),
            }
        }
    }

    /// Dispatch one pipe message. `sync = 0` marks messages that arrived
    /// via the sync engine and must not be re-broadcast.
    pub async fn process_message(&self, message: &Message) -> Result<()> {
        let local = message.get_int("sync").unwrap_or(1) != 0;
        let now = super::unix_now();

        match message.get_int("type") {
            Some(GREY_MSG_GREY) => {
                let (ip, helo, from, to) = match (
                    message.get_str("ip"),
                    message.get_str("helo"),
                    message.get_str("from"),
                    message.get_str("to"),
                ) {
                    (Some(ip), Some(helo), Some(from), Some(to)) => (ip, helo, from, to),
                    _ => {
                        warn!("incomplete grey message");
                        return Ok(());
                    }
                };

                let gt = GreyTuple {
                    ip: ip.to_string(),
                    helo: helo.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                };
                let dst_ip = message.get_str("dst_ip").unwrap_or("");
                self.process_grey(&gt, local, dst_ip, now).await
            }
            Some(msg_type @ (GREY_MSG_TRAP | GREY_MSG_WHITE)) => {
                let expires_int = message.get_int("expires").map(|i| i.to_string());
                let (ip, source, expires) = match (
                    message.get_str("ip"),
                    message.get_str("source"),
                    message.get_str("expires").or(expires_int.as_deref()),
                ) {
                    (Some(ip), Some(source), Some(expires)) => (ip, source, expires),
                    _ => {
                        warn!("incomplete trap/white message");
                        return Ok(());
                    }
                };

                self.process_non_grey(msg_type == GREY_MSG_TRAP, ip, source, expires, now, local)
                    .await
            }
            other => {
                warn!("unknown greylist message type {other:?}");
                Ok(())
            }
        }
    }

    /// Apply a grey event: decide spamtrap, then insert or update the
    /// matching store entry inside a transaction.
    pub async fn process_grey(
        &self,
        gt: &GreyTuple,
        local: bool,
        dst_ip: &str,
        now: i64,
    ) -> Result<()> {
        let (spamtrap, expire_abs) = {
            let mut db = self.db().lock().await;
            let db = &mut **db;

            let spamtrap = self.trap_check(db, &gt.to).await?;

            db.start_txn().await?;
            match self.grey_txn(db, gt, spamtrap, local, dst_ip, now).await {
                Ok(outcome) => {
                    db.commit_txn().await?;
                    outcome
                }
                Err(e) => {
                    let _ = db.rollback_txn().await;
                    return Err(e);
                }
            }
        };

        if local {
            if let Some(sync) = self.sync() {
                if spamtrap {
                    debug!("sync trap {}", gt.ip);
                    sync.trapped(now, expire_abs, &gt.ip).await;
                } else {
                    sync.update(now, &gt.ip, &gt.helo, &gt.from, &gt.to).await;
                }
            }
        }

        Ok(())
    }

    async fn grey_txn(
        &self,
        db: &mut dyn Driver,
        gt: &GreyTuple,
        mut spamtrap: bool,
        local: bool,
        dst_ip: &str,
        now: i64,
    ) -> Result<(bool, i64)> {
        let (mut expire, pass_time) = if spamtrap {
            (self.trap_exp, self.trap_exp)
        } else {
            (self.grey_exp, self.pass_time)
        };
        let mut key = if spamtrap {
            Key::Ip(gt.ip.clone())
        } else {
            Key::Tuple(gt.clone())
        };

        match db.get(&key).await? {
            None => {
                if local && !spamtrap && self.low_prio_mx_armed(now) {
                    if let Some(mx) = &self.low_prio_mx {
                        if dst_ip == mx {
                            // No greylist history, yet the client tried the
                            // low-priority MX first; RFC-abiding mailers
                            // never do that.
                            spamtrap = true;
                            expire = self.trap_exp;
                            key = Key::Ip(gt.ip.clone());
                            debug!(
                                "trapping {} for trying {} first for tuple ({}, {}, {}, {})",
                                gt.ip, mx, gt.ip, gt.helo, gt.from, gt.to
                            );
                        }
                    }
                }

                let gd = GreyData {
                    first: now,
                    pass: now + pass_time,
                    expire: now + expire,
                    bcount: 1,
                    pcount: if spamtrap { -1 } else { 0 },
                };
                db.put(&key, &Val::Grey(gd)).await?;
                debug!(
                    "new {}entry {} from {} to {}, helo {}",
                    if spamtrap { "greytrap " } else { "" },
                    gt.ip,
                    gt.from,
                    gt.to,
                    gt.helo
                );
            }
            Some(val) => {
                let mut gd = *val
                    .grey()
                    .ok_or_else(|| GreytrapError::Store("grey value expected".to_string()))?;
                gd.bcount += 1;
                gd.pcount = if spamtrap { -1 } else { 0 };
                if gd.first + self.pass_time < now {
                    gd.pass = now;
                }
                db.put(&key, &Val::Grey(gd)).await?;
                debug!(
                    "updated {}entry {} from {} to {}, helo {}",
                    if spamtrap { "greytrap " } else { "" },
                    gt.ip,
                    gt.from,
                    gt.to,
                    gt.helo
                );
            }
        }

        Ok((spamtrap, now + expire))
    }

    /// Apply a trap or white event carrying an absolute expiry.
    pub async fn process_non_grey(
        &self,
        spamtrap: bool,
        ip: &str,
        source: &str,
        expires: &str,
        now: i64,
        local: bool,
    ) -> Result<()> {
        let expire: i64 = match expires.trim().parse() {
            Ok(expire) if expire != 0 => expire,
            _ => {
                warn!("could not parse expires {expires}");
                return Ok(());
            }
        };

        {
            let mut db = self.db().lock().await;
            let db = &mut **db;
            let key = Key::Ip(ip.to_string());

            db.start_txn().await?;
            let result = async {
                match db.get(&key).await? {
                    None => {
                        let gd = GreyData {
                            first: now,
                            pass: now,
                            expire,
                            bcount: 0,
                            pcount: if spamtrap { -1 } else { 1 },
                        };
                        db.put(&key, &Val::Grey(gd)).await?;
                        debug!(
                            "new {} from {} for {}, expires {}",
                            if spamtrap { "TRAP" } else { "WHITE" },
                            source,
                            ip,
                            expires
                        );
                    }
                    Some(val) => {
                        let mut gd = *val.grey().ok_or_else(|| {
                            GreytrapError::Store("grey value expected".to_string())
                        })?;
                        if spamtrap {
                            gd.pcount = -1;
                            gd.bcount += 1;
                        } else {
                            gd.pcount += 1;
                        }
                        gd.expire = expire;
                        db.put(&key, &Val::Grey(gd)).await?;
                        debug!("updated {ip}");
                    }
                }
                Ok::<(), GreytrapError>(())
            }
            .await;

            match result {
                Ok(()) => db.commit_txn().await?,
                Err(e) => {
                    let _ = db.rollback_txn().await;
                    return Err(e);
                }
            }
        }

        if local {
            if let Some(sync) = self.sync() {
                if spamtrap {
                    sync.trapped(now, expire, ip).await;
                } else {
                    sync.white(now, expire, ip).await;
                }
            }
        }

        Ok(())
    }

    /// Is the recipient a spamtrap? True when the address is a stored trap
    /// address, or when permitted-domain filtering is on and no stored
    /// domain is a suffix of the recipient.
    async fn trap_check(&self, db: &mut dyn Driver, to: &str) -> Result<bool> {
        let normalized = crate::store::normalize_email_addr(to);

        if db.get(&Key::Mail(normalized.clone())).await?.is_some() {
            return Ok(true);
        }

        if self.permitted_domains {
            return Ok(db.get(&Key::DomainSuffix(normalized)).await?.is_none());
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{MemoryDriver, SharedDriver};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    const NOW: i64 = 1_000_000;

    async fn greylister() -> (Greylister, SharedDriver) {
        let mut db = MemoryDriver::new();
        db.open(false).await.unwrap();
        let db: SharedDriver = Arc::new(Mutex::new(Box::new(db)));

        let mut grey = Greylister::new(&Config::default(), db.clone(), None);
        grey.set_startup(NOW - 3600);
        (grey, db)
    }

    fn tuple() -> GreyTuple {
        GreyTuple {
            ip: "192.0.2.10".to_string(),
            helo: "h".to_string(),
            from: "a@b".to_string(),
            to: "c@d".to_string(),
        }
    }

    async fn get(db: &SharedDriver, key: &Key) -> Option<Val> {
        db.lock().await.get(key).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_contact_creates_grey_entry() {
        let (grey, db) = greylister().await;

        grey.process_grey(&tuple(), true, "", NOW).await.unwrap();

        match get(&db, &Key::Tuple(tuple())).await {
            Some(Val::Grey(gd)) => {
                assert_eq!(gd.pcount, 0);
                assert_eq!(gd.bcount, 1);
                assert_eq!(gd.first, NOW);
                assert_eq!(gd.pass, NOW + 60 * 25);
                assert_eq!(gd.expire, NOW + 60 * 60 * 4);
            }
            other => panic!("expected grey entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_within_pass_time_only_bumps_bcount() {
        let (grey, db) = greylister().await;

        grey.process_grey(&tuple(), true, "", NOW).await.unwrap();
        grey.process_grey(&tuple(), true, "", NOW + 600).await.unwrap();

        match get(&db, &Key::Tuple(tuple())).await {
            Some(Val::Grey(gd)) => {
                assert_eq!(gd.bcount, 2);
                assert_eq!(gd.pcount, 0);
                // pass is untouched inside the pass window.
                assert_eq!(gd.pass, NOW + 60 * 25);
            }
            other => panic!("expected grey entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_after_pass_time_refreshes_pass() {
        let (grey, db) = greylister().await;

        grey.process_grey(&tuple(), true, "", NOW).await.unwrap();
        let later = NOW + 60 * 30;
        grey.process_grey(&tuple(), true, "", later).await.unwrap();

        match get(&db, &Key::Tuple(tuple())).await {
            Some(Val::Grey(gd)) => assert_eq!(gd.pass, later),
            other => panic!("expected grey entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spamtrap_recipient_traps_ip() {
        let (grey, db) = greylister().await;

        db.lock()
            .await
            .put(
                &Key::Mail("trap@local".to_string()),
                &Val::Grey(GreyData {
                    pcount: -2,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let mut gt = tuple();
        gt.to = "trap@local".to_string();
        grey.process_grey(&gt, true, "", NOW).await.unwrap();

        match get(&db, &Key::Ip("192.0.2.10".to_string())).await {
            Some(Val::Grey(gd)) => {
                assert_eq!(gd.pcount, -1);
                assert_eq!(gd.expire, NOW + 60 * 60 * 24);
            }
            other => panic!("expected trap entry, got {other:?}"),
        }
        assert!(get(&db, &Key::Tuple(gt)).await.is_none());
    }

    #[tokio::test]
    async fn test_low_prio_mx_first_contact_traps() {
        let (mut grey, db) = greylister().await;
        grey.low_prio_mx = Some("10.9.9.9".to_string());

        grey.process_grey(&tuple(), true, "10.9.9.9", NOW)
            .await
            .unwrap();

        match get(&db, &Key::Ip("192.0.2.10".to_string())).await {
            Some(Val::Grey(gd)) => assert_eq!(gd.pcount, -1),
            other => panic!("expected trap entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_low_prio_mx_inert_during_grace() {
        let (mut grey, db) = greylister().await;
        grey.low_prio_mx = Some("10.9.9.9".to_string());
        grey.set_startup(NOW - 10);

        grey.process_grey(&tuple(), true, "10.9.9.9", NOW)
            .await
            .unwrap();

        assert!(get(&db, &Key::Tuple(tuple())).await.is_some());
        assert!(get(&db, &Key::Ip("192.0.2.10".to_string())).await.is_none());
    }

    #[tokio::test]
    async fn test_permitted_domains_trap_outsiders() {
        let (mut grey, db) = greylister().await;
        grey.permitted_domains = true;

        db.lock()
            .await
            .put(
                &Key::Domain("good.example".to_string()),
                &Val::Grey(GreyData {
                    pcount: -3,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let mut allowed = tuple();
        allowed.to = "user@good.example".to_string();
        grey.process_grey(&allowed, true, "", NOW).await.unwrap();
        assert!(get(&db, &Key::Tuple(allowed)).await.is_some());

        let mut outsider = tuple();
        outsider.ip = "192.0.2.11".to_string();
        outsider.to = "user@evil.example".to_string();
        grey.process_grey(&outsider, true, "", NOW).await.unwrap();
        assert!(get(&db, &Key::Ip("192.0.2.11".to_string())).await.is_some());
    }

    #[tokio::test]
    async fn test_white_message_upserts_ip_entry() {
        let (grey, db) = greylister().await;

        grey.process_non_grey(false, "203.0.113.5", "admin", "2000000", NOW, true)
            .await
            .unwrap();

        match get(&db, &Key::Ip("203.0.113.5".to_string())).await {
            Some(Val::Grey(gd)) => {
                assert_eq!(gd.pcount, 1);
                assert_eq!(gd.expire, 2_000_000);
                assert_eq!(gd.first, NOW);
                assert_eq!(gd.pass, NOW);
            }
            other => panic!("expected white entry, got {other:?}"),
        }

        // A second white bumps the pass count.
        grey.process_non_grey(false, "203.0.113.5", "admin", "2000000", NOW, true)
            .await
            .unwrap();
        match get(&db, &Key::Ip("203.0.113.5".to_string())).await {
            Some(Val::Grey(gd)) => assert_eq!(gd.pcount, 2),
            other => panic!("expected white entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trap_message_overrides_white() {
        let (grey, db) = greylister().await;

        grey.process_non_grey(false, "203.0.113.6", "admin", "2000000", NOW, true)
            .await
            .unwrap();
        grey.process_non_grey(true, "203.0.113.6", "peer", "3000000", NOW, true)
            .await
            .unwrap();

        match get(&db, &Key::Ip("203.0.113.6".to_string())).await {
            Some(Val::Grey(gd)) => {
                assert_eq!(gd.pcount, -1);
                assert_eq!(gd.bcount, 1);
                assert_eq!(gd.expire, 3_000_000);
            }
            other => panic!("expected trap entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_expires_is_skipped() {
        let (grey, db) = greylister().await;

        grey.process_non_grey(true, "203.0.113.7", "peer", "soon", NOW, true)
            .await
            .unwrap();
        grey.process_non_grey(true, "203.0.113.7", "peer", "0", NOW, true)
            .await
            .unwrap();

        assert!(get(&db, &Key::Ip("203.0.113.7".to_string())).await.is_none());
    }

    #[tokio::test]
    async fn test_process_message_dispatch() {
        let (grey, db) = greylister().await;

        let message = Message::new()
            .set_int("type", GREY_MSG_GREY)
            .set_str("dst_ip", "")
            .set_str("ip", "192.0.2.10")
            .set_str("helo", "h")
            .set_str("from", "a@b")
            .set_str("to", "c@d");
        grey.process_message(&message).await.unwrap();

        assert!(get(&db, &Key::Tuple(tuple())).await.is_some());

        // Unknown types and incomplete messages are tolerated.
        grey.process_message(&Message::new().set_int("type", 99))
            .await
            .unwrap();
        grey.process_message(&Message::new().set_int("type", GREY_MSG_GREY))
            .await
            .unwrap();
    }
}
