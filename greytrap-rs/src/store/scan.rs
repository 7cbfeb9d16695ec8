//! The periodic store scan: expiry, promotion and list extraction.

use super::{Driver, Key, Val};
use crate::error::Result;
use crate::net::{addr_family, Family};
use tracing::debug;

/// Lists produced by one scan pass, pushed to the firewall (whitelists)
/// and back to the daemon (traplist).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanOutcome {
    pub whitelist4: Vec<String>,
    pub whitelist6: Vec<String>,
    pub traplist: Vec<String>,
}

/// Walk the whole store in one transaction: delete expired entries, promote
/// passed tuples to IP-keyed whitelist entries (unless the IP is already
/// trapped) and collect the current white and trap lists. Any driver error
/// rolls the transaction back.
pub async fn scan(db: &mut dyn Driver, now: i64, white_exp: i64) -> Result<ScanOutcome> {
    db.start_txn().await?;

    match scan_inner(db, now, white_exp).await {
        Ok(outcome) => {
            db.commit_txn().await?;
            Ok(outcome)
        }
        Err(e) => {
            let _ = db.rollback_txn().await;
            Err(e)
        }
    }
}

async fn scan_inner(db: &mut dyn Driver, now: i64, white_exp: i64) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();

    for (key, val) in db.entries().await? {
        let gd = match val.grey() {
            Some(gd) => *gd,
            None => continue,
        };

        if gd.expire <= now && gd.pcount != -2 && gd.pcount != -3 {
            debug!(
                "deleting expired {} entry",
                match (&key, gd.pcount) {
                    (Key::Ip(_), p) if p >= 0 => "white",
                    (Key::Ip(_), _) => "greytrap",
                    _ => "grey",
                }
            );
            db.del(&key).await?;
            continue;
        }

        if gd.pcount == -1 {
            if let Key::Ip(ip) = &key {
                if addr_family(ip).is_some() {
                    outcome.traplist.push(ip.clone());
                } else {
                    db.del(&key).await?;
                }
            }
            continue;
        }

        if gd.pcount >= 0 && gd.pass <= now {
            match &key {
                Key::Tuple(gt) => {
                    // A trapped IP never gets whitelisted by a retry.
                    if let Some(Val::Grey(existing)) = db.get(&Key::Ip(gt.ip.clone())).await? {
                        if existing.pcount == -1 {
                            continue;
                        }
                    }

                    let family = match addr_family(&gt.ip) {
                        Some(family) => family,
                        None => {
                            db.del(&key).await?;
                            continue;
                        }
                    };

                    db.del(&key).await?;
                    let mut wd = gd;
                    wd.expire = now + white_exp;
                    db.put(&Key::Ip(gt.ip.clone()), &Val::Grey(wd)).await?;
                    debug!("whitelisting {}", gt.ip);

                    match family {
                        Family::V4 => outcome.whitelist4.push(gt.ip.clone()),
                        Family::V6 => outcome.whitelist6.push(gt.ip.clone()),
                    }
                }
                Key::Ip(ip) => match addr_family(ip) {
                    Some(Family::V4) => outcome.whitelist4.push(ip.clone()),
                    Some(Family::V6) => outcome.whitelist6.push(ip.clone()),
                    None => db.del(&key).await?,
                },
                _ => {}
            }
        }
    }

    Ok(outcome)
}
