//! The greylisting engine: policy configuration plus the reader and
//! scanner tasks around the tuple store.

pub mod reader;
pub mod scanner;

use crate::config::Config;
use crate::store::SharedDriver;
use crate::sync::SyncSender;
use chrono::Utc;
use std::time::Duration;

/// Message types on the greylister pipe.
pub const GREY_MSG_GREY: i64 = 1;
pub const GREY_MSG_TRAP: i64 = 2;
pub const GREY_MSG_WHITE: i64 = 3;

/// Grace period after boot before the low-priority-MX trap arms; a
/// freshly started daemon has no history to judge first contacts by.
const LOW_PRIO_MX_GRACE: i64 = 60;

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Long-lived greylister state shared by the reader and scanner tasks.
pub struct Greylister {
    pub pass_time: i64,
    pub grey_exp: i64,
    pub white_exp: i64,
    pub trap_exp: i64,
    pub scan_interval: Duration,
    pub low_prio_mx: Option<String>,
    /// When set, recipients outside the stored permitted domains are
    /// treated as spamtrap hits.
    pub permitted_domains: bool,
    pub traplist_name: String,
    pub traplist_msg: String,
    pub whitelist_name: String,
    pub whitelist_name_ipv6: String,
    pub enable_ipv6: bool,
    startup: i64,
    db: SharedDriver,
    sync: Option<SyncSender>,
}

impl Greylister {
    pub fn new(config: &Config, db: SharedDriver, sync: Option<SyncSender>) -> Self {
        Greylister {
            pass_time: config.grey.pass_time,
            grey_exp: config.grey.grey_expiry,
            white_exp: config.grey.white_expiry,
            trap_exp: config.grey.trap_expiry,
            scan_interval: Duration::from_secs(config.grey.scan_interval),
            low_prio_mx: config.grey.low_prio_mx.clone(),
            permitted_domains: config.grey.permitted_domains,
            traplist_name: config.grey.traplist_name.clone(),
            traplist_msg: config.grey.traplist_message.clone(),
            whitelist_name: config.grey.whitelist_name.clone(),
            whitelist_name_ipv6: config.grey.whitelist_name_ipv6.clone(),
            enable_ipv6: config.server.enable_ipv6,
            startup: unix_now(),
            db,
            sync,
        }
    }

    pub(crate) fn db(&self) -> &SharedDriver {
        &self.db
    }

    pub(crate) fn sync(&self) -> Option<&SyncSender> {
        self.sync.as_ref()
    }

    fn low_prio_mx_armed(&self, now: i64) -> bool {
        self.startup + LOW_PRIO_MX_GRACE < now
    }

    #[cfg(test)]
    pub(crate) fn set_startup(&mut self, startup: i64) {
        self.startup = startup;
    }
}
