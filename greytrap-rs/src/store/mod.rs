//! The durable tuple store behind the greylister.
//!
//! Keys are tagged: a full grey tuple, a bare IP (whitelist or trap entry),
//! a spamtrap mail address, or a permitted domain. `DomainSuffix` is a
//! read-only match key: it finds any stored domain that is a suffix of the
//! queried name. Drivers are selected once at startup and hidden behind an
//! async trait object.

pub mod memory;
pub mod scan;
pub mod sqlite;

pub use memory::MemoryDriver;
pub use scan::{scan, ScanOutcome};
pub use sqlite::SqliteDriver;

use crate::config::StoreConfig;
use crate::error::{GreytrapError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Maximum stored mail-address length.
pub const MAX_MAIL: usize = 1024;

/// The four strings identifying a grey entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GreyTuple {
    pub ip: String,
    pub helo: String,
    pub from: String,
    pub to: String,
}

/// Counters attached to every grey/white/trap entry.
///
/// `pcount` doubles as a discriminator: >= 0 counts passes (a whitelist
/// entry once it reaches 1), -1 marks a trapped IP, -2 a spamtrap mail
/// address and -3 a permitted domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GreyData {
    pub first: i64,
    pub pass: i64,
    pub expire: i64,
    pub bcount: i64,
    pub pcount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Tuple(GreyTuple),
    Ip(String),
    Mail(String),
    Domain(String),
    /// Get-only: matches any stored domain that is a suffix of the name.
    DomainSuffix(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Grey(GreyData),
    /// The stored domain a `DomainSuffix` query matched.
    MatchSuffix(String),
}

impl Val {
    pub fn grey(&self) -> Option<&GreyData> {
        match self {
            Val::Grey(gd) => Some(gd),
            Val::MatchSuffix(_) => None,
        }
    }
}

/// Lowercase a mail address and strip surrounding angle brackets.
pub fn normalize_email_addr(addr: &str) -> String {
    let addr = addr.strip_prefix('<').unwrap_or(addr);
    let addr = addr.strip_suffix('>').unwrap_or(addr);
    let mut out = addr.to_lowercase();
    out.truncate(MAX_MAIL);
    out
}

/// Store driver contract. `get` answers NotFound as `None`; every other
/// failure is an error, and a write that fails inside an open transaction
/// rolls the transaction back before returning.
#[async_trait]
pub trait Driver: Send {
    async fn open(&mut self, read_only: bool) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn put(&mut self, key: &Key, val: &Val) -> Result<()>;
    async fn get(&mut self, key: &Key) -> Result<Option<Val>>;
    async fn del(&mut self, key: &Key) -> Result<()>;
    async fn start_txn(&mut self) -> Result<()>;
    async fn commit_txn(&mut self) -> Result<()>;
    async fn rollback_txn(&mut self) -> Result<()>;
    /// Full ordered snapshot of the store, consumed by the scanner.
    async fn entries(&mut self) -> Result<Vec<(Key, Val)>>;
}

/// The reader and the scanner mutate the same store; they serialise
/// through this handle.
pub type SharedDriver = Arc<Mutex<Box<dyn Driver>>>;

/// Select and open the configured driver.
pub async fn open_driver(config: &StoreConfig) -> Result<SharedDriver> {
    let mut driver: Box<dyn Driver> = match config.driver.as_str() {
        "sqlite" => Box::new(SqliteDriver::new(&config.path)),
        "memory" => Box::new(MemoryDriver::new()),
        other => {
            return Err(GreytrapError::Config(format!(
                "unknown store driver: {other}"
            )))
        }
    };

    driver.open(false).await?;
    Ok(Arc::new(Mutex::new(driver)))
}
