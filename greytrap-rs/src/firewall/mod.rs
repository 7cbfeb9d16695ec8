//! Firewall control: driver contract, the built-in no-op driver and the
//! helper task answering NAT lookups for the connection engine.
//!
//! Concrete packet-filter integrations plug in behind the [`Firewall`]
//! trait; only the dummy driver ships here.

pub mod dummy;
pub mod task;

pub use dummy::DummyFirewall;
pub use task::{run_firewall_task, FwRequest};

use crate::config::FirewallConfig;
use crate::error::{GreytrapError, Result};
use crate::net::Family;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};

/// Driver contract for the host packet filter.
#[async_trait]
pub trait Firewall: Send {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    /// Atomically replace the named address set with the supplied CIDRs.
    async fn replace(&mut self, set: &str, cidrs: &[String], family: Family) -> Result<()>;
    /// Reverse-NAT lookup: the original destination of a redirected
    /// connection, or `None` when the filter has no record of it.
    async fn lookup_orig_dst(
        &mut self,
        src: &SocketAddr,
        proxy: &SocketAddr,
    ) -> Result<Option<IpAddr>>;
    async fn start_log_capture(&mut self) -> Result<()>;
    async fn end_log_capture(&mut self) -> Result<()>;
    async fn capture_log(&mut self) -> Result<Vec<String>>;
}

/// Select and open the configured firewall driver.
pub async fn open_firewall(config: &FirewallConfig) -> Result<Box<dyn Firewall>> {
    let mut driver: Box<dyn Firewall> = match config.driver.as_str() {
        "dummy" => Box::new(DummyFirewall::new()),
        other => {
            return Err(GreytrapError::Config(format!(
                "unknown firewall driver: {other}"
            )))
        }
    };

    driver.open().await?;
    Ok(driver)
}
