//! No-op firewall driver: logs what a real driver would do.

use super::Firewall;
use crate::error::Result;
use crate::net::Family;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use tracing::info;

#[derive(Default)]
pub struct DummyFirewall {
    capturing: bool,
}

impl DummyFirewall {
    pub fn new() -> Self {
        DummyFirewall::default()
    }
}

#[async_trait]
impl Firewall for DummyFirewall {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn replace(&mut self, set: &str, cidrs: &[String], family: Family) -> Result<()> {
        info!(
            "would replace {:?} set {} with {} entries",
            family,
            set,
            cidrs.len()
        );
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
        self.capturing = true;
        Ok(())
    }

    async fn end_log_capture(&mut self) -> Result<()> {
        self.capturing = false;
        Ok(())
    }

    async fn capture_log(&mut self) -> Result<Vec<String>> {
        if !self.capturing {
            return Err(crate::error::GreytrapError::Firewall(
                "log capture not started".to_string(),
            ));
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dummy_lifecycle() {
        let mut fw = DummyFirewall::new();
        fw.open().await.unwrap();
        fw.replace("greytrap-whitelist", &["10.0.0.1/32".to_string()], Family::V4)
            .await
            .unwrap();

        let src: SocketAddr = "192.0.2.1:555".parse().unwrap();
        let proxy: SocketAddr = "10.0.0.1:8025".parse().unwrap();
        assert!(fw.lookup_orig_dst(&src, &proxy).await.unwrap().is_none());

        fw.start_log_capture().await.unwrap();
        assert!(fw.capture_log().await.unwrap().is_empty());
        fw.end_log_capture().await.unwrap();
        fw.close().await.unwrap();
    }
}
