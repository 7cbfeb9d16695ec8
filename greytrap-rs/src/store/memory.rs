//! In-memory store driver.
//!
//! A `BTreeMap` with a clone-on-transaction snapshot for rollback. Used by
//! the test suite and by storeless (blacklist-only) deployments.

#[cfg(test)]
use super::GreyData;
use super::{Driver, Key, Val};
use crate::error::{GreytrapError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct MemoryDriver {
    map: BTreeMap<Key, Val>,
    snapshot: Option<BTreeMap<Key, Val>>,
    open: bool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(GreytrapError::Store("store not open".to_string()))
        }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn open(&mut self, _read_only: bool) -> Result<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.snapshot = None;
        Ok(())
    }

    async fn put(&mut self, key: &Key, val: &Val) -> Result<()> {
        self.ensure_open()?;
        if matches!(key, Key::DomainSuffix(_)) {
            if self.snapshot.is_some() {
                self.rollback_txn().await?;
            }
            return Err(GreytrapError::Store(
                "domain-suffix keys are match-only".to_string(),
            ));
        }

        self.map.insert(key.clone(), val.clone());
        Ok(())
    }

    async fn get(&mut self, key: &Key) -> Result<Option<Val>> {
        self.ensure_open()?;

        if let Key::DomainSuffix(name) = key {
            for stored in self.map.keys() {
                if let Key::Domain(domain) = stored {
                    if name.ends_with(domain.as_str()) {
                        return Ok(Some(Val::MatchSuffix(domain.clone())));
                    }
                }
            }
            return Ok(None);
        }

        Ok(self.map.get(key).cloned())
    }

    async fn del(&mut self, key: &Key) -> Result<()> {
        self.ensure_open()?;
        self.map.remove(key);
        Ok(())
    }

    async fn start_txn(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.snapshot = Some(self.map.clone());
        Ok(())
    }

    async fn commit_txn(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.snapshot = None;
        Ok(())
    }

    async fn rollback_txn(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(snapshot) = self.snapshot.take() {
            self.map = snapshot;
        }
        Ok(())
    }

    async fn entries(&mut self) -> Result<Vec<(Key, Val)>> {
        self.ensure_open()?;
        Ok(self
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
