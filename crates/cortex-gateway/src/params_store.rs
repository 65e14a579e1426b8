//! Parameter store port.
//!
//! Keyed by user id; writes are whole-document, reads return the latest
//! record. SQL-backed adapters live with the transport; the core ships the
//! in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One persisted parameter document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRecord {
    pub params_json: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl ParamRecord {
    /// Age of the record relative to `now`, in seconds (zero if the clock
    /// went backwards).
    pub fn age_seconds(&self, now: DateTime<Utc>) -> u64 {
        (now - self.updated_at).num_seconds().max(0) as u64
    }
}

/// KV parameter store port.
#[async_trait]
pub trait ParamStore: Send + Sync {
    async fn load(&self, user_id: &str) -> Result<Option<ParamRecord>>;
    async fn save(&self, user_id: &str, record: ParamRecord) -> Result<()>;
}

/// In-memory adapter.
#[derive(Default)]
pub struct InMemoryParamStore {
    records: RwLock<HashMap<String, ParamRecord>>,
}

impl InMemoryParamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParamStore for InMemoryParamStore {
    async fn load(&self, user_id: &str) -> Result<Option<ParamRecord>> {
        Ok(self.records.read().get(user_id).cloned())
    }

    async fn save(&self, user_id: &str, record: ParamRecord) -> Result<()> {
        self.records.write().insert(user_id.to_string(), record);
        Ok(())
    }
}
