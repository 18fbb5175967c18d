//! Durable agent records
//!
//! One record per agent, keyed by the certificate subject. The store is the
//! serialization point for record mutations: cached handles are working
//! copies, saves are last-writer-wins, and sled's background flush gives the
//! non-blocking persistence the bundle path relies on.

use crate::crypto::{ExchangePublic, PublicKey};
use crate::frontend::message::AgentId;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record serialization: {0}")]
    Codec(#[from] bincode::Error),
}

/// Enrollment certificate binding an agent name to its keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCertificate {
    /// Canonical agent name. Must equal the record key.
    pub subject: String,
    /// ML-DSA-65 key verifying the agent's message-list signatures.
    pub signing_key: PublicKey,
    /// X25519 key parcels to this agent are sealed against.
    pub exchange_key: ExchangePublic,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Immutable once written.
    pub cert: Option<AgentCertificate>,
    /// Agent clock of the last accepted bundle (microseconds).
    pub clock: u64,
    /// Server wall-clock at the last accepted bundle (microseconds).
    pub ping: u64,
    /// Last observed source address.
    pub client_ip: Option<IpAddr>,
    /// Short tags feeding per-label ping metrics.
    pub labels: Vec<String>,
}

pub struct AgentStore {
    agents: sled::Tree,
}

impl AgentStore {
    pub fn new(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            agents: db.open_tree("agents")?,
        })
    }

    pub fn get(&self, id: &AgentId) -> Result<Option<AgentRecord>, StoreError> {
        match self.agents.get(id.as_str().as_bytes())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Authoritative read; a missing record is a blank one, created lazily
    /// on first save.
    pub fn load_or_default(&self, id: &AgentId) -> Result<AgentRecord, StoreError> {
        Ok(self.get(id)?.unwrap_or_default())
    }

    /// Persist a record. Non-blocking: sled flushes in the background, and
    /// the next same-process read observes the write immediately.
    pub fn save(&self, id: &AgentId, record: &AgentRecord) -> Result<(), StoreError> {
        let raw = bincode::serialize(record)?;
        self.agents.insert(id.as_str().as_bytes(), raw)?;
        Ok(())
    }

    /// Write an enrollment certificate. Returns false when the agent already
    /// has one; stored certificates are never overwritten.
    pub fn enroll(
        &self,
        cert: AgentCertificate,
        labels: Vec<String>,
    ) -> Result<bool, StoreError> {
        let id = AgentId::from(cert.subject.as_str());
        let mut record = self.load_or_default(&id)?;
        if record.cert.is_some() {
            return Ok(false);
        }
        record.cert = Some(cert);
        record.labels = labels;
        self.save(&id, &record)?;
        info!("enrolled agent {}", id);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, AgentStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, AgentStore::new(&db).unwrap())
    }

    fn make_cert(subject: &str) -> AgentCertificate {
        AgentCertificate {
            subject: subject.to_string(),
            signing_key: vec![7; 32],
            exchange_key: [9; 32],
        }
    }

    #[test]
    fn test_missing_record_is_none() {
        let (_dir, store) = open_store();
        assert!(store.get(&AgentId::from("A1")).unwrap().is_none());
        assert_eq!(store.load_or_default(&AgentId::from("A1")).unwrap().clock, 0);
    }

    #[test]
    fn test_save_round_trip() {
        let (_dir, store) = open_store();
        let id = AgentId::from("A2");
        let mut record = AgentRecord::default();
        record.clock = 2_000_000;
        record.labels = vec!["canary".into()];
        store.save(&id, &record).unwrap();

        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded.clock, 2_000_000);
        assert_eq!(loaded.labels, vec!["canary".to_string()]);
    }

    #[test]
    fn test_enroll_is_write_once() {
        let (_dir, store) = open_store();
        assert!(store.enroll(make_cert("A3"), Vec::new()).unwrap());
        assert!(!store.enroll(make_cert("A3"), Vec::new()).unwrap());

        let record = store.get(&AgentId::from("A3")).unwrap().unwrap();
        assert_eq!(record.cert.unwrap().subject, "A3");
    }
}
