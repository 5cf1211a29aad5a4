//! In-memory certificate resolver

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::resolver::{CertificateResolver, ResolverError};
use crate::{CertificatePayload, CertificateRecord};

/// Resolves server names against a fixed set of certificates
///
/// Names are matched case-insensitively. Entries may be exact hostnames or
/// single-label wildcards (`*.example.com`); exact matches win. When nothing
/// matches, the default record (if any) is returned.
#[derive(Default)]
pub struct StaticResolver {
    records: RwLock<HashMap<String, CertificateRecord>>,
    default_record: RwLock<Option<CertificateRecord>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(self, record: CertificateRecord) -> Self {
        *self
            .default_record
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(record);
        self
    }

    pub fn with_record(self, server_name: &str, record: CertificateRecord) -> Self {
        self.insert(server_name, record);
        self
    }

    /// Add or replace the certificate for a server name
    pub fn insert(&self, server_name: &str, record: CertificateRecord) {
        let key = server_name.to_ascii_lowercase();
        debug!(server_name = %key, "Storing certificate");
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, record);
    }

    pub fn remove(&self, server_name: &str) -> Option<CertificateRecord> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&server_name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the record a handshake for `server_name` would get
    pub fn lookup(&self, server_name: &str) -> Option<CertificateRecord> {
        let name = server_name.to_ascii_lowercase();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(record) = records.get(&name) {
            trace!(server_name = %name, "Exact certificate match");
            return Some(record.clone());
        }

        if let Some((_, parent)) = name.split_once('.') {
            if let Some(record) = records.get(&format!("*.{}", parent)) {
                trace!(server_name = %name, "Wildcard certificate match");
                return Some(record.clone());
            }
        }

        drop(records);
        self.default_record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CertificateResolver for StaticResolver {
    async fn resolve(&self, server_name: &str) -> Result<CertificatePayload, ResolverError> {
        self.lookup(server_name)
            .map(CertificatePayload::from)
            .ok_or_else(|| ResolverError::NotFound(server_name.to_string()))
    }
}
