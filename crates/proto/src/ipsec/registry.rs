//! Dual-index registry of live Security Associations
//!
//! Kernel expiry events carry only an SPI, while caller operations carry a
//! peer pair; the registry therefore keeps two maps over the same records,
//! mutated together under the engine's lock. Records are duplicated values,
//! not shared references.
//!
//! On rekey a fresh record replaces the old one at the same [`SpiKey`], but
//! the superseded SPI keeps its `by_spi` row: the old SA stays live in the
//! kernel until its hard expiry, and the expiry handler still needs to find
//! it by SPI to tear down its packet-filter rule.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use meshguard_platform::{MeshguardResult, Spi};

use crate::ipsec::peer::SpiKey;

/// Action invoked on soft expiry of an outbound SA to start a rekey.
///
/// The trigger is invoked while the engine lock is held; it must not call
/// back into the engine. The expected implementation notifies the upper
/// layer, which re-drives `protect_init(is_rekey = true)` on the initiator.
#[async_trait::async_trait]
pub trait RekeyTrigger: Send + Sync {
    /// Start a rekey exchange for the peer pair this SA belongs to.
    async fn rekey(&self) -> MeshguardResult<()>;
}

/// Direction of an SA, with the rekey trigger owned by outbound records.
#[derive(Clone)]
pub enum SaDirection {
    /// Inbound SA (remote -> local), created by `protect_init`.
    In,
    /// Outbound SA (local -> remote), created by `protect_finish`.
    Out {
        /// Invoked on soft expiry to start a rekey.
        rekey: Arc<dyn RekeyTrigger>,
    },
}

impl SaDirection {
    /// True for outbound records.
    pub fn is_outbound(&self) -> bool {
        matches!(self, SaDirection::Out { .. })
    }
}

impl fmt::Debug for SaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaDirection::In => f.write_str("In"),
            SaDirection::Out { .. } => f.write_str("Out"),
        }
    }
}

/// One live SA created by this process.
#[derive(Debug, Clone)]
pub struct SpiRecord {
    /// Directed peer-pair key the record is filed under.
    pub key: SpiKey,
    /// Kernel identity of the SA.
    pub spi: Spi,
    /// Direction and, for outbound records, the rekey trigger.
    pub dir: SaDirection,
}

/// Two consistent indices over the live SA records.
#[derive(Debug, Default)]
pub struct SpiRegistry {
    by_key: HashMap<SpiKey, SpiRecord>,
    by_spi: HashMap<Spi, SpiRecord>,
}

impl SpiRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// File a record under both indices, replacing any prior record at its
    /// key. A superseded record's `by_spi` row is retained until expiry.
    pub fn insert(&mut self, record: SpiRecord) {
        self.by_key.insert(record.key, record.clone());
        self.by_spi.insert(record.spi, record);
    }

    /// Look up the current record for a directed peer pair.
    pub fn get_by_key(&self, key: &SpiKey) -> Option<&SpiRecord> {
        self.by_key.get(key)
    }

    /// Look up a record by SPI.
    pub fn get_by_spi(&self, spi: Spi) -> Option<&SpiRecord> {
        self.by_spi.get(&spi)
    }

    /// True if any record (current or superseded) carries this SPI.
    pub fn contains_spi(&self, spi: Spi) -> bool {
        self.by_spi.contains_key(&spi)
    }

    /// Remove the record for a directed peer pair, and its `by_spi` row.
    pub fn remove_by_key(&mut self, key: &SpiKey) -> Option<SpiRecord> {
        let record = self.by_key.remove(key)?;
        if self
            .by_spi
            .get(&record.spi)
            .map(|r| r.key == *key)
            .unwrap_or(false)
        {
            self.by_spi.remove(&record.spi);
        }
        Some(record)
    }

    /// Remove a record by SPI. The `by_key` row is removed only when it still
    /// refers to this SPI (it does not after a rekey superseded it).
    pub fn remove_by_spi(&mut self, spi: Spi) -> Option<SpiRecord> {
        let record = self.by_spi.remove(&spi)?;
        if self
            .by_key
            .get(&record.key)
            .map(|r| r.spi == spi)
            .unwrap_or(false)
        {
            self.by_key.remove(&record.key);
        }
        Some(record)
    }

    /// Number of live inbound and outbound `by_spi` rows.
    pub fn active_counts(&self) -> (usize, usize) {
        let inbound = self
            .by_spi
            .values()
            .filter(|r| !r.dir.is_outbound())
            .count();
        (inbound, self.by_spi.len() - inbound)
    }

    /// True when no records are filed.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty() && self.by_spi.is_empty()
    }

    /// Number of `by_key` rows.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[cfg(test)]
    fn consistent(&self) -> bool {
        self.by_key.len() == self.by_spi.len()
            && self.by_key.values().all(|r| {
                self.by_spi
                    .get(&r.spi)
                    .map(|s| s.key == r.key)
                    .unwrap_or(false)
            })
    }
}
