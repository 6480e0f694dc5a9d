//! Dual-keyed tunnel registry.
//!
//! Two independent tables hold tunnel records: `requested` for tunnels
//! not yet fully open and `opened` for connected ones. Records can be
//! keyed by the owning SDP id or by the gateway IP string; the two key
//! spaces are never merged. Both tables are owned by the manager task,
//! so no lock is needed — every other task goes through the manager's
//! command channel.

use std::collections::HashMap;

use sdpc_proto::{SdpError, SdpResult};

use crate::tunnel::TunnelRecord;

/// A registry key: numeric SDP id or gateway IP string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    SdpId(u32),
    GatewayIp(String),
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableKey::SdpId(id) => write!(f, "sdp_id:{id}"),
            TableKey::GatewayIp(ip) => write!(f, "gateway:{ip}"),
        }
    }
}

/// Which field a key is derived from when re-deriving it off a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    SdpId,
    GatewayIp,
}

/// Which of the two tables a call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Requested,
    Opened,
}

/// The two-table tunnel registry.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    requested: HashMap<TableKey, TunnelRecord>,
    opened: HashMap<TableKey, TunnelRecord>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: Table) -> &HashMap<TableKey, TunnelRecord> {
        match table {
            Table::Requested => &self.requested,
            Table::Opened => &self.opened,
        }
    }

    fn table_mut(&mut self, table: Table) -> &mut HashMap<TableKey, TunnelRecord> {
        match table {
            Table::Requested => &mut self.requested,
            Table::Opened => &mut self.opened,
        }
    }

    /// Insert `record` under `key`. Fails with `DuplicateKey` if the
    /// table already holds an entry for that key; this is what enforces
    /// the one-record-per-gateway invariant.
    pub fn submit(&mut self, table: Table, key: TableKey, record: TunnelRecord) -> SdpResult<()> {
        let entries = self.table_mut(table);
        if entries.contains_key(&key) {
            return Err(SdpError::DuplicateKey(key.to_string()));
        }
        entries.insert(key, record);
        Ok(())
    }

    /// Look up a record. A miss is expected control flow ("no existing
    /// tunnel"), not an error.
    pub fn find(&self, table: Table, key: &TableKey) -> Option<&TunnelRecord> {
        self.table(table).get(key)
    }

    pub fn find_mut(&mut self, table: Table, key: &TableKey) -> Option<&mut TunnelRecord> {
        self.table_mut(table).get_mut(key)
    }

    /// Remove and return the record stored under `key`.
    pub fn remove(&mut self, table: Table, key: &TableKey) -> Option<TunnelRecord> {
        self.table_mut(table).remove(key)
    }

    /// Remove a record by re-deriving the key from the record's own
    /// sdp-id or gateway-IP field.
    pub fn remove_record(
        &mut self,
        table: Table,
        record: &TunnelRecord,
        kind: KeyKind,
    ) -> Option<TunnelRecord> {
        let key = record.key(kind);
        self.remove(table, &key)
    }

    /// Number of records in a table.
    pub fn len(&self, table: Table) -> usize {
        self.table(table).len()
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.table(table).is_empty()
    }
}
