use serde::Serialize;

/// Snapshot of a pool's counters and gauges.
///
/// Counters only ever grow; `idle`, `active`, `pending` and `waiting` describe the moment the
/// snapshot was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub created: u64,
    pub destroyed: u64,
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub idle: usize,
    pub active: usize,
    pub pending: usize,
    pub waiting: usize,
}

impl PoolStats {
    /// Connections that exist or are being created.
    pub fn total(&self) -> usize {
        self.idle + self.active + self.pending
    }
}
