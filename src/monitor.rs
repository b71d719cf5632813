//! The boundary between the probing core and a display.
//!
//! The core pushes [`PingUpdate`] events over a channel; a UI consumes
//! them and owns whatever table it renders. In addition every pinger
//! exposes a [`crate::ping::PingerHandle`] through which the current
//! state can be queried at any time, concurrently with probing.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ping::{PingResult, PingerHandle, Stats};

/// Key of one display row.
///
/// `group` identifies a user-supplied target; `index` is 0 for the
/// direct ping row and the hop number for trace rows.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RowKey {
    pub group: u16,
    pub index: u8,
}

impl RowKey {
    pub fn target(group: u16) -> RowKey {
        RowKey { group, index: 0 }
    }

    pub fn hop(group: u16, ttl: u8) -> RowKey {
        RowKey { group, index: ttl }
    }
}

/// One row update: a probe slot changed state.
#[derive(Clone, Debug)]
pub struct PingUpdate {
    pub key: RowKey,
    pub target: IpAddr,
    pub result: PingResult,
    pub stats: Stats,
}

/// Registry of live rows for pull-style queries.
///
/// Updates arrive through the event channel; this exists so a UI can
/// also iterate the table (latest result, history, statistics) without
/// buffering every event itself.
#[derive(Clone, Default)]
pub struct Monitor {
    rows: Arc<Mutex<BTreeMap<RowKey, PingerHandle>>>,
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor::default()
    }

    pub fn register(&self, key: RowKey, handle: PingerHandle) {
        self.rows.lock().insert(key, handle);
    }

    pub fn remove(&self, key: RowKey) {
        self.rows.lock().remove(&key);
    }

    /// Snapshot of all row keys in display order.
    pub fn keys(&self) -> Vec<RowKey> {
        self.rows.lock().keys().copied().collect()
    }

    pub fn row(&self, key: RowKey) -> Option<PingerHandle> {
        self.rows.lock().get(&key).cloned()
    }
}
