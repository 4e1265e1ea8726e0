use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    dma::{BusAddr, PageFrame, SyncMode},
    hw::{Cookie, SlaveConfig, TransferKind},
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// One call across the simulated hardware boundary.
pub enum HwEvent {
    RequestChannel { name: String },
    ReleaseChannel,
    SetMask(u64),
    MapResource { bus: BusAddr, len: usize },
    UnmapResource { bus: BusAddr, len: usize },
    MapSingle { bus: BusAddr, len: usize },
    UnmapSingle { bus: BusAddr, len: usize },
    MapPage { page: PageFrame, offset: usize, len: usize, bus: BusAddr },
    UnmapPage { bus: BusAddr, len: usize },
    /// An unmap for a bus address that is not mapped.
    BadUnmap { bus: BusAddr },
    Sync { bus: BusAddr, len: usize, mode: SyncMode },
    Pin { page: PageFrame, write: bool },
    Unpin { page: PageFrame },
    /// An unpin of a page that is not pinned.
    BadUnpin { page: PageFrame },
    Configure(SlaveConfig),
    Prep { id: u64, segments: usize },
    Fixup { id: u64, kind: TransferKind },
    Submit { id: u64, cookie: Cookie },
    IssuePending,
    /// The channel could not reach an address while executing a descriptor.
    Fault { cookie: Cookie },
    Complete { cookie: Cookie },
    /// A queued descriptor was dropped without running.
    Discard { cookie: Cookie },
    Terminate,
}

#[derive(Debug, Clone, Default)]
/// Ordered log of [HwEvent]s, shared by every part of a simulated platform.
pub struct EventLog {
    events: Arc<Mutex<Vec<HwEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: HwEvent) {
        tracing::trace!("hw: {:?}", event);
        self.events.lock().push(event);
    }

    pub fn snapshot(&self) -> Vec<HwEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn contains(&self, event: &HwEvent) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn count(&self, pred: impl Fn(&HwEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Index of the first event matching `pred`.
    pub fn position(&self, pred: impl Fn(&HwEvent) -> bool) -> Option<usize> {
        self.events.lock().iter().position(pred)
    }
}
