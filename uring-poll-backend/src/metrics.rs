use std::sync::atomic::{AtomicU64, Ordering};

#[non_exhaustive]
pub struct Metrics {
    pub backends_created: u64,
    pub backends_destroyed: u64,
    pub capability_probes: u64,
}

pub(crate) struct MetricsStorage {
    pub(crate) backends_created: AtomicU64,
    pub(crate) backends_destroyed: AtomicU64,
    pub(crate) capability_probes: AtomicU64,
}

impl MetricsStorage {
    pub(crate) const fn new_const() -> Self {
        MetricsStorage {
            backends_created: AtomicU64::new(0),
            backends_destroyed: AtomicU64::new(0),
            capability_probes: AtomicU64::new(0),
        }
    }
}

impl MetricsStorage {
    fn make_pub(&self) -> Metrics {
        Metrics {
            backends_created: self.backends_created.load(Ordering::Relaxed),
            backends_destroyed: self.backends_destroyed.load(Ordering::Relaxed),
            capability_probes: self.capability_probes.load(Ordering::Relaxed),
        }
    }
}

pub(crate) static GLOBAL_STORAGE: MetricsStorage = MetricsStorage::new_const();

pub fn global() -> Metrics {
    GLOBAL_STORAGE.make_pub()
}
