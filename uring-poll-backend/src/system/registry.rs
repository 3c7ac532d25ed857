//! Kernel-registered descriptor table.
//!
//! Registering a hot descriptor lets poll operations name it by table index,
//! which saves the kernel a descriptor lookup per operation.
//!
//! The table is registered in bulk at backend construction, filled with
//! placeholders (`-1`). Individual indices are bound and unbound with
//! single-entry updates. Each record is reference counted: the caller holds
//! one reference from [`FdRegistry::allocate`], and every armed watch on the
//! index holds one more. The kernel binding is cleared when the last one goes.
//!
//! Registration is an optimization. If anything about it fails, callers keep
//! using raw descriptors.

use std::os::fd::RawFd;

use tracing::{debug, error, warn};
use uring_common::io_uring;

const UNREGISTERED: RawFd = -1;

/// The two registration calls the registry needs from the kernel.
pub trait FileTable {
    fn register_files(&self, fds: &[RawFd]) -> std::io::Result<()>;
    /// Returns how many entries the kernel updated.
    fn update_files(&self, offset: u32, fds: &[RawFd]) -> std::io::Result<usize>;
}

impl FileTable for io_uring::Submitter<'_> {
    fn register_files(&self, fds: &[RawFd]) -> std::io::Result<()> {
        io_uring::Submitter::register_files(self, fds)
    }

    fn update_files(&self, offset: u32, fds: &[RawFd]) -> std::io::Result<usize> {
        self.register_files_update(offset, fds)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("descriptor registration is disabled")]
    Disabled,
    #[error("no registered slot available")]
    Exhausted,
    /// The kernel rejected binding the index. The index is taken out of
    /// circulation so the table never disagrees with the kernel about it.
    #[error("kernel rejected update of registered slot {index}")]
    Update {
        index: u32,
        #[source]
        source: std::io::Error,
    },
}

/// One reference to a registered descriptor.
///
/// Not `Clone`: take additional references with [`crate::Backend::retain_fd`]
/// and give each back with [`crate::Backend::release_fd`].
#[derive(Debug, PartialEq, Eq)]
pub struct RegisteredFd {
    index: u32,
    fd: RawFd,
}

impl RegisteredFd {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Outcome of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    StillReferenced { count: u32 },
    /// Last reference dropped; the index is free again.
    Unregistered { kernel_cleared: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Free,
    Bound,
    /// Kernel update failed; never handed out again.
    Leaked,
}

#[derive(Debug)]
struct FdRecord {
    fd: RawFd,
    count: u32,
    state: RecordState,
}

pub struct FdRegistry {
    records: Box<[FdRecord]>,
    free: Vec<u32>,
    enabled: bool,
    leaked: usize,
}

impl FdRegistry {
    /// A table of `size` placeholder entries. Nothing is registered until [`Self::init`].
    pub(crate) fn new(size: usize) -> Self {
        FdRegistry {
            records: (0..size)
                .map(|_| FdRecord {
                    fd: UNREGISTERED,
                    count: 0,
                    state: RecordState::Free,
                })
                .collect(),
            free: Vec::with_capacity(size),
            enabled: false,
            leaked: 0,
        }
    }

    /// Register the placeholder table with the kernel and open every index for use.
    ///
    /// On failure the registry stays empty and disabled.
    pub(crate) fn init(&mut self, table: &impl FileTable) -> std::io::Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let placeholders: Vec<RawFd> = vec![UNREGISTERED; self.records.len()];
        if let Err(e) = table.register_files(&placeholders) {
            error!(
                size = self.records.len(),
                "registering descriptor table failed: {e}"
            );
            return Err(e);
        }
        // reversed so that index 0 is handed out first
        self.free.extend((0..self.records.len() as u32).rev());
        self.enabled = true;
        debug!(size = self.records.len(), "descriptor table registered");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Indices that can currently be allocated.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Indices lost to failed kernel updates.
    pub fn leaked(&self) -> usize {
        self.leaked
    }

    /// Current reference count of `index`; 0 for unbound indices.
    pub fn ref_count(&self, index: u32) -> u32 {
        self.records.get(index as usize).map_or(0, |r| r.count)
    }

    pub(crate) fn is_bound(&self, index: u32) -> bool {
        self.records
            .get(index as usize)
            .is_some_and(|r| r.state == RecordState::Bound)
    }

    /// Bind a free index to `fd`. The returned reference has count 1.
    pub(crate) fn allocate(
        &mut self,
        table: &impl FileTable,
        fd: RawFd,
    ) -> Result<RegisteredFd, RegistryError> {
        if !self.enabled {
            return Err(RegistryError::Disabled);
        }
        let Some(index) = self.free.pop() else {
            return Err(RegistryError::Exhausted);
        };
        let record = &mut self.records[index as usize];
        debug_assert_eq!(record.state, RecordState::Free);
        match table.update_files(index, &[fd]) {
            Ok(1) => {}
            res => {
                let source = match res {
                    Err(e) => e,
                    Ok(n) => std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("kernel updated {n} entries instead of 1"),
                    ),
                };
                warn!(index, fd, "registered slot taken out of circulation: {source}");
                record.state = RecordState::Leaked;
                self.leaked += 1;
                return Err(RegistryError::Update { index, source });
            }
        }
        record.fd = fd;
        record.count = 1;
        record.state = RecordState::Bound;
        Ok(RegisteredFd { index, fd })
    }

    /// Take one more reference on a bound index.
    pub(crate) fn retain(&mut self, index: u32) -> RegisteredFd {
        self.acquire(index);
        RegisteredFd {
            index,
            fd: self.records[index as usize].fd,
        }
    }

    /// Reference held by an armed watch rather than by a [`RegisteredFd`].
    pub(crate) fn acquire(&mut self, index: u32) {
        let record = &mut self.records[index as usize];
        assert_eq!(
            record.state,
            RecordState::Bound,
            "implementation error: retain of unbound registered slot {index}"
        );
        record.count += 1;
    }

    /// Drop one reference. The last one clears the kernel binding and frees the index.
    pub(crate) fn release(&mut self, table: &impl FileTable, fd: RegisteredFd) -> Released {
        self.release_index(table, fd.index)
    }

    pub(crate) fn release_index(&mut self, table: &impl FileTable, index: u32) -> Released {
        let record = &mut self.records[index as usize];
        assert!(
            record.state == RecordState::Bound && record.count > 0,
            "implementation error: release of unreferenced registered slot {index}"
        );
        record.count -= 1;
        if record.count > 0 {
            return Released::StillReferenced {
                count: record.count,
            };
        }
        record.fd = UNREGISTERED;
        record.state = RecordState::Free;
        let kernel_cleared = match table.update_files(index, &[UNREGISTERED]) {
            Ok(1) => true,
            Ok(n) => {
                warn!(index, n, "clearing registered slot updated unexpected entry count");
                false
            }
            Err(e) => {
                warn!(index, "clearing registered slot failed: {e}");
                false
            }
        };
        // the index is reusable either way: the next allocate overwrites the binding
        self.free.push(index);
        Released::Unregistered { kernel_cleared }
    }
}
