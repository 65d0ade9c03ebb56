//! In-memory source for tests. Tracks how often its handle is acquired and released.

use crate::sources::{Gpu, GpuHandle, GpuProcess, GpuSource};
use crate::utils::errors::ExporterError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct HandleStats {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
    pub held: AtomicBool,
}

pub struct DummySource {
    gpus: Vec<Gpu>,
    /// Yield an error instead of the GPU at this position
    fail_at: Option<usize>,
    /// Number of upcoming `open` calls that fail
    failing_opens: AtomicUsize,
    pub stats: Arc<HandleStats>,
}

impl DummySource {
    pub fn new(gpus: Vec<Gpu>) -> Self {
        Self {
            gpus,
            fail_at: None,
            failing_opens: AtomicUsize::new(0),
            stats: Arc::new(HandleStats::default()),
        }
    }

    pub fn failing_at(mut self, position: usize) -> Self {
        self.fail_at = Some(position);
        self
    }

    pub fn failing_opens(self, count: usize) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }
}

impl GpuSource for DummySource {
    type Handle = DummyHandle;

    fn open(&self) -> Result<DummyHandle, ExporterError> {
        let remaining = self.failing_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ExporterError::Gpu("driver not loaded".to_string()));
        }
        if self.stats.held.swap(true, Ordering::SeqCst) {
            return Err(ExporterError::Gpu("handle still held by a previous pass".to_string()));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(DummyHandle {
            gpus: self.gpus.clone(),
            fail_at: self.fail_at,
            stats: Arc::clone(&self.stats),
        })
    }
}

pub struct DummyHandle {
    gpus: Vec<Gpu>,
    fail_at: Option<usize>,
    stats: Arc<HandleStats>,
}

impl GpuHandle for DummyHandle {
    fn gpus(&mut self) -> Box<dyn Iterator<Item = Result<Gpu, ExporterError>> + Send + '_> {
        let fail_at = self.fail_at;
        Box::new(self.gpus.iter().enumerate().map(move |(position, gpu)| {
            if Some(position) == fail_at {
                Err(ExporterError::Gpu(format!("device {} fell off the bus", gpu.id)))
            } else {
                Ok(gpu.clone())
            }
        }))
    }
}

impl Drop for DummyHandle {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
        self.stats.held.store(false, Ordering::SeqCst);
    }
}

pub fn process(pid: u32, user: &str, used_memory: u64) -> GpuProcess {
    GpuProcess {
        pid,
        user: user.to_string(),
        used_memory,
    }
}

pub fn gpu(id: &str, processes: Vec<GpuProcess>) -> Gpu {
    Gpu {
        id: id.to_string(),
        processes,
    }
}
