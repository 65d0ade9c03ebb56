//! GPU sources: where per-process GPU memory figures come from.
//!
//! A source is opened once per sampling pass and yields a handle. The handle owns whatever
//! the backend needs (driver session, process table) and releases it when dropped, so an
//! error halfway through iteration still gives the resource back.

pub mod nvml;

#[cfg(test)]
pub mod dummy;

pub use nvml::NvmlSource;

use crate::utils::errors::ExporterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    /// Name of the OS user owning the process
    pub user: String,
    /// Device memory used by the process, in bytes
    pub used_memory: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpu {
    pub id: String,
    pub processes: Vec<GpuProcess>,
}

pub trait GpuSource: Send + Sync {
    type Handle: GpuHandle + Send;

    /// Acquire the backend for one pass.
    fn open(&self) -> Result<Self::Handle, ExporterError>;
}

pub trait GpuHandle {
    /// Devices in enumeration order. Each item is read when the iterator reaches it.
    fn gpus(&mut self) -> Box<dyn Iterator<Item = Result<Gpu, ExporterError>> + Send + '_>;
}
