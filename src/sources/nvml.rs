use crate::sources::{Gpu, GpuHandle, GpuProcess, GpuSource};
use crate::utils::errors::ExporterError;
use crate::utils::psutils::ProcessOwners;
use log::debug;
use nvml_wrapper::Nvml;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::struct_wrappers::device::ProcessInfo;

/// Reads running compute processes from every NVIDIA device through NVML.
#[derive(Debug, Default)]
pub struct NvmlSource;

impl NvmlSource {
    pub fn new() -> Self {
        Self
    }

    /// Check whether the NVIDIA driver library can be loaded and initialised
    pub fn is_available() -> bool {
        Nvml::init().is_ok()
    }
}

impl GpuSource for NvmlSource {
    type Handle = NvmlHandle;

    fn open(&self) -> Result<NvmlHandle, ExporterError> {
        let nvml = Nvml::init()?;
        debug!("NVML session opened");
        Ok(NvmlHandle {
            nvml,
            owners: ProcessOwners::new(),
        })
    }
}

/// One NVML session. Dropping it shuts NVML down.
pub struct NvmlHandle {
    nvml: Nvml,
    owners: ProcessOwners,
}

impl NvmlHandle {
    fn read_gpu(&mut self, index: u32) -> Result<Gpu, ExporterError> {
        let device = self.nvml.device_by_index(index)?;
        let infos = device.running_compute_processes()?;

        let pids: Vec<u32> = infos.iter().map(|info| info.pid).collect();
        self.owners.refresh(&pids);

        let processes = infos
            .into_iter()
            .map(|info| GpuProcess {
                pid: info.pid,
                user: self.owners.owner_of(info.pid),
                used_memory: used_bytes(&info),
            })
            .collect();

        Ok(Gpu {
            id: index.to_string(),
            processes,
        })
    }
}

impl GpuHandle for NvmlHandle {
    fn gpus(&mut self) -> Box<dyn Iterator<Item = Result<Gpu, ExporterError>> + Send + '_> {
        match self.nvml.device_count() {
            Ok(count) => Box::new((0..count).map(move |index| self.read_gpu(index))),
            Err(err) => Box::new(std::iter::once(Err(err.into()))),
        }
    }
}

impl Drop for NvmlHandle {
    fn drop(&mut self) {
        debug!("NVML session released");
    }
}

// NVML reports Unavailable when the driver does not expose per-process usage
// (WDDM mode, restricted containers)
fn used_bytes(info: &ProcessInfo) -> u64 {
    match info.used_gpu_memory {
        UsedGpuMemory::Used(bytes) => bytes,
        UsedGpuMemory::Unavailable => 0,
    }
}
