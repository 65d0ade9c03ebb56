use crate::resolvers::IdentityResolver;
use crate::sources::{GpuHandle, GpuProcess, GpuSource};
use crate::utils::errors::ExporterError;
use log::debug;

/// One process's memory on one GPU, attributed to a user or container name.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub gpu_id: String,
    pub user: String,
    pub used_memory: u64,
}

pub struct Sampler<S: GpuSource, R: IdentityResolver> {
    source: S,
    resolver: R,
}

impl<S: GpuSource, R: IdentityResolver> Sampler<S, R> {
    pub fn new(source: S, resolver: R) -> Self {
        Self { source, resolver }
    }

    /// Take one snapshot of every process on every GPU, in enumeration order.
    ///
    /// The source handle is held for the duration of the call and dropped on every exit
    /// path. Source and resolver errors are returned as-is.
    pub async fn gather(&self) -> Result<Vec<Sample>, ExporterError> {
        let mut handle = self.source.open()?;
        let mut samples = Vec::new();
        let mut gpu_count = 0;

        for gpu in handle.gpus() {
            let gpu = gpu?;
            gpu_count += 1;
            for process in gpu.processes {
                let user = self.friendly_name(&process).await?;
                samples.push(Sample {
                    gpu_id: gpu.id.clone(),
                    user,
                    used_memory: process.used_memory,
                });
            }
        }
        self.resolver.finish_pass();

        debug!("Gathered {} samples from {} GPUs", samples.len(), gpu_count);
        Ok(samples)
    }

    /// Container name when the process runs in one, its OS user otherwise
    async fn friendly_name(&self, process: &GpuProcess) -> Result<String, ExporterError> {
        Ok(self
            .resolver
            .resolve(process.pid)
            .await?
            .unwrap_or_else(|| process.user.clone()))
    }
}
