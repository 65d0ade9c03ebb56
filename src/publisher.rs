use crate::sampler::Sample;
use crate::utils::errors::ExporterError;
use log::info;
use prometheus::{GaugeVec, Opts, Registry};

pub const GPU_MEMORY_USED: &str = "gpu_memory_used";
const GPU_MEMORY_USED_HELP: &str = "GPU memory used by a user or a container";
const LABELS: [&str; 2] = ["gpu_id", "user"];

/// Labeled gauge the publisher writes into.
pub trait MetricSink: Send + Sync {
    /// Drop every series
    fn clear(&self);

    fn set(&self, gpu_id: &str, user: &str, value: f64) -> Result<(), ExporterError>;
}

/// `gpu_memory_used{gpu_id, user}` in bytes, registered once for the process lifetime.
#[derive(Clone)]
pub struct GpuMemoryGauge {
    gauge: GaugeVec,
}

impl GpuMemoryGauge {
    pub fn register(registry: &Registry) -> Result<Self, ExporterError> {
        let gauge = GaugeVec::new(Opts::new(GPU_MEMORY_USED, GPU_MEMORY_USED_HELP), &LABELS)?;
        registry.register(Box::new(gauge.clone()))?;
        Ok(Self { gauge })
    }
}

impl MetricSink for GpuMemoryGauge {
    fn clear(&self) {
        self.gauge.reset();
    }

    fn set(&self, gpu_id: &str, user: &str, value: f64) -> Result<(), ExporterError> {
        self.gauge
            .get_metric_with_label_values(&[gpu_id, user])?
            .set(value);
        Ok(())
    }
}

/// Replaces the exported series with the latest samples.
///
/// Scrapes are served concurrently, so one landing between the clear and the last set
/// sees a partial series set. Passes are short compared to scrape intervals.
pub struct Publisher<M: MetricSink> {
    sink: M,
}

impl<M: MetricSink> Publisher<M> {
    pub fn new(sink: M) -> Self {
        Self { sink }
    }

    /// Clear, then set one series per sample. Duplicate keys keep the last value.
    pub fn publish(&self, samples: &[Sample]) -> Result<(), ExporterError> {
        info!("Updating metrics...");

        self.sink.clear();
        for sample in samples {
            self.sink
                .set(&sample.gpu_id, &sample.user, sample.used_memory as f64)?;
        }
        Ok(())
    }
}
