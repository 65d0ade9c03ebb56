use crate::publisher::{MetricSink, Publisher};
use crate::resolvers::IdentityResolver;
use crate::sampler::Sampler;
use crate::sources::GpuSource;
use crate::supervisor::Pass;
use crate::utils::errors::ExporterError;
use async_trait::async_trait;

/// A full pass: gather samples, then publish them.
pub struct GpuMemoryExporter<S: GpuSource, R: IdentityResolver, M: MetricSink> {
    sampler: Sampler<S, R>,
    publisher: Publisher<M>,
}

impl<S: GpuSource, R: IdentityResolver, M: MetricSink> GpuMemoryExporter<S, R, M> {
    pub fn new(sampler: Sampler<S, R>, publisher: Publisher<M>) -> Self {
        Self { sampler, publisher }
    }
}

#[async_trait]
impl<S: GpuSource, R: IdentityResolver, M: MetricSink> Pass for GpuMemoryExporter<S, R, M> {
    async fn run_once(&self) -> Result<usize, ExporterError> {
        let samples = self.sampler.gather().await?;
        self.publisher.publish(&samples)?;
        Ok(samples.len())
    }
}
