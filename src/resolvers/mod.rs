//! Identity resolvers map a pid to a friendlier owner name than the OS user.

pub mod container;

pub use container::{ContainerResolver, DockerCli};

use crate::utils::errors::ExporterError;
use async_trait::async_trait;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Name of whatever owns `pid`, or `None` to fall back to the OS user.
    async fn resolve(&self, pid: u32) -> Result<Option<String>, ExporterError>;

    /// Called after every pass that resolved all of its processes.
    fn finish_pass(&self) {}
}

/// Resolver that never finds a container; every process is attributed to its OS user.
#[derive(Debug, Default)]
pub struct NoContainers;

#[async_trait]
impl IdentityResolver for NoContainers {
    async fn resolve(&self, _pid: u32) -> Result<Option<String>, ExporterError> {
        Ok(None)
    }
}
