use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("GPU source error: {0}")]
    Gpu(String),
    #[error("Identity resolver error: {0}")]
    Resolver(String),
    #[error("Metrics error: {0}")]
    Metrics(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Giving up after {attempts} consecutive failed attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ExporterError>,
    },
}

impl From<nvml_wrapper::error::NvmlError> for ExporterError {
    fn from(err: nvml_wrapper::error::NvmlError) -> Self {
        ExporterError::Gpu(err.to_string())
    }
}

impl From<prometheus::Error> for ExporterError {
    fn from(err: prometheus::Error) -> Self {
        ExporterError::Metrics(err.to_string())
    }
}
