use crate::resolvers::container::DEFAULT_DOCKER_TIMEOUT;
use crate::supervisor::RetryPolicy;
use crate::utils::errors::ExporterError;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Export per-user and per-container GPU memory usage as Prometheus metrics
#[derive(Parser, Debug)]
#[command(name = "gpugpu-exporter", version)]
pub struct Cli {
    /// Port the /metrics endpoint listens on
    #[arg(long, env = "GPUGPU_PORT", default_value_t = 9101)]
    pub port: u16,

    /// Address the /metrics endpoint binds to
    #[arg(long, env = "GPUGPU_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Seconds between sampling passes
    #[arg(long, env = "GPUGPU_INTERVAL", default_value_t = 5.0)]
    pub interval: f64,

    /// Seconds to wait after the first failed pass, before clamping
    #[arg(long, env = "GPUGPU_RETRY_MULTIPLIER", default_value_t = 1.0)]
    pub retry_multiplier: f64,

    /// Growth factor of the wait between consecutive failed passes
    #[arg(long, env = "GPUGPU_RETRY_EXP_BASE", default_value_t = 2.0)]
    pub retry_exp_base: f64,

    /// Shortest wait between failed passes, in seconds
    #[arg(long, env = "GPUGPU_RETRY_MIN_DELAY", default_value_t = 2.0)]
    pub retry_min_delay: f64,

    /// Longest wait between failed passes, in seconds
    #[arg(long, env = "GPUGPU_RETRY_MAX_DELAY", default_value_t = 60.0)]
    pub retry_max_delay: f64,

    /// Consecutive failed passes before the exporter exits
    #[arg(long, env = "GPUGPU_RETRY_MAX_ATTEMPTS", default_value_t = 10)]
    pub retry_max_attempts: u32,

    /// Attribute every process to its OS user, skip container lookup
    #[arg(long, env = "GPUGPU_NO_CONTAINERS")]
    pub no_containers: bool,

    /// Docker CLI used to look up container names
    #[arg(long, env = "GPUGPU_DOCKER_BIN", default_value = "docker")]
    pub docker_bin: PathBuf,

    /// Seconds a single `docker inspect` may take before the pass fails
    #[arg(
        long,
        env = "GPUGPU_DOCKER_TIMEOUT",
        default_value_t = DEFAULT_DOCKER_TIMEOUT.as_secs_f64()
    )]
    pub docker_timeout: f64,

    /// procfs mount to read process cgroups from
    #[arg(long, env = "GPUGPU_PROC_ROOT", default_value = "/proc")]
    pub proc_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSettings {
    pub docker_bin: PathBuf,
    pub docker_timeout: Duration,
    pub proc_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    pub listen_addr: SocketAddr,
    pub interval: Duration,
    pub retry: RetryPolicy,
    /// `None` when container lookup is disabled
    pub containers: Option<ContainerSettings>,
}

impl Cli {
    pub fn into_config(self) -> Result<ExporterConfig, ExporterError> {
        let interval = positive_seconds("interval", self.interval)?;
        let min_delay = seconds("retry-min-delay", self.retry_min_delay)?;
        let max_delay = seconds("retry-max-delay", self.retry_max_delay)?;

        if min_delay > max_delay {
            return Err(ExporterError::Config(format!(
                "retry-min-delay ({}s) exceeds retry-max-delay ({}s)",
                self.retry_min_delay, self.retry_max_delay
            )));
        }
        if !self.retry_exp_base.is_finite() || self.retry_exp_base < 1.0 {
            return Err(ExporterError::Config(format!(
                "retry-exp-base must be a finite number >= 1, got {}",
                self.retry_exp_base
            )));
        }
        if self.retry_max_attempts == 0 {
            return Err(ExporterError::Config(
                "retry-max-attempts must be at least 1".to_string(),
            ));
        }

        let retry = RetryPolicy {
            multiplier: seconds("retry-multiplier", self.retry_multiplier)?,
            exp_base: self.retry_exp_base,
            min_delay,
            max_delay,
            max_attempts: self.retry_max_attempts,
        };

        let docker_timeout = positive_seconds("docker-timeout", self.docker_timeout)?;
        let containers = (!self.no_containers).then(|| ContainerSettings {
            docker_bin: self.docker_bin,
            docker_timeout,
            proc_root: self.proc_root,
        });

        Ok(ExporterConfig {
            listen_addr: SocketAddr::new(self.bind, self.port),
            interval,
            retry,
            containers,
        })
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, ExporterError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ExporterError::Config(format!(
            "{} must be a finite, non-negative number of seconds, got {}",
            name, value
        ))
    })
}

fn positive_seconds(name: &str, value: f64) -> Result<Duration, ExporterError> {
    let duration = seconds(name, value)?;
    if duration.is_zero() {
        return Err(ExporterError::Config(format!(
            "{} must be greater than zero",
            name
        )));
    }
    Ok(duration)
}
