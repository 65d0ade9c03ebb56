use crate::utils::errors::ExporterError;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One unit of supervised work. Returns the number of samples published.
#[async_trait]
pub trait Pass: Send + Sync {
    async fn run_once(&self) -> Result<usize, ExporterError>;
}

/// Exponential backoff between consecutive failed passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry, before clamping
    pub multiplier: Duration,
    pub exp_base: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            multiplier: Duration::from_secs(1),
            exp_base: 2.0,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Wait after the `failures`-th consecutive failure:
    /// `multiplier * exp_base^(failures - 1)` clamped to `[min_delay, max_delay]`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.multiplier.as_secs_f64() * self.exp_base.powi(exponent);
        // f64::min/max discard NaN, an overflowing product ends up at max_delay
        let secs = raw
            .min(self.max_delay.as_secs_f64())
            .max(self.min_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SupervisorState {
    Running,
    Backoff { attempt: u32, delay: Duration },
    Failed,
}

/// Runs passes every `interval` and retries failed ones with backoff.
///
/// A failed pass is retried from the top after the backoff delay. A successful pass resets
/// the failure count. After `max_attempts` consecutive failures the supervisor moves to
/// [`SupervisorState::Failed`] and returns the last error.
pub struct Supervisor<P: Pass> {
    pass: P,
    interval: Duration,
    policy: RetryPolicy,
    state: SupervisorState,
    failures: u32,
    last_error: Option<ExporterError>,
}

impl<P: Pass> Supervisor<P> {
    pub fn new(pass: P, interval: Duration, policy: RetryPolicy) -> Self {
        Self {
            pass,
            interval,
            policy,
            state: SupervisorState::Running,
            failures: 0,
            last_error: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Drive the loop until `cancel` fires (`Ok`) or retries are exhausted (`Err`).
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), ExporterError> {
        loop {
            match self.state {
                SupervisorState::Running => {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        result = self.pass.run_once() => result,
                    };

                    match result {
                        Ok(published) => {
                            if self.failures > 0 {
                                info!("Recovered after {} failed attempts", self.failures);
                            }
                            self.failures = 0;
                            info!(
                                "Published {} samples. Sleeping {}s...",
                                published,
                                self.interval.as_secs_f64()
                            );
                            if !sleep_or_cancel(self.interval, cancel).await {
                                return Ok(());
                            }
                        }
                        Err(err) => self.on_failure(err),
                    }
                }
                SupervisorState::Backoff { attempt, delay } => {
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(());
                    }
                    debug!("Backoff over, starting attempt {}", attempt + 1);
                    self.state = SupervisorState::Running;
                }
                SupervisorState::Failed => {
                    let source = self.last_error.take().unwrap_or_else(|| {
                        ExporterError::Gpu("no error recorded for failed supervisor".to_string())
                    });
                    return Err(ExporterError::RetriesExhausted {
                        attempts: self.failures,
                        source: Box::new(source),
                    });
                }
            }
        }
    }

    fn on_failure(&mut self, err: ExporterError) {
        self.failures += 1;

        if self.failures >= self.policy.max_attempts {
            error!(
                "Pass failed (attempt {}/{}): {}. Giving up",
                self.failures, self.policy.max_attempts, err
            );
            self.last_error = Some(err);
            self.state = SupervisorState::Failed;
            return;
        }

        let delay = self.policy.delay_for(self.failures);
        warn!(
            "Pass failed (attempt {}/{}): {}. Retrying in {}s",
            self.failures,
            self.policy.max_attempts,
            err,
            delay.as_secs_f64()
        );
        self.state = SupervisorState::Backoff {
            attempt: self.failures,
            delay,
        };
    }
}

/// Returns false if cancelled before `duration` elapsed
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
