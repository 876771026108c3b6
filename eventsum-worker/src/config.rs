use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use eventsum_common::bucket::Bucketing;
use eventsum_common::retry::RetryPolicy;

use crate::error::WorkerError;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "5")]
    pub batch_size: usize,

    #[envconfig(default = "5000")]
    pub flush_interval: EnvMsDuration,

    #[envconfig(default = "15")]
    pub bucket_minutes: u32,

    #[envconfig(default = "%Y-%m-%d %H:%M:%S")]
    pub time_format: NonEmptyString,

    #[envconfig(nested = true)]
    pub cas_retry: CasRetryConfig,

    pub failure_log_path: Option<NonEmptyString>,

    #[envconfig(default = "60000")]
    pub failure_dump_interval: EnvMsDuration,

    /// Failure dump replayed once at startup. The file is renamed with a `.replayed-*`
    /// suffix before its rows are applied.
    pub replay_failures_from: Option<NonEmptyString>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values that parse but cannot run a pipeline.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.batch_size == 0 {
            return Err(WorkerError::Config("BATCH_SIZE must be at least 1".to_owned()));
        }
        if self.flush_interval.0.is_zero() {
            return Err(WorkerError::Config("FLUSH_INTERVAL must not be zero".to_owned()));
        }
        if self.failure_dump_interval.0.is_zero() {
            return Err(WorkerError::Config(
                "FAILURE_DUMP_INTERVAL must not be zero".to_owned(),
            ));
        }
        if self.cas_retry.max_attempts == 0 {
            return Err(WorkerError::Config(
                "CAS_MAX_ATTEMPTS must be at least 1".to_owned(),
            ));
        }
        self.bucketing()?;
        Ok(())
    }

    pub fn bucketing(&self) -> Result<Bucketing, WorkerError> {
        Bucketing::from_minutes(self.bucket_minutes, self.time_format.as_str())
            .map_err(|e| WorkerError::Config(format!("BUCKET_MINUTES: {e}")))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.cas_retry.backoff_coefficient,
            self.cas_retry.initial_interval.0,
            self.cas_retry.maximum_interval.0,
            self.cas_retry.max_attempts,
        )
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct CasRetryConfig {
    #[envconfig(from = "CAS_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "CAS_INITIAL_INTERVAL", default = "5")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "CAS_MAXIMUM_INTERVAL", default = "1000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "CAS_MAX_ATTEMPTS", default = "32")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
