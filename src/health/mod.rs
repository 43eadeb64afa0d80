//! # Health Status
//!
//! Pluggable probes of live database state that gate a migration's progress
//! independently of job outcomes.
//!
//! Each [`HealthIndicator`] turns a [`HealthContext`] into a [`Signal`].
//! [`HealthStatus`] evaluates a configured list of indicators, converting
//! errors and panics into [`Signal::Unknown`] so that a broken probe can
//! never take down the coordinator. Signals are folded with
//! [`Signal::worst`]: `Stop` beats `Unknown` beats `Normal`.

pub mod indicators;

use crate::config::HealthConfig;
use crate::database::MigrationStore;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use indicators::autovacuum::{AutovacuumActiveOnTable, AutovacuumProbe, PgAutovacuumProbe};
pub use indicators::failure_rate::FailureRateIndicator;

#[derive(Debug, Error)]
pub enum HealthIndicatorError {
    #[error("Probe query failed: {0}")]
    Probe(String),

    #[error("Store error: {0}")]
    Store(#[from] crate::error::MigrationError),
}

impl From<sqlx::Error> for HealthIndicatorError {
    fn from(err: sqlx::Error) -> Self {
        Self::Probe(err.to_string())
    }
}

/// Outcome of one indicator evaluation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Normal { indicator: String },
    Stop { indicator: String, reason: String },
    Unknown { indicator: String, reason: String },
}

impl Signal {
    pub fn normal(indicator: impl Into<String>) -> Self {
        Self::Normal {
            indicator: indicator.into(),
        }
    }

    pub fn stop(indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stop {
            indicator: indicator.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown(indicator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unknown {
            indicator: indicator.into(),
            reason: reason.into(),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }

    /// Stop and Unknown are worth telling an operator about
    pub fn is_interesting(&self) -> bool {
        !matches!(self, Self::Normal { .. })
    }

    pub fn severity(&self) -> u8 {
        match self {
            Self::Normal { .. } => 0,
            Self::Unknown { .. } => 1,
            Self::Stop { .. } => 2,
        }
    }

    pub fn indicator(&self) -> &str {
        match self {
            Self::Normal { indicator }
            | Self::Stop { indicator, .. }
            | Self::Unknown { indicator, .. } => indicator,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Normal { .. } => None,
            Self::Stop { reason, .. } | Self::Unknown { reason, .. } => Some(reason),
        }
    }

    /// Most severe signal; the first one wins ties. Normal for an empty list.
    pub fn worst(signals: impl IntoIterator<Item = Signal>) -> Signal {
        signals
            .into_iter()
            .fold(None::<Signal>, |worst, signal| match worst {
                Some(current) if current.severity() >= signal.severity() => Some(current),
                _ => Some(signal),
            })
            .unwrap_or_else(|| Signal::normal("none"))
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal { indicator } => write!(f, "normal ({indicator})"),
            Self::Stop { indicator, reason } => write!(f, "stop ({indicator}): {reason}"),
            Self::Unknown { indicator, reason } => write!(f, "unknown ({indicator}): {reason}"),
        }
    }
}

/// What an indicator gets to look at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthContext {
    pub migration_id: i64,
    pub schema_name: String,
    /// Tables the migration touches
    pub tables: Vec<String>,
}

impl HealthContext {
    pub fn new(migration_id: i64, schema_name: impl Into<String>, tables: Vec<String>) -> Self {
        Self {
            migration_id,
            schema_name: schema_name.into(),
            tables,
        }
    }
}

#[async_trait]
pub trait HealthIndicator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, context: &HealthContext) -> Result<Signal, HealthIndicatorError>;
}

/// Evaluates a fixed set of indicators for a migration
#[derive(Clone, Default)]
pub struct HealthStatus {
    indicators: Vec<Arc<dyn HealthIndicator>>,
}

impl HealthStatus {
    pub fn new(indicators: Vec<Arc<dyn HealthIndicator>>) -> Self {
        Self { indicators }
    }

    /// Build the indicator list from configuration.
    ///
    /// The autovacuum indicator is only installed when a probe is supplied.
    pub fn from_config(
        config: &HealthConfig,
        store: Arc<dyn MigrationStore>,
        autovacuum_probe: Option<Arc<dyn AutovacuumProbe>>,
    ) -> Self {
        let mut indicators: Vec<Arc<dyn HealthIndicator>> = Vec::new();

        if let Some(probe) = autovacuum_probe {
            indicators.push(Arc::new(AutovacuumActiveOnTable::new(
                probe,
                config.autovacuum.enabled,
            )));
        }

        indicators.push(Arc::new(FailureRateIndicator::new(
            store,
            config.failure_rate.clone(),
        )));

        Self::new(indicators)
    }

    pub fn indicator_names(&self) -> Vec<&'static str> {
        self.indicators.iter().map(|i| i.name()).collect()
    }

    /// One signal per indicator, in registration order
    pub async fn evaluate(&self, context: &HealthContext) -> Vec<Signal> {
        let mut signals = Vec::with_capacity(self.indicators.len());
        for indicator in &self.indicators {
            signals.push(Self::evaluate_indicator(indicator.as_ref(), context).await);
        }
        signals
    }

    pub async fn evaluate_worst(&self, context: &HealthContext) -> Signal {
        Signal::worst(self.evaluate(context).await)
    }

    /// Evaluate a single indicator, converting failures into `Unknown`
    pub async fn evaluate_indicator(
        indicator: &dyn HealthIndicator,
        context: &HealthContext,
    ) -> Signal {
        let outcome = AssertUnwindSafe(indicator.evaluate(context))
            .catch_unwind()
            .await;

        let signal = match outcome {
            Ok(Ok(signal)) => signal,
            Ok(Err(e)) => Signal::unknown(indicator.name(), e.to_string()),
            Err(panic) => Signal::unknown(indicator.name(), panic_message(panic.as_ref())),
        };

        log_signal(context, &signal);
        signal
    }
}

impl fmt::Debug for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthStatus")
            .field("indicators", &self.indicator_names())
            .finish()
    }
}

fn log_signal(context: &HealthContext, signal: &Signal) {
    match signal {
        Signal::Normal { .. } => {}
        Signal::Stop { indicator, reason } => info!(
            migration_id = context.migration_id,
            indicator = %indicator,
            reason = %reason,
            "🛑 Health indicator signalled stop"
        ),
        Signal::Unknown { indicator, reason } => warn!(
            migration_id = context.migration_id,
            indicator = %indicator,
            reason = %reason,
            "Health indicator could not be evaluated"
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "indicator panicked".to_string()
    }
}
