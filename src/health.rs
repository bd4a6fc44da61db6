//! Health monitoring for concentrators
//!
//! A concentrator is judged on two things: how many seconds of data are
//! waiting to be published, and what share of received measurements it
//! had to discard. [`HealthMonitor`] folds checks from several
//! concentrators into one system status.

use std::time::{Duration, Instant};

use crate::concentrator::Concentrator;
use crate::stats::StatsSnapshot;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Keeping up, losing little
    Healthy,
    /// Falling behind or losing more than usual, still publishing
    Degraded,
    /// Backlog or loss beyond the unhealthy thresholds
    Unhealthy,
    /// Not running, or not checked yet
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Check if the status is operational (healthy or degraded)
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Check if the status is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            (Self::Unknown, _) | (_, Self::Unknown) => Self::Unknown,
            _ => Self::Healthy,
        }
    }
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Status
    pub status: HealthStatus,
    /// When the check ran
    pub last_check: Instant,
    /// Details message
    pub message: String,
    /// Time the check itself took
    pub latency: Duration,
}

impl HealthCheck {
    fn with_status(component: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status,
            last_check: Instant::now(),
            message: message.into(),
            latency: Duration::ZERO,
        }
    }

    /// Create a healthy check result
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, "OK")
    }

    /// Create a degraded check result
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, message)
    }

    /// Create an unhealthy check result
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, message)
    }

    /// Create a result for a component that could not be judged
    pub fn unknown(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unknown, message)
    }

    /// Set the latency for this check
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Thresholds for judging a concentrator
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Unpublished seconds before degraded
    pub degraded_backlog_seconds: usize,
    /// Unpublished seconds before unhealthy
    pub unhealthy_backlog_seconds: usize,
    /// Discarded/received ratio before degraded
    pub degraded_discard_ratio: f64,
    /// Discarded/received ratio before unhealthy
    pub unhealthy_discard_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_backlog_seconds: 2,
            unhealthy_backlog_seconds: 10,
            degraded_discard_ratio: 0.01,
            unhealthy_discard_ratio: 0.10,
        }
    }
}

impl HealthConfig {
    /// Classify a backlog and a set of counters
    pub fn evaluate(
        &self,
        component: &str,
        backlog_seconds: usize,
        stats: &StatsSnapshot,
    ) -> HealthCheck {
        let discard_ratio = stats.discard_ratio();
        let message = format!(
            "{} s unpublished, {:.2}% discarded",
            backlog_seconds,
            discard_ratio * 100.0
        );

        if backlog_seconds >= self.unhealthy_backlog_seconds
            || discard_ratio >= self.unhealthy_discard_ratio
        {
            HealthCheck::unhealthy(component, message)
        } else if backlog_seconds >= self.degraded_backlog_seconds
            || discard_ratio >= self.degraded_discard_ratio
        {
            HealthCheck::degraded(component, message)
        } else {
            HealthCheck::healthy(component)
        }
    }
}

/// Rolls up checks from several components
#[derive(Debug, Default)]
pub struct HealthMonitor {
    checks: Vec<HealthCheck>,
    config: HealthConfig,
}

impl HealthMonitor {
    /// Create a monitor with default thresholds
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a monitor with custom thresholds
    pub fn with_config(config: HealthConfig) -> Self {
        Self {
            checks: Vec::new(),
            config,
        }
    }

    /// Thresholds used by [`HealthMonitor::check`]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Check a concentrator against this monitor's thresholds and record it
    pub fn check(&mut self, concentrator: &Concentrator) -> HealthStatus {
        let check = concentrator.health_check_with(&self.config);
        let status = check.status;
        self.add_check(check);
        status
    }

    /// Record a check, replacing any earlier one for the same component
    pub fn add_check(&mut self, check: HealthCheck) {
        self.checks.retain(|c| c.component != check.component);
        self.checks.push(check);
    }

    /// Worst status among recorded checks (`Unknown` if none)
    pub fn status(&self) -> HealthStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .reduce(HealthStatus::worst)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Recorded checks
    pub fn checks(&self) -> &[HealthCheck] {
        &self.checks
    }

    /// Check recorded for `component`
    pub fn get_check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }

    /// Forget every check
    pub fn clear(&mut self) {
        self.checks.clear();
    }

    /// One line per component
    pub fn report(&self) -> String {
        let mut report = format!("System Status: {:?}\n\n", self.status());
        for check in &self.checks {
            report.push_str(&format!(
                "[{:?}] {} - {} ({}us)\n",
                check.status,
                check.component,
                check.message,
                check.latency.as_micros()
            ));
        }
        report
    }
}

/// Trait for components that can be health-checked
pub trait HealthCheckable {
    /// Perform health check
    fn health_check(&self) -> HealthCheck;
}

impl Concentrator {
    /// Judge this concentrator against `config`
    pub fn health_check_with(&self, config: &HealthConfig) -> HealthCheck {
        let started = Instant::now();
        let check = if self.is_running() {
            config.evaluate(self.name(), self.unpublished_seconds(), &self.statistics())
        } else {
            HealthCheck::unknown(self.name(), "stopped")
        };
        check.with_latency(started.elapsed())
    }
}

impl HealthCheckable for Concentrator {
    fn health_check(&self) -> HealthCheck {
        self.health_check_with(&HealthConfig::default())
    }
}
