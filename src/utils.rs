//! Argument validation, formatting helpers and per-connection metrics.

use std::time::{Duration, Instant};
use log::{debug, trace};
use crate::error::{ModbusError, ModbusResult};

/// Per-connection transaction counters
///
/// Device exceptions count as failures and are also tallied separately, as
/// are timeouts. Durations cover the whole exchange, send to decode.
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    pub busy_time: Duration,
    pub fastest: Option<Duration>,
    pub slowest: Option<Duration>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, duration: Duration) {
        self.successful_requests += 1;
        self.count(duration);
        self.fastest = Some(self.fastest.map_or(duration, |d| d.min(duration)));
        self.slowest = Some(self.slowest.map_or(duration, |d| d.max(duration)));
    }

    pub fn record_failure(&mut self, duration: Duration, error: &ModbusError) {
        self.failed_requests += 1;
        match error {
            ModbusError::Timeout { .. } => self.timeouts += 1,
            ModbusError::Exception { .. } => self.exceptions += 1,
            _ => {},
        }
        self.count(duration);
    }

    fn count(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.busy_time += duration;
    }

    /// Mean duration over every recorded transaction
    pub fn average(&self) -> Duration {
        match u32::try_from(self.total_requests) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.busy_time / n,
            Err(_) => Duration::from_secs_f64(self.busy_time.as_secs_f64() / self.total_requests as f64),
        }
    }

    /// Percentage of transactions that returned a response payload
    pub fn success_rate(&self) -> f64 {
        match self.total_requests {
            0 => 0.0,
            total => self.successful_requests as f64 * 100.0 / total as f64,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Measures one transaction for [`PerformanceMetrics`]
pub struct OperationTimer {
    started: Instant,
    label: &'static str,
}

impl OperationTimer {
    pub fn start(label: &'static str) -> Self {
        trace!("{} started", label);
        Self { started: Instant::now(), label }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.started.elapsed();
        debug!("{} finished in {:?}", self.label, elapsed);
        elapsed
    }
}

/// Argument validation utilities
///
/// Every failure is `InvalidArgument`, raised before a frame is built.
pub mod validation {
    use super::*;

    /// Validate a unit id: 1-247 for serial devices, 255 for TCP gateways
    pub fn validate_unit_id(unit_id: u8) -> ModbusResult<()> {
        match unit_id {
            1..=247 | 255 => Ok(()),
            _ => Err(ModbusError::invalid_argument(
                format!("Invalid unit ID: {} (must be 1-247 or 255)", unit_id)
            )),
        }
    }

    /// Validate that `count` items starting at `start` stay inside 0..=65535
    pub fn validate_address_range(start: u16, count: usize) -> ModbusResult<()> {
        if count == 0 {
            return Err(ModbusError::invalid_argument(
                format!("Quantity at address {} must be at least 1", start)
            ));
        }

        if start as usize + count > 65536 {
            return Err(ModbusError::invalid_argument(
                format!("Address range {} + {} exceeds 65535", start, count)
            ));
        }

        Ok(())
    }

    /// Validate a register count against a per-function limit
    pub fn validate_register_count(count: usize, max: usize) -> ModbusResult<()> {
        if count == 0 || count > max {
            return Err(ModbusError::invalid_argument(
                format!("Invalid register count: {} (must be 1-{})", count, max)
            ));
        }
        Ok(())
    }

    /// Validate a coil count against a per-function limit
    pub fn validate_coil_count(count: usize, max: usize) -> ModbusResult<()> {
        if count == 0 || count > max {
            return Err(ModbusError::invalid_argument(
                format!("Invalid coil count: {} (must be 1-{})", count, max)
            ));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use std::fmt::Write;

    use super::*;

    /// Space-separated uppercase hex, as printed in packet dumps
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
    }

    /// One-based address as shown to operators
    pub fn display_address(address: u16, offset: usize) -> usize {
        address as usize + offset + 1
    }

    /// Milliseconds below one second, seconds with two decimals above
    pub fn format_duration(duration: Duration) -> String {
        match duration.as_millis() {
            ms if ms < 1000 => format!("{}ms", ms),
            _ => format!("{:.2}s", duration.as_secs_f64()),
        }
    }

    /// Multi-line summary of connection metrics
    pub fn format_metrics(metrics: &PerformanceMetrics) -> String {
        let extreme = |d: Option<Duration>| d.map_or_else(|| "-".to_string(), format_duration);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "transactions: {} ok, {} failed ({} exceptions, {} timeouts), {:.1}% success",
            metrics.successful_requests,
            metrics.failed_requests,
            metrics.exceptions,
            metrics.timeouts,
            metrics.success_rate(),
        );
        let _ = write!(
            out,
            "latency: avg {}, fastest {}, slowest {}",
            format_duration(metrics.average()),
            extreme(metrics.fastest),
            extreme(metrics.slowest),
        );
        out
    }
}

pub mod logging {
    /// Route `log` output through the test harness; repeat calls are no-ops
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_split_failures_by_kind() {
        let mut metrics = PerformanceMetrics::new();
        metrics.record_success(Duration::from_millis(40));
        metrics.record_success(Duration::from_millis(80));
        metrics.record_failure(Duration::from_millis(300), &ModbusError::timeout("read_03", 300));
        metrics.record_failure(Duration::from_millis(20), &ModbusError::exception(0x03, 0x02));

        assert_eq!(metrics.total_requests, 4);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.exceptions, 1);
        assert_eq!(metrics.fastest, Some(Duration::from_millis(40)));
        assert_eq!(metrics.slowest, Some(Duration::from_millis(80)));
        assert_eq!(metrics.average(), Duration::from_millis(110));
        assert_eq!(metrics.success_rate(), 50.0);

        metrics.reset();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.average(), Duration::ZERO);
    }

    #[test]
    fn test_unit_and_range_validation() {
        for ok in [1u8, 17, 247, 255] {
            assert!(validation::validate_unit_id(ok).is_ok());
        }
        for bad in [0u8, 248, 254] {
            assert!(validation::validate_unit_id(bad).is_err());
        }

        assert!(validation::validate_address_range(65530, 6).is_ok());
        assert!(validation::validate_address_range(65530, 7).is_err());
        assert!(validation::validate_address_range(10, 0).is_err());
        assert!(validation::validate_register_count(125, 125).is_ok());
        assert!(validation::validate_register_count(126, 125).is_err());
        assert!(validation::validate_coil_count(0, 2000).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::bytes_to_hex(&[0x01, 0x03, 0x10, 0xFF]), "01 03 10 FF");
        assert_eq!(format::display_address(0, 2), 3);
        assert_eq!(format::format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");

        let mut metrics = PerformanceMetrics::new();
        metrics.record_success(Duration::from_millis(5));
        let summary = format::format_metrics(&metrics);
        assert!(summary.starts_with("transactions: 1 ok, 0 failed"));
        assert!(summary.contains("fastest 5ms"));
    }
}
