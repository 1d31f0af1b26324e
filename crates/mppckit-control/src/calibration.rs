//! Front-end offset calibration.
//!
//! Finds the smallest front-end offset DAC value at which the diagnostic
//! output voltage reads zero. The output falls roughly linearly with
//! increasing offset until it hits the floor, so a binary search over the
//! offset domain converges on the knee. Each probe point waits for the
//! offset readback to stabilize, lets the analog output settle, and scores
//! the median of several readings to ride out noise. The found knee is
//! confirmed by looking back a few counts and checking the output comes
//! off the floor again.
//!
//! The result is persisted with a temp-file-and-rename so an interrupted
//! run can never be mistaken for a completed one; any failure mid-search
//! leaves the previous record byte-for-byte untouched.

use chrono::Utc;
use mppckit_core::{CalibrationError, CalibrationRecord, Error, Result};
use mppckit_device::DeviceHandle;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Calibration tuning.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Offset DAC search domain, inclusive.
    pub offset_range: (u16, u16),
    /// Bias voltage the calibration runs at.
    pub voltage_v: f64,
    /// Analog settle time after each offset write.
    pub settle: Duration,
    /// Readings taken per probe point.
    pub repeats: u32,
    /// Delay between repeated readings.
    pub repeat_interval: Duration,
    /// Counts to step back for the confirmation measurement.
    pub lookback: u16,
    /// Probe budget before the search gives up.
    pub max_steps: u32,
    /// Output magnitude below which a reading counts as zero, volts.
    pub zero_epsilon_v: f64,
    /// Budget for each readback stabilization wait.
    pub stabilize_timeout: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            offset_range: (0, 4095),
            voltage_v: 60.0,
            settle: Duration::from_millis(200),
            repeats: 5,
            repeat_interval: Duration::from_millis(30),
            lookback: 3,
            max_steps: 24,
            zero_epsilon_v: 1e-6,
            stabilize_timeout: Duration::from_secs(120),
        }
    }
}

/// Offset search and record persistence.
pub struct CalibrationEngine {
    config: CalibrationConfig,
    record_path: PathBuf,
}

fn set_fe_offset(h: &mut DeviceHandle, v: f64) -> Result<()> {
    h.set_frontend_offset(v.round() as u16)
}

fn get_fe_offset(h: &mut DeviceHandle) -> Result<f64> {
    Ok(h.get_frontend_offset()? as f64)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[values.len() / 2]
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig, record_path: PathBuf) -> Self {
        Self {
            config,
            record_path,
        }
    }

    /// Where the record is persisted.
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Load a previously persisted record, if one exists.
    pub fn load(path: &Path) -> Result<Option<CalibrationRecord>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let record = serde_json::from_str(&content)
            .map_err(|e| Error::other(format!("Invalid calibration record: {}", e)))?;
        Ok(Some(record))
    }

    /// Run the full calibration against the device.
    ///
    /// Gain is pinned to 100 % and the output offset to 0 for the
    /// duration, the ideal imaging settings the calibration is meant for.
    /// `stop` aborts between probe points.
    pub fn run(
        &self,
        handle: &mut DeviceHandle,
        stop: Option<&AtomicBool>,
    ) -> Result<CalibrationRecord> {
        tracing::info!(
            "Calibrating front-end offset over {:?} at {:.1} V",
            self.config.offset_range,
            self.config.voltage_v
        );

        let poll = Duration::from_millis(100);
        handle.stabilize(
            DeviceHandle::set_gain,
            DeviceHandle::get_gain,
            100.0,
            2.0,
            1,
            poll,
            self.config.stabilize_timeout,
        )?;
        handle.stabilize(
            DeviceHandle::set_offset,
            DeviceHandle::get_offset,
            0.0,
            1.0,
            1,
            poll,
            self.config.stabilize_timeout,
        )?;
        handle.stabilize(
            DeviceHandle::set_voltage,
            DeviceHandle::get_voltage,
            self.config.voltage_v,
            0.1,
            1,
            poll,
            self.config.stabilize_timeout,
        )?;

        let offset = self.search(handle, stop)?;
        let record = CalibrationRecord {
            frontend_offset: offset,
            voltage_v: handle.get_voltage()?,
            timestamp: Utc::now(),
        };
        self.persist(&record)?;
        tracing::info!("Calibration converged at offset {}", offset);
        Ok(record)
    }

    /// Binary search for the smallest offset whose output reads zero.
    fn search(&self, handle: &mut DeviceHandle, stop: Option<&AtomicBool>) -> Result<u16> {
        let (mut lo, mut hi) = self.config.offset_range;
        let mut steps = 0u32;

        while lo < hi {
            if stop.is_some_and(|s| s.load(Ordering::Acquire)) {
                return Err(CalibrationError::Aborted {
                    step: steps,
                    reason: "stop requested".to_string(),
                }
                .into());
            }
            if steps >= self.config.max_steps {
                return Err(CalibrationError::NotConverged {
                    steps,
                    lower: lo,
                    upper: hi,
                }
                .into());
            }
            steps += 1;

            let mid = lo + (hi - lo) / 2;
            let output = self.measure_at(handle, mid)?;
            tracing::debug!("Probe offset {} -> {:.6} V", mid, output);

            if output < -self.config.zero_epsilon_v {
                return Err(CalibrationError::NegativeOutput { voltage: output }.into());
            } else if output > self.config.zero_epsilon_v {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        // The knee must sit above the lookback window, otherwise there is
        // nothing to confirm against.
        if lo <= self.config.lookback {
            return Err(CalibrationError::NotConverged {
                steps,
                lower: lo,
                upper: hi,
            }
            .into());
        }

        // Confirm: a few counts below the knee the output must come off
        // the floor, otherwise the whole window was flat and the search
        // found nothing.
        let back = self.measure_at(handle, lo - self.config.lookback)?;
        if back < -self.config.zero_epsilon_v {
            return Err(CalibrationError::NegativeOutput { voltage: back }.into());
        }
        if back <= self.config.zero_epsilon_v {
            return Err(CalibrationError::NotConverged {
                steps,
                lower: lo,
                upper: hi,
            }
            .into());
        }

        // Leave the device on the calibrated value.
        handle.set_frontend_offset(lo)?;
        Ok(lo)
    }

    /// Set an offset, wait for settle, and score the output.
    fn measure_at(&self, handle: &mut DeviceHandle, offset: u16) -> Result<f64> {
        handle.stabilize(
            set_fe_offset,
            get_fe_offset,
            offset as f64,
            0.5,
            1,
            Duration::from_millis(10),
            self.config.stabilize_timeout,
        )?;
        std::thread::sleep(self.config.settle);

        let mut readings = Vec::with_capacity(self.config.repeats as usize);
        for i in 0..self.config.repeats {
            readings.push(handle.get_frontend_output_voltage()?);
            if i + 1 < self.config.repeats {
                std::thread::sleep(self.config.repeat_interval);
            }
        }
        Ok(median(&mut readings))
    }

    /// Write the record next to its final path, then rename into place.
    fn persist(&self, record: &CalibrationRecord) -> Result<()> {
        if let Some(parent) = self.record_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_name = self
            .record_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::other("Calibration record path has no file name"))?;
        let tmp_path = self.record_path.with_file_name(format!("_{}", file_name));

        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Error::other(format!("Failed to serialize calibration record: {}", e)))?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.record_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_count() {
        let mut values = vec![3.0, 1.0, 2.0];
        assert_eq!(median(&mut values), 2.0);
    }

    #[test]
    fn test_median_rides_out_outlier() {
        let mut values = vec![0.0, 0.0, 9.5, 0.0, 0.0];
        assert_eq!(median(&mut values), 0.0);
    }
}
