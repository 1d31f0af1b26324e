//! Safety supervisor.
//!
//! Evaluates every telemetry sample against the configured safe ranges and
//! drives the Normal / Warning / Tripped state machine. The supervisor
//! never touches the transport: it returns a verdict, and the control loop
//! guarantees that a shutdown verdict is acted on before any further
//! setpoint write.
//!
//! Checks run in a fixed order each cycle:
//! 1. device error register (severe, trips immediately)
//! 2. heatsink temperature
//! 3. sensor temperature relative to its target
//! 4. TEC current
//! 5. vacuum pressure (skipped in ambient mode)
//!
//! A tripped supervisor stays latched until an operator reset; samples are
//! still evaluated while latched so the telemetry record stays honest.

use mppckit_core::{MonitoredFeature, SafeRange, SupervisorState, TelemetrySample};

/// Safe ranges and policy for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Allowed sensor temperature deviation from target, degrees Celsius.
    pub mppc_temp_rel: SafeRange,
    /// Allowed heatsink temperature, degrees Celsius.
    pub heatsink_temp: SafeRange,
    /// Allowed TEC current, milliamps.
    pub mppc_current: SafeRange,
    /// Allowed chamber pressure, millibar.
    pub vacuum_pressure: SafeRange,
    /// Target sensor temperature the relative check is anchored to.
    pub target_mppc_temp_c: f64,
    /// Ambient mode: no vacuum chamber fitted, pressure check skipped.
    pub ambient: bool,
    /// Consecutive out-of-range samples before Warning escalates to Tripped.
    pub trip_after_violations: u32,
}

/// What the control loop must do after a sample was evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SupervisorVerdict {
    /// Everything in range; setpoint writes may proceed.
    Proceed,
    /// A violation was seen but the trip threshold is not reached yet.
    /// Setpoint writes are held this cycle.
    Warning {
        /// The feature that went out of range.
        feature: MonitoredFeature,
        /// The observed value.
        value: f64,
    },
    /// The supervisor just tripped. The shutdown sequence must be issued
    /// before anything else is written to the device.
    Shutdown {
        /// The feature that caused the trip.
        feature: MonitoredFeature,
        /// The observed value.
        value: f64,
    },
    /// Already tripped on an earlier cycle; shutdown was issued then.
    Latched {
        /// The feature that caused the trip.
        feature: MonitoredFeature,
    },
}

struct Violation {
    feature: MonitoredFeature,
    value: f64,
    severe: bool,
}

/// Normal / Warning / Tripped state machine over the safe ranges.
pub struct SafetySupervisor {
    config: SupervisorConfig,
    state: SupervisorState,
    consecutive: u32,
}

impl SafetySupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: SupervisorState::Normal,
            consecutive: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// The configuration in effect.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn first_violation(&self, sample: &TelemetrySample) -> Option<Violation> {
        if sample.has_device_error() {
            return Some(Violation {
                feature: MonitoredFeature::ErrorCode,
                value: sample.error_code as f64,
                severe: true,
            });
        }

        if !self.config.heatsink_temp.contains(sample.heatsink_temp_c) {
            return Some(Violation {
                feature: MonitoredFeature::HeatsinkTemp,
                value: sample.heatsink_temp_c,
                severe: false,
            });
        }

        let deviation = sample.mppc_temp_c - self.config.target_mppc_temp_c;
        if !self.config.mppc_temp_rel.contains(deviation) {
            return Some(Violation {
                feature: MonitoredFeature::MppcTempRelative,
                value: deviation,
                severe: false,
            });
        }

        if !self.config.mppc_current.contains(sample.mppc_current_ma) {
            return Some(Violation {
                feature: MonitoredFeature::MppcCurrent,
                value: sample.mppc_current_ma,
                severe: false,
            });
        }

        if !self.config.ambient && !self.config.vacuum_pressure.contains(sample.vacuum_pressure_mbar)
        {
            return Some(Violation {
                feature: MonitoredFeature::VacuumPressure,
                value: sample.vacuum_pressure_mbar,
                severe: false,
            });
        }

        None
    }

    /// Evaluate one sample and advance the state machine.
    pub fn evaluate(&mut self, sample: &TelemetrySample) -> SupervisorVerdict {
        let violation = self.first_violation(sample);

        // Latched: keep evaluating for the record, never re-issue shutdown.
        if let SupervisorState::Tripped { feature } = self.state {
            if let Some(v) = &violation {
                tracing::debug!("Still out of range while latched: {} = {:.3}", v.feature, v.value);
            }
            return SupervisorVerdict::Latched { feature };
        }

        match violation {
            None => {
                self.consecutive = 0;
                self.state = SupervisorState::Normal;
                SupervisorVerdict::Proceed
            }
            Some(v) => {
                self.consecutive += 1;
                let trip = v.severe || self.consecutive >= self.config.trip_after_violations;
                if trip {
                    tracing::error!(
                        "Safety trip: {} = {:.3} (violation {} of {})",
                        v.feature,
                        v.value,
                        self.consecutive,
                        self.config.trip_after_violations
                    );
                    self.state = SupervisorState::Tripped { feature: v.feature };
                    SupervisorVerdict::Shutdown {
                        feature: v.feature,
                        value: v.value,
                    }
                } else {
                    tracing::warn!(
                        "Out of range: {} = {:.3} (violation {} of {})",
                        v.feature,
                        v.value,
                        self.consecutive,
                        self.config.trip_after_violations
                    );
                    self.state = SupervisorState::Warning { feature: v.feature };
                    SupervisorVerdict::Warning {
                        feature: v.feature,
                        value: v.value,
                    }
                }
            }
        }
    }

    /// Operator reset. Only leaves the Tripped state; returns whether a
    /// reset actually happened.
    pub fn reset(&mut self) -> bool {
        if self.state.is_tripped() {
            tracing::info!("Safety trip reset by operator");
            self.state = SupervisorState::Normal;
            self.consecutive = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            mppc_temp_rel: SafeRange::new(-1, 1).unwrap(),
            heatsink_temp: SafeRange::new(-20, 40).unwrap(),
            mppc_current: SafeRange::new(-5000, 5000).unwrap(),
            vacuum_pressure: SafeRange::new(0, 5).unwrap(),
            target_mppc_temp_c: 25.0,
            ambient: false,
            trip_after_violations: 1,
        }
    }

    fn in_range_sample() -> TelemetrySample {
        TelemetrySample {
            mppc_temp_c: 25.0,
            heatsink_temp_c: 30.0,
            vacuum_pressure_mbar: 2.0,
            mppc_current_ma: 100.0,
            output_level_v: 10.0,
            frontend_output_v: 0.0,
            error_code: 8,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_in_range_sample_proceeds() {
        let mut sup = SafetySupervisor::new(config());
        assert_eq!(sup.evaluate(&in_range_sample()), SupervisorVerdict::Proceed);
        assert_eq!(sup.state(), SupervisorState::Normal);
    }

    #[test]
    fn test_heatsink_over_limit_trips() {
        let mut sup = SafetySupervisor::new(config());
        let sample = TelemetrySample {
            heatsink_temp_c: 45.0,
            ..in_range_sample()
        };

        match sup.evaluate(&sample) {
            SupervisorVerdict::Shutdown { feature, value } => {
                assert_eq!(feature, MonitoredFeature::HeatsinkTemp);
                assert_eq!(value, 45.0);
            }
            other => panic!("expected shutdown, got {:?}", other),
        }
        assert!(sup.state().is_tripped());
    }

    #[test]
    fn test_boundary_values_are_in_range() {
        let mut sup = SafetySupervisor::new(config());
        let sample = TelemetrySample {
            heatsink_temp_c: 40.0,
            vacuum_pressure_mbar: 5.0,
            mppc_current_ma: 5000.0,
            mppc_temp_c: 26.0,
            ..in_range_sample()
        };
        assert_eq!(sup.evaluate(&sample), SupervisorVerdict::Proceed);
    }

    #[test]
    fn test_shutdown_verdict_issued_exactly_once() {
        let mut sup = SafetySupervisor::new(config());
        let sample = TelemetrySample {
            heatsink_temp_c: 45.0,
            ..in_range_sample()
        };

        assert!(matches!(
            sup.evaluate(&sample),
            SupervisorVerdict::Shutdown { .. }
        ));
        // Same violation on subsequent cycles: latched, no second shutdown.
        assert!(matches!(
            sup.evaluate(&sample),
            SupervisorVerdict::Latched { .. }
        ));
        assert!(matches!(
            sup.evaluate(&sample),
            SupervisorVerdict::Latched { .. }
        ));
    }

    #[test]
    fn test_latched_even_when_back_in_range() {
        let mut sup = SafetySupervisor::new(config());
        let bad = TelemetrySample {
            heatsink_temp_c: 45.0,
            ..in_range_sample()
        };
        sup.evaluate(&bad);

        // Back in range does not clear the latch; only reset() does.
        assert!(matches!(
            sup.evaluate(&in_range_sample()),
            SupervisorVerdict::Latched { .. }
        ));
        assert!(sup.state().is_tripped());

        assert!(sup.reset());
        assert_eq!(sup.evaluate(&in_range_sample()), SupervisorVerdict::Proceed);
    }

    #[test]
    fn test_reset_only_from_tripped() {
        let mut sup = SafetySupervisor::new(config());
        assert!(!sup.reset());
    }

    #[test]
    fn test_warning_escalates_after_threshold() {
        let mut cfg = config();
        cfg.trip_after_violations = 3;
        let mut sup = SafetySupervisor::new(cfg);
        let bad = TelemetrySample {
            mppc_current_ma: 6000.0,
            ..in_range_sample()
        };

        assert!(matches!(
            sup.evaluate(&bad),
            SupervisorVerdict::Warning { .. }
        ));
        assert!(matches!(
            sup.evaluate(&bad),
            SupervisorVerdict::Warning { .. }
        ));
        assert!(matches!(
            sup.evaluate(&bad),
            SupervisorVerdict::Shutdown { .. }
        ));
    }

    #[test]
    fn test_one_good_sample_clears_warning_count() {
        let mut cfg = config();
        cfg.trip_after_violations = 2;
        let mut sup = SafetySupervisor::new(cfg);
        let bad = TelemetrySample {
            mppc_current_ma: 6000.0,
            ..in_range_sample()
        };

        sup.evaluate(&bad);
        sup.evaluate(&in_range_sample());
        // Count restarted; first violation is a warning again.
        assert!(matches!(
            sup.evaluate(&bad),
            SupervisorVerdict::Warning { .. }
        ));
    }

    #[test]
    fn test_device_error_code_trips_immediately() {
        let mut cfg = config();
        cfg.trip_after_violations = 5;
        let mut sup = SafetySupervisor::new(cfg);
        let sample = TelemetrySample {
            error_code: 3,
            ..in_range_sample()
        };

        match sup.evaluate(&sample) {
            SupervisorVerdict::Shutdown { feature, .. } => {
                assert_eq!(feature, MonitoredFeature::ErrorCode);
            }
            other => panic!("expected shutdown, got {:?}", other),
        }
    }

    #[test]
    fn test_ambient_skips_vacuum_check() {
        let mut cfg = config();
        cfg.ambient = true;
        let mut sup = SafetySupervisor::new(cfg);
        let sample = TelemetrySample {
            vacuum_pressure_mbar: 1013.0,
            ..in_range_sample()
        };
        assert_eq!(sup.evaluate(&sample), SupervisorVerdict::Proceed);
    }

    #[test]
    fn test_vacuum_checked_when_not_ambient() {
        let mut sup = SafetySupervisor::new(config());
        let sample = TelemetrySample {
            vacuum_pressure_mbar: 1013.0,
            ..in_range_sample()
        };
        assert!(matches!(
            sup.evaluate(&sample),
            SupervisorVerdict::Shutdown {
                feature: MonitoredFeature::VacuumPressure,
                ..
            }
        ));
    }

    #[test]
    fn test_relative_temperature_anchored_to_target() {
        let mut cfg = config();
        cfg.target_mppc_temp_c = -10.0;
        let mut sup = SafetySupervisor::new(cfg);

        // -10.5 C is within one degree of a -10 C target.
        let ok = TelemetrySample {
            mppc_temp_c: -10.5,
            ..in_range_sample()
        };
        assert_eq!(sup.evaluate(&ok), SupervisorVerdict::Proceed);

        // 25 C absolute would be fine, but it is 35 degrees off target.
        let bad = TelemetrySample {
            mppc_temp_c: 25.0,
            ..in_range_sample()
        };
        assert!(matches!(
            sup.evaluate(&bad),
            SupervisorVerdict::Shutdown {
                feature: MonitoredFeature::MppcTempRelative,
                ..
            }
        ));
    }
}
