//! Bias voltage convergence.
//!
//! The bias supply does not land on a commanded value exactly, so the loop
//! walks the commanded voltage toward the target in bounded steps based on
//! what is actually observed:
//!
//! ```text
//! commanded += clamp(target - observed, -max_step, +max_step)
//! ```
//!
//! Convergence requires the observed value to stay within epsilon of the
//! target for a number of consecutive cycles. Running out of the cycle
//! budget is reported to the caller and never trips the safety supervisor.

/// Ramp tuning.
#[derive(Debug, Clone)]
pub struct RampConfig {
    /// Largest correction applied in one cycle, volts.
    pub max_step_v: f64,
    /// Tolerance around the target, volts.
    pub epsilon_v: f64,
    /// Consecutive in-tolerance cycles required to call it settled.
    pub required_stable: u32,
    /// Cycle budget before giving up.
    pub max_cycles: u32,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            max_step_v: 5.0,
            epsilon_v: 0.1,
            required_stable: 2,
            max_cycles: 30,
        }
    }
}

/// What the loop should do after feeding one observation to the ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampStep {
    /// Command this voltage and keep going.
    Write(f64),
    /// Converged; no further writes needed.
    Settled,
    /// Cycle budget exhausted without convergence.
    Exhausted,
}

/// One in-flight voltage ramp toward a target.
#[derive(Debug)]
pub struct VoltageRamp {
    config: RampConfig,
    target_v: f64,
    commanded_v: f64,
    stable: u32,
    cycles: u32,
    finished: bool,
}

impl VoltageRamp {
    /// Start a ramp from the currently commanded voltage.
    pub fn new(target_v: f64, commanded_v: f64, config: RampConfig) -> Self {
        Self {
            config,
            target_v,
            commanded_v,
            stable: 0,
            cycles: 0,
            finished: false,
        }
    }

    /// The voltage this ramp is heading for.
    pub fn target(&self) -> f64 {
        self.target_v
    }

    /// Cycles consumed so far.
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Feed one observed voltage reading and get the next action.
    pub fn observe(&mut self, observed_v: f64) -> RampStep {
        if self.finished {
            return RampStep::Settled;
        }
        self.cycles += 1;

        if (observed_v - self.target_v).abs() <= self.config.epsilon_v {
            self.stable += 1;
            if self.stable >= self.config.required_stable {
                self.finished = true;
                return RampStep::Settled;
            }
        } else {
            self.stable = 0;
        }

        if self.cycles >= self.config.max_cycles {
            return RampStep::Exhausted;
        }

        let delta = (self.target_v - observed_v).clamp(-self.config.max_step_v, self.config.max_step_v);
        self.commanded_v = (self.commanded_v + delta).clamp(0.0, 80.0);
        RampStep::Write(self.commanded_v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RampConfig {
        RampConfig {
            max_step_v: 5.0,
            epsilon_v: 0.1,
            required_stable: 2,
            max_cycles: 30,
        }
    }

    /// A supply that lands a bit short of whatever is commanded, with a
    /// mild non-linearity at higher voltages.
    fn plant(commanded: f64) -> f64 {
        commanded * 0.98 - 0.002 * commanded * commanded / 80.0
    }

    #[test]
    fn test_converges_on_lossy_plant() {
        let mut ramp = VoltageRamp::new(60.0, 0.0, config());
        let mut observed = 0.0;
        let mut settled = false;

        for _ in 0..30 {
            match ramp.observe(observed) {
                RampStep::Write(v) => observed = plant(v),
                RampStep::Settled => {
                    settled = true;
                    break;
                }
                RampStep::Exhausted => panic!("ramp exhausted"),
            }
        }
        assert!(settled, "did not settle, last observed {observed}");
        assert!((observed - 60.0).abs() <= 0.1);
    }

    #[test]
    fn test_step_is_bounded() {
        let mut ramp = VoltageRamp::new(60.0, 0.0, config());
        match ramp.observe(0.0) {
            RampStep::Write(v) => assert!(v <= 5.0 + 1e-9, "first step too large: {v}"),
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn test_requires_consecutive_stable_cycles() {
        let mut ramp = VoltageRamp::new(10.0, 10.0, config());

        // First in-tolerance observation is not enough.
        assert!(matches!(ramp.observe(10.0), RampStep::Write(_)));
        // Second consecutive one settles.
        assert_eq!(ramp.observe(10.0), RampStep::Settled);
    }

    #[test]
    fn test_out_of_tolerance_resets_stability_count() {
        let mut ramp = VoltageRamp::new(10.0, 10.0, config());
        assert!(matches!(ramp.observe(10.0), RampStep::Write(_)));
        assert!(matches!(ramp.observe(3.0), RampStep::Write(_)));
        assert!(matches!(ramp.observe(10.0), RampStep::Write(_)));
        assert_eq!(ramp.observe(10.0), RampStep::Settled);
    }

    #[test]
    fn test_exhausts_on_dead_plant() {
        let mut ramp = VoltageRamp::new(60.0, 0.0, config());
        let mut exhausted = false;
        for _ in 0..40 {
            // The plant never moves.
            match ramp.observe(0.0) {
                RampStep::Write(_) => continue,
                RampStep::Exhausted => {
                    exhausted = true;
                    break;
                }
                RampStep::Settled => panic!("settled on a dead plant"),
            }
        }
        assert!(exhausted);
        assert_eq!(ramp.cycles(), 30);
    }

    #[test]
    fn test_commanded_stays_in_supply_range() {
        let mut ramp = VoltageRamp::new(2.0, 0.0, config());
        // Observed far above target pushes the command down; it must clamp at 0.
        match ramp.observe(79.0) {
            RampStep::Write(v) => assert!(v >= 0.0),
            other => panic!("expected write, got {:?}", other),
        }
    }

    #[test]
    fn test_settled_ramp_stays_settled() {
        let mut ramp = VoltageRamp::new(10.0, 10.0, config());
        ramp.observe(10.0);
        assert_eq!(ramp.observe(10.0), RampStep::Settled);
        assert_eq!(ramp.observe(55.0), RampStep::Settled);
    }
}
