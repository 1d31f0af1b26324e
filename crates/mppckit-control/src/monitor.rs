//! Periodic telemetry and control loop.
//!
//! The loop owns the `DeviceHandle` while it runs: one poll cycle per
//! interval on a blocking task, cancellable between cycles. Each cycle
//! reads a telemetry sample, publishes it, asks the safety supervisor for
//! a verdict, and only then performs setpoint work. A shutdown verdict is
//! acted on before any other write reaches the device.
//!
//! `stop()` hands the `DeviceHandle` back so another session (the upload
//! sequencer) can take over the transport; the two never run at once.

use mppckit_core::event_bus::event_bus;
use mppckit_core::{
    ControlError, DeviceEvent, Error, Result, SafetyEvent, SignalType, SupervisorState,
    TelemetryEvent, TelemetrySample,
};
use mppckit_device::DeviceHandle;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::convergence::{RampConfig, RampStep, VoltageRamp};
use crate::supervisor::{SafetySupervisor, SupervisorVerdict};

/// Control loop tuning.
#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    /// Time between poll cycles.
    pub poll_interval: Duration,
    /// Output mode the level reading follows.
    pub signal: SignalType,
    /// Voltage ramp tuning.
    pub ramp: RampConfig,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            signal: SignalType::Differential,
            ramp: RampConfig::default(),
        }
    }
}

struct Shared {
    stop: AtomicBool,
    reset_requested: AtomicBool,
    latest: RwLock<Option<TelemetrySample>>,
    state: RwLock<SupervisorState>,
    pending_target_v: Mutex<Option<f64>>,
    setpoint_error: Mutex<Option<ControlError>>,
}

/// Handle to a running control loop.
///
/// Dropping the handle without calling [`ControlLoop::stop`] abandons
/// the device but still signals the loop to exit, so the blocking task
/// cannot outlive its owner.
pub struct ControlLoop {
    shared: Arc<Shared>,
    task: Option<tokio::task::JoinHandle<DeviceHandle>>,
}

impl ControlLoop {
    /// Take ownership of the device and start polling.
    pub fn start(
        handle: DeviceHandle,
        supervisor: SafetySupervisor,
        config: ControlLoopConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
            latest: RwLock::new(None),
            state: RwLock::new(supervisor.state()),
            pending_target_v: Mutex::new(None),
            setpoint_error: Mutex::new(None),
        });

        let task_shared = shared.clone();
        let task = tokio::task::spawn_blocking(move || {
            run_loop(handle, supervisor, config, task_shared)
        });

        Self {
            shared,
            task: Some(task),
        }
    }

    /// Most recent telemetry snapshot, if a cycle has completed.
    pub fn latest_sample(&self) -> Option<TelemetrySample> {
        self.shared.latest.read().clone()
    }

    /// Current supervisor state.
    pub fn state(&self) -> SupervisorState {
        *self.shared.state.read()
    }

    /// Request a new bias voltage target; picked up next cycle.
    pub fn set_voltage_target(&self, volts: f64) {
        *self.shared.pending_target_v.lock() = Some(volts);
    }

    /// Request an operator reset of a tripped supervisor.
    pub fn request_trip_reset(&self) {
        self.shared.reset_requested.store(true, Ordering::Release);
    }

    /// Take the last non-fatal setpoint failure, if any.
    pub fn take_setpoint_error(&self) -> Option<ControlError> {
        self.shared.setpoint_error.lock().take()
    }

    /// Stop between cycles and hand the device back.
    pub async fn stop(mut self) -> Result<DeviceHandle> {
        self.shared.stop.store(true, Ordering::Release);
        let Some(task) = self.task.take() else {
            return Err(Error::other("Control loop already stopped"));
        };
        task.await
            .map_err(|e| Error::other(format!("Control loop task failed: {}", e)))
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

fn run_loop(
    mut handle: DeviceHandle,
    mut supervisor: SafetySupervisor,
    config: ControlLoopConfig,
    shared: Arc<Shared>,
) -> DeviceHandle {
    tracing::info!(
        "Control loop started on {} (poll every {:?})",
        handle.port_name(),
        config.poll_interval
    );
    let mut ramp: Option<VoltageRamp> = None;

    while !shared.stop.load(Ordering::Acquire) {
        cycle(&mut handle, &mut supervisor, &config, &shared, &mut ramp);
        sleep_until_next_cycle(&shared, config.poll_interval);
    }

    tracing::info!("Control loop stopped");
    handle
}

fn cycle(
    handle: &mut DeviceHandle,
    supervisor: &mut SafetySupervisor,
    config: &ControlLoopConfig,
    shared: &Shared,
    ramp: &mut Option<VoltageRamp>,
) {
    if shared.reset_requested.swap(false, Ordering::AcqRel) && supervisor.reset() {
        *shared.state.write() = supervisor.state();
        event_bus().publish(DeviceEvent::Safety(SafetyEvent::TripReset));
    }

    let sample = match handle.read_sample(config.signal) {
        Ok(sample) => sample,
        Err(e) => {
            tracing::warn!("Poll cycle failed: {}", e);
            event_bus().publish(DeviceEvent::Telemetry(TelemetryEvent::PollFailed {
                error: e.to_string(),
            }));
            return;
        }
    };

    *shared.latest.write() = Some(sample.clone());
    event_bus().publish(DeviceEvent::Telemetry(TelemetryEvent::Sample {
        sample: sample.clone(),
    }));

    let old_state = supervisor.state();
    let verdict = supervisor.evaluate(&sample);
    let new_state = supervisor.state();
    *shared.state.write() = new_state;
    if new_state != old_state {
        event_bus().publish(DeviceEvent::Safety(SafetyEvent::StateChanged {
            old: old_state,
            new: new_state,
        }));
    }

    match verdict {
        SupervisorVerdict::Shutdown { feature, value } => {
            event_bus().publish(DeviceEvent::Safety(SafetyEvent::RangeViolation {
                feature,
                value,
            }));
            // Shutdown takes priority over everything else this session
            // might want to write.
            *ramp = None;
            if let Err(e) = handle.shutdown() {
                tracing::error!("Shutdown sequence failed: {}", e);
            }
            event_bus().publish(DeviceEvent::Safety(SafetyEvent::ShutdownIssued { feature }));
        }
        SupervisorVerdict::Warning { feature, value } => {
            event_bus().publish(DeviceEvent::Safety(SafetyEvent::RangeViolation {
                feature,
                value,
            }));
            // Writes held until the sample stream is clean again.
        }
        SupervisorVerdict::Latched { .. } => {}
        SupervisorVerdict::Proceed => {
            if let Err(e) = setpoint_step(handle, config, shared, ramp) {
                tracing::warn!("Setpoint step failed: {}", e);
            }
        }
    }
}

fn setpoint_step(
    handle: &mut DeviceHandle,
    config: &ControlLoopConfig,
    shared: &Shared,
    ramp: &mut Option<VoltageRamp>,
) -> Result<()> {
    if let Some(target_v) = shared.pending_target_v.lock().take() {
        let commanded = handle.get_voltage()?;
        tracing::info!("New voltage target {:.2} V (from {:.2} V)", target_v, commanded);
        *ramp = Some(VoltageRamp::new(target_v, commanded, config.ramp.clone()));
    }

    let Some(active) = ramp.as_mut() else {
        return Ok(());
    };

    let observed = handle.get_voltage()?;
    match active.observe(observed) {
        RampStep::Write(volts) => handle.set_voltage(volts)?,
        RampStep::Settled => {
            event_bus().publish(DeviceEvent::Telemetry(TelemetryEvent::VoltageSettled {
                target_v: active.target(),
                cycles: active.cycles(),
            }));
            *ramp = None;
        }
        RampStep::Exhausted => {
            let err = ControlError::SetpointNotReached {
                target_v: active.target(),
                observed_v: observed,
                cycles: active.cycles(),
            };
            tracing::warn!("{}", err);
            *shared.setpoint_error.lock() = Some(err);
            *ramp = None;
        }
    }
    Ok(())
}

/// Sleep the poll interval in short slices so a stop request is honored
/// promptly, but always between cycles, never inside one.
fn sleep_until_next_cycle(shared: &Shared, interval: Duration) {
    const SLICE: Duration = Duration::from_millis(20);
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        std::thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}
