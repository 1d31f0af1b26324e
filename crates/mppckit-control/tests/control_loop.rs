//! Control loop integration tests against the simulated detector.

use mppckit_control::{ControlLoop, ControlLoopConfig, SafetySupervisor, SupervisorConfig};
use mppckit_core::event_bus::event_bus;
use mppckit_core::{
    DeviceEvent, MonitoredFeature, Result, SafeRange, SafetyEvent, SupervisorState,
};
use mppckit_device::{DeviceHandle, SimulatedDevice, Transport, POWER_OFF_TEMP_C};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const TIMEOUT: Duration = Duration::from_millis(200);

fn supervisor() -> SafetySupervisor {
    SafetySupervisor::new(SupervisorConfig {
        mppc_temp_rel: SafeRange::new(-1, 1).unwrap(),
        heatsink_temp: SafeRange::new(-20, 40).unwrap(),
        mppc_current: SafeRange::new(-5000, 5000).unwrap(),
        vacuum_pressure: SafeRange::new(0, 5).unwrap(),
        // The simulator idles at 30 C.
        target_mppc_temp_c: 30.0,
        ambient: false,
        trip_after_violations: 1,
    })
}

fn fast_config() -> ControlLoopConfig {
    ControlLoopConfig {
        poll_interval: Duration::from_millis(10),
        ..ControlLoopConfig::default()
    }
}

/// Switchable transport wrapper; once silent, commands are swallowed and
/// reads return nothing, as if the cable were pulled mid-session.
struct Switchable {
    inner: SimulatedDevice,
    silent: Arc<AtomicBool>,
}

impl Transport for Switchable {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.silent.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.send(data)
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.silent.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.inner.read_byte()
    }

    fn name(&self) -> &str {
        "simulator"
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_loop_publishes_samples_and_returns_handle() {
    let handle = DeviceHandle::attach(Box::new(SimulatedDevice::new()), TIMEOUT).unwrap();
    let control = ControlLoop::start(handle, supervisor(), fast_config());

    tokio::time::sleep(Duration::from_millis(100)).await;

    let sample = control.latest_sample().expect("no sample after 100 ms");
    assert_eq!(sample.error_code, 8);
    assert!((sample.heatsink_temp_c - 35.0).abs() < 1e-9);
    assert_eq!(control.state(), SupervisorState::Normal);

    let handle = control.stop().await.unwrap();
    assert_eq!(handle.port_name(), "simulator");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heatsink_trip_shuts_down_exactly_once() {
    let mut sim = SimulatedDevice::new();
    sim.hot_plate_uc = 45_000_000;
    let handle = DeviceHandle::attach(Box::new(sim), TIMEOUT).unwrap();

    let mut events = event_bus().receiver();
    let control = ControlLoop::start(handle, supervisor(), fast_config());

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(control.state().is_tripped());
    let mut handle = control.stop().await.unwrap();

    // The shutdown sequence reached the device: bias off, thermal target
    // released.
    assert_eq!(handle.get_voltage().unwrap(), 0.0);
    assert!((handle.get_mppc_temp().unwrap() - POWER_OFF_TEMP_C).abs() < 1e-6);

    // Latched cycles after the trip must not re-issue the shutdown.
    let mut shutdowns = 0;
    loop {
        match events.try_recv() {
            Ok(DeviceEvent::Safety(SafetyEvent::ShutdownIssued {
                feature: MonitoredFeature::HeatsinkTemp,
            })) => shutdowns += 1,
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(shutdowns, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_voltage_target_ramps_to_settle() {
    let handle = DeviceHandle::attach(Box::new(SimulatedDevice::new()), TIMEOUT).unwrap();
    let control = ControlLoop::start(handle, supervisor(), fast_config());

    control.set_voltage_target(32.0);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(control.take_setpoint_error().is_none());
    let mut handle = control.stop().await.unwrap();
    assert!((handle.get_voltage().unwrap() - 32.0).abs() <= 0.1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_loop_stops_polling_the_device() {
    /// Counts every command that reaches the device.
    struct Counting {
        inner: SimulatedDevice,
        sends: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Transport for Counting {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sends.fetch_add(1, Ordering::AcqRel);
            self.inner.send(data)
        }

        fn read_byte(&mut self) -> Result<Option<u8>> {
            self.inner.read_byte()
        }

        fn name(&self) -> &str {
            "simulator"
        }
    }

    let sends = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let transport = Counting {
        inner: SimulatedDevice::new(),
        sends: sends.clone(),
    };
    let handle = DeviceHandle::attach(Box::new(transport), TIMEOUT).unwrap();

    let control = ControlLoop::start(handle, supervisor(), fast_config());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sends.load(Ordering::Acquire) > 0);

    // Abandoned without stop(); the loop must still wind down instead of
    // polling forever on the blocking task.
    drop(control);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = sends.load(Ordering::Acquire);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sends.load(Ordering::Acquire), settled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poll_failures_keep_the_loop_alive() {
    let silent = Arc::new(AtomicBool::new(false));
    let transport = Switchable {
        inner: SimulatedDevice::new(),
        silent: silent.clone(),
    };
    let handle = DeviceHandle::attach(Box::new(transport), Duration::from_millis(50)).unwrap();
    let control = ControlLoop::start(handle, supervisor(), fast_config());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(control.latest_sample().is_some());

    silent.store(true, Ordering::Release);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Failed polls are reported, not escalated; the supervisor only acts
    // on samples it actually saw.
    assert_eq!(control.state(), SupervisorState::Normal);
    assert!(control.stop().await.is_ok());
}
