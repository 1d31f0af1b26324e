//! Device handle tests against the simulated detector.

use mppckit_core::{Channel, Error, ProtocolError, SetpointTarget, SignalType, TelemetrySample};
use mppckit_device::{DeviceHandle, SimFault, SimulatedDevice, Transport, POWER_OFF_TEMP_C};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(100);

fn connect(sim: SimulatedDevice) -> DeviceHandle {
    DeviceHandle::attach(Box::new(sim), TIMEOUT).expect("simulator should identify")
}

#[test]
fn attach_accepts_simulated_identity() {
    let mut handle = connect(SimulatedDevice::new());
    let idn = handle.get_hardware_version().unwrap();
    assert!(idn.contains("MPPC"));
    assert_eq!(handle.port_name(), "simulator");
    assert!(format!("{:?}", handle).contains("simulator"));
}

#[test]
fn numeric_payload_bytes_matching_the_terminator_decode_intact() {
    // 4 on the wire is the frame terminator byte; it must still read
    // back as an ordinary payload value.
    let mut sim = SimulatedDevice::new();
    sim.tec_ma = 4;
    sim.vacuum_raw = 4;
    let mut handle = connect(sim);

    assert!((handle.get_tec_current().unwrap() - 4.0).abs() < 1e-9);
    assert!((handle.get_vacuum_pressure().unwrap() - 0.004).abs() < 1e-9);
}

#[test]
fn attach_rejects_foreign_device() {
    /// Transport that answers the identity query like some other instrument.
    struct ForeignDevice {
        inner: SimulatedDevice,
    }

    impl Transport for ForeignDevice {
        fn send(&mut self, data: &[u8]) -> mppckit_core::Result<()> {
            self.inner.send(data)
        }
        fn read_byte(&mut self) -> mppckit_core::Result<Option<u8>> {
            // Rewrite the padded identity payload to something else.
            match self.inner.read_byte()? {
                Some(b) if b.is_ascii_uppercase() => Ok(Some(b'Z')),
                other => Ok(other),
            }
        }
        fn name(&self) -> &str {
            "foreign"
        }
    }

    let result = DeviceHandle::attach(
        Box::new(ForeignDevice {
            inner: SimulatedDevice::new(),
        }),
        TIMEOUT,
    );
    assert!(matches!(
        result,
        Err(Error::Protocol(ProtocolError::IdentityMismatch { .. }))
    ));
}

#[test]
fn voltage_scaling_round_trip() {
    let mut handle = connect(SimulatedDevice::new());

    handle.set_voltage(62.5).unwrap();
    let read = handle.get_voltage().unwrap();
    assert!((read - 62.5).abs() < 1e-5, "got {read}");
}

#[test]
fn voltage_out_of_range_is_rejected_without_io() {
    let mut handle = connect(SimulatedDevice::new());
    assert!(handle.set_voltage(85.0).is_err());
    assert!(handle.set_voltage(-1.0).is_err());
}

#[test]
fn gain_percent_maps_onto_pga_range() {
    let mut handle = connect(SimulatedDevice::new());

    handle.set_gain(100.0).unwrap();
    assert!((handle.get_gain().unwrap() - 100.0).abs() < 0.01);

    handle.set_gain(0.0).unwrap();
    assert!(handle.get_gain().unwrap().abs() < 0.01);
}

#[test]
fn offset_percent_maps_onto_dac_range() {
    let mut handle = connect(SimulatedDevice::new());

    handle.set_offset(50.0).unwrap();
    let read = handle.get_offset().unwrap();
    assert!((read - 50.0).abs() < 0.05, "got {read}");
}

#[test]
fn frontend_offset_round_trip() {
    let mut handle = connect(SimulatedDevice::new());
    handle.set_frontend_offset(2048).unwrap();
    assert_eq!(handle.get_frontend_offset().unwrap(), 2048);
}

#[test]
fn channel_round_trip() {
    let mut handle = connect(SimulatedDevice::new());
    handle.set_channel(Channel::Green).unwrap();
    assert_eq!(handle.get_channel().unwrap(), Channel::Green);
}

#[test]
fn read_sample_composes_all_features() {
    let mut sim = SimulatedDevice::new();
    sim.mppc_temp_uc = 25_000_000;
    sim.hot_plate_uc = 31_000_000;
    sim.vacuum_raw = 2_500;
    sim.tec_ma = 150;
    sim.error_code = 8;

    let mut handle = connect(sim);
    let sample = handle.read_sample(SignalType::Differential).unwrap();

    assert!((sample.mppc_temp_c - 25.0).abs() < 1e-6);
    assert!((sample.heatsink_temp_c - 31.0).abs() < 1e-6);
    assert!((sample.vacuum_pressure_mbar - 2.5).abs() < 1e-6);
    assert!((sample.mppc_current_ma - 150.0).abs() < 1e-6);
    assert_eq!(sample.error_code, TelemetrySample::ERROR_CODE_OK);
    assert!(!sample.has_device_error());
}

#[test]
fn read_sample_surfaces_device_error_code() {
    let mut sim = SimulatedDevice::new();
    sim.error_code = 3;
    let mut handle = connect(sim);

    let sample = handle.read_sample(SignalType::SingleEnded).unwrap();
    assert_eq!(sample.error_code, 3);
    assert!(sample.has_device_error());
}

#[test]
fn stale_eot_from_prior_session_is_tolerated() {
    let mut sim = SimulatedDevice::new();
    sim.push_stale_eot();
    let mut handle = connect(sim);
    assert!(handle.get_voltage().is_ok());
}

#[test]
fn nak_decodes_to_unknown_command() {
    let mut handle = connect(SimulatedDevice::new());
    // Hard to reach through the closed command enum with a healthy device,
    // so make the device NAK everything.
    let mut sim = SimulatedDevice::new();
    sim.fault = SimFault::NakAll;
    let err = DeviceHandle::attach(Box::new(sim), TIMEOUT).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolError::UnknownCommand { .. })
    ));
    // the healthy handle still works
    assert!(handle.get_voltage().is_ok());
}

#[test]
fn silent_device_times_out() {
    let mut sim = SimulatedDevice::new();
    sim.fault = SimFault::Silent;
    let err = DeviceHandle::attach(Box::new(sim), Duration::from_millis(30)).unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn shutdown_zeroes_voltage_then_releases_thermal_target() {
    let mut handle = connect(SimulatedDevice::new());
    handle.set_voltage(70.0).unwrap();

    handle.shutdown().unwrap();

    assert!(handle.get_voltage().unwrap().abs() < 1e-6);
    assert!((handle.get_mppc_temp().unwrap() - POWER_OFF_TEMP_C).abs() < 1e-6);
}

#[test]
fn identify_reports_blank_frontend() {
    let mut sim = SimulatedDevice::new();
    sim.frontend_blank = true;
    let mut handle = connect(sim);

    let identity = handle.identify().unwrap();
    assert!(!identity.frontend_present());

    let mut handle = connect(SimulatedDevice::new());
    let identity = handle.identify().unwrap();
    assert!(identity.frontend_present());
}

#[test]
fn apply_setpoint_writes_everything_but_voltage() {
    let mut handle = connect(SimulatedDevice::new());
    let before = handle.get_voltage().unwrap();

    handle
        .apply_setpoint(&SetpointTarget {
            voltage_v: 55.0,
            gain_pct: 80.0,
            offset_pct: 25.0,
            channel: Channel::Red,
            frontend_offset: Some(600),
            signal: SignalType::SingleEnded,
        })
        .unwrap();

    assert!((handle.get_gain().unwrap() - 80.0).abs() < 0.01);
    assert!((handle.get_offset().unwrap() - 25.0).abs() < 0.05);
    assert_eq!(handle.get_channel().unwrap(), Channel::Red);
    assert_eq!(handle.get_frontend_offset().unwrap(), 600);
    // The bias voltage is ramped by the control loop, never set here.
    assert!((handle.get_voltage().unwrap() - before).abs() < 1e-6);
}

#[test]
fn stabilize_converges_on_instant_plant() {
    let mut handle = connect(SimulatedDevice::new());
    let value = handle
        .stabilize(
            DeviceHandle::set_gain,
            DeviceHandle::get_gain,
            100.0,
            2.0,
            1,
            Duration::from_millis(1),
            Duration::from_millis(200),
        )
        .unwrap();
    assert!((value - 100.0).abs() < 2.0);
}
