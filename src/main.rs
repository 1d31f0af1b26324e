use anyhow::{bail, Context};
use mppckit::event_bus::event_bus;
use mppckit::{
    init_logging, BoardId, CalibrationConfig, CalibrationEngine, Config, ConnectionEvent,
    ControlLoop, ControlLoopConfig, DeviceEvent, DeviceHandle, IspToolWriter, SafetySupervisor,
    SequencerConfig, SetpointTarget, SignalType, SimulatedDevice, SupervisorConfig, UploadRequest,
    UploadSequencer,
};
use std::path::PathBuf;
use std::time::Duration;

const USAGE: &str = "\
mppckit - MPPC detector control and firmware updating

Usage:
  mppckit [monitor] [options]
  mppckit calibrate [options]
  mppckit flash --board cb|fe|both --image <path> [--frontend-image <path>] [options]

Options:
  --config <path>      Configuration file (default: platform config dir)
  --simulate           Run against the in-memory simulator
  --board <target>     Board to flash: cb, fe or both
  --image <path>       Firmware image (computer board image for 'both')
  --frontend-image <path>  Front-end image when flashing both boards
  --checksum <crc32>       Expected CRC-32 of --image (hex or decimal)
  --frontend-checksum <crc32>  Expected CRC-32 of --frontend-image
";

enum Role {
    Monitor,
    Calibrate,
    Flash {
        board: String,
        image: PathBuf,
        checksum: Option<u32>,
        frontend_image: Option<PathBuf>,
        frontend_checksum: Option<u32>,
    },
}

struct CliArgs {
    role: Role,
    config_path: Option<PathBuf>,
    simulate: bool,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1).peekable();

    let role_name = match args.peek().map(String::as_str) {
        Some(name) if !name.starts_with("--") => {
            let name = name.to_string();
            args.next();
            name
        }
        _ => "monitor".to_string(),
    };

    let mut config_path = None;
    let mut simulate = false;
    let mut board = None;
    let mut image = None;
    let mut checksum = None;
    let mut frontend_image = None;
    let mut frontend_checksum = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(
                    args.next().context("--config requires a path")?,
                ));
            }
            "--simulate" => simulate = true,
            "--board" => board = Some(args.next().context("--board requires a target")?),
            "--image" => {
                image = Some(PathBuf::from(args.next().context("--image requires a path")?));
            }
            "--checksum" => {
                checksum = Some(parse_crc32(
                    &args.next().context("--checksum requires a value")?,
                )?);
            }
            "--frontend-image" => {
                frontend_image = Some(PathBuf::from(
                    args.next().context("--frontend-image requires a path")?,
                ));
            }
            "--frontend-checksum" => {
                frontend_checksum = Some(parse_crc32(
                    &args.next().context("--frontend-checksum requires a value")?,
                )?);
            }
            "--help" | "-h" => {
                print!("{}", USAGE);
                std::process::exit(0);
            }
            other => bail!("Unknown argument {:?}\n\n{}", other, USAGE),
        }
    }

    let role = match role_name.as_str() {
        "monitor" => Role::Monitor,
        "calibrate" => Role::Calibrate,
        "flash" => Role::Flash {
            board: board.context("flash requires --board cb|fe|both")?,
            image: image.context("flash requires --image <path>")?,
            checksum,
            frontend_image,
            frontend_checksum,
        },
        other => bail!("Unknown command {:?}\n\n{}", other, USAGE),
    };

    Ok(CliArgs {
        role,
        config_path,
        simulate,
    })
}

fn parse_crc32(value: &str) -> anyhow::Result<u32> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("Invalid CRC-32 value {:?}", value))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        return Ok(Config::load_from_file(path)
            .with_context(|| format!("Loading config {}", path.display()))?);
    }
    match Config::default_path() {
        Some(default) if default.exists() => Ok(Config::load_from_file(&default)?),
        _ => Ok(Config::default()),
    }
}

fn connect(config: &Config, simulate: bool) -> mppckit::Result<DeviceHandle> {
    let timeout = Duration::from_millis(config.connection.timeout_ms);
    if simulate {
        tracing::info!("Using the in-memory simulator");
        return DeviceHandle::attach(Box::new(SimulatedDevice::new()), timeout);
    }
    if config.connection.is_auto() {
        DeviceHandle::probe(config.connection.baud_rate, timeout)
    } else {
        DeviceHandle::open_port(&config.connection.port, config.connection.baud_rate, timeout)
    }
}

/// Restore the configured operating state on a fresh session.
fn apply_setpoints(handle: &mut DeviceHandle, config: &Config) -> mppckit::Result<()> {
    // A configured front-end offset wins; otherwise fall back to the
    // persisted calibration, if one exists.
    let frontend_offset = match config.setpoints.frontend_offset {
        Some(value) => Some(value),
        None => calibration_path(config)
            .and_then(|p| CalibrationEngine::load(&p).ok().flatten())
            .map(|record| record.frontend_offset),
    };

    handle.apply_setpoint(&SetpointTarget {
        voltage_v: config.setpoints.voltage_v,
        gain_pct: config.setpoints.gain_pct,
        offset_pct: config.setpoints.offset_pct,
        channel: config.effective_channel(),
        frontend_offset,
        signal: signal_type(config),
    })?;
    handle.set_target_mppc_temp(config.thermal.effective_target_c())
}

fn signal_type(config: &Config) -> SignalType {
    if config.signal.differential {
        SignalType::Differential
    } else {
        SignalType::SingleEnded
    }
}

fn calibration_path(config: &Config) -> Option<PathBuf> {
    config
        .calibration_file
        .clone()
        .or_else(Config::default_calibration_path)
}

fn supervisor(config: &Config) -> mppckit::Result<SafetySupervisor> {
    Ok(SafetySupervisor::new(SupervisorConfig {
        mppc_temp_rel: config.safe_ranges.mppc_temp_rel_range()?,
        heatsink_temp: config.safe_ranges.heatsink_temp_range()?,
        mppc_current: config.safe_ranges.mppc_current_range()?,
        vacuum_pressure: config.safe_ranges.vacuum_pressure_range()?,
        target_mppc_temp_c: config.thermal.effective_target_c(),
        ambient: config.thermal.ambient,
        trip_after_violations: config.supervisor.trip_after_violations,
    }))
}

async fn run_monitor(config: Config, simulate: bool) -> anyhow::Result<()> {
    let mut handle = connect(&config, simulate)?;
    let identity = handle.identify()?;
    tracing::info!(
        "Detector {} (fw {}), front-end fw {}",
        identity.serial_number,
        identity.firmware_version,
        identity.frontend_firmware_version
    );
    event_bus().publish(DeviceEvent::Connection(ConnectionEvent::Connected {
        port: handle.port_name().to_string(),
        firmware: identity.firmware_version.clone(),
        serial_number: identity.serial_number.clone(),
    }));

    apply_setpoints(&mut handle, &config)?;

    let loop_config = ControlLoopConfig {
        poll_interval: Duration::from_millis(config.supervisor.poll_interval_ms),
        signal: signal_type(&config),
        ..ControlLoopConfig::default()
    };
    let control = ControlLoop::start(handle, supervisor(&config)?, loop_config);
    if config.setpoints.voltage_v > 0.0 {
        control.set_voltage_target(config.setpoints.voltage_v);
    }

    tracing::info!("Monitoring; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let handle = control.stop().await?;
    event_bus().publish(DeviceEvent::Connection(ConnectionEvent::Disconnected {
        port: handle.port_name().to_string(),
    }));
    tracing::info!("Session closed");
    Ok(())
}

async fn run_calibrate(config: Config, simulate: bool) -> anyhow::Result<()> {
    let mut handle = connect(&config, simulate)?;
    apply_setpoints(&mut handle, &config)?;

    let record_path = calibration_path(&config)
        .context("No calibration record path available on this platform")?;
    let calibration_config = CalibrationConfig {
        voltage_v: if config.setpoints.voltage_v > 0.0 {
            config.setpoints.voltage_v
        } else {
            CalibrationConfig::default().voltage_v
        },
        ..CalibrationConfig::default()
    };
    let engine = CalibrationEngine::new(calibration_config, record_path);

    // Ctrl-C aborts between probe points, leaving any prior record intact.
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop_flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop_flag.store(true, std::sync::atomic::Ordering::Release);
        }
    });

    let record =
        tokio::task::spawn_blocking(move || engine.run(&mut handle, Some(&stop))).await??;
    println!(
        "Calibrated front-end offset: {} (at {:.1} V, {})",
        record.frontend_offset, record.voltage_v, record.timestamp
    );
    Ok(())
}

async fn run_flash(
    config: Config,
    simulate: bool,
    board: String,
    image: PathBuf,
    checksum: Option<u32>,
    frontend_image: Option<PathBuf>,
    frontend_checksum: Option<u32>,
) -> anyhow::Result<()> {
    let request = match board.as_str() {
        "cb" => UploadRequest {
            computer_image: Some(image),
            computer_checksum: checksum,
            ..UploadRequest::default()
        },
        "fe" => UploadRequest {
            frontend_image: Some(image),
            frontend_checksum: checksum,
            ..UploadRequest::default()
        },
        "both" => UploadRequest {
            computer_image: Some(image),
            computer_checksum: checksum,
            frontend_image: Some(
                frontend_image.context("flashing both boards requires --frontend-image")?,
            ),
            frontend_checksum,
        },
        other => bail!("Unknown board {:?}, expected cb, fe or both", other),
    };

    // A factory-fresh computer board answers nothing, which is fine when
    // this request is going to flash it anyway.
    let handle = match connect(&config, simulate) {
        Ok(handle) => Some(handle),
        Err(e) if request.computer_image.is_some() => {
            tracing::info!("No responding detector ({}); assuming blank computer board", e);
            None
        }
        Err(e) => return Err(e.into()),
    };

    let port = match &handle {
        Some(handle) => handle.port_name().to_string(),
        None if !config.connection.is_auto() => config.connection.port.clone(),
        None => bail!("Flashing a blank board requires an explicit port in the config"),
    };

    let writer = IspToolWriter::new(config.flashing.tool_command.clone());
    let mut sequencer = UploadSequencer::new(
        writer,
        SequencerConfig {
            attempts: config.flashing.attempts,
            backoff: Duration::from_millis(config.flashing.backoff_ms),
        },
    );

    // Flashing the computer board reboots it out of the session, so the
    // sequencer opens a fresh one for the front-end leg of a two-board
    // job.
    let baud = config.connection.baud_rate;
    let timeout = Duration::from_millis(config.connection.timeout_ms);
    tokio::task::spawn_blocking(move || {
        let mut reconnect = move |port: &str| -> mppckit::Result<DeviceHandle> {
            if simulate {
                DeviceHandle::attach(Box::new(SimulatedDevice::new()), timeout)
            } else {
                DeviceHandle::open_port(port, baud, timeout)
            }
        };
        sequencer.run(handle, &port, &request, &mut reconnect)
    })
    .await??;

    let flashed = match board.as_str() {
        "cb" => format!("{}", BoardId::Computer),
        "fe" => format!("{}", BoardId::FrontEnd),
        _ => format!("{} and {}", BoardId::Computer, BoardId::FrontEnd),
    };
    println!("Flashed {}", flashed);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = parse_args()?;
    let config = load_config(args.config_path.as_ref())?;
    config.validate()?;

    match args.role {
        Role::Monitor => run_monitor(config, args.simulate).await,
        Role::Calibrate => run_calibrate(config, args.simulate).await,
        Role::Flash {
            board,
            image,
            checksum,
            frontend_image,
            frontend_checksum,
        } => {
            run_flash(
                config,
                args.simulate,
                board,
                image,
                checksum,
                frontend_image,
                frontend_checksum,
            )
            .await
        }
    }
}
