//! YawIO demo daemon
//!
//! Discovers motion platforms on the local network, claims the first
//! available one, starts a session, and streams a gentle synthetic motion
//! profile until interrupted. Intended as a smoke-test harness and as a
//! reference for embedding [`yaw_io::YawController`] in a host application.

use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use yaw_io::controller::YawController;
use yaw_io::config::AppConfig;
use yaw_io::device::DeviceStatus;
use yaw_io::error::{Error, Result};
use yaw_io::motion::ReferenceBody;
use yaw_io::prefs::TomlPrefStore;
use yaw_io::transport::{TcpControlChannel, TelemetryChannel, UdpTelemetryChannel};
use yaw_io::types::Rotation;
use yaw_io::ControllerState;

/// Fixed tick rate for the demo loop
const TICK: Duration = Duration::from_millis(20);

/// Parse config path from command line arguments.
///
/// Supports:
/// - `yaw-io <path>` (positional)
/// - `yaw-io --config <path>` (flag-based)
/// - `yaw-io -c <path>` (short flag)
///
/// Defaults to `/etc/yawio.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    // Look for --config or -c flag
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    // Fall back to first positional argument (if it doesn't start with -)
    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    // Default path
    "/etc/yawio.toml".to_string()
}

fn main() -> Result<()> {
    let config_path = parse_config_path();
    let config = match AppConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(Error::Io(_)) => {
            eprintln!("No config at {}, using defaults", config_path);
            AppConfig::defaults()
        }
        Err(e) => return Err(e),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.clone()),
    )
    .init();

    log::info!("YawIO starting as game {:?}", config.game.name);

    let telemetry = UdpTelemetryChannel::bind(config.network.udp_port)?;
    let udp_port = telemetry.local_port();
    let prefs = TomlPrefStore::open(&config.preferences.path);

    let mut controller = YawController::new(
        Box::new(TcpControlChannel::new()),
        Box::new(telemetry),
        Box::new(prefs),
        config.game.name.clone(),
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Config(format!("Error setting Ctrl-C handler: {}", e)))?;

    if controller.state() == ControllerState::Initial {
        controller.discover_devices(udp_port)?;
        log::info!("Discovering devices on UDP port {}", udp_port);
    }

    log::info!("YawIO running. Press Ctrl-C to stop.");

    let start = Instant::now();
    let mut last_tick = Instant::now();
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        let dt = now.duration_since(last_tick).as_secs_f32();
        last_tick = now;

        // Gentle synthetic sway so a started platform visibly moves
        let t = now.duration_since(start).as_secs_f32();
        let body = ReferenceBody {
            orientation: Rotation::new(
                (t * 6.0) % 360.0,
                (t * 0.7).sin() * 8.0,
                (t * 0.9).sin() * 5.0,
            ),
            world_velocity: None,
        };

        controller.update(now, dt, Some(&body));

        // Claim the first available device the moment discovery finds one
        if controller.state() == ControllerState::Initial {
            let target = controller
                .devices()
                .iter()
                .find(|d| d.status == DeviceStatus::Available)
                .cloned();
            if let Some(device) = target {
                controller.stop_discovery();
                log::info!("Claiming {} at {}", device.name, device.address);
                controller.connect_to_device(
                    device,
                    None,
                    Some(Box::new(|e| log::error!("Connect failed: {}", e))),
                );
            }
        } else if controller.state() == ControllerState::Connected {
            controller.start_device(
                Some(Box::new(|| log::info!("Session started"))),
                Some(Box::new(|e| log::error!("Start failed: {}", e))),
            );
        }

        std::thread::sleep(TICK);
    }

    // Shutdown
    log::info!("Shutting down...");
    if controller.state() != ControllerState::Initial {
        controller.disconnect_from_device(
            Some(Box::new(|| log::info!("Session closed"))),
            Some(Box::new(|e| log::warn!("Disconnect failed: {}", e))),
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.state() != ControllerState::Initial && Instant::now() < deadline {
            controller.update(Instant::now(), TICK.as_secs_f32(), None);
            std::thread::sleep(TICK);
        }
    }

    log::info!("YawIO stopped");
    Ok(())
}
