use std::{process::ExitCode, sync::Arc, time::Duration};

use btle_rf::{
    file::FileRadio,
    monitoring::spawn_monitor,
    shutdown::install_signal_handler,
    sim::SimulatedRadio,
    start_capture, CaptureError, RadioDevice, SessionContext, StopReason, StreamConfig, LEN_BUF,
};
use clap::Parser;
use tracing::{error, info, warn};

mod args;

use args::{convert_filter, Args, DeviceKind};

/// How often the main thread checks whether it should tear down
const WAIT_POLL: Duration = Duration::from_millis(50);

fn run<D: RadioDevice>(
    device: D,
    session: Arc<SessionContext>,
    config: StreamConfig,
    stats_interval: Duration,
) -> Result<(), CaptureError> {
    let capture = start_capture(Arc::new(device), Arc::clone(&session), config)?;
    let monitor = match spawn_monitor(Arc::clone(&session), stats_interval) {
        Ok(monitor) => Some(monitor),
        Err(e) => {
            warn!("Failed to start monitor: {e}");
            None
        }
    };

    match capture.wait(WAIT_POLL) {
        StopReason::Requested => info!("Stop requested"),
        StopReason::StreamEnded => info!("Stream ended"),
    }
    let result = capture.stop();

    if let Some(monitor) = monitor {
        match monitor.join() {
            Ok(stats) => info!("Captured {} samples", stats.total_bytes / 2),
            Err(_) => warn!("Monitor thread panicked"),
        }
    }
    result
}

fn main() -> ExitCode {
    // Get the CLI options
    let args = Args::parse();

    // Setup the logger
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    // The cyclic buffer and stop flag live for the whole process
    let session = match SessionContext::try_new(LEN_BUF) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = install_signal_handler(Arc::clone(&session)) {
        error!("Failed to set up signal handler: {e}");
        return ExitCode::FAILURE;
    }

    let config = args.stream_config();
    let stats_interval = Duration::from_millis(args.stats_ms);
    info!(
        "Capturing at {}Hz, {}Hz sample rate, {}dB gain",
        config.frequency_hz, config.sample_rate_hz, config.gain_db
    );

    let result = match args.device {
        DeviceKind::Sim => run(SimulatedRadio::new(), session, config, stats_interval),
        DeviceKind::File => {
            // Enforced by the parser
            let Some(path) = args.input.clone() else {
                error!("--input is required with --device file");
                return ExitCode::FAILURE;
            };
            let radio = FileRadio::new(path).repeat(args.repeat);
            run(radio, session, config, stats_interval)
        }
        #[cfg(feature = "bladerf")]
        DeviceKind::Bladerf => {
            let radio = btle_rf::bladerf::BladerfRadio::new(args.identifier.clone());
            run(radio, session, config, stats_interval)
        }
        #[cfg(not(feature = "bladerf"))]
        DeviceKind::Bladerf => {
            error!(
                identifier = args.identifier.as_deref(),
                "Built without bladeRF support, rebuild with --features bladerf"
            );
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
