//! Interactive TWAI console
//!
//! Reads commands from stdin, one per line, and runs them against the
//! selected back-end. `help` lists the commands; `exit` or end of input quits.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info};

use twai_utils::constants::{
    DEFAULT_CAPTURE_POLL_MS, DEFAULT_CAPTURE_QUEUE_DEPTH, DEFAULT_CONTROLLER_COUNT,
    DEFAULT_TX_TIMEOUT_MS, MAX_CONTROLLERS,
};
use twai_utils::{
    CaptureSettings, Console, GsUsbDriver, StdoutSink, Twai, TwaiDriver, VirtualDriver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process simulated bus
    Virtual,
    /// First GS-USB adapter found on USB
    GsUsb,
}

#[derive(Parser, Debug)]
#[command(name = "twai-utils")]
#[command(about = "Interactive console for TWAI (CAN / CAN FD) controllers")]
#[command(version)]
struct Cli {
    /// Transceiver back-end
    #[arg(long, value_enum, default_value = "virtual")]
    driver: Backend,
    /// Controllers on the virtual bus
    #[arg(
        long,
        default_value_t = DEFAULT_CONTROLLER_COUNT as u8,
        value_parser = clap::value_parser!(u8).range(1..=MAX_CONTROLLERS as i64)
    )]
    controllers: u8,
    /// Capture ring capacity in frames
    #[arg(long, default_value_t = DEFAULT_CAPTURE_QUEUE_DEPTH)]
    queue_depth: usize,
    /// Capture consumer poll interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_CAPTURE_POLL_MS)]
    poll_ms: u64,
    /// Completion wait of `send` in milliseconds
    #[arg(long, default_value_t = DEFAULT_TX_TIMEOUT_MS)]
    tx_timeout_ms: u64,
}

fn open_driver(cli: &Cli) -> twai_utils::Result<Arc<dyn TwaiDriver>> {
    let driver: Arc<dyn TwaiDriver> = match cli.driver {
        Backend::Virtual => Arc::new(VirtualDriver::new(usize::from(cli.controllers))),
        Backend::GsUsb => Arc::new(GsUsbDriver::open_first()?),
    };
    Ok(driver)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let driver = match open_driver(&cli) {
        Ok(driver) => driver,
        Err(e) => {
            error!("Cannot open {:?} driver: {}", cli.driver, e);
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let poll_interval = Duration::from_millis(cli.poll_ms.max(1));
    let settings = CaptureSettings {
        queue_depth: cli.queue_depth.max(1),
        poll_interval,
        stop_timeout: poll_interval * 2,
        ..CaptureSettings::default()
    };
    let twai = Twai::with_settings(driver, settings, Arc::new(StdoutSink));
    info!(
        "{} controller(s) ready, type 'help' for commands",
        twai.controller_count()
    );
    let console = Console::new(Arc::new(twai))
        .with_tx_timeout(Duration::from_millis(cli.tx_timeout_ms));

    let stdin = io::stdin();
    let mut last_status = 0;
    loop {
        print!("twai> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("Cannot read from stdin: {}", e);
                break;
            }
        }
        match line.trim() {
            "exit" | "quit" => break,
            "" => continue,
            "help" => print!("{}", Console::help()),
            command => {
                last_status = console.execute(command);
                if last_status != 0 {
                    println!("Command returned non-zero error code: {}", last_status);
                }
            }
        }
    }

    ExitCode::from(last_status as u8)
}
