//! Console commands
//!
//! Each command maps onto one controller operation. Commands are parsed with
//! `clap` in multicall mode, so the first word of a line selects the
//! command and the `twai_*` names work as aliases.

use std::sync::Arc;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::error::ErrorKind as ClapErrorKind;
use clap::{ArgAction, Args, CommandFactory, Parser};
use log::{debug, info};

use crate::codec::{decode_frame, parse_controller_selector, parse_timestamp_mode};
use crate::constants::DEFAULT_TX_TIMEOUT_MS;
use crate::controller::Twai;
use crate::error::{ErrorKind, ParseError, Result, TwaiError};
use crate::structures::{InitOverrides, TimestampMode};

/// One console command line
#[derive(Parser, Debug)]
#[command(multicall = true)]
pub enum ConsoleCommand {
    /// Initialize and start a TWAI controller
    #[command(name = "init", alias = "twai_init")]
    Init(InitArgs),
    /// Stop and release a TWAI controller
    #[command(name = "deinit", alias = "twai_deinit")]
    Deinit(ControllerArg),
    /// Show controller configuration and status
    #[command(name = "info", alias = "twai_info")]
    Info(ControllerArg),
    /// Restore the default configuration, restarting a running controller
    #[command(name = "reset", alias = "twai_reset")]
    Reset(ControllerArg),
    /// Send one frame and wait for its completion
    #[command(name = "send", alias = "twai_send")]
    Send(SendArgs),
    /// Print received frames, or stop printing them
    #[command(name = "dump", alias = "twai_dump")]
    Dump(DumpArgs),
}

#[derive(Args, Debug)]
pub struct ControllerArg {
    /// TWAI controller ID
    #[arg(value_name = "controller_id")]
    pub controller: usize,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// TWAI controller ID
    #[arg(value_name = "controller_id")]
    pub controller: usize,
    /// Arbitration bitrate in bps
    #[arg(short = 'r', long = "rate", value_name = "bps")]
    pub rate: Option<u32>,
    /// Loopback mode (true/false, 1/0)
    #[arg(
        short = 'l',
        long = "loopback",
        value_name = "true|false",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub loopback: Option<bool>,
    /// Listen-only mode (true/false, 1/0)
    #[arg(
        short = 'L',
        long = "listen",
        value_name = "true|false",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub listen: Option<bool>,
    /// FD data bitrate in bps
    #[arg(short = 'f', long = "fd-rate", value_name = "bps")]
    pub fd_rate: Option<u32>,
}

impl InitArgs {
    fn overrides(&self) -> InitOverrides {
        InitOverrides {
            bitrate: self.rate,
            loopback: self.loopback,
            listen_only: self.listen,
            fd_bitrate: self.fd_rate,
        }
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// TWAI controller ID
    #[arg(value_name = "controller_id")]
    pub controller: usize,
    /// Frame, e.g. 123#AABBCC, 12345678#R, 123##1AABB
    #[arg(value_name = "frame_str")]
    pub frame: Option<String>,
    /// Frame string, when not given positionally
    #[arg(short = 'i', long = "id", value_name = "frame_str")]
    pub id: Option<String>,
    /// Frame string, when neither the positional form nor `--id` is given
    #[arg(short = 'd', long = "data", value_name = "frame_str")]
    pub data: Option<String>,
}

impl SendArgs {
    /// The frame text; the positional form wins over `--id`, then `--data`
    pub fn frame_text(&self) -> Option<&str> {
        self.frame
            .as_deref()
            .or(self.id.as_deref())
            .or(self.data.as_deref())
    }
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Controller and optional filters, e.g. twai0,123:7FF,a-15
    #[arg(value_name = "controller[,filter]")]
    pub target: String,
    /// Timestamp mode: a (absolute), d (delta), z (zero-relative), n (none)
    #[arg(
        short = 't',
        long = "timestamp",
        value_name = "mode",
        default_value = "n",
        value_parser = timestamp_mode
    )]
    pub timestamp: TimestampMode,
    /// Stop dumping on the controller
    #[arg(long)]
    pub stop: bool,
}

fn timestamp_mode(text: &str) -> std::result::Result<TimestampMode, ParseError> {
    parse_timestamp_mode(text)
}

/// Console front-end over a controller set
pub struct Console {
    twai: Arc<Twai>,
    tx_timeout: Duration,
}

impl Console {
    pub fn new(twai: Arc<Twai>) -> Self {
        Self {
            twai,
            tx_timeout: Duration::from_millis(DEFAULT_TX_TIMEOUT_MS),
        }
    }

    /// Set the completion wait of `send`
    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// The controllers driven by this console
    pub fn twai(&self) -> &Twai {
        &self.twai
    }

    /// One line per command: name, aliases and summary
    pub fn help() -> String {
        let mut text = String::new();
        for command in ConsoleCommand::command().get_subcommands() {
            let aliases: Vec<&str> = command.get_all_aliases().collect();
            text.push_str(&format!(
                "  {:<8} {:<13} {}\n",
                command.get_name(),
                aliases.join(","),
                command.get_about().map(|about| about.to_string()).unwrap_or_default()
            ));
        }
        text
    }

    /// Parse and run one command line
    ///
    /// # Returns
    /// 0 on success, otherwise the exit code of the failure
    pub fn execute(&self, line: &str) -> i32 {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(&name) = words.first() else {
            return 0;
        };

        let command = match ConsoleCommand::try_parse_from(words.iter().copied()) {
            Ok(command) => command,
            Err(e) => {
                let code = match e.kind() {
                    ClapErrorKind::DisplayHelp
                    | ClapErrorKind::DisplayVersion
                    | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
                    _ => ErrorKind::InvalidArgument.exit_code(),
                };
                // Help and usage text go to the terminal as clap renders them
                let _ = e.print();
                return code;
            }
        };

        match self.run(&command) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{}: {}", name, e);
                e.exit_code()
            }
        }
    }

    /// Run a parsed command
    pub fn run(&self, command: &ConsoleCommand) -> Result<()> {
        debug!("{:?}", command);
        match command {
            ConsoleCommand::Init(args) => self.twai.initialize(args.controller, &args.overrides()),
            ConsoleCommand::Deinit(args) => self.twai.deinitialize(args.controller),
            ConsoleCommand::Info(args) => {
                let info = self.twai.describe(args.controller)?;
                println!("{}", info);
                Ok(())
            }
            ConsoleCommand::Reset(args) => self.twai.reset(args.controller),
            ConsoleCommand::Send(args) => {
                let text = args.frame_text().ok_or_else(|| {
                    TwaiError::InvalidArgument("missing frame string".to_string())
                })?;
                let frame = decode_frame(text)?;
                self.twai
                    .transmit_sync(args.controller, &frame, self.tx_timeout)?;
                info!("twai{}: sent {}", args.controller, frame);
                Ok(())
            }
            ConsoleCommand::Dump(args) => {
                let (controller, filters) =
                    parse_controller_selector(&args.target, self.twai.controller_count())?;
                if args.stop {
                    return self.twai.stop_capture(controller);
                }
                self.twai.apply_filters(controller, filters)?;
                self.twai.start_capture(controller, args.timestamp)
            }
        }
    }
}
