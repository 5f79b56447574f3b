//! Command-line DoIP/UDS diagnostic tester
//!
//! Every command loads the connection parameters from a JSON config
//! file, opens a session against the vehicle gateway, runs and tears
//! the session down again.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use diag_session::{
    parse_duration, ConnectionParameters, FlashSet, SequenceScript, SessionCore, SessionEvent,
    SessionState, StepOutcome, VbfFlashDriver,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "diag-cli")]
#[command(author, version, about = "DoIP/UDS vehicle diagnostics CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Connection configuration file (JSON)
    #[arg(short, long, env = "DIAG_CONFIG")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, report the session state and disconnect
    Ping,

    /// Send a raw UDS request ("10 01", "22F190", ...)
    SendUds {
        /// Request as hex command text
        request: String,
    },

    /// Send a raw DoIP payload
    SendDoip {
        /// Payload type as hex, e.g. 0x8001
        #[arg(value_parser = parse_hex_u16)]
        payload_type: u16,

        /// Payload as hex text
        payload: String,
    },

    /// Security access (unlock ECU)
    SecurityAccess {
        /// Security level
        #[arg(long, default_value = "1")]
        level: u8,

        /// Key material as hex text, e.g. "01020304"
        #[arg(long, default_value = "")]
        key: String,
    },

    /// Hold the session open with tester-present keep-alive
    TesterPresent {
        /// Keep-alive interval ("2s", "500ms")
        #[arg(long, default_value = "2s")]
        interval: String,

        /// How long to hold the session open
        #[arg(long, default_value = "60s")]
        hold: String,
    },

    /// Flash VBF files to the ECU
    Flash {
        /// VBF files, downloaded in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Security level to unlock before flashing
        #[arg(long, default_value = "1")]
        level: u8,

        /// Key material as hex text
        #[arg(long, default_value = "")]
        key: String,
    },

    /// Run a JSON sequence script
    RunSequence {
        /// Sequence file path
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let params = ConnectionParameters::from_file(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let session = SessionCore::new(params).context("creating session")?;

    let result = run_command(&session, &cli.command).await;
    if session.state() != SessionState::Disconnected {
        let _ = session.disconnect().await;
    }
    result
}

async fn run_command(session: &SessionCore, command: &Commands) -> Result<()> {
    match command {
        Commands::Ping => {
            session.connect().await?;
            println!("session {}", session.state());
            session.disconnect().await?;
        }

        Commands::SendUds { request } => {
            session.connect().await?;
            match session.send_uds_text(request).await? {
                Some(response) => println!("{}", hex_spaced(&response.raw)),
                None => println!("(suppressed, no response awaited)"),
            }
        }

        Commands::SendDoip {
            payload_type,
            payload,
        } => {
            session.connect().await?;
            let bytes = decode_hex_text(payload)?;
            match session.send_doip(*payload_type, bytes).await? {
                Some(response) => println!("{}", hex_spaced(&response.raw)),
                None => println!("sent"),
            }
        }

        Commands::SecurityAccess { level, key } => {
            session.connect().await?;
            let key = decode_hex_text(key)?;
            session.security_access(*level, &key).await?;
            println!("unlocked at level {level}");
        }

        Commands::TesterPresent { interval, hold } => {
            let interval = parse_duration(interval)
                .with_context(|| format!("invalid interval '{interval}'"))?;
            let hold =
                parse_duration(hold).with_context(|| format!("invalid hold duration '{hold}'"))?;

            session.connect().await?;
            session.trigger_tester_present(true, Some(interval)).await?;
            println!("holding session for {hold:?}, ctrl-c to stop");
            tokio::select! {
                _ = tokio::time::sleep(hold) => {}
                _ = tokio::signal::ctrl_c() => println!("interrupted"),
            }
        }

        Commands::Flash { files, level, key } => {
            let set = FlashSet::load(files)?;
            session.connect().await?;
            let key = decode_hex_text(key)?;
            session.security_access(*level, &key).await?;

            session.load_flash_set(set);
            session.set_flash_driver(Arc::new(VbfFlashDriver::default()));

            let progress = tokio::spawn(report_progress(session.subscribe()));
            session.flash().await?;
            progress.abort();
            println!("flash complete");
        }

        Commands::RunSequence { file } => {
            let script = SequenceScript::from_file(file)?;
            session.load_sequence(script);

            let progress = tokio::spawn(report_progress(session.subscribe()));
            let result = session.execute_sequence().await;
            // Give the reporter a beat to drain step events
            tokio::time::sleep(Duration::from_millis(50)).await;
            progress.abort();
            result?;
            println!("sequence complete");
        }
    }
    Ok(())
}

/// Print step and flash progress events as they arrive.
async fn report_progress(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            SessionEvent::SequenceStep {
                index,
                name,
                outcome,
            } => match outcome {
                StepOutcome::Started => println!("[{index}] {name} ..."),
                StepOutcome::Passed => println!("[{index}] {name} ok"),
                StepOutcome::Failed(reason) => println!("[{index}] {name} FAILED: {reason}"),
            },
            SessionEvent::FlashProgress { file, percent } => {
                println!("{file}: {percent}%");
            }
            SessionEvent::ConnectionLost { reason } => {
                println!("connection lost: {reason}");
            }
            _ => {}
        }
    }
}

fn parse_hex_u16(text: &str) -> Result<u16, String> {
    u16::from_str_radix(text.trim().trim_start_matches("0x"), 16)
        .map_err(|_| format!("'{text}' is not a valid hex value"))
}

fn decode_hex_text(text: &str) -> Result<Vec<u8>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let cleaned: String = text
        .split_whitespace()
        .map(|tok| tok.trim_start_matches("0x"))
        .collect();
    if cleaned.len() % 2 != 0 {
        bail!("odd number of hex digits in '{text}'");
    }
    hex::decode(&cleaned).with_context(|| format!("invalid hex '{text}'"))
}

fn hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
