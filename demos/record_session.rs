//! Record an oximeter session to a CSV file
//!
//! Connects to the oximeter, writes every reading to
//! `readings_<timestamp>.txt` and shows the latest reading on the console.
//! Lost links are retried every 5 seconds.
//!
//! Run with: cargo run --example record_session
//!
//! To use a different device or output directory:
//!   cargo run --example record_session -- --address C4:39:30:38:17:25 --dir /tmp
//!
//! Type `q` and press Enter (or press Ctrl+C) to stop.

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use oximeter_ble::{
    BtleplugLink, CsvReadingStore, Reading, RecoveryEvent, Result, Session, SessionConfig,
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,oximeter_ble=info".into()),
        )
        .init();

    println!("Oximeter Recorder");
    println!("=================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let arg = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    let mut config = SessionConfig::default().with_auto_reconnect(true);
    if let Some(address) = arg("--address") {
        config.address = address;
    }
    let dir = arg("--dir").unwrap_or_else(|| ".".to_string());

    let link = Arc::new(BtleplugLink::new().await?);
    let session = Session::new(config, link)?;

    let store = Arc::new(CsvReadingStore::create_in(&dir)?);
    println!("Recording to {}", store.path().display());
    session.register_consumer(store);
    session.register_fn("console", show_reading);

    // Report reconnection progress without disturbing the reading line
    let mut recovery = session.subscribe_recovery_events();
    tokio::spawn(async move {
        while let Ok(event) = recovery.recv().await {
            match event {
                RecoveryEvent::Started { .. } => println!("\nLink lost, reconnecting..."),
                RecoveryEvent::AttemptFailed { retry_in, .. } => {
                    println!("\nStill unreachable, next try in {:?}", retry_in)
                }
                RecoveryEvent::Reconnected { .. } => println!("\nReconnected"),
                RecoveryEvent::GaveUp { .. } => println!("\nGave up reconnecting"),
                RecoveryEvent::Cancelled { .. } => {}
            }
        }
    });

    println!("Connecting to {}...", session.config().address);
    println!("Type q and press Enter to stop.\n");

    session.run_until(quit_requested()).await?;

    println!("\n\nSession stats: {:?}", session.stats());
    Ok(())
}

/// Resolves on "q" + Enter, end of input, or Ctrl+C.
async fn quit_requested() {
    let console = async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().eq_ignore_ascii_case("q") {
                return;
            }
        }
    };

    tokio::select! {
        _ = console => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

fn show_reading(reading: &Reading) -> Result<()> {
    let mut stdout = std::io::stdout();
    execute!(
        stdout,
        cursor::MoveToColumn(0),
        Clear(ClearType::CurrentLine)
    )?;

    let perfusion = reading
        .perfusion_index()
        .map(|pi| pi.to_string())
        .unwrap_or_else(|| "-".to_string());

    print!(
        "{}  SpO2 {:>3}%  Pulse {:>3} bpm  PI {:>3}  Finger {}",
        reading.timestamp().format("%H:%M:%S"),
        reading.spo2(),
        reading.pulse_bpm(),
        perfusion,
        if reading.finger_detected() { "yes" } else { "no" }
    );
    stdout.flush()?;
    Ok(())
}
