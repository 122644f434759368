//! Repeatedly takes the write lock for a face-down device and writes an
//! increasing integer to a file.
//!
//! Orientation readings are read from stdin, one `azimuth pitch roll` per
//! line. The program stops on Ctrl-C, at the end of stdin, or after
//! `--iterations` writes.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use orientation_lock::error::AcquireError;
use orientation_lock::{DeviceOrientation, OrientationLock, OrientationRange};
use tokio::sync::mpsc;
use tracing::{Level, debug, error, info, warn};

/// Any azimuth, pitch within 10 degrees of 180, roll within 10 degrees of 0.
const FACE_DOWN: OrientationRange =
    OrientationRange::new(DeviceOrientation::new(0, 180, 0), 180, 10, 10);

#[derive(Parser, Debug)]
#[command(
    name = "selector",
    version,
    about = "Writes an increasing integer while the device is face down"
)]
struct Cli {
    /// First integer to write
    start: u64,

    /// File the integer is written to
    #[arg(short = 'o', long = "output", default_value = "integer")]
    output: PathBuf,

    /// Stop after this many writes
    #[arg(short = 'n', long = "iterations")]
    iterations: Option<u64>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbosity: u8,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let lock = OrientationLock::new();
    tokio::spawn(feed_orientation(lock.clone(), read_stdin_lines()));
    tokio::spawn({
        let lock = lock.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
            }
            lock.shutdown();
        }
    });

    let written = write_loop(&lock, cli.start, &cli.output, cli.iterations).await;
    info!(?written, "selector finished");
    written.map(|_| ())
}

/// Reads stdin on its own thread. A blocked read there cannot hold up
/// runtime shutdown, so the process still exits on Ctrl-C or `--iterations`.
fn read_stdin_lines() -> mpsc::Receiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Feeds orientation readings into `lock`, shutting it down at end of input.
async fn feed_orientation(
    lock: OrientationLock,
    mut lines: mpsc::Receiver<std::io::Result<String>>,
) {
    while let Some(line) = lines.recv().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => match line.parse::<DeviceOrientation>() {
                Ok(orientation) => lock.set_orientation(orientation),
                Err(err) => warn!(%err, "ignoring orientation reading"),
            },
            Err(err) => {
                error!(%err, "failed to read orientation");
                break;
            }
        }
    }
    lock.shutdown();
}

/// Returns the number of integers written before the lock was shut down, an
/// acquisition failed, or the iteration limit was reached.
async fn write_loop(
    lock: &OrientationLock,
    start: u64,
    output: &Path,
    iterations: Option<u64>,
) -> std::io::Result<u64> {
    let mut counter = start;
    let mut written = 0;
    while iterations.is_none_or(|limit| written < limit) {
        let handle = match lock.acquire_write(FACE_DOWN).await {
            Ok(handle) => handle,
            Err(AcquireError::Closed) => break,
            Err(err) => {
                warn!(%err, "write lock not acquired");
                break;
            }
        };
        let result = tokio::fs::write(output, counter.to_string()).await;
        if result.is_ok() {
            println!("{counter}");
        }
        if let Err(err) = lock.release_write(handle) {
            error!(%err, "failed to release write lock");
        }
        result?;
        debug!(counter, "integer written");
        counter += 1;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use orientation_lock::Config;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_feed_applies_readings_and_shuts_down_when_input_ends() {
        let lock = OrientationLock::new();
        let (tx, rx) = mpsc::channel(4);
        let feeder = tokio::spawn(feed_orientation(lock.clone(), rx));

        tx.send(Ok("not a reading".to_owned())).await.unwrap();
        tx.send(Ok("10 180 -2".to_owned())).await.unwrap();
        drop(tx);
        timeout(Duration::from_secs(1), feeder)
            .await
            .expect("feeder did not stop at end of input")
            .unwrap();

        assert_eq!(lock.orientation(), DeviceOrientation::new(10, 180, -2));
        assert!(lock.is_closed());
    }

    #[tokio::test]
    async fn test_write_loop_stops_on_failed_acquire() {
        let dir = std::env::temp_dir().join(format!("selector-timeout-{}", std::process::id()));
        let lock = OrientationLock::with_config(Config {
            acquire_timeout: Some(Duration::from_millis(5)),
            ..Config::default()
        });

        let written = timeout(Duration::from_secs(1), write_loop(&lock, 1, &dir, None))
            .await
            .expect("write loop kept retrying");
        assert_eq!(written.unwrap(), 0);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_write_loop_honours_iteration_limit() {
        let path = std::env::temp_dir().join(format!("selector-integer-{}", std::process::id()));
        let lock = OrientationLock::with_config(Config {
            initial_orientation: DeviceOrientation::new(0, 180, 0),
            ..Config::default()
        });

        let written = write_loop(&lock, 5, &path, Some(3)).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7");
        assert!(lock.snapshot().granted.is_empty());
        std::fs::remove_file(&path).unwrap();
    }
}
