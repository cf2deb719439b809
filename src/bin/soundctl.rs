//! Sound engine command-line tool
//!
//! Plays, records and streams audio, or serves the JSON control API over
//! stdin/stdout (one command per line).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sound_engine::{
    audio::{list_devices, MemoryBackend, PlaybackStatus},
    events::{self, EventSink, SinkClosed},
    ApiResponse, Command, Engine, EngineConfig, Reply, StreamEvent,
};

#[derive(Parser, Debug)]
#[command(name = "soundctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the per-user config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use in-memory devices instead of the sound hardware
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List audio devices
    Devices,
    /// Show platform and default device properties
    Info,
    /// Play a file or URL
    Play {
        locator: String,
        #[arg(long)]
        volume: Option<f32>,
        #[arg(long = "loop")]
        looping: bool,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Record the microphone to raw 16-bit PCM
    Record {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Play a file or URL while saving the streamed PCM
    Stream {
        locator: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Serve the JSON control API on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = EngineConfig::load_or_default(args.config.as_deref())
        .context("failed to load configuration")?;

    let engine = match args.command {
        Cmd::Devices => {
            print_devices();
            return Ok(());
        }
        _ => Arc::new(if args.memory {
            Engine::new(config, Arc::new(MemoryBackend::new()))?
        } else {
            Engine::with_default_backend(config)?
        }),
    };

    match args.command {
        Cmd::Devices => {}
        Cmd::Info => {
            println!("Platform: {}", engine.platform_version());
            println!("{}", serde_json::to_string_pretty(&engine.audio_properties())?);
        }
        Cmd::Play {
            locator,
            volume,
            looping,
            seconds,
        } => play(&engine, &locator, volume, looping, seconds).await?,
        Cmd::Record { seconds, out } => record(&engine, seconds, &out).await?,
        Cmd::Stream { locator, out } => stream(&engine, &locator, &out).await?,
        Cmd::Serve => serve(engine.clone()).await?,
    }

    engine.shutdown();
    Ok(())
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

async fn play(
    engine: &Engine,
    locator: &str,
    volume: Option<f32>,
    looping: bool,
    seconds: Option<u64>,
) -> Result<()> {
    engine.play(locator, volume, looping)?;
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                let state = engine.playback_state();
                match state.status {
                    PlaybackStatus::Stopped => break,
                    PlaybackStatus::Error => {
                        let message = state
                            .error_info
                            .map(|info| format!("{}: {}", info.kind, info.message))
                            .unwrap_or_default();
                        anyhow::bail!("playback failed: {}", message);
                    }
                    _ => {}
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
                eprint!("\r{} / {} ms   ", state.position_millis, state.duration_millis);
            }
        }
    }

    eprintln!();
    engine.stop();
    Ok(())
}

/// Write every data event to `out` until a terminal event or disconnect
fn spawn_pcm_writer(
    rx: crossbeam_channel::Receiver<StreamEvent>,
    out: &Path,
) -> Result<tokio::task::JoinHandle<Result<u64>>> {
    let mut writer = BufWriter::new(
        File::create(out).with_context(|| format!("cannot create {}", out.display()))?,
    );
    Ok(tokio::task::spawn_blocking(move || {
        let mut written = 0u64;
        for event in rx.iter() {
            match event {
                StreamEvent::Data(bytes) => {
                    writer.write_all(&bytes)?;
                    written += bytes.len() as u64;
                }
                StreamEvent::Error { kind, message } => {
                    tracing::error!("Stream error {}: {}", kind, message);
                    break;
                }
                StreamEvent::End => break,
            }
        }
        writer.flush()?;
        Ok(written)
    }))
}

async fn record(engine: &Engine, seconds: u64, out: &Path) -> Result<()> {
    let (sink, rx) = events::channel();
    engine.attach_recording_sink(sink);
    let writer = spawn_pcm_writer(rx, out)?;

    engine.start_recording()?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
    }
    engine.detach_recording_sink();

    let written = writer.await??;
    println!(
        "Recorded {} bytes ({} Hz mono s16le) to {}",
        written,
        engine.config().capture.sample_rate,
        out.display()
    );
    Ok(())
}

async fn stream(engine: &Engine, locator: &str, out: &Path) -> Result<()> {
    let (sink, rx) = events::channel();
    engine.attach_stream_sink(sink);
    let writer = spawn_pcm_writer(rx, out)?;

    let completion = engine.start_playback_stream(locator)?;
    let waiter = tokio::task::spawn_blocking(move || completion.wait());
    tokio::pin!(waiter);

    let result = tokio::select! {
        result = &mut waiter => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            engine.stop_playback_stream();
            waiter.await?
        }
    };
    // Joins the dispatcher, so every chunk reaches the writer before the sink goes
    engine.stop_playback_stream();
    engine.detach_stream_sink();
    let summary = result?;

    let written = writer.await??;
    println!(
        "Streamed {} chunks ({:?}), {} bytes written to {}",
        summary.chunks,
        summary.end,
        written,
        out.display()
    );
    Ok(())
}

/// Prints stream events as JSON lines
struct PrintSink {
    stream: &'static str,
}

impl EventSink for PrintSink {
    fn send(&self, event: StreamEvent) -> std::result::Result<(), SinkClosed> {
        let line = match event {
            StreamEvent::Data(bytes) => {
                json!({"event": self.stream, "type": "data", "bytes": bytes.len()})
            }
            StreamEvent::Error { kind, message } => json!({
                "event": self.stream,
                "type": "error",
                "code": kind.code(),
                "message": message,
            }),
            StreamEvent::End => json!({"event": self.stream, "type": "end"}),
        };
        println!("{}", line);
        Ok(())
    }
}

fn print_response(method: &str, response: &ApiResponse) {
    println!("{}", json!({"method": method, "response": response}));
}

async fn serve(engine: Arc<Engine>) -> Result<()> {
    engine.attach_recording_sink(Arc::new(PrintSink { stream: "recording" }));
    engine.attach_stream_sink(Arc::new(PrintSink { stream: "playbackStream" }));
    tracing::info!("Serving control API on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let command = match Command::from_json(&line) {
            Ok(command) => command,
            Err(e) => {
                print_response("unknown", &ApiResponse::from_error(&e));
                continue;
            }
        };
        let method = command.name();

        let engine = engine.clone();
        let reply = tokio::task::spawn_blocking(move || engine.handle(command)).await?;
        match reply {
            Reply::Immediate(response) => print_response(method, &response),
            Reply::Deferred(deferred) => {
                tokio::task::spawn_blocking(move || print_response(method, &deferred.wait()));
            }
        }
    }

    tracing::info!("Control input closed");
    Ok(())
}
