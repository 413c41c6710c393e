mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use player::config::PlayerConfig;
use player::errors::PlayerError;
use player::events::{PlaybackState, PlayerEvent};
use player::platforms::{self, select_platform};
use player::sink::MemorySink;
use player::traits::RenderingSink;
use player::{BindOptions, Player, Session};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use tokio::sync::broadcast::error::RecvError;

use cli::{Cli, Commands};

/// Resolution of the simulated playback clock
const CLOCK_TICK: Duration = Duration::from_millis(100);

fn init_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new()
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .add_filter_ignore_str("rustls")
        .build();
    let _ = TermLogger::init(level, config, TerminalMode::Mixed, ColorChoice::Auto);
}

fn load_config(cli: &Cli) -> Result<PlayerConfig, PlayerError> {
    let mut config = match &cli.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    if cli.debug {
        config.debug = true;
    }
    Ok(config)
}

async fn resolve(url: &str) -> Result<(), PlayerError> {
    let resolved = platforms::resolve(url).await?;
    println!("platform: {}", resolved.platform.as_str());
    match resolved.duration {
        Some(duration) => println!("duration: {:.3}s", duration),
        None => println!("duration: unknown"),
    }
    for (i, url) in resolved.urls.iter().enumerate() {
        println!("[{}] {}", i, url);
    }
    Ok(())
}

async fn probe(url: &str, config: PlayerConfig) -> Result<(), PlayerError> {
    let resolved = platforms::resolve(url).await?;
    let player = Player::with_http(config, resolved.headers.clone())?;
    let mut streams = player.streams(resolved.source());
    let index = streams.probe().await?;

    for (i, source) in index.sources.iter().enumerate() {
        println!(
            "source {}: {:.3}s from {:.3}s, {} bytes, tags at {}",
            i,
            source.duration,
            source.base_time,
            source
                .byte_len
                .map_or_else(|| "?".to_string(), |len| len.to_string()),
            source.first_tag_offset
        );
        if let Some(metadata) = &source.init.metadata {
            println!(
                "  {}x{} @ {} fps",
                metadata.width.unwrap_or_default(),
                metadata.height.unwrap_or_default(),
                metadata.framerate.unwrap_or_default()
            );
        }
    }
    println!(
        "{} entries, {:.3}s total",
        index.entries.len(),
        index.total_duration()
    );
    for entry in &index.entries {
        println!(
            "  #{:<5} source {} @ byte {:<10} {:>10.3}s +{:.3}s",
            entry.index, entry.source, entry.byte_offset, entry.timestamp, entry.duration
        );
    }
    Ok(())
}

fn print_event(event: &PlayerEvent) {
    match event {
        PlayerEvent::Progress { session, percent } => {
            log::info!("[{}]Loading {}%", session, percent)
        }
        PlayerEvent::StateChanged { session, from, to } => {
            log::info!("[{}]{} -> {}", session, from.as_str(), to.as_str())
        }
        PlayerEvent::Discontinuity {
            session,
            kind,
            expected,
            actual,
        } => log::warn!(
            "[{}]{} jumps from {:.3}s to {:.3}s",
            session,
            kind,
            expected,
            actual
        ),
        PlayerEvent::Started { session } => log::info!("[{}]Started", session),
        PlayerEvent::Error { session, error } => log::error!("[{}]{}", session, error),
    }
}

/// Advance the sink position like a video element would, pausing whenever
/// the buffer runs out.
async fn drive_clock(session: &Session, sink: &MemorySink, play_for: f64, speed: f64) {
    let deadline = Instant::now() + Duration::from_secs_f64(play_for.max(0.0));
    let mut clock = tokio::time::interval(CLOCK_TICK);
    while Instant::now() < deadline {
        clock.tick().await;
        let status = session.status();
        let position = sink.position();
        let buffered_end = status
            .buffered
            .iter()
            .find(|r| r.start <= position + 0.1 && position < r.end)
            .map(|r| r.end);
        match status.state {
            PlaybackState::Error => return,
            PlaybackState::Playing | PlaybackState::Ended => match buffered_end {
                Some(end) => {
                    let next = position + CLOCK_TICK.as_secs_f64() * speed;
                    sink.set_position(next.min(end));
                }
                None if status.state == PlaybackState::Ended => {
                    log::info!("Reached the end at {:.3}s", position);
                    return;
                }
                None => {}
            },
            _ => {}
        }
    }
}

async fn play(
    url: &str,
    config: PlayerConfig,
    seek: Option<f64>,
    play_for: f64,
    speed: f64,
) -> Result<(), PlayerError> {
    let resolved = platforms::resolve(url).await?;
    let player = Player::with_http(config, resolved.headers.clone())?;
    let mut events = player.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let sink = Arc::new(MemorySink::new());
    let session = player.bind_video(BindOptions {
        sink: sink.clone(),
        source: resolved.source(),
    })?;
    session.wait_started().await?;

    if let Some(time) = seek {
        sink.set_position(time);
        session.seek(time).await?;
    }
    drive_clock(&session, &sink, play_for, speed).await;

    let status = session.status();
    log::info!(
        "[{}]Stopped at {:.3}s in state {}",
        session.id(),
        sink.position(),
        status.state.as_str()
    );
    let result = session.stop().await;
    printer.abort();
    result
}

async fn run(cli: Cli) -> Result<(), PlayerError> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Resolve { url } => resolve(&url).await,
        Commands::Probe { url } => probe(&url, config).await,
        Commands::Play {
            url,
            seek,
            play_for,
            speed,
        } => {
            if let Some(platform) = select_platform(&url) {
                log::info!("Playing {} from {}", url, platform.as_str());
            }
            play(&url, config, seek, play_for, speed).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
