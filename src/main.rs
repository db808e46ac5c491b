use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use onair::broadcast::{HttpStatusProbe, StatusProbe};
use onair::config::AppConfig;
use onair::control::{self, Command};
use onair::engine::AudioEngine;
use onair::fanout::BroadcastFanout;
use onair::jingle::{JingleInjector, JingleLibrary};
use onair::logging::{self, LogContext};
use onair::notifier::HttpNotifier;
use onair::orchestrator::{Orchestrator, OrchestratorOptions};
use onair::playlist::{FilePlaylistLoader, PlaylistLoader};
use onair::schedule::ScheduleConfig;
use onair::scheduler::TrackScheduler;
use onair::spacing::ArtistSpacing;
use onair::stream_engine::StreamEngine;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "onair", version, about = "Continuous internet radio broadcaster")]
struct Cli {
    /// Config file (default: <config dir>/onair/onair.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Verbose logging
    #[arg(short, long)]
    debug: bool,
    /// Run without the interactive console; stop with Ctrl-C or SIGTERM
    #[arg(long)]
    no_console: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug);
    let log = LogContext::new(cli.debug);

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path)?;
    config.validate().context("refusing to start")?;
    log.info(format!(
        "onair v{} using {}",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    ));

    let scheduler = build_scheduler(&config, &log)?;
    let injector = build_injector(&config, &log);

    let engine: Arc<dyn AudioEngine> = Arc::new(
        StreamEngine::start(config.monitor, config.fallback_bitrate, &log)
            .context("cannot start the audio engine")?,
    );
    let probe: Arc<dyn StatusProbe> = Arc::new(HttpStatusProbe::new());
    let fanout = Arc::new(BroadcastFanout::from_destinations(
        &config.destinations,
        engine.clone(),
        probe,
        &config.connection_options(),
        &log,
    ));

    let options = OrchestratorOptions {
        now_playing_xml: config.now_playing_xml.clone(),
        ..OrchestratorOptions::default()
    };
    let mut orchestrator =
        Orchestrator::new(engine, fanout.clone(), scheduler, injector, &log).with_options(options);
    if let Some(notifier) = config.notifier.clone().filter(|n| n.is_usable()) {
        orchestrator = orchestrator.with_notifier(Box::new(HttpNotifier::new(notifier, &log)));
    }
    if config.artist_spacing {
        orchestrator = orchestrator.with_spacing(ArtistSpacing::new(&log));
    }

    fanout.initialize();
    log.info(format!(
        "{}/{} streams connected",
        fanout.connected_count(),
        fanout.len()
    ));
    orchestrator.start()?;

    let (shutdown_tx, shutdown_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("cannot install the shutdown handler")?;

    let result = if cli.no_console {
        log.info("Console disabled; stop with Ctrl-C");
        let _ = shutdown_rx.recv();
        log.info("Shutdown requested");
        Ok(())
    } else {
        run_console(&orchestrator, &shutdown_rx)
    };
    orchestrator.stop();
    result
}

fn build_scheduler(config: &AppConfig, log: &LogContext) -> Result<TrackScheduler> {
    let loader = FilePlaylistLoader::new(config.history_dir.clone(), log)
        .with_dynamic_reload(config.dynamic_playlists);
    if let Some(schedule_file) = &config.schedule_file {
        let schedule = ScheduleConfig::load(schedule_file, log);
        let scheduler = TrackScheduler::new(schedule, Box::new(loader), log);
        let now = chrono::Local::now().naive_local();
        for window in scheduler.upcoming(now, 3) {
            log.info(format!(
                "Upcoming: {} at {}",
                window.name,
                window.starts_at.format("%a %H:%M")
            ));
        }
        return Ok(scheduler);
    }

    // validate() guarantees one of the two is set.
    let path = config
        .fallback_playlist
        .clone()
        .context("no fallback playlist configured")?;
    let source = loader
        .load(&path)
        .with_context(|| format!("cannot load fallback playlist {}", path.display()))?;
    Ok(TrackScheduler::fixed(source, path, log))
}

fn build_injector(config: &AppConfig, log: &LogContext) -> JingleInjector {
    match &config.jingles_file {
        Some(path) if config.jingle_frequency > 0 => JingleInjector::new(
            JingleLibrary::load(path, log),
            config.jingle_frequency,
            config.jingle_selection,
            log,
        ),
        _ => JingleInjector::disabled(log),
    }
}

/// Read console lines on a helper thread so a shutdown signal can end the
/// console while stdin is blocked.
fn spawn_stdin_reader() -> Receiver<io::Result<String>> {
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// The next console line, or `None` once stdin closes or shutdown is
/// requested.
fn next_line(
    lines: &Receiver<io::Result<String>>,
    shutdown: &Receiver<()>,
) -> Option<io::Result<String>> {
    select! {
        recv(shutdown) -> _ => None,
        recv(lines) -> line => line.ok(),
    }
}

fn run_console(orchestrator: &Orchestrator, shutdown: &Receiver<()>) -> Result<()> {
    println!("{}", control::HELP);
    let lines = spawn_stdin_reader();
    while let Some(line) = next_line(&lines, shutdown) {
        let line = line.context("reading console input")?;
        match Command::parse(&line) {
            Some(Command::Quit) => break,
            Some(Command::Status) => print!("{}", orchestrator.now_playing().status_text()),
            Some(Command::Next) => orchestrator.skip(),
            Some(Command::TogglePause) => {
                if orchestrator.toggle_pause() {
                    println!("Paused");
                } else {
                    println!("Resumed");
                }
            }
            Some(Command::StreamInfo) => print_stream_info(orchestrator.fanout()),
            Some(Command::Help) => println!("{}", control::HELP),
            None if line.trim().is_empty() => {}
            None => println!("Unknown command '{}'. Type h for help.", line.trim()),
        }
    }
    Ok(())
}

fn print_stream_info(fanout: &BroadcastFanout) {
    println!(
        "Streams: {}/{} connected, {} listeners",
        fanout.connected_count(),
        fanout.len(),
        fanout.total_listeners()
    );
    for status in fanout.statuses() {
        print!(
            "  {} [{}] listeners {} (peak {})",
            status.url, status.state, status.listeners, status.peak_listeners
        );
        if status.reconnect_attempts > 0 {
            print!(
                ", reconnect attempt {} for {:.0}s",
                status.reconnect_attempts,
                status.reconnect_time.as_secs_f64()
            );
        }
        println!();
    }
}
