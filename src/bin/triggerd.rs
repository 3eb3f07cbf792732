//! triggerd - MJPEG color trigger daemon.
//!
//! Receives an MJPEG stream, keeps the freshest decoded frame and fires the
//! configured actuator when the sampled color matches. Reconnects to the
//! source after a disconnect until stopped with Ctrl-C.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chroma_trigger::config::{ActuatorKind, TriggerdConfig};
use chroma_trigger::{
    open_source, DetectionSession, FrameMailbox, PipelineEvent, SessionEvent, StreamPipeline,
    TriggerController,
};

const EVENT_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "MJPEG color trigger daemon")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "TRIGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Source location (udp://host:port, tcp://host:port, file path or '-').
    #[arg(long)]
    source: Option<String>,

    /// Log actions instead of driving the configured actuator.
    #[arg(long)]
    dry_run: bool,

    /// Perform one press/release ignoring the cooldown, then exit.
    #[arg(long)]
    test_click: bool,

    /// Exit after the first disconnect instead of reconnecting.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = TriggerdConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        cfg.source.url = source;
    }
    if args.dry_run {
        cfg.actuator.kind = ActuatorKind::Log;
    }
    cfg.validate()?;

    let actuator = cfg.actuator.build()?;
    let controller = Arc::new(TriggerController::new(cfg.timing)?);

    if args.test_click {
        controller.test_action(actuator.as_ref())?;
        log::info!("test action complete on {}", actuator.name());
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let mailbox = Arc::new(FrameMailbox::new());
    let mut session = DetectionSession::new(
        cfg.session.clone(),
        cfg.detector_config()?,
        controller.clone(),
        actuator.clone(),
        mailbox.clone(),
    )?;
    let mut pipeline = StreamPipeline::with_mailbox(cfg.pipeline.clone(), mailbox)?;
    session.start()?;

    log::info!(
        "triggerd started: source {}, mode {}, actuator {}",
        cfg.source.url,
        session.detector_config().mode.name(),
        actuator.name()
    );

    let session_events = session.events();
    let pipeline_events = pipeline.events();
    let mut last_health = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        match open_source(&cfg.source.url) {
            Ok(source) => {
                pipeline.start(source)?;
                loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match pipeline_events.recv_timeout(EVENT_POLL) {
                        Ok(PipelineEvent::Connected { source }) => {
                            log::info!("receiving from {}", source);
                        }
                        Ok(PipelineEvent::Disconnected { source, reason }) => {
                            session.handle_disconnect(&source, &reason);
                            break;
                        }
                        Ok(PipelineEvent::FrameAvailable { .. }) => {}
                        Err(_) => {}
                    }

                    for event in session_events.try_iter() {
                        log_session_event(&event);
                    }

                    if last_health.elapsed() >= cfg.health_interval {
                        last_health = Instant::now();
                        let snapshot = pipeline.snapshot();
                        let stats = controller.stats();
                        log::info!(
                            "health: recv {:.1} fps, decoded {:.1} fps, processed {:.1} fps, buffer {} B, queue {}, latency {:.1} ms, actions {} ok / {} failed",
                            snapshot.received_fps,
                            snapshot.decoded_fps,
                            snapshot.processed_fps,
                            snapshot.buffer_bytes,
                            snapshot.queue_depth,
                            snapshot.receive_to_decode_ms,
                            stats.total,
                            stats.failed
                        );
                        log::debug!("health detail: {}", serde_json::to_string(&snapshot)?);
                    }
                }
                pipeline.stop()?;
            }
            Err(err) => {
                log::warn!("source {} unavailable: {:#}", cfg.source.url, err);
            }
        }

        if args.once || stop.load(Ordering::SeqCst) {
            break;
        }
        log::info!(
            "reconnecting to {} in {}ms",
            cfg.source.url,
            cfg.source.reconnect_delay.as_millis()
        );
        sleep_unless_stopped(&stop, cfg.source.reconnect_delay);
    }

    log::info!("shutting down...");
    pipeline.stop()?;
    session.stop()?;
    let stats = controller.stats();
    log::info!(
        "actions: {} ok, {} failed ({:.1}% success)",
        stats.total,
        stats.failed,
        stats.success_rate
    );
    Ok(())
}

fn log_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Triggered {
            version,
            classification,
            ..
        } => log::debug!("frame {} triggered ({:?})", version, classification),
        SessionEvent::ActionFailed { version, attempt } => {
            log::warn!("action for frame {} failed: {:?}", version, attempt)
        }
        SessionEvent::Disconnected { source, reason } => {
            log::warn!("{} disconnected: {}", source, reason)
        }
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}
