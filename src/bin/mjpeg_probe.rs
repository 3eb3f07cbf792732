//! mjpeg_probe - Offline inspection of a captured MJPEG stream.
//!
//! Replays a file through the frame extractor and the decoder chain in
//! transport-sized chunks and reports what the live pipeline would see:
//! extracted frames, decode rejections, dimensions and (optionally) how many
//! times the detector would have fired.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use chroma_trigger::config::TriggerdConfig;
use chroma_trigger::decode::{decode_frame, default_backends, DecodeConfig};
use chroma_trigger::ingest::reader::DEFAULT_CHUNK_SIZE;
use chroma_trigger::{
    DetectionEngine, ExtractedFrame, ExtractorStats, FrameExtractor, FramerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect a captured MJPEG stream")]
struct Args {
    /// Captured MJPEG byte stream.
    path: PathBuf,

    /// Replay chunk size in bytes.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Run the configured detector over every decoded frame.
    #[arg(long)]
    detect: bool,

    /// Configuration file for detection settings (same format as triggerd).
    #[arg(long, env = "TRIGGER_CONFIG")]
    config: Option<PathBuf>,

    /// Skip the uniform-frame corruption heuristic.
    #[arg(long)]
    no_corruption_check: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct ProbeReport {
    bytes: u64,
    chunks: u64,
    frames_extracted: u64,
    undersized_dropped: u64,
    oversized_dropped: u64,
    buffer_clears: u64,
    resyncs: u64,
    decoded: u64,
    rejections: BTreeMap<String, u64>,
    dimensions: BTreeMap<String, u64>,
    mean_decode_ms: f64,
    triggers: Option<u64>,
}

impl ProbeReport {
    fn absorb_extractor(&mut self, stats: ExtractorStats) {
        self.frames_extracted = stats.frames_extracted;
        self.undersized_dropped = stats.undersized_dropped;
        self.oversized_dropped = stats.oversized_dropped;
        self.buffer_clears = stats.buffer_clears;
        self.resyncs = stats.resyncs;
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let data = std::fs::read(&args.path)
        .with_context(|| format!("failed to read {}", args.path.display()))?;

    let decode_cfg = DecodeConfig {
        corruption_check: !args.no_corruption_check,
        ..DecodeConfig::default()
    };
    let engine = if args.detect {
        let cfg = TriggerdConfig::load_from(args.config.as_deref())?;
        let mut engine = DetectionEngine::new(cfg.detector_config()?)?;
        engine.set_enabled(true);
        Some(engine)
    } else {
        None
    };

    let report = probe(&data, args.chunk_size, &decode_cfg, engine)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&args.path, &report);
    }
    Ok(())
}

/// Replay `data` in `chunk_size` pieces, then drain frames held back by the
/// per-push extraction cap.
fn probe(
    data: &[u8],
    chunk_size: usize,
    decode_cfg: &DecodeConfig,
    mut engine: Option<DetectionEngine>,
) -> Result<ProbeReport> {
    let backends = default_backends();
    let mut extractor = FrameExtractor::new(FramerConfig::default())?;
    let mut report = ProbeReport {
        bytes: data.len() as u64,
        triggers: engine.as_ref().map(|_| 0),
        ..ProbeReport::default()
    };
    let mut decode_time_ms = 0.0;

    let mut absorb = |frames: Vec<ExtractedFrame>, report: &mut ProbeReport| {
        for frame in frames {
            let started = Instant::now();
            let result = decode_frame(frame.bytes(), frame.captured_at, &backends, decode_cfg);
            decode_time_ms += started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(decoded) => {
                    report.decoded += 1;
                    *report
                        .dimensions
                        .entry(format!("{}x{}", decoded.width(), decoded.height()))
                        .or_default() += 1;
                    if let Some(engine) = engine.as_mut() {
                        if engine.sample(&decoded).triggered {
                            report.triggers = report.triggers.map(|n| n + 1);
                        }
                    }
                }
                Err(rejection) => {
                    *report.rejections.entry(rejection.to_string()).or_default() += 1;
                }
            }
        }
    };

    for chunk in data.chunks(chunk_size.max(1)) {
        report.chunks += 1;
        absorb(extractor.push(chunk, Instant::now()), &mut report);
    }
    loop {
        let frames = extractor.push(&[], Instant::now());
        if frames.is_empty() {
            break;
        }
        absorb(frames, &mut report);
    }

    report.absorb_extractor(extractor.stats());
    let attempted = report.decoded + report.rejections.values().sum::<u64>();
    if attempted > 0 {
        report.mean_decode_ms = decode_time_ms / attempted as f64;
    }
    Ok(report)
}

fn print_report(path: &std::path::Path, report: &ProbeReport) {
    println!("{}: {} bytes in {} chunks", path.display(), report.bytes, report.chunks);
    println!(
        "  extracted {} frames (undersized {}, oversized {}, buffer clears {}, resyncs {})",
        report.frames_extracted,
        report.undersized_dropped,
        report.oversized_dropped,
        report.buffer_clears,
        report.resyncs
    );
    println!(
        "  decoded {} frames, mean decode {:.2} ms",
        report.decoded, report.mean_decode_ms
    );
    for (dims, count) in &report.dimensions {
        println!("    {}: {}", dims, count);
    }
    for (reason, count) in &report.rejections {
        println!("  rejected ({}): {}", reason, count);
    }
    if let Some(triggers) = report.triggers {
        println!("  detector would fire {} time(s)", triggers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chroma_trigger::{DetectionMode, DetectorConfig, Rgb};
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;

    fn solid_jpeg(color: Rgb) -> Vec<u8> {
        let pixels = [color.r, color.g, color.b].repeat(16 * 16);
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 95)
            .encode(&pixels, 16, 16, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    fn lenient() -> DecodeConfig {
        DecodeConfig {
            corruption_check: false,
            ..DecodeConfig::default()
        }
    }

    #[test]
    fn frames_beyond_the_per_push_cap_are_reported() {
        let data: Vec<u8> = (0..12).flat_map(|_| solid_jpeg(Rgb::new(40, 40, 40))).collect();
        let report = probe(&data, data.len(), &lenient(), None).unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(report.frames_extracted, 12);
        assert_eq!(report.decoded, 12);
        assert_eq!(report.dimensions.get("16x16"), Some(&12));
        assert!(report.triggers.is_none());
    }

    #[test]
    fn detector_counts_presence_triggers() {
        let target = Rgb::new(206, 38, 54);
        let data: Vec<u8> = [target, Rgb::new(0, 0, 255), target]
            .into_iter()
            .flat_map(solid_jpeg)
            .collect();
        let mut engine = DetectionEngine::new(DetectorConfig {
            mode: DetectionMode::Presence { target },
            tolerance: 30,
            detection_size: 10,
        })
        .unwrap();
        engine.set_enabled(true);

        let report = probe(&data, 1316, &lenient(), Some(engine)).unwrap();
        assert_eq!(report.decoded, 3);
        assert_eq!(report.triggers, Some(2));
    }

    #[test]
    fn garbage_input_reports_nothing_decoded() {
        let report = probe(&[0x42; 4096], 1316, &lenient(), None).unwrap();
        assert_eq!(report.decoded, 0);
        assert!(report.rejections.is_empty());
        assert_eq!(report.mean_decode_ms, 0.0);
    }
}
