use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::decode::DecodeConfig;
use crate::detect::{
    DetectionMode, DetectorConfig, DEFAULT_DETECTION_SIZE, DEFAULT_FROM_COLOR,
    DEFAULT_TARGET_COLOR, DEFAULT_TOLERANCE, DEFAULT_TO_COLOR,
};
use crate::frame::Rgb;
use crate::ingest::mjpeg::FramerConfig;
use crate::pipeline::{PipelineConfig, DEFAULT_EVENT_CAPACITY};
use crate::session::SessionConfig;
use crate::trigger::{
    Actuator, DelayRange, LineActuator, LogActuator, TriggerTiming, DEFAULT_PRESS_COMMAND,
    DEFAULT_RELEASE_COMMAND,
};

const DEFAULT_SOURCE_URL: &str = "udp://127.0.0.1:1234";
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct TriggerdConfigFile {
    source: Option<SourceConfigFile>,
    framer: Option<FramerConfigFile>,
    decode: Option<DecodeConfigFile>,
    detection: Option<DetectionConfigFile>,
    timing: Option<TimingConfigFile>,
    actuator: Option<ActuatorConfigFile>,
    session: Option<SessionConfigFile>,
    health_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FramerConfigFile {
    max_buffer_size: Option<usize>,
    min_valid_frame_size: Option<usize>,
    max_valid_frame_size: Option<usize>,
    max_frames_per_chunk: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DecodeConfigFile {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    min_dimension: Option<u32>,
    max_dimension: Option<u32>,
    corruption_check: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    mode: Option<String>,
    from: Option<[u8; 3]>,
    to: Option<[u8; 3]>,
    target: Option<[u8; 3]>,
    tolerance: Option<u32>,
    detection_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TimingConfigFile {
    press: Option<DelayRange>,
    release: Option<DelayRange>,
    cooldown: Option<DelayRange>,
}

#[derive(Debug, Deserialize, Default)]
struct ActuatorConfigFile {
    device: Option<String>,
    press_command: Option<String>,
    release_command: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    detached_actions: Option<bool>,
}

/// Which reference colors drive detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Transition,
    Presence,
}

impl ModeKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transition" | "1" => Ok(ModeKind::Transition),
            "presence" | "2" => Ok(ModeKind::Presence),
            other => Err(anyhow!(
                "unknown detection mode '{}'; expected transition or presence",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionSettings {
    pub mode: ModeKind,
    pub from: Rgb,
    pub to: Rgb,
    pub target: Rgb,
    /// Kept wide so out-of-range input is reported instead of wrapped.
    pub tolerance: u32,
    pub detection_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorKind {
    /// Dry run: actions are only logged.
    Log,
    /// Command lines written to a device node.
    Device(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorSettings {
    pub kind: ActuatorKind,
    pub press_command: String,
    pub release_command: String,
}

impl ActuatorSettings {
    pub fn build(&self) -> Result<Arc<dyn Actuator>> {
        match &self.kind {
            ActuatorKind::Log => Ok(Arc::new(LogActuator::new())),
            ActuatorKind::Device(path) => Ok(Arc::new(
                LineActuator::open(path)?
                    .with_commands(self.press_command.as_bytes(), self.release_command.as_bytes()),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct TriggerdConfig {
    pub source: SourceSettings,
    pub pipeline: PipelineConfig,
    pub detection: DetectionSettings,
    pub timing: TriggerTiming,
    pub actuator: ActuatorSettings,
    pub session: SessionConfig,
    pub health_interval: Duration,
}

impl TriggerdConfig {
    /// Defaults, then the file named by `TRIGGER_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRIGGER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TriggerdConfigFile) -> Result<Self> {
        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: source_file
                .url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            reconnect_delay: Duration::from_millis(
                source_file
                    .reconnect_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
        };

        let framer_file = file.framer.unwrap_or_default();
        let framer_defaults = FramerConfig::default();
        let framer = FramerConfig {
            max_buffer_size: framer_file
                .max_buffer_size
                .unwrap_or(framer_defaults.max_buffer_size),
            min_valid_frame_size: framer_file
                .min_valid_frame_size
                .unwrap_or(framer_defaults.min_valid_frame_size),
            max_valid_frame_size: framer_file
                .max_valid_frame_size
                .unwrap_or(framer_defaults.max_valid_frame_size),
            max_frames_per_chunk: framer_file
                .max_frames_per_chunk
                .unwrap_or(framer_defaults.max_frames_per_chunk),
        };

        let decode_file = file.decode.unwrap_or_default();
        let decode_defaults = DecodeConfig::default();
        let decode = DecodeConfig {
            workers: decode_file.workers.unwrap_or(decode_defaults.workers),
            queue_capacity: decode_file
                .queue_capacity
                .unwrap_or(decode_defaults.queue_capacity),
            min_dimension: decode_file
                .min_dimension
                .unwrap_or(decode_defaults.min_dimension),
            max_dimension: decode_file
                .max_dimension
                .unwrap_or(decode_defaults.max_dimension),
            corruption_check: decode_file
                .corruption_check
                .unwrap_or(decode_defaults.corruption_check),
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            mode: match detection_file.mode.as_deref() {
                Some(mode) => ModeKind::parse(mode)?,
                None => ModeKind::Transition,
            },
            from: detection_file
                .from
                .map(Rgb::from)
                .unwrap_or(DEFAULT_FROM_COLOR),
            to: detection_file.to.map(Rgb::from).unwrap_or(DEFAULT_TO_COLOR),
            target: detection_file
                .target
                .map(Rgb::from)
                .unwrap_or(DEFAULT_TARGET_COLOR),
            tolerance: detection_file
                .tolerance
                .unwrap_or(u32::from(DEFAULT_TOLERANCE)),
            detection_size: detection_file
                .detection_size
                .unwrap_or(DEFAULT_DETECTION_SIZE),
        };

        let timing_file = file.timing.unwrap_or_default();
        let timing_defaults = TriggerTiming::default();
        let timing = TriggerTiming {
            press: timing_file.press.unwrap_or(timing_defaults.press),
            release: timing_file.release.unwrap_or(timing_defaults.release),
            cooldown: timing_file.cooldown.unwrap_or(timing_defaults.cooldown),
        };

        let actuator_file = file.actuator.unwrap_or_default();
        let actuator = ActuatorSettings {
            kind: parse_actuator(actuator_file.device.as_deref().unwrap_or("log")),
            press_command: actuator_file
                .press_command
                .unwrap_or_else(|| String::from_utf8_lossy(DEFAULT_PRESS_COMMAND).into_owned()),
            release_command: actuator_file
                .release_command
                .unwrap_or_else(|| String::from_utf8_lossy(DEFAULT_RELEASE_COMMAND).into_owned()),
        };

        let session_file = file.session.unwrap_or_default();
        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            workers: session_file.workers.unwrap_or(session_defaults.workers),
            poll_interval: Duration::from_millis(
                session_file
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            detached_actions: session_file
                .detached_actions
                .unwrap_or(session_defaults.detached_actions),
            event_capacity: session_defaults.event_capacity,
        };

        Ok(Self {
            source,
            pipeline: PipelineConfig {
                framer,
                decode,
                event_capacity: DEFAULT_EVENT_CAPACITY,
            },
            detection,
            timing,
            actuator,
            session,
            health_interval: Duration::from_secs(
                file.health_interval_secs
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("TRIGGER_SOURCE") {
            if !url.trim().is_empty() {
                self.source.url = url.trim().to_string();
            }
        }
        if let Ok(mode) = std::env::var("TRIGGER_MODE") {
            if !mode.trim().is_empty() {
                self.detection.mode = ModeKind::parse(&mode)?;
            }
        }
        if let Ok(tolerance) = std::env::var("TRIGGER_TOLERANCE") {
            self.detection.tolerance = tolerance
                .trim()
                .parse()
                .map_err(|_| anyhow!("TRIGGER_TOLERANCE must be an integer between 0 and 255"))?;
        }
        if let Ok(workers) = std::env::var("TRIGGER_DECODE_WORKERS") {
            self.pipeline.decode.workers = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("TRIGGER_DECODE_WORKERS must be an integer"))?;
        }
        if let Ok(actuator) = std::env::var("TRIGGER_ACTUATOR") {
            if !actuator.trim().is_empty() {
                self.actuator.kind = parse_actuator(actuator.trim());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_source_url(&self.source.url)?;
        self.pipeline.validate()?;
        self.detector_config()?.validate()?;
        self.timing.validate()?;
        self.session.validate()?;
        if self.actuator.press_command.is_empty() || self.actuator.release_command.is_empty() {
            return Err(anyhow!("actuator commands must not be empty"));
        }
        if self.health_interval.is_zero() {
            return Err(anyhow!("health_interval_secs must be greater than zero"));
        }
        Ok(())
    }

    /// Detector configuration for the selected mode.
    pub fn detector_config(&self) -> Result<DetectorConfig> {
        let d = &self.detection;
        let tolerance = u8::try_from(d.tolerance)
            .map_err(|_| anyhow!("tolerance must be between 0 and 255 (got {})", d.tolerance))?;
        let mode = match d.mode {
            ModeKind::Transition => DetectionMode::Transition {
                from: d.from,
                to: d.to,
            },
            ModeKind::Presence => DetectionMode::Presence { target: d.target },
        };
        Ok(DetectorConfig {
            mode,
            tolerance,
            detection_size: d.detection_size,
        })
    }
}

fn parse_actuator(value: &str) -> ActuatorKind {
    if value.eq_ignore_ascii_case("log") || value.eq_ignore_ascii_case("none") {
        ActuatorKind::Log
    } else {
        ActuatorKind::Device(PathBuf::from(value))
    }
}

fn validate_source_url(location: &str) -> Result<()> {
    if location.trim().is_empty() {
        return Err(anyhow!("source url must not be empty"));
    }
    if location == "-" || !location.contains("://") {
        return Ok(());
    }
    let url = Url::parse(location).map_err(|e| anyhow!("invalid source url {}: {}", location, e))?;
    match url.scheme() {
        "udp" | "tcp" => {
            if url.host_str().is_none() || url.port().is_none() {
                return Err(anyhow!("source url {} needs host and port", location));
            }
            Ok(())
        }
        "file" => Ok(()),
        other => Err(anyhow!("unsupported source scheme '{}'", other)),
    }
}

fn read_config_file(path: &Path) -> Result<TriggerdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_setup() {
        let cfg = TriggerdConfig::from_file(TriggerdConfigFile::default()).unwrap();
        assert_eq!(cfg.source.url, "udp://127.0.0.1:1234");
        assert_eq!(cfg.detection.from, Rgb::new(206, 38, 54));
        assert_eq!(cfg.detection.to, Rgb::new(75, 219, 106));
        assert_eq!(cfg.detection.tolerance, 30);
        assert_eq!(cfg.timing, TriggerTiming::default());
        assert_eq!(cfg.actuator.kind, ActuatorKind::Log);
        assert_eq!(cfg.actuator.press_command, "km.left(1)\r");
        cfg.validate().unwrap();
    }

    #[test]
    fn mode_names_and_numbers_parse() {
        assert_eq!(ModeKind::parse("Presence").unwrap(), ModeKind::Presence);
        assert_eq!(ModeKind::parse("1").unwrap(), ModeKind::Transition);
        assert!(ModeKind::parse("edge").is_err());
    }

    #[test]
    fn tolerance_above_255_is_rejected() {
        let mut cfg = TriggerdConfig::from_file(TriggerdConfigFile::default()).unwrap();
        cfg.detection.tolerance = 256;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn source_urls_are_checked() {
        assert!(validate_source_url("udp://0.0.0.0:1234").is_ok());
        assert!(validate_source_url("capture.mjpeg").is_ok());
        assert!(validate_source_url("udp://0.0.0.0").is_err());
        assert!(validate_source_url("srt://host:9000").is_err());
    }
}
