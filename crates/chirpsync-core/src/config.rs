//! # Experiment Configuration
//!
//! YAML configuration for a sensing/attack experiment:
//!
//! - Radio settings (sample rate, samples per buffer, TX/RX timing offset)
//! - Sensing settings (detection thresholds, recording length, frame count)
//! - Attack settings (enable flag, start frame, schedule size, waveform)
//! - Real-time thread settings and logging
//!
//! Every radio, sensing and attack parameter without a documented default is
//! required. Parsing collects *all* missing keys and fails with a single
//! [`ConfigError::MissingFields`]; nothing downstream is ever built from a
//! partially specified file.
//!
//! ## Configuration Search Path
//!
//! 1. Path in the `CHIRPSYNC_CONFIG` environment variable
//! 2. `./chirpsync.yaml`
//! 3. `~/.config/chirpsync/config.yaml` (platform config dir)
//! 4. `/etc/chirpsync/config.yaml`
//!
//! ## Example Configuration
//!
//! ```yaml
//! radio:
//!   sample_rate: 25.0e6
//!   rx_samples_per_buffer: 2000
//!   tx_samples_per_buffer: 2000
//!   tx_rx_offset_us: 0.0
//!
//! sensing:
//!   noise_calibration_ms: 1.0
//!   energy_detection_threshold_db: 10.0
//!   spectrogram_peak_threshold_db: 8.0
//!   min_points_per_chirp: 4
//!   min_recording_time_ms: 0.3
//!   max_frames_to_capture: 20
//!   min_frame_periodicity_ms: 9.0
//!   max_waiting_time_ms: 50.0
//!
//! attack:
//!   enabled: true
//!   start_frame: 3
//!   estimated_frame_periodicity_ms: 10.0
//!   num_attack_frames: 15
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::IqFormat;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "CHIRPSYNC_CONFIG";

/// Error type for configuration operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),

    #[error("failed to read config: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("failed to write config: {0}")]
    Write(String),

    #[error("missing required config fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Sensing/attacking radio parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioConfig {
    /// Sample rate in Hz (shared by both radios)
    pub sample_rate: f64,
    /// Samples per receive call row
    pub rx_samples_per_buffer: usize,
    /// Samples per transmit buffer row
    pub tx_samples_per_buffer: usize,
    /// Offset between the TX and RX stream start, subtracted from predicted
    /// frame times before they are scheduled (µs)
    pub tx_rx_offset_us: f64,
}

/// Parameters of the sensing subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensingConfig {
    /// Length of the quiet capture used to measure the noise floor (ms)
    pub noise_calibration_ms: f64,
    /// Row power above the noise floor that declares a chirp (dB)
    pub energy_detection_threshold_db: f64,
    /// Spectrogram peaks weaker than `max − threshold` are ignored (dB)
    pub spectrogram_peak_threshold_db: f64,
    /// Shortest rising run of peaks accepted as a chirp
    pub min_points_per_chirp: usize,
    /// Minimum capture length handed to the spectrogram (ms)
    pub min_recording_time_ms: f64,
    /// Number of sensing cycles to run
    pub max_frames_to_capture: usize,
    /// Listening for the next frame starts this long after the last frame start (ms)
    pub min_frame_periodicity_ms: f64,
    /// Give up on a cycle when no chirp is seen for this long (ms)
    pub max_waiting_time_ms: f64,
    /// Rows kept ahead of the row that crossed the energy threshold
    pub pre_trigger_rows: usize,
    /// Distance to the victim radar, used to remove propagation delay (m)
    pub victim_distance_m: f64,
    /// Dump intermediate buffers and log a summary after each run
    pub debug: bool,
    /// Directory for debug dumps and per-run parameter estimates
    pub output_dir: Option<PathBuf>,
    /// Compute spectrogram rows on the rayon pool (requires the `parallel` feature)
    pub parallel_fft: bool,
}

/// Linear chirp synthesized for the attack when no waveform file is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChirpTemplate {
    /// Frequency at the start of each chirp (MHz, baseband)
    pub start_frequency_mhz: f64,
    /// Sweep rate (MHz/µs)
    pub slope_mhz_per_us: f64,
    /// Active sweep time (µs)
    pub duration_us: f64,
    /// Silence after each chirp (µs)
    pub idle_us: f64,
    /// Chirps per attack frame
    pub num_chirps: usize,
    /// Peak amplitude
    pub amplitude: f64,
}

impl Default for ChirpTemplate {
    fn default() -> Self {
        Self {
            start_frequency_mhz: 1.0,
            slope_mhz_per_us: 0.5,
            duration_us: 36.0,
            idle_us: 4.0,
            num_chirps: 8,
            amplitude: 1.0,
        }
    }
}

/// Parameters of the attacking subsystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttackConfig {
    pub enabled: bool,
    /// Predictions are published once the sensing cycle index exceeds this
    pub start_frame: usize,
    /// Nominal victim frame period, used for the open-loop schedule (ms)
    pub estimated_frame_periodicity_ms: f64,
    /// Capacity of the predictive schedule
    pub num_attack_frames: usize,
    /// Pre-computed attack waveform
    pub signal_file: Option<PathBuf>,
    pub signal_format: IqFormat,
    /// Waveform synthesized when `signal_file` is absent
    pub chirp: ChirpTemplate,
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable format
    #[default]
    Compact,
    /// Full format with all fields
    Full,
    /// JSON structured logging
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Real-time configuration for the sensing and attacking threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable SCHED_FIFO priorities
    pub enable: bool,
    /// Sensing thread priority (1-99 on Linux)
    pub sensing_priority: i32,
    /// Attacking thread priority (1-99 on Linux)
    pub attacking_priority: i32,
    /// Lock memory to prevent page faults
    pub lock_memory: bool,
    /// CPUs for the sensing thread
    pub sensing_cpus: Vec<usize>,
    /// CPUs for the attacking thread
    pub attacking_cpus: Vec<usize>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enable: false,
            sensing_priority: 80,
            attacking_priority: 85,
            lock_memory: false,
            sensing_cpus: Vec::new(),
            attacking_cpus: Vec::new(),
        }
    }
}

/// Complete, validated experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentConfig {
    pub radio: RadioConfig,
    pub sensing: SensingConfig,
    pub attack: AttackConfig,
    pub logging: LogConfig,
    pub realtime: RealtimeConfig,
}

// ---------------------------------------------------------------------------
// File representation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RadioFile {
    sample_rate: Option<f64>,
    rx_samples_per_buffer: Option<usize>,
    tx_samples_per_buffer: Option<usize>,
    tx_rx_offset_us: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SensingFile {
    noise_calibration_ms: Option<f64>,
    energy_detection_threshold_db: Option<f64>,
    spectrogram_peak_threshold_db: Option<f64>,
    min_points_per_chirp: Option<usize>,
    min_recording_time_ms: Option<f64>,
    max_frames_to_capture: Option<usize>,
    min_frame_periodicity_ms: Option<f64>,
    max_waiting_time_ms: Option<f64>,
    pre_trigger_rows: Option<usize>,
    victim_distance_m: Option<f64>,
    debug: Option<bool>,
    output_dir: Option<PathBuf>,
    parallel_fft: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AttackFile {
    enabled: Option<bool>,
    start_frame: Option<usize>,
    estimated_frame_periodicity_ms: Option<f64>,
    num_attack_frames: Option<usize>,
    signal_file: Option<PathBuf>,
    signal_format: Option<IqFormat>,
    chirp: Option<ChirpTemplate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    radio: RadioFile,
    sensing: SensingFile,
    attack: AttackFile,
    logging: LogConfig,
    realtime: RealtimeConfig,
}

/// Collects the names of required keys that were not set.
struct Required {
    missing: Vec<String>,
}

impl Required {
    fn get<T: Default>(&mut self, value: Option<T>, key: &str) -> T {
        match value {
            Some(v) => v,
            None => {
                self.missing.push(key.to_string());
                T::default()
            }
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from the default search path.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if Path::new(&path).exists() {
                return Self::load_from(Path::new(&path));
            }
            return Err(ConfigError::NotFound(format!("{} ({})", path, CONFIG_ENV_VAR)));
        }

        let paths = Self::config_search_paths();
        for path in &paths {
            if path.exists() {
                return Self::load_from(path);
            }
        }

        let searched: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        Err(ConfigError::NotFound(searched.join(", ")))
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = Self::resolve(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Write(format!("{}: {}", path.display(), e)))
    }

    /// Get configuration search paths.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./chirpsync.yaml")];

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "chirpsync") {
            paths.push(config_dir.config_dir().join("config.yaml"));
        }

        paths.push(PathBuf::from("/etc/chirpsync/config.yaml"));

        paths
    }

    fn resolve(file: ConfigFile) -> Result<Self, ConfigError> {
        let mut req = Required {
            missing: Vec::new(),
        };

        let radio = RadioConfig {
            sample_rate: req.get(file.radio.sample_rate, "radio.sample_rate"),
            rx_samples_per_buffer: req
                .get(file.radio.rx_samples_per_buffer, "radio.rx_samples_per_buffer"),
            tx_samples_per_buffer: req
                .get(file.radio.tx_samples_per_buffer, "radio.tx_samples_per_buffer"),
            tx_rx_offset_us: req.get(file.radio.tx_rx_offset_us, "radio.tx_rx_offset_us"),
        };

        let s = file.sensing;
        let sensing = SensingConfig {
            noise_calibration_ms: req.get(s.noise_calibration_ms, "sensing.noise_calibration_ms"),
            energy_detection_threshold_db: req.get(
                s.energy_detection_threshold_db,
                "sensing.energy_detection_threshold_db",
            ),
            spectrogram_peak_threshold_db: req.get(
                s.spectrogram_peak_threshold_db,
                "sensing.spectrogram_peak_threshold_db",
            ),
            min_points_per_chirp: req.get(s.min_points_per_chirp, "sensing.min_points_per_chirp"),
            min_recording_time_ms: req
                .get(s.min_recording_time_ms, "sensing.min_recording_time_ms"),
            max_frames_to_capture: req
                .get(s.max_frames_to_capture, "sensing.max_frames_to_capture"),
            min_frame_periodicity_ms: req
                .get(s.min_frame_periodicity_ms, "sensing.min_frame_periodicity_ms"),
            max_waiting_time_ms: req.get(s.max_waiting_time_ms, "sensing.max_waiting_time_ms"),
            pre_trigger_rows: s.pre_trigger_rows.unwrap_or(1),
            victim_distance_m: s.victim_distance_m.unwrap_or(0.0),
            debug: s.debug.unwrap_or(false),
            output_dir: s.output_dir,
            parallel_fft: s.parallel_fft.unwrap_or(false),
        };

        let a = file.attack;
        let attack = AttackConfig {
            enabled: req.get(a.enabled, "attack.enabled"),
            start_frame: req.get(a.start_frame, "attack.start_frame"),
            estimated_frame_periodicity_ms: req.get(
                a.estimated_frame_periodicity_ms,
                "attack.estimated_frame_periodicity_ms",
            ),
            num_attack_frames: req.get(a.num_attack_frames, "attack.num_attack_frames"),
            signal_file: a.signal_file,
            signal_format: a.signal_format.unwrap_or_default(),
            chirp: a.chirp.unwrap_or_default(),
        };

        if !req.missing.is_empty() {
            return Err(ConfigError::MissingFields(req.missing));
        }

        Ok(Self {
            radio,
            sensing,
            attack,
            logging: file.logging,
            realtime: file.realtime,
        })
    }

    /// Validate value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_positive(self.radio.sample_rate) {
            return Err(ConfigError::Invalid("radio.sample_rate must be positive".to_string()));
        }

        if self.radio.rx_samples_per_buffer == 0 || self.radio.tx_samples_per_buffer == 0 {
            return Err(ConfigError::Invalid(
                "samples per buffer must be > 0".to_string(),
            ));
        }

        if !self.radio.tx_rx_offset_us.is_finite() {
            return Err(ConfigError::Invalid("radio.tx_rx_offset_us must be finite".to_string()));
        }

        if !is_positive(self.sensing.noise_calibration_ms)
            || !is_positive(self.sensing.min_recording_time_ms)
        {
            return Err(ConfigError::Invalid(
                "calibration and recording times must be positive".to_string(),
            ));
        }

        if !is_positive(self.sensing.min_frame_periodicity_ms)
            || !is_positive(self.sensing.max_waiting_time_ms)
        {
            return Err(ConfigError::Invalid(
                "sensing.min_frame_periodicity_ms and sensing.max_waiting_time_ms must be positive"
                    .to_string(),
            ));
        }

        if !self.sensing.victim_distance_m.is_finite() || self.sensing.victim_distance_m < 0.0 {
            return Err(ConfigError::Invalid(
                "sensing.victim_distance_m must be finite and not negative".to_string(),
            ));
        }

        if self.sensing.min_points_per_chirp < 2 {
            return Err(ConfigError::Invalid(
                "sensing.min_points_per_chirp must be at least 2 for a line fit".to_string(),
            ));
        }

        if self.sensing.max_frames_to_capture == 0 {
            return Err(ConfigError::Invalid(
                "sensing.max_frames_to_capture must be > 0".to_string(),
            ));
        }

        if self.attack.enabled && self.attack.num_attack_frames == 0 {
            return Err(ConfigError::Invalid(
                "attack.num_attack_frames must be > 0 when the attack is enabled".to_string(),
            ));
        }

        if self.attack.enabled && self.attack.signal_file.is_none() {
            let chirp = &self.attack.chirp;
            let sweep_samples = (chirp.duration_us * 1e-6 * self.radio.sample_rate).round();
            if !is_positive(sweep_samples) || chirp.num_chirps == 0 {
                return Err(ConfigError::Invalid(format!(
                    "attack.chirp sweeps {} µs × {} chirps, no samples at {} Hz",
                    chirp.duration_us, chirp.num_chirps, self.radio.sample_rate
                )));
            }
            if !chirp.idle_us.is_finite() || chirp.idle_us < 0.0 {
                return Err(ConfigError::Invalid(
                    "attack.chirp.idle_us must be finite and not negative".to_string(),
                ));
            }
        }

        if self.realtime.enable {
            for p in [self.realtime.sensing_priority, self.realtime.attacking_priority] {
                if !(1..=99).contains(&p) {
                    return Err(ConfigError::Invalid(
                        "real-time priorities must be 1-99".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Sensing listens again this long after a frame start (s).
    pub fn min_frame_periodicity_s(&self) -> f64 {
        self.sensing.min_frame_periodicity_ms * 1e-3
    }

    /// Example configuration suitable for the simulated testbed.
    pub fn example_yaml() -> &'static str {
        r#"radio:
  sample_rate: 25.0e6
  rx_samples_per_buffer: 2000
  tx_samples_per_buffer: 2000
  tx_rx_offset_us: 0.0

sensing:
  noise_calibration_ms: 1.0
  energy_detection_threshold_db: 10.0
  spectrogram_peak_threshold_db: 8.0
  min_points_per_chirp: 4
  min_recording_time_ms: 0.3
  max_frames_to_capture: 20
  min_frame_periodicity_ms: 9.0
  max_waiting_time_ms: 50.0
  pre_trigger_rows: 1
  victim_distance_m: 0.0
  debug: false

attack:
  enabled: true
  start_frame: 3
  estimated_frame_periodicity_ms: 10.0
  num_attack_frames: 15
  signal_format: cf32
  chirp:
    start_frequency_mhz: 1.0
    slope_mhz_per_us: 0.5
    duration_us: 36.0
    idle_us: 4.0
    num_chirps: 8
    amplitude: 1.0

logging:
  level: info
  format: compact

realtime:
  enable: false
"#
    }
}

/// `x > 0`, false for NaN.
fn is_positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}
