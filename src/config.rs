//! Configuration loading and validation.
//!
//! Settings are read from a sectioned key=value file with two sections:
//! `[common]`, whose keys are fixed and typed, and `[camera]`, which is an
//! opaque string map forwarded verbatim to the camera driver. Parsing is done
//! by the `config` crate in INI mode and deserialized through `serde`; a
//! separate `validate()` step catches values that parse but are logically
//! wrong (bad ROI, inverted pupil-width bounds, and so on).
//!
//! A load failure or a validation failure is fatal at startup.

use crate::error::{AppResult, GazeError};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default name of the configuration file inside the config directory.
pub const DEFAULT_CONFIG_FILE: &str = "gazetrack.cfg";

/// Recording mode, fixed at startup from the `BINOCULAR` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingMode {
    Monocular,
    Binocular,
}

/// `[common]` section. Field names correspond to the configuration keys;
/// the upper-case aliases keep files written by other front-ends readable.
/// Unknown keys are a startup error so typos fail loudly.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommonSettings {
    #[serde(alias = "THRESHOLD", default = "default_threshold")]
    pub threshold: u8,
    #[serde(alias = "MAX_PUPIL_WIDTH", default = "default_max_pupil_width")]
    pub max_pupil_width: u32,
    #[serde(alias = "MIN_PUPIL_WIDTH", default = "default_min_pupil_width")]
    pub min_pupil_width: u32,
    #[serde(alias = "PURKINJE_THRESHOLD", default = "default_purkinje_threshold")]
    pub purkinje_threshold: u8,
    #[serde(alias = "PURKINJE_SEARCHAREA", default = "default_purkinje_searcharea")]
    pub purkinje_searcharea: u32,
    #[serde(alias = "PURKINJE_EXCLUDEAREA", default = "default_purkinje_excludearea")]
    pub purkinje_excludearea: u32,
    #[serde(alias = "BINOCULAR", default)]
    pub binocular: u8,
    #[serde(alias = "CAMERA_WIDTH")]
    pub camera_width: u32,
    #[serde(alias = "CAMERA_HEIGHT")]
    pub camera_height: u32,
    #[serde(alias = "PREVIEW_WIDTH", default = "default_preview_width")]
    pub preview_width: u32,
    #[serde(alias = "PREVIEW_HEIGHT", default = "default_preview_height")]
    pub preview_height: u32,
    /// 0 means "same as the camera frame".
    #[serde(alias = "ROI_WIDTH", default)]
    pub roi_width: u32,
    /// 0 means "same as the camera frame".
    #[serde(alias = "ROI_HEIGHT", default)]
    pub roi_height: u32,
    #[serde(alias = "SHOW_DETECTIONERROR_MSG", default)]
    pub show_detectionerror_msg: u8,
    #[serde(alias = "PORT_SEND", default = "default_port_send")]
    pub port_send: u16,
    #[serde(alias = "PORT_RECV", default = "default_port_recv")]
    pub port_recv: u16,
    #[serde(alias = "DELAY_CORRECTION", default)]
    pub delay_correction: i64,
    #[serde(alias = "OUTPUT_PUPILSIZE", default = "default_output_pupilsize")]
    pub output_pupilsize: u8,
    #[serde(alias = "USBIO_BOARD", default)]
    pub usbio_board: String,
    #[serde(alias = "USBIO_AD", default)]
    pub usbio_ad: String,
    #[serde(alias = "USBIO_DI", default)]
    pub usbio_di: String,
    #[serde(alias = "MORPH_TRANS", default)]
    pub morph_trans: i32,
}

fn default_threshold() -> u8 {
    55
}
fn default_max_pupil_width() -> u32 {
    30
}
fn default_min_pupil_width() -> u32 {
    10
}
fn default_purkinje_threshold() -> u8 {
    240
}
fn default_purkinje_searcharea() -> u32 {
    60
}
fn default_purkinje_excludearea() -> u32 {
    20
}
fn default_preview_width() -> u32 {
    640
}
fn default_preview_height() -> u32 {
    480
}
fn default_port_send() -> u16 {
    10001
}
fn default_port_recv() -> u16 {
    10000
}
fn default_output_pupilsize() -> u8 {
    1
}

/// Full application settings: the typed common section plus the opaque
/// camera section.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub common: CommonSettings,
    #[serde(default)]
    pub camera: HashMap<String, String>,
}

impl Settings {
    /// Load and validate settings from `path`.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.is_file() {
            return Err(GazeError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let cfg = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or_else(|| {
                    GazeError::Configuration("configuration path is not valid UTF-8".into())
                })?,
                FileFormat::Ini,
            ))
            .build()?;
        let mut settings: Settings = cfg.try_deserialize()?;
        if settings.common.roi_width == 0 {
            settings.common.roi_width = settings.common.camera_width;
        }
        if settings.common.roi_height == 0 {
            settings.common.roi_height = settings.common.camera_height;
        }
        settings.validate()?;
        log::info!("Configuration file is {}.", path.display());
        Ok(settings)
    }

    /// Semantic checks that plain parsing cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        let c = &self.common;
        if c.camera_width == 0 || c.camera_height == 0 {
            return Err(GazeError::Configuration(
                "CAMERA_WIDTH and CAMERA_HEIGHT must be positive".into(),
            ));
        }
        if c.preview_width == 0 || c.preview_height == 0 {
            return Err(GazeError::Configuration(
                "PREVIEW_WIDTH and PREVIEW_HEIGHT must be positive".into(),
            ));
        }
        if c.roi_width > c.camera_width || c.roi_height > c.camera_height {
            return Err(GazeError::Configuration(format!(
                "ROI ({}x{}) must be contained in the camera frame ({}x{})",
                c.roi_width, c.roi_height, c.camera_width, c.camera_height
            )));
        }
        if c.min_pupil_width == 0
            || c.max_pupil_width > 100
            || c.min_pupil_width >= c.max_pupil_width
        {
            return Err(GazeError::Configuration(format!(
                "pupil width bounds must satisfy 0 < MIN_PUPIL_WIDTH < MAX_PUPIL_WIDTH <= 100 (got {}..{})",
                c.min_pupil_width, c.max_pupil_width
            )));
        }
        if c.purkinje_excludearea > c.purkinje_searcharea {
            return Err(GazeError::Configuration(format!(
                "PURKINJE_EXCLUDEAREA ({}) must not exceed PURKINJE_SEARCHAREA ({})",
                c.purkinje_excludearea, c.purkinje_searcharea
            )));
        }
        if c.threshold == 0 || c.purkinje_threshold == 0 {
            return Err(GazeError::Configuration(
                "THRESHOLD and PURKINJE_THRESHOLD must be at least 1".into(),
            ));
        }
        if c.binocular > 1 {
            return Err(GazeError::Configuration(
                "BINOCULAR must be 0 or 1".into(),
            ));
        }
        Ok(())
    }

    pub fn recording_mode(&self) -> RecordingMode {
        if self.common.binocular == 1 {
            RecordingMode::Binocular
        } else {
            RecordingMode::Monocular
        }
    }

    pub fn use_usbio(&self) -> bool {
        !self.common.usbio_board.is_empty()
    }

    /// Write the current settings back to `path`, preserving the camera
    /// section via the driver's own parameter dump. Called at shutdown so
    /// menu adjustments survive restarts.
    pub fn save(&self, path: &Path, camera_section: &str) -> AppResult<()> {
        let c = &self.common;
        let mut out = std::fs::File::create(path)?;
        writeln!(out, "[common]")?;
        writeln!(out, "THRESHOLD={}", c.threshold)?;
        writeln!(out, "MAX_PUPIL_WIDTH={}", c.max_pupil_width)?;
        writeln!(out, "MIN_PUPIL_WIDTH={}", c.min_pupil_width)?;
        writeln!(out, "PURKINJE_THRESHOLD={}", c.purkinje_threshold)?;
        writeln!(out, "PURKINJE_SEARCHAREA={}", c.purkinje_searcharea)?;
        writeln!(out, "PURKINJE_EXCLUDEAREA={}", c.purkinje_excludearea)?;
        writeln!(out, "BINOCULAR={}", c.binocular)?;
        writeln!(out, "CAMERA_WIDTH={}", c.camera_width)?;
        writeln!(out, "CAMERA_HEIGHT={}", c.camera_height)?;
        writeln!(out, "PREVIEW_WIDTH={}", c.preview_width)?;
        writeln!(out, "PREVIEW_HEIGHT={}", c.preview_height)?;
        writeln!(out, "ROI_WIDTH={}", c.roi_width)?;
        writeln!(out, "ROI_HEIGHT={}", c.roi_height)?;
        writeln!(out, "SHOW_DETECTIONERROR_MSG={}", c.show_detectionerror_msg)?;
        writeln!(out, "PORT_SEND={}", c.port_send)?;
        writeln!(out, "PORT_RECV={}", c.port_recv)?;
        writeln!(out, "DELAY_CORRECTION={}", c.delay_correction)?;
        writeln!(out, "OUTPUT_PUPILSIZE={}", c.output_pupilsize)?;
        if !c.usbio_board.is_empty() {
            writeln!(out, "USBIO_BOARD={}", c.usbio_board)?;
            writeln!(out, "USBIO_AD={}", c.usbio_ad)?;
            writeln!(out, "USBIO_DI={}", c.usbio_di)?;
        }
        writeln!(out, "MORPH_TRANS={}", c.morph_trans)?;
        writeln!(out)?;
        writeln!(out, "[camera]")?;
        out.write_all(camera_section.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
impl Settings {
    /// Build settings directly for unit tests, bypassing file parsing.
    pub(crate) fn for_tests(cam_w: u32, cam_h: u32, roi_w: u32, roi_h: u32) -> Self {
        Settings {
            common: CommonSettings {
                threshold: default_threshold(),
                max_pupil_width: default_max_pupil_width(),
                min_pupil_width: default_min_pupil_width(),
                purkinje_threshold: default_purkinje_threshold(),
                purkinje_searcharea: default_purkinje_searcharea(),
                purkinje_excludearea: default_purkinje_excludearea(),
                binocular: 0,
                camera_width: cam_w,
                camera_height: cam_h,
                preview_width: default_preview_width(),
                preview_height: default_preview_height(),
                roi_width: roi_w,
                roi_height: roi_h,
                show_detectionerror_msg: 0,
                port_send: default_port_send(),
                port_recv: default_port_recv(),
                delay_correction: 0,
                output_pupilsize: default_output_pupilsize(),
                usbio_board: String::new(),
                usbio_ad: String::new(),
                usbio_di: String::new(),
                morph_trans: 0,
            },
            camera: HashMap::new(),
        }
    }
}

/// Default configuration directory (`~/.config/gazetrack` where available,
/// the current directory otherwise).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("gazetrack"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default data directory (`~/gazetrack-data` where available, the current
/// directory otherwise).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|d| d.join("gazetrack-data"))
        .unwrap_or_else(|| PathBuf::from("."))
}
