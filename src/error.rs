//! Custom error types for the application.
//!
//! This module defines the primary error type, `GazeError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle operational failures, from configuration and I/O
//! issues to camera and protocol problems.
//!
//! `GazeError` covers *operational* errors only. Per-frame detection outcomes
//! (`NoPupilCandidate` and friends) are data, not control: they are carried in
//! the sample stream as tagged values and never travel through this type. See
//! [`crate::detect::DetectFailure`] for those.
//!
//! By using `#[from]`, `GazeError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, GazeError>;

#[derive(Error, Debug)]
pub enum GazeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer allocation error: {0}")]
    Buffer(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Data file is not open")]
    DataFileNotOpen,

    #[error("Data file error: {0}")]
    DataFile(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("USB I/O error: {0}")]
    UsbIo(String),
}
