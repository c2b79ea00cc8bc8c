//! Server binary: parse the command line, load configuration, wire the
//! camera and optional USB I/O, and run the main loop until the client (or
//! the operator) asks to quit.

use anyhow::{Context, Result};
use clap::Parser;
use gazetrack::app::App;
use gazetrack::camera::simulated::SimulatedCamera;
use gazetrack::config::{self, Settings, DEFAULT_CONFIG_FILE};
use gazetrack::usbio;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gazetrack", version, about = "Video-oculography eye-tracking server")]
struct Cli {
    /// Directory holding the configuration file.
    #[arg(long = "config-dir")]
    config_dir: Option<PathBuf>,

    /// Directory where data files are written.
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Configuration file name (within the config directory).
    #[arg(long = "config", default_value = DEFAULT_CONFIG_FILE)]
    config: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(config::default_config_dir);
    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let config_path = config_dir.join(&cli.config);
    let settings = Settings::load(&config_path).context("failed to load configuration")?;

    let usbio = if settings.use_usbio() {
        Some(
            usbio::open_usbio(
                &settings.common.usbio_board,
                &settings.common.usbio_ad,
                &settings.common.usbio_di,
            )
            .context("failed to open USB I/O board")?,
        )
    } else {
        None
    };

    // The stock build ships the simulated backend; hardware cameras plug in
    // behind the same trait.
    let camera = Box::new(SimulatedCamera::new());

    let app = App::new(settings, config_path, data_dir, camera, usbio)
        .context("failed to initialize")?;
    app.run().context("server terminated abnormally")?;
    Ok(())
}
