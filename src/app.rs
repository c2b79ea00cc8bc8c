//! Application wiring and main loop.
//!
//! `App` owns every subsystem: settings, the live parameters, the image
//! buffers, the acquisition session, the control server, the parameter menu
//! and the frame source. One loop iteration services the control socket,
//! dispatches any complete commands, and processes at most one camera frame
//! through detection and the state machine. Runtime operational failures are
//! logged and the loop continues; only startup failures are fatal.

use crate::buffers::Buffers;
use crate::calib::EYE_L;
use crate::camera::CameraDevice;
use crate::capture::{share_camera, CaptureThread, FrameSource, SharedCamera};
use crate::clock::Clock;
use crate::config::{RecordingMode, Settings};
use crate::detect::{detect_bin, detect_mono, DetectContext};
use crate::error::AppResult;
use crate::menu::Menu;
use crate::params::TrackingParams;
use crate::server::{Command, ControlServer, Key};
use crate::session::{FrameDetection, RunState, Session};
use crate::usbio::UsbIo;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Pause between loop iterations when no frame is pending.
const IDLE_SLEEP: Duration = Duration::from_micros(500);

pub struct App {
    settings: Settings,
    config_path: PathBuf,
    data_dir: PathBuf,
    pub params: TrackingParams,
    pub buffers: Buffers,
    pub session: Session,
    pub server: ControlServer,
    menu: Menu,
    camera: SharedCamera,
    frames: Option<FrameSource>,
    running: bool,
    show_preview: bool,
    inhibit_rendering: bool,
    show_cal_result: bool,
    show_detection_errors: bool,
    send_scratch: Vec<u8>,
}

impl App {
    pub fn new(
        settings: Settings,
        config_path: PathBuf,
        data_dir: PathBuf,
        mut camera: Box<dyn CameraDevice>,
        usbio: Option<Box<dyn UsbIo>>,
    ) -> AppResult<Self> {
        let params = TrackingParams::from_settings(&settings.common);
        let buffers = Buffers::new(&settings)?;
        camera.open(&settings.camera)?;
        log::info!("Camera: {}", camera.name());

        let clock = Clock::new();
        let mut session = Session::new(&settings, &data_dir, clock);
        session.set_output_cam_meta(camera.specific_data().is_some());
        session.usbio = usbio;

        let server = ControlServer::bind(settings.common.port_recv, settings.common.port_send)?;

        let use_thread = settings
            .camera
            .get("use_thread")
            .map(|v| v == "1")
            .unwrap_or(false);
        let camera = share_camera(camera);
        let frames = if use_thread {
            log::info!("Using a capture thread.");
            FrameSource::Threaded(CaptureThread::spawn(
                Arc::clone(&camera),
                settings.common.camera_width,
                settings.common.camera_height,
            ))
        } else {
            FrameSource::Direct(Arc::clone(&camera))
        };

        let show_detection_errors = settings.common.show_detectionerror_msg != 0;
        let mut app = Self {
            settings,
            config_path,
            data_dir,
            params,
            buffers,
            session,
            server,
            menu: Menu::new(),
            camera,
            frames: Some(frames),
            running: true,
            show_preview: true,
            inhibit_rendering: false,
            show_cal_result: false,
            show_detection_errors,
            send_scratch: Vec::new(),
        };
        app.measure_frame_interval();
        Ok(app)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Serve until stopped, then shut down cleanly.
    pub fn run(mut self) -> AppResult<()> {
        while self.running {
            self.run_once();
        }
        self.shutdown()
    }

    /// One main-loop iteration: service the socket, then at most one frame.
    pub fn run_once(&mut self) {
        let poll = self.server.poll();
        for command in poll.commands {
            self.dispatch(command);
        }
        if poll.connection_lost {
            if let Err(e) = self.session.connection_closed() {
                log::error!("cleanup after lost connection failed: {e}");
            }
        }

        if self.show_cal_result {
            self.session.cal.draw_result_plot(&mut self.buffers.cal_plot);
            std::thread::sleep(IDLE_SLEEP);
            return;
        }

        let frame = match self.frames.as_mut() {
            Some(frames) => frames.poll(&mut self.buffers.source),
            None => Ok(None),
        };
        match frame {
            Ok(Some(cam_meta)) => self.process_frame(cam_meta),
            Ok(None) => std::thread::sleep(IDLE_SLEEP),
            Err(e) => {
                // The camera is gone; keep serving control traffic.
                log::error!("camera grab failed: {e}");
                self.frames = None;
            }
        }
    }

    fn process_frame(&mut self, cam_meta: u32) {
        let time_ms = self.session.elapsed_ms();
        let draw = self.show_preview && !self.inhibit_rendering;
        let preview = draw.then_some(&mut self.buffers.preview);
        let detection = match self.session.mode() {
            RecordingMode::Monocular => FrameDetection::Mono(detect_mono(DetectContext {
                source: &self.buffers.source,
                roi: self.buffers.roi,
                params: &self.params,
                preview,
            })),
            RecordingMode::Binocular => FrameDetection::Bin(detect_bin(DetectContext {
                source: &self.buffers.source,
                roi: self.buffers.roi,
                params: &self.params,
                preview,
            })),
        };
        self.buffers.preview_note = if draw && self.show_detection_errors {
            detection.failure().map(|f| f.label().to_string())
        } else {
            None
        };
        if let Err(e) = self.session.handle_frame(&detection, time_ms, cam_meta) {
            log::error!("sample write failed: {e}");
        }
    }

    /// Startup diagnostic: mean and standard deviation of the camera
    /// inter-frame interval over at most one second or 2000 frames.
    fn measure_frame_interval(&mut self) {
        let Some(frames) = self.frames.as_mut() else {
            return;
        };
        let clock = Clock::new();
        let mut intervals = Vec::with_capacity(2000);
        let mut last = 0.0f64;
        while clock.now_ms() < 1000.0 && intervals.len() < 2000 {
            match frames.poll(&mut self.buffers.source) {
                Ok(Some(_)) => {
                    let now = clock.now_ms();
                    intervals.push(now - last);
                    last = now;
                }
                Ok(None) => std::thread::sleep(IDLE_SLEEP),
                Err(_) => return,
            }
        }
        if intervals.len() < 2 {
            return;
        }
        let samples = &intervals[1..]; // drop the first, it spans startup
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let var =
            samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / samples.len() as f64;
        log::info!(
            "Average inter-frame interval = {:.3}ms (sd: {:.3}ms)",
            mean,
            var.sqrt()
        );
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Key(key) => self.handle_key(key),
            Command::GetImageData => {
                let mut scratch = std::mem::take(&mut self.send_scratch);
                self.buffers.fill_send_image(self.params.threshold, &mut scratch);
                self.server.send_block(&scratch);
                self.send_scratch = scratch;
            }
            Command::StartCal { area, clear } => {
                self.session.start_calibration(area, clear);
                self.show_cal_result = false;
            }
            Command::GetCalSample { x, y, samples } | Command::GetValSample { x, y, samples } => {
                self.session.get_cal_sample(x, y, samples);
            }
            Command::EndCal => {
                self.session.end_calibration();
                self.show_cal_result = true;
            }
            Command::StartVal { area } => {
                self.session.start_validation(area);
                self.show_cal_result = false;
            }
            Command::EndVal => {
                self.session.end_validation();
                self.show_cal_result = true;
            }
            Command::ToggleCalResult { show } => {
                self.show_cal_result = show && self.session.cal.is_calibrated;
            }
            Command::SaveCalValResultsDetail => {
                if let Err(e) = self.session.save_cal_detail() {
                    log::error!("saveCalValResultsDetail failed: {e}");
                }
            }
            Command::StartRecording { message } => {
                if let Err(e) = self.session.start_recording(&message) {
                    log::error!("startRecording failed: {e}");
                }
                if self.session.state() == RunState::Recording {
                    self.show_cal_result = false;
                    self.show_preview = false;
                    log::info!("Camera preview during recording is disabled.");
                }
            }
            Command::StopRecording { message } => {
                if let Err(e) = self.session.stop_recording(&message) {
                    log::error!("stopRecording failed: {e}");
                }
                self.show_preview = true;
            }
            Command::OpenDataFile { name, overwrite } => {
                if let Err(e) = self.session.open_data_file(&name, overwrite) {
                    log::error!("Failed to open datafile {name}: {e}");
                }
            }
            Command::CloseDataFile => {
                if let Err(e) = self.session.close_data_file() {
                    log::error!("closeDataFile failed: {e}");
                }
            }
            Command::InsertMessage { text } => {
                if let Err(e) = self.session.insert_message(&text) {
                    log::error!("insertMessage failed: {e}");
                }
            }
            Command::InsertSettings { text } => {
                if let Err(e) = self.session.insert_settings(&text) {
                    log::error!("insertSettings failed: {e}");
                }
            }
            Command::GetEyePosition { average } => {
                let pos = self.session.eye_position(average);
                let reply = pos
                    .iter()
                    .map(|v| format!("{v:.0}"))
                    .collect::<Vec<_>>()
                    .join(",");
                self.server.send_str(&reply);
            }
            Command::GetEyePositionList { count, with_pupil } => {
                let new_only = count < 0;
                let count = count.unsigned_abs() as usize;
                let mut fields = Vec::new();
                for offset in 0..count {
                    let Some(row) = self.session.eye_position_reverse(offset, new_only) else {
                        break;
                    };
                    push_row_fields(&mut fields, &row, self.session.mode(), with_pupil);
                }
                self.session.update_last_sent();
                self.server.send_str(&fields.join(","));
            }
            Command::GetWholeEyePositionList { with_pupil } => {
                let mut fields = Vec::new();
                let mut offset = 0;
                while let Some(row) = self.session.eye_position_forward(offset) {
                    push_row_fields(&mut fields, &row, self.session.mode(), with_pupil);
                    offset += 1;
                }
                self.server.send_str(&fields.join(","));
            }
            Command::GetWholeMessageList => {
                let contents = self.session.message_contents().to_string();
                self.server.send_str(&contents);
            }
            Command::GetCalResults => {
                let summary = *self.session.cal.summary();
                let reply = match self.session.mode() {
                    RecordingMode::Monocular => format!(
                        "{:.2},{:.2}",
                        summary.mean_error[EYE_L], summary.max_error[EYE_L]
                    ),
                    RecordingMode::Binocular => format!(
                        "{:.2},{:.2},{:.2},{:.2}",
                        summary.mean_error[0],
                        summary.max_error[0],
                        summary.mean_error[1],
                        summary.max_error[1]
                    ),
                };
                self.server.send_str(&reply);
            }
            Command::GetCalResultsDetail => {
                let detail = self.session.cal.detail_string();
                self.server.send_str(&detail);
            }
            Command::GetCurrMenu => {
                let label = match self.camera.lock() {
                    Ok(camera) => self.menu.current_label(&self.params, camera.as_ref()),
                    Err(_) => String::new(),
                };
                self.server.send_str(&label);
            }
            Command::SaveCameraImage { name } => {
                let path = self.data_dir.join(&name);
                if let Err(e) = self.buffers.preview.save(&path) {
                    log::error!("saveCameraImage {} failed: {e}", path.display());
                }
            }
            Command::StartMeasurement => self.session.start_measurement(),
            Command::StopMeasurement => self.session.stop_measurement(),
            Command::AllowRendering => self.inhibit_rendering = false,
            Command::InhibitRendering => self.inhibit_rendering = true,
            Command::IsBinocularMode => {
                let reply = match self.session.mode() {
                    RecordingMode::Binocular => "1",
                    RecordingMode::Monocular => "0",
                };
                self.server.send_str(reply);
            }
            Command::GetCameraImageSize => {
                let reply = format!(
                    "{},{}",
                    self.settings.common.camera_width, self.settings.common.camera_height
                );
                self.server.send_str(&reply);
            }
            Command::DeleteCalData { points } => {
                self.session.delete_cal_data(&points);
            }
        }
    }

    fn handle_key(&mut self, key: Key) {
        match key {
            Key::Quit => {
                log::info!("quit requested");
                self.running = false;
            }
            Key::Up => self.menu.move_up(),
            Key::Down => {
                if let Ok(camera) = self.camera.lock() {
                    self.menu.move_down(camera.as_ref());
                }
            }
            Key::Left => {
                if let Ok(mut camera) = self.camera.lock() {
                    self.menu.adjust(&mut self.params, camera.as_mut(), -1);
                }
            }
            Key::Right => {
                if let Ok(mut camera) = self.camera.lock() {
                    self.menu.adjust(&mut self.params, camera.as_mut(), 1);
                }
            }
        }
    }

    /// Stop capture, write the live parameters back to the configuration
    /// file, and close any open data file.
    pub fn shutdown(mut self) -> AppResult<()> {
        log::info!("Shutting down.");
        if let Err(e) = self.session.close_data_file() {
            log::warn!("closing data file at shutdown failed: {e}");
        }
        if let Some(frames) = self.frames.take() {
            frames.stop();
        }
        let mut camera_section = String::new();
        if let Ok(mut camera) = self.camera.lock() {
            camera.save_params(&mut camera_section);
            camera.release();
        }
        self.params.store(&mut self.settings.common);
        if let Err(e) = self.settings.save(&self.config_path, &camera_section) {
            log::warn!("failed to save parameters: {e}");
        }
        log::info!("Done.");
        Ok(())
    }
}

/// Append one eye-position row's fields using the list reply format.
fn push_row_fields(fields: &mut Vec<String>, row: &[f64], mode: RecordingMode, with_pupil: bool) {
    let take = match (mode, with_pupil) {
        (RecordingMode::Monocular, true) => 4,
        (RecordingMode::Monocular, false) => 3,
        (RecordingMode::Binocular, true) => 7,
        (RecordingMode::Binocular, false) => 5,
    };
    for v in row.iter().take(take) {
        fields.push(format!("{v:.1}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_fields_respect_mode_and_pupil_flag() {
        let row = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let mut fields = Vec::new();
        push_row_fields(&mut fields, &row, RecordingMode::Monocular, false);
        assert_eq!(fields, vec!["1.0", "2.0", "3.0"]);
        fields.clear();
        push_row_fields(&mut fields, &row, RecordingMode::Binocular, true);
        assert_eq!(fields.len(), 7);
    }
}
