//! Acquisition state machine.
//!
//! Owns the sample ring, the message buffer, the calibration store, the data
//! file and the per-session timestamps, and routes every captured frame
//! according to the current state: idle frames only feed the preview,
//! calibration/validation frames feed the calibration buffer while samples
//! are owed at the current target, and recording frames go into the ring
//! (with overflow flushing) and update the current-gaze fields.
//!
//! State transitions happen only through the protocol commands; a transition
//! requested from an incompatible state is a logged no-op.

use crate::calib::{eye_delta_or_tag, CalKind, Calibration, EYE_L, EYE_R};
use crate::clock::Clock;
use crate::config::{RecordingMode, Settings};
use crate::datafile::{DataFile, DataFileOptions};
use crate::detect::{is_valid_value, BinDetection, DetectFailure, EyeResult};
use crate::error::AppResult;
use crate::ring::{GazeRecord, MessageBuffer, MessagePush, SampleRing, DEFAULT_RING_CAPACITY};
use crate::usbio::UsbIo;
use std::path::{Path, PathBuf};

/// Current acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Calibrating,
    Validating,
    Recording,
}

/// One frame's detection outcome, as routed into the session.
pub enum FrameDetection {
    Mono(EyeResult),
    Bin(Result<BinDetection, DetectFailure>),
}

impl FrameDetection {
    /// Whole-frame failure, if any.
    pub fn failure(&self) -> Option<DetectFailure> {
        match self {
            FrameDetection::Mono(Err(f)) => Some(*f),
            FrameDetection::Bin(Err(f)) => Some(*f),
            _ => None,
        }
    }
}

pub struct Session {
    mode: RecordingMode,
    state: RunState,
    pub ring: SampleRing,
    pub cal: Calibration,
    messages: MessageBuffer,
    pub data_file: Option<DataFile>,
    pub usbio: Option<Box<dyn UsbIo>>,
    clock: Clock,
    data_dir: PathBuf,
    rec_start_ms: f64,
    delay_correction_ms: f64,
    output_pupil_size: bool,
    output_cam_meta: bool,
    current_gaze: [(f64, f64); 2],
    current_pupil: [f64; 2],
    last_sent: Option<usize>,
}

impl Session {
    pub fn new(settings: &Settings, data_dir: &Path, clock: Clock) -> Self {
        let mode = settings.recording_mode();
        Self {
            mode,
            state: RunState::Idle,
            ring: SampleRing::new(DEFAULT_RING_CAPACITY),
            cal: Calibration::new(
                mode,
                settings.common.camera_width,
                settings.common.camera_height,
            ),
            messages: MessageBuffer::new(),
            data_file: None,
            usbio: None,
            clock,
            data_dir: data_dir.to_path_buf(),
            rec_start_ms: 0.0,
            delay_correction_ms: settings.common.delay_correction as f64,
            output_pupil_size: settings.common.output_pupilsize != 0,
            output_cam_meta: false,
            current_gaze: [(0.0, 0.0); 2],
            current_pupil: [0.0; 2],
            last_sent: None,
        }
    }

    /// Shrink the ring for tests and diagnostics.
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring = SampleRing::new(capacity);
        self
    }

    /// Enable the per-sample camera metadata column.
    pub fn set_output_cam_meta(&mut self, on: bool) {
        self.output_cam_meta = on;
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn is_busy(&self) -> bool {
        self.state != RunState::Idle
    }

    /// Milliseconds since recording start.
    pub fn elapsed_ms(&self) -> f64 {
        self.clock.now_ms() - self.rec_start_ms
    }

    // ------------------------------------------------------------------
    // Data file
    // ------------------------------------------------------------------

    pub fn open_data_file(&mut self, name: &str, overwrite: bool) -> AppResult<()> {
        if let Some(old) = self.data_file.take() {
            log::info!("Close datafile to open new datafile");
            old.close()?;
        }
        let options = DataFileOptions {
            mode: self.mode,
            output_pupil_size: self.output_pupil_size,
            output_cam_meta: self.output_cam_meta,
            usbio_header: self.usbio.as_ref().map(|io| io.format_header()),
        };
        let file = DataFile::open(&self.data_dir, name, overwrite, options)?;
        log::info!("Open datafile: {}", file.path().display());
        self.data_file = Some(file);
        Ok(())
    }

    pub fn close_data_file(&mut self) -> AppResult<()> {
        match self.data_file.take() {
            Some(file) => {
                log::info!("Close data file.");
                file.close()
            }
            None => {
                log::warn!("closeDataFile: no data file is open");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Calibration / validation
    // ------------------------------------------------------------------

    pub fn start_calibration(&mut self, area: (i32, i32, i32, i32), clear: bool) {
        if self.state != RunState::Idle {
            log::warn!("startCal ignored in state {:?}", self.state);
            return;
        }
        log::info!("StartCalibration");
        self.cal.start(area, clear);
        self.state = RunState::Calibrating;
    }

    pub fn end_calibration(&mut self) {
        if self.state == RunState::Recording {
            log::warn!("endCal ignored while recording");
            return;
        }
        log::info!("EndCalibration");
        self.cal.finish_calibration();
        self.state = RunState::Idle;
    }

    pub fn start_validation(&mut self, area: (i32, i32, i32, i32)) {
        if self.state != RunState::Idle {
            log::warn!("startVal ignored in state {:?}", self.state);
            return;
        }
        log::info!("StartValidation");
        self.cal.start_validation(area);
        self.state = RunState::Validating;
    }

    pub fn end_validation(&mut self) {
        if self.state == RunState::Recording {
            log::warn!("endVal ignored while recording");
            return;
        }
        log::info!("EndValidation");
        self.cal.finish_validation();
        self.state = RunState::Idle;
    }

    pub fn get_cal_sample(&mut self, x: f64, y: f64, samples: u32) {
        self.cal.register_target(x, y, samples);
    }

    /// Drop the named targets' samples and refit on what remains.
    pub fn delete_cal_data(&mut self, points: &[(f64, f64)]) {
        self.cal.delete_targets(points);
        self.end_calibration();
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    pub fn start_recording(&mut self, message: &str) -> AppResult<()> {
        if self.state != RunState::Idle {
            log::warn!("startRecording ignored in state {:?}", self.state);
            return Ok(());
        }
        if !self.cal.is_calibrated {
            log::warn!("startRecording is called before calibration");
            return Ok(());
        }
        if let Some(file) = &mut self.data_file {
            file.write_start_block(message, &self.cal)?;
            log::info!("StartRecording {message}");
        } else {
            log::info!("StartRecording (no file) {message}");
        }
        self.begin_collection();
        Ok(())
    }

    pub fn stop_recording(&mut self, message: &str) -> AppResult<()> {
        if self.state != RunState::Recording {
            log::warn!("stopRecording is called before starting");
            return Ok(());
        }
        let elapsed = self.elapsed_ms();
        if let Some(file) = &mut self.data_file {
            file.flush_records(self.ring.records(), &self.cal, self.usbio.as_deref())?;
            let messages = self.messages.take();
            file.write_stop_block(&messages, Some((elapsed, message)))?;
            log::info!("StopRecording {message}");
        } else {
            log::info!("StopRecording (no file) {message}");
        }
        self.state = RunState::Idle;
        Ok(())
    }

    /// Begin collecting into the ring without a data file or calibration
    /// (concurrent-recording support for external acquisition hosts).
    pub fn start_measurement(&mut self) {
        if self.state != RunState::Idle {
            log::warn!("startMeasurement ignored in state {:?}", self.state);
            return;
        }
        self.begin_collection();
    }

    pub fn stop_measurement(&mut self) {
        if self.state == RunState::Recording {
            self.state = RunState::Idle;
        }
    }

    fn begin_collection(&mut self) {
        self.ring.reset();
        self.messages.clear();
        self.last_sent = None;
        self.rec_start_ms = self.clock.now_ms();
        self.state = RunState::Recording;
    }

    /// The control connection went away: recording ends as if
    /// `stopRecording("ConnectionClosed")` had been issued; an in-progress
    /// calibration or validation is discarded.
    pub fn connection_closed(&mut self) -> AppResult<()> {
        match self.state {
            RunState::Recording => self.stop_recording("ConnectionClosed"),
            RunState::Calibrating | RunState::Validating => {
                log::info!("connection lost: discarding calibration/validation in progress");
                self.cal.abort();
                self.state = RunState::Idle;
                Ok(())
            }
            RunState::Idle => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn insert_message(&mut self, text: &str) -> AppResult<()> {
        let time = self.clock.now_ms() - (self.rec_start_ms - self.delay_correction_ms);
        match self.messages.insert(time, text) {
            MessagePush::Stored => Ok(()),
            MessagePush::Overflowed(contents) => {
                if let Some(file) = &mut self.data_file {
                    file.write_message_overflow(&contents, time)?;
                } else {
                    log::warn!("message buffer overflow with no data file; messages dropped");
                }
                Ok(())
            }
        }
    }

    pub fn message_contents(&self) -> &str {
        self.messages.contents()
    }

    pub fn insert_settings(&mut self, settings: &str) -> AppResult<()> {
        if let Some(file) = &mut self.data_file {
            file.insert_settings(settings)?;
        }
        Ok(())
    }

    pub fn save_cal_detail(&mut self) -> AppResult<()> {
        if self.is_busy() || !self.cal.is_calibrated {
            return Ok(());
        }
        if let Some(file) = &mut self.data_file {
            file.write_cal_detail_block(&self.cal)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-frame routing
    // ------------------------------------------------------------------

    /// Route one captured frame. `time_ms` is the capture timestamp on the
    /// session clock; `cam_meta` is the camera's opaque metadata word.
    pub fn handle_frame(
        &mut self,
        detection: &FrameDetection,
        time_ms: f64,
        cam_meta: u32,
    ) -> AppResult<()> {
        match self.state {
            RunState::Idle => Ok(()),
            RunState::Calibrating | RunState::Validating => {
                self.handle_cal_frame(detection);
                Ok(())
            }
            RunState::Recording => self.handle_recording_frame(detection, time_ms, cam_meta),
        }
    }

    fn handle_cal_frame(&mut self, detection: &FrameDetection) {
        if self.cal.samples_remaining == 0 {
            return;
        }
        match detection {
            FrameDetection::Mono(Ok(eye)) => {
                let delta = (
                    f64::from(eye.pupil.0 - eye.purkinje.0),
                    f64::from(eye.pupil.1 - eye.purkinje.1),
                );
                self.cal.push_sample(
                    [delta, (0.0, 0.0)],
                    [f64::from(eye.pupil_area), 0.0],
                );
            }
            FrameDetection::Mono(Err(_)) => {}
            FrameDetection::Bin(Ok(bin)) => {
                if bin.left.is_err() && bin.right.is_err() {
                    return;
                }
                let (delta, pupil) = bin_to_delta(bin);
                self.cal.push_sample(delta, pupil);
            }
            FrameDetection::Bin(Err(_)) => {}
        }
    }

    fn handle_recording_frame(
        &mut self,
        detection: &FrameDetection,
        time_ms: f64,
        cam_meta: u32,
    ) -> AppResult<()> {
        let (delta, pupil) = match detection {
            FrameDetection::Mono(result) => {
                let delta = eye_delta_or_tag(result.map(|eye| {
                    (
                        f64::from(eye.pupil.0 - eye.purkinje.0),
                        f64::from(eye.pupil.1 - eye.purkinje.1),
                    )
                }));
                let pupil = result.map(|eye| f64::from(eye.pupil_area)).unwrap_or(0.0);
                ([delta, (0.0, 0.0)], [pupil, 0.0])
            }
            FrameDetection::Bin(Ok(bin)) => bin_to_delta(bin),
            FrameDetection::Bin(Err(failure)) => {
                let tag = (f64::from(failure.code()), f64::from(failure.code()));
                ([tag, tag], [0.0, 0.0])
            }
        };

        // Current-gaze fields for getEyePosition.
        match self.mode {
            RecordingMode::Monocular => {
                if is_valid_value(delta[EYE_L].0) {
                    self.current_gaze[EYE_L] = self.cal.gaze_mono(delta[EYE_L]);
                } else {
                    self.current_gaze[EYE_L] = delta[EYE_L];
                }
                self.current_pupil[EYE_L] = pupil[EYE_L];
            }
            RecordingMode::Binocular => {
                self.current_gaze = self.cal.gaze_bin(delta);
                self.current_pupil = pupil;
            }
        }

        let index = self.ring.len();
        if let Some(io) = &mut self.usbio {
            io.sample(index);
        }
        let full = self.ring.push(GazeRecord {
            time_ms,
            delta,
            pupil,
            cam_meta,
        });
        if full {
            let elapsed = self.elapsed_ms();
            if let Some(file) = &mut self.data_file {
                file.flush_records(self.ring.records(), &self.cal, self.usbio.as_deref())?;
                file.write_gaze_overflow_marker(elapsed)?;
            } else {
                log::warn!("sample ring overflow with no data file; samples dropped");
            }
            self.ring.reset();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eye-position queries
    // ------------------------------------------------------------------

    /// Latest gaze (and pupil size), optionally averaged over the last
    /// `n` valid samples. Monocular: `[x, y, p]`; binocular:
    /// `[lx, ly, rx, ry, lp, rp]`.
    pub fn eye_position(&self, n: usize) -> Vec<f64> {
        if n <= 1 {
            return match self.mode {
                RecordingMode::Monocular => vec![
                    self.current_gaze[EYE_L].0,
                    self.current_gaze[EYE_L].1,
                    self.current_pupil[EYE_L],
                ],
                RecordingMode::Binocular => vec![
                    self.current_gaze[EYE_L].0,
                    self.current_gaze[EYE_L].1,
                    self.current_gaze[EYE_R].0,
                    self.current_gaze[EYE_R].1,
                    self.current_pupil[EYE_L],
                    self.current_pupil[EYE_R],
                ],
            };
        }
        let nan = f64::from(DetectFailure::NanInMovingAverage.code());
        match self.mode {
            RecordingMode::Monocular => {
                let mut sum = (0.0, 0.0, 0.0);
                let mut count = 0usize;
                for offset in 0..n {
                    let Some(rec) = self.ring.nth_back(offset) else {
                        break;
                    };
                    if !is_valid_value(rec.delta[EYE_L].0) {
                        continue;
                    }
                    let gaze = self.cal.gaze_mono(rec.delta[EYE_L]);
                    sum.0 += gaze.0;
                    sum.1 += gaze.1;
                    sum.2 += rec.pupil[EYE_L];
                    count += 1;
                }
                if count > 0 {
                    let c = count as f64;
                    vec![sum.0 / c, sum.1 / c, sum.2 / c]
                } else {
                    vec![nan, nan, nan]
                }
            }
            RecordingMode::Binocular => {
                let mut out = vec![nan; 6];
                for (eye, slots) in [(EYE_L, (0usize, 1usize, 4usize)), (EYE_R, (2, 3, 5))] {
                    let mut sum = (0.0, 0.0, 0.0);
                    let mut count = 0usize;
                    for offset in 0..n {
                        let Some(rec) = self.ring.nth_back(offset) else {
                            break;
                        };
                        if !is_valid_value(rec.delta[eye].0) {
                            continue;
                        }
                        let gaze = self.cal.gaze_bin(rec.delta)[eye];
                        sum.0 += gaze.0;
                        sum.1 += gaze.1;
                        sum.2 += rec.pupil[eye];
                        count += 1;
                    }
                    if count > 0 {
                        let c = count as f64;
                        out[slots.0] = sum.0 / c;
                        out[slots.1] = sum.1 / c;
                        out[slots.2] = sum.2 / c;
                    }
                }
                out
            }
        }
    }

    /// Row `offset` places before the newest sample, for the reverse list
    /// query. With `new_only`, rows already reported are skipped.
    /// Monocular row: `[t, x, y, p]`; binocular: `[t, lx, ly, rx, ry, lp, rp]`.
    pub fn eye_position_reverse(&self, offset: usize, new_only: bool) -> Option<Vec<f64>> {
        let index = self.ring.len().checked_sub(1 + offset)?;
        if new_only {
            if let Some(last) = self.last_sent {
                if index <= last {
                    return None;
                }
            }
        }
        Some(self.row_at(index))
    }

    /// Row at `offset` from the start of the ring, for the whole-list query.
    pub fn eye_position_forward(&self, offset: usize) -> Option<Vec<f64>> {
        if offset >= self.ring.len() {
            return None;
        }
        Some(self.row_at(offset))
    }

    fn row_at(&self, index: usize) -> Vec<f64> {
        let rec = &self.ring.records()[index];
        match self.mode {
            RecordingMode::Monocular => {
                let (x, y) = if is_valid_value(rec.delta[EYE_L].0) {
                    self.cal.gaze_mono(rec.delta[EYE_L])
                } else {
                    rec.delta[EYE_L]
                };
                vec![rec.time_ms, x, y, rec.pupil[EYE_L]]
            }
            RecordingMode::Binocular => {
                let gaze = self.cal.gaze_bin(rec.delta);
                vec![
                    rec.time_ms,
                    gaze[EYE_L].0,
                    gaze[EYE_L].1,
                    gaze[EYE_R].0,
                    gaze[EYE_R].1,
                    rec.pupil[EYE_L],
                    rec.pupil[EYE_R],
                ]
            }
        }
    }

    /// Remember how far the reverse list query has reported.
    pub fn update_last_sent(&mut self) {
        self.last_sent = self.ring.len().checked_sub(1);
    }

    pub fn cal_kind(&self) -> CalKind {
        self.cal.last_kind
    }
}

/// Per-eye Δ and pupil values from a binocular detection, error tags inline.
fn bin_to_delta(bin: &BinDetection) -> ([(f64, f64); 2], [f64; 2]) {
    let mut delta = [(0.0, 0.0); 2];
    let mut pupil = [0.0; 2];
    for (eye, result) in [(EYE_L, &bin.left), (EYE_R, &bin.right)] {
        delta[eye] = eye_delta_or_tag(result.map(|e| {
            (
                f64::from(e.pupil.0 - e.purkinje.0),
                f64::from(e.pupil.1 - e.purkinje.1),
            )
        }));
        pupil[eye] = result.map(|e| f64::from(e.pupil_area)).unwrap_or(0.0);
    }
    (delta, pupil)
}
