//! Append-only textual data file.
//!
//! Layout: a fixed header written at open, one `#START_REC` block per
//! recording (date stamp, optional message, affine coefficients, and the
//! last calibration's per-point errors), sample rows, buffered `#MESSAGE`
//! lines, and `#STOP_REC`. Error frames carry mnemonic strings in the
//! coordinate columns. The file is committed with an explicit flush at open,
//! recording stop, close, and at every overflow marker, so a crash can cost
//! at most the current ring.

use crate::calib::{CalKind, CalPointStats, Calibration, EYE_L, EYE_R, NO_CALIBRATION_DATA};
use crate::config::RecordingMode;
use crate::detect::{is_valid_value, DetectFailure};
use crate::error::{AppResult, GazeError};
use crate::ring::GazeRecord;
use crate::usbio::UsbIo;
use chrono::{Datelike, Local, Timelike};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const FILE_MAGIC: &str = "#SimpleGazeTrackerDataFile";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Column options fixed at open time.
#[derive(Debug, Clone)]
pub struct DataFileOptions {
    pub mode: RecordingMode,
    pub output_pupil_size: bool,
    pub output_cam_meta: bool,
    pub usbio_header: Option<String>,
}

/// An open data file.
pub struct DataFile {
    writer: BufWriter<File>,
    path: PathBuf,
    options: DataFileOptions,
}

impl DataFile {
    /// Open `<data_dir>/<name>` and write the header. With `overwrite`
    /// false, an existing file of that name is first renamed to a
    /// non-colliding `<name>.<n>` sibling.
    pub fn open(
        data_dir: &Path,
        name: &str,
        overwrite: bool,
        options: DataFileOptions,
    ) -> AppResult<Self> {
        let path = data_dir.join(name);
        if !overwrite {
            rename_existing(&path)?;
        }
        let file = File::create(&path)
            .map_err(|e| GazeError::DataFile(format!("{}: {e}", path.display())))?;
        let mut data_file = Self {
            writer: BufWriter::new(file),
            path,
            options,
        };
        data_file.write_header()?;
        data_file.flush()?;
        Ok(data_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) -> AppResult<()> {
        writeln!(self.writer, "{FILE_MAGIC}")?;
        writeln!(self.writer, "#TRACKER_VERSION,{VERSION}")?;
        let cols = match (self.options.mode, self.options.output_pupil_size) {
            (RecordingMode::Monocular, false) => "X,Y",
            (RecordingMode::Monocular, true) => "X,Y,P",
            (RecordingMode::Binocular, false) => "LX,LY,RX,RY",
            (RecordingMode::Binocular, true) => "LX,LY,RX,RY,LP,RP",
        };
        write!(self.writer, "#DATAFORMAT,T,{cols}")?;
        if let Some(usbio) = &self.options.usbio_header {
            write!(self.writer, ",USBIO;{usbio}")?;
        }
        if self.options.output_cam_meta {
            write!(self.writer, ",C")?;
        }
        writeln!(self.writer)?;
        Ok(())
    }

    /// `#START_REC` block: date, optional start message, affine parameters
    /// and the last calibration's per-point accuracy/precision.
    pub fn write_start_block(&mut self, message: &str, cal: &Calibration) -> AppResult<()> {
        let now = Local::now();
        writeln!(
            self.writer,
            "#START_REC,{},{},{},{},{},{}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        )?;
        if !message.is_empty() {
            writeln!(self.writer, "#MESSAGE,0,{message}")?;
        }
        let p = cal.params();
        match self.options.mode {
            RecordingMode::Monocular => {
                let (x, y) = (&p[EYE_L].x, &p[EYE_L].y);
                writeln!(self.writer, "#XPARAM,{:.6},{:.6},{:.6}", x[0], x[1], x[2])?;
                writeln!(self.writer, "#YPARAM,{:.6},{:.6},{:.6}", y[0], y[1], y[2])?;
            }
            RecordingMode::Binocular => {
                writeln!(
                    self.writer,
                    "#XPARAM,{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
                    p[EYE_L].x[0], p[EYE_L].x[1], p[EYE_L].x[2],
                    p[EYE_R].x[0], p[EYE_R].x[1], p[EYE_R].x[2]
                )?;
                writeln!(
                    self.writer,
                    "#YPARAM,{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
                    p[EYE_L].y[0], p[EYE_L].y[1], p[EYE_L].y[2],
                    p[EYE_R].y[0], p[EYE_R].y[1], p[EYE_R].y[2]
                )?;
            }
        }
        for stats in cal.last_points() {
            self.write_cal_point(stats)?;
        }
        Ok(())
    }

    /// One `#CALPOINT` line: target x,y then 4 (monocular) or 8 (binocular)
    /// error columns, with the sentinel substituted per eye-pair.
    fn write_cal_point(&mut self, stats: &CalPointStats) -> AppResult<()> {
        write!(
            self.writer,
            "#CALPOINT,{:.6},{:.6}",
            stats.target.0, stats.target.1
        )?;
        let eyes: &[usize] = match self.options.mode {
            RecordingMode::Monocular => &[EYE_L],
            RecordingMode::Binocular => &[EYE_L, EYE_R],
        };
        for &eye in eyes {
            self.write_error_pair(stats.accuracy[eye])?;
        }
        for &eye in eyes {
            self.write_error_pair(stats.precision[eye])?;
        }
        writeln!(self.writer)?;
        Ok(())
    }

    fn write_error_pair(&mut self, pair: (f64, f64)) -> AppResult<()> {
        if pair.0 == NO_CALIBRATION_DATA {
            write!(self.writer, ",NO_CALIBRATION_DATA,NO_CALIBRATION_DATA")?;
        } else {
            write!(self.writer, ",{:.6},{:.6}", pair.0, pair.1)?;
        }
        Ok(())
    }

    /// Write the ring contents as sample rows and commit.
    pub fn flush_records(
        &mut self,
        records: &[GazeRecord],
        cal: &Calibration,
        usbio: Option<&dyn UsbIo>,
    ) -> AppResult<()> {
        for (i, rec) in records.iter().enumerate() {
            write!(self.writer, "{:.3},", rec.time_ms)?;
            match self.options.mode {
                RecordingMode::Monocular => self.write_mono_columns(rec, cal)?,
                RecordingMode::Binocular => self.write_bin_columns(rec, cal)?,
            }
            if let Some(io) = usbio {
                write!(self.writer, ",{}", io.format_sample(i))?;
            }
            if self.options.output_cam_meta {
                write!(self.writer, ",{}", rec.cam_meta)?;
            }
            writeln!(self.writer)?;
        }
        self.flush()
    }

    fn write_mono_columns(&mut self, rec: &GazeRecord, cal: &Calibration) -> AppResult<()> {
        if is_valid_value(rec.delta[EYE_L].0) {
            let gaze = cal.gaze_mono(rec.delta[EYE_L]);
            write!(self.writer, "{:.1},{:.1}", gaze.0, gaze.1)?;
            if self.options.output_pupil_size {
                write!(self.writer, ",{:.1}", rec.pupil[EYE_L])?;
            }
        } else {
            let tag = DetectFailure::mnemonic_for_code(rec.delta[EYE_L].0);
            write!(self.writer, "{tag},{tag}")?;
            if self.options.output_pupil_size {
                write!(self.writer, ",FAIL")?;
            }
        }
        Ok(())
    }

    fn write_bin_columns(&mut self, rec: &GazeRecord, cal: &Calibration) -> AppResult<()> {
        let gaze = cal.gaze_bin(rec.delta);
        for eye in [EYE_L, EYE_R] {
            if eye == EYE_R {
                write!(self.writer, ",")?;
            }
            if is_valid_value(rec.delta[eye].0) {
                write!(self.writer, "{:.1},{:.1}", gaze[eye].0, gaze[eye].1)?;
            } else {
                let tag = DetectFailure::mnemonic_for_code(rec.delta[eye].0);
                write!(self.writer, "{tag},{tag}")?;
            }
        }
        if self.options.output_pupil_size {
            for eye in [EYE_L, EYE_R] {
                if is_valid_value(rec.delta[eye].0) {
                    write!(self.writer, ",{:.1}", rec.pupil[eye])?;
                } else {
                    write!(self.writer, ",FAIL")?;
                }
            }
        }
        Ok(())
    }

    /// Ring overflow: the flushed block is already written; append the
    /// marker and commit.
    pub fn write_gaze_overflow_marker(&mut self, time_ms: f64) -> AppResult<()> {
        writeln!(self.writer, "#OVERFLOW_FLUSH_GAZEDATA,{:.3}", time_ms)?;
        self.flush()
    }

    /// Message-buffer overflow: write the drained buffer plus the marker.
    pub fn write_message_overflow(&mut self, contents: &str, time_ms: f64) -> AppResult<()> {
        self.writer.write_all(contents.as_bytes())?;
        writeln!(self.writer, "#OVERFLOW_FLUSH_MESSAGES,{:.3}", time_ms)?;
        self.flush()
    }

    /// End-of-recording block: buffered messages, optional trailing message,
    /// `#STOP_REC`, and a commit.
    pub fn write_stop_block(
        &mut self,
        messages: &str,
        trailing: Option<(f64, &str)>,
    ) -> AppResult<()> {
        if !messages.is_empty() {
            self.writer.write_all(messages.as_bytes())?;
        }
        if let Some((time_ms, msg)) = trailing {
            if !msg.is_empty() {
                writeln!(self.writer, "#MESSAGE,{:.3},{}", time_ms, msg)?;
            }
        }
        writeln!(self.writer, "#STOP_REC")?;
        self.flush()
    }

    /// Client-supplied settings lines; `/` separates lines on the wire.
    pub fn insert_settings(&mut self, settings: &str) -> AppResult<()> {
        for line in settings.split('/') {
            writeln!(self.writer, "{line}")?;
        }
        self.flush()
    }

    /// Detailed calibration/validation dump requested by the client.
    pub fn write_cal_detail_block(&mut self, cal: &Calibration) -> AppResult<()> {
        let now = Local::now();
        let (start_tag, end_tag) = match cal.last_kind {
            CalKind::Calibration => ("#START_DETAIL_CALDATA", "#END_DETAIL_CALDATA"),
            CalKind::Validation => ("#START_DETAIL_VALDATA", "#END_DETAIL_VALDATA"),
        };
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{}",
            start_tag,
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        )?;
        for s in cal.samples() {
            match self.options.mode {
                RecordingMode::Monocular => {
                    let gaze = cal.gaze_mono(s.delta[EYE_L]);
                    write!(
                        self.writer,
                        "#CALDATA,{:.1},{:.1},{:.2},{:.2},{:.2},{:.2}",
                        s.target.0, s.target.1, s.delta[EYE_L].0, s.delta[EYE_L].1, gaze.0, gaze.1
                    )?;
                    if self.options.output_pupil_size {
                        write!(self.writer, ",{:.2}", s.pupil[EYE_L])?;
                    }
                }
                RecordingMode::Binocular => {
                    let gaze = cal.gaze_bin(s.delta);
                    write!(
                        self.writer,
                        "#CALDATA,{:.1},{:.1},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2}",
                        s.target.0,
                        s.target.1,
                        s.delta[EYE_L].0,
                        s.delta[EYE_L].1,
                        s.delta[EYE_R].0,
                        s.delta[EYE_R].1,
                        gaze[EYE_L].0,
                        gaze[EYE_L].1,
                        gaze[EYE_R].0,
                        gaze[EYE_R].1
                    )?;
                    if self.options.output_pupil_size {
                        write!(self.writer, ",{:.2},{:.2}", s.pupil[EYE_L], s.pupil[EYE_R])?;
                    }
                }
            }
            writeln!(self.writer)?;
        }
        writeln!(self.writer, "{end_tag}")?;
        self.flush()
    }

    pub fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and close.
    pub fn close(mut self) -> AppResult<()> {
        self.flush()
    }
}

/// Rename an existing file at `path` to the first free `<path>.<n>`.
fn rename_existing(path: &Path) -> AppResult<()> {
    if !path.exists() {
        return Ok(());
    }
    for n in 0u32.. {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(format!(".{n}"));
        let candidate = PathBuf::from(candidate);
        if !candidate.exists() {
            std::fs::rename(path, &candidate)?;
            log::info!(
                "Existing data file renamed to {}",
                candidate.display()
            );
            return Ok(());
        }
    }
    Err(GazeError::DataFile(format!(
        "could not find a rename target for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::mono_delta;

    fn options(mode: RecordingMode, pupil: bool) -> DataFileOptions {
        DataFileOptions {
            mode,
            output_pupil_size: pupil,
            output_cam_meta: false,
            usbio_header: None,
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).expect("read data file")
    }

    fn calibrated_mono() -> Calibration {
        let mut cal = Calibration::new(RecordingMode::Monocular, 640, 480);
        cal.start((0, 0, 1024, 768), true);
        for &(tx, ty) in &[(0.0, 0.0), (100.0, 0.0), (0.0, 100.0)] {
            cal.register_target(tx, ty, 3);
            for _ in 0..3 {
                let (d, p) = mono_delta(tx / 2.0, ty / 2.0, 250.0);
                cal.push_sample(d, p);
            }
        }
        cal.finish_calibration();
        cal
    }

    #[test]
    fn test_header_layout_monocular() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = DataFile::open(dir.path(), "t.csv", true, options(RecordingMode::Monocular, true))
            .expect("open");
        drop(f);
        let text = read(&dir.path().join("t.csv"));
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("#SimpleGazeTrackerDataFile"));
        assert!(lines.next().expect("version").starts_with("#TRACKER_VERSION,"));
        assert_eq!(lines.next(), Some("#DATAFORMAT,T,X,Y,P"));
    }

    #[test]
    fn test_header_binocular_with_usbio_and_meta() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = DataFileOptions {
            mode: RecordingMode::Binocular,
            output_pupil_size: false,
            output_cam_meta: true,
            usbio_header: Some("AD0;DI".to_string()),
        };
        let f = DataFile::open(dir.path(), "t.csv", true, opts).expect("open");
        drop(f);
        let text = read(&dir.path().join("t.csv"));
        assert!(text.contains("#DATAFORMAT,T,LX,LY,RX,RY,USBIO;AD0;DI,C"));
    }

    #[test]
    fn test_rename_on_collision() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("t.csv"), "old contents").expect("seed");
        let f = DataFile::open(dir.path(), "t.csv", false, options(RecordingMode::Monocular, false))
            .expect("open");
        drop(f);
        assert_eq!(read(&dir.path().join("t.csv.0")), "old contents");
        assert!(read(&dir.path().join("t.csv")).starts_with(FILE_MAGIC));
    }

    #[test]
    fn test_overwrite_replaces_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("t.csv"), "old contents").expect("seed");
        let f = DataFile::open(dir.path(), "t.csv", true, options(RecordingMode::Monocular, false))
            .expect("open");
        drop(f);
        assert!(!dir.path().join("t.csv.0").exists());
        assert!(read(&dir.path().join("t.csv")).starts_with(FILE_MAGIC));
    }

    #[test]
    fn test_sample_rows_and_error_mnemonics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cal = calibrated_mono();
        let mut f =
            DataFile::open(dir.path(), "t.csv", true, options(RecordingMode::Monocular, true))
                .expect("open");
        let tag = f64::from(DetectFailure::NoPupilCandidate.code());
        let records = [
            GazeRecord {
                time_ms: 8.125,
                delta: [(10.0, 20.0), (0.0, 0.0)],
                pupil: [321.5, 0.0],
                cam_meta: 0,
            },
            GazeRecord {
                time_ms: 16.25,
                delta: [(tag, tag), (0.0, 0.0)],
                pupil: [0.0, 0.0],
                cam_meta: 0,
            },
        ];
        f.flush_records(&records, &cal, None).expect("flush");
        drop(f);
        let text = read(&dir.path().join("t.csv"));
        assert!(text.contains("8.125,20.0,40.0,321.5"), "rows: {text}");
        assert!(text.contains("16.250,NOPUPIL,NOPUPIL,FAIL"));
    }

    #[test]
    fn test_start_block_has_params_and_calpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cal = calibrated_mono();
        let mut f =
            DataFile::open(dir.path(), "t.csv", true, options(RecordingMode::Monocular, true))
                .expect("open");
        f.write_start_block("trial 1", &cal).expect("start block");
        f.write_stop_block("", None).expect("stop block");
        drop(f);
        let text = read(&dir.path().join("t.csv"));
        assert!(text.contains("#START_REC,"));
        assert!(text.contains("#MESSAGE,0,trial 1"));
        assert!(text.contains("#XPARAM,2.000000,"));
        assert!(text.contains("#YPARAM,"));
        assert_eq!(text.matches("#CALPOINT,").count(), 3);
        assert!(text.trim_end().ends_with("#STOP_REC"));
        // Monocular calibration points carry 2 + 4 numeric columns.
        let calpoint = text
            .lines()
            .find(|l| l.starts_with("#CALPOINT,"))
            .expect("calpoint line");
        assert_eq!(calpoint.split(',').count(), 7);
    }

    #[test]
    fn test_usbio_values_appended_per_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cal = calibrated_mono();
        let opts = DataFileOptions {
            mode: RecordingMode::Monocular,
            output_pupil_size: false,
            output_cam_meta: false,
            usbio_header: Some("AD0;DI".to_string()),
        };
        let mut f = DataFile::open(dir.path(), "t.csv", true, opts).expect("open");
        let records: Vec<GazeRecord> = (0..2)
            .map(|i| GazeRecord {
                time_ms: i as f64,
                delta: [(1.0, 1.0), (0.0, 0.0)],
                pupil: [10.0, 0.0],
                cam_meta: 0,
            })
            .collect();
        let io = crate::usbio::testing::FakeUsbIo::new();
        f.flush_records(&records, &cal, Some(&io)).expect("flush");
        drop(f);
        let text = read(&dir.path().join("t.csv"));
        assert!(text.contains(",0;0\n"), "rows: {text}");
        assert!(text.contains(",1;1\n"));
    }

    #[test]
    fn test_settings_slash_becomes_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f =
            DataFile::open(dir.path(), "t.csv", true, options(RecordingMode::Monocular, false))
                .expect("open");
        f.insert_settings("SCREEN_WIDTH,1024/SCREEN_HEIGHT,768")
            .expect("settings");
        drop(f);
        let text = read(&dir.path().join("t.csv"));
        assert!(text.contains("SCREEN_WIDTH,1024\nSCREEN_HEIGHT,768\n"));
    }

    #[test]
    fn test_cal_detail_block_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cal = calibrated_mono();
        let mut f =
            DataFile::open(dir.path(), "t.csv", true, options(RecordingMode::Monocular, false))
                .expect("open");
        f.write_cal_detail_block(&cal).expect("detail");
        drop(f);
        let text = read(&dir.path().join("t.csv"));
        assert!(text.contains("#START_DETAIL_CALDATA,"));
        assert_eq!(text.matches("#CALDATA,").count(), 9);
        assert!(text.contains("#END_DETAIL_CALDATA"));
    }
}
