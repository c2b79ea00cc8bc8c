//! Recording, overflow and data-file round-trip scenarios.

use gazetrack::calib::EYE_L;
use gazetrack::clock::Clock;
use gazetrack::config::{CommonSettings, Settings};
use gazetrack::detect::EyeDetection;
use gazetrack::ring::DEFAULT_RING_CAPACITY;
use gazetrack::session::{FrameDetection, RunState, Session};
use std::collections::HashMap;
use std::path::Path;

fn settings() -> Settings {
    Settings {
        common: CommonSettings {
            threshold: 55,
            max_pupil_width: 30,
            min_pupil_width: 10,
            purkinje_threshold: 240,
            purkinje_searcharea: 60,
            purkinje_excludearea: 20,
            binocular: 0,
            camera_width: 640,
            camera_height: 480,
            preview_width: 640,
            preview_height: 480,
            roi_width: 640,
            roi_height: 480,
            show_detectionerror_msg: 0,
            port_send: 10001,
            port_recv: 10000,
            delay_correction: 0,
            output_pupilsize: 1,
            usbio_board: String::new(),
            usbio_ad: String::new(),
            usbio_di: String::new(),
            morph_trans: 0,
        },
        camera: HashMap::new(),
    }
}

fn calibrated_session(dir: &Path) -> Session {
    let mut s = Session::new(&settings(), dir, Clock::new());
    s.start_calibration((0, 0, 1024, 768), true);
    for &(tx, ty) in &[(100.0, 100.0), (900.0, 100.0), (500.0, 700.0)] {
        s.get_cal_sample(tx, ty, 5);
        for _ in 0..5 {
            let det = detection_at((100.0 + tx as f32 / 5.0, 100.0 + ty as f32 / 5.0));
            s.handle_frame(&det, 0.0, 0).expect("frame");
        }
    }
    s.end_calibration();
    s
}

fn detection_at(pupil: (f32, f32)) -> FrameDetection {
    FrameDetection::Mono(Ok(EyeDetection {
        pupil,
        purkinje: (100.0, 100.0),
        pupil_area: 300.0,
    }))
}

/// Spec scenario: fill the ring past capacity; exactly one overflow marker,
/// every sample row present, `#STOP_REC` terminates the file.
#[test]
fn ring_overflow_keeps_every_sample() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut s = calibrated_session(dir.path());
    s.open_data_file("overflow.csv", true).expect("open");
    s.start_recording("stress").expect("start");
    assert_eq!(s.state(), RunState::Recording);

    let total = DEFAULT_RING_CAPACITY + 1;
    let det = detection_at((110.0, 104.0));
    for i in 0..total {
        s.handle_frame(&det, i as f64, 0).expect("frame");
    }
    assert_eq!(s.ring.len(), 1);
    s.stop_recording("done").expect("stop");
    s.close_data_file().expect("close");

    let text = std::fs::read_to_string(dir.path().join("overflow.csv")).expect("read");
    assert_eq!(text.matches("#OVERFLOW_FLUSH_GAZEDATA,").count(), 1);
    let rows = text
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .count();
    assert_eq!(rows, total);
    assert!(text.trim_end().ends_with("#STOP_REC"));
}

/// Spec scenario: 2100 messages of 128 bytes force at least one eager
/// message flush; all messages appear in the file in insertion order.
#[test]
fn message_overflow_preserves_count_and_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut s = calibrated_session(dir.path());
    s.open_data_file("messages.csv", true).expect("open");
    s.start_recording("").expect("start");

    let payload = "m".repeat(120);
    for i in 0..2100 {
        s.insert_message(&format!("{i:04}_{payload}")).expect("insert");
    }
    s.stop_recording("").expect("stop");
    s.close_data_file().expect("close");

    let text = std::fs::read_to_string(dir.path().join("messages.csv")).expect("read");
    assert!(text.matches("#OVERFLOW_FLUSH_MESSAGES,").count() >= 1);

    let ids: Vec<usize> = text
        .lines()
        .filter(|l| l.starts_with("#MESSAGE,"))
        .filter_map(|l| l.split(',').nth(2))
        .filter_map(|m| m.split('_').next())
        .filter_map(|id| id.parse().ok())
        .collect();
    assert_eq!(ids.len(), 2100);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "order not preserved");
}

/// Round-trip: sample rows and error mnemonics written to the file parse
/// back to the same values at printed precision, with messages in order.
#[test]
fn data_file_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut s = calibrated_session(dir.path());
    s.open_data_file("trip.csv", true).expect("open");
    s.start_recording("begin").expect("start");

    use gazetrack::detect::DetectFailure;
    let frames: Vec<(FrameDetection, f64)> = vec![
        (detection_at((110.0, 104.0)), 8.125),
        (
            FrameDetection::Mono(Err(DetectFailure::NoPurkinjeCandidate)),
            16.25,
        ),
        (detection_at((112.5, 101.25)), 24.375),
    ];
    let expected_gaze: Vec<Option<(f64, f64)>> = frames
        .iter()
        .map(|(det, _)| match det {
            FrameDetection::Mono(Ok(eye)) => Some(s.cal.gaze_mono((
                f64::from(eye.pupil.0) - 100.0,
                f64::from(eye.pupil.1) - 100.0,
            ))),
            _ => None,
        })
        .collect();
    for (det, t) in &frames {
        s.handle_frame(det, *t, 0).expect("frame");
    }
    s.insert_message("first").expect("msg");
    s.insert_message("second").expect("msg");
    s.stop_recording("end").expect("stop");
    s.close_data_file().expect("close");

    let text = std::fs::read_to_string(dir.path().join("trip.csv")).expect("read");
    let rows: Vec<&str> = text
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    assert_eq!(rows.len(), 3);

    for (i, row) in rows.iter().enumerate() {
        let fields: Vec<&str> = row.split(',').collect();
        let t: f64 = fields[0].parse().expect("time");
        assert!((t - frames[i].1).abs() < 5e-4, "time at printed precision");
        match expected_gaze[i] {
            Some((gx, gy)) => {
                let x: f64 = fields[1].parse().expect("x");
                let y: f64 = fields[2].parse().expect("y");
                assert!((x - gx).abs() < 0.05 + 1e-9);
                assert!((y - gy).abs() < 0.05 + 1e-9);
                let p: f64 = fields[3].parse().expect("pupil");
                assert!((p - 300.0).abs() < 0.05);
            }
            None => {
                assert_eq!(fields[1], "NOPURKINJE");
                assert_eq!(fields[2], "NOPURKINJE");
                assert_eq!(fields[3], "FAIL");
            }
        }
    }

    // Messages come after the samples, in insertion order, before #STOP_REC.
    let message_lines: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("#MESSAGE,") && !l.starts_with("#MESSAGE,0,"))
        .collect();
    assert_eq!(message_lines.len(), 3); // first, second, trailing "end"
    assert!(message_lines[0].ends_with(",first"));
    assert!(message_lines[1].ends_with(",second"));
    assert!(message_lines[2].ends_with(",end"));
    assert!(text.contains("#MESSAGE,0,begin"));
}
