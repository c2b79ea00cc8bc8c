//! End-to-end calibration scenarios driven through the acquisition session.

use gazetrack::calib::EYE_L;
use gazetrack::clock::Clock;
use gazetrack::config::{CommonSettings, Settings};
use gazetrack::detect::EyeDetection;
use gazetrack::session::{FrameDetection, RunState, Session};
use std::collections::HashMap;
use std::path::Path;

fn settings(cam_w: u32, cam_h: u32) -> Settings {
    Settings {
        common: CommonSettings {
            threshold: 55,
            max_pupil_width: 30,
            min_pupil_width: 10,
            purkinje_threshold: 240,
            purkinje_searcharea: 60,
            purkinje_excludearea: 20,
            binocular: 0,
            camera_width: cam_w,
            camera_height: cam_h,
            preview_width: 640,
            preview_height: 480,
            roi_width: cam_w,
            roi_height: cam_h,
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

fn session(dir: &Path) -> Session {
    Session::new(&settings(640, 480), dir, Clock::new())
}

fn detection_at(pupil: (f32, f32)) -> FrameDetection {
    FrameDetection::Mono(Ok(EyeDetection {
        pupil,
        purkinje: (100.0, 100.0),
        pupil_area: 300.0,
    }))
}

/// Spec scenario: 10 synthetic frames per target with
/// `pupil = (100 + 5·tx, 100 + 5·ty)` against a fixed Purkinje at (100,100)
/// recover `P_x = [5,0,0]`-inverse exactly — here the targets are chosen so
/// the affine `gaze = 5·Δ` holds, giving sub-0.01 calibration error.
#[test]
fn clean_monocular_five_point_calibration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut s = session(dir.path());

    let targets = [
        (100.0, 100.0),
        (900.0, 100.0),
        (100.0, 700.0),
        (900.0, 700.0),
        (500.0, 400.0),
    ];
    s.start_calibration((0, 0, 1024, 768), true);
    assert_eq!(s.state(), RunState::Calibrating);
    for &(tx, ty) in &targets {
        s.get_cal_sample(tx, ty, 10);
        for _ in 0..10 {
            let det = detection_at((100.0 + tx as f32 / 5.0, 100.0 + ty as f32 / 5.0));
            s.handle_frame(&det, 0.0, 0).expect("frame");
        }
    }
    s.end_calibration();
    assert_eq!(s.state(), RunState::Idle);
    assert!(s.cal.is_calibrated);

    let summary = s.cal.summary();
    assert!(summary.mean_error[EYE_L] < 0.01, "mean = {}", summary.mean_error[EYE_L]);
    assert!(summary.max_error[EYE_L] < 0.01, "max = {}", summary.max_error[EYE_L]);

    let p = &s.cal.params()[EYE_L];
    assert!((p.x[0] - 5.0).abs() < 1e-6);
    assert!(p.x[1].abs() < 1e-6);
    assert!(p.x[2].abs() < 1e-6);
    assert!(p.y[0].abs() < 1e-6);
    assert!((p.y[1] - 5.0).abs() < 1e-6);
    assert!(p.y[2].abs() < 1e-6);
}

/// Deleting one target's data refits on the remaining samples and drops the
/// matching `#CALPOINT` line from the next recording header.
#[test]
fn delete_cal_data_subset_refits_and_shrinks_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut s = session(dir.path());

    let targets = [(100.0, 100.0), (500.0, 400.0), (900.0, 700.0)];
    s.start_calibration((0, 0, 1024, 768), true);
    for &(tx, ty) in &targets {
        s.get_cal_sample(tx, ty, 10);
        for _ in 0..10 {
            let det = detection_at((100.0 + tx as f32 / 5.0, 100.0 + ty as f32 / 5.0));
            s.handle_frame(&det, 0.0, 0).expect("frame");
        }
    }
    s.end_calibration();
    assert_eq!(s.cal.samples().len(), 30);

    // First header: three calibration points.
    s.open_data_file("before.csv", true).expect("open");
    s.start_recording("").expect("start");
    s.stop_recording("").expect("stop");
    s.close_data_file().expect("close");
    let before = std::fs::read_to_string(dir.path().join("before.csv")).expect("read");
    assert_eq!(before.matches("#CALPOINT,").count(), 3);

    // Delete the middle target and refit on the remaining 20 samples.
    s.delete_cal_data(&[(500.0, 400.0)]);
    assert_eq!(s.cal.samples().len(), 20);
    assert!(s.cal.summary().mean_error[EYE_L] < 0.01);

    s.open_data_file("after.csv", true).expect("open");
    s.start_recording("").expect("start");
    s.stop_recording("").expect("stop");
    s.close_data_file().expect("close");
    let after = std::fs::read_to_string(dir.path().join("after.csv")).expect("read");
    assert_eq!(after.matches("#CALPOINT,").count(), 2);
    assert!(!after.contains("#CALPOINT,500.000000,400.000000"));
}

/// Validation recomputes the summary against the existing mapping without
/// refitting the parameters.
#[test]
fn validation_does_not_refit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut s = session(dir.path());

    s.start_calibration((0, 0, 1024, 768), true);
    for &(tx, ty) in &[(100.0, 100.0), (900.0, 100.0), (500.0, 700.0)] {
        s.get_cal_sample(tx, ty, 5);
        for _ in 0..5 {
            let det = detection_at((100.0 + tx as f32 / 5.0, 100.0 + ty as f32 / 5.0));
            s.handle_frame(&det, 0.0, 0).expect("frame");
        }
    }
    s.end_calibration();
    let params_before = s.cal.params()[EYE_L];

    // Validate with a systematic 5-pixel offset in x.
    s.start_validation((0, 0, 1024, 768));
    s.get_cal_sample(500.0, 400.0, 5);
    for _ in 0..5 {
        let det = detection_at((100.0 + 1.0 + 500.0 / 5.0, 100.0 + 400.0 / 5.0));
        s.handle_frame(&det, 0.0, 0).expect("frame");
    }
    s.end_validation();

    let params_after = s.cal.params()[EYE_L];
    assert_eq!(params_before.x, params_after.x);
    assert_eq!(params_before.y, params_after.y);
    // The offset shows up as validation error: 5 pixels on screen.
    let summary = s.cal.summary();
    assert!((summary.mean_error[EYE_L] - 5.0).abs() < 0.01);
    assert!((summary.max_error[EYE_L] - 5.0).abs() < 0.01);
}
