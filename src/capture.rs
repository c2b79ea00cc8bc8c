//! Frame acquisition, with an optional capture thread.
//!
//! When enabled, a worker thread polls the camera and publishes each frame
//! into a shared slot, raising a "new frame available" flag with release
//! semantics; the main loop consumes the flag with acquire semantics, so the
//! reader always sees a complete frame. A shutdown flag stops the worker at
//! the next iteration boundary and the owner joins it before the camera is
//! released.
//!
//! Without the thread the main loop polls the camera directly; both paths go
//! through [`FrameSource`]. The camera itself lives behind a shared handle
//! either way, so menu access and parameter write-back keep working while
//! capture runs.

use crate::camera::CameraDevice;
use crate::error::{AppResult, GazeError};
use image::GrayImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Shared camera handle.
pub type SharedCamera = Arc<Mutex<Box<dyn CameraDevice>>>;

pub fn share_camera(camera: Box<dyn CameraDevice>) -> SharedCamera {
    Arc::new(Mutex::new(camera))
}

struct Shared {
    frame: Mutex<(GrayImage, u32)>,
    new_frame: AtomicBool,
    shutdown: AtomicBool,
}

/// Threaded capture: owns the worker while it runs.
pub struct CaptureThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    pub fn spawn(camera: SharedCamera, width: u32, height: u32) -> Self {
        let shared = Arc::new(Shared {
            frame: Mutex::new((GrayImage::new(width, height), 0)),
            new_frame: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            let mut scratch = GrayImage::new(width, height);
            while !worker_shared.shutdown.load(Ordering::Acquire) {
                let grabbed = {
                    let Ok(mut cam) = camera.lock() else {
                        break;
                    };
                    match cam.grab(&mut scratch) {
                        Ok(true) => Some(cam.specific_data().unwrap_or(0)),
                        Ok(false) => None,
                        Err(err) => {
                            log::error!("capture thread: grab failed, exiting ({err})");
                            return;
                        }
                    }
                };
                match grabbed {
                    Some(meta) => {
                        if let Ok(mut slot) = worker_shared.frame.lock() {
                            slot.0.clone_from(&scratch);
                            slot.1 = meta;
                        }
                        worker_shared.new_frame.store(true, Ordering::Release);
                    }
                    None => std::thread::yield_now(),
                }
            }
        });
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Copy the newest frame into `dst` if one arrived since the last call,
    /// returning its camera metadata word.
    pub fn try_fetch(&self, dst: &mut GrayImage) -> Option<u32> {
        if !self.shared.new_frame.swap(false, Ordering::Acquire) {
            return None;
        }
        match self.shared.frame.lock() {
            Ok(slot) => {
                dst.clone_from(&slot.0);
                Some(slot.1)
            }
            Err(_) => None,
        }
    }

    /// Stop and join the worker.
    pub fn stop(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Frame source used by the main loop: either the capture thread or the
/// camera polled inline.
pub enum FrameSource {
    Direct(SharedCamera),
    Threaded(CaptureThread),
}

impl FrameSource {
    /// Poll for a frame; `Ok(Some(meta))` when `dst` holds a new one, where
    /// `meta` is the camera's per-frame metadata word (0 if unsupported).
    pub fn poll(&mut self, dst: &mut GrayImage) -> AppResult<Option<u32>> {
        match self {
            FrameSource::Direct(camera) => {
                let mut cam = camera
                    .lock()
                    .map_err(|_| GazeError::Camera("camera mutex poisoned".into()))?;
                if cam.grab(dst)? {
                    Ok(Some(cam.specific_data().unwrap_or(0)))
                } else {
                    Ok(None)
                }
            }
            FrameSource::Threaded(thread) => Ok(thread.try_fetch(dst)),
        }
    }

    /// Tear down the capture side (joins the worker thread if any).
    pub fn stop(self) {
        if let FrameSource::Threaded(thread) = self {
            thread.stop();
        }
    }
}
