//! Parameter adjustment menu.
//!
//! A cursor over the detection parameters plus any camera-specific entries.
//! Up/down move the cursor, left/right adjust the selected value; the
//! experiment host drives the same paths through the `key_*` protocol
//! commands and reads the selected entry back with `getCurrMenu`.

use crate::camera::CameraDevice;
use crate::params::TrackingParams;

const GENERAL_LABELS: [&str; 7] = [
    "PupilThreshold",
    "PurkinjeThreshold",
    "MinPupilWidth",
    "MaxPupilWidth",
    "PurkinjeSearchArea",
    "PurkinjeExcludeArea",
    "MorphologicalTrans",
];

pub struct Menu {
    position: usize,
}

impl Menu {
    pub fn new() -> Self {
        Self { position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn total_items(&self, camera: &dyn CameraDevice) -> usize {
        GENERAL_LABELS.len() + camera.custom_menu().len()
    }

    pub fn move_up(&mut self) {
        if self.position > 0 {
            self.position -= 1;
        }
    }

    pub fn move_down(&mut self, camera: &dyn CameraDevice) {
        if self.position + 1 < self.total_items(camera) {
            self.position += 1;
        }
    }

    /// `Label(value)` string for the selected entry.
    pub fn current_label(&self, params: &TrackingParams, camera: &dyn CameraDevice) -> String {
        match self.position {
            0 => format!("PupilThreshold({})", params.threshold),
            1 => format!("PurkinjeThreshold({})", params.purkinje_threshold),
            2 => format!("MinPupilWidth({})", params.min_pupil_width),
            3 => format!("MaxPupilWidth({})", params.max_pupil_width),
            4 => format!("PurkinjeSearchArea({})", params.purkinje_search_area),
            5 => format!("PurkinjeExcludeArea({})", params.purkinje_exclude_area),
            6 => format!("MorphologicalTrans({})", params.morph_trans),
            n => {
                let custom = camera.custom_menu();
                custom
                    .get(n - GENERAL_LABELS.len())
                    .map(|(label, value)| format!("{label}({value})"))
                    .unwrap_or_default()
            }
        }
    }

    /// Adjust the selected entry by `delta` (±1 from the arrow keys).
    pub fn adjust(
        &mut self,
        params: &mut TrackingParams,
        camera: &mut dyn CameraDevice,
        delta: i32,
    ) {
        match self.position {
            0 => params.adjust_threshold(delta),
            1 => params.adjust_purkinje_threshold(delta),
            2 => params.adjust_min_pupil_width(delta),
            3 => params.adjust_max_pupil_width(delta),
            4 => params.adjust_purkinje_search_area(delta),
            5 => params.adjust_purkinje_exclude_area(delta),
            6 => params.adjust_morph_trans(delta),
            n => camera.adjust_custom_menu(n - GENERAL_LABELS.len(), delta),
        }
    }

    /// All entries, for operator display.
    pub fn labels(&self, params: &TrackingParams, camera: &dyn CameraDevice) -> Vec<String> {
        let mut labels = vec![
            format!("PupilThreshold({})", params.threshold),
            format!("PurkinjeThreshold({})", params.purkinje_threshold),
            format!("MinPupilWidth({})", params.min_pupil_width),
            format!("MaxPupilWidth({})", params.max_pupil_width),
            format!("PurkinjeSearchArea({})", params.purkinje_search_area),
            format!("PurkinjeExcludeArea({})", params.purkinje_exclude_area),
            format!("MorphologicalTrans({})", params.morph_trans),
        ];
        for (label, value) in camera.custom_menu() {
            labels.push(format!("{label}({value})"));
        }
        labels
    }
}

impl Default for Menu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated::SimulatedCamera;

    fn params() -> TrackingParams {
        TrackingParams {
            threshold: 55,
            purkinje_threshold: 240,
            min_pupil_width: 10,
            max_pupil_width: 30,
            purkinje_search_area: 60,
            purkinje_exclude_area: 20,
            morph_trans: 0,
        }
    }

    #[test]
    fn test_cursor_stays_in_bounds() {
        let camera = SimulatedCamera::new();
        let mut menu = Menu::new();
        menu.move_up();
        assert_eq!(menu.position(), 0);
        for _ in 0..100 {
            menu.move_down(&camera);
        }
        // Seven general entries plus one custom entry.
        assert_eq!(menu.position(), 7);
    }

    #[test]
    fn test_label_reflects_adjustment() {
        let mut camera = SimulatedCamera::new();
        let mut menu = Menu::new();
        let mut p = params();
        assert_eq!(menu.current_label(&p, &camera), "PupilThreshold(55)");
        menu.adjust(&mut p, &mut camera, 1);
        assert_eq!(menu.current_label(&p, &camera), "PupilThreshold(56)");
    }

    #[test]
    fn test_custom_entry_is_forwarded() {
        let mut camera = SimulatedCamera::new();
        let mut menu = Menu::new();
        let mut p = params();
        for _ in 0..7 {
            menu.move_down(&camera);
        }
        let before = menu.current_label(&p, &camera);
        menu.adjust(&mut p, &mut camera, 1);
        let after = menu.current_label(&p, &camera);
        assert_ne!(before, after);
        assert!(after.starts_with("SimPupilRadius("));
    }
}
