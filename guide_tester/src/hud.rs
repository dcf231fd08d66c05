// THEORY:
// The HUD is the tester's presentation layer. It folds every drained `UiIntent`
// into overlay state, then paints that state onto each BGR output frame before the
// frame is written. Corner texts and the checklist position persist until replaced;
// toasts fade out after a fixed number of frames.

use assembly_guide::{ScanRegion, TextSlot, UiIntent};
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};
use std::collections::HashMap;

const TOAST_FRAMES: u32 = 45;
const LINE_HEIGHT: i32 = 22;
const MARGIN: i32 = 12;
const FONT_SCALE: f64 = 0.55;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Toast {
    text: String,
    frames_left: u32,
}

/// Overlay state accumulated from the intent queue.
#[derive(Debug)]
pub struct Hud {
    region: ScanRegion,
    show_region: bool,
    corners: HashMap<TextSlot, String>,
    progress: Option<(usize, usize)>,
    calibration: Option<u8>,
    toast: Option<Toast>,
}

impl Hud {
    pub fn new(region: ScanRegion) -> Self {
        Self {
            region,
            show_region: false,
            corners: HashMap::new(),
            progress: None,
            calibration: None,
            toast: None,
        }
    }

    pub fn apply(&mut self, intent: UiIntent) {
        match intent {
            UiIntent::ShowRegion(show) => self.show_region = show,
            UiIntent::SetCornerText { slot, text } => {
                self.corners.insert(slot, text);
            }
            UiIntent::SetProgress { current, max } => self.progress = Some((current, max)),
            UiIntent::SetCalibrationProgress(pct) => {
                // The bar is visible from the first step and gone once the loop completes.
                self.calibration = (pct < 100).then_some(pct);
            }
            UiIntent::Toast { mode, detail } => {
                let text = if detail.is_empty() {
                    mode.label().to_string()
                } else {
                    format!("{}: {detail}", mode.label())
                };
                self.toast = Some(Toast {
                    text,
                    frames_left: TOAST_FRAMES,
                });
            }
        }
    }

    fn progress_text(&self) -> Option<String> {
        self.progress
            .map(|(current, max)| format!("{current}/{max}"))
    }

    pub fn draw(&mut self, frame: &mut Mat) -> opencv::Result<()> {
        let width = frame.cols();
        let height = frame.rows();
        let white = Scalar::new(255.0, 255.0, 255.0, 0.0);

        if self.show_region {
            let region = Rect::new(
                self.region.x,
                self.region.y,
                self.region.width,
                self.region.height,
            );
            imgproc::rectangle(frame, region, Scalar::new(0.0, 255.0, 255.0, 0.0), 2, imgproc::LINE_8, 0)?;
        }

        if let Some(board) = self.corners.get(&TextSlot::Board) {
            draw_lines(frame, board, Point::new(MARGIN, MARGIN + LINE_HEIGHT), false, white)?;
        }
        if let Some(progress) = self.progress_text() {
            draw_lines(frame, &progress, Point::new(width - MARGIN, MARGIN + LINE_HEIGHT), true, white)?;
        }
        if let Some(component) = self.corners.get(&TextSlot::Component) {
            let lines = component.lines().count() as i32;
            let origin = Point::new(MARGIN, height - MARGIN - (lines - 1) * LINE_HEIGHT);
            draw_lines(frame, component, origin, false, white)?;
        }
        if let Some(status) = self.corners.get(&TextSlot::Status) {
            draw_lines(frame, status, Point::new(width - MARGIN, height - MARGIN), true, white)?;
        }

        if let Some(pct) = self.calibration {
            let bar_width = width / 2;
            let origin = Point::new(width / 4, height / 2 + 2 * LINE_HEIGHT);
            let outline = Rect::new(origin.x, origin.y, bar_width, LINE_HEIGHT / 2);
            let filled = Rect::new(origin.x, origin.y, bar_width * i32::from(pct) / 100, LINE_HEIGHT / 2);
            imgproc::rectangle(frame, filled, Scalar::new(0.0, 200.0, 0.0, 0.0), imgproc::FILLED, imgproc::LINE_8, 0)?;
            imgproc::rectangle(frame, outline, white, 1, imgproc::LINE_8, 0)?;
        }

        if let Some(toast) = self.toast.as_mut() {
            let origin = Point::new(width / 4, height / 2);
            imgproc::put_text(
                frame,
                &toast.text,
                origin,
                imgproc::FONT_HERSHEY_SIMPLEX,
                FONT_SCALE * 1.5,
                Scalar::new(0.0, 165.0, 255.0, 0.0),
                2,
                imgproc::LINE_AA,
                false,
            )?;
            toast.frames_left -= 1;
            if toast.frames_left == 0 {
                self.toast = None;
            }
        }

        Ok(())
    }
}

/// Draws `text` line by line starting at `origin` (the first baseline). Right
/// aligned text ends at `origin.x`.
fn draw_lines(frame: &mut Mat, text: &str, origin: Point, right_align: bool, color: Scalar) -> opencv::Result<()> {
    for (i, line) in text.lines().enumerate() {
        let mut baseline = 0;
        let size = imgproc::get_text_size(line, imgproc::FONT_HERSHEY_SIMPLEX, FONT_SCALE, 1, &mut baseline)?;
        let x = if right_align { origin.x - size.width } else { origin.x };
        let y = origin.y + i as i32 * LINE_HEIGHT;
        imgproc::put_text(
            frame,
            line,
            Point::new(x, y),
            imgproc::FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            color,
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assembly_guide::Mode;

    #[test]
    fn calibration_bar_hides_at_completion() {
        let mut hud = Hud::new(ScanRegion::new(0, 0, 10, 10));

        hud.apply(UiIntent::SetCalibrationProgress(1));
        assert_eq!(hud.calibration, Some(1));
        hud.apply(UiIntent::SetCalibrationProgress(100));
        assert_eq!(hud.calibration, None);
    }

    #[test]
    fn progress_shows_checklist_position() {
        let mut hud = Hud::new(ScanRegion::new(0, 0, 10, 10));
        assert_eq!(hud.progress_text(), None);

        hud.apply(UiIntent::SetProgress { current: 2, max: 5 });
        assert_eq!(hud.progress_text().as_deref(), Some("2/5"));
    }

    #[test]
    fn toast_text_includes_detail_when_present() {
        let mut hud = Hud::new(ScanRegion::new(0, 0, 10, 10));

        hud.apply(UiIntent::Toast {
            mode: Mode::Withdraw,
            detail: "R1".into(),
        });
        assert_eq!(hud.toast.as_ref().map(|t| t.text.as_str()), Some("Withdraw: R1"));

        hud.apply(UiIntent::Toast {
            mode: Mode::Completion,
            detail: String::new(),
        });
        assert_eq!(
            hud.toast.as_ref().map(|t| t.text.as_str()),
            Some("All components withdrawn")
        );
    }
}
