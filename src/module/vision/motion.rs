//! Motion detection by differencing consecutive frames.
//!
//! Each frame is converted to grayscale and smoothed, then compared with the
//! smoothed previous frame. Pixels whose difference exceeds the intensity
//! cutoff form a binary mask, the mask is dilated so neighbouring pixels merge,
//! and connected regions smaller than the area threshold are dropped as noise.

use image::{imageops, RgbImage};
use ndarray::{s, Array2, Zip};
use serde::Serialize;

use super::{BoundingBox, Frame};
use crate::module::error::CaptureError;
use crate::module::util::conf::Motion;

/// Motion found between the current and the previous frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MotionReport {
    pub detected: bool,
    pub total_area: f64,
    pub regions: Vec<BoundingBox>,
}

/// Compares every frame with the one before it.
///
/// Only the smoothed grayscale version of the last frame is kept.
pub struct FrameDifferencer {
    conf: Motion,
    previous: Option<Array2<u8>>,
}

impl FrameDifferencer {
    pub fn new(conf: Motion) -> Self {
        Self {
            conf,
            previous: None,
        }
    }

    /// Compare `frame` with the previous one and make it the new reference.
    ///
    /// The first frame, and the first frame after a resolution change, report
    /// no motion.
    pub fn update(&mut self, frame: &Frame) -> Result<MotionReport, CaptureError> {
        if frame.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        let current = self.smooth(&frame.image)?;
        let report = match self.previous.take() {
            Some(previous) if previous.dim() == current.dim() => {
                self.compare(&previous, &current)
            }
            Some(_) => {
                log::debug!("Frame size changed. Motion reference restarted.");
                MotionReport::default()
            }
            None => MotionReport::default(),
        };
        // The reference slides forward even on quiet ticks.
        self.previous = Some(current);
        Ok(report)
    }

    /// Forget the reference frame.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    fn smooth(&self, image: &RgbImage) -> Result<Array2<u8>, CaptureError> {
        let gray = imageops::grayscale(image);
        let gray = match self.conf.blur_kernel {
            0 | 1 => gray,
            kernel => imageops::blur(&gray, kernel_sigma(kernel)),
        };
        let (width, height) = gray.dimensions();
        Array2::from_shape_vec((height as usize, width as usize), gray.into_raw())
            .map_err(|e| CaptureError::Failure(e.to_string()))
    }

    fn compare(&self, previous: &Array2<u8>, current: &Array2<u8>) -> MotionReport {
        let cutoff = self.conf.diff_threshold;
        let mut mask = Zip::from(previous)
            .and(current)
            .map_collect(|&a, &b| a.abs_diff(b) > cutoff);
        for _ in 0..self.conf.dilate_iterations {
            mask = dilate(&mask);
        }

        let mut report = MotionReport::default();
        for (bbox, area) in external_regions(&mask) {
            let area = area as f64;
            if area < self.conf.threshold_area {
                continue;
            }
            report.total_area += area;
            report.regions.push(bbox);
        }
        report.detected = !report.regions.is_empty();
        if report.detected {
            log::trace!(
                "Motion regions: {}, area: {}",
                report.regions.len(),
                report.total_area
            );
        }
        report
    }
}

/// Gaussian sigma for a square kernel of side `kernel`, as OpenCV derives it.
fn kernel_sigma(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// One pass of 3x3 binary dilation.
fn dilate(mask: &Array2<bool>) -> Array2<bool> {
    let (rows, cols) = mask.dim();
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let (r0, r1) = (r.saturating_sub(1), (r + 1).min(rows - 1));
        let (c0, c1) = (c.saturating_sub(1), (c + 1).min(cols - 1));
        mask.slice(s![r0..=r1, c0..=c1]).iter().any(|&v| v)
    })
}

/// 8-connected regions of the mask with their bounding box and pixel area.
fn external_regions(mask: &Array2<bool>) -> Vec<(BoundingBox, u64)> {
    let (rows, cols) = mask.dim();
    let mut visited = Array2::from_elem((rows, cols), false);
    let mut regions = vec![];
    let mut stack = vec![];

    for ((r, c), &set) in mask.indexed_iter() {
        if !set || visited[[r, c]] {
            continue;
        }
        visited[[r, c]] = true;
        stack.push((r, c));
        let (mut top, mut bottom, mut left, mut right) = (r, r, c, c);
        let mut area = 0u64;
        while let Some((y, x)) = stack.pop() {
            area += 1;
            top = top.min(y);
            bottom = bottom.max(y);
            left = left.min(x);
            right = right.max(x);
            for ny in y.saturating_sub(1)..=(y + 1).min(rows - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(cols - 1) {
                    if mask[[ny, nx]] && !visited[[ny, nx]] {
                        visited[[ny, nx]] = true;
                        stack.push((ny, nx));
                    }
                }
            }
        }
        let bbox = BoundingBox::from_corners(
            left as u32,
            top as u32,
            right as u32 + 1,
            bottom as u32 + 1,
        );
        regions.push((bbox, area));
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::util::conf::Config;
    use image::Rgb;

    fn differencer() -> FrameDifferencer {
        FrameDifferencer::new(Config::default().motion)
    }

    fn frame_with_square(index: u64, square: Option<(u32, u32, u32)>) -> Frame {
        let mut image = RgbImage::from_pixel(160, 120, Rgb([20, 20, 20]));
        if let Some((x0, y0, side)) = square {
            for y in y0..y0 + side {
                for x in x0..x0 + side {
                    image.put_pixel(x, y, Rgb([250, 250, 250]));
                }
            }
        }
        Frame::new(index, image)
    }

    #[test]
    fn first_frame_reports_no_motion() {
        let mut diff = differencer();
        let report = diff.update(&frame_with_square(0, Some((60, 40, 40)))).unwrap();
        assert_eq!(report, MotionReport::default());
    }

    #[test]
    fn identical_frames_report_no_motion() {
        let mut diff = differencer();
        let frame = frame_with_square(0, Some((10, 10, 30)));
        for _ in 0..3 {
            let report = diff.update(&frame).unwrap();
            assert!(!report.detected);
            assert_eq!(report.total_area, 0.0);
            assert!(report.regions.is_empty());
        }
    }

    #[test]
    fn bright_region_is_detected() {
        let mut diff = differencer();
        diff.update(&frame_with_square(0, None)).unwrap();
        let report = diff.update(&frame_with_square(1, Some((60, 40, 40)))).unwrap();
        assert!(report.detected);
        assert_eq!(report.regions.len(), 1);
        // Blur and dilation widen the region by a few pixels per side.
        assert!(report.total_area >= 1600.0, "area {}", report.total_area);
        assert!(report.total_area <= 4000.0, "area {}", report.total_area);
        let region = report.regions[0];
        assert!(region.x <= 60 && region.y <= 40);
        assert!(region.right() >= 100 && region.bottom() >= 80);
    }

    #[test]
    fn small_change_is_noise() {
        let mut diff = differencer();
        diff.update(&frame_with_square(0, None)).unwrap();
        let report = diff.update(&frame_with_square(1, Some((80, 60, 4)))).unwrap();
        assert!(!report.detected);
        assert_eq!(report.total_area, 0.0);
    }

    #[test]
    fn reference_slides_forward() {
        let mut diff = differencer();
        diff.update(&frame_with_square(0, None)).unwrap();
        assert!(diff.update(&frame_with_square(1, Some((60, 40, 40)))).unwrap().detected);
        // Same content as the tick before: nothing moved since.
        assert!(!diff.update(&frame_with_square(2, Some((60, 40, 40)))).unwrap().detected);
    }

    #[test]
    fn resolution_change_restarts_reference() {
        let mut diff = differencer();
        diff.update(&frame_with_square(0, None)).unwrap();
        let other = Frame::new(1, RgbImage::from_pixel(80, 60, Rgb([250, 250, 250])));
        assert!(!diff.update(&other).unwrap().detected);
    }

    #[test]
    fn empty_frame_is_a_capture_error() {
        let mut diff = differencer();
        let res = diff.update(&Frame::new(0, RgbImage::new(0, 0)));
        assert!(matches!(res, Err(CaptureError::EmptyFrame)));
    }

    #[test]
    fn dilate_grows_one_pixel() {
        let mut mask = Array2::from_elem((5, 5), false);
        mask[[2, 2]] = true;
        let grown = dilate(&mask);
        assert_eq!(grown.iter().filter(|&&v| v).count(), 9);
        assert_eq!(external_regions(&grown), vec![(BoundingBox::new(1, 1, 3, 3), 9)]);
    }
}
