//! Processing related to visual information.
//!
//! Holds the per-tick value types shared by the capture, motion and face
//! modules.

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub mod camera;
pub mod detector;
pub mod motion;

/// Identity-relevant feature vector produced by a face embedder.
pub type Embedding = Vec<f32>;

/// One captured image.
///
/// Owned by the tick that captured it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub image: RgbImage,
}

impl Frame {
    /// Wrap a decoded image captured now.
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self {
            index,
            timestamp: Utc::now(),
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Copy the region under `bbox`, clamped to the image.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<RgbImage> {
        let clamped = bbox.clamp(self.width(), self.height())?;
        Some(
            image::imageops::crop_imm(
                &self.image,
                clamped.x,
                clamped.y,
                clamped.width,
                clamped.height,
            )
            .to_image(),
        )
    }
}

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Box spanning two corners, `(x1, y1)` inclusive and `(x2, y2)` exclusive.
    pub fn from_corners(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width over height, 0 for a degenerate box.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    /// Intersection over union of two boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        let intersection = x2.saturating_sub(x1) as u64 * y2.saturating_sub(y1) as u64;
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        }
    }

    /// The part of the box inside a `width` x `height` image.
    pub fn clamp(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x2 = self.right().min(width);
        let y2 = self.bottom().min(height);
        if self.x >= x2 || self.y >= y2 {
            return None;
        }
        Some(Self::from_corners(self.x, self.y, x2, y2))
    }
}

/// Emotion label with a confidence in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    pub label: String,
    pub confidence: f32,
}

impl Emotion {
    pub fn new(label: &str, confidence: f32) -> Self {
        Self {
            label: label.to_string(),
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn bbox_geometry_test() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 10, 10);
        assert_eq!(a.area(), 100);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::new(20, 20, 5, 5)), 0.0);
        assert_eq!(BoundingBox::new(0, 0, 20, 10).aspect_ratio(), 2.0);
        assert_eq!(BoundingBox::new(0, 0, 20, 0).aspect_ratio(), 0.0);
    }

    #[test]
    fn bbox_clamp_test() {
        let b = BoundingBox::new(90, 40, 20, 20);
        assert_eq!(b.clamp(100, 50), Some(BoundingBox::new(90, 40, 10, 10)));
        assert_eq!(BoundingBox::new(120, 0, 5, 5).clamp(100, 50), None);
    }

    #[test]
    fn frame_crop_test() {
        let mut image = RgbImage::new(40, 30);
        image.put_pixel(12, 11, Rgb([255, 0, 0]));
        let frame = Frame::new(0, image);
        let crop = frame.crop(&BoundingBox::new(10, 10, 50, 5)).unwrap();
        assert_eq!((crop.width(), crop.height()), (30, 5));
        assert_eq!(crop.get_pixel(2, 1), &Rgb([255, 0, 0]));
        assert!(frame.crop(&BoundingBox::new(40, 0, 5, 5)).is_none());
    }
}
