//! Candidate box geometry.

use std::fmt;

/// An axis-aligned candidate box in corner form.
///
/// Coordinates are absolute pixels: `(x1, y1)` is the top-left corner,
/// `(x2, y2)` the bottom-right corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Convert a stored `[x, y, width, height]` box to corner form.
    pub fn from_xywh(xywh: [f32; 4]) -> Self {
        let [x, y, w, h] = xywh;
        Self::new(x, y, x + w, y + h)
    }

    pub fn to_xywh(&self) -> [f32; 4] {
        [self.x1, self.y1, self.width(), self.height()]
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// A box is degenerate when its aspect ratio cannot be computed.
    pub fn is_degenerate(&self) -> bool {
        let (w, h) = (self.width(), self.height());
        !(w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0)
    }

    /// Scale both axes independently, e.g. after resizing the image.
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    /// Squared distance between the two box centres.
    pub fn center_distance_sq(&self, other: &BBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        (ax - bx).powi(2) + (ay - by).powi(2)
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.1}, {:.1}, {:.1}, {:.1}]",
            self.x1, self.y1, self.x2, self.y2
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xywh_to_corners() {
        let b = BBox::from_xywh([10.0, 20.0, 40.0, 60.0]);
        assert_eq!(b.to_array(), [10.0, 20.0, 50.0, 80.0]);
        assert_eq!(b.to_xywh(), [10.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn test_degenerate() {
        assert!(!BBox::new(0.0, 0.0, 1.0, 1.0).is_degenerate());
        assert!(BBox::new(0.0, 0.0, 5.0, 0.0).is_degenerate());
        assert!(BBox::new(3.0, 0.0, 3.0, 4.0).is_degenerate());
        assert!(BBox::new(0.0, 0.0, f32::NAN, 4.0).is_degenerate());
    }

    #[test]
    fn test_center_distance() {
        let a = BBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BBox::new(3.0, 4.0, 5.0, 6.0);
        assert_eq!(a.center_distance_sq(&b), 9.0 + 16.0);
    }
}
