//! Rectangles on a page raster.

use std::cmp::Ordering;

use schemars::JsonSchema;

use crate::prelude::*;

/// An axis-aligned box in raster pixel coordinates.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build the smallest box containing all `(x, y)` points. Returns `None`
    /// for an empty iterator.
    pub fn enclosing<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (x0, y0, x0, y0);
        for (x, y) in iter {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Some(Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
    }

    /// One past the last column.
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// One past the last row.
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }

    /// Width over height. Degenerate boxes report 0.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            f64::from(self.width) / f64::from(self.height)
        }
    }

    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 > x0 && y1 > y0 {
            Some(BBox::new(x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }

    pub fn intersection_area(&self, other: &BBox) -> u64 {
        self.intersection(other).map(|b| b.area()).unwrap_or(0)
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BBox) -> f64 {
        let inter = self.intersection_area(other) as f64;
        let union = self.area() as f64 + other.area() as f64 - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Intersection area divided by the area of the smaller box.
    pub fn overlap_of_smaller(&self, other: &BBox) -> f64 {
        let smaller = self.area().min(other.area()) as f64;
        if smaller <= 0.0 {
            0.0
        } else {
            self.intersection_area(other) as f64 / smaller
        }
    }

    /// Euclidean distance between box centers.
    pub fn center_distance(&self, other: &BBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Multiply every coordinate by `factor`, rounding outward.
    pub fn scaled(&self, factor: f64) -> BBox {
        let x0 = (f64::from(self.x) * factor).floor();
        let y0 = (f64::from(self.y) * factor).floor();
        let x1 = (f64::from(self.right()) * factor).ceil();
        let y1 = (f64::from(self.bottom()) * factor).ceil();
        BBox::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    /// Clip to an image of the given size. Returns `None` if nothing is left.
    pub fn clamped(&self, width: u32, height: u32) -> Option<BBox> {
        self.intersection(&BBox::new(0, 0, width, height))
    }

    /// Sort key for document reading order: top-to-bottom, then
    /// left-to-right.
    pub fn reading_order(&self, other: &BBox) -> Ordering {
        (self.y, self.x).cmp(&(other.y, other.x))
    }
}

/// A rectangle expressed as fractions of a reference box. Values outside
/// `[0, 1]` reach past the box edges (for example "just below the image").
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct RelRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl RelRect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Project onto `reference`, then clip to a `raster_width` x
    /// `raster_height` image.
    pub fn resolve(
        &self,
        reference: &BBox,
        raster_width: u32,
        raster_height: u32,
    ) -> Option<BBox> {
        let rw = f64::from(reference.width);
        let rh = f64::from(reference.height);
        let x0 = f64::from(reference.x) + self.x * rw;
        let y0 = f64::from(reference.y) + self.y * rh;
        let x1 = x0 + self.width * rw;
        let y1 = y0 + self.height * rh;

        let clip = |v: f64, max: u32| v.round().clamp(0.0, f64::from(max)) as u32;
        let (x0, x1) = (clip(x0, raster_width), clip(x1, raster_width));
        let (y0, y1) = (clip(y0, raster_height), clip(y1, raster_height));
        if x1 > x0 && y1 > y0 {
            Some(BBox::new(x0, y0, x1 - x0, y1 - y0))
        } else {
            None
        }
    }
}
