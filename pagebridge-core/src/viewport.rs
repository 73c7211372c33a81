//! Viewport and coordinate mapping.
//!
//! Three spaces are involved: document space (page units at scale 1.0, top-left
//! origin), page pixel space (CSS pixels of the displayed page) and container
//! space (pointer coordinates, page pixels offset by the page origin). The
//! backing store is rasterized at `scale * device_pixel_ratio` but laid out at
//! `scale`, so visual size does not depend on display density.

use crate::PageSize;
use crate::TextRun;

const EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn is_valid(&self) -> bool {
        self.left.is_finite()
            && self.top.is_finite()
            && self.right.is_finite()
            && self.bottom.is_finite()
            && self.right >= self.left
            && self.bottom >= self.top
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left && point.x <= self.right && point.y >= self.top && point.y <= self.bottom
    }

    pub fn scaled(&self, factor: f32) -> Rect {
        Rect {
            left: self.left * factor,
            top: self.top * factor,
            right: self.right * factor,
            bottom: self.bottom * factor,
        }
    }
}

/// 2D affine transform in canvas order: `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine {
    pub const IDENTITY: Affine = Affine {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    pub const fn scale(sx: f32, sy: f32) -> Self {
        Affine {
            a: sx,
            b: 0.0,
            c: 0.0,
            d: sy,
            e: 0.0,
            f: 0.0,
        }
    }

    pub const fn translate(tx: f32, ty: f32) -> Self {
        Affine {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: tx,
            f: ty,
        }
    }

    /// `self` applied first, then `next`.
    pub fn then(&self, next: &Affine) -> Affine {
        Affine {
            a: next.a * self.a + next.c * self.b,
            b: next.b * self.a + next.d * self.b,
            c: next.a * self.c + next.c * self.d,
            d: next.b * self.c + next.d * self.d,
            e: next.a * self.e + next.c * self.f + next.e,
            f: next.b * self.e + next.d * self.f + next.f,
        }
    }

    pub fn apply(&self, point: Point) -> Point {
        Point {
            x: self.a * point.x + self.c * point.y + self.e,
            y: self.b * point.x + self.d * point.y + self.f,
        }
    }

    pub fn invert(&self) -> Option<Affine> {
        let det = self.a * self.d - self.b * self.c;
        if !det.is_finite() || det.abs() < f32::EPSILON {
            return None;
        }
        let inv = 1.0 / det;
        Some(Affine {
            a: self.d * inv,
            b: -self.b * inv,
            c: -self.c * inv,
            d: self.a * inv,
            e: (self.c * self.f - self.d * self.e) * inv,
            f: (self.b * self.e - self.a * self.f) * inv,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    pub scale: f32,
    pub device_pixel_ratio: f32,
    pub width_px: f32,
    pub height_px: f32,
}

impl ViewportState {
    pub fn new(width_px: f32, height_px: f32, device_pixel_ratio: f32) -> Self {
        Self {
            scale: 1.0,
            device_pixel_ratio: sanitize_ratio(device_pixel_ratio),
            width_px: width_px.max(0.0),
            height_px: height_px.max(0.0),
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn render_scale(&self) -> f32 {
        to_render_pixels(self.scale, self.device_pixel_ratio)
    }

    /// Same geometry for rendering purposes.
    pub fn matches(&self, other: &ViewportState) -> bool {
        (self.scale - other.scale).abs() < EPSILON
            && (self.device_pixel_ratio - other.device_pixel_ratio).abs() < EPSILON
            && (self.width_px - other.width_px).abs() < EPSILON
            && (self.height_px - other.height_px).abs() < EPSILON
    }

    pub fn to_pixels(&self, point: Point) -> Point {
        Point::new(point.x * self.scale, point.y * self.scale)
    }

    pub fn to_document(&self, point: Point) -> Point {
        if self.scale <= 0.0 {
            return point;
        }
        Point::new(point.x / self.scale, point.y / self.scale)
    }

    /// Top-left corner of the displayed page inside the container. Pages are
    /// centered horizontally, with half the horizontal padding as top margin.
    pub fn page_origin(&self, geometry: &PageGeometry, horizontal_padding: f32) -> Point {
        let margin = (horizontal_padding / 2.0).max(0.0);
        let x = ((self.width_px - geometry.css_width) / 2.0).max(margin);
        Point::new(x, margin)
    }

    /// Document space to container space.
    pub fn page_transform(&self, origin: Point) -> Affine {
        Affine::scale(self.scale, self.scale).then(&Affine::translate(origin.x, origin.y))
    }

    /// Container pointer coordinates to page pixel space.
    pub fn pointer_to_page(&self, pointer: Point, origin: Point) -> Point {
        Point::new(pointer.x - origin.x, pointer.y - origin.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub css_width: f32,
    pub css_height: f32,
    pub backing_width: u32,
    pub backing_height: u32,
}

pub fn page_geometry(page: PageSize, viewport: &ViewportState) -> PageGeometry {
    let render_scale = viewport.render_scale();
    PageGeometry {
        css_width: page.width * viewport.scale,
        css_height: page.height * viewport.scale,
        backing_width: to_backing(page.width * render_scale),
        backing_height: to_backing(page.height * render_scale),
    }
}

fn to_backing(value: f32) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        0
    } else if value >= u32::MAX as f32 {
        u32::MAX
    } else {
        value.floor() as u32
    }
}

fn sanitize_ratio(ratio: f32) -> f32 {
    if ratio.is_finite() && ratio > 0.0 {
        ratio
    } else {
        1.0
    }
}

/// Scale that makes a page of `page_intrinsic_width` fill the container minus
/// padding. `None` when either width leaves nothing to fit.
pub fn fit_to_width(
    page_intrinsic_width: f32,
    container_width: f32,
    horizontal_padding: f32,
) -> Option<f32> {
    if !page_intrinsic_width.is_finite() || page_intrinsic_width <= 0.0 {
        return None;
    }
    let usable = container_width - horizontal_padding;
    if !usable.is_finite() || usable <= 0.0 {
        return None;
    }
    Some(usable / page_intrinsic_width)
}

pub fn to_render_pixels(scale: f32, device_pixel_ratio: f32) -> f32 {
    scale * sanitize_ratio(device_pixel_ratio)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomLimits {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

impl Default for ZoomLimits {
    fn default() -> Self {
        Self {
            min: 0.5,
            max: 3.0,
            step: 0.1,
        }
    }
}

impl ZoomLimits {
    pub fn clamp(&self, scale: f32) -> f32 {
        if !scale.is_finite() {
            return self.min;
        }
        scale.clamp(self.min, self.max)
    }

    pub fn apply(&self, scale: f32, direction: ZoomDirection) -> f32 {
        let factor = match direction {
            ZoomDirection::In => 1.0 + self.step,
            ZoomDirection::Out => 1.0 - self.step,
        };
        self.clamp(scale * factor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayerItem {
    pub text: String,
    /// Page pixel space.
    pub bounding_box: Rect,
    pub source_transform: Affine,
}

pub fn build_text_layer(runs: &[TextRun], viewport: &ViewportState) -> Vec<TextLayerItem> {
    let to_pixels = Affine::scale(viewport.scale, viewport.scale);
    runs.iter()
        .filter(|run| !run.text.is_empty() && run.bounds.is_valid())
        .map(|run| TextLayerItem {
            text: run.text.clone(),
            bounding_box: run.bounds.scaled(viewport.scale),
            source_transform: run.transform.then(&to_pixels),
        })
        .collect()
}

/// First item, in text order, whose box contains `point` (page pixel space).
pub fn hit_test(point: Point, items: &[TextLayerItem]) -> Option<&TextLayerItem> {
    items.iter().find(|item| item.bounding_box.contains(point))
}
