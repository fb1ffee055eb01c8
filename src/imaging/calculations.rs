//! Pure calculation functions for resize geometry.
//!
//! All functions here are pure and testable without any I/O or images.

use super::backend::BackendError;
use super::params::{Anchor, Fit, MAX_DIMENSION, MAX_PIXELS};

/// Geometry of one resize: scale the source to `scaled`, then crop or pad it
/// to `canvas`. When the two are equal no crop or pad happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub scaled: (u32, u32),
    pub canvas: (u32, u32),
}

impl ResizePlan {
    /// True when the canvas is larger than the scaled image on either axis.
    pub fn pads(&self) -> bool {
        self.canvas.0 > self.scaled.0 || self.canvas.1 > self.scaled.1
    }

    /// True when the plan changes nothing relative to `source`.
    pub fn is_identity(&self, source: (u32, u32)) -> bool {
        self.scaled == source && self.canvas == source
    }

    /// Reject plans whose scaled image or canvas would exceed
    /// [`MAX_DIMENSION`] on a side or [`MAX_PIXELS`] in area.
    ///
    /// Requested sizes are bounded before planning, but an extreme source
    /// aspect ratio can still scale the other side far past them.
    pub fn check_limits(&self) -> Result<(), BackendError> {
        for (w, h) in [self.scaled, self.canvas] {
            if w > MAX_DIMENSION || h > MAX_DIMENSION || u64::from(w) * u64::from(h) > MAX_PIXELS
            {
                return Err(BackendError::ProcessingFailed(format!(
                    "resize to {w}x{h} exceeds the {MAX_DIMENSION}px / {MAX_PIXELS} pixel limit"
                )));
            }
        }
        Ok(())
    }
}

fn scale(value: u32, factor: f64) -> u32 {
    ((value as f64 * factor).round() as u32).max(1)
}

/// Complete a target box when only one side is given, preserving the source
/// aspect ratio.
///
/// # Examples
/// ```
/// # use storefront_images::imaging::calculations::target_dimensions;
/// assert_eq!(target_dimensions((800, 600), Some(400), None), (400, 300));
/// assert_eq!(target_dimensions((800, 600), None, Some(300)), (400, 300));
/// ```
pub fn target_dimensions(source: (u32, u32), width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    let (src_w, src_h) = source;
    match (width, height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => (w, scale(src_h, w as f64 / src_w as f64)),
        (None, Some(h)) => (scale(src_w, h as f64 / src_h as f64), h),
        (None, None) => source,
    }
}

/// Calculate dimensions needed to fill a target area (resize before crop).
///
/// Returns dimensions that completely cover the target area while maintaining
/// the source aspect ratio. One dimension will match exactly, the other may exceed.
pub fn calculate_fill_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (tgt_w, tgt_h) = target;

    let src_aspect = src_w as f64 / src_h as f64;
    let tgt_aspect = tgt_w as f64 / tgt_h as f64;

    if src_aspect > tgt_aspect {
        // Wider source: height matches, width overflows
        (((tgt_h as f64) * src_aspect).round().max(1.0) as u32, tgt_h)
    } else {
        (tgt_w, ((tgt_w as f64) / src_aspect).round().max(1.0) as u32)
    }
}

/// Calculate dimensions that fit entirely inside a target area.
///
/// One dimension matches exactly, the other is smaller or equal.
pub fn calculate_fit_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (tgt_w, tgt_h) = target;

    let src_aspect = src_w as f64 / src_h as f64;
    let tgt_aspect = tgt_w as f64 / tgt_h as f64;

    if src_aspect > tgt_aspect {
        (tgt_w, ((tgt_w as f64) / src_aspect).round().max(1.0) as u32)
    } else {
        (((tgt_h as f64) * src_aspect).round().max(1.0) as u32, tgt_h)
    }
}

/// Plan a resize of `source` toward the requested box.
///
/// With `without_enlargement`, a source that is already smaller than the
/// scaled result is left at its own size and the canvas shrinks to match.
pub fn plan_resize(
    source: (u32, u32),
    width: Option<u32>,
    height: Option<u32>,
    fit: Fit,
    without_enlargement: bool,
) -> ResizePlan {
    // A single side can only be honored one way: keep the aspect ratio.
    let single_side = width.is_none() || height.is_none();
    let target = target_dimensions(source, width, height);

    let (scaled, canvas) = if single_side {
        (target, target)
    } else {
        match fit {
            Fit::Cover => (calculate_fill_dimensions(source, target), target),
            Fit::Contain => (calculate_fit_dimensions(source, target), target),
            Fit::Fill => (target, target),
            Fit::Inside => {
                let dims = calculate_fit_dimensions(source, target);
                (dims, dims)
            }
            Fit::Outside => {
                let dims = calculate_fill_dimensions(source, target);
                (dims, dims)
            }
        }
    };

    if without_enlargement && (scaled.0 > source.0 || scaled.1 > source.1) {
        let canvas = match fit {
            Fit::Cover if !single_side => (canvas.0.min(source.0), canvas.1.min(source.1)),
            _ => source,
        };
        return ResizePlan {
            scaled: source,
            canvas,
        };
    }

    ResizePlan { scaled, canvas }
}

/// Offset of an `inner` span inside an `outer` span for the given anchor.
///
/// Used both for crops (inner = canvas, outer = scaled image) and pads
/// (inner = scaled image, outer = canvas).
pub fn align(outer: u32, inner: u32, anchor: Anchor) -> u32 {
    let slack = outer.saturating_sub(inner);
    match anchor {
        Anchor::Start => 0,
        Anchor::Middle => slack / 2,
        Anchor::End => slack,
    }
}
