//! Region masks and compositing
//!
//! A maskable stage runs once with the global parameters and once per
//! region with that region's parameters, always against the same input.
//! Region results are blended over the running accumulator in insertion
//! order using an alpha plane derived from the region geometry.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use colorforge::mask::MaskCompositor;
//!
//! let compositor = MaskCompositor::new(&job.regions, &job.region_params);
//! let composite = compositor.composite(&Exposure, &base, &job.global, &ctx);
//! println!("{} regions applied", composite.regions_applied);
//! ```

use crate::buffer::{Extent, FrameSize, ImageBuffer};
use crate::color;
use crate::operators::{run, Operator, RenderContext};
use crate::params::{ParameterSet, Region, RegionGeometry, RegionId};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

// ============================================================================
// Alpha planes
// ============================================================================

/// Alpha of a region at frame pixel `(x, y)`, before invert and opacity.
fn coverage(geometry: &RegionGeometry, frame: FrameSize, x: u32, y: u32) -> f32 {
    let (fw, fh) = (frame.width as f32, frame.height as f32);
    let px = x as f32 + 0.5;
    let py = y as f32 + 0.5;

    match geometry {
        RegionGeometry::Linear { start, end, .. } => {
            let (sx, sy) = (start.x * fw, start.y * fh);
            let (dx, dy) = (end.x * fw - sx, end.y * fh - sy);
            let len2 = dx * dx + dy * dy;
            if len2 <= f32::EPSILON {
                return 1.0;
            }
            let t = ((px - sx) * dx + (py - sy) * dy) / len2;
            1.0 - color::smoothstep(0.0, 1.0, t)
        }
        RegionGeometry::Radial {
            start,
            end,
            width,
            height,
            feather,
            ..
        } => {
            let (cx, cy) = (start.x * fw, start.y * fh);
            let a = (width * 0.5 * fw).max(f32::EPSILON);
            let b = (height * 0.5 * fh).max(f32::EPSILON);

            let (ex, ey) = (end.x * fw - cx, end.y * fh - cy);
            let (cos, sin) = if ex == 0.0 && ey == 0.0 {
                (1.0, 0.0)
            } else {
                let angle = ey.atan2(ex);
                (angle.cos(), angle.sin())
            };
            let (rx, ry) = (px - cx, py - cy);
            let u = rx * cos + ry * sin;
            let v = -rx * sin + ry * cos;
            let d = ((u / a).powi(2) + (v / b).powi(2)).sqrt();

            let inner = 1.0 - (feather / 100.0).clamp(0.0, 1.0);
            1.0 - color::smoothstep(inner, 1.0, d)
        }
        RegionGeometry::Freeform { mask, .. } => mask.sample(px / fw, py / fh).clamp(0.0, 1.0),
    }
}

/// Alpha plane of a region over a buffer's extent, with invert and opacity applied.
pub fn alpha_plane(geometry: &RegionGeometry, extent: Extent, frame: FrameSize) -> Vec<f32> {
    let (invert, opacity) = match geometry {
        RegionGeometry::Linear { invert, opacity, .. }
        | RegionGeometry::Radial { invert, opacity, .. }
        | RegionGeometry::Freeform { invert, opacity, .. } => (*invert, (*opacity / 100.0).clamp(0.0, 1.0)),
    };

    let w = extent.width as usize;
    let mut plane = vec![0.0f32; extent.pixel_count()];
    plane.par_chunks_mut(w.max(1)).enumerate().for_each(|(row, out)| {
        let y = extent.y + row as u32;
        for (col, a) in out.iter_mut().enumerate() {
            let mut alpha = coverage(geometry, frame, extent.x + col as u32, y);
            if invert {
                alpha = 1.0 - alpha;
            }
            *a = alpha * opacity;
        }
    });
    plane
}

// ============================================================================
// Compositor
// ============================================================================

/// Result of compositing one stage.
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: ImageBuffer,
    /// Regions whose parameters were found and applied
    pub regions_applied: usize,
}

/// Composites region overrides for the maskable stages of one render.
///
/// Alpha planes depend only on geometry and the buffer extent, which stays
/// fixed for a render, so each region's plane is built once and shared by
/// every stage.
pub struct MaskCompositor<'a> {
    regions: &'a [Region],
    region_params: &'a HashMap<RegionId, ParameterSet>,
    planes: Vec<OnceLock<Arc<Vec<f32>>>>,
}

impl<'a> MaskCompositor<'a> {
    pub fn new(regions: &'a [Region], region_params: &'a HashMap<RegionId, ParameterSet>) -> Self {
        Self {
            regions,
            region_params,
            planes: regions.iter().map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn plane(&self, index: usize, base: &ImageBuffer) -> Arc<Vec<f32>> {
        self.planes[index]
            .get_or_init(|| Arc::new(alpha_plane(&self.regions[index].geometry, base.extent(), base.frame())))
            .clone()
    }

    /// Run `op` globally, then blend each region's own run over the result.
    pub fn composite(
        &self,
        op: &dyn Operator,
        base: &ImageBuffer,
        global: &ParameterSet,
        ctx: &RenderContext,
    ) -> Composite {
        let mut acc = run(op, base, global, ctx);
        let mut regions_applied = 0;

        for (index, region) in self.regions.iter().enumerate() {
            let Some(params) = self.region_params.get(&region.id) else {
                debug!("Region {} has no parameters, skipping", region.id);
                continue;
            };
            if !region.geometry.is_well_formed() {
                warn!(
                    "⚠️ {} region {} has a malformed {} mask, skipping",
                    op.name(),
                    region.id,
                    region.geometry.kind()
                );
                continue;
            }
            // Region and global runs both read the stage input; regions never
            // see each other's edits before blending.
            let region_result = run(op, base, params, ctx);
            regions_applied += 1;

            if region.geometry.is_degenerate() {
                acc = region_result;
                continue;
            }

            let alpha = self.plane(index, base);
            match acc.blend_with_alpha(&region_result, &alpha) {
                Ok(blended) => acc = blended,
                Err(e) => warn!(
                    "⚠️ {} region {} ({}) not composited: {}",
                    op.name(),
                    region.id,
                    region.geometry.kind(),
                    e
                ),
            }
        }

        Composite {
            image: acc,
            regions_applied,
        }
    }
}
