//! Local, network-free pre-filter in front of the remote matcher.
//!
//! The remote index is billed per call, so frames that cannot plausibly
//! contain a face never leave the machine. A false negative only delays
//! recognition to a later frame; a false positive costs one wasted call.

use crate::frame::{is_dark_frame, Frame, DARK_FRAME_PCT};

pub trait PresenceFilter: Send + Sync {
    fn has_candidate_face(&self, frame: &Frame) -> bool;
}

/// Pass-through filter, used when local filtering is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCandidate;

impl PresenceFilter for AlwaysCandidate {
    fn has_candidate_face(&self, frame: &Frame) -> bool {
        frame.is_complete()
    }
}

/// Statistical face-plausibility check on the central region of the frame.
///
/// A face in front of a classroom camera shows up as a textured, contrasted
/// patch near the middle of the image. Empty walls, lens caps and dark rooms
/// fail at least one of the checks.
#[derive(Debug, Clone)]
pub struct StatisticalPresenceFilter {
    /// Fraction of near-black pixels above which the frame is dark.
    pub dark_threshold_pct: f32,
    /// Minimum pixel std-dev inside the region of interest.
    pub min_contrast: f32,
    /// Minimum mean absolute gradient (|dx| + |dy|) inside the region of interest.
    pub min_edge_energy: f32,
    /// Side of the centered region of interest, as a fraction of the frame (0–1].
    pub center_fraction: f32,
}

impl Default for StatisticalPresenceFilter {
    fn default() -> Self {
        Self {
            dark_threshold_pct: DARK_FRAME_PCT,
            min_contrast: 12.0,
            min_edge_energy: 4.0,
            center_fraction: 0.6,
        }
    }
}

/// Pixel bounds of the region of interest, half-open.
struct Roi {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
}

impl StatisticalPresenceFilter {
    fn roi(&self, width: usize, height: usize) -> Roi {
        let fraction = self.center_fraction.clamp(0.05, 1.0);
        let roi_w = ((width as f32 * fraction) as usize).clamp(2, width);
        let roi_h = ((height as f32 * fraction) as usize).clamp(2, height);
        let x0 = (width - roi_w) / 2;
        let y0 = (height - roi_h) / 2;
        Roi {
            x0,
            y0,
            x1: x0 + roi_w,
            y1: y0 + roi_h,
        }
    }

    fn contrast(gray: &[u8], width: usize, roi: &Roi) -> f32 {
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        let mut n = 0f64;
        for y in roi.y0..roi.y1 {
            for &p in &gray[y * width + roi.x0..y * width + roi.x1] {
                let v = p as f64;
                sum += v;
                sum_sq += v * v;
                n += 1.0;
            }
        }
        let mean = sum / n;
        ((sum_sq / n) - mean * mean).max(0.0).sqrt() as f32
    }

    fn edge_energy(gray: &[u8], width: usize, roi: &Roi) -> f32 {
        let mut total = 0u64;
        let mut n = 0u64;
        for y in roi.y0..roi.y1 - 1 {
            for x in roi.x0..roi.x1 - 1 {
                let p = gray[y * width + x] as i32;
                let right = gray[y * width + x + 1] as i32;
                let below = gray[(y + 1) * width + x] as i32;
                total += ((p - right).unsigned_abs() + (p - below).unsigned_abs()) as u64;
                n += 1;
            }
        }
        if n == 0 {
            return 0.0;
        }
        total as f32 / n as f32
    }
}

impl PresenceFilter for StatisticalPresenceFilter {
    fn has_candidate_face(&self, frame: &Frame) -> bool {
        if !frame.is_complete() || frame.width < 2 || frame.height < 2 {
            return false;
        }
        let width = frame.width as usize;
        let height = frame.height as usize;
        let gray = &frame.data[..width * height];

        if frame.is_dark || is_dark_frame(gray, self.dark_threshold_pct) {
            tracing::trace!(seq = frame.sequence, "filter: dark frame");
            return false;
        }

        let roi = self.roi(width, height);
        let contrast = Self::contrast(gray, width, &roi);
        if contrast < self.min_contrast {
            tracing::trace!(seq = frame.sequence, contrast, "filter: flat region");
            return false;
        }

        let energy = Self::edge_energy(gray, width, &roi);
        if energy < self.min_edge_energy {
            tracing::trace!(seq = frame.sequence, energy, "filter: no texture");
            return false;
        }

        true
    }
}
