//! Declarative per-frame video filters
//!
//! A filter is a pure transform over an RGBA frame keyed by the filter spec
//! and the wall-clock time elapsed since the filter loop started. The render
//! loop in [`crate::media`] calls [`apply_filter`] once per tick; nothing here
//! touches tracks, devices, or the connection.

use crate::media::VideoFrame;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of a filter selectable by the UI
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterId(pub String);

impl FilterId {
    /// Wrap a filter name
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for FilterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Procedural overlay drawn on top of the adjusted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Overlay {
    /// Darken every other row
    Scanlines,
    /// Radial darkening toward the corners
    Vignette,
    /// Periodic brightness swell keyed by elapsed time
    Pulse,
}

/// Declarative description of one filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Additive brightness, -1.0..=1.0
    pub brightness: f32,
    /// Contrast multiplier, 1.0 is identity
    pub contrast: f32,
    /// Saturation, 0.0 grayscale .. 1.0 identity
    pub saturation: f32,
    /// Optional time-keyed overlay
    pub overlay: Option<Overlay>,
}

impl FilterSpec {
    /// Look up a built-in filter by id
    pub fn named(id: &FilterId) -> Option<FilterSpec> {
        match id.0.as_str() {
            "noir" => Some(FilterSpec {
                brightness: -0.05,
                contrast: 1.35,
                saturation: 0.0,
                overlay: Some(Overlay::Vignette),
            }),
            "vivid" => Some(FilterSpec {
                brightness: 0.05,
                contrast: 1.15,
                saturation: 1.0,
                overlay: None,
            }),
            "crt" => Some(FilterSpec {
                brightness: 0.0,
                contrast: 1.1,
                saturation: 0.8,
                overlay: Some(Overlay::Scanlines),
            }),
            "dream" => Some(FilterSpec {
                brightness: 0.1,
                contrast: 0.9,
                saturation: 0.7,
                overlay: Some(Overlay::Pulse),
            }),
            _ => None,
        }
    }
}

fn clamp_u8(v: f32) -> u8 {
    v.clamp(0.0, 255.0) as u8
}

/// Apply a filter spec to one frame, producing a new frame
///
/// Pure: same frame, spec and elapsed time always produce the same output.
pub fn apply_filter(frame: &VideoFrame, spec: &FilterSpec, elapsed: Duration) -> VideoFrame {
    let mut out = frame.data.to_vec();
    let width = frame.width as usize;
    let height = frame.height as usize;
    let offset = spec.brightness * 255.0;

    for px in out.chunks_exact_mut(4) {
        let (mut r, mut g, mut b) = (px[0] as f32, px[1] as f32, px[2] as f32);

        // Contrast around mid-gray, then brightness.
        r = (r - 128.0) * spec.contrast + 128.0 + offset;
        g = (g - 128.0) * spec.contrast + 128.0 + offset;
        b = (b - 128.0) * spec.contrast + 128.0 + offset;

        // ITU-R BT.601 luma for the saturation mix.
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        r = luma + (r - luma) * spec.saturation;
        g = luma + (g - luma) * spec.saturation;
        b = luma + (b - luma) * spec.saturation;

        px[0] = clamp_u8(r);
        px[1] = clamp_u8(g);
        px[2] = clamp_u8(b);
    }

    if let Some(overlay) = spec.overlay {
        apply_overlay(&mut out, width, height, overlay, elapsed);
    }

    VideoFrame {
        width: frame.width,
        height: frame.height,
        data: Bytes::from(out),
        timestamp: frame.timestamp,
    }
}

fn apply_overlay(data: &mut [u8], width: usize, height: usize, overlay: Overlay, elapsed: Duration) {
    match overlay {
        Overlay::Scanlines => {
            for y in (1..height).step_by(2) {
                let row = &mut data[y * width * 4..(y + 1) * width * 4];
                for px in row.chunks_exact_mut(4) {
                    px[0] /= 2;
                    px[1] /= 2;
                    px[2] /= 2;
                }
            }
        }
        Overlay::Vignette => {
            let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
            let max_dist = (cx * cx + cy * cy).sqrt();
            for y in 0..height {
                for x in 0..width {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    let dist = (dx * dx + dy * dy).sqrt() / max_dist;
                    let factor = 1.0 - 0.6 * dist * dist;
                    let i = (y * width + x) * 4;
                    data[i] = clamp_u8(data[i] as f32 * factor);
                    data[i + 1] = clamp_u8(data[i + 1] as f32 * factor);
                    data[i + 2] = clamp_u8(data[i + 2] as f32 * factor);
                }
            }
        }
        Overlay::Pulse => {
            // One full swell per second.
            let phase = (elapsed.as_secs_f32() * std::f32::consts::TAU).sin();
            let factor = 1.0 + 0.15 * phase;
            for px in data.chunks_exact_mut(4) {
                px[0] = clamp_u8(px[0] as f32 * factor);
                px[1] = clamp_u8(px[1] as f32 * factor);
                px[2] = clamp_u8(px[2] as f32 * factor);
            }
        }
    }
}
