//! Common types for wavecache
//!
//! This module contains the value types shared by the decimation engine, the
//! render cache and the worker wire protocol.

use serde::{Deserialize, Serialize};

/// Audio sample type (32-bit float throughout)
pub type Sample = f32;

/// Number of envelope values stored per output column (min and max)
pub const VALUES_PER_SAMPLE: usize = 2;

/// Opaque handle identifying an audio buffer in the render cache.
///
/// The cache is keyed by an explicit stable id rather than by buffer
/// reference, so whichever component manages audio sessions decides what an
/// id means (slot index, content hash, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub const fn new(id: u64) -> Self {
        BufferId(id)
    }
}

impl From<u64> for BufferId {
    fn from(id: u64) -> Self {
        BufferId(id)
    }
}

/// A decimated waveform envelope.
///
/// Each channel is a flattened run of (min, max) pairs, one pair per output
/// column, so `channels[c].len() == VALUES_PER_SAMPLE * effective_width`.
///
/// Serializes to the worker wire shape: the channel data under `data` and the
/// pair stride under `valuesPerSample`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderData {
    #[serde(rename = "data")]
    pub channels: Vec<Vec<Sample>>,
    #[serde(rename = "valuesPerSample")]
    pub values_per_sample: usize,
}

impl RenderData {
    /// Number of (min, max) columns per channel, 0 for an empty envelope.
    pub fn width(&self) -> usize {
        let per_channel = self.channels.first().map_or(0, |c| c.len());
        if self.values_per_sample == 0 {
            0
        } else {
            per_channel / self.values_per_sample
        }
    }
}

/// A request for an envelope at a target pixel width, with optional
/// tolerance bounds for accepting an already-cached nearby width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    /// Target output width in pixel columns
    pub render_width: usize,
    /// Smallest cached width acceptable instead of `render_width`
    pub min_width: usize,
    /// Largest cached width acceptable instead of `render_width`
    pub max_width: usize,
}

impl RenderRequest {
    /// Request exactly `render_width`; no tolerance.
    pub fn exact(render_width: usize) -> Self {
        RenderRequest {
            render_width,
            min_width: render_width,
            max_width: render_width,
        }
    }

    /// Accept any cached width within `[min_width, max_width]`.
    pub fn with_tolerance(render_width: usize, min_width: usize, max_width: usize) -> Self {
        RenderRequest {
            render_width,
            min_width,
            max_width,
        }
    }
}
