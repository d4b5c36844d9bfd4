//! Waveform decimation engine
//!
//! Pure functions that summarize raw audio into a min/max envelope: one
//! (min, max) pair per output pixel column. [`decimate_channels`] scans raw
//! samples; [`reduce_render_data`] re-decimates an existing envelope to a
//! smaller width so a finer cached result can serve coarser views without
//! touching the raw buffer again.
//!
//! Both functions are stateless and safe to call from any thread; the render
//! cache in [`crate::cache`] decides whether they run inline or on a pool
//! worker.
//!
//! The min/max accumulators are seeded at 0 rather than at the first sample
//! of each window, so a signal that never crosses zero still renders an
//! envelope touching the axis. Real audio is zero-centered; this is the
//! long-standing observed behavior and changing it would alter every cached
//! envelope, so it is kept and pinned by tests.

use crate::types::{RenderData, Sample, VALUES_PER_SAMPLE};

/// Decimate raw channel data to a min/max envelope for `render_width` columns.
///
/// The window size is `max(floor(raw_len / render_width), 1)`; flooring to 1
/// guards degenerate widths (shorter buffers than columns, width 0). Each
/// channel yields `floor(channel_len / step)` pairs, so the per-channel
/// output length is `2 * floor(channel_len / step)`.
pub fn decimate_channels(channels: &[Vec<Sample>], render_width: usize) -> RenderData {
    let raw_len = channels.first().map_or(0, |c| c.len());
    let step = (raw_len / render_width.max(1)).max(1);

    let mut decimated = Vec::with_capacity(channels.len());

    for channel in channels {
        let num_pairs = channel.len() / step;
        let mut samples = Vec::with_capacity(num_pairs * VALUES_PER_SAMPLE);

        let mut min: Sample = 0.0;
        let mut max: Sample = 0.0;
        let mut window_idx = 0;

        for &sample in channel {
            if sample < min {
                min = sample;
            }
            if sample > max {
                max = sample;
            }

            window_idx += 1;
            if window_idx == step {
                samples.push(min);
                samples.push(max);
                min = 0.0;
                max = 0.0;
                window_idx = 0;
            }
        }

        decimated.push(samples);
    }

    RenderData {
        channels: decimated,
        values_per_sample: VALUES_PER_SAMPLE,
    }
}

/// Re-decimate an existing envelope to `render_width` columns.
///
/// Walks the input (min, max) pairs accumulating a fractional output index of
/// `render_width * 2 / input_len` per pair; every time the accumulator
/// reaches 1 a pair is emitted and the remainder carried. The output is
/// pre-sized to `render_width * 2` and zero-filled, so columns the
/// accumulator never reaches stay at 0.
pub fn reduce_render_data(input: &RenderData, render_width: usize) -> RenderData {
    let values_per_sample = input.values_per_sample.max(1);
    let num_out = render_width * values_per_sample;
    let num_in = input.channels.first().map_or(0, |c| c.len());

    let mut reduced = Vec::with_capacity(input.channels.len());

    if num_in == 0 || num_out == 0 {
        for _ in &input.channels {
            reduced.push(vec![0.0; num_out]);
        }
        return RenderData {
            channels: reduced,
            values_per_sample: input.values_per_sample,
        };
    }

    let input_step = num_out as f64 / num_in as f64;

    for in_channel in &input.channels {
        let mut out_channel = vec![0.0; num_out];

        let mut min: Sample = 0.0;
        let mut max: Sample = 0.0;
        let mut accumulated = 0.0f64;
        let mut out_idx = 0;

        let mut i = 0;
        while i + 1 < in_channel.len() {
            let in_min = in_channel[i];
            let in_max = in_channel[i + 1];
            if in_min < min {
                min = in_min;
            }
            if in_max > max {
                max = in_max;
            }

            accumulated += input_step;
            if accumulated >= 1.0 {
                // float accumulation can land one step past the end
                if out_idx + values_per_sample <= num_out {
                    out_channel[out_idx] = min;
                    out_channel[out_idx + 1] = max;
                    out_idx += values_per_sample;
                }
                accumulated %= 1.0;
                min = 0.0;
                max = 0.0;
            }

            i += values_per_sample;
        }

        reduced.push(out_channel);
    }

    RenderData {
        channels: reduced,
        values_per_sample: input.values_per_sample,
    }
}
