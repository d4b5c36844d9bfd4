//! wavecache - cached min/max waveform decimation
//!
//! Renders visual waveform envelopes for audio buffers at arbitrary pixel
//! widths without re-scanning full-resolution samples on every redraw.
//! A [`RenderCache`] remembers every envelope per (buffer, width), serves
//! nearby widths from tolerance bounds, derives smaller widths from larger
//! cached ones, and offloads fresh decimation to a FIFO [`WorkerPool`].
//!
//! Decoding, drawing and persistence are the caller's business: the input is
//! borrowed per-channel `f32` samples, the output a [`RenderData`] envelope.

pub mod cache;
pub mod compute;
pub mod decimate;
pub mod error;
pub mod pool;
pub mod types;
pub mod worker;

pub use cache::RenderCache;
pub use compute::{ComputePath, SyncCompute, WorkerCompute};
pub use decimate::{decimate_channels, reduce_render_data};
pub use error::{RenderError, RenderResult};
pub use pool::{PooledWorker, Worker, WorkerPool};
pub use types::{BufferId, RenderData, RenderRequest, Sample, VALUES_PER_SAMPLE};
