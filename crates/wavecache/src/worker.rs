//! Worker task messages and the worker thread loop
//!
//! Tasks cross to pool workers as [`TaskMessage`] values and come back as
//! [`ReplyMessage`] values. Both serialize to the wire shape the original
//! inline-worker protocol uses, so an out-of-process worker speaking that
//! protocol is interchangeable with the in-process threads here:
//!
//! ```json
//! { "method": "channels",   "payload": { "renderWidth": 100, "channels": [[...]] } }
//! { "method": "renderData", "payload": { "renderWidth": 100, "renderData": {...} } }
//! ```
//!
//! A success reply is a render envelope (`data` + `valuesPerSample`); a
//! failure reply is `{ "error": "..." }`. Replies are structurally validated
//! before they settle the caller's request.

use crossbeam::channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::decimate::{decimate_channels, reduce_render_data};
use crate::error::{RenderError, RenderResult};
use crate::types::{RenderData, Sample};

/// A decimation task sent to a pool worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload")]
pub enum TaskMessage {
    /// Decimate raw channel data
    #[serde(rename = "channels", rename_all = "camelCase")]
    Channels {
        render_width: usize,
        channels: Vec<Vec<Sample>>,
    },
    /// Reduce an existing envelope to a smaller width
    #[serde(rename = "renderData", rename_all = "camelCase")]
    RenderData {
        render_width: usize,
        render_data: RenderData,
    },
}

/// A worker's reply: either an envelope or an error signal.
///
/// Untagged on the wire; the two shapes are disjoint (`data` vs `error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyMessage {
    Data(RenderData),
    Error { error: String },
}

/// A task paired with its reply channel, as queued on a worker's channel.
#[derive(Debug)]
pub struct WorkerJob {
    pub task: TaskMessage,
    pub reply: tokio::sync::oneshot::Sender<ReplyMessage>,
}

/// Check that a reply envelope is structurally sound: a nonzero pair stride
/// and per-channel lengths that are whole runs of (min, max) pairs.
pub fn validate_render_data(data: &RenderData) -> RenderResult<()> {
    if data.values_per_sample == 0 {
        return Err(RenderError::Shape(
            "valuesPerSample must be nonzero".to_string(),
        ));
    }

    for (idx, channel) in data.channels.iter().enumerate() {
        if channel.len() % data.values_per_sample != 0 {
            return Err(RenderError::Shape(format!(
                "channel {} length {} is not a multiple of valuesPerSample {}",
                idx,
                channel.len(),
                data.values_per_sample
            )));
        }
    }

    Ok(())
}

/// Main loop for one pool worker thread.
///
/// Runs until the job channel closes (pool dropped). Reply sends are
/// best-effort: the requester may have gone away, in which case the result
/// is simply unobserved.
pub fn worker_loop(id: usize, jobs: Receiver<WorkerJob>) {
    log::debug!("wavecache worker {} started", id);

    while let Ok(job) = jobs.recv() {
        let started = std::time::Instant::now();

        let reply = match job.task {
            TaskMessage::Channels {
                render_width,
                channels,
            } => ReplyMessage::Data(decimate_channels(&channels, render_width)),
            TaskMessage::RenderData {
                render_width,
                render_data,
            } => ReplyMessage::Data(reduce_render_data(&render_data, render_width)),
        };

        log::debug!("worker {} finished task in {:?}", id, started.elapsed());
        let _ = job.reply.send(reply);
    }

    log::debug!("wavecache worker {} shutting down", id);
}
