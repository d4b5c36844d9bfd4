//! Compute paths: inline decimation or worker-pool offload
//!
//! [`ComputePath`] is the seam between the render cache and the decimation
//! engine. [`SyncCompute`] runs the engine inline on the calling task and
//! cannot fail; [`WorkerCompute`] ships the task to a pool worker and
//! validates what comes back.
//!
//! The worker path refuses to chain a reduction onto an entry that has not
//! resolved yet: the ancestor may itself be queued behind the bounded pool
//! this request is occupying, and waiting on it would deadlock. The sync
//! path never contends for the pool, so it takes ancestors as it finds them.

use std::future::Future;
use std::sync::Arc;

use crate::decimate::{decimate_channels, reduce_render_data};
use crate::error::{RenderError, RenderResult};
use crate::pool::WorkerPool;
use crate::types::{RenderData, Sample};
use crate::worker::{validate_render_data, ReplyMessage, TaskMessage};

/// Strategy for producing an envelope from raw channels or a prior envelope.
pub trait ComputePath: Send + Sync {
    /// Whether reductions may only chain onto already-resolved cache entries.
    fn requires_resolved_ancestor(&self) -> bool;

    /// Decimate raw channel data to `render_width` columns.
    fn from_channels<'a>(
        &'a self,
        channels: &'a [Vec<Sample>],
        render_width: usize,
    ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a;

    /// Reduce an existing envelope to `render_width` columns.
    fn from_render_data<'a>(
        &'a self,
        input: &'a RenderData,
        render_width: usize,
    ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a;
}

/// Inline compute on the calling task. Infallible.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncCompute;

impl ComputePath for SyncCompute {
    fn requires_resolved_ancestor(&self) -> bool {
        false
    }

    fn from_channels<'a>(
        &'a self,
        channels: &'a [Vec<Sample>],
        render_width: usize,
    ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
        async move { Ok(decimate_channels(channels, render_width)) }
    }

    fn from_render_data<'a>(
        &'a self,
        input: &'a RenderData,
        render_width: usize,
    ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
        async move { Ok(reduce_render_data(input, render_width)) }
    }
}

/// Compute on a pool worker thread.
///
/// Channel data is copied into the task message, mirroring the structured
/// clone an out-of-process worker transport performs.
#[derive(Clone)]
pub struct WorkerCompute {
    pool: Arc<WorkerPool>,
}

impl WorkerCompute {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        WorkerCompute { pool }
    }

    async fn dispatch(&self, task: TaskMessage) -> RenderResult<RenderData> {
        // Checked out as a guard: the worker goes back to the pool on every
        // exit, including this future being dropped at the reply await
        let worker = self.pool.checkout().await;
        let reply = worker.submit(task).await;
        drop(worker);

        match reply {
            Ok(ReplyMessage::Data(data)) => {
                validate_render_data(&data)?;
                Ok(data)
            }
            Ok(ReplyMessage::Error { error }) => Err(RenderError::Transport(error)),
            Err(_) => Err(RenderError::Transport(
                "worker reply channel closed".to_string(),
            )),
        }
    }
}

impl ComputePath for WorkerCompute {
    fn requires_resolved_ancestor(&self) -> bool {
        true
    }

    fn from_channels<'a>(
        &'a self,
        channels: &'a [Vec<Sample>],
        render_width: usize,
    ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
        let task = TaskMessage::Channels {
            render_width,
            channels: channels.to_vec(),
        };
        async move { self.dispatch(task).await }
    }

    fn from_render_data<'a>(
        &'a self,
        input: &'a RenderData,
        render_width: usize,
    ) -> impl Future<Output = RenderResult<RenderData>> + Send + 'a {
        let task = TaskMessage::RenderData {
            render_width,
            render_data: input.clone(),
        };
        async move { self.dispatch(task).await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worker_compute_decimates_through_the_pool() {
        let pool = Arc::new(WorkerPool::new(1));
        let path = WorkerCompute::new(pool);

        let channels = vec![vec![1.0, -2.0, 3.0, -4.0]];
        let data = path.from_channels(&channels, 2).await.unwrap();
        assert_eq!(data.channels[0], vec![-2.0, 1.0, -4.0, 3.0]);
    }

    #[tokio::test]
    async fn worker_compute_reduces_through_the_pool() {
        let pool = Arc::new(WorkerPool::new(1));
        let path = WorkerCompute::new(pool);

        let input = RenderData {
            channels: vec![vec![-1.0, 1.0, -2.0, 2.0, -3.0, 3.0, -4.0, 4.0]],
            values_per_sample: 2,
        };
        let data = path.from_render_data(&input, 2).await.unwrap();
        assert_eq!(data.channels[0], vec![-2.0, 2.0, -4.0, 4.0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_dispatch_returns_the_worker_to_the_pool() {
        let pool = Arc::new(WorkerPool::new(1));
        let path = WorkerCompute::new(pool.clone());

        // A buffer long enough that the reply is still pending when the
        // timeout drops the dispatch future mid-await
        let channels = vec![vec![0.0f32; 20_000_000]];
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            path.from_channels(&channels, 1024),
        )
        .await;
        assert!(cancelled.is_err());

        // The pool's only worker must come back; otherwise this acquire
        // (and every later one) hangs forever
        let worker = tokio::time::timeout(std::time::Duration::from_secs(5), pool.acquire())
            .await
            .expect("worker was not returned to the pool after cancellation");
        pool.release(worker);
    }

    #[tokio::test]
    async fn sync_compute_runs_inline() {
        let channels = vec![vec![0.5; 10]];
        let data = SyncCompute.from_channels(&channels, 5).await.unwrap();
        assert_eq!(data.channels[0].len(), 10);
    }
}
