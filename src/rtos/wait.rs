//! Blocking waits on the bus queue futures.
//!
//! `embassy-sync` channels expose `send`/`receive` as futures. Task-context
//! producers and the bus consumer need them as blocking calls with a
//! deadline, the way a FreeRTOS `xQueueSend(.., ticks)` behaves. The future
//! is raced against an `async-io-mini` timer and driven by
//! `futures_lite::future::block_on`.
//!
//! Dropping an unfinished `send` future drops the message with it, so a
//! timed-out publish leaves the queue untouched.

use core::future::Future;
use std::time::{Duration, Instant};

use async_io_mini::Timer;
use futures_lite::future::{self, block_on};

/// Poll `fut` to completion or until `timeout` elapses.
///
/// Returns `None` on timeout. A future that is already ready completes
/// without touching the clock. A timeout too large to form a deadline
/// (`Duration::MAX`) waits forever.
pub fn block_on_timeout<F: Future>(fut: F, timeout: Duration) -> Option<F::Output> {
    futures_lite::pin!(fut);
    if let Some(out) = block_on(future::poll_once(fut.as_mut())) {
        return Some(out);
    }
    let Some(deadline) = Instant::now().checked_add(timeout) else {
        return Some(block_on(fut));
    };
    block_on(future::or(async { Some(fut.await) }, async {
        Timer::at(deadline).await;
        None
    }))
}
