//! Subscriber registry: per-channel, fixed-capacity, registration-ordered.

use std::sync::Arc;

use heapless::Vec;

use crate::error::{Error, Result};
use crate::events::{BusMessage, CHANNEL_COUNT, Channel};

/// Subscribers allowed per channel.
pub const MAX_SUBSCRIBERS: usize = 8;

/// A bus callback. Runs on the bus task; must not block unboundedly.
pub trait BusHandler: Send + Sync {
    fn handle(&self, msg: &BusMessage) -> Result<()>;
}

impl<F> BusHandler for F
where
    F: Fn(&BusMessage) -> Result<()> + Send + Sync,
{
    fn handle(&self, msg: &BusMessage) -> Result<()> {
        self(msg)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    pub channel: Channel,
    seq: u32,
}

struct Subscription {
    seq: u32,
    mask: u32,
    handler: Arc<dyn BusHandler>,
}

/// Snapshot of the handlers one message should reach.
pub(crate) type Matches = Vec<Arc<dyn BusHandler>, MAX_SUBSCRIBERS>;

pub(crate) struct Registry {
    channels: [Vec<Subscription, MAX_SUBSCRIBERS>; CHANNEL_COUNT],
    next_seq: u32,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            channels: core::array::from_fn(|_| Vec::new()),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(
        &mut self,
        channel: Channel,
        mask: u32,
        handler: Arc<dyn BusHandler>,
    ) -> Result<SubscriptionId> {
        if mask == 0 {
            return Err(Error::InvalidArgument);
        }
        let seq = self.next_seq;
        self.channels[channel.index()]
            .push(Subscription { seq, mask, handler })
            .map_err(|_| Error::NoMemory)?;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(SubscriptionId { channel, seq })
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Result<()> {
        let subs = &mut self.channels[id.channel.index()];
        let pos = subs
            .iter()
            .position(|s| s.seq == id.seq)
            .ok_or(Error::NotFound)?;
        // `remove` (not `swap_remove`) keeps the remaining dispatch order.
        subs.remove(pos);
        Ok(())
    }

    pub(crate) fn subscriber_count(&self, channel: Channel) -> usize {
        self.channels[channel.index()].len()
    }

    /// Handlers on `channel` whose mask intersects `event`, in
    /// registration order.
    pub(crate) fn matching(&self, channel: Channel, event: u32) -> Matches {
        let mut out = Matches::new();
        for sub in self.channels[channel.index()]
            .iter()
            .filter(|s| s.mask & event != 0)
        {
            // `Matches` and the channel list share `MAX_SUBSCRIBERS`.
            let pushed = out.push(Arc::clone(&sub.handler));
            debug_assert!(pushed.is_ok(), "match snapshot smaller than channel list");
        }
        out
    }
}
