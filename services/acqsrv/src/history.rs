//! Published RMS history.
//!
//! Each channel keeps the last M smoothed RMS values in chronological order
//! plus a cached latest value for single-value queries. Readers always get
//! copies; the lock is held only for the copy.

use parking_lot::Mutex;

/// Bounded chronological ring of published values.
#[derive(Debug)]
struct HistoryRing {
    data: Vec<f32>,
    head: usize,
    count: usize,
    capacity: usize,
}

impl HistoryRing {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            head: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f32) {
        self.data[self.head] = value;
        self.head = (self.head + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    /// Up to `k` most recent values, oldest to newest.
    fn recent(&self, k: usize) -> Vec<f32> {
        let take = k.min(self.count);
        let mut out = Vec::with_capacity(take);
        for i in 0..take {
            let idx = (self.head + self.capacity - take + i) % self.capacity;
            out.push(self.data[idx]);
        }
        out
    }
}

struct Inner {
    rings: Vec<HistoryRing>,
    last: Vec<Option<f32>>,
}

/// All channels' history behind one mutex.
pub struct HistoryBank {
    inner: Mutex<Inner>,
}

impl HistoryBank {
    pub fn new(channels: usize, depth: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rings: (0..channels).map(|_| HistoryRing::new(depth)).collect(),
                last: vec![None; channels],
            }),
        }
    }

    /// Publish one value for a channel. Out-of-range channels are ignored.
    pub fn push(&self, channel: usize, value: f32) {
        let mut inner = self.inner.lock();
        if let Some(ring) = inner.rings.get_mut(channel) {
            ring.push(value);
            inner.last[channel] = Some(value);
        }
    }

    /// Copy of up to `k` most recent values for a channel, oldest to newest.
    pub fn recent(&self, channel: usize, k: usize) -> Vec<f32> {
        let inner = self.inner.lock();
        inner
            .rings
            .get(channel)
            .map(|ring| ring.recent(k))
            .unwrap_or_default()
    }

    /// Cached most recent value for a channel.
    pub fn last(&self, channel: usize) -> Option<f32> {
        self.inner.lock().last.get(channel).copied().flatten()
    }
}
