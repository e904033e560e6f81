//! In-memory fallback buffer for readings while SQLite is unavailable.
//!
//! Bounded; when full the oldest reading is dropped. The monitoring loop
//! pushes here on storage errors and drains back into the database once a
//! write succeeds again.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::Reading;

pub struct ReadingRing {
    inner: Mutex<VecDeque<Reading>>,
    cap: usize,
}

impl ReadingRing {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    /// Buffer a reading, dropping the oldest when at capacity.
    /// Returns true when an old reading was evicted.
    pub fn push(&self, reading: Reading) -> bool {
        let mut buf = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let evicted = buf.len() >= self.cap;
        if evicted {
            buf.pop_front();
        }
        buf.push_back(reading);
        evicted
    }

    /// Take all buffered readings, oldest first.
    pub fn drain(&self) -> Vec<Reading> {
        let mut buf = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PumpStatus;
    use chrono::Utc;

    fn reading(n: i64) -> Reading {
        Reading {
            id: 0,
            timestamp_utc: Utc::now(),
            current_amps: Some(n as f64),
            status: PumpStatus::Normal,
            raw_text: n.to_string(),
            confidence: 0.9,
            image_ref: None,
            processing_ms: 0,
            synced: false,
            error: None,
        }
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let ring = ReadingRing::new(2);
        assert!(!ring.push(reading(1)));
        assert!(!ring.push(reading(2)));
        assert!(ring.push(reading(3)));

        let drained = ring.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].raw_text, "2");
        assert_eq!(drained[1].raw_text, "3");
        assert!(ring.is_empty());
    }
}
