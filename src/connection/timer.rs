// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;
use std::time::Instant;

/// The retransmission timer of a session.
///
/// It times the oldest unacknowledged segment only.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timer {
    /// Sequence number of the timed segment.
    pub seq: u32,

    /// When the timed segment was last (re)transmitted.
    pub sent_time: Instant,

    /// Whether the timed segment has been transmitted more than once. Such a
    /// segment never yields an RTT sample.
    pub retransmitted: bool,
}

impl Timer {
    pub fn new(seq: u32, sent_time: Instant, retransmitted: bool) -> Self {
        Self {
            seq,
            sent_time,
            retransmitted,
        }
    }

    /// Check whether the timer has been running longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_time) > timeout
    }

    /// Return the RTT sample for an ack of `ack`, following Karn's algorithm:
    /// only the timed segment, and only if it was never retransmitted.
    pub fn rtt_sample(&self, ack: u32, now: Instant) -> Option<Duration> {
        if ack != self.seq || self.retransmitted {
            return None;
        }
        Some(now.saturating_duration_since(self.sent_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_expiration() {
        let now = Instant::now();
        let timer = Timer::new(3, now, false);
        let timeout = Duration::from_millis(200);

        assert!(!timer.is_expired(timeout, now));
        assert!(!timer.is_expired(timeout, now + timeout));
        assert!(timer.is_expired(timeout, now + timeout + Duration::from_millis(1)));
    }

    #[test]
    fn timer_rtt_sample() {
        let now = Instant::now();
        let later = now + Duration::from_millis(30);

        let timer = Timer::new(5, now, false);
        assert_eq!(timer.rtt_sample(5, later), Some(Duration::from_millis(30)));
        assert_eq!(timer.rtt_sample(4, later), None);
        assert_eq!(timer.rtt_sample(6, later), None);

        let timer = Timer::new(5, now, true);
        assert_eq!(timer.rtt_sample(5, later), None);
    }
}
