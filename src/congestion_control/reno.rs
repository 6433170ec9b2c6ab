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

use std::cmp;

use log::*;

use super::loss_ssthresh;
use super::CongestionEvent;
use super::CongestionEvent::*;
use super::CongestionState;
use super::CongestionState::*;
use super::CongestionStats;
use crate::Error;
use crate::Result;

/// Number of duplicate acks that triggers a fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// The cumulative ack before anything is acknowledged.
const INITIAL_ACK: i64 = -1;

/// Duplicate ack counter for a single ack value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DupAckCounter {
    /// The duplicated ack value.
    ack: u32,

    /// How many times `ack` has been duplicated.
    count: u32,
}

/// TCP Reno style window control for one chunk transfer.
///
/// Windows are counted in segments. Acknowledgments are cumulative and lost
/// segments are recovered with Go-Back-N: after a loss signal the sender
/// resumes right after the retransmitted segment.
///
/// See RFC 5681.
#[derive(Debug)]
pub struct Reno {
    /// Current state.
    state: CongestionState,

    /// Congestion window in segments.
    cwnd: u64,

    /// Slow start threshold in segments.
    ssthresh: u64,

    /// Segments sent but not acknowledged.
    unacked: u64,

    /// The cumulative ack.
    last_ack: i64,

    /// The last sent sequence number. The next segment to send follows it.
    last_sent: u32,

    /// The highest sequence number ever sent.
    max_sent: u32,

    /// Number of segments of the chunk.
    segment_count: u32,

    /// Duplicate ack counter, reset whenever the cumulative ack advances.
    dup_acks: Option<DupAckCounter>,

    /// Segments acknowledged since the last window increase in congestion
    /// avoidance.
    new_acks: u64,

    /// Statistics.
    stats: CongestionStats,
}

impl Reno {
    pub fn new(segment_count: u32, initial_ssthresh: u64) -> Self {
        Self {
            state: SlowStart,
            cwnd: 0,
            ssthresh: initial_ssthresh,
            unacked: 1,
            last_ack: INITIAL_ACK,
            last_sent: 0,
            max_sent: 0,
            segment_count,
            dup_acks: None,
            new_acks: 0,
            stats: CongestionStats::default(),
        }
    }

    /// Open the window for the first segment.
    ///
    /// It advances the cumulative ack from -1 to 0 in slow start, after which
    /// the window holds exactly one segment.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SlowStart || self.last_ack != INITIAL_ACK {
            return Err(Error::InvalidState("reno already started".into()));
        }

        self.on_event(NewAck(0));
        Ok(())
    }

    /// Classify an ack value received from the peer.
    pub fn classify(&self, ack: u32) -> Result<CongestionEvent> {
        // A peer cannot acknowledge what was never sent.
        if ack > self.max_sent {
            return Err(Error::InvalidPacket);
        }

        if ack == self.segment_count {
            return Ok(Finish(ack));
        }

        if ack as i64 > self.last_ack {
            Ok(NewAck(ack))
        } else {
            Ok(DupAck(ack))
        }
    }

    /// Apply an event.
    ///
    /// Return the sequence number to retransmit right away, if any. New
    /// segments allowed by the window are then drained by `next_segment()`.
    pub fn on_event(&mut self, event: CongestionEvent) -> Option<u32> {
        let old_state = self.state;
        let retransmit = match (self.state, event) {
            (Finished, _) => None,

            (_, Finish(ack)) => {
                self.advance(ack);
                self.state = Finished;
                None
            }

            (SlowStart, NewAck(ack)) => {
                let delta = self.advance(ack);
                self.cwnd += delta;
                if self.cwnd >= self.ssthresh {
                    self.state = CongestionAvoidance;
                }
                None
            }

            (CongestionAvoidance, NewAck(ack)) => {
                let delta = self.advance(ack);
                self.new_acks += delta;
                if self.new_acks >= self.cwnd {
                    self.cwnd += 1;
                    self.new_acks = 0;
                }
                None
            }

            (FastRecovery, NewAck(ack)) => {
                self.advance(ack);
                // Deflate the window.
                self.cwnd = self.ssthresh;
                self.new_acks = 0;
                self.state = CongestionAvoidance;

                // Segments beyond the deflated window are sent again later.
                if self.unacked > self.cwnd {
                    self.unacked = self.cwnd;
                    self.last_sent = ack + self.cwnd as u32;
                }
                None
            }

            (SlowStart | CongestionAvoidance, DupAck(ack)) => {
                if self.count_dup_ack(ack) == Some(DUP_ACK_THRESHOLD) {
                    Some(self.fast_retransmit(ack))
                } else {
                    None
                }
            }

            (FastRecovery, DupAck(ack)) => {
                // Inflate the window for each segment that left the network.
                if self.count_dup_ack(ack).is_some() {
                    self.cwnd += 1;
                }
                None
            }

            (SlowStart | CongestionAvoidance | FastRecovery, Timeout(seq)) => {
                Some(self.timeout_retransmit(seq))
            }
        };

        self.stats.max_cwnd = cmp::max(self.stats.max_cwnd, self.cwnd);
        if old_state != self.state {
            trace!(
                "reno {} -> {} on {:?}, cwnd {} ssthresh {}",
                old_state,
                self.state,
                event,
                self.cwnd,
                self.ssthresh
            );
        }

        retransmit
    }

    /// Take the next segment allowed by the window.
    ///
    /// Return the sequence number and whether it has been sent before, or
    /// `None` if the window is full or every segment has been sent.
    pub fn next_segment(&mut self) -> Option<(u32, bool)> {
        if self.state == Finished
            || self.unacked >= self.cwnd
            || self.last_sent >= self.segment_count
        {
            return None;
        }

        self.last_sent += 1;
        self.unacked += 1;

        let retransmitted = self.last_sent <= self.max_sent;
        if retransmitted {
            self.stats.segments_retransmitted += 1;
        } else {
            self.max_sent = self.last_sent;
            self.stats.segments_sent += 1;
        }

        Some((self.last_sent, retransmitted))
    }

    /// Move the cumulative ack forward and return how many segments it
    /// covers.
    fn advance(&mut self, ack: u32) -> u64 {
        // The seeding step of `start()` is not an ack from the peer.
        if self.last_ack != INITIAL_ACK {
            self.stats.new_acks += 1;
        }

        let delta = (ack as i64 - self.last_ack) as u64;
        self.unacked = self.unacked.saturating_sub(delta);
        self.last_ack = ack as i64;

        // An ack sent before a go-back may cover segments not resent yet.
        if ack > self.last_sent {
            self.last_sent = ack;
        }

        self.dup_acks = None;
        delta
    }

    /// Count a duplicate ack and return the number of duplicates of `ack`.
    ///
    /// Acks below the cumulative ack are stale and never counted.
    fn count_dup_ack(&mut self, ack: u32) -> Option<u32> {
        if ack as i64 != self.last_ack {
            self.stats.stale_acks += 1;
            return None;
        }
        self.stats.dup_acks += 1;

        match self.dup_acks {
            Some(ref mut c) if c.ack == ack => c.count += 1,
            _ => self.dup_acks = Some(DupAckCounter { ack, count: 1 }),
        }
        Some(self.dup_ack_count(ack))
    }

    fn fast_retransmit(&mut self, ack: u32) -> u32 {
        self.ssthresh = loss_ssthresh(self.cwnd);
        self.cwnd = self.ssthresh + DUP_ACK_THRESHOLD as u64;
        self.new_acks = 0;
        self.state = FastRecovery;

        let seq = ack + 1;
        self.go_back(seq);
        self.stats.fast_retransmits += 1;
        seq
    }

    fn timeout_retransmit(&mut self, seq: u32) -> u32 {
        self.ssthresh = loss_ssthresh(self.cwnd);
        self.cwnd = 1;
        self.new_acks = 0;
        self.dup_acks = None;
        self.state = SlowStart;

        self.go_back(seq);
        self.stats.timeouts += 1;
        seq
    }

    /// Rewind the send pointer so that `seq` is the only segment in flight.
    fn go_back(&mut self, seq: u32) {
        self.unacked = 1;
        self.last_sent = seq;
        self.stats.segments_retransmitted += 1;
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    pub fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    pub fn unacked(&self) -> u64 {
        self.unacked
    }

    /// Return the cumulative ack, -1 before anything is acknowledged.
    pub fn last_ack(&self) -> i64 {
        self.last_ack
    }

    pub fn last_sent(&self) -> u32 {
        self.last_sent
    }

    pub fn max_sent(&self) -> u32 {
        self.max_sent
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    /// Return how many duplicates of `ack` have been counted.
    pub fn dup_ack_count(&self, ack: u32) -> u32 {
        match self.dup_acks {
            Some(c) if c.ack == ack => c.count,
            _ => 0,
        }
    }

    pub fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}
