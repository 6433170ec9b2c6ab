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
use std::fmt;

use strum_macros::EnumCount;
use strum_macros::EnumIter;

use crate::MIN_SSTHRESH;
pub use reno::Reno;

/// States of the Reno window state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum CongestionState {
    /// The window grows by the number of newly acknowledged segments.
    SlowStart,

    /// The window grows by one segment per window of acknowledged segments.
    CongestionAvoidance,

    /// A segment was fast retransmitted; the window is inflated by each
    /// duplicate ack until new data is acknowledged.
    FastRecovery,

    /// Every segment has been acknowledged.
    Finished,
}

impl fmt::Display for CongestionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CongestionState::SlowStart => "SLOW_START",
            CongestionState::CongestionAvoidance => "CONGESTION_AVOIDANCE",
            CongestionState::FastRecovery => "FAST_RECOVERY",
            CongestionState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Inputs of the Reno window state machine.
///
/// The third duplicate ack is not an input: it is derived from `DupAck`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CongestionEvent {
    /// The cumulative ack advanced to the given value.
    NewAck(u32),

    /// The given ack value did not advance the cumulative ack.
    DupAck(u32),

    /// The retransmission timer of the given segment expired.
    Timeout(u32),

    /// The cumulative ack reached the last segment.
    Finish(u32),
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Segments sent for the first time.
    pub segments_sent: u64,

    /// Segments sent again, by fast retransmit, timeout or go-back-N.
    pub segments_retransmitted: u64,

    /// Acks that advanced the cumulative ack.
    pub new_acks: u64,

    /// Acks repeating the cumulative ack.
    pub dup_acks: u64,

    /// Acks below the cumulative ack, ignored.
    pub stale_acks: u64,

    /// Fast retransmissions triggered by three duplicate acks.
    pub fast_retransmits: u64,

    /// Retransmission timeouts.
    pub timeouts: u64,

    /// Largest congestion window in segments.
    pub max_cwnd: u64,
}

/// Return the slow start threshold after a loss signal.
pub fn loss_ssthresh(cwnd: u64) -> u64 {
    cmp::max(cwnd / 2, MIN_SSTHRESH)
}


mod reno;
