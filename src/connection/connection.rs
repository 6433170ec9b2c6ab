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

use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

use log::*;

use self::rtt::RttEstimator;
use self::timer::Timer;
use crate::congestion_control::CongestionEvent;
use crate::congestion_control::CongestionState;
use crate::congestion_control::CongestionStats;
use crate::congestion_control::Reno;
use crate::packet;
use crate::packet::PacketType;
use crate::Chunk;
use crate::Config;
use crate::PacketSendHandler;
use crate::Result;

pub use self::download::Download;

/// Last transmission of a segment.
#[derive(Debug, Clone, Copy)]
struct SentSegment {
    time: Instant,
    retransmitted: bool,
}

/// The sending side of a chunk transfer to one peer.
///
/// A session is created when a peer asks for a chunk with GET and lives until
/// the peer acknowledges the last segment. Every entry point takes the
/// current time and the handler used to put DATA packets on the wire.
pub struct Session {
    /// The requesting peer.
    peer: SocketAddr,

    /// The chunk being sent.
    chunk: Chunk,

    /// Window control.
    reno: Reno,

    /// Retransmission timeout estimation.
    rtt: RttEstimator,

    /// Retransmission timer of the oldest unacknowledged segment.
    timer: Option<Timer>,

    /// Last transmission of each segment, indexed by sequence number - 1.
    sent: Vec<Option<SentSegment>>,

    /// Value of the source-id header field.
    source_id: u8,

    /// Timeouts since the last new ack.
    consecutive_timeouts: u32,

    /// Unique trace id for debug logging.
    trace_id: String,
}

impl Session {
    pub fn new(peer: SocketAddr, chunk: Chunk, conf: &Config) -> Self {
        let segment_count = chunk.segment_count();
        Session {
            peer,
            reno: Reno::new(segment_count, conf.initial_ssthresh),
            rtt: RttEstimator::new(conf.timeout),
            timer: None,
            sent: vec![None; segment_count as usize],
            source_id: conf.source_id,
            consecutive_timeouts: 0,
            trace_id: peer.to_string(),
            chunk,
        }
    }

    /// Start the transfer by sending the first segment.
    pub fn start(&mut self, now: Instant, sender: &dyn PacketSendHandler) -> Result<()> {
        self.reno.start()?;
        info!(
            "{} start sending chunk {}, {} segments",
            self.trace_id,
            self.chunk.hash(),
            self.chunk.segment_count()
        );

        self.send_window(now, sender);
        Ok(())
    }

    /// Process an ACK from the peer.
    ///
    /// Return the state after the transition. An ack beyond the highest sent
    /// segment is rejected with `Error::InvalidPacket`.
    pub fn transit(
        &mut self,
        ack: u32,
        now: Instant,
        sender: &dyn PacketSendHandler,
    ) -> Result<CongestionState> {
        let event = self.reno.classify(ack)?;
        trace!("{} recv ack {} as {:?}", self.trace_id, ack, event);

        match event {
            CongestionEvent::NewAck(a) | CongestionEvent::Finish(a) => {
                if let Some(rtt) = self.timer.and_then(|t| t.rtt_sample(a, now)) {
                    self.rtt.sample(rtt);
                    trace!(
                        "{} rtt sample {:?}, timeout {:?}",
                        self.trace_id,
                        rtt,
                        self.rtt.timeout()
                    );
                }
                self.consecutive_timeouts = 0;
                self.reno.on_event(event);
                self.rebind_timer(a);
            }

            CongestionEvent::DupAck(_) => {
                if let Some(seq) = self.reno.on_event(event) {
                    debug!(
                        "{} fast retransmit segment {}, cwnd {} ssthresh {}",
                        self.trace_id,
                        seq,
                        self.reno.congestion_window(),
                        self.reno.ssthresh()
                    );
                    self.timer = None;
                    self.send_segment(seq, true, now, sender);
                }
            }

            // Timeouts are raised by the session itself.
            CongestionEvent::Timeout(_) => (),
        }

        if self.is_finished() {
            info!(
                "{} chunk {} acknowledged, {:?}",
                self.trace_id,
                self.chunk.hash(),
                self.reno.stats()
            );
            return Ok(CongestionState::Finished);
        }

        self.send_window(now, sender);
        Ok(self.reno.state())
    }

    /// Check whether the retransmission timer has expired.
    pub fn is_timer_expired(&self, now: Instant) -> bool {
        self.timer
            .map_or(false, |t| t.is_expired(self.rtt.timeout(), now))
    }

    /// Handle a retransmission timeout: go back to the timed segment and
    /// resend it. The timer restarts with the retransmission.
    pub fn on_timeout(&mut self, now: Instant, sender: &dyn PacketSendHandler) {
        let timer = match self.timer {
            Some(t) => t,
            None => return,
        };

        if let Some(seq) = self.reno.on_event(CongestionEvent::Timeout(timer.seq)) {
            self.consecutive_timeouts += 1;
            debug!(
                "{} segment {} timeout after {:?}, ssthresh {}",
                self.trace_id,
                seq,
                self.rtt.timeout(),
                self.reno.ssthresh()
            );
            self.timer = None;
            self.send_segment(seq, true, now, sender);
        }
    }

    /// Double the retransmission timeout.
    pub fn backoff(&mut self) {
        self.rtt.backoff();
    }

    /// Move the timer past the cumulative ack `ack`.
    fn rebind_timer(&mut self, ack: u32) {
        match self.timer {
            Some(t) if t.seq > ack => return,
            _ => (),
        }

        let next = ack + 1;
        self.timer = match self.sent.get(ack as usize) {
            Some(Some(s)) if next <= self.reno.last_sent() && !self.is_finished() => {
                Some(Timer::new(next, s.time, s.retransmitted))
            }
            _ => None,
        };
    }

    /// Send every segment the window allows.
    fn send_window(&mut self, now: Instant, sender: &dyn PacketSendHandler) {
        while let Some((seq, retransmitted)) = self.reno.next_segment() {
            self.send_segment(seq, retransmitted, now, sender);
        }
    }

    fn send_segment(
        &mut self,
        seq: u32,
        retransmitted: bool,
        now: Instant,
        sender: &dyn PacketSendHandler,
    ) {
        if let Some(s) = self.sent.get_mut(seq as usize - 1) {
            *s = Some(SentSegment {
                time: now,
                retransmitted,
            });
        }
        if self.timer.is_none() {
            self.timer = Some(Timer::new(seq, now, retransmitted));
        }

        let pkt = match self.chunk.segment(seq).and_then(|payload| {
            packet::encode(PacketType::Data, self.source_id, seq, 0, &payload)
        }) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("{} build segment {} failed: {:?}", self.trace_id, seq, e);
                return;
            }
        };

        trace!(
            "{} send segment {}{}",
            self.trace_id,
            seq,
            if retransmitted { " again" } else { "" }
        );
        // Lost sends are recovered by retransmission.
        if let Err(e) = sender.on_packets_send(&[(pkt, self.peer)]) {
            warn!("{} send segment {} failed: {:?}", self.trace_id, seq, e);
        }
    }

    /// Return the peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Return the chunk being sent.
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn state(&self) -> CongestionState {
        self.reno.state()
    }

    pub fn is_finished(&self) -> bool {
        self.reno.state() == CongestionState::Finished
    }

    /// Return the retransmission timer, if a segment is being timed.
    pub fn timer(&self) -> Option<&Timer> {
        self.timer.as_ref()
    }

    /// Return the current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        self.rtt.timeout()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn congestion_window(&self) -> u64 {
        self.reno.congestion_window()
    }

    pub fn ssthresh(&self) -> u64 {
        self.reno.ssthresh()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn stats(&self) -> &CongestionStats {
        self.reno.stats()
    }

    /// Return the trace id of the session, the peer address.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}


pub mod rtt;
pub mod timer;
mod download;
