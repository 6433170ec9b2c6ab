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

use crate::INITIAL_RTT;

/// Weight of a new sample in the smoothed RTT.
const ALPHA: f64 = 0.125;

/// Weight of a new deviation sample in the RTT deviation.
const BETA: f64 = 0.25;

/// RTT estimation for a peer session.
/// See RFC 6298 Section 2
#[derive(Debug)]
pub struct RttEstimator {
    /// Exponentially weighted moving average of the RTT samples.
    estimated_rtt: Duration,

    /// Mean deviation of the RTT samples.
    dev_rtt: Duration,

    /// The current retransmission timeout.
    timeout: Duration,

    /// The configured timeout, if the timeout is not estimated.
    fixed_timeout: Option<Duration>,
}

impl RttEstimator {
    /// Create an estimator. `None` estimates the timeout from RTT samples,
    /// otherwise the given timeout is used for the lifetime of the session.
    pub fn new(fixed_timeout: Option<Duration>) -> Self {
        Self {
            estimated_rtt: INITIAL_RTT,
            dev_rtt: Duration::ZERO,
            timeout: fixed_timeout.unwrap_or(INITIAL_RTT),
            fixed_timeout,
        }
    }

    /// Return the smoothed RTT.
    pub fn estimated_rtt(&self) -> Duration {
        self.estimated_rtt
    }

    /// Return the RTT deviation.
    pub fn dev_rtt(&self) -> Duration {
        self.dev_rtt
    }

    /// Return the current retransmission timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Return whether the timeout is estimated from samples.
    pub fn is_estimating(&self) -> bool {
        self.fixed_timeout.is_none()
    }

    /// Double the current timeout after a retransmission timeout.
    pub fn backoff(&mut self) {
        self.timeout = self.timeout.saturating_mul(2);
    }

    /// Update estimator with the given RTT sample.
    ///
    /// A fixed timeout is never derived from samples; a sample only restores
    /// it after backoff.
    pub fn sample(&mut self, rtt: Duration) {
        if let Some(timeout) = self.fixed_timeout {
            self.timeout = timeout;
            return;
        }

        self.estimated_rtt = self.estimated_rtt.mul_f64(1.0 - ALPHA) + rtt.mul_f64(ALPHA);

        let var_sample = if self.estimated_rtt > rtt {
            self.estimated_rtt - rtt
        } else {
            rtt - self.estimated_rtt
        };
        self.dev_rtt = self.dev_rtt.mul_f64(1.0 - BETA) + var_sample.mul_f64(BETA);

        self.timeout = self.estimated_rtt + 4 * self.dev_rtt;
    }
}
