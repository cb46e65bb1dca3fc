// This file is part of invest-ingester.
// Copyright (C) 2025 invest-ingester contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::{debug, info};
use regex::Regex;
use reqwest::header::HeaderMap;
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task,
    time::{self, Instant},
};

/// Priority offset applied to the single retry of a failed request, so that retries line up
/// behind the first attempts of all other instruments.
pub const SECOND_CHANCE_PRIORITY: u64 = 1_000_000;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

// Until the first response teaches the actual policy, allow a single request per minute.
const INITIAL_CAPACITY: u32 = 1;
const INITIAL_PERIOD: Duration = Duration::from_secs(60);

static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?<n1>\d+)\D+(?<n2>\d+)\D+w=(?<sec>\d+)").expect("limit header regex is valid")
});

/// The token bucket policy of the archive endpoint: `requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub requests: u32,
    pub window: Duration,
}

/// Rate-limiting facts carried by the headers of one upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitInfo {
    pub policy: Option<Policy>,
    pub remaining: Option<u32>,
    pub reset: Option<Duration>,
}

impl RateLimitInfo {
    /// Parse the rate-limiting headers of one response. Absent headers and values that do not
    /// match the expected grammar are ignored; an unparseable limit header is logged.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let policy = headers
            .get(LIMIT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                let policy = parse_policy(value);
                if policy.is_none() {
                    debug!(header = value; "unexpected rate limit header format");
                }
                policy
            });

        let remaining = header_number::<u32>(headers, REMAINING_HEADER);
        let reset = header_number::<u64>(headers, RESET_HEADER).map(Duration::from_secs);

        Self {
            policy,
            remaining,
            reset,
        }
    }
}

fn parse_policy(value: &str) -> Option<Policy> {
    let captures = LIMIT_RE.captures(value)?;
    let n1 = captures["n1"].parse::<u32>().ok()?;
    let n2 = captures["n2"].parse::<u32>().ok()?;
    let window = captures["sec"].parse::<u64>().ok()?;

    let requests = n1.min(n2);
    if requests == 0 || window == 0 {
        return None;
    }

    Some(Policy {
        requests,
        window: Duration::from_secs(window),
    })
}

fn header_number<T>(headers: &HeaderMap, name: &str) -> Option<T>
where
    T: FromStr,
{
    headers.get(name)?.to_str().ok()?.parse().ok()
}

/// Token bucket admitter for the archive endpoint, learning its capacity and refill period
/// from response headers.
///
/// All state lives in a single owner task that receives admission requests and header
/// observations over a channel. Requests are admitted in strict priority order, ties broken
/// by enqueue order; callers wait indefinitely for a token. The owner task terminates when
/// the last handle is dropped.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    sender: mpsc::UnboundedSender<Message>,
}

impl RateLimiter {
    /// Spawn the owner task; must be called within the runtime.
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        task::spawn(run(receiver));

        Self { sender }
    }

    /// Wait until a request at the given priority is admitted. Smaller priorities win.
    pub async fn acquire(&self, priority: u64) {
        let (permit, admitted) = oneshot::channel();
        if self
            .sender
            .send(Message::Acquire { priority, permit })
            .is_ok()
        {
            let _ = admitted.await;
        }
    }

    /// Feed the rate-limiting facts of one response back into the bucket.
    pub fn observe(&self, info: RateLimitInfo) {
        let _ = self.sender.send(Message::Observe(info));
    }
}

#[derive(Debug)]
enum Message {
    Acquire {
        priority: u64,
        permit: oneshot::Sender<()>,
    },

    Observe(RateLimitInfo),
}

#[derive(Debug)]
struct Ticket {
    priority: u64,
    seq: u64,
    permit: oneshot::Sender<()>,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

async fn run(mut receiver: mpsc::UnboundedReceiver<Message>) {
    let mut tokens = INITIAL_CAPACITY;
    let mut capacity = INITIAL_CAPACITY;
    let mut period = INITIAL_PERIOD;
    let mut next_refill_at = Instant::now() + period;
    let mut policy_learned = false;
    let mut queue = BinaryHeap::<Reverse<Ticket>>::new();
    let mut next_seq = 0;

    loop {
        while tokens > 0 {
            let Some(Reverse(ticket)) = queue.pop() else {
                break;
            };
            // A dropped waiter must not burn a token.
            if ticket.permit.send(()).is_ok() {
                tokens -= 1;
            }
        }

        select! {
            message = receiver.recv() => match message {
                Some(Message::Acquire { priority, permit }) => {
                    queue.push(Reverse(Ticket {
                        priority,
                        seq: next_seq,
                        permit,
                    }));
                    next_seq += 1;
                }

                Some(Message::Observe(info)) => {
                    if !policy_learned {
                        if let Some(policy) = info.policy {
                            capacity = policy.requests;
                            period = policy.window;
                            policy_learned = true;
                            info!(capacity, period:? = period; "rate limit policy learned");
                        }
                    }

                    if let Some(reset) = info.reset {
                        let candidate = Instant::now() + reset;
                        if candidate < next_refill_at {
                            next_refill_at = candidate;
                        }
                    }

                    if tokens == 0 {
                        if let Some(remaining) = info.remaining {
                            tokens = remaining;
                        }
                    }
                }

                None => break,
            },

            _ = time::sleep_until(next_refill_at) => {
                while Instant::now() >= next_refill_at {
                    tokens = capacity;
                    next_refill_at += period;
                }
            }
        }
    }
}
