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

use crate::{
    domain::{self, Instrument},
    extract::{self, ExtractError},
    infra::api::{
        Config,
        rate_limit::{RateLimitInfo, RateLimiter, SECOND_CHANCE_PRIORITY},
    },
};
use async_stream::try_stream;
use chrono::{Datelike, Utc};
use futures::Stream;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::task;

const MESSAGE_HEADER: &str = "message";

/// Errors that end a history stream abnormally. Transient HTTP failures are not among them:
/// they are retried once at demoted priority and then absorbed with a warning.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("cannot extract candle archive")]
    Extract(#[from] ExtractError),

    #[error("extraction task failed")]
    ExtractTask(#[from] task::JoinError),
}

/// Client for the candle history archive endpoint. Cheap to clone; all clones share one HTTP
/// session and one rate limiter, so all instruments compete for the same token bucket.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    client: Client,
    base_url: String,
    token: SecretString,
    limiter: RateLimiter,
}

impl HistoryClient {
    /// Create a new client; must be called within the runtime (spawns the rate limiter).
    pub fn new(config: Config, token: SecretString, client: Client) -> Self {
        Self {
            client,
            base_url: config.base_url,
            token,
            limiter: RateLimiter::spawn(),
        }
    }
}

impl domain::history::HistoryArchives for HistoryClient {
    type Error = HistoryError;

    fn history_csvs(
        &self,
        instrument: Instrument,
        first_year: i32,
        priority: u64,
    ) -> impl Stream<Item = Result<Vec<u8>, HistoryError>> + Send {
        let this = self.clone();

        try_stream! {
            let Some(figi) = instrument.figi.clone() else {
                return;
            };

            let mut priority = priority;
            let mut second_chance_used = false;
            let current_year = Utc::now().year();
            let mut year = first_year;
            let url = format!("{}/history-data", this.base_url);

            loop {
                this.limiter.acquire(priority).await;

                let year_param = year.to_string();
                let response = this
                    .client
                    .get(&url)
                    .query(&[("figi", figi.as_str()), ("year", year_param.as_str())])
                    .bearer_auth(this.token.expose_secret())
                    .send()
                    .await;

                let response = match response {
                    Ok(response) => response,

                    Err(error) => {
                        if spend_second_chance(&mut second_chance_used, &mut priority) {
                            warn!(figi:% = figi, year, error:% = error; "giving up on instrument");
                            return;
                        }
                        debug!(figi:% = figi, year, error:% = error; "retrying at demoted priority");
                        continue;
                    }
                };

                this.limiter
                    .observe(RateLimitInfo::from_headers(response.headers()));

                match response.status() {
                    status if status.is_success() => {
                        let zip = match response.bytes().await {
                            Ok(zip) => zip,

                            Err(error) => {
                                if spend_second_chance(&mut second_chance_used, &mut priority) {
                                    warn!(figi:% = figi, year, error:% = error; "giving up on instrument");
                                    return;
                                }
                                debug!(figi:% = figi, year, error:% = error; "retrying at demoted priority");
                                continue;
                            }
                        };

                        let uid = instrument.uid.to_string();
                        let id = instrument.id;
                        let csv = task::spawn_blocking(move || extract::extract(&zip, &uid, id))
                            .await??;

                        // A successful retry restores the original priority so the remaining
                        // years are not penalized.
                        if second_chance_used {
                            second_chance_used = false;
                            priority -= SECOND_CHANCE_PRIORITY;
                        }

                        debug!(figi:% = figi, year, bytes = csv.len(); "history archive extracted");
                        yield csv;

                        if year == current_year {
                            return;
                        }
                        year += 1;
                    }

                    StatusCode::NOT_FOUND => {
                        // The earliest available year, or no data yet for the current year.
                        debug!(figi:% = figi, year; "end of history");
                        return;
                    }

                    status => {
                        let message = response
                            .headers()
                            .get(MESSAGE_HEADER)
                            .and_then(|message| message.to_str().ok())
                            .map(ToOwned::to_owned);

                        if spend_second_chance(&mut second_chance_used, &mut priority) {
                            warn!(
                                figi:% = figi,
                                year,
                                status:% = status,
                                message:?;
                                "giving up on instrument"
                            );
                            return;
                        }
                        debug!(figi:% = figi, year, status:% = status; "retrying at demoted priority");
                    }
                }
            }
        }
    }
}

/// Returns true when the second chance is already spent; otherwise spends it by demoting the
/// priority behind all first attempts.
fn spend_second_chance(second_chance_used: &mut bool, priority: &mut u64) -> bool {
    if *second_chance_used {
        true
    } else {
        *second_chance_used = true;
        *priority += SECOND_CHANCE_PRIORITY;
        false
    }
}
