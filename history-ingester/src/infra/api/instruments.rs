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
    domain::{self, AssetType, InstrumentRecord},
    infra::api::Config,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

const SERVICE_PATH: &str = "rest/tinkoff.public.invest.api.contract.v1.InstrumentsService";
const INSTRUMENT_STATUS_ALL: &str = "INSTRUMENT_STATUS_ALL";

/// Error possibly returned by [InstrumentsClient].
#[derive(Debug, Error)]
#[error("cannot get instruments from metadata service")]
pub struct InstrumentsError(#[from] reqwest::Error);

/// Client for the instrument metadata service. Cheap to clone; all clones share one HTTP
/// session.
#[derive(Debug, Clone)]
pub struct InstrumentsClient {
    client: Client,
    base_url: String,
    token: SecretString,
}

impl InstrumentsClient {
    pub fn new(config: Config, token: SecretString, client: Client) -> Self {
        Self {
            client,
            base_url: config.base_url,
            token,
        }
    }
}

impl domain::instruments::Instruments for InstrumentsClient {
    type Error = InstrumentsError;

    async fn get_instruments(
        &self,
        asset_type: AssetType,
    ) -> Result<Vec<InstrumentRecord>, InstrumentsError> {
        let url = format!(
            "{}/{}/{}",
            self.base_url,
            SERVICE_PATH,
            asset_type.service_method()
        );

        let started_at = Instant::now();
        let response = self
            .client
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .json(&InstrumentsRequest {
                instrument_status: INSTRUMENT_STATUS_ALL,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<InstrumentsResponse>()
            .await?;

        debug!(
            asset_type:% = asset_type,
            count = response.instruments.len(),
            elapsed:? = started_at.elapsed();
            "instruments received"
        );

        Ok(response
            .instruments
            .into_iter()
            .map(Into::into)
            .collect())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsRequest {
    instrument_status: &'static str,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    #[serde(default)]
    instruments: Vec<ApiInstrument>,
}

/// Instrument as returned by the InstrumentsService. Timestamps carry a timezone; the Unix
/// epoch means "unknown".
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInstrument {
    uid: Uuid,

    #[serde(default)]
    figi: Option<String>,

    name: String,

    lot: i32,

    #[serde(default)]
    otc_flag: bool,

    #[serde(default)]
    for_qual_investor_flag: bool,

    #[serde(default)]
    api_trade_available_flag: bool,

    #[serde(default, rename = "first1MinCandleDate")]
    first_1min_candle_date: Option<DateTime<Utc>>,

    #[serde(default, rename = "first1DayCandleDate")]
    first_1day_candle_date: Option<DateTime<Utc>>,
}

impl From<ApiInstrument> for InstrumentRecord {
    fn from(instrument: ApiInstrument) -> Self {
        Self {
            uid: instrument.uid,
            figi: instrument.figi.filter(|figi| !figi.is_empty()),
            name: instrument.name,
            lot: instrument.lot,
            otc_flag: instrument.otc_flag,
            for_qual_investor_flag: instrument.for_qual_investor_flag,
            api_trade_available_flag: instrument.api_trade_available_flag,
            first_1min_candle_date: naive_datetime(instrument.first_1min_candle_date),
            first_1day_candle_date: naive_datetime(instrument.first_1day_candle_date),
        }
    }
}

/// Clear the timezone and map the epoch to absent.
fn naive_datetime(datetime: Option<DateTime<Utc>>) -> Option<NaiveDateTime> {
    datetime
        .filter(|datetime| datetime.timestamp() != 0)
        .map(|datetime| datetime.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::{ApiInstrument, InstrumentRecord, InstrumentsResponse};
    use chrono::NaiveDate;

    #[test]
    fn test_decode_instruments_response() {
        let response = serde_json::from_str::<InstrumentsResponse>(
            r#"{
                "instruments": [
                    {
                        "uid": "8e2b0325-0292-4654-8a18-4f63ed3b0e09",
                        "figi": "BBG000BCSST7",
                        "name": "Some Share",
                        "lot": 10,
                        "otcFlag": false,
                        "forQualInvestorFlag": false,
                        "apiTradeAvailableFlag": true,
                        "first1MinCandleDate": "2018-03-07T18:33:00Z",
                        "first1DayCandleDate": "1970-01-01T00:00:00Z"
                    }
                ]
            }"#,
        )
        .expect("response can be decoded");

        let record = InstrumentRecord::from(response.instruments.into_iter().next().unwrap());
        assert_eq!(record.figi.as_deref(), Some("BBG000BCSST7"));
        assert_eq!(record.lot, 10);
        assert_eq!(
            record.first_1min_candle_date,
            NaiveDate::from_ymd_opt(2018, 3, 7).and_then(|date| date.and_hms_opt(18, 33, 0))
        );
        // The epoch placeholder is stored as absent.
        assert_eq!(record.first_1day_candle_date, None);
    }

    #[test]
    fn test_decode_empty_figi() {
        let instrument = serde_json::from_str::<ApiInstrument>(
            r#"{
                "uid": "b8a31151-4efc-4d5f-b009-8878f7b62ad4",
                "figi": "",
                "name": "Some Option",
                "lot": 1
            }"#,
        )
        .expect("instrument can be decoded");

        let record = InstrumentRecord::from(instrument);
        assert_eq!(record.figi, None);
        assert_eq!(record.first_1min_candle_date, None);
    }
}
