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

use crate::domain::{AssetType, HistoryEnding, InstrumentRecord};
use futures::Stream;

/// Storage abstraction.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Upsert a batch of instruments of the given asset type, keyed on `uid`. On conflict
    /// every non-PK column is overwritten with the incoming value.
    async fn add_instruments(
        &self,
        asset_type: AssetType,
        instruments: &[InstrumentRecord],
    ) -> Result<(), sqlx::Error>;

    /// Get the history ending for each instrument with a FIGI and a known earliest candle
    /// date, optionally restricted to the given FIGIs, ordered by ascending history end so
    /// that the instruments needing the most fetches come first.
    fn get_history_endings(
        &self,
        figis: Option<Vec<String>>,
    ) -> impl Stream<Item = Result<HistoryEnding, sqlx::Error>> + Send;

    /// Bulk-load one rewritten candle CSV into the candle table, silently dropping rows that
    /// collide with already stored candles. Idempotent.
    async fn save_candle_history(&self, csv: Vec<u8>) -> Result<(), sqlx::Error>;
}
