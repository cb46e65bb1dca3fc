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

use crate::domain::Instrument;
use futures::Stream;
use std::error::Error as StdError;

/// Candle history archive abstraction.
#[trait_variant::make(Send)]
pub trait HistoryArchives
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    /// Stream of loadable candle CSVs for one instrument, one item per year of archive,
    /// starting at `first_year` and ending with the current calendar year or wherever the
    /// archive service reports the history exhausted. Yielded CSVs reference the instrument
    /// by its numeric id and carry no trailing delimiters.
    ///
    /// `priority` orders this instrument's requests against other instruments when the
    /// archive quota is scarce; smaller values win. Callers assign priorities monotonically,
    /// so earlier-started instruments dominate later ones.
    fn history_csvs(
        &self,
        instrument: Instrument,
        first_year: i32,
        priority: u64,
    ) -> impl Stream<Item = Result<Vec<u8>, Self::Error>> + Send;
}
