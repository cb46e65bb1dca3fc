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

pub mod history;
pub mod instruments;
pub mod storage;

use chrono::NaiveDateTime;
use std::fmt::{self, Display};
use uuid::Uuid;

/// The asset classes known to the instrument metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetType {
    Bond,
    Currency,
    Etf,
    Future,
    Option,
    Share,
}

impl AssetType {
    pub const ALL: [AssetType; 6] = [
        AssetType::Bond,
        AssetType::Currency,
        AssetType::Etf,
        AssetType::Future,
        AssetType::Option,
        AssetType::Share,
    ];

    /// The reference row name in the `asset_type` table.
    pub fn name(&self) -> &'static str {
        match self {
            AssetType::Bond => "bond",
            AssetType::Currency => "currency",
            AssetType::Etf => "etf",
            AssetType::Future => "future",
            AssetType::Option => "option",
            AssetType::Share => "share",
        }
    }

    /// The InstrumentsService method listing instruments of this type.
    pub fn service_method(&self) -> &'static str {
        match self {
            AssetType::Bond => "Bonds",
            AssetType::Currency => "Currencies",
            AssetType::Etf => "Etfs",
            AssetType::Future => "Futures",
            AssetType::Option => "Options",
            AssetType::Share => "Shares",
        }
    }
}

impl Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A tradable instrument as stored, including its surrogate id.
///
/// The `uid` identifies the instrument at the metadata service across time; the surrogate `id`
/// is stable once assigned and is what candle rows reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub id: i32,
    pub uid: Uuid,
    pub figi: Option<String>,
    pub name: String,
    pub lot: i32,
    pub otc_flag: bool,
    pub for_qual_investor_flag: bool,
    pub api_trade_available_flag: bool,
    pub first_1min_candle_date: Option<NaiveDateTime>,
    pub first_1day_candle_date: Option<NaiveDateTime>,
}

/// An instrument as returned by the metadata service, before an id has been assigned.
///
/// Timestamps are naive UTC wall-clock; an unknown earliest candle date is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRecord {
    pub uid: Uuid,
    pub figi: Option<String>,
    pub name: String,
    pub lot: i32,
    pub otc_flag: bool,
    pub for_qual_investor_flag: bool,
    pub api_trade_available_flag: bool,
    pub first_1min_candle_date: Option<NaiveDateTime>,
    pub first_1day_candle_date: Option<NaiveDateTime>,
}

/// Historical OHLCV datum for one instrument at one timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub instrument_id: i32,
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: i64,
}

/// Where an instrument's stored candle history currently ends: the latest stored candle
/// timestamp, or the earliest known candle date when nothing is stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEnding {
    pub instrument: Instrument,
    pub history_end: NaiveDateTime,
}
