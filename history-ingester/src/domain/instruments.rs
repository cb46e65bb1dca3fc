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

use crate::domain::{AssetType, InstrumentRecord};
use std::error::Error as StdError;

/// Instrument metadata service abstraction.
#[trait_variant::make(Send)]
pub trait Instruments
where
    Self: Clone + Send + Sync + 'static,
{
    type Error: StdError + Send + Sync + 'static;

    /// List all instruments of the given asset type.
    async fn get_instruments(
        &self,
        asset_type: AssetType,
    ) -> Result<Vec<InstrumentRecord>, Self::Error>;
}
