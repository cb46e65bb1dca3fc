// This file is part of invest-ingester.
// Copyright (C) 2025 invest-ingester contributors
// SPDX-License-Identifier: Apache-2.0

use crate::infra;
use ingester_common::infra::pool::postgres;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(rename = "api", default)]
    pub api_config: infra::api::Config,

    #[serde(rename = "storage", default)]
    pub storage_config: postgres::Config,
}
