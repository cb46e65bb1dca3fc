// This file is part of invest-ingester.
// Copyright (C) 2025 invest-ingester contributors
// SPDX-License-Identifier: Apache-2.0

pub mod history;
pub mod instruments;
pub mod rate_limit;

use serde::Deserialize;

/// Configuration for the Invest API clients.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "base_url_default")]
    pub base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: base_url_default(),
        }
    }
}

fn base_url_default() -> String {
    "https://invest-public-api.tinkoff.ru".to_string()
}
