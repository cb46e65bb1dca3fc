// This file is part of invest-ingester.
// Copyright (C) 2025 invest-ingester contributors
// SPDX-License-Identifier: Apache-2.0

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::de::DeserializeOwned;
use std::env;

const CONFIG_FILE_ENV_VAR: &str = "CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Extension methods for configuration structs.
pub trait ConfigExt
where
    Self: DeserializeOwned,
{
    /// Load the configuration from the YAML file named by the `CONFIG_FILE` environment
    /// variable (`config.yaml` by default), with overrides from `APP__` prefixed environment
    /// variables using `__` as nesting separator, e.g. `APP__STORAGE__HOST`.
    fn load() -> Result<Self, figment::Error> {
        let config_file =
            env::var(CONFIG_FILE_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        Figment::new()
            .merge(Yaml::file(config_file))
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
    }
}

impl<T> ConfigExt for T where T: DeserializeOwned {}
