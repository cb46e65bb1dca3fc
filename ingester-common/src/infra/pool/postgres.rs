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

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::{env, ops::Deref, time::Duration};

/// Configuration for [PostgresPool].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "host_default")]
    pub host: String,

    #[serde(default = "port_default")]
    pub port: u16,

    #[serde(default = "dbname_default")]
    pub dbname: String,

    #[serde(default = "user_default")]
    pub user: String,

    #[serde(default)]
    pub password: Option<SecretString>,

    #[serde(default = "max_connections_default")]
    pub max_connections: u32,

    #[serde(default = "idle_timeout_default", with = "humantime_serde")]
    pub idle_timeout: Duration,

    #[serde(default = "max_lifetime_default", with = "humantime_serde")]
    pub max_lifetime: Duration,
}

impl Config {
    /// Connection options for the configured database.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user);

        match &self.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: host_default(),
            port: port_default(),
            dbname: dbname_default(),
            user: user_default(),
            password: None,
            max_connections: max_connections_default(),
            idle_timeout: idle_timeout_default(),
            max_lifetime: max_lifetime_default(),
        }
    }
}

fn host_default() -> String {
    "localhost".to_string()
}

fn port_default() -> u16 {
    5432
}

fn dbname_default() -> String {
    "trading_bot".to_string()
}

// The database is owned by the invoking OS user.
fn user_default() -> String {
    env::var("USER").unwrap_or_else(|_| "postgres".to_string())
}

fn max_connections_default() -> u32 {
    10
}

fn idle_timeout_default() -> Duration {
    Duration::from_secs(60)
}

fn max_lifetime_default() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Cheaply cloneable Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresPool(PgPool);

impl PostgresPool {
    /// Create a new pool for the given configuration, eagerly establishing one connection.
    pub async fn new(config: Config) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect_with(config.connect_options())
            .await?;

        Ok(Self(pool))
    }
}

impl Deref for PostgresPool {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
