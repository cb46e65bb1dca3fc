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

use crate::domain::{self, AssetType, HistoryEnding, Instrument, InstrumentRecord};
use async_stream::try_stream;
use chrono::NaiveDateTime;
use futures::{Stream, TryStreamExt};
use indoc::indoc;
use ingester_common::infra::pool::postgres::{self, PostgresPool};
use log::{debug, info};
use sqlx::{Connection, FromRow, QueryBuilder, postgres::PgConnection};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

// Keeps multi-row upserts below the Postgres bind parameter limit.
const UPSERT_CHUNK_SIZE: usize = 5_000;

/// Error possibly returned by [Storage::deploy].
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("cannot connect to database")]
    Connect(#[from] sqlx::Error),

    #[error("cannot run database migrations")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Postgres-backed storage for instruments and candle history.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: PostgresPool,
    asset_type_ids: Arc<Mutex<Option<HashMap<String, i32>>>>,
}

impl Storage {
    pub fn new(pool: PostgresPool) -> Self {
        Self {
            pool,
            asset_type_ids: Arc::new(Mutex::new(None)),
        }
    }

    /// Connect to an existing database.
    pub async fn connect(config: postgres::Config) -> Result<Self, sqlx::Error> {
        Ok(Self::new(PostgresPool::new(config).await?))
    }

    /// Create the database if it does not exist yet, apply the schema and seed the asset type
    /// rows. Idempotent.
    pub async fn deploy(
        config: postgres::Config,
        asset_types: &[AssetType],
    ) -> Result<Self, DeployError> {
        let pool = match PostgresPool::new(config.clone()).await {
            Err(error) if database_missing(&error) => {
                create_database(&config).await?;
                PostgresPool::new(config).await?
            }

            other => other?,
        };

        sqlx::migrate!("migrations/postgres").run(&*pool).await?;

        QueryBuilder::new("INSERT INTO asset_type (name) ")
            .push_values(asset_types, |mut query, asset_type| {
                query.push_bind(asset_type.name());
            })
            .push(" ON CONFLICT DO NOTHING")
            .build()
            .execute(&*pool)
            .await?;

        Ok(Self::new(pool))
    }

    /// The id of the given asset type, resolved once per process. Concurrent first callers
    /// serialize on the cache load.
    async fn asset_type_id(&self, asset_type: AssetType) -> Result<i32, sqlx::Error> {
        let mut asset_type_ids = self.asset_type_ids.lock().await;

        if asset_type_ids.is_none() {
            let rows = sqlx::query_as::<_, (i32, String)>("SELECT id, name FROM asset_type")
                .fetch_all(&*self.pool)
                .await?;
            debug!(count = rows.len(); "asset types read");

            *asset_type_ids = Some(rows.into_iter().map(|(id, name)| (name, id)).collect());
        }

        asset_type_ids
            .as_ref()
            .expect("asset type cache is loaded")
            .get(asset_type.name())
            .copied()
            .ok_or(sqlx::Error::RowNotFound)
    }
}

impl domain::storage::Storage for Storage {
    async fn add_instruments(
        &self,
        asset_type: AssetType,
        instruments: &[InstrumentRecord],
    ) -> Result<(), sqlx::Error> {
        if instruments.is_empty() {
            return Ok(());
        }

        let asset_type_id = self.asset_type_id(asset_type).await?;

        let query = indoc! {"
            INSERT INTO instrument (
                uid,
                figi,
                name,
                asset_type,
                lot,
                otc_flag,
                for_qual_investor_flag,
                api_trade_available_flag,
                first_1min_candle_date,
                first_1day_candle_date
            )
        "};

        for chunk in instruments.chunks(UPSERT_CHUNK_SIZE) {
            QueryBuilder::new(query)
                .push_values(chunk, |mut query, instrument| {
                    query
                        .push_bind(instrument.uid)
                        .push_bind(&instrument.figi)
                        .push_bind(&instrument.name)
                        .push_bind(asset_type_id)
                        .push_bind(instrument.lot)
                        .push_bind(instrument.otc_flag)
                        .push_bind(instrument.for_qual_investor_flag)
                        .push_bind(instrument.api_trade_available_flag)
                        .push_bind(instrument.first_1min_candle_date)
                        .push_bind(instrument.first_1day_candle_date);
                })
                .push(indoc! {"
                     ON CONFLICT (uid) DO UPDATE SET
                        figi = EXCLUDED.figi,
                        name = EXCLUDED.name,
                        asset_type = EXCLUDED.asset_type,
                        lot = EXCLUDED.lot,
                        otc_flag = EXCLUDED.otc_flag,
                        for_qual_investor_flag = EXCLUDED.for_qual_investor_flag,
                        api_trade_available_flag = EXCLUDED.api_trade_available_flag,
                        first_1min_candle_date = EXCLUDED.first_1min_candle_date,
                        first_1day_candle_date = EXCLUDED.first_1day_candle_date
                "})
                .build()
                .execute(&*self.pool)
                .await?;
        }

        info!(asset_type:% = asset_type, count = instruments.len(); "instruments saved");
        Ok(())
    }

    fn get_history_endings(
        &self,
        figis: Option<Vec<String>>,
    ) -> impl Stream<Item = Result<HistoryEnding, sqlx::Error>> + Send {
        let pool = self.pool.clone();

        let query = indoc! {"
            SELECT
                i.id,
                i.uid,
                i.figi,
                i.name,
                i.lot,
                i.otc_flag,
                i.for_qual_investor_flag,
                i.api_trade_available_flag,
                i.first_1min_candle_date,
                i.first_1day_candle_date,
                coalesce(latest.latest, i.first_1min_candle_date) AS history_end
            FROM instrument i
            LEFT OUTER JOIN (
                SELECT instrument, max(timestamp) AS latest
                FROM candle
                GROUP BY instrument
            ) latest ON latest.instrument = i.id
            WHERE i.figi IS NOT NULL
              AND i.first_1min_candle_date IS NOT NULL
              AND ($1::text[] IS NULL OR i.figi = ANY($1))
            ORDER BY history_end
        "};

        try_stream! {
            let mut rows = sqlx::query_as::<_, HistoryEndingRow>(query)
                .bind(figis)
                .fetch(&*pool);

            while let Some(row) = rows.try_next().await? {
                yield HistoryEnding::from(row);
            }
        }
    }

    async fn save_candle_history(&self, csv: Vec<u8>) -> Result<(), sqlx::Error> {
        let mut connection = self.pool.acquire().await?;
        let mut tx = connection.begin().await?;

        // COPY into a transaction-scoped staging table, then merge, so a single key collision
        // does not fail the whole load.
        let temp_table = format!("candle_{}", Uuid::new_v4().simple());

        sqlx::query(&format!(
            "CREATE TEMP TABLE {temp_table} (LIKE candle) ON COMMIT DROP"
        ))
        .execute(&mut *tx)
        .await?;

        let copy = format!(
            "COPY {temp_table} (instrument, timestamp, open, close, high, low, volume) \
             FROM STDIN WITH (FORMAT csv, DELIMITER ';')"
        );
        let mut copy_in = tx.copy_in_raw(&copy).await?;
        copy_in.send(csv.as_slice()).await?;
        copy_in.finish().await?;

        sqlx::query(&format!(
            "INSERT INTO candle SELECT * FROM {temp_table} ON CONFLICT DO NOTHING"
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(bytes = csv.len(); "candle history saved");
        Ok(())
    }
}

// Postgres SQLSTATE 3D000, invalid_catalog_name.
fn database_missing(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(error) => error.code().as_deref() == Some("3D000"),
        _ => false,
    }
}

/// Create the configured database via the server's maintenance database.
async fn create_database(config: &postgres::Config) -> Result<(), sqlx::Error> {
    let options = config.connect_options().database("postgres");
    let mut connection = PgConnection::connect_with(&options).await?;

    sqlx::query(&format!(r#"CREATE DATABASE "{}""#, config.dbname))
        .execute(&mut connection)
        .await?;
    connection.close().await?;

    info!(dbname:% = config.dbname; "database created");
    Ok(())
}

#[derive(Debug, FromRow)]
struct HistoryEndingRow {
    id: i32,
    uid: Uuid,
    figi: Option<String>,
    name: String,
    lot: i32,
    otc_flag: bool,
    for_qual_investor_flag: bool,
    api_trade_available_flag: bool,
    first_1min_candle_date: Option<NaiveDateTime>,
    first_1day_candle_date: Option<NaiveDateTime>,
    history_end: NaiveDateTime,
}

impl From<HistoryEndingRow> for HistoryEnding {
    fn from(row: HistoryEndingRow) -> Self {
        let HistoryEndingRow {
            id,
            uid,
            figi,
            name,
            lot,
            otc_flag,
            for_qual_investor_flag,
            api_trade_available_flag,
            first_1min_candle_date,
            first_1day_candle_date,
            history_end,
        } = row;

        Self {
            instrument: Instrument {
                id,
                uid,
                figi,
                name,
                lot,
                otc_flag,
                for_qual_investor_flag,
                api_trade_available_flag,
                first_1min_candle_date,
                first_1day_candle_date,
            },
            history_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Storage;
    use crate::domain::{AssetType, InstrumentRecord, storage::Storage as _};
    use anyhow::Context;
    use chrono::{NaiveDate, NaiveDateTime};
    use futures::TryStreamExt;
    use ingester_common::infra::pool::postgres;
    use std::error::Error as StdError;
    use testcontainers::{ImageExt, runners::AsyncRunner};
    use testcontainers_modules::postgres::Postgres;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_storage() -> Result<(), Box<dyn StdError>> {
        let postgres_container = Postgres::default()
            .with_tag("17.1-alpine")
            .start()
            .await
            .context("start Postgres container")?;
        let postgres_port = postgres_container
            .get_host_port_ipv4(5432)
            .await
            .context("get Postgres port")?;

        // The container only provides the maintenance database, so deploy must take the
        // create-database detour.
        let config = postgres::Config {
            host: "localhost".to_string(),
            port: postgres_port,
            dbname: "trading_bot".to_string(),
            user: "postgres".to_string(),
            password: Some("postgres".to_string().into()),
            ..Default::default()
        };

        Storage::deploy(config.clone(), &AssetType::ALL)
            .await
            .context("deploy database")?;

        // Deploying into the now existing database must succeed as well.
        let storage = Storage::deploy(config, &AssetType::ALL)
            .await
            .context("deploy database again")?;

        let with_history = InstrumentRecord {
            uid: Uuid::new_v4(),
            figi: Some("BBG000BCSST7".to_string()),
            name: "Share One".to_string(),
            lot: 10,
            otc_flag: false,
            for_qual_investor_flag: false,
            api_trade_available_flag: true,
            first_1min_candle_date: Some(datetime(2018, 3, 7, 18, 33)),
            first_1day_candle_date: Some(datetime(2018, 3, 7, 0, 0)),
        };
        let without_figi = InstrumentRecord {
            uid: Uuid::new_v4(),
            figi: None,
            name: "Share Two".to_string(),
            lot: 1,
            otc_flag: true,
            for_qual_investor_flag: true,
            api_trade_available_flag: false,
            first_1min_candle_date: None,
            first_1day_candle_date: None,
        };
        storage
            .add_instruments(AssetType::Share, &[with_history.clone(), without_figi])
            .await
            .context("add instruments")?;

        let (id, name) = instrument_by_uid(&storage, with_history.uid).await?;
        assert_eq!(name, "Share One");

        // Upserting again overwrites the non-PK columns but keeps the id stable.
        let renamed = InstrumentRecord {
            name: "Share One Renamed".to_string(),
            lot: 20,
            ..with_history
        };
        storage
            .add_instruments(AssetType::Share, &[renamed.clone()])
            .await
            .context("upsert instruments")?;
        let (id_after, name) = instrument_by_uid(&storage, renamed.uid).await?;
        assert_eq!(id_after, id);
        assert_eq!(name, "Share One Renamed");

        // Without candles the history ends at the earliest known candle date; the instrument
        // without a FIGI does not appear at all.
        let endings = storage
            .get_history_endings(None)
            .try_collect::<Vec<_>>()
            .await
            .context("get history endings")?;
        assert_eq!(endings.len(), 1);
        assert_eq!(endings[0].instrument.id, id);
        assert_eq!(endings[0].history_end, datetime(2018, 3, 7, 18, 33));

        let endings = storage
            .get_history_endings(Some(vec!["BBG0_UNKNOWN".to_string()]))
            .try_collect::<Vec<_>>()
            .await
            .context("get filtered history endings")?;
        assert!(endings.is_empty());

        // Bulk-load two candles; re-running the same archive must not change the row count.
        let csv = format!(
            "{id};2018-03-07 19:00:00;250.5;251;251.2;250.1;1250\n\
             {id};2018-03-07 19:01:00;251;250.8;251.1;250.6;980\n"
        );
        storage
            .save_candle_history(csv.clone().into_bytes())
            .await
            .context("save candle history")?;
        assert_eq!(candle_count(&storage).await?, 2);

        storage
            .save_candle_history(csv.into_bytes())
            .await
            .context("save candle history again")?;
        assert_eq!(candle_count(&storage).await?, 2);

        // An overlapping archive only contributes the new rows.
        let csv = format!(
            "{id};2018-03-07 19:01:00;251;250.8;251.1;250.6;980\n\
             {id};2018-03-07 19:02:00;250.9;250.2;251;250.2;1100\n"
        );
        storage
            .save_candle_history(csv.into_bytes())
            .await
            .context("save overlapping candle history")?;
        assert_eq!(candle_count(&storage).await?, 3);

        // With candles the history ends at the latest stored timestamp.
        let endings = storage
            .get_history_endings(None)
            .try_collect::<Vec<_>>()
            .await
            .context("get history endings with candles")?;
        assert_eq!(endings.len(), 1);
        assert_eq!(endings[0].history_end, datetime(2018, 3, 7, 19, 2));

        Ok(())
    }

    async fn instrument_by_uid(
        storage: &Storage,
        uid: Uuid,
    ) -> Result<(i32, String), sqlx::Error> {
        sqlx::query_as::<_, (i32, String)>("SELECT id, name FROM instrument WHERE uid = $1")
            .bind(uid)
            .fetch_one(&*storage.pool)
            .await
    }

    async fn candle_count(storage: &Storage) -> Result<i64, sqlx::Error> {
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT count(*) FROM candle")
            .fetch_one(&*storage.pool)
            .await?;
        Ok(count)
    }

    fn datetime(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, 0))
            .expect("date components are valid")
    }
}
