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

use crate::domain::{
    AssetType, HistoryEnding, Instrument, history::HistoryArchives, instruments::Instruments,
    storage::Storage,
};
use anyhow::Context;
use chrono::{Datelike, NaiveDateTime};
use futures::TryStreamExt;
use log::{debug, info};
use std::{pin::pin, time::Instant};
use tokio::task::JoinSet;

/// Synchronize instrument metadata: fetch the instrument list of every asset type
/// concurrently and upsert each batch as it arrives.
pub async fn update_instruments(
    instruments: impl Instruments,
    storage: impl Storage,
) -> anyhow::Result<()> {
    let started_at = Instant::now();

    let mut requests = JoinSet::new();
    for asset_type in AssetType::ALL {
        let instruments = instruments.clone();
        requests.spawn(async move { (asset_type, instruments.get_instruments(asset_type).await) });
    }

    let mut count = 0;
    while let Some(result) = requests.join_next().await {
        let (asset_type, records) = result.context("instrument request panicked")?;
        let records = records.with_context(|| format!("get {asset_type} instruments"))?;

        storage
            .add_instruments(asset_type, &records)
            .await
            .with_context(|| format!("save {asset_type} instruments"))?;
        count += records.len();
    }

    info!(count, elapsed:? = started_at.elapsed(); "instruments updated");
    Ok(())
}

/// Download missing candle history for all known instruments, or only those with the given
/// FIGIs, and bulk-load it into the candle table.
///
/// One fetch task per instrument and one save task per yielded archive; the rate limiter
/// bounds fetch throughput and the connection pool bounds saves. The first save or extraction
/// failure aborts the run, while HTTP failures are absorbed per instrument inside the archive
/// stream.
pub async fn download_history(
    figis: Option<Vec<String>>,
    archives: impl HistoryArchives,
    storage: impl Storage,
) -> anyhow::Result<()> {
    let started_at = Instant::now();

    let endings = storage.get_history_endings(figis);
    let mut endings = pin!(endings);

    // Priorities are handed out here, in ascending history-end order, not inside the spawned
    // tasks: instruments needing the most fetches must dominate admission regardless of the
    // order in which the tasks first run.
    let mut next_priority = 0;
    let mut downloads = JoinSet::new();
    while let Some(HistoryEnding {
        instrument,
        history_end,
    }) = endings.try_next().await.context("get history endings")?
    {
        let priority = next_priority;
        next_priority += 1;

        downloads.spawn(download_instrument_history(
            instrument,
            history_end,
            priority,
            archives.clone(),
            storage.clone(),
        ));
    }

    let instrument_count = downloads.len();
    info!(instrument_count; "downloading candle history");

    while let Some(result) = downloads.join_next().await {
        result.context("download task panicked")??;
    }

    info!(instrument_count, elapsed:? = started_at.elapsed(); "candle history downloaded");
    Ok(())
}

async fn download_instrument_history(
    instrument: Instrument,
    history_end: NaiveDateTime,
    priority: u64,
    archives: impl HistoryArchives,
    storage: impl Storage,
) -> anyhow::Result<()> {
    let figi = instrument.figi.clone().unwrap_or_default();

    let csvs = archives.history_csvs(instrument, history_end.year(), priority);
    let mut csvs = pin!(csvs);

    let mut saves = JoinSet::new();
    while let Some(csv) = csvs
        .try_next()
        .await
        .with_context(|| format!("get history archive for {figi}"))?
    {
        let storage = storage.clone();
        saves.spawn(async move { storage.save_candle_history(csv).await });
    }

    while let Some(result) = saves.join_next().await {
        result
            .context("save task panicked")?
            .with_context(|| format!("save candle history for {figi}"))?;
    }

    debug!(figi:% = figi; "instrument history completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        application::{download_history, update_instruments},
        domain::{
            AssetType, HistoryEnding, Instrument, InstrumentRecord, history::HistoryArchives,
            instruments::Instruments, storage::Storage,
        },
    };
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, NaiveDateTime};
    use fake::{Fake, Faker};
    use futures::{Stream, stream};
    use parking_lot::Mutex;
    use std::{collections::HashSet, convert::Infallible, sync::Arc};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_update_instruments() {
        let storage = MockStorage::default();
        update_instruments(MockInstruments, storage.clone())
            .await
            .expect("instruments can be updated");

        let added = storage.added.lock();
        assert_eq!(added.len(), AssetType::ALL.len());
        let asset_types = added
            .iter()
            .map(|(asset_type, _)| *asset_type)
            .collect::<HashSet<_>>();
        assert_eq!(asset_types, HashSet::from(AssetType::ALL));
    }

    #[tokio::test]
    async fn test_download_history() {
        let storage = MockStorage {
            endings: vec![history_ending(1), history_ending(2)],
            ..Default::default()
        };

        download_history(None, MockArchives, storage.clone())
            .await
            .expect("history can be downloaded");

        // Two instruments at two archives each.
        let saved = storage.saved.lock();
        assert_eq!(saved.len(), 4);
        let first_csv = String::from_utf8(saved[0].clone()).expect("CSV is UTF-8");
        assert!(first_csv.ends_with(";1;2;3;0.5;10\n"));
    }

    #[tokio::test]
    async fn test_download_history_aborts_on_save_failure() {
        let storage = MockStorage {
            endings: vec![history_ending(1)],
            fail_saves: true,
            ..Default::default()
        };

        let result = download_history(None, MockArchives, storage).await;
        assert_matches!(result, Err(_));
    }

    #[derive(Clone)]
    struct MockInstruments;

    impl Instruments for MockInstruments {
        type Error = Infallible;

        async fn get_instruments(
            &self,
            asset_type: AssetType,
        ) -> Result<Vec<InstrumentRecord>, Infallible> {
            Ok(vec![InstrumentRecord {
                uid: Uuid::new_v4(),
                figi: Some(format!("BBG00000000{asset_type}")),
                name: Faker.fake(),
                lot: 1,
                otc_flag: false,
                for_qual_investor_flag: false,
                api_trade_available_flag: true,
                first_1min_candle_date: None,
                first_1day_candle_date: None,
            }])
        }
    }

    #[derive(Clone)]
    struct MockArchives;

    impl HistoryArchives for MockArchives {
        type Error = Infallible;

        fn history_csvs(
            &self,
            instrument: Instrument,
            first_year: i32,
            _priority: u64,
        ) -> impl Stream<Item = Result<Vec<u8>, Infallible>> + Send {
            let csvs = (first_year..=first_year + 1)
                .map(|year| {
                    Ok(format!("{};{year}-01-03 10:00:00;1;2;3;0.5;10\n", instrument.id)
                        .into_bytes())
                })
                .collect::<Vec<_>>();

            stream::iter(csvs)
        }
    }

    #[derive(Clone, Default)]
    struct MockStorage {
        added: Arc<Mutex<Vec<(AssetType, usize)>>>,
        saved: Arc<Mutex<Vec<Vec<u8>>>>,
        endings: Vec<HistoryEnding>,
        fail_saves: bool,
    }

    impl Storage for MockStorage {
        async fn add_instruments(
            &self,
            asset_type: AssetType,
            instruments: &[InstrumentRecord],
        ) -> Result<(), sqlx::Error> {
            self.added.lock().push((asset_type, instruments.len()));
            Ok(())
        }

        fn get_history_endings(
            &self,
            _figis: Option<Vec<String>>,
        ) -> impl Stream<Item = Result<HistoryEnding, sqlx::Error>> + Send {
            stream::iter(self.endings.clone().into_iter().map(Ok))
        }

        async fn save_candle_history(&self, csv: Vec<u8>) -> Result<(), sqlx::Error> {
            if self.fail_saves {
                return Err(sqlx::Error::PoolClosed);
            }

            self.saved.lock().push(csv);
            Ok(())
        }
    }

    fn history_ending(id: i32) -> HistoryEnding {
        HistoryEnding {
            instrument: Instrument {
                id,
                uid: Uuid::new_v4(),
                figi: Some(format!("BBG00000000{id}")),
                name: Faker.fake(),
                lot: 1,
                otc_flag: false,
                for_qual_investor_flag: false,
                api_trade_available_flag: true,
                first_1min_candle_date: Some(datetime(2018, 3, 7, 18, 33)),
                first_1day_candle_date: None,
            },
            history_end: datetime(2023, 5, 1, 10, 0),
        }
    }

    fn datetime(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, 0))
            .expect("date components are valid")
    }
}
