use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use arrow::array::{
    Array, ArrayRef, BinaryArray, FixedSizeBinaryArray, FixedSizeBinaryBuilder, ListArray,
    ListBuilder, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rpc::ChainReader;

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("write task failed: {0}")]
    Join(String),
}

/// A raw event log in the form the range cache persists. Addresses and
/// hashes are fixed-width byte arrays so they map directly onto the
/// parquet column types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub transaction_hash: [u8; 32],
    pub log_index: u32,
    pub address: [u8; 20],
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
}

impl RawLog {
    /// Converts an RPC log. Pending logs that lack a block number, log
    /// index, or transaction hash are skipped.
    pub fn from_rpc(log: &Log) -> Option<RawLog> {
        let block_number = log.block_number?;
        let log_index = log.log_index?;
        let transaction_hash = log.transaction_hash?;

        Some(RawLog {
            block_number,
            transaction_hash: transaction_hash.0,
            log_index: log_index as u32,
            address: log.address().0 .0,
            topics: log.topics().iter().map(|t| t.0).collect(),
            data: log.data().data.to_vec(),
        })
    }
}

/// Diagnostic record written when a range fetch fails. Named
/// `ERR-{from}-{to}.json` in the errors bucket so operators can replay the
/// exact inputs later.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchErrorRecord {
    pub from: u64,
    pub to: u64,
    pub err: String,
}

/// Diagnostic record for a token batch that could not be upserted.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailedUpsertRecord {
    pub tokens: Vec<String>,
}

/// Durable blob cache of raw logs keyed by inclusive block range, one
/// parquet file per range. When a reader is attached, stale or missing
/// ranges are fetched from the chain and written back; without one the
/// cache is the only source and whatever it holds is returned as-is.
pub struct LogStore {
    logs_dir: PathBuf,
    errors_dir: PathBuf,
    reader: Option<Arc<dyn ChainReader>>,
    contracts: Vec<Address>,
}

impl LogStore {
    pub fn new(
        cache_dir: &Path,
        chain_name: &str,
        reader: Option<Arc<dyn ChainReader>>,
        contracts: Vec<Address>,
    ) -> Result<Self, LogStoreError> {
        let logs_dir = cache_dir.join(chain_name).join("logs");
        let errors_dir = cache_dir.join(chain_name).join("errors");
        std::fs::create_dir_all(&logs_dir)?;
        std::fs::create_dir_all(&errors_dir)?;

        Ok(LogStore {
            logs_dir,
            errors_dir,
            reader,
            contracts,
        })
    }

    /// Logs for the inclusive range `[from, to]`. Cached data is returned
    /// when fresh; otherwise the range is re-fetched and the cache object
    /// overwritten. A fetch failure is recorded to the errors bucket and
    /// degrades to the stale cached copy, or an empty result, so the
    /// caller can advance past the gap.
    pub async fn get(&self, from: u64, to: u64) -> Vec<RawLog> {
        let cached = self.read_cached(from, to);

        let fresh = cached.as_ref().is_some_and(|logs| is_fresh(logs, from, to));
        if fresh {
            return cached.unwrap_or_default();
        }

        let Some(reader) = &self.reader else {
            return cached.unwrap_or_default();
        };

        match reader.logs(from, to, &self.contracts).await {
            Ok(logs) => {
                if let Err(e) = self.put(from, to, logs.clone()).await {
                    tracing::warn!("Failed to cache logs for range {}-{}: {}", from, to, e);
                }
                logs
            }
            Err(e) => {
                tracing::warn!("Log fetch failed for range {}-{}: {}", from, to, e);
                self.record_fetch_error(from, to, &e.to_string());
                cached.unwrap_or_default()
            }
        }
    }

    /// Writes (or overwrites) the cache object for `[from, to]`. The
    /// parquet encode runs on the blocking pool.
    pub async fn put(&self, from: u64, to: u64, logs: Vec<RawLog>) -> Result<(), LogStoreError> {
        let path = self.range_path(from, to);
        tokio::task::spawn_blocking(move || write_logs_to_parquet(&logs, &path))
            .await
            .map_err(|e| LogStoreError::Join(e.to_string()))?
    }

    /// Best-effort: a failure to record the diagnostic is only logged.
    pub fn record_fetch_error(&self, from: u64, to: u64, err: &str) {
        let record = FetchErrorRecord {
            from,
            to,
            err: err.to_string(),
        };
        let path = self.errors_dir.join(format!("ERR-{}-{}.json", from, to));
        if let Err(e) = write_json(&path, &record) {
            tracing::error!(
                "Failed to write fetch error record for range {}-{}: {}",
                from,
                to,
                e
            );
        }
    }

    /// Records the token keys of a batch that could not be persisted, under
    /// a collision-free diagnostic key. Returns the key.
    pub fn record_failed_upsert(&self, tokens: &[String]) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let key = format!("FAILED-{}-{}", millis, rand::random::<u32>());

        let record = FailedUpsertRecord {
            tokens: tokens.to_vec(),
        };
        let path = self.errors_dir.join(format!("{}.json", key));
        if let Err(e) = write_json(&path, &record) {
            tracing::error!("Failed to write upsert failure record {}: {}", key, e);
        }
        key
    }

    /// Upper bound of the highest cached range, from the file names alone.
    /// This is the replay target when no reader is attached.
    pub fn latest_cached_range_end(&self) -> Option<u64> {
        let entries = match std::fs::read_dir(&self.logs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to scan cache dir {}: {}", self.logs_dir.display(), e);
                return None;
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let range = name.strip_prefix("logs_")?.strip_suffix(".parquet")?;
                let (_, to) = range.split_once('-')?;
                to.parse::<u64>().ok()
            })
            .max()
    }

    fn range_path(&self, from: u64, to: u64) -> PathBuf {
        self.logs_dir.join(format!("logs_{}-{}.parquet", from, to))
    }

    fn read_cached(&self, from: u64, to: u64) -> Option<Vec<RawLog>> {
        let path = self.range_path(from, to);
        if !path.exists() {
            return None;
        }

        match read_logs_from_parquet(&path) {
            Ok(logs) => Some(logs),
            Err(e) => {
                tracing::warn!(
                    "Corrupted log cache file {}: {} - deleting for re-fetch",
                    path.display(),
                    e
                );
                if let Err(del_err) = std::fs::remove_file(&path) {
                    tracing::error!(
                        "Failed to delete corrupted cache file {}: {}",
                        path.display(),
                        del_err
                    );
                }
                None
            }
        }
    }
}

/// A cached range is fresh when its newest log sits within a fifth of the
/// range width of the upper bound. An empty range counts as fresh: it was
/// written by a completed fetch that found no events.
fn is_fresh(logs: &[RawLog], from: u64, to: u64) -> bool {
    let Some(max_block) = logs.iter().map(|l| l.block_number).max() else {
        return true;
    };
    max_block + (to - from) / 5 >= to
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LogStoreError> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn build_log_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("block_number", DataType::UInt64, false),
        Field::new("transaction_hash", DataType::FixedSizeBinary(32), false),
        Field::new("log_index", DataType::UInt32, false),
        Field::new("address", DataType::FixedSizeBinary(20), false),
        Field::new(
            "topics",
            DataType::List(Arc::new(Field::new(
                "item",
                DataType::FixedSizeBinary(32),
                false,
            ))),
            false,
        ),
        Field::new("data", DataType::Binary, false),
    ]))
}

fn write_logs_to_parquet(records: &[RawLog], output_path: &Path) -> Result<(), LogStoreError> {
    let schema = build_log_schema();
    let mut arrays: Vec<ArrayRef> = Vec::new();

    let arr: UInt64Array = records.iter().map(|r| Some(r.block_number)).collect();
    arrays.push(Arc::new(arr));

    // Builders rather than try_from_iter: ranges with no events still must
    // produce typed empty columns.
    let mut tx_builder = FixedSizeBinaryBuilder::new(32);
    for record in records {
        tx_builder.append_value(record.transaction_hash.as_slice())?;
    }
    arrays.push(Arc::new(tx_builder.finish()));

    let arr: UInt32Array = records.iter().map(|r| Some(r.log_index)).collect();
    arrays.push(Arc::new(arr));

    let mut addr_builder = FixedSizeBinaryBuilder::new(20);
    for record in records {
        addr_builder.append_value(record.address.as_slice())?;
    }
    arrays.push(Arc::new(addr_builder.finish()));

    let mut list_builder = ListBuilder::new(FixedSizeBinaryBuilder::new(32)).with_field(
        Field::new("item", DataType::FixedSizeBinary(32), false),
    );
    for record in records {
        for topic in &record.topics {
            list_builder.values().append_value(topic.as_slice())?;
        }
        list_builder.append(true);
    }
    arrays.push(Arc::new(list_builder.finish()));

    let arr: BinaryArray = records.iter().map(|r| Some(r.data.as_slice())).collect();
    arrays.push(Arc::new(arr));

    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let file = File::create(output_path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

fn read_logs_from_parquet(path: &Path) -> Result<Vec<RawLog>, LogStoreError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;

    let mut logs = Vec::new();

    for batch_result in reader {
        let batch = batch_result?;
        let schema = batch.schema();

        let block_number_idx = schema.index_of("block_number").ok();
        let tx_hash_idx = schema.index_of("transaction_hash").ok();
        let log_index_idx = schema.index_of("log_index").ok();
        let address_idx = schema.index_of("address").ok();
        let topics_idx = schema.index_of("topics").ok();
        let data_idx = schema.index_of("data").ok();

        for row in 0..batch.num_rows() {
            let block_number = block_number_idx
                .and_then(|i| {
                    batch
                        .column(i)
                        .as_any()
                        .downcast_ref::<UInt64Array>()
                        .map(|a| a.value(row))
                })
                .unwrap_or(0);

            let transaction_hash = tx_hash_idx
                .and_then(|i| {
                    batch
                        .column(i)
                        .as_any()
                        .downcast_ref::<FixedSizeBinaryArray>()
                        .and_then(|a| {
                            let bytes = a.value(row);
                            if bytes.len() == 32 {
                                let mut arr = [0u8; 32];
                                arr.copy_from_slice(bytes);
                                Some(arr)
                            } else {
                                None
                            }
                        })
                })
                .unwrap_or_default();

            let log_index = log_index_idx
                .and_then(|i| {
                    batch
                        .column(i)
                        .as_any()
                        .downcast_ref::<UInt32Array>()
                        .map(|a| a.value(row))
                })
                .unwrap_or(0);

            let address = address_idx
                .and_then(|i| {
                    batch
                        .column(i)
                        .as_any()
                        .downcast_ref::<FixedSizeBinaryArray>()
                        .and_then(|a| {
                            let bytes = a.value(row);
                            if bytes.len() == 20 {
                                let mut arr = [0u8; 20];
                                arr.copy_from_slice(bytes);
                                Some(arr)
                            } else {
                                None
                            }
                        })
                })
                .unwrap_or_default();

            let topics: Vec<[u8; 32]> = topics_idx
                .and_then(|i| {
                    batch
                        .column(i)
                        .as_any()
                        .downcast_ref::<ListArray>()
                        .map(|list| {
                            let values = list.value(row);
                            values
                                .as_any()
                                .downcast_ref::<FixedSizeBinaryArray>()
                                .map(|fixed| {
                                    (0..fixed.len())
                                        .map(|j| {
                                            let mut topic = [0u8; 32];
                                            topic.copy_from_slice(fixed.value(j));
                                            topic
                                        })
                                        .collect()
                                })
                                .unwrap_or_default()
                        })
                })
                .unwrap_or_default();

            let data = data_idx
                .and_then(|i| {
                    batch
                        .column(i)
                        .as_any()
                        .downcast_ref::<BinaryArray>()
                        .map(|a| a.value(row).to_vec())
                })
                .unwrap_or_default();

            logs.push(RawLog {
                block_number,
                transaction_hash,
                log_index,
                address,
                topics,
                data,
            });
        }
    }

    Ok(logs)
}
