//! Read path: key selection, parallel slices and batched point lookups.

use std::ops::Range;
use std::sync::Arc;

use futures::Stream;
use futures::future::try_join_all;

use crate::config::ReadOptions;
use crate::error::{Error, Result};
use crate::model::{RowBatch, Value};
use crate::serde::{METADATA_NODE, decode_row, encode_key};
use crate::table::{KeeperMapTable, TableInner};

/// Which keys a read covers.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySelection {
    /// Explicit primary-key values; duplicates are allowed.
    Keys(Vec<Value>),
    /// Every key currently stored.
    FullScan,
}

/// A sorted, deduplicated key set that slices read from.
trait KeyContainer: Send + Sync {
    fn len(&self) -> usize;

    /// Node names of the keys at `range`.
    fn node_names(&self, range: Range<usize>) -> Result<Vec<String>>;
}

/// Primary-key values from a query predicate, encoded lazily per batch.
struct KeyValues(Vec<Value>);

impl KeyContainer for KeyValues {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn node_names(&self, range: Range<usize>) -> Result<Vec<String>> {
        self.0[range].iter().map(encode_key).collect()
    }
}

/// Node names enumerated from the root path.
struct NodeNames(Vec<String>);

impl KeyContainer for NodeNames {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn node_names(&self, range: Range<usize>) -> Result<Vec<String>> {
        Ok(self.0[range].to_vec())
    }
}

/// One contiguous share of a read's keys.
///
/// Slices are independent: each can be driven from its own task. A slice is
/// finite and cannot be restarted once exhausted.
pub struct ReadSlice {
    table: Arc<TableInner>,
    keys: Arc<dyn KeyContainer>,
    next: usize,
    end: usize,
    max_block_size: usize,
}

impl ReadSlice {
    /// Number of keys not yet fetched.
    pub fn remaining(&self) -> usize {
        self.end - self.next
    }

    /// Fetches the next batch of at most `max_block_size` keys. Keys that do
    /// not exist are left out. Returns `None` once the slice is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.next >= self.end {
            return Ok(None);
        }
        let count = self.max_block_size.min(self.end - self.next);
        let names = self.keys.node_names(self.next..self.next + count)?;
        self.next += count;
        let batch = self.table.get_by_serialized_keys(&names, false).await?;
        Ok(Some(batch))
    }

    /// Turns the slice into a stream of batches.
    pub fn into_stream(self) -> impl Stream<Item = Result<RowBatch>> + Send {
        futures::stream::unfold(Some(self), |slice| async move {
            let mut slice = slice?;
            match slice.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), Some(slice))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl KeeperMapTable {
    /// Plans a read of `selection` split into at most `options.num_streams`
    /// slices. Nothing is fetched until a slice is driven.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn read(&self, selection: KeySelection, options: ReadOptions) -> Result<Vec<ReadSlice>> {
        let inner = &self.inner;
        inner.check_table().await?;

        let keys: Arc<dyn KeyContainer> = match selection {
            KeySelection::Keys(mut values) => {
                inner.check_key_types(&values)?;
                values.sort();
                values.dedup();
                Arc::new(KeyValues(values))
            }
            KeySelection::FullScan => {
                let client = inner.get_client().await?;
                let mut names = client.get_children(&inner.paths.root).await?;
                names.retain(|name| name != METADATA_NODE);
                names.sort();
                names.dedup();
                Arc::new(NodeNames(names))
            }
        };

        let slices = split_ranges(keys.len(), options.num_streams)
            .into_iter()
            .map(|range| ReadSlice {
                table: Arc::clone(inner),
                keys: Arc::clone(&keys),
                next: range.start,
                end: range.end,
                max_block_size: options.max_block_size.max(1),
            })
            .collect::<Vec<_>>();
        tracing::debug!(
            root_path = %inner.paths.root,
            keys = keys.len(),
            slices = slices.len(),
            "planned read"
        );
        Ok(slices)
    }

    /// Point lookup of `keys`, e.g. for joins.
    ///
    /// The result has one row and one null-map entry per input key, in input
    /// order; missing keys yield default rows flagged `true`.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn get_by_keys(&self, keys: &[Value]) -> Result<RowBatch> {
        let inner = &self.inner;
        inner.check_table().await?;
        inner.check_key_types(keys)?;
        let names = keys.iter().map(encode_key).collect::<Result<Vec<_>>>()?;
        inner.get_by_serialized_keys(&names, true).await
    }
}

impl TableInner {
    fn check_key_types(&self, keys: &[Value]) -> Result<()> {
        let key_column = self.schema.primary_key();
        match keys.iter().find(|k| k.data_type() != key_column.data_type) {
            Some(key) => Err(Error::BadArguments(format!(
                "primary key '{}' is {:?}, got a {:?} key",
                key_column.name,
                key_column.data_type,
                key.data_type()
            ))),
            None => Ok(()),
        }
    }

    /// Fetches `keys` (node names) concurrently under one deadline.
    ///
    /// With `with_null_map`, every key yields a row: missing keys get column
    /// defaults and a `true` null-map entry. Without it missing keys are
    /// skipped. The metadata node is never fetched and counts as missing.
    pub(crate) async fn get_by_serialized_keys(
        &self,
        keys: &[String],
        with_null_map: bool,
    ) -> Result<RowBatch> {
        let client = self.get_client().await?;
        let metadata = self.paths.metadata.as_str();

        let fetches = keys.iter().map(|key| {
            let path = self.paths.key_path(key);
            let client = Arc::clone(&client);
            async move {
                if path == metadata {
                    return Ok(None);
                }
                client.get(&path).await
            }
        });
        let responses = tokio::time::timeout(self.operation_timeout, try_join_all(fetches))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "failed to fetch {} values within {:?}",
                    keys.len(),
                    self.operation_timeout
                ))
            })??;

        let mut rows = Vec::with_capacity(keys.len());
        let mut null_map = with_null_map.then(|| Vec::with_capacity(keys.len()));
        for (key, response) in keys.iter().zip(responses) {
            match response {
                Some((data, _)) => {
                    rows.push(decode_row(&self.schema, key, &data)?);
                    if let Some(null_map) = null_map.as_mut() {
                        null_map.push(false);
                    }
                }
                None => {
                    if let Some(null_map) = null_map.as_mut() {
                        rows.push(self.schema.default_row());
                        null_map.push(true);
                    }
                }
            }
        }
        Ok(RowBatch { rows, null_map })
    }
}

/// Splits `len` items into `min(parts, len)` contiguous ranges of near-equal
/// size, the i-th covering `[len * i / n, len * (i + 1) / n)`.
fn split_ranges(len: usize, parts: usize) -> Vec<Range<usize>> {
    let n = parts.max(1).min(len);
    (0..n).map(|i| len * i / n..len * (i + 1) / n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineSettings, TableConfig};
    use crate::model::{Column, DataType, Schema};
    use crate::table::TableDefinition;
    use common::{ConnectorRegistry, InMemoryEnsemble};
    use futures::StreamExt;
    use rstest::rstest;

    fn schema() -> Schema {
        Schema::new(
            vec![
                Column::new("key", DataType::UInt64),
                Column::new("value", DataType::String),
            ],
            &["key"],
        )
        .unwrap()
    }

    async fn table_with_rows(ensemble: &InMemoryEnsemble, keys: &[u64]) -> KeeperMapTable {
        let table = KeeperMapTable::create(
            TableDefinition::new("t", schema(), TableConfig::new("/t")),
            &EngineSettings::with_path_prefix("/keeper_map"),
            ConnectorRegistry::new(Arc::new(ensemble.clone())),
        )
        .await
        .unwrap();
        let mut sink = table.sink().await.unwrap();
        let rows: Vec<Vec<Value>> = keys
            .iter()
            .map(|k| vec![Value::UInt64(*k), Value::from(format!("v{}", k))])
            .collect();
        sink.consume(&rows).unwrap();
        sink.finish().await.unwrap();
        table
    }

    #[rstest]
    #[case(10, 3, vec![0..3, 3..6, 6..10])]
    #[case(2, 4, vec![0..1, 1..2])]
    #[case(5, 1, vec![0..5])]
    #[case(0, 4, vec![])]
    #[case(3, 0, vec![0..3])]
    fn should_split_keys_into_contiguous_ranges(
        #[case] len: usize,
        #[case] parts: usize,
        #[case] expected: Vec<Range<usize>>,
    ) {
        assert_eq!(split_ranges(len, parts), expected);
    }

    #[tokio::test]
    async fn should_read_requested_keys_and_skip_missing() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table_with_rows(&ensemble, &[1, 2, 3]).await;

        // when
        let mut slices = table
            .read(
                KeySelection::Keys(vec![Value::UInt64(3), Value::UInt64(1), Value::UInt64(9)]),
                ReadOptions::default(),
            )
            .await
            .unwrap();

        // then
        assert_eq!(slices.len(), 1);
        let batch = slices[0].next_batch().await.unwrap().unwrap();
        assert!(batch.null_map.is_none());
        let mut keys: Vec<Value> = batch.rows.iter().map(|r| r[0].clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![Value::UInt64(1), Value::UInt64(3)]);
        assert!(slices[0].next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_deduplicate_requested_keys() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table_with_rows(&ensemble, &[1]).await;

        // when
        let slices = table
            .read(
                KeySelection::Keys(vec![Value::UInt64(1), Value::UInt64(1)]),
                ReadOptions::default(),
            )
            .await
            .unwrap();

        // then
        assert_eq!(slices.iter().map(ReadSlice::remaining).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn should_yield_batches_of_max_block_size() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table_with_rows(&ensemble, &[1, 2, 3, 4, 5]).await;
        let options = ReadOptions {
            max_block_size: 2,
            num_streams: 1,
        };

        // when
        let slices = table.read(KeySelection::FullScan, options).await.unwrap();
        let batches: Vec<RowBatch> = slices
            .into_iter()
            .next()
            .unwrap()
            .into_stream()
            .map(|batch| batch.unwrap())
            .collect()
            .await;

        // then
        let sizes: Vec<usize> = batches.iter().map(RowBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn should_exclude_metadata_from_full_scan() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table_with_rows(&ensemble, &[]).await;

        // when
        let slices = table
            .read(KeySelection::FullScan, ReadOptions::default())
            .await
            .unwrap();

        // then
        assert!(slices.is_empty());
    }

    #[tokio::test]
    async fn should_return_null_map_in_input_order() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table_with_rows(&ensemble, &[2]).await;

        // when
        let batch = table
            .get_by_keys(&[Value::UInt64(5), Value::UInt64(2)])
            .await
            .unwrap();

        // then
        assert_eq!(batch.null_map, Some(vec![true, false]));
        assert_eq!(
            batch.rows,
            vec![
                vec![Value::UInt64(0), Value::from("")],
                vec![Value::UInt64(2), Value::from("v2")],
            ]
        );
    }

    #[tokio::test]
    async fn should_treat_metadata_node_name_as_missing() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table_with_rows(&ensemble, &[]).await;

        // when
        let batch = table
            .inner
            .get_by_serialized_keys(&[METADATA_NODE.to_string()], true)
            .await
            .unwrap();

        // then
        assert_eq!(batch.null_map, Some(vec![true]));
    }

    #[tokio::test]
    async fn should_reject_key_of_wrong_type() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table_with_rows(&ensemble, &[]).await;

        // when
        let result = table.get_by_keys(&[Value::from("one")]).await;

        // then
        assert!(matches!(result, Err(Error::BadArguments(_))));
    }

    #[tokio::test]
    async fn should_fail_batch_on_fetch_timeout() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = KeeperMapTable::create(
            TableDefinition::new("t", schema(), TableConfig::new("/t")),
            &EngineSettings {
                coordination: common::CoordinationConfig {
                    operation_timeout_ms: 10,
                },
                ..EngineSettings::with_path_prefix("/keeper_map")
            },
            ConnectorRegistry::new(Arc::new(ensemble.clone())),
        )
        .await
        .unwrap();
        let mut slices = table
            .read(
                KeySelection::Keys(vec![Value::UInt64(1)]),
                ReadOptions::default(),
            )
            .await
            .unwrap();
        ensemble.set_request_latency(std::time::Duration::from_millis(200));

        // when
        let result = slices[0].next_batch().await;

        // then
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
