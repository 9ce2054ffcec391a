//! Write path: buffered rows committed in one atomic transaction.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use common::{CreateMode, Op};
use futures::future::try_join_all;

use crate::capacity::{check_keys_limit, current_key_count};
use crate::error::{Error, Result};
use crate::model::Row;
use crate::serde::encode_row;
use crate::table::{KeeperMapTable, TableInner};

/// Collects rows and writes them on [`finish`](KeeperMapSink::finish).
///
/// Rows with the same primary key overwrite each other: the last one wins.
pub struct KeeperMapSink {
    table: Arc<TableInner>,
    new_values: HashMap<String, Bytes>,
}

impl KeeperMapTable {
    /// Opens a sink for one insert.
    pub async fn sink(&self) -> Result<KeeperMapSink> {
        self.inner.check_table().await?;
        Ok(KeeperMapSink {
            table: Arc::clone(&self.inner),
            new_values: HashMap::new(),
        })
    }
}

impl KeeperMapSink {
    /// Buffers `rows`. Nothing is written until `finish`.
    pub fn consume(&mut self, rows: &[Row]) -> Result<()> {
        let schema = &self.table.schema;
        for row in rows {
            schema.validate_row(row)?;
            let (key, value) = encode_row(schema, row)?;
            self.new_values.insert(key, value);
        }
        Ok(())
    }

    /// Number of distinct keys buffered so far.
    pub fn buffered_keys(&self) -> usize {
        self.new_values.len()
    }

    /// Writes every buffered row in one multi-op transaction.
    ///
    /// Fails with [`Error::LimitExceeded`] without writing anything when the
    /// new keys would exceed the table's keys limit. The limit is checked
    /// against a count read before the commit, so concurrent writers may
    /// overshoot it.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn finish(self) -> Result<()> {
        if self.new_values.is_empty() {
            return Ok(());
        }
        let table = &self.table;
        let client = table.get_client().await?;

        let current_keys = if table.keys_limit != 0 {
            current_key_count(client.as_ref(), &table.paths.root).await?
        } else {
            0
        };

        let checks = self.new_values.into_iter().map(|(key, value)| {
            let client = Arc::clone(&client);
            let path = table.paths.key_path(&key);
            async move {
                let exists = client.exists(&path).await?.is_some();
                Ok::<_, common::CoordinationError>((path, value, exists))
            }
        });
        let staged = tokio::time::timeout(table.operation_timeout, try_join_all(checks))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "failed to check key existence within {:?}",
                    table.operation_timeout
                ))
            })??;

        let mut ops = Vec::with_capacity(staged.len());
        let mut new_keys = 0u64;
        for (path, value, exists) in staged {
            if exists {
                ops.push(Op::set(path, value, None));
            } else {
                ops.push(Op::create(path, value, CreateMode::Persistent));
                new_keys += 1;
            }
        }

        if new_keys != 0 {
            check_keys_limit(current_keys, new_keys, table.keys_limit)?;
        }

        let total = ops.len();
        client.multi(ops).await?;
        tracing::debug!(
            root_path = %table.paths.root,
            total,
            new_keys,
            "committed rows"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineSettings, ReadOptions, TableConfig};
    use crate::model::{Column, DataType, Schema, Value};
    use crate::reader::KeySelection;
    use crate::table::TableDefinition;
    use common::{ConnectorRegistry, InMemoryEnsemble};

    fn schema() -> Schema {
        Schema::new(
            vec![
                Column::new("value", DataType::Int64),
                Column::new("key", DataType::String),
            ],
            &["key"],
        )
        .unwrap()
    }

    fn row(key: &str, value: i64) -> Row {
        vec![Value::Int64(value), Value::from(key)]
    }

    async fn table(ensemble: &InMemoryEnsemble, keys_limit: u64) -> KeeperMapTable {
        KeeperMapTable::create(
            TableDefinition::new(
                "t",
                schema(),
                TableConfig::new("/t").with_keys_limit(keys_limit),
            ),
            &EngineSettings::with_path_prefix("/keeper_map"),
            ConnectorRegistry::new(Arc::new(ensemble.clone())),
        )
        .await
        .unwrap()
    }

    async fn lookup(table: &KeeperMapTable, key: &str) -> Option<Row> {
        let batch = table.get_by_keys(&[Value::from(key)]).await.unwrap();
        match batch.null_map.as_deref() {
            Some([false]) => batch.rows.into_iter().next(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn should_keep_last_value_for_duplicate_keys() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table(&ensemble, 0).await;
        let mut sink = table.sink().await.unwrap();

        // when
        sink.consume(&[row("a", 1), row("a", 2)]).unwrap();
        assert_eq!(sink.buffered_keys(), 1);
        sink.finish().await.unwrap();

        // then
        assert_eq!(lookup(&table, "a").await, Some(row("a", 2)));
    }

    #[tokio::test]
    async fn should_overwrite_existing_keys() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table(&ensemble, 0).await;
        let mut sink = table.sink().await.unwrap();
        sink.consume(&[row("a", 1)]).unwrap();
        sink.finish().await.unwrap();

        // when
        let mut sink = table.sink().await.unwrap();
        sink.consume(&[row("a", 7), row("b", 8)]).unwrap();
        sink.finish().await.unwrap();

        // then
        assert_eq!(lookup(&table, "a").await, Some(row("a", 7)));
        assert_eq!(lookup(&table, "b").await, Some(row("b", 8)));
    }

    #[tokio::test]
    async fn should_reject_row_not_matching_schema() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table(&ensemble, 0).await;
        let mut sink = table.sink().await.unwrap();

        // when
        let result = sink.consume(&[vec![Value::from("a"), Value::Int64(1)]]);

        // then
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[tokio::test]
    async fn should_accept_keys_up_to_limit() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table(&ensemble, 3).await;
        let mut sink = table.sink().await.unwrap();

        // when
        sink.consume(&[row("a", 1), row("b", 2), row("c", 3)]).unwrap();
        let result = sink.finish().await;

        // then
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn should_reject_whole_batch_over_limit() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table(&ensemble, 3).await;
        let mut sink = table.sink().await.unwrap();
        sink.consume(&[row("a", 1), row("b", 2)]).unwrap();
        sink.finish().await.unwrap();

        // when
        let mut sink = table.sink().await.unwrap();
        sink.consume(&[row("a", 10), row("c", 3), row("d", 4)]).unwrap();
        let result = sink.finish().await;

        // then
        assert_eq!(
            result,
            Err(Error::LimitExceeded {
                new_keys: 2,
                limit: 3,
                would_be: 4
            })
        );
        assert_eq!(lookup(&table, "a").await, Some(row("a", 1)));
        assert_eq!(lookup(&table, "c").await, None);
    }

    #[tokio::test]
    async fn should_allow_overwrites_when_at_limit() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table(&ensemble, 1).await;
        let mut sink = table.sink().await.unwrap();
        sink.consume(&[row("a", 1)]).unwrap();
        sink.finish().await.unwrap();

        // when
        let mut sink = table.sink().await.unwrap();
        sink.consume(&[row("a", 2)]).unwrap();
        let result = sink.finish().await;

        // then
        assert!(result.is_ok());
        assert_eq!(lookup(&table, "a").await, Some(row("a", 2)));
    }

    #[tokio::test]
    async fn should_make_written_rows_visible_to_full_scan() {
        // given
        let ensemble = InMemoryEnsemble::new();
        let table = table(&ensemble, 0).await;
        let mut sink = table.sink().await.unwrap();
        sink.consume(&[row("x", 1), row("y", 2)]).unwrap();

        // when
        sink.finish().await.unwrap();

        // then
        let mut slices = table
            .read(KeySelection::FullScan, ReadOptions::default())
            .await
            .unwrap();
        let batch = slices[0].next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
    }
}
