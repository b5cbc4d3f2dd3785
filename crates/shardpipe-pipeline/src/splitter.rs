//! Table/range splitter: partitions a job's tables into parallel work units.
//!
//! Every table gets one baseline unit. A table whose primary key is exactly
//! one integer column is further split into `concurrency` contiguous key
//! ranges covering `[min, max]` with no gaps or overlaps. Tables with no
//! primary key, a composite key, or a non-integer key keep their single
//! unit with the fallback reason recorded. Splitting is deterministic for
//! identical inputs.

use tracing::debug;

use shardpipe_core::{
    Error, KeyRange, MetadataProvider, MigrationJobConfig, PipelineDataSource, PkColumn,
    Result, SplitFallback, WorkUnit,
};

/// Partition `[min, max]` into at most `n` contiguous inclusive ranges.
///
/// Step is `floor((max - min) / n)`; the last range absorbs the remainder.
fn split_ranges(min: i64, max: i64, n: u32) -> Vec<KeyRange> {
    let span = max.saturating_sub(min).saturating_add(1);
    let n_eff = (n as i64).min(span).max(1);
    let step = (span - 1) / n_eff;

    let mut ranges = Vec::with_capacity(n_eff as usize);
    let mut lower = min;
    for i in 0..n_eff {
        let upper = if i == n_eff - 1 { max } else { lower + step };
        ranges.push(KeyRange { lower, upper });
        if i + 1 < n_eff {
            lower = upper + 1;
        }
    }
    ranges
}

/// Decide whether a primary key qualifies for range splitting.
fn range_split_fallback(pk: &[PkColumn]) -> Option<SplitFallback> {
    match pk {
        [] => Some(SplitFallback::NoPrimaryKey),
        [single] if single.column_type.is_integer() => None,
        [_single] => Some(SplitFallback::NonIntegerPrimaryKey),
        _ => Some(SplitFallback::CompositePrimaryKey),
    }
}

/// Split a job's tables into work units.
///
/// Unit indexes are assigned in table order, then range order, so identical
/// inputs always produce identical units.
pub async fn split(
    config: &MigrationJobConfig,
    metadata: &dyn MetadataProvider,
    source: &dyn PipelineDataSource,
) -> Result<Vec<WorkUnit>> {
    if config.concurrency == 0 {
        return Err(Error::Config(
            "split concurrency must be greater than zero".into(),
        ));
    }

    let mut units = Vec::new();
    for table in &config.tables {
        let pk = metadata.primary_key(table).await?;
        let estimated = source.count_estimate(table).await?;

        match range_split_fallback(&pk) {
            Some(fallback) => {
                debug!(
                    table,
                    reason = ?fallback,
                    "Table not range-split, using single work unit"
                );
                units.push(WorkUnit {
                    table: table.clone(),
                    index: units.len(),
                    range: None,
                    estimated_rows: estimated,
                    fallback: Some(fallback),
                });
            }
            None => {
                let pk_column = &pk[0].name;
                match source.min_max_integer_pk(table, pk_column).await? {
                    None => {
                        // Zero-row table: one unit, nothing to estimate.
                        units.push(WorkUnit {
                            table: table.clone(),
                            index: units.len(),
                            range: None,
                            estimated_rows: 0,
                            fallback: None,
                        });
                    }
                    Some((min, max)) => {
                        let ranges = split_ranges(min, max, config.concurrency);
                        let per_range = estimated / ranges.len() as u64;
                        let last = ranges.len() - 1;
                        debug!(
                            table,
                            ranges = ranges.len(),
                            min,
                            max,
                            "Range-split table into work units"
                        );
                        for (i, range) in ranges.into_iter().enumerate() {
                            let estimated_rows = if i == last {
                                estimated - per_range * last as u64
                            } else {
                                per_range
                            };
                            units.push(WorkUnit {
                                table: table.clone(),
                                index: units.len(),
                                range: Some(range),
                                estimated_rows,
                                fallback: None,
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shardpipe_db::fixtures::{sequential_rows, MemoryDataSource, MemoryMetadataProvider};
    use shardpipe_core::{ColumnType, ConnectionDescriptor, DatabaseType, SinkConfig};

    fn job(tables: &[&str], concurrency: u32) -> MigrationJobConfig {
        MigrationJobConfig {
            job_id: "j1".into(),
            source: ConnectionDescriptor {
                url: "postgres://src".into(),
                database_type: DatabaseType::Postgres,
            },
            target: ConnectionDescriptor {
                url: "postgres://dst".into(),
                database_type: DatabaseType::Postgres,
            },
            tables: tables.iter().map(|t| t.to_string()).collect(),
            concurrency,
            sink: SinkConfig::default(),
        }
    }

    #[test]
    fn test_split_ranges_scenario() {
        // min=1, max=1000, N=4 → [1,250],[251,500],[501,750],[751,1000]
        let ranges = split_ranges(1, 1000, 4);
        assert_eq!(
            ranges,
            vec![
                KeyRange { lower: 1, upper: 250 },
                KeyRange { lower: 251, upper: 500 },
                KeyRange { lower: 501, upper: 750 },
                KeyRange { lower: 751, upper: 1000 },
            ]
        );
    }

    #[test]
    fn test_split_ranges_partition_no_gaps_no_overlap() {
        for (min, max, n) in [(1i64, 1000i64, 4u32), (0, 7, 3), (5, 5, 4), (1, 3, 8)] {
            let ranges = split_ranges(min, max, n);
            assert_eq!(ranges.first().unwrap().lower, min);
            assert_eq!(ranges.last().unwrap().upper, max);
            for pair in ranges.windows(2) {
                assert_eq!(pair[1].lower, pair[0].upper + 1, "gap or overlap");
            }
            for r in &ranges {
                assert!(r.lower <= r.upper);
            }
        }
    }

    #[test]
    fn test_split_ranges_extreme_span() {
        // Spans wider than i64 must not overflow the step arithmetic.
        let ranges = split_ranges(i64::MIN, i64::MAX, 4);
        assert_eq!(ranges.first().unwrap().lower, i64::MIN);
        assert_eq!(ranges.last().unwrap().upper, i64::MAX);
        for pair in ranges.windows(2) {
            assert_eq!(pair[1].lower, pair[0].upper + 1, "gap or overlap");
        }
    }

    #[test]
    fn test_split_ranges_remainder_to_last() {
        let ranges = split_ranges(1, 10, 3);
        // step = floor(9/3) = 3 → [1,4],[5,8],[9,10]
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2].upper, 10);
    }

    #[test]
    fn test_range_split_fallback_reasons() {
        assert_eq!(range_split_fallback(&[]), Some(SplitFallback::NoPrimaryKey));
        assert_eq!(
            range_split_fallback(&[PkColumn {
                name: "name".into(),
                column_type: ColumnType::Text,
            }]),
            Some(SplitFallback::NonIntegerPrimaryKey)
        );
        assert_eq!(
            range_split_fallback(&[
                PkColumn {
                    name: "a".into(),
                    column_type: ColumnType::Integer,
                },
                PkColumn {
                    name: "b".into(),
                    column_type: ColumnType::Integer,
                },
            ]),
            Some(SplitFallback::CompositePrimaryKey)
        );
        assert_eq!(
            range_split_fallback(&[PkColumn {
                name: "id".into(),
                column_type: ColumnType::Integer,
            }]),
            None
        );
    }

    #[tokio::test]
    async fn test_split_integer_pk_table() {
        let source = MemoryDataSource::postgres();
        source
            .load_table("orders", sequential_rows("id", 1, 1000))
            .await;
        let meta = MemoryMetadataProvider::new().with_integer_pk("orders", "id");

        let units = split(&job(&["orders"], 4), &meta, source.as_ref())
            .await
            .unwrap();
        assert_eq!(units.len(), 4);
        assert_eq!(units[0].range, Some(KeyRange { lower: 1, upper: 250 }));
        assert_eq!(units[3].range, Some(KeyRange { lower: 751, upper: 1000 }));
        assert_eq!(units.iter().map(|u| u.estimated_rows).sum::<u64>(), 1000);
        assert!(units.iter().all(|u| u.fallback.is_none()));
        // Indexes assigned in order
        assert_eq!(
            units.iter().map(|u| u.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_split_non_qualifying_table_single_unit() {
        let source = MemoryDataSource::postgres();
        source
            .load_table("events", sequential_rows("id", 1, 50))
            .await;
        let meta = MemoryMetadataProvider::new().with_pk("events", vec![]);

        for n in [1, 4, 16] {
            let units = split(&job(&["events"], n), &meta, source.as_ref())
                .await
                .unwrap();
            assert_eq!(units.len(), 1, "always one unit regardless of N");
            assert_eq!(units[0].fallback, Some(SplitFallback::NoPrimaryKey));
            assert_eq!(units[0].estimated_rows, 50);
        }
    }

    #[tokio::test]
    async fn test_split_empty_table_single_zero_unit() {
        let source = MemoryDataSource::postgres();
        source.load_table("empty", vec![]).await;
        let meta = MemoryMetadataProvider::new().with_integer_pk("empty", "id");

        let units = split(&job(&["empty"], 4), &meta, source.as_ref())
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].estimated_rows, 0);
        assert_eq!(units[0].range, None);
    }

    #[tokio::test]
    async fn test_split_zero_concurrency_is_config_error() {
        let source = MemoryDataSource::postgres();
        let meta = MemoryMetadataProvider::new();
        let err = split(&job(&["orders"], 0), &meta, source.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_split_is_deterministic() {
        let source = MemoryDataSource::postgres();
        source
            .load_table("orders", sequential_rows("id", 1, 777))
            .await;
        let meta = MemoryMetadataProvider::new().with_integer_pk("orders", "id");
        let config = job(&["orders"], 5);

        let a = split(&config, &meta, source.as_ref()).await.unwrap();
        let b = split(&config, &meta, source.as_ref()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_split_mixed_tables_index_order() {
        let source = MemoryDataSource::postgres();
        source
            .load_table("orders", sequential_rows("id", 1, 100))
            .await;
        source
            .load_table("events", sequential_rows("id", 1, 10))
            .await;
        let meta = MemoryMetadataProvider::new()
            .with_integer_pk("orders", "id")
            .with_pk("events", vec![]);

        let units = split(&job(&["orders", "events"], 2), &meta, source.as_ref())
            .await
            .unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[2].table, "events");
        assert_eq!(units[2].index, 2);
    }
}
