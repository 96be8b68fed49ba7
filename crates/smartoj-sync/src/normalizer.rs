//! Change normalizer
//!
//! Turns decoded rows events into [`ChangeRecord`]s:
//! - column indices become column names (TABLE_MAP metadata when the server
//!   sends it, otherwise a [`ColumnCatalog`] lookup cached in [`SchemaCache`])
//! - TIMESTAMP / DATETIME columns are dropped, since their values depend on
//!   when a statement ran and would make replays diverge
//! - the remaining values become [`Scalar`]s

use crate::error::{Result, SyncError};
use crate::event::{Action, BinlogPosition, ChangeRecord, Row, Scalar};
use crate::mysql::{ColumnType, ColumnValue, RowImage, RowsEvent, TableMapEvent};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Source of ordered column names for a table.
#[async_trait]
pub trait ColumnCatalog: Send + Sync {
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;
}

/// Shared column catalog.
pub type SharedColumnCatalog = Arc<dyn ColumnCatalog>;

/// `INFORMATION_SCHEMA.COLUMNS` over a `mysql_async` pool.
pub struct MySqlColumnCatalog {
    pool: mysql_async::Pool,
}

impl MySqlColumnCatalog {
    pub fn new(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ColumnCatalog for MySqlColumnCatalog {
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let columns: Vec<String> = conn
            .exec(
                r#"
                SELECT COLUMN_NAME
                FROM INFORMATION_SCHEMA.COLUMNS
                WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                ORDER BY ORDINAL_POSITION
                "#,
                (schema, table),
            )
            .await?;
        debug!(
            "Fetched {} column names for {}.{}",
            columns.len(),
            schema,
            table
        );
        Ok(columns)
    }
}

/// Fixed column lists, for tests and offline replays.
#[derive(Debug, Default, Clone)]
pub struct StaticColumnCatalog {
    tables: HashMap<(String, String), Vec<String>>,
}

impl StaticColumnCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, schema: &str, table: &str, columns: &[&str]) -> Self {
        self.tables.insert(
            (schema.to_string(), table.to_string()),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl ColumnCatalog for StaticColumnCatalog {
    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| SyncError::mysql(format!("Unknown table {}.{}", schema, table)))
    }
}

/// Column names per `(schema, table)`.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: HashMap<(String, String), Vec<String>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached names, only if they still match the event's column count.
    pub fn get(&self, schema: &str, table: &str, column_count: usize) -> Option<&[String]> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .filter(|cols| cols.len() == column_count)
            .map(Vec::as_slice)
    }

    pub fn insert(&mut self, schema: &str, table: &str, columns: Vec<String>) {
        self.tables
            .insert((schema.to_string(), table.to_string()), columns);
    }

    /// Forget everything, e.g. after DDL.
    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Convert one rows event into change records sharing `position`.
pub fn normalize_rows(
    action: Action,
    rows: &RowsEvent,
    table_map: &TableMapEvent,
    columns: &[String],
    position: &BinlogPosition,
) -> Result<Vec<ChangeRecord>> {
    if columns.len() < table_map.column_count {
        return Err(SyncError::replication(format!(
            "{}.{} has {} columns in the binlog but {} known names",
            table_map.schema_name,
            table_map.table_name,
            table_map.column_count,
            columns.len()
        )));
    }

    let table = table_map.table_name.as_str();
    let to_row = |image: &RowImage| image_to_row(image, table_map, columns);

    rows.rows
        .iter()
        .map(|row| {
            let record = match action {
                Action::Insert => ChangeRecord::insert(
                    table,
                    to_row(require(&row.after, table, "after")?),
                    position.clone(),
                ),
                Action::Update => ChangeRecord::update(
                    table,
                    to_row(require(&row.before, table, "before")?),
                    to_row(require(&row.after, table, "after")?),
                    position.clone(),
                ),
                Action::Delete => ChangeRecord::delete(
                    table,
                    to_row(require(&row.before, table, "before")?),
                    position.clone(),
                ),
            };
            Ok(record)
        })
        .collect()
}

fn require<'a>(image: &'a Option<RowImage>, table: &str, which: &str) -> Result<&'a RowImage> {
    image
        .as_ref()
        .ok_or_else(|| SyncError::shape(format!("rows event on '{}' without {} image", table, which)))
}

fn image_to_row(image: &RowImage, table_map: &TableMapEvent, columns: &[String]) -> Row {
    image
        .iter()
        .filter_map(|(idx, value)| {
            let col_type = table_map.column_types.get(*idx).copied()?;
            if col_type.is_temporal_instant() {
                return None;
            }
            let name = columns.get(*idx)?;
            let scalar = to_scalar(value, col_type, table_map.is_unsigned(*idx));
            Some((name.clone(), scalar))
        })
        .collect()
}

/// Map a decoded column value to a [`Scalar`].
pub fn to_scalar(value: &ColumnValue, col_type: ColumnType, unsigned: bool) -> Scalar {
    match value {
        ColumnValue::Null => Scalar::Null,
        ColumnValue::SignedInt(v) if unsigned => {
            let raw = match col_type {
                ColumnType::Tiny => *v as u8 as u64,
                ColumnType::Short => *v as u16 as u64,
                ColumnType::Int24 => (*v as u32 & 0x00FF_FFFF) as u64,
                ColumnType::Long => *v as u32 as u64,
                _ => *v as u64,
            };
            match i64::try_from(raw) {
                Ok(v) => Scalar::Int(v),
                Err(_) => Scalar::UInt(raw),
            }
        }
        ColumnValue::SignedInt(v) => Scalar::Int(*v),
        ColumnValue::Float(v) => Scalar::Float(f64::from(*v)),
        ColumnValue::Double(v) => Scalar::Float(*v),
        ColumnValue::Decimal(s) | ColumnValue::String(s) => Scalar::Text(s.clone()),
        ColumnValue::Bytes(b) | ColumnValue::Json(b) => {
            Scalar::Text(String::from_utf8_lossy(b).into_owned())
        }
        ColumnValue::Date { year, month, day } => {
            Scalar::Text(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        ColumnValue::Time {
            hours,
            minutes,
            seconds,
            microseconds,
            negative,
        } => {
            let sign = if *negative { "-" } else { "" };
            if *microseconds > 0 {
                Scalar::Text(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, minutes, seconds, microseconds
                ))
            } else {
                Scalar::Text(format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds))
            }
        }
        ColumnValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            ..
        } => Scalar::Text(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        )),
        ColumnValue::Timestamp(secs) => Scalar::Int(i64::from(*secs)),
        ColumnValue::Year(y) => Scalar::Int(i64::from(*y)),
        ColumnValue::Enum(v) => Scalar::Int(i64::from(*v)),
        ColumnValue::Set(v) => match i64::try_from(*v) {
            Ok(v) => Scalar::Int(v),
            Err(_) => Scalar::UInt(*v),
        },
        ColumnValue::Bit(bytes) => {
            let v = bytes.iter().take(8).fold(0u64, |acc, b| (acc << 8) | *b as u64);
            match i64::try_from(v) {
                Ok(v) => Scalar::Int(v),
                Err(_) => Scalar::UInt(v),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::RowData;

    fn question_map() -> TableMapEvent {
        TableMapEvent {
            table_id: 91,
            flags: 0,
            schema_name: "smartoj".into(),
            table_name: "question".into(),
            column_count: 5,
            column_types: vec![
                ColumnType::Long,
                ColumnType::Varchar,
                ColumnType::Tiny,
                ColumnType::DateTime2,
                ColumnType::Timestamp2,
            ],
            column_metadata: vec![0; 5],
            null_bitmap: vec![0],
            unsigned: vec![true, false, false, false, false],
            column_names: None,
        }
    }

    fn columns() -> Vec<String> {
        ["id", "title", "is_deleted", "create_time", "update_time"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn image(id: i64, title: &str) -> RowImage {
        vec![
            (0, ColumnValue::SignedInt(id)),
            (1, ColumnValue::String(title.into())),
            (2, ColumnValue::SignedInt(0)),
            (
                3,
                ColumnValue::DateTime {
                    year: 2024,
                    month: 1,
                    day: 1,
                    hour: 0,
                    minute: 0,
                    second: 0,
                    microsecond: 0,
                },
            ),
            (4, ColumnValue::Timestamp(1_700_000_000)),
        ]
    }

    fn pos() -> BinlogPosition {
        BinlogPosition::new("binlog.000001", 900)
    }

    #[test]
    fn test_drops_temporal_columns_and_keeps_order() {
        let rows = RowsEvent {
            table_id: 91,
            flags: 0,
            column_count: 5,
            rows: vec![RowData {
                before: None,
                after: Some(image(42, "Two Sum")),
            }],
        };
        let records =
            normalize_rows(Action::Insert, &rows, &question_map(), &columns(), &pos()).unwrap();
        assert_eq!(records.len(), 1);

        let after = records[0].after.as_ref().unwrap();
        let fields: Vec<&str> = after.fields().collect();
        assert_eq!(fields, vec!["id", "title", "is_deleted"]);
        assert_eq!(after.get("id"), Some(&Scalar::Int(42)));
        assert_eq!(records[0].before, None);
        assert_eq!(records[0].position, pos());
    }

    #[test]
    fn test_multi_row_event_shares_position() {
        let rows = RowsEvent {
            table_id: 91,
            flags: 0,
            column_count: 5,
            rows: vec![
                RowData {
                    before: Some(image(1, "a")),
                    after: Some(image(1, "b")),
                },
                RowData {
                    before: Some(image(2, "c")),
                    after: Some(image(2, "d")),
                },
            ],
        };
        let records =
            normalize_rows(Action::Update, &rows, &question_map(), &columns(), &pos()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.position == pos()));
        assert!(records.iter().all(|r| r.validate_shape().is_ok()));
        assert_eq!(
            records[1].after.as_ref().unwrap().opt_str("title"),
            Some("d")
        );
    }

    #[test]
    fn test_partial_image_maps_by_index() {
        let rows = RowsEvent {
            table_id: 91,
            flags: 0,
            column_count: 5,
            rows: vec![RowData {
                before: Some(vec![(0, ColumnValue::SignedInt(7))]),
                after: None,
            }],
        };
        let records =
            normalize_rows(Action::Delete, &rows, &question_map(), &columns(), &pos()).unwrap();
        let before = records[0].before.as_ref().unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before.opt_i64("id"), Some(7));
    }

    #[test]
    fn test_missing_image_is_shape_error() {
        let rows = RowsEvent {
            table_id: 91,
            flags: 0,
            column_count: 5,
            rows: vec![RowData {
                before: None,
                after: None,
            }],
        };
        let result = normalize_rows(Action::Insert, &rows, &question_map(), &columns(), &pos());
        assert!(matches!(result, Err(SyncError::Shape(_))));
    }

    #[test]
    fn test_too_few_column_names_is_an_error() {
        let rows = RowsEvent {
            table_id: 91,
            flags: 0,
            column_count: 5,
            rows: Vec::new(),
        };
        let names = vec!["id".to_string()];
        assert!(normalize_rows(Action::Insert, &rows, &question_map(), &names, &pos()).is_err());
    }

    #[test]
    fn test_unsigned_reinterpretation() {
        assert_eq!(
            to_scalar(&ColumnValue::SignedInt(-1), ColumnType::Tiny, true),
            Scalar::Int(255)
        );
        assert_eq!(
            to_scalar(&ColumnValue::SignedInt(-1), ColumnType::Long, true),
            Scalar::Int(4_294_967_295)
        );
        assert_eq!(
            to_scalar(&ColumnValue::SignedInt(-1), ColumnType::LongLong, true),
            Scalar::UInt(u64::MAX)
        );
        assert_eq!(
            to_scalar(&ColumnValue::SignedInt(-1), ColumnType::Long, false),
            Scalar::Int(-1)
        );
    }

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(
            to_scalar(
                &ColumnValue::Date {
                    year: 2024,
                    month: 3,
                    day: 9
                },
                ColumnType::Date,
                false
            ),
            Scalar::Text("2024-03-09".into())
        );
        assert_eq!(
            to_scalar(
                &ColumnValue::Time {
                    hours: 1,
                    minutes: 2,
                    seconds: 3,
                    microseconds: 0,
                    negative: true
                },
                ColumnType::Time2,
                false
            ),
            Scalar::Text("-01:02:03".into())
        );
        assert_eq!(
            to_scalar(&ColumnValue::Decimal("12.50".into()), ColumnType::NewDecimal, false),
            Scalar::Text("12.50".into())
        );
        assert_eq!(
            to_scalar(&ColumnValue::Json(b"{\"a\":1}".to_vec()), ColumnType::Json, false),
            Scalar::Text("{\"a\":1}".into())
        );
        assert_eq!(
            to_scalar(&ColumnValue::Bit(vec![0x01, 0x00]), ColumnType::Bit, false),
            Scalar::Int(256)
        );
    }

    #[test]
    fn test_schema_cache_checks_column_count() {
        let mut cache = SchemaCache::new();
        cache.insert("smartoj", "tag", vec!["id".into(), "name".into()]);
        assert!(cache.get("smartoj", "tag", 2).is_some());
        assert!(cache.get("smartoj", "tag", 3).is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_static_catalog() {
        let catalog = StaticColumnCatalog::new().with_table("smartoj", "tag", &["id", "name"]);
        assert_eq!(
            catalog.columns("smartoj", "tag").await.unwrap(),
            vec!["id", "name"]
        );
        assert!(catalog.columns("smartoj", "user").await.is_err());
    }
}
