//! MySQL binlog event decoder
//!
//! Decodes the events a row-based replica cares about:
//! - FORMAT_DESCRIPTION_EVENT (checksum detection)
//! - TABLE_MAP_EVENT (including MySQL 8 optional metadata)
//! - WRITE/UPDATE/DELETE_ROWS_EVENT (v1 and v2)
//! - ROTATE_EVENT
//! - XID_EVENT
//! - QUERY_EVENT
//! - HEARTBEAT_LOG_EVENT

use anyhow::{bail, Result};
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

/// Binlog event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatLogEvent = 27,
    RowsQueryLogEvent = 29,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    GtidLogEvent = 33,
    AnonymousGtidLogEvent = 34,
    PreviousGtidsLogEvent = 35,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatLogEvent,
            29 => EventType::RowsQueryLogEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidLogEvent,
            34 => EventType::AnonymousGtidLogEvent,
            35 => EventType::PreviousGtidsLogEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV1
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV1
                | EventType::DeleteRowsEventV2
        )
    }

    fn is_v2_rows(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV2
        )
    }
}

/// MySQL column types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => ColumnType::VarString,
        }
    }

    /// Columns whose value depends on when the statement ran.
    pub fn is_temporal_instant(&self) -> bool {
        matches!(
            self,
            ColumnType::Timestamp
                | ColumnType::Timestamp2
                | ColumnType::DateTime
                | ColumnType::DateTime2
        )
    }

    /// Columns covered by the SIGNEDNESS optional metadata bitmap.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Int24
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::Float
                | ColumnType::Double
                | ColumnType::Decimal
                | ColumnType::NewDecimal
        )
    }
}

/// Binlog event header
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    /// Offset just past this event in the current binlog file
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Event header too short: {} bytes", data.len());
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.get_u32_le();
        let event_type = EventType::from_u8(cursor.get_u8());
        let server_id = cursor.get_u32_le();
        let event_length = cursor.get_u32_le();
        let next_position = cursor.get_u32_le();
        let flags = cursor.get_u16_le();

        Ok(Self {
            timestamp,
            event_type,
            server_id,
            event_length,
            next_position,
            flags,
        })
    }
}

/// Decoded binlog event
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    TableMap(TableMapEvent),
    WriteRows(RowsEvent),
    UpdateRows(RowsEvent),
    DeleteRows(RowsEvent),
    Xid(XidEvent),
    Query(QueryEvent),
    Rotate(RotateEvent),
    Heartbeat,
    Unknown(EventType),
}

/// Format description event
#[derive(Debug, Clone)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub checksum_type: u8,
}

/// Table map event - describes table structure
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub schema_name: String,
    pub table_name: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
    /// Per column; only populated when the server sends SIGNEDNESS metadata
    pub unsigned: Vec<bool>,
    /// Present with `binlog_row_metadata=FULL`
    pub column_names: Option<Vec<String>>,
}

impl TableMapEvent {
    pub fn is_unsigned(&self, col_idx: usize) -> bool {
        self.unsigned.get(col_idx).copied().unwrap_or(false)
    }
}

/// Rows event (INSERT/UPDATE/DELETE)
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub table_id: u64,
    pub flags: u16,
    pub column_count: usize,
    pub rows: Vec<RowData>,
}

/// Column index paired with its decoded value
pub type RowImage = Vec<(usize, ColumnValue)>;

/// One row of a rows event
#[derive(Debug, Clone)]
pub struct RowData {
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

/// Column value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    SignedInt(i64),
    Float(f32),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        hours: u16,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
        negative: bool,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    },
    /// Seconds since the epoch
    Timestamp(u32),
    Year(u16),
    /// MySQL binary JSON, undecoded
    Json(Vec<u8>),
    Enum(u16),
    Set(u64),
    Bit(Vec<u8>),
}

/// XID event (transaction commit)
#[derive(Debug, Clone)]
pub struct XidEvent {
    pub xid: u64,
}

/// Query event
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub schema: String,
    pub query: String,
}

impl QueryEvent {
    /// DDL that can change a table's column layout.
    pub fn is_schema_change(&self) -> bool {
        let q = self.query.trim_start().to_ascii_uppercase();
        q.starts_with("ALTER ")
            || q.starts_with("CREATE ")
            || q.starts_with("DROP ")
            || q.starts_with("RENAME ")
            || q.starts_with("TRUNCATE ")
    }
}

/// Rotate event
#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub position: u64,
    pub next_binlog: String,
}

// Optional metadata field types in TABLE_MAP_EVENT
const TM_SIGNEDNESS: u8 = 1;
const TM_COLUMN_NAME: u8 = 4;

/// Binlog decoder with table cache
#[derive(Default)]
pub struct BinlogDecoder {
    table_cache: HashMap<u64, TableMapEvent>,
    format: Option<FormatDescriptionEvent>,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one event. The header's `next_position` is the end of the
    /// physical event and the only valid resume point after it.
    pub fn decode(&mut self, data: &Bytes) -> Result<(BinlogEvent, EventHeader)> {
        if data.len() < EventHeader::SIZE {
            bail!("Event data too short: {} bytes", data.len());
        }

        let header = EventHeader::parse(data)?;

        // checksum_type: 0 = NONE, 1 = CRC32. The FDE announces it for the
        // rest of the file; for the FDE itself the algorithm byte sits just
        // before the trailing CRC32.
        let has_checksum = if header.event_type == EventType::FormatDescriptionEvent {
            let payload = &data[EventHeader::SIZE..];
            if payload.len() >= 58 {
                let version_str = std::str::from_utf8(&payload[2..52])
                    .unwrap_or("")
                    .trim_end_matches('\0');
                Self::mysql_version_has_checksum(version_str) && payload[payload.len() - 5] == 1
            } else {
                false
            }
        } else {
            self.format
                .as_ref()
                .map(|f| f.checksum_type == 1)
                .unwrap_or(false)
        };

        let payload_end = if has_checksum && data.len() > EventHeader::SIZE + 4 {
            data.len() - 4
        } else {
            data.len()
        };
        let payload = &data[EventHeader::SIZE..payload_end];

        trace!(
            "Decoding {:?} event, {} bytes payload (checksum={})",
            header.event_type,
            payload.len(),
            has_checksum
        );

        let event = match header.event_type {
            EventType::FormatDescriptionEvent => {
                let event = self.decode_format_description(payload)?;
                self.format = Some(event.clone());
                BinlogEvent::FormatDescription(event)
            }
            EventType::TableMapEvent => {
                let event = decode_table_map(payload)?;
                self.table_cache.insert(event.table_id, event.clone());
                BinlogEvent::TableMap(event)
            }
            EventType::WriteRowsEventV1 | EventType::WriteRowsEventV2 => {
                BinlogEvent::WriteRows(self.decode_rows_event(payload, header.event_type)?)
            }
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2 => {
                BinlogEvent::UpdateRows(self.decode_rows_event(payload, header.event_type)?)
            }
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2 => {
                BinlogEvent::DeleteRows(self.decode_rows_event(payload, header.event_type)?)
            }
            EventType::XidEvent => {
                need(&Cursor::new(payload), 8)?;
                BinlogEvent::Xid(XidEvent {
                    xid: Cursor::new(payload).get_u64_le(),
                })
            }
            EventType::QueryEvent => BinlogEvent::Query(decode_query(payload)?),
            EventType::RotateEvent => BinlogEvent::Rotate(decode_rotate(payload)?),
            EventType::HeartbeatLogEvent => BinlogEvent::Heartbeat,
            other => {
                trace!("Unhandled event type: {:?}", other);
                BinlogEvent::Unknown(other)
            }
        };

        Ok((event, header))
    }

    /// Get table info from cache
    pub fn get_table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_cache.get(&table_id)
    }

    fn decode_format_description(&self, data: &[u8]) -> Result<FormatDescriptionEvent> {
        let mut cursor = Cursor::new(data);
        need(&cursor, 57)?;

        let binlog_version = cursor.get_u16_le();

        let mut server_version_bytes = [0u8; 50];
        cursor.read_exact(&mut server_version_bytes)?;
        let server_version = String::from_utf8_lossy(&server_version_bytes)
            .trim_end_matches('\0')
            .to_string();

        let create_timestamp = cursor.get_u32_le();
        let header_length = cursor.get_u8();

        // The trailing CRC32 was already stripped, so the algorithm byte is last
        let checksum_type = if Self::mysql_version_has_checksum(&server_version) {
            match data.last() {
                Some(&alg) if alg <= 1 => alg,
                _ => 0,
            }
        } else {
            0
        };

        debug!(
            "FDE: binlog_version={}, server={}, checksum_type={}",
            binlog_version, server_version, checksum_type
        );

        Ok(FormatDescriptionEvent {
            binlog_version,
            server_version,
            create_timestamp,
            header_length,
            checksum_type,
        })
    }

    /// Checksums exist from MySQL 5.6.1 and MariaDB 5.3.
    fn mysql_version_has_checksum(version: &str) -> bool {
        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() < 2 {
            return true;
        }
        let major: u32 = parts[0].parse().unwrap_or(0);
        let minor: u32 = parts[1]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .unwrap_or(0);

        if version.contains("MariaDB") {
            return major > 5 || (major == 5 && minor >= 3);
        }
        major > 5 || (major == 5 && minor >= 6)
    }

    fn decode_rows_event(&self, data: &[u8], event_type: EventType) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(data);
        need(&cursor, 8)?;

        let table_id = read_table_id(&mut cursor)?;
        let flags = cursor.get_u16_le();

        if event_type.is_v2_rows() {
            need(&cursor, 2)?;
            let extra_len = cursor.get_u16_le() as usize;
            if extra_len > 2 {
                need(&cursor, extra_len - 2)?;
                cursor.advance(extra_len - 2);
            }
        }

        let column_count = read_packed_int(&mut cursor)? as usize;

        let bitmap_len = column_count.div_ceil(8);
        let mut present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut present)?;

        let is_update = matches!(
            event_type,
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2
        );
        let is_delete = matches!(
            event_type,
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2
        );

        let present_after = if is_update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            bitmap
        } else {
            present.clone()
        };

        // Row images cannot be parsed without the column types
        let Some(table_map) = self.table_cache.get(&table_id) else {
            debug!("Rows event for unknown table_id {}, rows left undecoded", table_id);
            return Ok(RowsEvent {
                table_id,
                flags,
                column_count,
                rows: Vec::new(),
            });
        };

        let mut rows = Vec::new();
        while cursor.has_remaining() {
            let row = if is_update {
                let before = self.decode_row_image(&mut cursor, table_map, column_count, &present)?;
                let after =
                    self.decode_row_image(&mut cursor, table_map, column_count, &present_after)?;
                RowData {
                    before: Some(before),
                    after: Some(after),
                }
            } else if is_delete {
                let before = self.decode_row_image(&mut cursor, table_map, column_count, &present)?;
                RowData {
                    before: Some(before),
                    after: None,
                }
            } else {
                let after = self.decode_row_image(&mut cursor, table_map, column_count, &present)?;
                RowData {
                    before: None,
                    after: Some(after),
                }
            };
            rows.push(row);
        }

        debug!(
            "{:?} decoded: table_id={}, rows={}",
            event_type,
            table_id,
            rows.len()
        );

        Ok(RowsEvent {
            table_id,
            flags,
            column_count,
            rows,
        })
    }

    fn decode_row_image(
        &self,
        cursor: &mut Cursor<&[u8]>,
        table_map: &TableMapEvent,
        column_count: usize,
        present: &[u8],
    ) -> Result<RowImage> {
        let null_bitmap_len = count_set_bits(present).div_ceil(8);
        let mut null_bitmap = vec![0u8; null_bitmap_len];
        cursor.read_exact(&mut null_bitmap)?;

        let mut values = Vec::with_capacity(column_count);
        let mut null_idx = 0;

        for col_idx in 0..column_count {
            if !is_bit_set(present, col_idx) {
                continue;
            }

            if is_bit_set(&null_bitmap, null_idx) {
                values.push((col_idx, ColumnValue::Null));
                null_idx += 1;
                continue;
            }
            null_idx += 1;

            let col_type = table_map
                .column_types
                .get(col_idx)
                .copied()
                .unwrap_or(ColumnType::VarString);
            let metadata = table_map.column_metadata.get(col_idx).copied().unwrap_or(0);

            values.push((col_idx, decode_column_value(cursor, col_type, metadata)?));
        }

        Ok(values)
    }
}

fn decode_table_map(data: &[u8]) -> Result<TableMapEvent> {
    let mut cursor = Cursor::new(data);
    need(&cursor, 9)?;

    let table_id = read_table_id(&mut cursor)?;
    let flags = cursor.get_u16_le();

    let schema_name = read_len_prefixed_name(&mut cursor)?;
    let table_name = read_len_prefixed_name(&mut cursor)?;

    let column_count = read_packed_int(&mut cursor)? as usize;
    need(&cursor, column_count)?;
    let column_types: Vec<ColumnType> = (0..column_count)
        .map(|_| ColumnType::from_u8(cursor.get_u8()))
        .collect();

    let metadata_len = read_packed_int(&mut cursor)? as usize;
    let mut metadata_block = vec![0u8; metadata_len];
    cursor.read_exact(&mut metadata_block)?;
    let column_metadata = decode_column_metadata(&column_types, &metadata_block)?;

    let mut null_bitmap = vec![0u8; column_count.div_ceil(8)];
    cursor.read_exact(&mut null_bitmap)?;

    let mut unsigned = vec![false; column_count];
    let mut column_names = None;

    // Optional metadata: (type, packed length, value)*
    while cursor.has_remaining() {
        let field_type = cursor.get_u8();
        let len = read_packed_int(&mut cursor)? as usize;
        let mut value = vec![0u8; len];
        cursor.read_exact(&mut value)?;

        match field_type {
            TM_SIGNEDNESS => {
                let mut numeric_idx = 0;
                for (col_idx, col_type) in column_types.iter().enumerate() {
                    if !col_type.is_numeric() {
                        continue;
                    }
                    let byte = value.get(numeric_idx / 8).copied().unwrap_or(0);
                    unsigned[col_idx] = byte & (0x80 >> (numeric_idx % 8)) != 0;
                    numeric_idx += 1;
                }
            }
            TM_COLUMN_NAME => {
                let mut names_cursor = Cursor::new(value.as_slice());
                let mut names = Vec::with_capacity(column_count);
                while names_cursor.has_remaining() {
                    let name_len = read_packed_int(&mut names_cursor)? as usize;
                    let mut name = vec![0u8; name_len];
                    names_cursor.read_exact(&mut name)?;
                    names.push(String::from_utf8_lossy(&name).to_string());
                }
                if names.len() == column_count {
                    column_names = Some(names);
                }
            }
            _ => {}
        }
    }

    Ok(TableMapEvent {
        table_id,
        flags,
        schema_name,
        table_name,
        column_count,
        column_types,
        column_metadata,
        null_bitmap,
        unsigned,
        column_names,
    })
}

fn decode_column_metadata(column_types: &[ColumnType], block: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(block);
    let mut metadata = Vec::with_capacity(column_types.len());

    for col_type in column_types {
        let meta = match col_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => {
                need(&cursor, 1)?;
                cursor.get_u8() as u16
            }
            ColumnType::Bit | ColumnType::Varchar | ColumnType::VarString => {
                need(&cursor, 2)?;
                cursor.get_u16_le()
            }
            // (precision << 8) | scale
            ColumnType::NewDecimal => {
                need(&cursor, 2)?;
                let precision = cursor.get_u8();
                let scale = cursor.get_u8();
                ((precision as u16) << 8) | (scale as u16)
            }
            // (real_type << 8) | length, stored big-endian
            ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                need(&cursor, 2)?;
                cursor.get_u16()
            }
            _ => 0,
        };
        metadata.push(meta);
    }

    Ok(metadata)
}

fn decode_column_value(
    cursor: &mut Cursor<&[u8]>,
    col_type: ColumnType,
    metadata: u16,
) -> Result<ColumnValue> {
    let value = match col_type {
        ColumnType::Tiny => {
            need(cursor, 1)?;
            ColumnValue::SignedInt(cursor.get_i8() as i64)
        }
        ColumnType::Short => {
            need(cursor, 2)?;
            ColumnValue::SignedInt(cursor.get_i16_le() as i64)
        }
        ColumnType::Int24 => {
            need(cursor, 3)?;
            let val = read_le_uint(cursor, 3) as u32;
            let signed = if val & 0x800000 != 0 {
                (val | 0xFF000000) as i32
            } else {
                val as i32
            };
            ColumnValue::SignedInt(signed as i64)
        }
        ColumnType::Long => {
            need(cursor, 4)?;
            ColumnValue::SignedInt(cursor.get_i32_le() as i64)
        }
        ColumnType::LongLong => {
            need(cursor, 8)?;
            ColumnValue::SignedInt(cursor.get_i64_le())
        }
        ColumnType::Float => {
            need(cursor, 4)?;
            ColumnValue::Float(cursor.get_f32_le())
        }
        ColumnType::Double => {
            need(cursor, 8)?;
            ColumnValue::Double(cursor.get_f64_le())
        }
        ColumnType::Year => {
            need(cursor, 1)?;
            let raw = cursor.get_u8() as u16;
            ColumnValue::Year(if raw == 0 { 0 } else { raw + 1900 })
        }
        ColumnType::Date | ColumnType::NewDate => {
            need(cursor, 3)?;
            let packed = read_le_uint(cursor, 3) as u32;
            ColumnValue::Date {
                year: ((packed >> 9) & 0x7FFF) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            }
        }
        ColumnType::Time => {
            need(cursor, 3)?;
            let packed = read_le_uint(cursor, 3) as u32;
            ColumnValue::Time {
                hours: (packed / 10000) as u16,
                minutes: ((packed / 100) % 100) as u8,
                seconds: (packed % 100) as u8,
                microseconds: 0,
                negative: false,
            }
        }
        ColumnType::Time2 => {
            need(cursor, 3)?;
            let packed = read_be_uint(cursor, 3) as u32;
            let frac = read_fractional_seconds(cursor, metadata as u8)?;
            let negative = (packed & 0x800000) == 0;
            let value = if negative {
                0x800000 - (packed & 0x7FFFFF)
            } else {
                packed & 0x7FFFFF
            };
            ColumnValue::Time {
                hours: ((value >> 12) & 0x3FF) as u16,
                minutes: ((value >> 6) & 0x3F) as u8,
                seconds: (value & 0x3F) as u8,
                microseconds: frac,
                negative,
            }
        }
        ColumnType::DateTime => {
            need(cursor, 8)?;
            let packed = cursor.get_u64_le();
            ColumnValue::DateTime {
                year: (packed / 10000000000) as u16,
                month: ((packed / 100000000) % 100) as u8,
                day: ((packed / 1000000) % 100) as u8,
                hour: ((packed / 10000) % 100) as u8,
                minute: ((packed / 100) % 100) as u8,
                second: (packed % 100) as u8,
                microsecond: 0,
            }
        }
        ColumnType::DateTime2 => {
            need(cursor, 5)?;
            let packed = read_be_uint(cursor, 5);
            let frac = read_fractional_seconds(cursor, metadata as u8)?;
            let year_month = (packed >> 22) & 0x1FFFF;
            ColumnValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: ((packed >> 17) & 0x1F) as u8,
                hour: ((packed >> 12) & 0x1F) as u8,
                minute: ((packed >> 6) & 0x3F) as u8,
                second: (packed & 0x3F) as u8,
                microsecond: frac,
            }
        }
        ColumnType::Timestamp => {
            need(cursor, 4)?;
            ColumnValue::Timestamp(cursor.get_u32_le())
        }
        ColumnType::Timestamp2 => {
            need(cursor, 4)?;
            let ts = cursor.get_u32();
            read_fractional_seconds(cursor, metadata as u8)?;
            ColumnValue::Timestamp(ts)
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len_bytes = if metadata < 256 { 1 } else { 2 };
            ColumnValue::String(read_lossy_string(cursor, len_bytes)?)
        }
        ColumnType::String => {
            // Metadata packs the real type in the high byte; CHAR(n) with
            // n > 255 borrows two bits of it for the length.
            let byte0 = (metadata >> 8) as u8;
            let byte1 = (metadata & 0xFF) as usize;
            let (real_type, max_len) = if byte0 & 0x30 != 0x30 {
                (byte0 | 0x30, byte1 | ((((byte0 & 0x30) ^ 0x30) as usize) << 4))
            } else {
                (byte0, byte1)
            };

            if real_type == ColumnType::Enum as u8 {
                decode_enum(cursor, max_len)?
            } else if real_type == ColumnType::Set as u8 {
                decode_set(cursor, max_len)?
            } else {
                let len_bytes = if max_len > 255 { 2 } else { 1 };
                ColumnValue::String(read_lossy_string(cursor, len_bytes)?)
            }
        }
        ColumnType::Enum => decode_enum(cursor, (metadata & 0xFF) as usize)?,
        ColumnType::Set => decode_set(cursor, (metadata & 0xFF) as usize)?,
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            ColumnValue::Bytes(read_len_prefixed_bytes(cursor, metadata.clamp(1, 4) as usize)?)
        }
        ColumnType::Json => {
            ColumnValue::Json(read_len_prefixed_bytes(cursor, metadata.clamp(1, 4) as usize)?)
        }
        ColumnType::NewDecimal | ColumnType::Decimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            ColumnValue::Decimal(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Bit => {
            let nbits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            let mut bytes = vec![0u8; nbits.div_ceil(8)];
            cursor.read_exact(&mut bytes)?;
            ColumnValue::Bit(bytes)
        }
        ColumnType::Null => ColumnValue::Null,
    };
    Ok(value)
}

fn decode_enum(cursor: &mut Cursor<&[u8]>, pack_len: usize) -> Result<ColumnValue> {
    let width = if pack_len == 1 { 1 } else { 2 };
    need(cursor, width)?;
    Ok(ColumnValue::Enum(read_le_uint(cursor, width) as u16))
}

fn decode_set(cursor: &mut Cursor<&[u8]>, pack_len: usize) -> Result<ColumnValue> {
    let width = pack_len.clamp(1, 8);
    need(cursor, width)?;
    Ok(ColumnValue::Set(read_le_uint(cursor, width)))
}

fn decode_query(data: &[u8]) -> Result<QueryEvent> {
    let mut cursor = Cursor::new(data);
    need(&cursor, 13)?;

    let thread_id = cursor.get_u32_le();
    let exec_time = cursor.get_u32_le();
    let schema_len = cursor.get_u8() as usize;
    let error_code = cursor.get_u16_le();
    let status_vars_len = cursor.get_u16_le() as usize;
    need(&cursor, status_vars_len + schema_len + 1)?;
    cursor.advance(status_vars_len);

    let mut schema_bytes = vec![0u8; schema_len];
    cursor.read_exact(&mut schema_bytes)?;
    let schema = String::from_utf8_lossy(&schema_bytes).to_string();
    cursor.get_u8(); // null terminator

    let query = String::from_utf8_lossy(cursor.chunk()).to_string();

    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        schema,
        query,
    })
}

fn decode_rotate(data: &[u8]) -> Result<RotateEvent> {
    let mut cursor = Cursor::new(data);
    need(&cursor, 8)?;
    let position = cursor.get_u64_le();
    let next_binlog = String::from_utf8_lossy(cursor.chunk())
        .trim_end_matches('\0')
        .to_string();

    Ok(RotateEvent {
        position,
        next_binlog,
    })
}

// Helper functions

fn need(cursor: &Cursor<&[u8]>, n: usize) -> Result<()> {
    if cursor.remaining() < n {
        bail!(
            "Truncated event: need {} bytes at offset {}, have {}",
            n,
            cursor.position(),
            cursor.remaining()
        );
    }
    Ok(())
}

fn read_le_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> u64 {
    (0..bytes).fold(0u64, |acc, i| acc | ((cursor.get_u8() as u64) << (i * 8)))
}

fn read_be_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> u64 {
    (0..bytes).fold(0u64, |acc, _| (acc << 8) | cursor.get_u8() as u64)
}

fn read_table_id(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    need(cursor, 6)?;
    Ok(read_le_uint(cursor, 6))
}

fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    need(cursor, 1)?;
    let first = cursor.get_u8();
    let width = match first {
        0..=250 => return Ok(first as u64),
        252 => 2,
        253 => 3,
        254 => 8,
        _ => bail!("Invalid packed int: {}", first),
    };
    need(cursor, width)?;
    Ok(read_le_uint(cursor, width))
}

fn read_len_prefixed_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    need(cursor, 1)?;
    let len = cursor.get_u8() as usize;
    need(cursor, len + 1)?;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    cursor.get_u8(); // null terminator
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn read_len_prefixed_bytes(cursor: &mut Cursor<&[u8]>, len_bytes: usize) -> Result<Vec<u8>> {
    need(cursor, len_bytes)?;
    let len = read_le_uint(cursor, len_bytes) as usize;
    need(cursor, len)?;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_lossy_string(cursor: &mut Cursor<&[u8]>, len_bytes: usize) -> Result<String> {
    let bytes = read_len_prefixed_bytes(cursor, len_bytes)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let fsp = fsp.min(6);
    let bytes = (fsp as usize).div_ceil(2);
    need(cursor, bytes)?;
    let val = read_be_uint(cursor, bytes) as u32;
    // Odd precisions are stored with one extra decimal digit
    let digits = bytes as u32 * 2;
    Ok(val * 10u32.pow(6 - digits))
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    let bit_idx = idx % 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] & (1 << bit_idx)) != 0
}

/// MySQL packs DECIMAL as base-10^9 words with a sign-flipped first byte.
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision {
        bail!("Invalid DECIMAL({}, {})", precision, scale);
    }
    let int_digits = precision - scale;
    let int_words = int_digits / 9;
    let int_leftover = int_digits % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let leftover_bytes = |digits: usize| -> usize {
        match digits {
            0 => 0,
            1..=2 => 1,
            3..=4 => 2,
            5..=6 => 3,
            _ => 4,
        }
    };

    let int_leftover_bytes = leftover_bytes(int_leftover);
    let frac_leftover_bytes = leftover_bytes(frac_leftover);
    let total_bytes = int_leftover_bytes + int_words * 4 + frac_words * 4 + frac_leftover_bytes;
    if total_bytes == 0 {
        bail!("Empty DECIMAL value");
    }

    let mut bytes = vec![0u8; total_bytes];
    cursor.read_exact(&mut bytes)?;

    let negative = (bytes[0] & 0x80) == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut digits = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    if int_leftover_bytes > 0 {
        let val = read_be_uint(&mut digits, int_leftover_bytes);
        if val > 0 {
            int_part.push_str(&val.to_string());
        }
    }
    for _ in 0..int_words {
        let val = digits.get_u32();
        if int_part.is_empty() {
            if val > 0 {
                int_part.push_str(&val.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", val));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            result.push_str(&format!("{:09}", digits.get_u32()));
        }
        if frac_leftover_bytes > 0 {
            let val = read_be_uint(&mut digits, frac_leftover_bytes);
            result.push_str(&format!("{:0width$}", val, width = frac_leftover));
        }
    }

    Ok(result)
}
