//! Tuple encoding with an embedded MVCC version header.
//!
//! Layout of an encoded record (all integers big-endian):
//!
//! | offset | size | field   |
//! |--------|------|---------|
//! | 0      | 1    | deleted |
//! | 1      | 4    | xmin    |
//! | 5      | 4    | xmax    |
//! | 9      | 4    | cid     |
//! | 13     | ..   | values  |
//!
//! Values follow in column order: `Int` as i32, `BigInt` as i64, `Bool` as
//! one byte, `Text` as a u16 length followed by UTF-8 bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CommandId, Result, Rid, StorageError, TransactionId, NULL_XID};

pub const RECORD_HEADER_SIZE: usize = 13;
pub const DELETED_OFFSET: usize = 0;
pub const XMIN_OFFSET: usize = 1;
pub const XMAX_OFFSET: usize = 5;
pub const CID_OFFSET: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    BigInt,
    Bool,
    Text,
}

impl std::str::FromStr for ColumnType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(ColumnType::Int),
            "bigint" => Ok(ColumnType::BigInt),
            "bool" | "boolean" => Ok(ColumnType::Bool),
            "text" => Ok(ColumnType::Text),
            other => Err(StorageError::SchemaMismatch(format!(
                "unknown column type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

pub type ColumnList = Vec<Column>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    BigInt(i64),
    Bool(bool),
    Text(String),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Int(_) => ColumnType::Int,
            Value::BigInt(_) => ColumnType::BigInt,
            Value::Bool(_) => ColumnType::Bool,
            Value::Text(_) => ColumnType::Text,
        }
    }

    /// Parses a literal according to the column type it is destined for.
    pub fn parse(ty: ColumnType, raw: &str) -> Result<Self> {
        let bad = || StorageError::SchemaMismatch(format!("cannot parse {raw:?} as {ty:?}"));
        Ok(match ty {
            ColumnType::Int => Value::Int(raw.parse().map_err(|_| bad())?),
            ColumnType::BigInt => Value::BigInt(raw.parse().map_err(|_| bad())?),
            ColumnType::Bool => match raw.to_ascii_lowercase().as_str() {
                "t" | "true" | "1" => Value::Bool(true),
                "f" | "false" | "0" => Value::Bool(false),
                _ => return Err(bad()),
            },
            ColumnType::Text => Value::Text(raw.to_string()),
        })
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::Int(_) => 4,
            Value::BigInt(_) => 8,
            Value::Bool(_) => 1,
            Value::Text(s) => 2 + s.len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{}", if *v { "t" } else { "f" }),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

/// MVCC version header stored in front of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub deleted: bool,
    /// Transaction that created this version.
    pub xmin: TransactionId,
    /// Transaction that deleted this version, or `NULL_XID`.
    pub xmax: TransactionId,
    /// Command id within `xmin` that created this version.
    pub cid: CommandId,
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self {
            deleted: false,
            xmin: NULL_XID,
            xmax: NULL_XID,
            cid: 0,
        }
    }
}

impl RecordHeader {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[DELETED_OFFSET] = self.deleted as u8;
        buf[XMIN_OFFSET..XMIN_OFFSET + 4].copy_from_slice(&self.xmin.to_be_bytes());
        buf[XMAX_OFFSET..XMAX_OFFSET + 4].copy_from_slice(&self.xmax.to_be_bytes());
        buf[CID_OFFSET..CID_OFFSET + 4].copy_from_slice(&self.cid.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(StorageError::corruption("record header truncated"));
        }
        Ok(Self {
            deleted: buf[DELETED_OFFSET] != 0,
            xmin: read_u32(buf, XMIN_OFFSET),
            xmax: read_u32(buf, XMAX_OFFSET),
            cid: read_u32(buf, CID_OFFSET),
        })
    }

    /// True when a deleter has been recorded.
    pub fn is_deleted(&self) -> bool {
        self.deleted && self.xmax != NULL_XID
    }
}

impl fmt::Display for RecordHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deleted: {}, xmin: {}, xmax: {}, cid: {}",
            self.deleted, self.xmin, self.xmax, self.cid
        )
    }
}

/// A decoded tuple plus its version header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub values: Vec<Value>,
    pub rid: Option<Rid>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            header: RecordHeader::default(),
            values,
            rid: None,
        }
    }

    /// Encoded size in bytes, header included.
    pub fn size(&self) -> usize {
        RECORD_HEADER_SIZE + self.values.iter().map(Value::encoded_len).sum::<usize>()
    }

    pub fn rid(&self) -> Option<Rid> {
        self.rid
    }

    /// Checks arity and value types against a column list.
    pub fn check_schema(&self, columns: &[Column]) -> Result<()> {
        if self.values.len() != columns.len() {
            return Err(StorageError::SchemaMismatch(format!(
                "expected {} values, got {}",
                columns.len(),
                self.values.len()
            )));
        }
        for (value, column) in self.values.iter().zip(columns) {
            if value.column_type() != column.ty {
                return Err(StorageError::SchemaMismatch(format!(
                    "column {} expects {:?}, got {:?}",
                    column.name,
                    column.ty,
                    value.column_type()
                )));
            }
            if let Value::Text(s) = value {
                if s.len() > u16::MAX as usize {
                    return Err(StorageError::SchemaMismatch(format!(
                        "text value for column {} is too long",
                        column.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Writes the record into `buf`, which must be at least `self.size()` long.
    pub fn serialize_to(&self, buf: &mut [u8]) {
        self.header.encode_into(buf);
        let mut offset = RECORD_HEADER_SIZE;
        for value in &self.values {
            match value {
                Value::Int(v) => {
                    buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
                    offset += 4;
                }
                Value::BigInt(v) => {
                    buf[offset..offset + 8].copy_from_slice(&v.to_be_bytes());
                    offset += 8;
                }
                Value::Bool(v) => {
                    buf[offset] = *v as u8;
                    offset += 1;
                }
                Value::Text(s) => {
                    buf[offset..offset + 2].copy_from_slice(&(s.len() as u16).to_be_bytes());
                    offset += 2;
                    buf[offset..offset + s.len()].copy_from_slice(s.as_bytes());
                    offset += s.len();
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        self.serialize_to(&mut buf);
        buf
    }

    pub fn deserialize(buf: &[u8], columns: &[Column]) -> Result<Self> {
        let header = RecordHeader::decode(buf)?;
        let mut offset = RECORD_HEADER_SIZE;
        let mut values = Vec::with_capacity(columns.len());
        let truncated = || StorageError::corruption("record body truncated");
        for column in columns {
            let value = match column.ty {
                ColumnType::Int => {
                    let bytes = buf.get(offset..offset + 4).ok_or_else(truncated)?;
                    offset += 4;
                    Value::Int(i32::from_be_bytes(bytes.try_into().map_err(|_| truncated())?))
                }
                ColumnType::BigInt => {
                    let bytes = buf.get(offset..offset + 8).ok_or_else(truncated)?;
                    offset += 8;
                    Value::BigInt(i64::from_be_bytes(bytes.try_into().map_err(|_| truncated())?))
                }
                ColumnType::Bool => {
                    let byte = *buf.get(offset).ok_or_else(truncated)?;
                    offset += 1;
                    Value::Bool(byte != 0)
                }
                ColumnType::Text => {
                    let len_bytes = buf.get(offset..offset + 2).ok_or_else(truncated)?;
                    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                    offset += 2;
                    let bytes = buf.get(offset..offset + len).ok_or_else(truncated)?;
                    offset += len;
                    let text = std::str::from_utf8(bytes)
                        .map_err(|_| StorageError::corruption("record text is not utf-8"))?;
                    Value::Text(text.to_string())
                }
            };
            values.push(value);
        }
        Ok(Self {
            header,
            values,
            rid: None,
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
