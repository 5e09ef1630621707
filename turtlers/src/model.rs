//! Struct and field model shared by the compiler, the dialects and the backends.
//!
//! A [`StructDef`] describes one relation or nested record. Nested records are
//! owned by exactly one parent, so the model is always a tree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Semantic scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicType {
    String,
    Number,
    Boolean,
    Date,
    Timestamp,
    /// Semi-structured value without a finer semantic type.
    Json,
}

impl AtomicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtomicType::String => "string",
            AtomicType::Number => "number",
            AtomicType::Boolean => "boolean",
            AtomicType::Date => "date",
            AtomicType::Timestamp => "timestamp",
            AtomicType::Json => "json",
        }
    }

    pub fn time_type(&self) -> Option<TimeFieldType> {
        match self {
            AtomicType::Date => Some(TimeFieldType::Date),
            AtomicType::Timestamp => Some(TimeFieldType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    pub struct_source: StructSource,
    pub struct_relationship: StructRelationship,
    /// Column that uniquely identifies a row; used as the distinct key for
    /// fan-out safe aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

/// A field is either a scalar column or a nested record/array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDef {
    Struct(StructDef),
    Atomic(AtomicField),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: AtomicType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructSource {
    Table { table_path: String },
    SqlSubquery { select: String },
    Nested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructRelationship {
    Basetable { connection_name: String },
    Nested { field: String, is_array: bool },
    Inline,
}

/// Name of the single field carried by an array of scalars.
pub const ARRAY_VALUE_FIELD: &str = "value";

impl FieldDef {
    pub fn atomic(name: impl Into<String>, field_type: AtomicType) -> Self {
        FieldDef::Atomic(AtomicField {
            name: name.into(),
            field_type,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            FieldDef::Struct(s) => &s.name,
            FieldDef::Atomic(a) => &a.name,
        }
    }

    pub fn atomic_type(&self) -> Option<AtomicType> {
        match self {
            FieldDef::Atomic(a) => Some(a.field_type),
            FieldDef::Struct(_) => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructDef> {
        match self {
            FieldDef::Struct(s) => Some(s),
            FieldDef::Atomic(_) => None,
        }
    }
}

impl StructDef {
    pub fn table(
        name: impl Into<String>,
        table_path: impl Into<String>,
        connection_name: impl Into<String>,
        fields: Vec<FieldDef>,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            struct_source: StructSource::Table {
                table_path: table_path.into(),
            },
            struct_relationship: StructRelationship::Basetable {
                connection_name: connection_name.into(),
            },
            primary_key: None,
        }
    }

    /// Nested array or record owned by a parent struct.
    pub fn nested(name: impl Into<String>, is_array: bool, fields: Vec<FieldDef>) -> Self {
        let name = name.into();
        Self {
            fields,
            struct_source: StructSource::Nested,
            struct_relationship: StructRelationship::Nested {
                field: name.clone(),
                is_array,
            },
            name,
            primary_key: None,
        }
    }

    /// Array of scalars: a nested array with the single `value` field.
    pub fn scalar_array(name: impl Into<String>, element: AtomicType) -> Self {
        Self::nested(name, true, vec![FieldDef::atomic(ARRAY_VALUE_FIELD, element)])
    }

    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = Some(key.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.struct_relationship,
            StructRelationship::Nested { is_array: true, .. }
        )
    }

    /// True for arrays whose elements are scalars rather than records.
    pub fn is_scalar_array(&self) -> bool {
        self.is_array()
            && matches!(self.fields.as_slice(), [FieldDef::Atomic(a)] if a.name == ARRAY_VALUE_FIELD)
    }

    pub fn connection_name(&self) -> Option<&str> {
        match &self.struct_relationship {
            StructRelationship::Basetable { connection_name } => Some(connection_name),
            _ => None,
        }
    }
}

/// Sampling applied to a table reference before joins.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Sampling {
    #[default]
    Disabled,
    /// Use the dialect's configured default row count.
    Enabled,
    Rows {
        rows: u64,
    },
    Percent {
        percent: f64,
    },
}

impl fmt::Display for Sampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sampling::Disabled => f.write_str("disabled"),
            Sampling::Enabled => f.write_str("enabled"),
            Sampling::Rows { rows } => write!(f, "rows({rows})"),
            Sampling::Percent { percent } => write!(f, "percent({percent})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFieldType {
    Date,
    Timestamp,
}

/// A rendered time expression and its semantic type.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeValue {
    pub expr: String,
    pub time_type: TimeFieldType,
}

impl TimeValue {
    pub fn new(expr: impl Into<String>, time_type: TimeFieldType) -> Self {
        Self {
            expr: expr.into(),
            time_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimestampUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampUnit::Second => "second",
            TimestampUnit::Minute => "minute",
            TimestampUnit::Hour => "hour",
            TimestampUnit::Day => "day",
            TimestampUnit::Week => "week",
            TimestampUnit::Month => "month",
            TimestampUnit::Quarter => "quarter",
            TimestampUnit::Year => "year",
        }
    }

    /// Seconds per unit for the units shorter than a day.
    pub fn seconds(&self) -> Option<u64> {
        match self {
            TimestampUnit::Second => Some(1),
            TimestampUnit::Minute => Some(60),
            TimestampUnit::Hour => Some(3600),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractUnit {
    Second,
    Minute,
    Hour,
    Day,
    DayOfWeek,
    DayOfYear,
    Week,
    Month,
    Quarter,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlterOp {
    Add,
    Subtract,
}

/// Input to [`crate::dialect::Dialect::cast`].
///
/// `src` is `None` when the value is semi-structured and must always be cast.
#[derive(Debug, Clone, PartialEq)]
pub struct TypecastFragment {
    pub expr: String,
    pub src: Option<AtomicType>,
    pub dst: AtomicType,
    pub safe: bool,
}

impl TypecastFragment {
    pub fn new(expr: impl Into<String>, src: Option<AtomicType>, dst: AtomicType) -> Self {
        Self {
            expr: expr.into(),
            src,
            dst,
            safe: false,
        }
    }

    pub fn safe(mut self) -> Self {
        self.safe = true;
        self
    }
}

/// Semantic type of one rendered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Atomic(AtomicType),
    /// Array of records built by a nested aggregation.
    Array,
    /// Single record built by a nested aggregation without dimensions.
    Record,
}

/// One rendering unit of a [`DialectFieldList`].
#[derive(Debug, Clone, PartialEq)]
pub struct DialectField {
    /// Raw semantic name.
    pub name: String,
    pub sql_expression: String,
    /// Quoted name used as the column alias or record key.
    pub sql_output_name: String,
    pub field_type: FieldType,
}

/// Ordered; the order is output column order and record key order.
pub type DialectFieldList = Vec<DialectField>;

/// Aggregation level discriminator. Level 0 is the top-level query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupSet(pub u32);

impl fmt::Display for GroupSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// A rendered sort expression.
#[derive(Debug, Clone, PartialEq)]
pub struct SortTerm {
    pub expr: String,
    pub direction: SortDirection,
}
