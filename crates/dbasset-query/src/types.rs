use crate::ast::{OperatorId, OutputColumn, SortKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Datatype category of a field, independent of the backend's native type
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    String,
    Number,
    Boolean,
    Date,
    Duration,
    Enum,
    Array,
    /// Native type the connector could not classify
    Unknown,
}

impl Datatype {
    /// Operators the default policy allows on fields of this category
    pub fn default_operators(self) -> &'static [OperatorId] {
        use OperatorId::*;
        match self {
            Datatype::String | Datatype::Unknown => &[
                Eq, Ne, Gt, Gte, Lt, Lte, In, NotIn, Regex, NotRegex, Search, NotSearch, Is,
                NotIs,
            ],
            Datatype::Number | Datatype::Date | Datatype::Duration => {
                &[Eq, Ne, Gt, Gte, Lt, Lte, In, NotIn, Is, NotIs]
            }
            Datatype::Boolean | Datatype::Enum => &[Eq, Ne, In, NotIn, Is, NotIs],
            Datatype::Array => &[Eq, Ne, Is, NotIs],
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datatype::String => write!(f, "string"),
            Datatype::Number => write!(f, "number"),
            Datatype::Boolean => write!(f, "boolean"),
            Datatype::Date => write!(f, "date"),
            Datatype::Duration => write!(f, "duration"),
            Datatype::Enum => write!(f, "enum"),
            Datatype::Array => write!(f, "array"),
            Datatype::Unknown => write!(f, "unknown"),
        }
    }
}

/// A queryable field of a data source, as reported by connector introspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Datatype category used for operator validation
    pub datatype: Datatype,
    /// Backend type name, when the backend reports one
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,
    /// Optional description (column comment)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            native_type: None,
            description: None,
        }
    }

    pub fn with_native_type(mut self, native_type: impl Into<String>) -> Self {
        self.native_type = Some(native_type.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Which datatype/operator table a connector enforces during canonicalization
#[derive(Debug, Clone, Copy)]
pub enum OperatorPolicy {
    /// Reject operators outside the table's set for the field datatype
    Datatype(fn(Datatype) -> &'static [OperatorId]),
    /// Accept any operator on any field
    Unrestricted,
}

impl OperatorPolicy {
    pub fn allows(&self, datatype: Datatype, operator: OperatorId) -> bool {
        match self {
            OperatorPolicy::Datatype(table) => table(datatype).contains(&operator),
            OperatorPolicy::Unrestricted => true,
        }
    }
}

impl Default for OperatorPolicy {
    fn default() -> Self {
        OperatorPolicy::Datatype(Datatype::default_operators)
    }
}

/// Features a connector declares to the canonicalizer
#[derive(Debug, Clone, Copy)]
pub struct ConnectorCapabilities {
    /// Supports a `group` clause
    pub grouping: bool,
    /// Functions allowed in the selected fields
    pub field_functions: bool,
    /// Functions allowed in sort keys
    pub sort_functions: bool,
    /// Functions allowed on either side of a filter
    pub filter_functions: bool,
    /// Operators the connector can compile, regardless of datatype
    pub operators: &'static [OperatorId],
    pub operator_policy: OperatorPolicy,
}

impl ConnectorCapabilities {
    /// Capabilities of a SQL backend: grouping and functions everywhere
    pub fn relational(operators: &'static [OperatorId]) -> Self {
        Self {
            grouping: true,
            field_functions: true,
            sort_functions: true,
            filter_functions: true,
            operators,
            operator_policy: OperatorPolicy::default(),
        }
    }
}

/// Names of functions a connector is willing to compile
#[derive(Debug, Clone, Default)]
pub struct FunctionAllowList {
    names: HashSet<String>,
}

/// Functions allowed on every relational connector even when the catalog
/// flags them otherwise
pub const KNOWN_SAFE_FUNCTIONS: [&str; 3] = ["cast", "count", "distinct"];

impl FunctionAllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|name| name.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// An allow-list holding only [`KNOWN_SAFE_FUNCTIONS`]
    pub fn known_safe() -> Self {
        Self::new(KNOWN_SAFE_FUNCTIONS)
    }

    pub fn with_known_safe(mut self) -> Self {
        self.names
            .extend(KNOWN_SAFE_FUNCTIONS.iter().map(|name| name.to_string()));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Internal layout of result rows
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowFormat {
    /// Each row is a list in `fields` order
    List,
    /// Each row is a map keyed by column name
    Dict,
}

/// Result rows in either internal layout
#[derive(Debug, Clone, PartialEq)]
pub enum Rows {
    List(Vec<Vec<Value>>),
    Dict(Vec<Map<String, Value>>),
}

impl Rows {
    pub fn len(&self) -> usize {
        match self {
            Rows::List(rows) => rows.len(),
            Rows::Dict(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> RowFormat {
        match self {
            Rows::List(_) => RowFormat::List,
            Rows::Dict(_) => RowFormat::Dict,
        }
    }
}

/// Result of a select, before output encoding
#[derive(Debug, Clone, PartialEq)]
pub struct SelectResult {
    pub limit: Option<u64>,
    pub offset: u64,
    pub sort: Vec<SortKey>,
    /// Selected columns, in output order
    pub fields: Vec<OutputColumn>,
    /// Column name (field name or reference) to position in `fields`
    pub columns: BTreeMap<String, usize>,
    pub data: Rows,
    pub datacount: usize,
}

impl SelectResult {
    pub fn new(
        limit: Option<u64>,
        offset: u64,
        sort: Vec<SortKey>,
        fields: Vec<OutputColumn>,
        data: Rows,
    ) -> Self {
        let columns = fields
            .iter()
            .enumerate()
            .map(|(index, column)| (column.column_name(index), index))
            .collect();
        let datacount = data.len();
        Self {
            limit,
            offset,
            sort,
            fields,
            columns,
            data,
            datacount,
        }
    }

    /// Column names ordered by column index, one per output column
    pub fn column_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .enumerate()
            .map(|(index, column)| column.column_name(index))
            .collect()
    }

    /// Row at `index` as a list; `names` comes from [`Self::column_names`]
    pub fn list_row(&self, index: usize, names: &[String]) -> Option<Vec<Value>> {
        match &self.data {
            Rows::List(rows) => rows.get(index).cloned(),
            Rows::Dict(rows) => rows.get(index).map(|row| {
                names
                    .iter()
                    .map(|name| row.get(name).cloned().unwrap_or(Value::Null))
                    .collect()
            }),
        }
    }

    /// Row at `index` as a map; `names` comes from [`Self::column_names`]
    pub fn dict_row(&self, index: usize, names: &[String]) -> Option<Map<String, Value>> {
        match &self.data {
            Rows::Dict(rows) => rows.get(index).cloned(),
            Rows::List(rows) => rows.get(index).map(|row| {
                names
                    .iter()
                    .zip(row.iter())
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            }),
        }
    }

    /// Rows as lists, converting from the map layout by column name
    pub fn rows_as_lists(&self) -> Vec<Vec<Value>> {
        let names = self.column_names();
        (0..self.data.len())
            .filter_map(|index| self.list_row(index, &names))
            .collect()
    }

    /// Rows as maps, converting from the list layout by column position
    pub fn rows_as_dicts(&self) -> Vec<Map<String, Value>> {
        let names = self.column_names();
        (0..self.data.len())
            .filter_map(|index| self.dict_row(index, &names))
            .collect()
    }

    /// Switch the internal layout in place
    pub fn convert(&mut self, format: RowFormat) {
        if self.data.format() == format {
            return;
        }
        self.data = match format {
            RowFormat::List => Rows::List(self.rows_as_lists()),
            RowFormat::Dict => Rows::Dict(self.rows_as_dicts()),
        };
    }
}

/// A table (or view, or collection) exposed by a data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableEntry {
    /// Display name, `schema.table` outside the default schema
    pub name: String,
    /// Name of the table inside its schema
    pub native_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// Tables of one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableListing {
    pub source: String,
    pub tables: Vec<TableEntry>,
}
