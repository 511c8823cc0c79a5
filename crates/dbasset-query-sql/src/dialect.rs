use dbasset_query::{Datatype, OperatorId};

/// Operators every SQL dialect compiles
pub const ANSI_OPERATORS: [OperatorId; 10] = [
    OperatorId::Eq,
    OperatorId::Ne,
    OperatorId::Gt,
    OperatorId::Gte,
    OperatorId::Lt,
    OperatorId::Lte,
    OperatorId::In,
    OperatorId::NotIn,
    OperatorId::Is,
    OperatorId::NotIs,
];

/// How a dialect spells a regular-expression match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSyntax {
    /// `value <op> pattern`
    Infix(&'static str),
    /// `name(value, pattern)`, with an optional trailing flags literal
    Function {
        name: &'static str,
        flags: Option<&'static str>,
    },
}

/// Syntax differences between SQL backends
pub trait SqlDialect: Send + Sync + 'static {
    /// Canonical dialect name
    fn name(&self) -> &str;

    /// Operators the dialect can compile
    fn operators(&self) -> &'static [OperatorId];

    /// Quote an identifier taken from caller input
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Placeholder for the `index`-th bound value (1-based)
    ///
    /// `native_type` is the type of the column the value is compared with,
    /// when known.
    fn placeholder(&self, _index: usize, _native_type: Option<&str>, _value: &SqlParam) -> String {
        "?".to_string()
    }

    /// Regular-expression match, case-insensitive for `search`
    fn match_syntax(&self, _case_insensitive: bool) -> Option<MatchSyntax> {
        None
    }

    /// Null-safe equality operator used by `is` with a non-null value
    fn null_safe_equal(&self) -> &'static str {
        "IS NOT DISTINCT FROM"
    }

    /// `LIMIT` / `OFFSET` clause, empty when neither applies
    fn limit_clause(&self, limit: Option<u64>, offset: u64) -> String {
        match (limit, offset) {
            (None, 0) => String::new(),
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (Some(limit), offset) => format!(" LIMIT {limit} OFFSET {offset}"),
            (None, offset) => format!(" OFFSET {offset}"),
        }
    }
}

/// A value bound to a compiled statement
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlParam {
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Int(i),
                None => SqlParam::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            other => SqlParam::Text(other.to_string()),
        }
    }

    /// Text rendering, for drivers that bind everything as text
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlParam::Null => None,
            SqlParam::Bool(b) => Some(b.to_string()),
            SqlParam::Int(i) => Some(i.to_string()),
            SqlParam::Float(f) => Some(f.to_string()),
            SqlParam::Text(s) => Some(s.clone()),
        }
    }
}

/// Datatype category of a native SQL type name
///
/// Understands PostgreSQL, MySQL and SQLite spellings; SQLite declared types
/// fall back to its affinity rules.
pub fn classify_native_type(native: &str) -> Datatype {
    let lowered = native.trim().to_lowercase();
    if lowered.ends_with("[]") || lowered.starts_with('_') || lowered == "array" {
        return Datatype::Array;
    }
    let base = lowered.split('(').next().unwrap_or_default().trim();
    match base {
        "boolean" | "bool" => Datatype::Boolean,
        "interval" => Datatype::Duration,
        "enum" | "set" => Datatype::Enum,
        "smallint" | "integer" | "int" | "bigint" | "int2" | "int4" | "int8" | "tinyint"
        | "mediumint" | "numeric" | "decimal" | "real" | "double" | "double precision"
        | "float" | "float4" | "float8" | "money" | "oid" | "bit" => Datatype::Number,
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "name"
        | "uuid" | "json" | "jsonb" | "xml" | "citext" | "tinytext" | "mediumtext"
        | "longtext" | "nvarchar" | "nchar" | "clob" => Datatype::String,
        "bytea" | "blob" | "longblob" | "mediumblob" | "tinyblob" | "binary" | "varbinary"
        | "point" | "geometry" | "geography" | "polygon" | "linestring" => Datatype::Unknown,
        base if base.starts_with("timestamp")
            || base.starts_with("time")
            || base.starts_with("date")
            || base == "year" =>
        {
            Datatype::Date
        }
        base if base.starts_with("int") || base.ends_with("int") || base.contains(" int") => {
            Datatype::Number
        }
        base if base.contains("char") || base.contains("clob") || base.contains("text") => {
            Datatype::String
        }
        base if base.contains("real") || base.contains("floa") || base.contains("doub") => {
            Datatype::Number
        }
        base if base.contains("bool") => Datatype::Boolean,
        _ => Datatype::Unknown,
    }
}
