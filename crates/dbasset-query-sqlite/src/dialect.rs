use dbasset_query::OperatorId;
use dbasset_query_sql::{MatchSyntax, SqlDialect};

/// SQLite syntax, with regex matching through the functions registered by
/// [`crate::register_regex_functions`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn operators(&self) -> &'static [OperatorId] {
        &OperatorId::ALL
    }

    fn match_syntax(&self, case_insensitive: bool) -> Option<MatchSyntax> {
        Some(MatchSyntax::Function {
            name: if case_insensitive {
                "regex_search"
            } else {
                "regex_match"
            },
            flags: None,
        })
    }

    fn null_safe_equal(&self) -> &'static str {
        "IS"
    }

    fn limit_clause(&self, limit: Option<u64>, offset: u64) -> String {
        match (limit, offset) {
            (None, 0) => String::new(),
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (Some(limit), offset) => format!(" LIMIT {limit} OFFSET {offset}"),
            (None, offset) => format!(" LIMIT -1 OFFSET {offset}"),
        }
    }
}

/// Core, date, aggregate and JSON1 functions that read but never write
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs", "char", "coalesce", "glob", "hex", "ifnull", "instr", "length", "like",
    "likelihood", "likely", "lower", "ltrim", "max", "min", "nullif", "printf", "quote",
    "replace", "round", "rtrim", "soundex", "substr", "trim", "typeof", "unicode", "unlikely",
    "upper",
    // date and time
    "date", "datetime", "julianday", "strftime", "time",
    // aggregate
    "avg", "count", "group_concat", "sum", "total",
    // json
    "json", "json_array", "json_array_length", "json_extract", "json_group_array",
    "json_group_object", "json_object", "json_quote", "json_type", "json_valid",
];
