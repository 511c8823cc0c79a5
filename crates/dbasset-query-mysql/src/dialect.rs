use dbasset_query::OperatorId;
use dbasset_query_sql::{MatchSyntax, SqlDialect};

/// MySQL and MariaDB syntax
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

/// Largest row count MySQL accepts, standing in for "no limit"
const NO_LIMIT: u64 = u64::MAX;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn operators(&self) -> &'static [OperatorId] {
        &OperatorId::ALL
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn match_syntax(&self, case_insensitive: bool) -> Option<MatchSyntax> {
        Some(MatchSyntax::Function {
            name: "REGEXP_LIKE",
            flags: Some(if case_insensitive { "i" } else { "c" }),
        })
    }

    fn null_safe_equal(&self) -> &'static str {
        "<=>"
    }

    fn limit_clause(&self, limit: Option<u64>, offset: u64) -> String {
        match (limit, offset) {
            (None, 0) => String::new(),
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (limit, offset) => format!(" LIMIT {} OFFSET {}", limit.unwrap_or(NO_LIMIT), offset),
        }
    }
}

/// Deterministic built-ins that never touch data
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    // numeric
    "abs", "acos", "asin", "atan", "atan2", "ceil", "ceiling", "cos", "cot", "degrees", "exp",
    "floor", "ln", "log", "log10", "log2", "mod", "pi", "pow", "power", "radians", "round",
    "sign", "sin", "sqrt", "tan", "truncate",
    // string
    "ascii", "bit_length", "char_length", "character_length", "concat", "concat_ws", "field",
    "find_in_set", "format", "hex", "insert", "instr", "lcase", "left", "length", "locate",
    "lower", "lpad", "ltrim", "mid", "position", "repeat", "replace", "reverse", "right", "rpad",
    "rtrim", "soundex", "space", "strcmp", "substr", "substring", "substring_index", "trim",
    "ucase", "unhex", "upper",
    // date and time
    "adddate", "addtime", "convert_tz", "date", "date_add", "date_format", "date_sub",
    "datediff", "day", "dayname", "dayofmonth", "dayofweek", "dayofyear", "extract",
    "from_days", "from_unixtime", "hour", "last_day", "makedate", "maketime", "microsecond",
    "minute", "month", "monthname", "period_add", "period_diff", "quarter", "second",
    "sec_to_time", "str_to_date", "subdate", "subtime", "time", "time_format", "time_to_sec",
    "timediff", "timestamp", "timestampadd", "timestampdiff", "to_days", "to_seconds", "week",
    "weekday", "weekofyear", "year", "yearweek",
    // aggregate
    "avg", "bit_and", "bit_or", "bit_xor", "group_concat", "json_arrayagg", "json_objectagg",
    "max", "min", "std", "stddev", "stddev_pop", "stddev_samp", "sum", "var_pop", "var_samp",
    "variance",
    // control flow
    "coalesce", "greatest", "least", "if", "ifnull", "isnull", "nullif",
    // json
    "json_array", "json_contains", "json_extract", "json_keys", "json_length", "json_object",
    "json_quote", "json_type", "json_unquote", "json_valid",
    // spatial
    "st_asgeojson", "st_astext", "st_contains", "st_distance", "st_geomfromtext", "st_within",
    "st_x", "st_y",
];

#[cfg(test)]
mod tests {
    use super::*;
    use dbasset_query::{
        ConnectorCapabilities, Datatype, FieldDescriptor, FieldScope, FunctionAllowList,
        QueryParams, SelectQuery,
    };
    use dbasset_query_sql::{SqlCompiler, TableRef};

    #[test]
    fn test_compile_mysql_statement() {
        let fields = vec![
            FieldDescriptor::new("town", Datatype::String),
            FieldDescriptor::new("pop2010", Datatype::Number),
        ];
        let functions = FunctionAllowList::new(BUILTIN_FUNCTIONS.iter().copied());
        let scope = FieldScope::new(
            &fields,
            &functions,
            ConnectorCapabilities::relational(MySqlDialect.operators()),
        );
        let query = SelectQuery::from_params(
            &QueryParams::new()
                .with(
                    "filters",
                    r#"[["town", "regex", "^B"], ["pop2010", "is", 5], ["town", "search", "ton$"]]"#,
                )
                .with("fields", r#"[{"func": "upper", "param": {"field": "town"}, "reference": "t"}]"#)
                .with("offset", 2)
                .with("limit", "none"),
            &scope,
            50,
        )
        .unwrap();
        let compiled = SqlCompiler::new(&MySqlDialect, &fields)
            .compile_select(&TableRef::new(None, "towns"), &query)
            .unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                "SELECT upper(`town`) AS `t` FROM `towns` WHERE (REGEXP_LIKE(`town`, ?, 'c')) ",
                "AND (`pop2010` <=> ?) AND (REGEXP_LIKE(`town`, ?, 'i')) ",
                "LIMIT 18446744073709551615 OFFSET 2"
            )
        );
        assert_eq!(compiled.params.len(), 3);
    }

    #[test]
    fn test_builtins_are_lowercase() {
        assert!(BUILTIN_FUNCTIONS
            .iter()
            .all(|name| name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')));
    }
}
