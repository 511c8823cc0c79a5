use dbasset_query::OperatorId;
use dbasset_query_sql::{is_type_name, MatchSyntax, SqlDialect, SqlParam};

/// PostgreSQL syntax
///
/// Every value is bound as text and cast in the statement, to the compared
/// column's type when it is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgresql"
    }

    fn operators(&self) -> &'static [OperatorId] {
        &OperatorId::ALL
    }

    fn placeholder(&self, index: usize, native_type: Option<&str>, value: &SqlParam) -> String {
        let target = match native_type.filter(|native| is_type_name(native)) {
            Some(native) => native,
            None => match value {
                SqlParam::Int(_) => "bigint",
                SqlParam::Float(_) => "double precision",
                SqlParam::Bool(_) => "boolean",
                SqlParam::Null | SqlParam::Text(_) => return format!("${index}::text"),
            },
        };
        format!("${index}::text::{target}")
    }

    fn match_syntax(&self, case_insensitive: bool) -> Option<MatchSyntax> {
        Some(MatchSyntax::Infix(if case_insensitive { "~*" } else { "~" }))
    }
}
