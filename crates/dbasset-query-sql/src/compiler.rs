//! Compiles the canonical AST into parameterized SQL.
//!
//! Identifiers are always quoted by the dialect and literal values always
//! bound, so caller input never reaches the statement text.

use crate::dialect::{MatchSyntax, SqlDialect, SqlParam};
use dbasset_query::{
    DataError, Expr, FieldDescriptor, Filter, FilterLeaf, FilterValue, OperatorId, Result,
    SelectQuery, SortDirection,
};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// A table, optionally qualified by schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.filter(|s| !s.is_empty()),
            table: table.into(),
        }
    }
}

/// SQL text plus the values bound to its placeholders, in order
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

fn cast_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*( [A-Za-z_][A-Za-z0-9_]*)*(\(\s*\d+\s*(,\s*\d+\s*)?\))?(\[\])?$")
            .unwrap_or_else(|e| panic!("invalid cast type pattern: {e}"))
    })
}

/// Whether `name` is safe to splice into SQL as a type name
pub fn is_type_name(name: &str) -> bool {
    cast_type_pattern().is_match(name)
}

/// Builds one statement; not reusable across statements
pub struct SqlCompiler<'a> {
    dialect: &'a dyn SqlDialect,
    fields: &'a [FieldDescriptor],
    params: Vec<SqlParam>,
}

impl<'a> SqlCompiler<'a> {
    pub fn new(dialect: &'a dyn SqlDialect, fields: &'a [FieldDescriptor]) -> Self {
        Self {
            dialect,
            fields,
            params: Vec::new(),
        }
    }

    pub fn compile_select(mut self, table: &TableRef, query: &SelectQuery) -> Result<CompiledQuery> {
        let mut columns = Vec::with_capacity(query.fields.len());
        for column in &query.fields {
            let mut sql = self.expr(&column.expr, None)?;
            if let Some(reference) = &column.reference {
                sql.push_str(" AS ");
                sql.push_str(&self.dialect.quote_identifier(reference));
            }
            columns.push(sql);
        }
        if columns.is_empty() {
            columns.push("*".to_string());
        }

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), self.table(table));

        if !query.filters.is_empty() {
            let clauses = query
                .filters
                .iter()
                .map(|filter| self.filter(filter))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        if let Some(group) = &query.group {
            let exprs = group
                .iter()
                .map(|column| self.expr(&column.expr, None))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&exprs.join(", "));
        }

        if !query.sort.is_empty() {
            let keys = query
                .sort
                .iter()
                .map(|key| {
                    let direction = match key.direction {
                        SortDirection::Ascending => "ASC",
                        SortDirection::Descending => "DESC",
                    };
                    Ok(format!("{} {}", self.expr(&key.expr, None)?, direction))
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }

        sql.push_str(&self.dialect.limit_clause(query.limit, query.offset));
        Ok(CompiledQuery {
            sql,
            params: self.params,
        })
    }

    fn table(&self, table: &TableRef) -> String {
        match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.dialect.quote_identifier(schema),
                self.dialect.quote_identifier(&table.table)
            ),
            None => self.dialect.quote_identifier(&table.table),
        }
    }

    fn native_type(&self, expr: &Expr) -> Option<&'a str> {
        let name = expr.as_field()?;
        self.fields
            .iter()
            .find(|field| field.name == name)
            .and_then(|field| field.native_type.as_deref())
    }

    fn bind(&mut self, value: &Value, native_type: Option<&str>) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        let param = SqlParam::from_json(value);
        let placeholder = self
            .dialect
            .placeholder(self.params.len() + 1, native_type, &param);
        self.params.push(param);
        placeholder
    }

    fn expr(&mut self, expr: &Expr, native_type: Option<&str>) -> Result<String> {
        match expr {
            Expr::Field(name) => Ok(self.dialect.quote_identifier(name)),
            Expr::Value(value) => Ok(self.bind(value, native_type)),
            Expr::Function { name, params } => self.function(name, params),
        }
    }

    fn function(&mut self, name: &str, params: &[Expr]) -> Result<String> {
        match name {
            "cast" => {
                let [value, Expr::Value(Value::String(target))] = params else {
                    return Err(DataError::invalid_query(
                        "cast takes a value and a type name",
                    ));
                };
                if !is_type_name(target) {
                    return Err(DataError::invalid_query(format!(
                        "Invalid cast type: {target}"
                    )));
                }
                Ok(format!("CAST({} AS {})", self.expr(value, None)?, target))
            }
            "distinct" => {
                let [value] = params else {
                    return Err(DataError::invalid_query("distinct takes one value"));
                };
                Ok(format!("DISTINCT {}", self.expr(value, None)?))
            }
            "count" if params.is_empty() => Ok("count(*)".to_string()),
            _ => {
                let args = params
                    .iter()
                    .map(|param| self.expr(param, None))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("{}({})", name, args.join(", ")))
            }
        }
    }

    fn filter(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::Leaf(leaf) => self.leaf(leaf),
            Filter::Group {
                combinator,
                children,
            } => {
                let joiner = match combinator {
                    dbasset_query::Combinator::And => " AND ",
                    dbasset_query::Combinator::Or => " OR ",
                };
                let clauses = children
                    .iter()
                    .map(|child| self.filter(child))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", clauses.join(joiner)))
            }
        }
    }

    fn leaf(&mut self, leaf: &FilterLeaf) -> Result<String> {
        let native_type = self.native_type(&leaf.field);
        let left = self.expr(&leaf.field, None)?;
        let op = leaf.operator;

        if op.is_list() {
            let items = match &leaf.value {
                FilterValue::Many(items) => items.as_slice(),
                FilterValue::One(item) => std::slice::from_ref(item),
            };
            if items.is_empty() {
                return Ok(if op == OperatorId::In { "1 = 0" } else { "1 = 1" }.to_string());
            }
            let values = items
                .iter()
                .map(|item| self.expr(item, native_type))
                .collect::<Result<Vec<_>>>()?;
            let keyword = if op == OperatorId::In { "IN" } else { "NOT IN" };
            return Ok(format!("({} {} ({}))", left, keyword, values.join(", ")));
        }

        let right = match &leaf.value {
            FilterValue::One(expr) => expr,
            FilterValue::Many(_) => {
                return Err(DataError::invalid_query(format!(
                    "The {op} operator takes a single value"
                )))
            }
        };
        let right_is_null = matches!(right, Expr::Value(Value::Null));

        let clause = match op {
            OperatorId::Eq | OperatorId::Is if right_is_null => format!("({left} IS NULL)"),
            OperatorId::Ne | OperatorId::NotIs if right_is_null => {
                format!("({left} IS NOT NULL)")
            }
            OperatorId::Is | OperatorId::NotIs => {
                let right = self.expr(right, native_type)?;
                let test = format!("{} {} {}", left, self.dialect.null_safe_equal(), right);
                if op == OperatorId::Is {
                    format!("({test})")
                } else {
                    format!("(NOT ({test}))")
                }
            }
            OperatorId::Regex | OperatorId::NotRegex | OperatorId::Search | OperatorId::NotSearch => {
                let case_insensitive = matches!(op, OperatorId::Search | OperatorId::NotSearch);
                let syntax = self.dialect.match_syntax(case_insensitive).ok_or_else(|| {
                    DataError::operation_not_supported(format!(
                        "The {op} operator is not supported by {}",
                        self.dialect.name()
                    ))
                })?;
                let pattern = self.expr(right, None)?;
                let test = match syntax {
                    MatchSyntax::Infix(symbol) => format!("{left} {symbol} {pattern}"),
                    MatchSyntax::Function { name, flags: None } => {
                        format!("{name}({left}, {pattern})")
                    }
                    MatchSyntax::Function {
                        name,
                        flags: Some(flags),
                    } => format!("{name}({left}, {pattern}, '{flags}')"),
                };
                if matches!(op, OperatorId::NotRegex | OperatorId::NotSearch) {
                    format!("(NOT ({test}))")
                } else {
                    format!("({test})")
                }
            }
            _ => {
                let symbol = match op {
                    OperatorId::Eq => "=",
                    OperatorId::Ne => "<>",
                    OperatorId::Gt => ">",
                    OperatorId::Gte => ">=",
                    OperatorId::Lt => "<",
                    _ => "<=",
                };
                let right = self.expr(right, native_type)?;
                format!("({left} {symbol} {right})")
            }
        };
        Ok(clause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::ANSI_OPERATORS;
    use dbasset_query::{
        ConnectorCapabilities, Datatype, FieldScope, FunctionAllowList, OutputColumn,
        QueryParams,
    };

    struct TestDialect;

    impl SqlDialect for TestDialect {
        fn name(&self) -> &str {
            "test"
        }

        fn operators(&self) -> &'static [OperatorId] {
            &OperatorId::ALL
        }

        fn placeholder(&self, index: usize, native_type: Option<&str>, _value: &SqlParam) -> String {
            match native_type {
                Some(native) => format!("${index}::{native}"),
                None => format!("${index}"),
            }
        }

        fn match_syntax(&self, case_insensitive: bool) -> Option<MatchSyntax> {
            Some(MatchSyntax::Infix(if case_insensitive { "~*" } else { "~" }))
        }
    }

    struct PlainDialect;

    impl SqlDialect for PlainDialect {
        fn name(&self) -> &str {
            "plain"
        }

        fn operators(&self) -> &'static [OperatorId] {
            &ANSI_OPERATORS
        }
    }

    fn fields() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::new("town", Datatype::String).with_native_type("text"),
            FieldDescriptor::new("pop2010", Datatype::Number).with_native_type("int4"),
        ]
    }

    fn compile(dialect: &dyn SqlDialect, params: QueryParams) -> Result<CompiledQuery> {
        let fields = fields();
        let functions = FunctionAllowList::new(["lower", "max"]).with_known_safe();
        let scope = FieldScope::new(
            &fields,
            &functions,
            ConnectorCapabilities::relational(dialect.operators()),
        );
        let query = SelectQuery::from_params(&params, &scope, 50)?;
        SqlCompiler::new(dialect, &fields).compile_select(
            &TableRef::new(Some("public".into()), "towns"),
            &query,
        )
    }

    #[test]
    fn test_simple_select() {
        let compiled = compile(
            &TestDialect,
            QueryParams::new()
                .with("filters", r#"[["town", "BOSTON"]]"#)
                .with("sort", "town")
                .with("limit", 5),
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT "town", "pop2010" FROM "public"."towns" WHERE ("town" = $1::text) ORDER BY "town" ASC LIMIT 5"#
        );
        assert_eq!(compiled.params, vec![SqlParam::Text("BOSTON".into())]);
    }

    #[test]
    fn test_operators_and_groups() {
        let compiled = compile(
            &TestDialect,
            QueryParams::new()
                .with(
                    "filters",
                    r#"[{"or": [["town", "search", "bos"], ["pop2010", "in", [1, 2]]]}, ["town", "is", null], ["pop2010", "not_is", 3]]"#,
                )
                .with("limit", "none"),
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT "town", "pop2010" FROM "public"."towns" WHERE "#,
                r#"(("town" ~* $1) OR ("pop2010" IN ($2::int4, $3::int4))) AND ("town" IS NULL) "#,
                r#"AND (NOT ("pop2010" IS NOT DISTINCT FROM $4::int4))"#
            )
        );
        assert_eq!(compiled.params.len(), 4);
    }

    #[test]
    fn test_functions_group_and_references() {
        let compiled = compile(
            &TestDialect,
            QueryParams::new()
                .with(
                    "fields",
                    r#"["town", {"func": "max", "param": [{"field": "pop2010"}], "reference": "biggest"}, {"func": "count", "reference": "n"}]"#,
                )
                .with("group", "town")
                .with(
                    "sort",
                    r#"[[{"func": "lower", "param": {"field": "town"}}, -1]]"#,
                )
                .with("offset", 10)
                .with("limit", 5),
        )
        .unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT "town", max("pop2010") AS "biggest", count(*) AS "n" FROM "public"."towns" "#,
                r#"GROUP BY "town" ORDER BY lower("town") DESC LIMIT 5 OFFSET 10"#
            )
        );
    }

    #[test]
    fn test_cast_and_distinct() {
        let compiled = compile(
            &PlainDialect,
            QueryParams::new().with(
                "fields",
                r#"[{"func": "distinct", "param": {"field": "town"}}, {"func": "cast", "param": [{"field": "pop2010"}, "varchar(20)"]}]"#,
            ),
        )
        .unwrap();
        assert!(compiled
            .sql
            .starts_with(r#"SELECT DISTINCT "town", CAST("pop2010" AS varchar(20)) FROM"#));

        let err = compile(
            &PlainDialect,
            QueryParams::new().with(
                "fields",
                r#"[{"func": "cast", "param": [{"field": "pop2010"}, "int); DROP TABLE towns; --"]}]"#,
            ),
        )
        .unwrap_err();
        assert!(matches!(err, DataError::InvalidQuery(_)));
    }

    #[test]
    fn test_identifiers_are_quoted() {
        let dialect = PlainDialect;
        let compiler = SqlCompiler::new(&dialect, &[]);
        assert_eq!(
            compiler.table(&TableRef::new(None, "we\"ird")),
            r#""we""ird""#
        );
    }

    #[test]
    fn test_empty_in_list_and_null_equality() {
        let compiled = compile(
            &PlainDialect,
            QueryParams::new()
                .with("filters", r#"[["town", "in", []], ["town", "!=", null]]"#)
                .with("offset", 3)
                .with("limit", "none"),
        )
        .unwrap();
        assert!(compiled
            .sql
            .ends_with(r#"WHERE 1 = 0 AND ("town" IS NOT NULL) OFFSET 3"#));
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_regex_unsupported_by_plain_dialect() {
        let err = compile(
            &PlainDialect,
            QueryParams::new().with("filters", r#"[["town", "regex", "^B"]]"#),
        )
        .unwrap_err();
        assert!(matches!(err, DataError::OperatorNotAllowed { .. }));
    }

    #[test]
    fn test_all_columns_default() {
        let fields = fields();
        let dialect = PlainDialect;
        let query = SelectQuery {
            fields: vec![OutputColumn::field("town")],
            ..SelectQuery::from_params(
                &QueryParams::new(),
                &FieldScope::new(
                    &fields,
                    &FunctionAllowList::default(),
                    ConnectorCapabilities::relational(&ANSI_OPERATORS),
                ),
                50,
            )
            .unwrap()
        };
        let compiled = SqlCompiler::new(&dialect, &fields)
            .compile_select(&TableRef::new(None, "towns"), &query)
            .unwrap();
        assert_eq!(compiled.sql, r#"SELECT "town" FROM "towns" LIMIT 50"#);
    }
}
