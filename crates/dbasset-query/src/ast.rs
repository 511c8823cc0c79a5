//! Canonical query tree shared by every connector.
//!
//! Everything the canonicalizer emits is expressed with these types, so a
//! connector never sees raw request parameters.

use serde_json::{json, Map, Value};
use std::fmt;

/// A field reference, a literal value or a function application
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(String),
    Value(Value),
    Function { name: String, params: Vec<Expr> },
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Value(value.into())
    }

    pub fn function(name: impl Into<String>, params: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            params,
        }
    }

    pub fn as_field(&self) -> Option<&str> {
        match self {
            Expr::Field(name) => Some(name),
            _ => None,
        }
    }

    /// Request-shaped JSON form, as echoed back in list/dict results
    pub fn to_json(&self) -> Value {
        match self {
            Expr::Field(name) => json!({ "field": name }),
            Expr::Value(value) => json!({ "value": value }),
            Expr::Function { name, params } => json!({
                "func": name,
                "param": params.iter().map(Expr::to_json).collect::<Vec<_>>(),
            }),
        }
    }

    /// Visit every field referenced anywhere in the expression
    pub fn walk_fields<'a>(&'a self, visit: &mut dyn FnMut(&'a str)) {
        match self {
            Expr::Field(name) => visit(name),
            Expr::Value(_) => {}
            Expr::Function { params, .. } => {
                for param in params {
                    param.walk_fields(visit);
                }
            }
        }
    }
}

/// A selected column: an expression plus its optional output name
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub expr: Expr,
    pub reference: Option<String>,
}

impl OutputColumn {
    pub fn new(expr: Expr, reference: Option<String>) -> Self {
        Self { expr, reference }
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self::new(Expr::field(name), None)
    }

    /// Name of the column in results: the reference, the field name, or a
    /// positional `column_<index>`
    pub fn column_name(&self, index: usize) -> String {
        if let Some(reference) = &self.reference {
            return reference.clone();
        }
        match &self.expr {
            Expr::Field(name) => name.clone(),
            _ => format!("column_{index}"),
        }
    }

    pub fn to_json(&self) -> Value {
        match (&self.expr, &self.reference) {
            (Expr::Field(name), None) => Value::String(name.clone()),
            (expr, reference) => {
                let mut value = expr.to_json();
                if let (Some(reference), Value::Object(map)) = (reference, &mut value) {
                    map.insert("reference".to_string(), Value::String(reference.clone()));
                }
                value
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Interpret a direction token; `-1`, `"-1"` and `desc` in any case are
    /// descending, everything else ascending
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) if n.as_f64().is_some_and(|n| n < 0.0) => {
                SortDirection::Descending
            }
            Some(Value::String(s)) if s.trim() == "-1" || s.trim().eq_ignore_ascii_case("desc") => {
                SortDirection::Descending
            }
            _ => SortDirection::Ascending,
        }
    }

    pub fn sign(self) -> i64 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub expr: Expr,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn new(expr: Expr, direction: SortDirection) -> Self {
        Self { expr, direction }
    }

    pub fn to_json(&self) -> Value {
        let key = match &self.expr {
            Expr::Field(name) => Value::String(name.clone()),
            expr => expr.to_json(),
        };
        json!([key, self.direction.sign()])
    }
}

/// Canonical filter operators
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum OperatorId {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Regex,
    NotRegex,
    Search,
    NotSearch,
    Is,
    NotIs,
}

impl OperatorId {
    pub const ALL: [OperatorId; 14] = [
        OperatorId::Eq,
        OperatorId::Ne,
        OperatorId::Gt,
        OperatorId::Gte,
        OperatorId::Lt,
        OperatorId::Lte,
        OperatorId::In,
        OperatorId::NotIn,
        OperatorId::Regex,
        OperatorId::NotRegex,
        OperatorId::Search,
        OperatorId::NotSearch,
        OperatorId::Is,
        OperatorId::NotIs,
    ];

    /// Operator suffixes accepted on bare `field_<op>` query parameters
    pub const PARAM_SUFFIXES: [&'static str; 18] = [
        "eq", "ne", "gt", "gte", "min", "lt", "lte", "max", "in", "notin", "not_in", "nin",
        "regex", "notregex", "search", "notsearch", "is", "notis",
    ];

    /// Resolve an operator name or alias; a missing operator means `eq`
    pub fn parse(alias: Option<&str>) -> Option<Self> {
        let alias = match alias {
            None => return Some(OperatorId::Eq),
            Some(alias) => alias.trim(),
        };
        let op = match alias.to_lowercase().as_str() {
            "" | "eq" | "=" | "==" => OperatorId::Eq,
            "ne" | "!=" | "<>" => OperatorId::Ne,
            "gt" | ">" => OperatorId::Gt,
            "gte" | ">=" | "min" => OperatorId::Gte,
            "lt" | "<" => OperatorId::Lt,
            "lte" | "<=" | "max" => OperatorId::Lte,
            "in" => OperatorId::In,
            "not_in" | "notin" | "nin" => OperatorId::NotIn,
            "regex" | "~" => OperatorId::Regex,
            "not_regex" | "notregex" | "!~" => OperatorId::NotRegex,
            "search" | "~*" => OperatorId::Search,
            "not_search" | "notsearch" | "!~*" => OperatorId::NotSearch,
            "is" => OperatorId::Is,
            "not_is" | "notis" | "isnot" | "is_not" => OperatorId::NotIs,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatorId::Eq => "eq",
            OperatorId::Ne => "ne",
            OperatorId::Gt => "gt",
            OperatorId::Gte => "gte",
            OperatorId::Lt => "lt",
            OperatorId::Lte => "lte",
            OperatorId::In => "in",
            OperatorId::NotIn => "not_in",
            OperatorId::Regex => "regex",
            OperatorId::NotRegex => "not_regex",
            OperatorId::Search => "search",
            OperatorId::NotSearch => "not_search",
            OperatorId::Is => "is",
            OperatorId::NotIs => "not_is",
        }
    }

    /// Whether the operator takes a list on its right side
    pub fn is_list(self) -> bool {
        matches!(self, OperatorId::In | OperatorId::NotIn)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    pub fn as_str(self) -> &'static str {
        match self {
            Combinator::And => "and",
            Combinator::Or => "or",
        }
    }
}

/// Right side of a filter leaf
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    One(Expr),
    /// Operand list of `in` / `not_in`
    Many(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterLeaf {
    pub field: Expr,
    pub operator: OperatorId,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Leaf(FilterLeaf),
    /// Always holds two or more children
    Group {
        combinator: Combinator,
        children: Vec<Filter>,
    },
}

impl Filter {
    pub fn leaf(field: Expr, operator: OperatorId, value: FilterValue) -> Self {
        Filter::Leaf(FilterLeaf {
            field,
            operator,
            value,
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            Filter::Leaf(leaf) => {
                let mut map = Map::new();
                map.insert("field".into(), leaf.field.to_json());
                map.insert("operator".into(), Value::from(leaf.operator.as_str()));
                let value = match &leaf.value {
                    FilterValue::One(expr) => expr.to_json(),
                    FilterValue::Many(exprs) => {
                        Value::Array(exprs.iter().map(Expr::to_json).collect())
                    }
                };
                map.insert("value".into(), value);
                Value::Object(map)
            }
            Filter::Group {
                combinator,
                children,
            } => json!({
                "group": combinator.as_str(),
                "value": children.iter().map(Filter::to_json).collect::<Vec<_>>(),
            }),
        }
    }
}
