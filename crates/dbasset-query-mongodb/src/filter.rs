//! Canonical filters and sort keys as BSON documents

use bson::{doc, Bson, Document, Regex};
use dbasset_query::{
    Combinator, DataError, Expr, Filter, FilterLeaf, FilterValue, OperatorId, Result,
    SortDirection, SortKey,
};
use serde_json::Value;

fn unsupported(what: &str) -> DataError {
    DataError::operation_not_supported(format!("{what} is not supported by MongoDB"))
}

/// JSON request value as BSON; integers stay integers
pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Bson::Int64(i),
            (None, Some(f)) => Bson::Double(f),
            (None, None) => Bson::String(n.to_string()),
        },
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_bson(value)))
                .collect(),
        ),
    }
}

fn literal(expr: &Expr) -> Result<Bson> {
    match expr {
        Expr::Value(value) => Ok(json_to_bson(value)),
        Expr::Field(_) => Err(unsupported("Comparing two fields")),
        Expr::Function { .. } => Err(unsupported("A function in a filter")),
    }
}

fn single(leaf: &FilterLeaf) -> Result<&Expr> {
    match &leaf.value {
        FilterValue::One(expr) => Ok(expr),
        FilterValue::Many(_) => Err(DataError::invalid_query(format!(
            "The {} operator takes a single value",
            leaf.operator
        ))),
    }
}

fn pattern(leaf: &FilterLeaf, options: &str) -> Result<Bson> {
    match single(leaf)? {
        Expr::Value(Value::String(pattern)) => Ok(Bson::RegularExpression(Regex {
            pattern: pattern.clone(),
            options: options.to_string(),
        })),
        Expr::Value(_) => Err(DataError::invalid_query(format!(
            "The {} operator needs a string pattern",
            leaf.operator
        ))),
        other => literal(other),
    }
}

fn compile_leaf(leaf: &FilterLeaf) -> Result<Document> {
    let Expr::Field(field) = &leaf.field else {
        return Err(unsupported("A value or function on the left of a filter"));
    };

    let condition = match leaf.operator {
        OperatorId::In | OperatorId::NotIn => {
            let items = match &leaf.value {
                FilterValue::Many(items) => items,
                FilterValue::One(_) => {
                    return Err(DataError::invalid_query(format!(
                        "The {} operator takes a list",
                        leaf.operator
                    )))
                }
            };
            let values = items.iter().map(literal).collect::<Result<Vec<_>>>()?;
            let key = if leaf.operator == OperatorId::In { "$in" } else { "$nin" };
            doc! { key: values }
        }
        OperatorId::Regex => doc! { "$regex": pattern(leaf, "")? },
        OperatorId::Search => doc! { "$regex": pattern(leaf, "i")? },
        OperatorId::NotRegex => doc! { "$not": pattern(leaf, "")? },
        OperatorId::NotSearch => doc! { "$not": pattern(leaf, "i")? },
        op => {
            let key = match op {
                OperatorId::Eq | OperatorId::Is => "$eq",
                OperatorId::Ne | OperatorId::NotIs => "$ne",
                OperatorId::Gt => "$gt",
                OperatorId::Gte => "$gte",
                OperatorId::Lt => "$lt",
                _ => "$lte",
            };
            doc! { key: literal(single(leaf)?)? }
        }
    };
    Ok(doc! { field.as_str(): condition })
}

fn compile_filter(filter: &Filter) -> Result<Document> {
    match filter {
        Filter::Leaf(leaf) => compile_leaf(leaf),
        Filter::Group {
            combinator,
            children,
        } => {
            let key = match combinator {
                Combinator::And => "$and",
                Combinator::Or => "$or",
            };
            let children = children
                .iter()
                .map(compile_filter)
                .collect::<Result<Vec<_>>>()?;
            Ok(doc! { key: children })
        }
    }
}

/// The conjunction of `filters`; empty when there are none
pub fn compile_filters(filters: &[Filter]) -> Result<Document> {
    match filters {
        [] => Ok(Document::new()),
        [filter] => compile_filter(filter),
        filters => {
            let clauses = filters
                .iter()
                .map(compile_filter)
                .collect::<Result<Vec<_>>>()?;
            Ok(doc! { "$and": clauses })
        }
    }
}

pub fn compile_sort(sort: &[SortKey]) -> Result<Document> {
    let mut document = Document::new();
    for key in sort {
        let Expr::Field(field) = &key.expr else {
            return Err(unsupported("Sorting on a value or function"));
        };
        let direction = match key.direction {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        };
        document.insert(field.clone(), direction);
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(field: &str, operator: OperatorId, value: Value) -> Filter {
        Filter::leaf(
            Expr::field(field),
            operator,
            FilterValue::One(Expr::Value(value)),
        )
    }

    #[test]
    fn test_comparisons() {
        let filters = vec![
            leaf("town", OperatorId::Eq, json!("BOSTON")),
            leaf("pop2010", OperatorId::Gte, json!(20000)),
        ];
        assert_eq!(
            compile_filters(&filters).unwrap(),
            doc! { "$and": [
                { "town": { "$eq": "BOSTON" } },
                { "pop2010": { "$gte": 20000_i64 } },
            ] }
        );
        assert_eq!(compile_filters(&[]).unwrap(), Document::new());
    }

    #[test]
    fn test_null_tests_and_lists() {
        assert_eq!(
            compile_filters(&[leaf("pop2010", OperatorId::Is, Value::Null)]).unwrap(),
            doc! { "pop2010": { "$eq": Bson::Null } }
        );
        assert_eq!(
            compile_filters(&[leaf("pop2010", OperatorId::NotIs, Value::Null)]).unwrap(),
            doc! { "pop2010": { "$ne": Bson::Null } }
        );
        let not_in = Filter::leaf(
            Expr::field("town"),
            OperatorId::NotIn,
            FilterValue::Many(vec![Expr::value("A"), Expr::value("B")]),
        );
        assert_eq!(
            compile_filters(&[not_in]).unwrap(),
            doc! { "town": { "$nin": ["A", "B"] } }
        );
    }

    #[test]
    fn test_regex_operators() {
        let regex = |pattern: &str, options: &str| {
            Bson::RegularExpression(Regex {
                pattern: pattern.to_string(),
                options: options.to_string(),
            })
        };
        assert_eq!(
            compile_filters(&[leaf("town", OperatorId::Search, json!("^bo"))]).unwrap(),
            doc! { "town": { "$regex": regex("^bo", "i") } }
        );
        assert_eq!(
            compile_filters(&[leaf("town", OperatorId::NotRegex, json!("^B"))]).unwrap(),
            doc! { "town": { "$not": regex("^B", "") } }
        );
        assert!(matches!(
            compile_filters(&[leaf("town", OperatorId::Regex, json!(5))]),
            Err(DataError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_groups() {
        let group = Filter::Group {
            combinator: Combinator::Or,
            children: vec![
                leaf("town", OperatorId::Eq, json!("BOSTON")),
                leaf("pop2010", OperatorId::Lt, json!(5000.5)),
            ],
        };
        assert_eq!(
            compile_filters(&[group]).unwrap(),
            doc! { "$or": [
                { "town": { "$eq": "BOSTON" } },
                { "pop2010": { "$lt": 5000.5 } },
            ] }
        );
    }

    #[test]
    fn test_left_side_must_be_a_field() {
        let filter = Filter::leaf(
            Expr::value("BOSTON"),
            OperatorId::Eq,
            FilterValue::One(Expr::field("town")),
        );
        assert!(matches!(
            compile_filters(&[filter]),
            Err(DataError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_sort() {
        let sort = vec![
            SortKey::new(Expr::field("town"), SortDirection::Descending),
            SortKey::new(Expr::field("pop2010"), SortDirection::Ascending),
        ];
        assert_eq!(compile_sort(&sort).unwrap(), doc! { "town": -1, "pop2010": 1 });
    }
}
