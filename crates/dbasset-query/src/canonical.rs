//! Normalizes loosely-typed field, function, filter, sort and group
//! request parameters into the canonical AST.
//!
//! Every field reference is checked against the connector's known fields,
//! every function against its allow-list, and every filter operator against
//! the connector's operator policy, so nothing invalid reaches a backend.

use crate::ast::{
    Combinator, Expr, Filter, FilterValue, OperatorId, OutputColumn, SortDirection, SortKey,
};
use crate::error::{DataError, Result};
use crate::params::{json_param, QueryParams, RESERVED_PARAMS};
use crate::types::{ConnectorCapabilities, FieldDescriptor, FunctionAllowList};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

const LEFT_PARAM_KEYS: [&str; 4] = ["param", "params", "lparam", "lparams"];
const RIGHT_PARAM_KEYS: [&str; 2] = ["rparam", "rparams"];

/// Where an expression is used; connectors may allow functions in some
/// positions only
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FunctionUse {
    Field,
    Sort,
    Filter,
}

impl fmt::Display for FunctionUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionUse::Field => f.write_str("fields"),
            FunctionUse::Sort => f.write_str("sort"),
            FunctionUse::Filter => f.write_str("filters"),
        }
    }
}

/// Everything the canonicalizer needs to know about one connector
#[derive(Debug, Clone, Copy)]
pub struct FieldScope<'a> {
    fields: &'a [FieldDescriptor],
    functions: &'a FunctionAllowList,
    capabilities: ConnectorCapabilities,
}

impl<'a> FieldScope<'a> {
    pub fn new(
        fields: &'a [FieldDescriptor],
        functions: &'a FunctionAllowList,
        capabilities: ConnectorCapabilities,
    ) -> Self {
        Self {
            fields,
            functions,
            capabilities,
        }
    }

    pub fn fields(&self) -> &'a [FieldDescriptor] {
        self.fields
    }

    pub fn descriptor(&self, name: &str) -> Option<&'a FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn capabilities(&self) -> &ConnectorCapabilities {
        &self.capabilities
    }

    fn functions_enabled(&self, usage: FunctionUse) -> bool {
        match usage {
            FunctionUse::Field => self.capabilities.field_functions,
            FunctionUse::Sort => self.capabilities.sort_functions,
            FunctionUse::Filter => self.capabilities.filter_functions,
        }
    }
}

fn invalid(msg: impl Into<String>) -> DataError {
    DataError::invalid_query(msg)
}

/// A function name: a letter or underscore, then letters, digits or underscores
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn known_field(name: &str, scope: &FieldScope<'_>) -> Result<Expr> {
    match scope.descriptor(name) {
        Some(_) => Ok(Expr::Field(name.to_string())),
        None => Err(DataError::UnknownField(name.to_string())),
    }
}

/// Canonicalize a column-position reference: a bare field name or a
/// `{field}`, `{value}` or `{func, param}` object
pub fn canonicalize_field(raw: &Value, scope: &FieldScope<'_>, usage: FunctionUse) -> Result<Expr> {
    match raw {
        Value::String(name) => known_field(name, scope),
        Value::Object(map) => canonicalize_object(map, raw, scope, usage),
        other => Err(invalid(format!("Not a field, value or function: {other}"))),
    }
}

fn canonicalize_object(
    map: &Map<String, Value>,
    raw: &Value,
    scope: &FieldScope<'_>,
    usage: FunctionUse,
) -> Result<Expr> {
    if let Some(field) = map.get("field") {
        return match field {
            Value::String(name) => known_field(name, scope),
            Value::Object(_) => canonicalize_field(field, scope, usage),
            other => Err(invalid(format!("Not a field name: {other}"))),
        };
    }
    if let Some(value) = map.get("value") {
        return Ok(Expr::Value(value.clone()));
    }
    if let Some(name) = map.get("func").or_else(|| map.get("lfunc")) {
        return canonicalize_function(name, param_list(map, &LEFT_PARAM_KEYS), raw, scope, usage);
    }
    Err(invalid(format!("Not a field, value or function: {raw}")))
}

/// Function parameters, accepting a single item in place of a list
fn param_list<'v>(map: &'v Map<String, Value>, keys: &[&str]) -> Vec<&'v Value> {
    match keys.iter().find_map(|key| map.get(*key)) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
    }
}

fn canonicalize_function(
    name: &Value,
    params: Vec<&Value>,
    raw: &Value,
    scope: &FieldScope<'_>,
    usage: FunctionUse,
) -> Result<Expr> {
    let name = name
        .as_str()
        .filter(|name| is_identifier(name))
        .ok_or_else(|| invalid(format!("Invalid function name in {raw}")))?;
    if !scope.functions_enabled(usage) || !scope.functions.contains(name) {
        return Err(DataError::FunctionNotAllowed(name.to_string()));
    }
    let params = params
        .into_iter()
        .map(|param| canonicalize_param(param, scope, usage))
        .collect::<Result<Vec<_>>>()?;
    Ok(Expr::function(name.to_lowercase(), params))
}

/// Inside a parameter list only objects are references; scalars are literals
fn canonicalize_param(raw: &Value, scope: &FieldScope<'_>, usage: FunctionUse) -> Result<Expr> {
    match raw {
        Value::Object(map) => canonicalize_object(map, raw, scope, usage),
        other => Ok(Expr::Value(other.clone())),
    }
}

fn canonicalize_operand(raw: &Value, scope: &FieldScope<'_>) -> Result<Expr> {
    canonicalize_param(raw, scope, FunctionUse::Filter)
}

fn is_group(map: &Map<String, Value>) -> bool {
    ["and", "or", "group"]
        .iter()
        .any(|key| map.get(*key).is_some_and(|v| !v.is_null()))
}

/// Canonicalize one filter; `Ok(None)` means the filter reduced to nothing
pub fn canonicalize_filter(raw: &Value, scope: &FieldScope<'_>) -> Result<Option<Filter>> {
    let expanded;
    let map = match raw {
        Value::Array(items) if items.len() == 2 || items.len() == 3 => {
            let mut map = Map::new();
            map.insert("field".into(), items[0].clone());
            if items.len() == 3 {
                map.insert("operator".into(), items[1].clone());
            }
            map.insert("value".into(), items[items.len() - 1].clone());
            expanded = map;
            &expanded
        }
        Value::Array(_) => {
            return Err(invalid(
                "Filters in list format must have two or three components.",
            ))
        }
        Value::Object(map) => map,
        other => return Err(invalid(format!("Filters must be lists or objects: {other}"))),
    };
    if is_group(map) {
        return canonicalize_filter_group(map, raw, scope);
    }

    let operator = match map.get("operator") {
        None | Some(Value::Null) => OperatorId::Eq,
        Some(Value::String(name)) => OperatorId::parse(Some(name))
            .ok_or_else(|| invalid(format!("Unknown filter operator: {name}")))?,
        Some(other) => return Err(invalid(format!("Unknown filter operator: {other}"))),
    };

    let field = if let Some(field) = map.get("field") {
        match field {
            Value::String(name) => known_field(name, scope)?,
            Value::Object(_) => canonicalize_field(field, scope, FunctionUse::Filter)?,
            other => return Err(invalid(format!("Not a field name: {other}"))),
        }
    } else if let Some(lvalue) = map.get("lvalue") {
        Expr::Value(lvalue.clone())
    } else if let Some(name) = map.get("func").or_else(|| map.get("lfunc")) {
        canonicalize_function(
            name,
            param_list(map, &LEFT_PARAM_KEYS),
            raw,
            scope,
            FunctionUse::Filter,
        )?
    } else {
        return Err(invalid(format!(
            "Filters must specify a field, lvalue or func: {raw}"
        )));
    };

    let operand = if let Some(value) = map.get("value") {
        match value {
            Value::Array(items) if operator.is_list() => FilterValue::Many(
                items
                    .iter()
                    .map(|item| canonicalize_operand(item, scope))
                    .collect::<Result<Vec<_>>>()?,
            ),
            single => FilterValue::One(canonicalize_operand(single, scope)?),
        }
    } else if let Some(name) = map.get("rfunc") {
        FilterValue::One(canonicalize_function(
            name,
            param_list(map, &RIGHT_PARAM_KEYS),
            raw,
            scope,
            FunctionUse::Filter,
        )?)
    } else {
        return Err(invalid(format!(
            "Filters must specify a value or rfunc: {raw}"
        )));
    };
    let operand = match operand {
        FilterValue::One(expr) if operator.is_list() => FilterValue::Many(vec![expr]),
        operand => operand,
    };

    check_operator(&field, operator, scope)?;
    Ok(Some(Filter::leaf(field, operator, operand)))
}

fn check_operator(field: &Expr, operator: OperatorId, scope: &FieldScope<'_>) -> Result<()> {
    let name = match field {
        Expr::Field(name) => name.clone(),
        other => other.to_json().to_string(),
    };
    let capabilities = scope.capabilities();
    if !capabilities.operators.contains(&operator) {
        return Err(DataError::OperatorNotAllowed {
            operator: operator.to_string(),
            field: name,
        });
    }
    if let Some(descriptor) = field.as_field().and_then(|f| scope.descriptor(f)) {
        if !capabilities
            .operator_policy
            .allows(descriptor.datatype, operator)
        {
            return Err(DataError::OperatorNotAllowed {
                operator: operator.to_string(),
                field: name,
            });
        }
    }
    Ok(())
}

/// Canonicalize an `{and: [...]}`, `{or: [...]}` or `{group, value}` object
///
/// Empty groups reduce to `None`, single-child groups to the child.
pub fn canonicalize_filter_group(
    map: &Map<String, Value>,
    raw: &Value,
    scope: &FieldScope<'_>,
) -> Result<Option<Filter>> {
    let present = |key: &str| map.get(key).filter(|v| !v.is_null());
    let (combinator, children) = match (present("and"), present("or"), present("group")) {
        (Some(children), None, None) => (Combinator::And, children),
        (None, Some(children), None) => (Combinator::Or, children),
        (None, None, Some(group)) => {
            let combinator = match group.as_str().map(str::to_lowercase).as_deref() {
                Some("and") => Combinator::And,
                Some("or") => Combinator::Or,
                _ => {
                    return Err(invalid(format!(
                        "Filter groups must be 'and' or 'or': {raw}"
                    )))
                }
            };
            let children = map
                .get("value")
                .ok_or_else(|| invalid(format!("Filter group has no value list: {raw}")))?;
            (combinator, children)
        }
        _ => return Err(invalid(format!("Filter group is badly formed: {raw}"))),
    };

    let mut canonical = Vec::new();
    for child in filter_list(children)? {
        if let Some(filter) = canonicalize_filter(&child, scope)? {
            canonical.push(filter);
        }
    }
    Ok(match canonical.len() {
        0 => None,
        1 => canonical.pop(),
        _ => Some(Filter::Group {
            combinator,
            children: canonical,
        }),
    })
}

/// Normalize a filters value into a list of individual filters
///
/// A single filter (an object, or a list form starting with a field name) is
/// wrapped in a one-element list; JSON text is parsed first.
pub fn filter_list(raw: &Value) -> Result<Vec<Value>> {
    match raw {
        Value::String(text) => {
            let parsed: Value = serde_json::from_str(text)
                .map_err(|_| invalid("The filters parameter must be a JSON list."))?;
            match parsed {
                Value::String(_) => Err(invalid("The filters parameter must be a JSON list.")),
                parsed => filter_list(&parsed),
            }
        }
        Value::Object(_) => Ok(vec![raw.clone()]),
        Value::Array(items) if matches!(items.first(), Some(Value::String(_))) => {
            Ok(vec![raw.clone()])
        }
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Ok(Vec::new()),
        other => Err(invalid(format!("Filters must be a list: {other}"))),
    }
}

/// Filters from the `filters` parameter plus bare `field` / `field_op`
/// parameters
pub fn parse_filters(params: &QueryParams, scope: &FieldScope<'_>) -> Result<Vec<Filter>> {
    let mut filters = Vec::new();
    if let Some(raw) = json_param(params, "filters")? {
        for item in filter_list(&raw)? {
            if let Some(filter) = canonicalize_filter(&item, scope)? {
                filters.push(filter);
            }
        }
    }

    let suffixes = std::iter::once(None).chain(OperatorId::PARAM_SUFFIXES.iter().copied().map(Some));
    for suffix in suffixes {
        for field in scope.fields() {
            let name = match suffix {
                None => field.name.clone(),
                Some(suffix) => format!("{}_{}", field.name, suffix),
            };
            if RESERVED_PARAMS.contains(&name.as_str()) {
                continue;
            }
            let Some(value) = params.get(&name) else {
                continue;
            };
            let mut raw = Map::new();
            raw.insert("field".into(), Value::String(field.name.clone()));
            if let Some(suffix) = suffix {
                raw.insert("operator".into(), Value::String(suffix.to_string()));
            }
            let operator = OperatorId::parse(suffix);
            raw.insert("value".into(), bare_value(value, operator));
            if let Some(filter) = canonicalize_filter(&Value::Object(raw), scope)? {
                filters.push(filter);
            }
        }
    }
    Ok(filters)
}

/// `in` lists given as query-string text: JSON lists or comma-separated
fn bare_value(value: &Value, operator: Option<OperatorId>) -> Value {
    match (value, operator) {
        (Value::String(text), Some(op)) if op.is_list() => {
            if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(text) {
                return parsed;
            }
            Value::Array(
                text.split(',')
                    .map(|item| Value::String(item.trim().to_string()))
                    .collect(),
            )
        }
        _ => value.clone(),
    }
}

/// Split a comma-separated string of names or parse a JSON list
fn column_entries(raw: &Value, param: &str) -> Result<Vec<Value>> {
    let list_error = || {
        invalid(format!(
            "The {param} parameter must be a JSON list or a comma-separated list of known field names."
        ))
    };
    match raw {
        Value::String(text) if !text.trim_start().starts_with('[') => Ok(text
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| Value::String(name.to_string()))
            .collect()),
        Value::String(text) => match serde_json::from_str(text) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(list_error()),
        },
        Value::Array(items) => Ok(items.clone()),
        _ => Err(list_error()),
    }
}

fn canonicalize_column(raw: &Value, scope: &FieldScope<'_>, usage: FunctionUse) -> Result<OutputColumn> {
    let expr = canonicalize_field(raw, scope, usage)?;
    let reference = match raw.get("reference") {
        None | Some(Value::Null) => None,
        Some(Value::String(reference)) if !reference.is_empty() => Some(reference.clone()),
        Some(other) => return Err(invalid(format!("Column references must be names: {other}"))),
    };
    Ok(OutputColumn::new(expr, reference))
}

/// Parse a `fields` or `group` style parameter; `None` when absent or empty
pub fn parse_column_list(
    params: &QueryParams,
    param: &str,
    scope: &FieldScope<'_>,
) -> Result<Option<Vec<OutputColumn>>> {
    let Some(raw) = params.get(param) else {
        return Ok(None);
    };
    let columns = column_entries(raw, param)?
        .iter()
        .map(|entry| canonicalize_column(entry, scope, FunctionUse::Field))
        .collect::<Result<Vec<_>>>()?;
    let mut seen = HashSet::new();
    for (index, column) in columns.iter().enumerate() {
        let name = column.column_name(index);
        if !seen.insert(name.clone()) {
            return Err(invalid(format!(
                "Duplicate column name in {param}: {name}"
            )));
        }
    }
    Ok((!columns.is_empty()).then_some(columns))
}

/// Parse `sort` and `sortdir`
///
/// `sortdir` applies to the comma-separated form; JSON entries carry their
/// own direction and default to ascending.
pub fn parse_sort(params: &QueryParams, scope: &FieldScope<'_>) -> Result<Vec<SortKey>> {
    let Some(raw) = params.get("sort") else {
        return Ok(Vec::new());
    };
    let is_json = match raw {
        Value::String(text) => text.trim_start().starts_with('['),
        _ => true,
    };
    let direction = if is_json {
        SortDirection::Ascending
    } else {
        SortDirection::from_value(params.get("sortdir"))
    };
    column_entries(raw, "sort")?
        .iter()
        .map(|entry| match entry {
            Value::Array(pair) if !pair.is_empty() && pair.len() <= 2 => Ok(SortKey::new(
                canonicalize_field(&pair[0], scope, FunctionUse::Sort)?,
                match pair.get(1) {
                    Some(dir) => SortDirection::from_value(Some(dir)),
                    None => direction,
                },
            )),
            Value::Array(_) => Err(invalid(format!(
                "Sort entries must be a field, [field] or [field, direction]: {entry}"
            ))),
            other => Ok(SortKey::new(
                canonicalize_field(other, scope, FunctionUse::Sort)?,
                direction,
            )),
        })
        .collect()
}
