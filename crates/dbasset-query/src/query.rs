use crate::ast::{Filter, OutputColumn, SortKey};
use crate::canonical::{parse_column_list, parse_filters, parse_sort, FieldScope};
use crate::error::{DataError, Result};
use crate::params::{parse_limit, parse_offset, parse_seconds, QueryParams, DEFAULT_POLL};
use std::time::Duration;

/// A fully canonicalized select request, ready for a connector to compile
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    /// `None` means unbounded
    pub limit: Option<u64>,
    pub offset: u64,
    pub sort: Vec<SortKey>,
    /// Never empty for a table with fields; defaults to every known field
    pub fields: Vec<OutputColumn>,
    pub group: Option<Vec<OutputColumn>>,
    /// Conjunction of filters
    pub filters: Vec<Filter>,
    pub wait: Duration,
    pub poll: Duration,
    pub initwait: Duration,
    pub client_id: Option<String>,
}

impl SelectQuery {
    /// Select every field of `scope` with no filters
    pub fn all_fields(scope: &FieldScope<'_>) -> Self {
        Self {
            limit: None,
            offset: 0,
            sort: Vec::new(),
            fields: scope
                .fields()
                .iter()
                .map(|field| OutputColumn::field(field.name.clone()))
                .collect(),
            group: None,
            filters: Vec::new(),
            wait: Duration::ZERO,
            poll: DEFAULT_POLL,
            initwait: Duration::ZERO,
            client_id: None,
        }
    }

    /// Canonicalize request parameters against a connector's fields
    pub fn from_params(
        params: &QueryParams,
        scope: &FieldScope<'_>,
        default_limit: u64,
    ) -> Result<Self> {
        let mut query = Self::all_fields(scope);
        query.limit = parse_limit(params, default_limit)?;
        query.offset = parse_offset(params)?;
        query.sort = parse_sort(params, scope)?;
        if let Some(fields) = parse_column_list(params, "fields", scope)? {
            query.fields = fields;
        }
        query.group = parse_column_list(params, "group", scope)?;
        if query.group.is_some() && !scope.capabilities().grouping {
            return Err(DataError::GroupingUnsupported);
        }
        query.filters = parse_filters(params, scope)?;
        query.wait = parse_seconds(params, "wait", Duration::ZERO)?;
        query.poll = parse_seconds(params, "poll", DEFAULT_POLL)?;
        query.initwait = parse_seconds(params, "initwait", Duration::ZERO)?;
        query.client_id = params.get_str("clientid");
        Ok(query)
    }

    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_group(mut self, group: Vec<OutputColumn>) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_wait(mut self, wait: Duration, poll: Duration, initwait: Duration) -> Self {
        self.wait = wait;
        self.poll = poll;
        self.initwait = initwait;
        self
    }
}
