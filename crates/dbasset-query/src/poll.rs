use crate::error::Result;
use crate::query::SelectQuery;
use crate::traits::Connector;
use crate::types::SelectResult;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Run a select, repeating it until rows appear or `query.wait` elapses
///
/// With no wait budget the select runs once. `initwait` is slept before the
/// first attempt and does not count against the budget. Errors are returned
/// immediately; only empty results are retried.
pub async fn perform_select_with_polling(
    connector: &dyn Connector,
    query: &SelectQuery,
) -> Result<SelectResult> {
    if query.wait.is_zero() {
        return connector.perform_select(query).await;
    }
    if !query.initwait.is_zero() {
        sleep(query.initwait).await;
    }
    let start = Instant::now();
    loop {
        let result = connector.perform_select(query).await?;
        if result.datacount > 0 {
            return Ok(result);
        }
        let elapsed = start.elapsed();
        if elapsed >= query.wait {
            return Ok(result);
        }
        let remaining = query.wait - elapsed;
        let delay = query.poll.min(remaining).max(query.poll / 2);
        debug!("No rows yet, polling again in {:?}", delay);
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{OperatorId, OutputColumn};
    use crate::error::DataError;
    use crate::types::{
        ConnectorCapabilities, Datatype, FieldDescriptor, FunctionAllowList, Rows,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Returns no rows until `rows_after` calls have been made
    struct CountingConnector {
        calls: AtomicUsize,
        rows_after: usize,
        fail: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        fn source_type(&self) -> &'static str {
            "counting"
        }

        fn capabilities(&self) -> ConnectorCapabilities {
            ConnectorCapabilities::relational(&OperatorId::ALL)
        }

        async fn field_info(&self) -> Result<Arc<Vec<FieldDescriptor>>> {
            Ok(Arc::new(vec![FieldDescriptor::new("n", Datatype::Number)]))
        }

        async fn function_allowlist(&self) -> Result<Arc<FunctionAllowList>> {
            Ok(Arc::new(FunctionAllowList::default()))
        }

        async fn perform_select(&self, query: &SelectQuery) -> Result<SelectResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(DataError::QueryFailed("boom".into()));
            }
            let rows = if call >= self.rows_after {
                vec![vec![json!(call)]]
            } else {
                Vec::new()
            };
            Ok(SelectResult::new(
                query.limit,
                query.offset,
                Vec::new(),
                vec![OutputColumn::field("n")],
                Rows::List(rows),
            ))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn connector(rows_after: usize, fail: bool) -> CountingConnector {
        CountingConnector {
            calls: AtomicUsize::new(0),
            rows_after,
            fail,
        }
    }

    fn query(wait: u64, poll: u64, initwait: u64) -> SelectQuery {
        let fields = vec![FieldDescriptor::new("n", Datatype::Number)];
        let functions = FunctionAllowList::default();
        let scope = crate::canonical::FieldScope::new(
            &fields,
            &functions,
            ConnectorCapabilities::relational(&OperatorId::ALL),
        );
        SelectQuery::all_fields(&scope).with_wait(
            Duration::from_secs(wait),
            Duration::from_secs(poll),
            Duration::from_secs(initwait),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_runs_once() {
        let connector = connector(5, false);
        let result = perform_select_with_polling(&connector, &query(0, 10, 0))
            .await
            .unwrap();
        assert_eq!(result.datacount, 0);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_rows() {
        let connector = connector(3, false);
        let start = Instant::now();
        let result = perform_select_with_polling(&connector, &query(60, 2, 0))
            .await
            .unwrap();
        assert_eq!(result.datacount, 1);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_budget_bounds_polling() {
        let connector = connector(usize::MAX, false);
        let start = Instant::now();
        let result = perform_select_with_polling(&connector, &query(5, 2, 3))
            .await
            .unwrap();
        assert_eq!(result.datacount, 0);
        // initwait 3s, then attempts at 0, 2, 4 and a final one at 5
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_retried() {
        let connector = connector(1, true);
        let err = perform_select_with_polling(&connector, &query(60, 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::QueryFailed(_)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }
}
