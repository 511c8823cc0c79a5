use super::{engine, SourceArgs};
use clap::Args;
use dbasset_query::{FormattedOutput, QueryEngine, QueryParams};
use futures::TryStreamExt;
use std::io::Write;
use tracing::debug;

/// `key=value` request parameter
fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[derive(Args, Debug)]
pub struct QueryCommand {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Request parameter, e.g. -p limit=10 -p 'filters=[["town","BOSTON"]]'
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,
}

impl QueryCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let engine = engine();
            let mut stdout = std::io::stdout().lock();
            let result = self.run(&engine, &mut stdout).await;
            engine.shutdown().await;
            result
        })
    }

    /// Run the select and write the encoded result to `out`
    pub async fn run<W: Write>(&self, engine: &QueryEngine, out: &mut W) -> anyhow::Result<()> {
        let params = QueryParams::from_pairs(self.params.iter().cloned());
        let info = self.source.connection_info();
        debug!("Querying {} with {} parameters", info.redacted_uri(), params.len());

        let output = engine
            .query_database(&self.source.logical_id(), &info, &params)
            .await?;
        match output {
            FormattedOutput::Stream { factory, .. } => {
                let mut stream = factory.stream();
                while let Some(chunk) = stream.try_next().await? {
                    out.write_all(&chunk)?;
                }
            }
            FormattedOutput::RawList(rows) => {
                serde_json::to_writer_pretty(&mut *out, &rows)?;
                writeln!(out)?;
            }
            FormattedOutput::RawDict(rows) => {
                serde_json::to_writer_pretty(&mut *out, &rows)?;
                writeln!(out)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct FieldsCommand {
    #[command(flatten)]
    pub source: SourceArgs,
}

impl FieldsCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(async {
            let engine = engine();
            let mut stdout = std::io::stdout().lock();
            let result = self.run(&engine, &mut stdout).await;
            engine.shutdown().await;
            result
        })
    }

    pub async fn run<W: Write>(&self, engine: &QueryEngine, out: &mut W) -> anyhow::Result<()> {
        let fields = engine
            .field_info(&self.source.logical_id(), &self.source.connection_info())
            .await?;
        serde_json::to_writer_pretty(&mut *out, fields.as_ref())?;
        writeln!(out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::registry;
    use dbasset_query::EngineConfig;
    use rusqlite::Connection;
    use tempfile::TempDir;

    fn census() -> (TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("census.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE towns (town TEXT, pop2010 INTEGER);
             INSERT INTO towns VALUES ('ABINGTON', 15985), ('BOSTON', 617594);",
        )
        .unwrap();
        let uri = format!("sqlite:///{}", path.display());
        (dir, uri)
    }

    fn source(uri: &str) -> SourceArgs {
        SourceArgs {
            uri: uri.to_string(),
            table: "towns".to_string(),
            schema: None,
            database: None,
            connector_type: None,
        }
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("filters=[[\"a\",\"=b\"]]").unwrap(),
            ("filters".to_string(), "[[\"a\",\"=b\"]]".to_string())
        );
        assert!(parse_param("limit").is_err());
        assert!(parse_param("=5").is_err());
    }

    #[tokio::test]
    async fn test_query_csv() {
        let (_dir, uri) = census();
        let engine = QueryEngine::new(registry(), EngineConfig::default());
        let command = QueryCommand {
            source: source(&uri),
            params: vec![
                ("format".to_string(), "csv".to_string()),
                ("sort".to_string(), "town".to_string()),
            ],
        };
        let mut out = Vec::new();
        command.run(&engine, &mut out).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "town,pop2010\nABINGTON,15985\nBOSTON,617594\n"
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_fields() {
        let (_dir, uri) = census();
        let engine = QueryEngine::new(registry(), EngineConfig::default());
        let command = FieldsCommand {
            source: source(&uri),
        };
        let mut out = Vec::new();
        command.run(&engine, &mut out).await.unwrap();
        let fields: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(fields[0]["name"], "town");
        assert_eq!(fields[1]["name"], "pop2010");
    }
}
