use super::engine;
use clap::Args;
use dbasset_query::{ConnectionInfo, QueryEngine};
use std::io::Write;

#[derive(Args, Debug)]
pub struct TablesCommand {
    /// Database URI
    #[arg(long, env = "DBASSET_URI")]
    pub uri: String,

    /// Connector type, skipping dialect resolution
    #[arg(long = "type")]
    pub connector_type: Option<String>,

    /// Include catalog and system tables
    #[arg(long)]
    pub internal: bool,
}

impl TablesCommand {
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
        let mut info = ConnectionInfo::new(&self.uri);
        if let Some(connector_type) = &self.connector_type {
            info = info.with_type(connector_type);
        }
        let listing = engine.list_tables(&info, self.internal).await?;
        serde_json::to_writer_pretty(&mut *out, &listing)?;
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

    #[tokio::test]
    async fn test_list_sqlite_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("census.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE towns (town TEXT); CREATE VIEW big AS SELECT * FROM towns;")
            .unwrap();

        let engine = QueryEngine::new(registry(), EngineConfig::default());
        let command = TablesCommand {
            uri: format!("sqlite:///{}", path.display()),
            connector_type: None,
            internal: false,
        };
        let mut out = Vec::new();
        command.run(&engine, &mut out).await.unwrap();
        let listing: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(listing[0]["source"], "census.db");
        assert_eq!(listing[0]["tables"][0]["name"], "big");
        assert_eq!(listing[0]["tables"][1]["name"], "towns");
    }
}
