use std::collections::HashMap;

use anyhow::Context;
use pt::{DbType, Peer, PeerConfig};
use tokio_postgres::{types, Client};

pub mod monitor;

pub use monitor::{CatalogMirrorMonitor, CdcBatchInfo};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

pub struct Catalog {
    pg: Box<Client>,
}

async fn run_migrations(client: &mut Client) -> anyhow::Result<()> {
    let migration_report = embedded::migrations::runner()
        .run_async(client)
        .await
        .context("Failed to run migrations")?;
    for migration in migration_report.applied_migrations() {
        tracing::info!(
            "Migration Applied -  Name: {}, Version: {}",
            migration.name(),
            migration.version()
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

fn get_connection_string(catalog_config: &CatalogConfig) -> String {
    let mut connection_string = String::new();
    connection_string.push_str("host=");
    connection_string.push_str(&catalog_config.host);
    connection_string.push_str(" port=");
    connection_string.push_str(&catalog_config.port.to_string());
    connection_string.push_str(" user=");
    connection_string.push_str(&catalog_config.user);
    connection_string.push_str(" password=");
    connection_string.push_str(&catalog_config.password);
    connection_string.push_str(" dbname=");
    connection_string.push_str(&catalog_config.database);
    connection_string
}

impl Catalog {
    pub async fn new(catalog_config: &CatalogConfig) -> anyhow::Result<Self> {
        Self::connect(&get_connection_string(catalog_config)).await
    }

    /// Connect with a libpq-style DSN, as handed down through the
    /// environment.
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        let (mut client, connection) =
            tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
                .await
                .context("Failed to connect to catalog database")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Connection error: {}", e);
            }
        });

        run_migrations(&mut client).await?;

        Ok(Self {
            pg: Box::new(client),
        })
    }

    pub async fn create_peer(&self, peer: &Peer) -> anyhow::Result<i64> {
        let options =
            serde_json::to_value(&peer.config).context("failed to serialize peer options")?;

        let stmt = self
            .pg
            .prepare_typed(
                "INSERT INTO peers (name, type, options) VALUES ($1, $2, $3) \
                 ON CONFLICT (name) DO UPDATE SET type = $2, options = $3",
                &[types::Type::TEXT, types::Type::TEXT, types::Type::JSONB],
            )
            .await?;

        self.pg
            .execute(&stmt, &[&peer.name, &peer.r#type.as_str_name(), &options])
            .await?;

        self.get_peer_id(&peer.name).await
    }

    pub async fn get_peer_id(&self, peer_name: &str) -> anyhow::Result<i64> {
        let stmt = self
            .pg
            .prepare_typed("SELECT id FROM peers WHERE name = $1", &[types::Type::TEXT])
            .await?;

        let id: i32 = self
            .pg
            .query_opt(&stmt, &[&peer_name])
            .await?
            .map(|row| row.get(0))
            .context("Failed to get peer id")?;

        Ok(id as i64)
    }

    pub async fn get_peer(&self, peer_name: &str) -> anyhow::Result<Option<Peer>> {
        let stmt = self
            .pg
            .prepare_typed(
                "SELECT name, type, options FROM peers WHERE name = $1",
                &[types::Type::TEXT],
            )
            .await?;
        let row = self.pg.query_opt(&stmt, &[&peer_name]).await?;
        row.map(peer_from_row).transpose()
    }

    pub async fn get_peers(&self) -> anyhow::Result<HashMap<String, Peer>> {
        let rows = self
            .pg
            .query("SELECT name, type, options FROM peers", &[])
            .await?;

        let mut peers = HashMap::new();
        for row in rows {
            let peer = peer_from_row(row)?;
            peers.insert(peer.name.clone(), peer);
        }
        Ok(peers)
    }

    pub async fn create_flow_entry(
        &self,
        flow_job_name: &str,
        workflow_id: &str,
        source_peer: &str,
        destination_peer: &str,
        config: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.pg
            .execute(
                "INSERT INTO flows (name, workflow_id, source_peer, destination_peer, config) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &flow_job_name,
                    &workflow_id,
                    &source_peer,
                    &destination_peer,
                    config,
                ],
            )
            .await
            .context("failed to insert flow entry")?;
        Ok(())
    }

    pub async fn get_flow_entries(&self) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
        let rows = self
            .pg
            .query("SELECT name, config FROM flows ORDER BY id", &[])
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect())
    }

    pub async fn get_flow_workflow_id(&self, flow_job_name: &str) -> anyhow::Result<Option<String>> {
        let row = self
            .pg
            .query_opt(
                "SELECT workflow_id FROM flows WHERE name = $1",
                &[&flow_job_name],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn delete_flow_entry(&self, flow_job_name: &str) -> anyhow::Result<()> {
        self.pg
            .execute("DELETE FROM flows WHERE name = $1", &[&flow_job_name])
            .await?;
        // monitoring rows cascade from cdc_flows
        self.pg
            .execute(
                "DELETE FROM peerdb_stats.cdc_flows WHERE flow_name = $1",
                &[&flow_job_name],
            )
            .await?;
        Ok(())
    }

    pub(crate) fn client(&self) -> &Client {
        &self.pg
    }
}

fn peer_from_row(row: tokio_postgres::Row) -> anyhow::Result<Peer> {
    let name: String = row.get(0);
    let type_name: String = row.get(1);
    let options: serde_json::Value = row.get(2);
    let config: PeerConfig =
        serde_json::from_value(options).context("failed to decode peer options")?;
    let r#type = match type_name.as_str() {
        "POSTGRES" => DbType::Postgres,
        "SNOWFLAKE" => DbType::Snowflake,
        "BIGQUERY" => DbType::Bigquery,
        "S3" => DbType::S3,
        "EVENTHUB" => DbType::Eventhub,
        other => anyhow::bail!("unknown peer type {}", other),
    };
    Ok(Peer {
        name,
        r#type,
        config,
    })
}
