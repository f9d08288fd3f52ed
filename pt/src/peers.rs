use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbType {
    Postgres,
    Snowflake,
    Bigquery,
    S3,
    Eventhub,
}

impl DbType {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            DbType::Postgres => "POSTGRES",
            DbType::Snowflake => "SNOWFLAKE",
            DbType::Bigquery => "BIGQUERY",
            DbType::S3 => "S3",
            DbType::Eventhub => "EVENTHUB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    pub account_id: String,
    pub username: String,
    pub private_key: String,
    /// Passphrase for an encrypted private key.
    pub password: Option<String>,
    pub database: String,
    pub warehouse: String,
    pub role: String,
    /// Query timeout in seconds.
    pub query_timeout: u64,
    /// Storage integration used by COPY INTO for Avro staging.
    pub s3_integration: String,
}

/// Peer-specific connection options. The connector registered for the
/// peer type is the only component that interprets these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerConfig {
    Postgres(PostgresConfig),
    Snowflake(SnowflakeConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub r#type: DbType,
    pub config: PeerConfig,
}

impl Peer {
    pub fn postgres_config(&self) -> Option<&PostgresConfig> {
        match &self.config {
            PeerConfig::Postgres(config) => Some(config),
            _ => None,
        }
    }

    pub fn snowflake_config(&self) -> Option<&SnowflakeConfig> {
        match &self.config {
            PeerConfig::Snowflake(config) => Some(config),
            _ => None,
        }
    }
}
