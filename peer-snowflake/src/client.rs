//! Thin client for the Snowflake SQL statements API.

use std::cmp::min;
use std::time::Duration;

use anyhow::anyhow;
use pt::SnowflakeConfig;
use reqwest::{header, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::info;

use crate::auth::SnowflakeAuth;

const DEFAULT_REFRESH_THRESHOLD: u64 = 3000;
const DEFAULT_EXPIRY_THRESHOLD: u64 = 3600;
const SNOWFLAKE_URL_PREFIX: &str = "https://";
const SNOWFLAKE_URL_SUFFIX: &str = ".snowflakecomputing.com/api/v2/statements";

const DATE_OUTPUT_FORMAT: &str = "YYYY/MM/DD";
const TIME_OUTPUT_FORMAT: &str = "HH:MI:SS.FF";
const TIMESTAMP_OUTPUT_FORMAT: &str = "YYYY-MM-DDTHH24:MI:SS.FF";
const TIMESTAMP_TZ_OUTPUT_FORMAT: &str = "YYYY-MM-DDTHH24:MI:SS.FFTZHTZM";

#[derive(Debug, Serialize)]
struct SQLStatementParameters<'a> {
    pub date_output_format: &'a str,
    pub time_output_format: &'a str,
    pub timestamp_ltz_output_format: &'a str,
    pub timestamp_ntz_output_format: &'a str,
    pub timestamp_tz_output_format: &'a str,
    /// "0" executes every statement of a multi-statement request.
    #[serde(rename = "MULTI_STATEMENT_COUNT", skip_serializing_if = "Option::is_none")]
    pub multi_statement_count: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SQLStatement<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    warehouse: &'a str,
    role: &'a str,
    parameters: SQLStatementParameters<'a>,
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct QueryStatus {
    statementHandle: String,
}

#[allow(non_snake_case)]
#[derive(Clone, Deserialize, Debug)]
pub struct ResultSetRowType {
    pub name: String,
    pub r#type: String,
}

#[allow(non_snake_case)]
#[derive(Deserialize, Debug, Default)]
pub struct ResultSetMetadata {
    #[serde(default)]
    pub rowType: Vec<ResultSetRowType>,
}

#[allow(non_snake_case, dead_code)]
#[derive(Deserialize, Debug)]
pub struct ResultSet {
    pub statementHandle: String,
    #[serde(default)]
    pub data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    pub resultSetMetaData: ResultSetMetadata,
}

enum QueryAttemptResult {
    ResultSetReceived(Box<ResultSet>),
    KeepPolling,
    ErrorRetry,
    ErrorAbort { error_message: String },
}

/// One logical connection to the statements endpoint. Requests that need
/// transactional atomicity are sent as a single multi-statement request
/// wrapped in BEGIN/COMMIT, which Snowflake runs on one session.
pub struct SqlApiClient {
    endpoint_url: String,
    auth: SnowflakeAuth,
    query_timeout: u64,
    database: String,
    warehouse: String,
    role: String,
    reqwest_client: reqwest::Client,
}

impl SqlApiClient {
    pub fn new(config: &SnowflakeConfig) -> anyhow::Result<Self> {
        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(
            "X-Snowflake-Authorization-Token-Type",
            header::HeaderValue::from_static("KEYPAIR_JWT"),
        );
        // Snowflake rejects requests without a user agent.
        default_headers.insert(
            reqwest::header::USER_AGENT,
            header::HeaderValue::from_static("reqwest"),
        );

        let reqwest_client = reqwest::ClientBuilder::new()
            .gzip(true)
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            endpoint_url: format!(
                "{}{}{}",
                SNOWFLAKE_URL_PREFIX, config.account_id, SNOWFLAKE_URL_SUFFIX
            ),
            auth: SnowflakeAuth::new(
                config.account_id.clone(),
                config.username.clone(),
                &config.private_key,
                config.password.as_deref(),
                DEFAULT_REFRESH_THRESHOLD,
                DEFAULT_EXPIRY_THRESHOLD,
            )?,
            query_timeout: config.query_timeout,
            database: config.database.clone(),
            warehouse: config.warehouse.clone(),
            role: config.role.clone(),
            reqwest_client,
        })
    }

    /// Execute a single statement and return its result set.
    #[tracing::instrument(name = "peer_sflake::execute", skip_all)]
    pub async fn execute(&self, statement: &str) -> anyhow::Result<ResultSet> {
        self.process_statement(statement, None).await
    }

    /// Execute statements atomically in one BEGIN/COMMIT block. A retry of
    /// the whole request re-runs the whole transaction.
    #[tracing::instrument(name = "peer_sflake::execute_transaction", skip_all)]
    pub async fn execute_transaction(&self, statements: &[String]) -> anyhow::Result<()> {
        let mut block = String::from("BEGIN;\n");
        for statement in statements {
            block.push_str(statement.trim_end_matches(';'));
            block.push_str(";\n");
        }
        block.push_str("COMMIT;");
        self.process_statement(&block, Some("0")).await?;
        Ok(())
    }

    pub async fn query_scalar_i64(&self, statement: &str) -> anyhow::Result<Option<i64>> {
        let result_set = self.execute(statement).await?;
        match result_set.data.first().and_then(|row| row.first()) {
            Some(Some(text)) => Ok(Some(text.parse::<i64>()?)),
            _ => Ok(None),
        }
    }

    pub async fn query_scalar_bool(&self, statement: &str) -> anyhow::Result<bool> {
        let result_set = self.execute(statement).await?;
        match result_set.data.first().and_then(|row| row.first()) {
            Some(Some(text)) => Ok(text == "true" || text == "TRUE" || text == "1"),
            _ => Ok(false),
        }
    }

    pub async fn query_column_strings(&self, statement: &str) -> anyhow::Result<Vec<String>> {
        let result_set = self.execute(statement).await?;
        Ok(result_set
            .data
            .iter()
            .filter_map(|row| row.first().cloned().flatten())
            .collect())
    }

    async fn process_statement(
        &self,
        statement: &str,
        multi_statement_count: Option<&str>,
    ) -> anyhow::Result<ResultSet> {
        // a 400 from the statements endpoint means the submission itself
        // failed, resubmit a bounded number of times
        for _attempt in 0..3 {
            let query_status = self.submit(statement, multi_statement_count).await?;
            match self.query_poll(query_status).await? {
                Some(result_set) => return Ok(result_set),
                None => continue,
            }
        }
        Err(anyhow!("statement submission kept failing, giving up"))
    }

    async fn submit(
        &self,
        statement: &str,
        multi_statement_count: Option<&str>,
    ) -> anyhow::Result<QueryStatus> {
        let mut auth = self.auth.clone();
        let jwt = auth.get_jwt()?;
        let secret = jwt.expose_secret();

        let response = self
            .reqwest_client
            .post(self.endpoint_url.to_owned())
            .bearer_auth(secret)
            .query(&[("async", "true")])
            .json(&SQLStatement {
                statement,
                timeout: self.query_timeout,
                database: &self.database,
                warehouse: &self.warehouse,
                role: &self.role,
                parameters: SQLStatementParameters {
                    date_output_format: DATE_OUTPUT_FORMAT,
                    time_output_format: TIME_OUTPUT_FORMAT,
                    timestamp_ltz_output_format: TIMESTAMP_TZ_OUTPUT_FORMAT,
                    timestamp_ntz_output_format: TIMESTAMP_OUTPUT_FORMAT,
                    timestamp_tz_output_format: TIMESTAMP_TZ_OUTPUT_FORMAT,
                    multi_statement_count,
                },
            })
            .send()
            .await
            .map_err(|e| anyhow!("failed to submit statement: {:?}", e))?;

        let body = response.json::<serde_json::Value>().await?;
        serde_json::from_value(body.clone())
            .map_err(|e| anyhow!("failed to parse statement status {:?}: {:?}", body, e))
    }

    async fn query_attempt(&self, query_status: &QueryStatus) -> anyhow::Result<QueryAttemptResult> {
        let mut auth = self.auth.clone();
        let jwt = auth.get_jwt()?;
        let secret = jwt.expose_secret();
        let response = self
            .reqwest_client
            .get(format!(
                "{}/{}",
                self.endpoint_url, query_status.statementHandle
            ))
            .bearer_auth(secret)
            .send()
            .await?;
        if response.status() == StatusCode::OK {
            Ok(QueryAttemptResult::ResultSetReceived(Box::new(
                response.json::<ResultSet>().await?,
            )))
        } else if response.status() == StatusCode::ACCEPTED {
            Ok(QueryAttemptResult::KeepPolling)
        } else if response.status() == StatusCode::BAD_REQUEST {
            Ok(QueryAttemptResult::ErrorRetry)
        } else if response.status().is_client_error() || response.status().is_server_error() {
            Ok(QueryAttemptResult::ErrorAbort {
                error_message: format!(
                    "unexpected response: {}\n{}",
                    response.status().as_str(),
                    response.text().await?
                ),
            })
        } else {
            Err(anyhow!("unhandled response status {}", response.status()))
        }
    }

    #[tracing::instrument(name = "peer_sflake::query_poll", skip_all)]
    async fn query_poll(&self, query_status: QueryStatus) -> anyhow::Result<Option<ResultSet>> {
        info!(
            "polling for statement with handle {}",
            query_status.statementHandle
        );
        let mut poll_count: u8 = 0;

        let mut delay_ms: u64 = 50;
        let multiplier: u64 = 2;
        let max_delay_ms: u64 = 16_000;
        let mut remaining_ms: u64 = self.query_timeout * 1000;

        while remaining_ms > 0 || poll_count < 5 {
            poll_count += 1;
            match self.query_attempt(&query_status).await? {
                QueryAttemptResult::ResultSetReceived(result_set) => return Ok(Some(*result_set)),
                QueryAttemptResult::KeepPolling => {
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = min(delay_ms * multiplier, max_delay_ms);
                    remaining_ms = remaining_ms.saturating_sub(delay_ms);
                }
                QueryAttemptResult::ErrorRetry => return Ok(None),
                QueryAttemptResult::ErrorAbort { error_message } => {
                    return Err(anyhow!(error_message))
                }
            }
        }
        Err(anyhow!("timed out waiting for statement result"))
    }
}
