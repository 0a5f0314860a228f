use crate::config::ClickHouseConfig;
use crate::sink::SinkError;
use crate::{Error, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, trace};

const USER_HEADER: &str = "X-ClickHouse-User";
const KEY_HEADER: &str = "X-ClickHouse-Key";

/// Minimal client for the ClickHouse HTTP interface.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    url: String,
    user: String,
    password: Option<String>,
    compression: bool,
}

impl ClickHouseClient {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            compression: config.compression,
        })
    }

    fn request(&self) -> RequestBuilder {
        let mut request = self.client.post(&self.url).header(USER_HEADER, &self.user);
        if let Some(password) = &self.password {
            request = request.header(KEY_HEADER, password);
        }
        request
    }

    /// Runs a statement that returns no rows (DDL).
    pub async fn execute(&self, statement: &str) -> std::result::Result<(), SinkError> {
        trace!(statement = %statement, "ClickHouse statement");
        let request = self
            .request()
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(statement.to_string());
        send(request).await
    }

    /// Inserts `rows` into `database.table` as `JSONCompactEachRow`.
    pub async fn insert(
        &self,
        database: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> std::result::Result<(), SinkError> {
        let query = insert_query(database, table, columns);
        let body = encode_rows(rows)?;
        let raw_len = body.len();

        let mut request = self
            .request()
            .query(&[
                ("query", query.as_str()),
                ("date_time_input_format", "best_effort"),
            ])
            .header(CONTENT_TYPE, "application/x-ndjson");

        let body = if self.compression {
            request = request.header(CONTENT_ENCODING, "gzip");
            gzip(&body)?
        } else {
            body
        };

        debug!(
            table = %table,
            rows = rows.len(),
            bytes = raw_len,
            sent_bytes = body.len(),
            "Inserting batch"
        );
        send(request.body(body)).await
    }
}

async fn send(request: RequestBuilder) -> std::result::Result<(), SinkError> {
    let response = request
        .send()
        .await
        .map_err(|e| SinkError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable response body: {}>", e));
    Err(SinkError::Rejected {
        status: status.as_u16(),
        message: message.trim().to_string(),
    })
}

pub(crate) fn insert_query(database: &str, table: &str, columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| format!("`{}`", c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO `{}`.`{}` ({}) FORMAT JSONCompactEachRow",
        database, table, columns
    )
}

/// One JSON array per line.
pub(crate) fn encode_rows(rows: &[Vec<Value>]) -> std::result::Result<Vec<u8>, SinkError> {
    let mut body = Vec::with_capacity(rows.len() * 64);
    for row in rows {
        serde_json::to_writer(&mut body, row).map_err(|e| SinkError::Encoding(e.to_string()))?;
        body.push(b'\n');
    }
    Ok(body)
}

fn gzip(data: &[u8]) -> std::result::Result<Vec<u8>, SinkError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| SinkError::Encoding(format!("gzip: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SinkError::Encoding(format!("gzip: {}", e)))
}
