use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, error, info};

use super::query::{FluxQuery, QueryBuildError};
use super::{round2, to_mbps, TelemetryRecord, TelemetrySource};
use crate::config::{ConfigError, InfluxConfig};

const DOWNLOAD_FIELD: &str = "DownloadBandwidth";
const UPLOAD_FIELD: &str = "UploadBandwidth";
const PING_FIELD: &str = "PingLatency";

const LATEST_QUERY: &str = r#"from(bucket: ${bucket})
  |> range(start: -1d)
  |> filter(fn: (r) => r._measurement == ${measurement})
  |> filter(fn: (r) => r._field == ${download} or r._field == ${upload} or r._field == ${ping})
  |> pivot(rowKey: ["_time"], columnKey: ["_field"], valueColumn: "_value")
  |> group()
  |> sort(columns: ["_time"], desc: true)
  |> limit(n: 1)"#;

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("query request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("InfluxDB returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to parse query response: {0}")]
    Parse(String),

    #[error("failed to build query: {0}")]
    Query(#[from] QueryBuildError),
}

/// Validated connection settings for the store.
#[derive(Debug, Clone)]
struct Endpoint {
    query_url: Url,
    token: String,
    bucket: String,
    measurement: String,
}

impl Endpoint {
    fn from_config(config: &InfluxConfig) -> Result<Self, ConfigError> {
        let raw_url = config
            .url
            .as_deref()
            .ok_or(ConfigError::Missing("InfluxDB URL"))?;
        let token = config
            .token
            .clone()
            .ok_or(ConfigError::Missing("InfluxDB token"))?;
        let org = config
            .org
            .clone()
            .ok_or(ConfigError::Missing("InfluxDB org"))?;
        let bucket = config
            .bucket
            .clone()
            .ok_or(ConfigError::Missing("InfluxDB bucket"))?;
        let measurement = config
            .measurement
            .clone()
            .ok_or(ConfigError::Missing("InfluxDB measurement"))?;

        let base = Url::parse(raw_url).map_err(|e| ConfigError::InvalidUri {
            uri: raw_url.to_string(),
            reason: e.to_string(),
        })?;
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::UnsupportedScheme {
                    scheme: other.to_string(),
                    expected: "http, https",
                })
            }
        }
        if base.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidUri {
                uri: raw_url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        // Keep any reverse-proxy prefix in front of the API path
        let mut query_url = base.clone();
        query_url.set_path(&format!(
            "{}/api/v2/query",
            base.path().trim_end_matches('/')
        ));
        query_url.set_fragment(None);
        query_url.set_query(None);
        query_url.query_pairs_mut().append_pair("org", &org);

        Ok(Self {
            query_url,
            token,
            bucket,
            measurement,
        })
    }

    fn latest_query(&self) -> FluxQuery {
        FluxQuery::new(LATEST_QUERY)
            .bind("bucket", self.bucket.as_str())
            .bind("measurement", self.measurement.as_str())
            .bind("download", DOWNLOAD_FIELD)
            .bind("upload", UPLOAD_FIELD)
            .bind("ping", PING_FIELD)
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    #[serde(rename = "type")]
    query_type: &'static str,
    dialect: Dialect,
}

#[derive(Serialize)]
struct Dialect {
    header: bool,
    annotations: Vec<String>,
    delimiter: &'static str,
}

/// Telemetry reader backed by the InfluxDB 2.x HTTP query API.
pub struct InfluxReader {
    client: reqwest::Client,
    endpoint: Option<Endpoint>,
}

impl InfluxReader {
    /// Never fails: an incomplete configuration leaves the reader disabled.
    pub fn new(config: &InfluxConfig) -> Self {
        let endpoint = match Endpoint::from_config(config) {
            Ok(endpoint) => {
                info!("InfluxDB reader targeting {}", endpoint.query_url);
                Some(endpoint)
            }
            Err(e) => {
                error!("InfluxDB reader disabled: {}", e);
                None
            }
        };
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn fetch(&self, endpoint: &Endpoint) -> Result<String, ReaderError> {
        let query = endpoint.latest_query().render()?;
        debug!("Running Flux query:\n{}", query);

        let request = QueryRequest {
            query: &query,
            query_type: "flux",
            dialect: Dialect {
                header: true,
                annotations: Vec::new(),
                delimiter: ",",
            },
        };

        let response = self
            .client
            .post(endpoint.query_url.clone())
            .header("Authorization", format!("Token {}", endpoint.token))
            .header("Accept", "application/csv")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReaderError::Status { status, body });
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl TelemetrySource for InfluxReader {
    async fn latest(&self) -> Result<Option<TelemetryRecord>, ReaderError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(None);
        };
        let body = self.fetch(endpoint).await?;
        parse_latest(&body)
    }
}

/// Column positions of one CSV table.
struct Columns {
    time: usize,
    download: usize,
    upload: usize,
    ping: usize,
}

impl Columns {
    fn from_header(header: &csv::StringRecord) -> Option<Self> {
        let position = |name: &str| header.iter().position(|h| h == name);
        Some(Self {
            time: position("_time")?,
            download: position(DOWNLOAD_FIELD)?,
            upload: position(UPLOAD_FIELD)?,
            ping: position(PING_FIELD)?,
        })
    }

    fn record(&self, row: &csv::StringRecord) -> Option<TelemetryRecord> {
        let number = |idx: usize| row.get(idx)?.trim().parse::<f64>().ok();
        let timestamp = DateTime::parse_from_rfc3339(row.get(self.time)?.trim())
            .ok()?
            .with_timezone(&Utc);
        Some(TelemetryRecord {
            timestamp,
            download_bandwidth: to_mbps(number(self.download)?),
            upload_bandwidth: to_mbps(number(self.upload)?),
            ping_latency: round2(number(self.ping)?),
        })
    }
}

fn is_header(row: &csv::StringRecord) -> bool {
    row.iter().any(|f| f == "_time") && row.iter().any(|f| f == "result")
}

/// Parse a CSV query response and return the newest complete record.
///
/// The response may hold several tables, each introduced by its own header
/// row and separated by blank lines. Rows lacking one of the fields are
/// skipped.
pub fn parse_latest(body: &str) -> Result<Option<TelemetryRecord>, ReaderError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut columns: Option<Columns> = None;
    let mut latest: Option<TelemetryRecord> = None;

    for row in reader.records() {
        let row = row.map_err(|e| ReaderError::Parse(e.to_string()))?;
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        if is_header(&row) {
            columns = Columns::from_header(&row);
            if columns.is_none() {
                debug!("Skipping table without telemetry columns");
            }
            continue;
        }
        // Error tables come back with an "error" header instead of "_time"
        if columns.is_none() && row.iter().any(|f| f == "error") {
            return Err(ReaderError::Parse(format!(
                "query error table: {}",
                row.iter().collect::<Vec<_>>().join(",")
            )));
        }
        let Some(cols) = &columns else {
            continue;
        };
        match cols.record(&row) {
            Some(record) => {
                if latest
                    .as_ref()
                    .map_or(true, |current| record.timestamp > current.timestamp)
                {
                    latest = Some(record);
                }
            }
            None => debug!("Skipping incomplete row: {:?}", row),
        }
    }

    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SINGLE_ROW: &str = "\
,result,table,_start,_stop,_time,_measurement,DownloadBandwidth,PingLatency,UploadBandwidth\r
,_result,0,2024-01-01T00:00:00Z,2024-01-02T00:00:00Z,2024-01-01T10:00:00Z,speedtest,100000,12.3,50000\r
\r
";

    fn full_config() -> InfluxConfig {
        InfluxConfig {
            url: Some("http://influx.local:8086".to_string()),
            org: Some("home".to_string()),
            bucket: Some("net".to_string()),
            measurement: Some("speedtest".to_string()),
            token: Some("secret".to_string()),
        }
    }

    #[test]
    fn test_parse_converts_units() {
        let record = parse_latest(SINGLE_ROW).unwrap().unwrap();
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(record.download_bandwidth, 0.8);
        assert_eq!(record.upload_bandwidth, 0.4);
        assert_eq!(record.ping_latency, 12.3);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let first = parse_latest(SINGLE_ROW).unwrap();
        let second = parse_latest(SINGLE_ROW).unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_empty_response() {
        assert_eq!(parse_latest("").unwrap(), None);
        assert_eq!(parse_latest("\r\n\r\n").unwrap(), None);
    }

    #[test]
    fn test_parse_header_only() {
        let body = ",result,table,_time,DownloadBandwidth,PingLatency,UploadBandwidth\r\n";
        assert_eq!(parse_latest(body).unwrap(), None);
    }

    #[test]
    fn test_parse_picks_newest_across_tables() {
        let body = "\
,result,table,_time,DownloadBandwidth,PingLatency,UploadBandwidth
,_result,0,2024-01-01T08:00:00Z,1000000,20,500000

,result,table,_time,DownloadBandwidth,PingLatency,UploadBandwidth
,_result,1,2024-01-01T09:30:00Z,2000000,10,750000
,_result,1,2024-01-01T09:00:00Z,3000000,11,800000
";
        let record = parse_latest(body).unwrap().unwrap();
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap()
        );
        assert_eq!(record.download_bandwidth, 16.0);
        assert_eq!(record.upload_bandwidth, 6.0);
        assert_eq!(record.ping_latency, 10.0);
    }

    #[test]
    fn test_parse_skips_incomplete_rows() {
        let body = "\
,result,table,_time,DownloadBandwidth,PingLatency,UploadBandwidth
,_result,0,2024-01-01T11:00:00Z,,9,500000
,_result,0,2024-01-01T10:00:00Z,1000000,20,500000
";
        let record = parse_latest(body).unwrap().unwrap();
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_error_table() {
        let body = "error,reference\r\nfailed to compile query,\r\n";
        assert!(matches!(
            parse_latest(body),
            Err(ReaderError::Parse(_))
        ));
    }

    #[test]
    fn test_endpoint_from_full_config() {
        let endpoint = Endpoint::from_config(&full_config()).unwrap();
        assert_eq!(
            endpoint.query_url.as_str(),
            "http://influx.local:8086/api/v2/query?org=home"
        );
        let query = endpoint.latest_query().render().unwrap();
        assert!(query.starts_with(r#"from(bucket: "net")"#));
        assert!(query.contains(r#"r._measurement == "speedtest""#));
        assert!(query.contains(r#"r._field == "PingLatency""#));
        assert!(query.contains("range(start: -1d)"));
        assert!(query.contains("limit(n: 1)"));
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let mut config = full_config();
        config.url = Some("https://proxy.local/influx".to_string());
        let endpoint = Endpoint::from_config(&config).unwrap();
        assert_eq!(
            endpoint.query_url.as_str(),
            "https://proxy.local/influx/api/v2/query?org=home"
        );

        config.url = Some("http://influx.local:8086/".to_string());
        let endpoint = Endpoint::from_config(&config).unwrap();
        assert_eq!(
            endpoint.query_url.as_str(),
            "http://influx.local:8086/api/v2/query?org=home"
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_scheme() {
        let mut config = full_config();
        config.url = Some("ftp://influx.local".to_string());
        assert!(matches!(
            Endpoint::from_config(&config),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_endpoint_requires_every_field() {
        let mut config = full_config();
        config.measurement = None;
        assert_eq!(
            Endpoint::from_config(&config).unwrap_err(),
            ConfigError::Missing("InfluxDB measurement")
        );
    }

    #[tokio::test]
    async fn test_disabled_reader_returns_none() {
        let reader = InfluxReader::new(&InfluxConfig::default());
        assert!(!reader.is_enabled());
        assert_eq!(reader.latest().await.unwrap(), None);
        assert_eq!(reader.latest().await.unwrap(), None);
    }
}
