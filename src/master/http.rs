use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{ChangeSet, FetchError, FetchResult, MasterDataSource, Row, RowSet};

/// Master data over HTTP:
///
/// - `GET  {base}/masters/{id}?columns=a,b`
/// - `GET  {base}/masters/{id}/partition?{column}={value}`
/// - `HEAD {base}/masters/{id}` (version in `ETag`)
/// - `GET  {base}/masters/{id}/changes?since=...`
pub struct HttpMasterSource {
    client: Client,
    base_url: String,
}

/// Rows come back either bare or wrapped with their version.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum RowsBody {
    Envelope {
        #[serde(default)]
        version: Option<String>,
        rows: Vec<Row>,
    },
    Rows(Vec<Row>),
}

impl From<RowsBody> for RowSet {
    fn from(body: RowsBody) -> Self {
        match body {
            RowsBody::Envelope { version, rows } => RowSet { version, rows },
            RowsBody::Rows(rows) => RowSet::new(rows),
        }
    }
}

impl HttpMasterSource {
    pub fn new(base_url: &str, timeout: Duration) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, dataset: &str, suffix: &str) -> String {
        format!("{}/masters/{}{}", self.base_url, dataset, suffix)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        dataset: &str,
        query: &[(&str, &str)],
    ) -> FetchResult<T> {
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;

        match response.status() {
            StatusCode::OK => decode(url, response).await,
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(dataset.to_string())),
            status => Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl MasterDataSource for HttpMasterSource {
    async fn fetch(&self, dataset: &str, columns: &[String]) -> FetchResult<RowSet> {
        let url = self.url(dataset, "");
        let columns = columns.join(",");
        let query: Vec<(&str, &str)> = if columns.is_empty() {
            Vec::new()
        } else {
            vec![("columns", columns.as_str())]
        };
        let body: RowsBody = self.get_json(&url, dataset, &query).await?;
        Ok(body.into())
    }

    async fn fetch_partition(
        &self,
        dataset: &str,
        column: &str,
        value: &str,
    ) -> FetchResult<RowSet> {
        let url = self.url(dataset, "/partition");
        let body: RowsBody = self.get_json(&url, dataset, &[(column, value)]).await?;
        Ok(body.into())
    }

    async fn version(&self, dataset: &str) -> FetchResult<Option<String>> {
        let url = self.url(dataset, "");
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        match response.status() {
            StatusCode::OK => Ok(response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|etag| etag.trim_start_matches("W/").trim_matches('"').to_string())),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(dataset.to_string())),
            status => Err(FetchError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    async fn changes(&self, dataset: &str, since: &str) -> FetchResult<ChangeSet> {
        let url = self.url(dataset, "/changes");
        self.get_json(&url, dataset, &[("since", since)]).await
    }
}

fn request_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(url.to_string())
    } else {
        FetchError::Request {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

async fn decode<T: DeserializeOwned>(url: &str, response: Response) -> FetchResult<T> {
    response.json::<T>().await.map_err(|e| FetchError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_body_shapes() {
        let bare: RowsBody = serde_json::from_value(json!([{"state": "Goa"}])).unwrap();
        let set: RowSet = bare.into();
        assert_eq!(set.len(), 1);
        assert_eq!(set.version, None);

        let wrapped: RowsBody =
            serde_json::from_value(json!({"version": "7", "rows": [{"state": "Goa"}]})).unwrap();
        let set: RowSet = wrapped.into();
        assert_eq!(set.version.as_deref(), Some("7"));
    }

    #[test]
    fn test_url_layout() {
        let source = HttpMasterSource::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            source.url("districts", "/partition"),
            "http://localhost:8080/masters/districts/partition"
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_fetch_error() {
        let source = HttpMasterSource::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = source.fetch("districts", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Request { .. } | FetchError::Timeout(_)
        ));
    }
}
