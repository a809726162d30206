use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RawDataSink, RemoteDataSource, RemoteError, RemoteResult};
use crate::models::{Annotation, AppMetadata, DataPoint, Metric, Notification};

const DEFAULT_PAGE_SIZE: usize = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON/HTTP client for the analytics backend.
#[derive(Clone)]
pub struct HttpRemoteSource {
    base_url: String,
    api_key: Option<String>,
    page_size: usize,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct RawDataPage {
    points: Vec<DataPoint>,
    next: Option<String>,
}

#[derive(Debug, Serialize)]
struct AcknowledgeRequest<'a> {
    ids: &'a [String],
}

impl HttpRemoteSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            page_size: DEFAULT_PAGE_SIZE,
            http,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, entity: &str) -> RemoteResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| RemoteError::connectivity(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::authentication(
                format!("remote returned HTTP {}", response.status()),
            )),
            StatusCode::NOT_FOUND => Err(RemoteError::not_found(entity)),
            status => Err(RemoteError::connectivity(format!(
                "remote returned HTTP {}",
                status
            ))),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        entity: &str,
    ) -> RemoteResult<T> {
        self.send(request, entity)
            .await?
            .json::<T>()
            .await
            .map_err(|err| RemoteError::format(err.to_string()))
    }
}

#[async_trait]
impl RemoteDataSource for HttpRemoteSource {
    async fn fetch_metrics(&self) -> RemoteResult<Vec<Metric>> {
        let request = self.http.get(self.url("/metrics"));
        self.get_json(request, "metrics").await
    }

    async fn fetch_annotations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RemoteResult<Vec<Annotation>> {
        let request = self.http.get(self.url("/annotations")).query(&[
            ("from", from.timestamp_millis().to_string()),
            ("to", to.timestamp_millis().to_string()),
        ]);
        self.get_json(request, "annotations").await
    }

    async fn fetch_raw_data(
        &self,
        metric_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        sink: &dyn RawDataSink,
    ) -> RemoteResult<usize> {
        let url = self.url(&format!("/metrics/{}/data", metric_id));
        let mut cursor: Option<String> = None;
        let mut delivered = 0;

        loop {
            let mut query = vec![
                ("from", from.timestamp_millis().to_string()),
                ("to", to.timestamp_millis().to_string()),
                ("limit", self.page_size.to_string()),
            ];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }

            let request = self.http.get(&url).query(&query);
            let page: RawDataPage = self.get_json(request, metric_id).await?;
            let rows = page.points.len();
            debug!("Fetched {} raw rows for {}", rows, metric_id);

            if rows > 0 {
                delivered += rows;
                if !sink.accept(page.points).await {
                    break;
                }
            }

            match page.next {
                Some(next) if rows > 0 => cursor = Some(next),
                _ => break,
            }
        }

        Ok(delivered)
    }

    async fn fetch_notifications(&self) -> RemoteResult<Vec<Notification>> {
        let request = self.http.get(self.url("/notifications"));
        self.get_json(request, "notifications").await
    }

    async fn acknowledge_notifications(&self, ids: &[String]) -> RemoteResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let request = self
            .http
            .post(self.url("/notifications/acknowledge"))
            .json(&AcknowledgeRequest { ids });
        self.send(request, "notifications").await?;
        Ok(())
    }

    async fn fetch_app_metadata(&self) -> RemoteResult<AppMetadata> {
        let request = self.http.get(self.url("/metadata"));
        self.get_json(request, "metadata").await
    }

    fn source_name(&self) -> &str {
        "http"
    }
}
