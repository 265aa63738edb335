//! Cloudflare-style REST backend.
//!
//! The endpoint keeps one whole snapshot and detects conflicts itself: a
//! submit carries the watermark the client last saw, and the server answers
//! `conflict: true` when its own timestamp has moved on.

use crate::model::app_data::AppData;
use crate::model::record::Timestamp;
use crate::sync::backend::{RemoteBackend, WriteOutcome};
use crate::sync::config::{BackendKind, CloudflareConfig, SyncOptions};
use crate::sync::error::{SyncError, SyncResult};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SYNC_ROUTE: &str = "/api/sync";
const API_KEY_HEADER: &str = "X-API-Key";

/// Body of `POST /api/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    /// Watermark the client last agreed on with the server.
    pub last_synced: Option<Timestamp>,
    pub data: AppData,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

/// Server answer to both GET and POST.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub last_synced: Option<Timestamp>,
    #[serde(default)]
    pub data: Option<AppData>,
    #[serde(default)]
    pub conflict: bool,
}

/// Transport seam over the sync endpoint.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    /// Current remote state; `None` when the server has no data yet.
    /// `last_synced` travels as the `lastSynced` query parameter.
    async fn fetch(&self, last_synced: Option<Timestamp>) -> SyncResult<Option<SyncResponse>>;

    async fn submit(&self, payload: &SyncPayload) -> SyncResult<SyncResponse>;
}

/// `SyncEndpoint` over HTTP.
pub struct HttpSyncEndpoint {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpSyncEndpoint {
    pub fn new(config: &CloudflareConfig, options: &SyncOptions) -> SyncResult<Self> {
        let mut builder = Client::builder().user_agent(options.user_agent.as_str());
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| SyncError::Configuration(format!("http client: {err}")))?;

        Ok(Self {
            client,
            url: format!("{}{SYNC_ROUTE}", config.base_url()),
            api_key: config.api_key().map(str::to_string),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }
}

#[async_trait]
impl SyncEndpoint for HttpSyncEndpoint {
    async fn fetch(&self, last_synced: Option<Timestamp>) -> SyncResult<Option<SyncResponse>> {
        let mut request = self.client.get(&self.url);
        if let Some(last_synced) = last_synced {
            request = request.query(&[("lastSynced", last_synced.to_rfc3339())]);
        }
        let response = self.authorize(request).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode_response("GET", response).await.map(Some)
    }

    async fn submit(&self, payload: &SyncPayload) -> SyncResult<SyncResponse> {
        let request = self.client.post(&self.url).json(payload);
        let response = self.authorize(request).send().await?;
        if response.status() == StatusCode::CONFLICT {
            // Some deployments signal conflicts with 409 instead of a flag.
            return Ok(SyncResponse {
                conflict: true,
                ..SyncResponse::default()
            });
        }
        decode_response("POST", response).await
    }
}

async fn decode_response(op: &str, response: Response) -> SyncResult<SyncResponse> {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(SyncError::Configuration(format!(
                "sync endpoint rejected the API key ({status}) on {op}"
            )))
        }
        status if !status.is_success() => {
            return Err(SyncError::Network(format!(
                "{op} {SYNC_ROUTE} returned {status}"
            )))
        }
        _ => {}
    }
    let body = response.text().await?;
    serde_json::from_str(&body)
        .map_err(|err| SyncError::Validation(format!("{op} {SYNC_ROUTE} body: {err}")))
}

/// Whole-snapshot backend over a `SyncEndpoint`.
pub struct CloudflareBackend {
    endpoint: Arc<dyn SyncEndpoint>,
}

impl CloudflareBackend {
    pub fn new(endpoint: Arc<dyn SyncEndpoint>) -> Self {
        Self { endpoint }
    }

    pub fn from_config(config: &CloudflareConfig, options: &SyncOptions) -> SyncResult<Self> {
        let endpoint = HttpSyncEndpoint::new(config, options)?;
        Ok(Self::new(Arc::new(endpoint)))
    }

    async fn submit(&self, payload: SyncPayload) -> SyncResult<Option<Timestamp>> {
        let outgoing_stamp = payload.data.last_synced;
        let response = self.endpoint.submit(&payload).await?;
        if response.conflict {
            return Ok(None);
        }
        let remote_timestamp = response.last_synced.or(outgoing_stamp).ok_or_else(|| {
            SyncError::Validation("server accepted the snapshot without a lastSynced".to_string())
        })?;
        Ok(Some(remote_timestamp))
    }
}

#[async_trait]
impl RemoteBackend for CloudflareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloudflare
    }

    async fn read_remote_timestamp(
        &self,
        local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<Timestamp>> {
        Ok(self
            .endpoint
            .fetch(local_watermark)
            .await?
            .and_then(|response| response.last_synced))
    }

    async fn read_remote_snapshot(
        &self,
        local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<AppData>> {
        let Some(response) = self.endpoint.fetch(local_watermark).await? else {
            return Ok(None);
        };
        if response.last_synced.is_none() && response.data.is_none() {
            return Ok(None);
        }
        let data = response.data.unwrap_or_default();
        Ok(Some(data.with_watermark(response.last_synced)))
    }

    async fn write_remote_snapshot(
        &self,
        snapshot: &AppData,
        expected: Option<Timestamp>,
    ) -> SyncResult<WriteOutcome> {
        let payload = SyncPayload {
            last_synced: expected,
            data: snapshot.clone(),
            force: false,
        };
        Ok(match self.submit(payload).await? {
            Some(remote_timestamp) => WriteOutcome::Written { remote_timestamp },
            None => {
                debug!("event=cloudflare_write module=cloudflare status=conflict");
                WriteOutcome::Conflict
            }
        })
    }

    async fn force_write_remote_snapshot(&self, snapshot: &AppData) -> SyncResult<Timestamp> {
        let payload = SyncPayload {
            last_synced: snapshot.last_synced,
            data: snapshot.clone(),
            force: true,
        };
        self.submit(payload).await?.ok_or_else(|| {
            SyncError::VersionConflict("server refused a forced write".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CloudflareBackend, SyncEndpoint, SyncPayload, SyncResponse};
    use crate::model::app_data::AppData;
    use crate::model::record::{Fields, Record, Timestamp};
    use crate::sync::backend::{RemoteBackend, WriteOutcome};
    use crate::sync::error::SyncResult;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Mirrors the worker: compare watermark, store, echo the timestamp.
    #[derive(Default)]
    struct MemoryEndpoint {
        stored: Mutex<Option<AppData>>,
        fetched_with: Mutex<Vec<Option<Timestamp>>>,
        echo_timestamp: bool,
    }

    #[async_trait]
    impl SyncEndpoint for MemoryEndpoint {
        async fn fetch(&self, last_synced: Option<Timestamp>) -> SyncResult<Option<SyncResponse>> {
            self.fetched_with.lock().push(last_synced);
            Ok(self.stored.lock().clone().map(|data| SyncResponse {
                last_synced: data.last_synced,
                data: Some(data),
                conflict: false,
            }))
        }

        async fn submit(&self, payload: &SyncPayload) -> SyncResult<SyncResponse> {
            let mut stored = self.stored.lock();
            let current = stored.as_ref().and_then(|data| data.last_synced);
            if !payload.force && stored.is_some() && current != payload.last_synced {
                return Ok(SyncResponse {
                    conflict: true,
                    ..SyncResponse::default()
                });
            }
            *stored = Some(payload.data.clone());
            Ok(SyncResponse {
                last_synced: if self.echo_timestamp {
                    payload.data.last_synced
                } else {
                    None
                },
                data: None,
                conflict: false,
            })
        }
    }

    fn snapshot(title: &str, stamp: Timestamp) -> AppData {
        let mut fields = Fields::new();
        fields.insert("title".to_string(), title.into());
        let mut data = AppData::default();
        data.memos.push(Record::new(fields, stamp).unwrap());
        data.with_watermark(Some(stamp))
    }

    #[tokio::test]
    async fn empty_server_reports_no_remote_data() {
        let backend = CloudflareBackend::new(Arc::new(MemoryEndpoint::default()));
        assert_eq!(backend.read_remote_timestamp(None).await.unwrap(), None);
        assert_eq!(backend.read_remote_snapshot(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn push_then_read_round_trips_timestamp() {
        let backend = CloudflareBackend::new(Arc::new(MemoryEndpoint {
            echo_timestamp: true,
            ..MemoryEndpoint::default()
        }));
        let stamp = Utc.with_ymd_and_hms(2024, 7, 7, 7, 7, 7).unwrap();
        let data = snapshot("memo", stamp);

        let outcome = backend.write_remote_snapshot(&data, None).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                remote_timestamp: stamp
            }
        );
        assert_eq!(backend.read_remote_timestamp(Some(stamp)).await.unwrap(), Some(stamp));
        let remote = backend.read_remote_snapshot(Some(stamp)).await.unwrap().unwrap();
        assert_eq!(remote, data);
    }

    #[tokio::test]
    async fn missing_server_timestamp_falls_back_to_outgoing_stamp() {
        let backend = CloudflareBackend::new(Arc::new(MemoryEndpoint::default()));
        let stamp = Utc.with_ymd_and_hms(2024, 7, 7, 7, 7, 7).unwrap();
        let outcome = backend
            .write_remote_snapshot(&snapshot("memo", stamp), None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                remote_timestamp: stamp
            }
        );
    }

    #[tokio::test]
    async fn stale_watermark_conflicts_and_force_overrides() {
        let endpoint = Arc::new(MemoryEndpoint::default());
        let backend = CloudflareBackend::new(endpoint.clone());
        let first = Utc.with_ymd_and_hms(2024, 7, 7, 7, 7, 7).unwrap();
        backend
            .write_remote_snapshot(&snapshot("remote", first), None)
            .await
            .unwrap();

        let later = first + Duration::minutes(5);
        let local = snapshot("local", later);
        let outcome = backend
            .write_remote_snapshot(&local, Some(first - Duration::minutes(1)))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert_eq!(
            backend.read_remote_timestamp(Some(later)).await.unwrap(),
            Some(first)
        );

        let forced = backend.force_write_remote_snapshot(&local).await.unwrap();
        assert_eq!(forced, later);
        assert_eq!(endpoint.stored.lock().clone(), Some(local));
    }

    #[tokio::test]
    async fn reads_carry_the_local_watermark() {
        let endpoint = Arc::new(MemoryEndpoint::default());
        let backend = CloudflareBackend::new(endpoint.clone());
        let watermark = Utc.with_ymd_and_hms(2024, 7, 7, 7, 7, 7).unwrap();

        backend.read_remote_timestamp(Some(watermark)).await.unwrap();
        backend.read_remote_snapshot(None).await.unwrap();
        assert_eq!(
            endpoint.fetched_with.lock().clone(),
            vec![Some(watermark), None]
        );
    }

    #[test]
    fn payload_omits_force_flag_unless_set() {
        let payload = SyncPayload {
            last_synced: None,
            data: AppData::default(),
            force: false,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("force").is_none());
        assert!(value["lastSynced"].is_null());
    }

    #[test]
    fn response_defaults_missing_fields() {
        let response: SyncResponse = serde_json::from_str(r#"{"lastSynced": null}"#).unwrap();
        assert_eq!(response, SyncResponse::default());
    }
}
