use crate::error::{OvnError, Result};
use crate::traits::PodStore;
use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use podnet_core::{PodEvent, PodKey, WatchEventType};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP client for the pod operations of the orchestration API
pub struct ApiClient {
    base_url: String,
    client: Client,
}

/// Watch event as received on the stream, before the object is decoded
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: T,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Pod>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        )
    }

    fn watch_url(&self, resource_version: Option<&str>) -> String {
        let mut url = format!("{}/api/v1/pods?watch=true", self.base_url);
        if let Some(rv) = resource_version {
            url.push_str("&resourceVersion=");
            url.push_str(rv);
        }
        url
    }

    /// GET /api/v1/pods, also returning the list's resourceVersion so a
    /// watch can resume from it
    pub async fn list_pods_with_version(&self) -> Result<(Vec<Pod>, Option<String>)> {
        let url = format!("{}/api/v1/pods", self.base_url);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OvnError::api_error(format!("HTTP request failed: {}", e)))?;
        let resp = check_status(resp, "LIST pods", None).await?;

        let list: PodList = resp
            .json()
            .await
            .map_err(|e| OvnError::api_error(format!("Failed to parse pod list: {}", e)))?;
        Ok((list.items, list.metadata.resource_version))
    }

    /// Stream pod events from `/api/v1/pods?watch=true` into `tx` until the
    /// server ends the stream or `token` is cancelled.
    ///
    /// Returns the last resourceVersion seen so the caller can resume. Both
    /// newline-delimited JSON and `data:`-framed event streams are accepted.
    pub async fn watch_pods(
        &self,
        resource_version: Option<&str>,
        tx: &broadcast::Sender<PodEvent>,
        token: &CancellationToken,
    ) -> Result<Option<String>> {
        let url = self.watch_url(resource_version);
        debug!("WATCH {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OvnError::api_error(format!("HTTP request failed: {}", e)))?;
        let resp = check_status(resp, "WATCH pods", None).await?;

        let mut last_version = resource_version.map(String::from);
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    return Err(OvnError::api_error(format!("Watch stream failed: {}", e)))
                }
                None => break,
            };
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let Some((event_type, pod)) = decode_watch_line(&line)? else {
                    continue;
                };
                if let Some(rv) = &pod.metadata.resource_version {
                    last_version = Some(rv.clone());
                }
                if let Some(event) = PodEvent::from_watch(event_type, pod) {
                    // Nobody listening only means the dispatcher has stopped
                    let _ = tx.send(event);
                }
            }
        }

        Ok(last_version)
    }
}

/// Decode one line of a watch stream. Blank lines, comments and keep-alives
/// yield `Ok(None)`; an `ERROR` event becomes an error.
pub fn decode_watch_line(line: &str) -> Result<Option<(WatchEventType, Pod)>> {
    let line = line.trim();
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() || payload.starts_with(':') || !payload.starts_with('{') {
        return Ok(None);
    }

    let event: WatchEvent<serde_json::Value> = serde_json::from_str(payload)
        .map_err(|e| OvnError::api_error(format!("Malformed watch event: {}", e)))?;

    if event.event_type == WatchEventType::Error {
        let message = event
            .object
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("watch error without message")
            .to_string();
        return Err(OvnError::api_error(format!("Watch error: {}", message)));
    }

    match serde_json::from_value::<Pod>(event.object) {
        Ok(pod) => Ok(Some((event.event_type, pod))),
        Err(e) => {
            warn!("Skipping watch event with undecodable pod: {}", e);
            Ok(None)
        }
    }
}

/// Map an HTTP error status onto the store's error kinds
async fn check_status(resp: Response, what: &str, pod: Option<&PodKey>) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let subject = pod.map(|k| k.to_string()).unwrap_or_default();
    match status {
        StatusCode::CONFLICT => Err(OvnError::conflict(subject)),
        StatusCode::NOT_FOUND if pod.is_some() => Err(OvnError::pod_not_found(subject)),
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(OvnError::api_error(format!(
                "{} failed with status {}: {}",
                what, status, body
            )))
        }
    }
}

#[async_trait]
impl PodStore for ApiClient {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.list_pods_with_version().await.map(|(pods, _)| pods)
    }

    /// GET /api/v1/namespaces/{namespace}/pods/{name}
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = self.pod_url(namespace, name);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OvnError::api_error(format!("HTTP request failed: {}", e)))?;
        let key = PodKey::new(namespace, name);
        let resp = check_status(resp, "GET pod", Some(&key)).await?;

        resp.json::<Pod>()
            .await
            .map_err(|e| OvnError::api_error(format!("Failed to parse pod: {}", e)))
    }

    /// PUT /api/v1/namespaces/{namespace}/pods/{name}
    async fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        let key = PodKey::from_pod(pod)?;
        let url = self.pod_url(&key.namespace, &key.name);
        debug!("PUT {}", url);

        let resp = self
            .client
            .put(&url)
            .json(pod)
            .send()
            .await
            .map_err(|e| OvnError::api_error(format!("HTTP request failed: {}", e)))?;
        let resp = check_status(resp, "PUT pod", Some(&key)).await?;

        resp.json::<Pod>()
            .await
            .map_err(|e| OvnError::api_error(format!("Failed to parse pod: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ndjson_line() {
        let line = r#"{"type":"ADDED","object":{"metadata":{"name":"nginx","namespace":"web","resourceVersion":"42"},"spec":{"containers":[],"nodeName":"node1"}}}"#;
        let (event_type, pod) = decode_watch_line(line).unwrap().unwrap();
        assert_eq!(event_type, WatchEventType::Added);
        assert_eq!(pod.metadata.name.as_deref(), Some("nginx"));
        assert_eq!(pod.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn test_decode_data_framed_line() {
        let line = r#"data: {"type":"DELETED","object":{"metadata":{"name":"nginx"}}}"#;
        let (event_type, _) = decode_watch_line(line).unwrap().unwrap();
        assert_eq!(event_type, WatchEventType::Deleted);
    }

    #[test]
    fn test_decode_skips_keepalives() {
        assert!(decode_watch_line("").unwrap().is_none());
        assert!(decode_watch_line(":keep-alive").unwrap().is_none());
        assert!(decode_watch_line("event: message").unwrap().is_none());
    }

    #[test]
    fn test_decode_error_event() {
        let line = r#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version"}}"#;
        let err = decode_watch_line(line).unwrap_err();
        assert!(err.to_string().contains("too old resource version"));
    }

    #[test]
    fn test_watch_url_resumes_from_version() {
        let client = ApiClient::new("http://127.0.0.1:6443");
        assert_eq!(
            client.watch_url(None),
            "http://127.0.0.1:6443/api/v1/pods?watch=true"
        );
        assert_eq!(
            client.watch_url(Some("17")),
            "http://127.0.0.1:6443/api/v1/pods?watch=true&resourceVersion=17"
        );
    }

    #[test]
    fn test_base_url_trims_slash() {
        let client = ApiClient::new("http://127.0.0.1:6443/");
        assert_eq!(client.base_url(), "http://127.0.0.1:6443");
        assert_eq!(
            client.pod_url("web", "nginx"),
            "http://127.0.0.1:6443/api/v1/namespaces/web/pods/nginx"
        );
    }
}
