use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ResolvedConfig;
use crate::dataset::{Dataset, ProjectSelection};
use crate::domain::{ComputedFileDescriptor, DatasetId, FileLocator, Format, ProjectId, SampleRecord};
use crate::error::PortalError;

/// Request body for creating or updating a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetBody {
    pub format: Format,
    pub data: BTreeMap<ProjectId, ProjectSelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regenerated_from: Option<DatasetId>,
}

impl DatasetBody {
    pub fn from_dataset(dataset: &Dataset, email: Option<String>, start: bool) -> Self {
        Self {
            format: dataset.format,
            data: dataset.data.clone(),
            email,
            start,
            regenerated_from: dataset.regenerated_from.clone(),
        }
    }
}

pub trait PortalClient {
    fn project_computed_files(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<ComputedFileDescriptor>, PortalError>;
    fn project_samples(&self, project_id: &ProjectId) -> Result<Vec<SampleRecord>, PortalError>;
    fn get_dataset(&self, id: &DatasetId, token: Option<&str>) -> Result<Dataset, PortalError>;
    fn create_dataset(&self, body: &DatasetBody, token: Option<&str>) -> Result<Dataset, PortalError>;
    fn update_dataset(
        &self,
        id: &DatasetId,
        body: &DatasetBody,
        token: Option<&str>,
    ) -> Result<Dataset, PortalError>;
    fn computed_file_download_url(
        &self,
        locator: &FileLocator,
        token: Option<&str>,
    ) -> Result<String, PortalError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Page { results: Vec<T> },
    Plain(Vec<T>),
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Page { results } => results,
            Listing::Plain(items) => items,
        }
    }
}

#[derive(Deserialize)]
struct DownloadLink {
    download_url: Option<String>,
}

#[derive(Clone)]
pub struct PortalHttpClient {
    client: Client,
    base_url: String,
}

impl PortalHttpClient {
    pub fn new(config: &ResolvedConfig) -> Result<Self, PortalError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("portal-ds/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PortalError::RemoteHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| PortalError::RemoteHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn parse<T: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T, PortalError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            warn!(status, body = %body, "portal request failed");
            return Err(PortalError::remote(status));
        }
        response
            .json::<T>()
            .map_err(|err| PortalError::RemoteHttp(err.to_string()))
    }

    fn with_token(
        request: reqwest::blocking::RequestBuilder,
        token: Option<&str>,
    ) -> reqwest::blocking::RequestBuilder {
        match token {
            Some(token) => request.header("API-KEY", token),
            None => request,
        }
    }

    /// Single attempt for requests that are not safe to replay.
    fn send_once(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, PortalError> {
        request
            .send()
            .map_err(|err| PortalError::RemoteHttp(err.to_string()))
    }

    /// Retries idempotent requests on throttling, gateway errors and
    /// connection failures.
    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, PortalError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(PortalError::RemoteHttp(err.to_string()));
                }
            }
        }
    }
}

impl PortalClient for PortalHttpClient {
    fn project_computed_files(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<ComputedFileDescriptor>, PortalError> {
        let url = self.url("computed-files/");
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("project__scpca_id", project_id.as_str()), ("limit", "1000")])
        })?;
        Ok(Self::parse::<Listing<ComputedFileDescriptor>>(response)?.into_vec())
    }

    fn project_samples(&self, project_id: &ProjectId) -> Result<Vec<SampleRecord>, PortalError> {
        let url = self.url("samples/");
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("project__scpca_id", project_id.as_str()), ("limit", "1000")])
        })?;
        Ok(Self::parse::<Listing<SampleRecord>>(response)?.into_vec())
    }

    fn get_dataset(&self, id: &DatasetId, token: Option<&str>) -> Result<Dataset, PortalError> {
        let url = self.url(&format!("datasets/{id}/"));
        let response = self.send_with_retries(|| Self::with_token(self.client.get(&url), token))?;
        Self::parse(response)
    }

    fn create_dataset(&self, body: &DatasetBody, token: Option<&str>) -> Result<Dataset, PortalError> {
        let url = self.url("datasets/");
        let response = self.send_once(Self::with_token(self.client.post(&url).json(body), token))?;
        Self::parse(response)
    }

    fn update_dataset(
        &self,
        id: &DatasetId,
        body: &DatasetBody,
        token: Option<&str>,
    ) -> Result<Dataset, PortalError> {
        let url = self.url(&format!("datasets/{id}/"));
        let response = self.send_once(Self::with_token(self.client.put(&url).json(body), token))?;
        Self::parse(response)
    }

    fn computed_file_download_url(
        &self,
        locator: &FileLocator,
        token: Option<&str>,
    ) -> Result<String, PortalError> {
        let url = self.url(&format!("computed-files/{locator}/"));
        let response = self.send_with_retries(|| Self::with_token(self.client.get(&url), token))?;
        let link: DownloadLink = Self::parse(response)?;
        link.download_url
            .ok_or_else(|| PortalError::remote(403))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;
    use crate::config::{Config, ConfigLoader};

    #[test]
    fn listing_accepts_pages_and_arrays() {
        let page: Listing<u32> = serde_json::from_str(r#"{"count": 2, "results": [1, 2]}"#).unwrap();
        assert_eq!(page.into_vec(), vec![1, 2]);
        let plain: Listing<u32> = serde_json::from_str("[3]").unwrap();
        assert_eq!(plain.into_vec(), vec![3]);
    }

    #[test]
    fn body_serializes_merged_projects() {
        let mut dataset = Dataset::new(Format::AnnData);
        dataset.data.insert("P1".into(), ProjectSelection::merged());
        let body = DatasetBody::from_dataset(&dataset, None, true);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["format"], "ANN_DATA");
        assert_eq!(json["data"]["P1"]["SINGLE_CELL"], "MERGED");
        assert_eq!(json["start"], true);
        assert!(json.get("email").is_none());
    }

    /// Serves `502 Bad Gateway` to every request and counts them.
    fn bad_gateway() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                read_request(&mut stream);
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(
                    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let Ok(n) = stream.read(&mut chunk) else { return };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    fn client_for(base_url: String) -> PortalHttpClient {
        let config = ConfigLoader::resolve_config(Config {
            api_base_url: Some(base_url),
            ..Default::default()
        })
        .unwrap();
        PortalHttpClient::new(&config).unwrap()
    }

    #[test]
    fn dataset_writes_are_sent_once() {
        let (base_url, hits) = bad_gateway();
        let client = client_for(base_url);
        let mut dataset = Dataset::new(Format::SingleCellExperiment);
        dataset.data.insert("P1".into(), ProjectSelection::merged());
        let body = DatasetBody::from_dataset(&dataset, Some("me@lab.org".to_string()), true);

        assert_matches!(
            client.create_dataset(&body, None),
            Err(PortalError::RemoteRequestFailed { status: 502, .. })
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_matches!(
            client.update_dataset(&"d1".into(), &body, None),
            Err(PortalError::RemoteRequestFailed { status: 502, .. })
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reads_are_retried_on_gateway_errors() {
        let (base_url, hits) = bad_gateway();
        let client = client_for(base_url);
        assert_matches!(
            client.get_dataset(&"d1".into(), None),
            Err(PortalError::RemoteRequestFailed { status: 502, .. })
        );
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retry_statuses() {
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
    }
}
