use std::fmt;
use std::io::Read;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::domain::BandLabel;
use crate::error::MosaicError;
use crate::query::QueryParameters;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("S2M_USERNAME").ok()?;
        let password = std::env::var("S2M_PASSWORD").ok()?;
        if username.trim().is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.trim().to_string(),
            password,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub search_url: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Session {
    pub fn new(search_url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            search_url: search_url.into(),
            credentials,
            connect_timeout: Duration::from_millis(3100),
            read_timeout: Duration::from_millis(60100),
        }
    }
}

pub struct DownloadBody {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

impl fmt::Debug for DownloadBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum DownloadResponse {
    Offline,
    Ready(DownloadBody),
}

pub trait ArchiveClient: Send + Sync {
    fn search(&self, params: &QueryParameters) -> Result<String, MosaicError>;
    fn fetch_text(&self, uri: &str) -> Result<String, MosaicError>;
    fn open_download(&self, uri: &str) -> Result<DownloadResponse, MosaicError>;
}

impl<T: ArchiveClient + ?Sized> ArchiveClient for &T {
    fn search(&self, params: &QueryParameters) -> Result<String, MosaicError> {
        (**self).search(params)
    }

    fn fetch_text(&self, uri: &str) -> Result<String, MosaicError> {
        (**self).fetch_text(uri)
    }

    fn open_download(&self, uri: &str) -> Result<DownloadResponse, MosaicError> {
        (**self).open_download(uri)
    }
}

#[derive(Clone)]
pub struct ArchiveHttpClient {
    client: Client,
    session: Session,
}

impl ArchiveHttpClient {
    pub fn new(session: Session) -> Result<Self, MosaicError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("s2-mosaic/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MosaicError::Transport(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(session.connect_timeout)
            .timeout(session.read_timeout)
            .build()
            .map_err(|err| MosaicError::Transport(err.to_string()))?;
        Ok(Self { client, session })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session.credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            None => request,
        }
    }

    fn check_status(response: Response) -> Result<Response, MosaicError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(MosaicError::Auth {
                status: status.as_u16(),
            });
        }
        let message = response
            .text()
            .unwrap_or_else(|_| "archive request failed".to_string());
        Err(MosaicError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, MosaicError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = self.authorized(make_req()).send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, "retrying archive request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        warn!(error = %err, attempt, "archive request failed, retrying");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(MosaicError::Transport(err.to_string()));
                }
            }
        }
    }
}

impl ArchiveClient for ArchiveHttpClient {
    fn search(&self, params: &QueryParameters) -> Result<String, MosaicError> {
        let pairs = params.as_pairs();
        let response =
            self.send_with_retries(|| self.client.get(&self.session.search_url).query(&pairs))?;
        // Error documents arrive with 4xx/5xx; hand them to the feed parser.
        let status = response.status();
        let auth_failure = status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
        if (status.is_client_error() || status.is_server_error()) && !auth_failure {
            let body = response
                .text()
                .map_err(|err| MosaicError::Transport(err.to_string()))?;
            if body.contains("<error") {
                return Ok(body);
            }
            return Err(MosaicError::Status {
                status: status.as_u16(),
                message: body,
            });
        }
        Self::check_status(response)?
            .text()
            .map_err(|err| MosaicError::Transport(err.to_string()))
    }

    fn fetch_text(&self, uri: &str) -> Result<String, MosaicError> {
        let response = self.send_with_retries(|| self.client.get(uri))?;
        Self::check_status(response)?
            .text()
            .map_err(|err| MosaicError::Transport(err.to_string()))
    }

    fn open_download(&self, uri: &str) -> Result<DownloadResponse, MosaicError> {
        let response = self.send_with_retries(|| self.client.get(uri))?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(DownloadResponse::Offline);
        }
        let response = Self::check_status(response)?;
        Ok(DownloadResponse::Ready(DownloadBody {
            content_length: response.content_length(),
            reader: Box::new(response),
        }))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone)]
pub struct ProductNodes {
    base: String,
    safe_name: String,
}

impl ProductNodes {
    pub fn new(download_uri: &str, safe_name: &str) -> Result<Self, MosaicError> {
        let base = download_uri.strip_suffix("$value").ok_or_else(|| {
            MosaicError::Data(format!("download URI does not end in $value: {download_uri}"))
        })?;
        Ok(Self {
            base: base.to_string(),
            safe_name: safe_name.to_string(),
        })
    }

    pub fn product_uri(&self) -> String {
        format!("{}$value", self.base)
    }

    pub fn checksum_uri(&self) -> String {
        format!("{}Checksum/Value/$value", self.base)
    }

    pub fn manifest_uri(&self) -> String {
        self.node_uri(&["manifest.safe"])
    }

    pub fn tile_metadata_uri(&self, granule: &str) -> String {
        self.node_uri(&["GRANULE", granule, "MTD_TL.xml"])
    }

    pub fn band_uri(&self, granule: &str, label: &BandLabel, file_name: &str) -> String {
        let folder = label.resolution_folder();
        self.node_uri(&["GRANULE", granule, "IMG_DATA", &folder, file_name])
    }

    pub fn node_uri(&self, segments: &[&str]) -> String {
        let mut uri = format!("{}Nodes('{}')", self.base, self.safe_name);
        for segment in segments {
            uri.push_str(&format!("/Nodes('{segment}')"));
        }
        uri.push_str("/$value");
        uri
    }
}
