use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{StatusCode, Url};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, UpdaterError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    /// Bytes already on disk; the transport appends after them when the server honors ranges.
    pub offset: u64,
    pub mirror: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteResource {
    pub length: Option<u64>,
    pub accepts_ranges: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Response {
        status: u16,
        url: String,
        headers: Vec<(String, String)>,
    },
    Progress {
        downloaded: u64,
        total: u64,
    },
    Success {
        file: PathBuf,
    },
    Failure {
        cancelled: bool,
        reason: Option<String>,
    },
}

/// Callback side of a download session handed to the transport.
#[derive(Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

impl TransportSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    pub fn on_response(&self, status: u16, url: String, headers: Vec<(String, String)>) {
        let _ = self.tx.send(TransportEvent::Response {
            status,
            url,
            headers,
        });
    }

    pub fn on_progress(&self, downloaded: u64, total: u64) {
        let _ = self.tx.send(TransportEvent::Progress { downloaded, total });
    }

    pub fn on_success(&self, file: PathBuf) {
        let _ = self.tx.send(TransportEvent::Success { file });
    }

    pub fn on_failure(&self, cancelled: bool, reason: Option<String>) {
        let _ = self.tx.send(TransportEvent::Failure { cancelled, reason });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Fetches payload bytes. Retry and backoff are the transport's business;
/// the coordinator only reacts to the terminal callback.
pub trait Transport: Send + Sync + 'static {
    fn probe(&self, url: String) -> BoxFuture<'static, Result<RemoteResource>>;
    fn fetch(&self, request: FetchRequest, sink: TransportSink) -> BoxFuture<'static, ()>;
}

#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Mirrors are selected with SourceForge style `use_mirror` query parameters.
pub fn mirror_url(url: &str, mirror: Option<&str>) -> String {
    match (mirror, Url::parse(url)) {
        (Some(mirror), Ok(mut parsed)) => {
            parsed.query_pairs_mut().append_pair("use_mirror", mirror);
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

impl Transport for ReqwestTransport {
    fn probe(&self, url: String) -> BoxFuture<'static, Result<RemoteResource>> {
        let client = self.client.clone();
        Box::pin(async move {
            let resp = client.head(&url).send().await?;
            if !resp.status().is_success() {
                return Err(UpdaterError::Network(format!(
                    "probe of {} returned {}",
                    url,
                    resp.status()
                )));
            }
            let headers = resp.headers();
            let length = headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let accepts_ranges = headers
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
            Ok(RemoteResource {
                length,
                accepts_ranges,
            })
        })
    }

    fn fetch(&self, request: FetchRequest, sink: TransportSink) -> BoxFuture<'static, ()> {
        let client = self.client.clone();
        Box::pin(async move {
            if sink.is_cancelled() {
                sink.on_failure(true, None);
                return;
            }
            let url = mirror_url(&request.url, request.mirror.as_deref());
            let mut req = client.get(&url);
            if request.offset > 0 {
                req = req.header(RANGE, format!("bytes={}-", request.offset));
            }

            let resp = tokio::select! {
                _ = sink.cancelled() => {
                    sink.on_failure(true, None);
                    return;
                }
                resp = req.send() => resp,
            };
            let resp = match resp {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("Download of {} failed: {}", request.id, e);
                    sink.on_failure(false, Some(e.to_string()));
                    return;
                }
            };

            let status = resp.status();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
                .collect();
            sink.on_response(status.as_u16(), resp.url().to_string(), headers);
            if !status.is_success() {
                sink.on_failure(false, Some(format!("server returned {}", status)));
                return;
            }

            let append = request.offset > 0 && status == StatusCode::PARTIAL_CONTENT;
            let mut downloaded = if append { request.offset } else { 0 };
            let total = resp.content_length().map(|len| len + downloaded).unwrap_or(0);

            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&request.destination)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!("Could not open {:?}: {}", request.destination, e);
                    sink.on_failure(false, Some(e.to_string()));
                    return;
                }
            };

            let mut stream = resp.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = sink.cancelled() => {
                        let _ = file.flush().await;
                        debug!("Download of {} cancelled at {} bytes", request.id, downloaded);
                        sink.on_failure(true, None);
                        return;
                    }
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = file.write_all(&bytes).await {
                            sink.on_failure(false, Some(e.to_string()));
                            return;
                        }
                        downloaded += bytes.len() as u64;
                        sink.on_progress(downloaded, total);
                    }
                    Some(Err(e)) => {
                        warn!("Download of {} interrupted: {}", request.id, e);
                        let _ = file.flush().await;
                        sink.on_failure(false, Some(e.to_string()));
                        return;
                    }
                    None => break,
                }
            }

            if let Err(e) = file.flush().await {
                sink.on_failure(false, Some(e.to_string()));
                return;
            }
            sink.on_success(request.destination);
        })
    }
}
