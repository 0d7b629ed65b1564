//! Server-Sent Events connector
//!
//! Opens `GET {base_url}{stream_path}/{key}` and yields the `data` payload of
//! every dispatched event.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use tracing::debug;

use super::{Connector, MessageStream};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::request::HttpTransport;

/// One meaningful SSE line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// A `data:` field
    Data(String),
    /// Blank line: dispatch the buffered event
    Dispatch,
}

/// Parse a single Server-Sent Events line.
///
/// Comments and fields other than `data` yield `None`.
pub fn parse_sse_line(line: &str) -> Option<SseLine> {
    let line = line.trim_end_matches('\r');

    if line.is_empty() {
        return Some(SseLine::Dispatch);
    }
    if line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?;
    Some(SseLine::Data(data.strip_prefix(' ').unwrap_or(data).to_string()))
}

/// Incremental event decoder over raw body chunks.
///
/// Bytes are buffered until a full line arrives, so a multi-byte character
/// split across chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed one chunk; returns the payloads of every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line[..newline_pos]);

            match parse_sse_line(&line) {
                Some(SseLine::Data(part)) => self.data.push(part),
                Some(SseLine::Dispatch) if !self.data.is_empty() => {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                _ => {}
            }
        }
        events
    }

    /// Flush a trailing event the server closed without a blank line
    pub fn finish(mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            if let Some(SseLine::Data(part)) = parse_sse_line(&line) {
                self.data.push(part);
            }
        }
        (!self.data.is_empty()).then(|| self.data.join("\n"))
    }
}

#[derive(Clone)]
pub struct SseConnector {
    http_client: HttpClient,
    base_url: String,
    stream_path: String,
    api_token: Option<String>,
}

impl std::fmt::Debug for SseConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnector")
            .field("base_url", &self.base_url)
            .field("stream_path", &self.stream_path)
            .finish()
    }
}

impl SseConnector {
    /// Share the HTTP client and credentials of an existing transport
    pub fn from_transport(transport: &HttpTransport, stream_path: impl Into<String>) -> Self {
        Self {
            http_client: transport.http_client().clone(),
            base_url: transport.base_url().to_string(),
            stream_path: stream_path.into(),
            api_token: transport.api_token().map(str::to_string),
        }
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let transport = HttpTransport::from_config(config)?;
        Ok(Self::from_transport(&transport, config.stream_path.clone()))
    }

    pub fn url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            self.stream_path.trim_matches('/'),
            key
        )
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self, key: &str) -> Result<MessageStream> {
        let url = self.url(key);
        debug!(url = %url, "Opening event stream");

        let mut builder = self
            .http_client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Channel(format!("failed to open stream: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Channel(format!(
                "stream endpoint answered HTTP {}",
                status.as_u16()
            )));
        }

        let stream = async_stream::stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk_result) = bytes_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        for payload in decoder.push(&bytes) {
                            yield Ok(payload);
                        }
                    }
                    Err(e) => {
                        yield Err(Error::Channel(format!("stream interrupted: {}", e)));
                        return;
                    }
                }
            }

            if let Some(payload) = decoder.finish() {
                yield Ok(payload);
            }
        };

        Ok(stream.boxed())
    }
}
