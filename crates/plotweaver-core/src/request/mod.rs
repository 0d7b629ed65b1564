//! Resilient request layer
//!
//! This module provides:
//! - `ApiRequest`/`ApiResponse` envelopes and request keys
//! - The `Transport` seam with an HTTP implementation
//! - `RequestClient`: cache, in-flight deduplication, timeout/cancellation
//!   and retry with backoff

mod client;
mod retry;
mod transport;
mod types;

pub use client::{RequestClient, RequestClientBuilder};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, HttpTransportBuilder, Transport};
pub use types::{ApiRequest, ApiResponse, Method, RequestKind};

pub(crate) use retry::exponential_delay;

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for unit tests

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::{ApiRequest, ApiResponse, Transport};
    use crate::error::RequestError;

    /// Replays queued results in order and records every request
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ApiResponse, RequestError>>>,
        requests: Mutex<Vec<ApiRequest>>,
        calls: AtomicUsize,
        latency: Option<Duration>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        pub fn push_ok(&self, body: Value) {
            self.script
                .lock()
                .unwrap()
                .push_back(Ok(ApiResponse::ok(body)));
        }

        pub fn push_err(&self, error: RequestError) {
            self.script.lock().unwrap().push_back(Err(error));
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RequestError::Network("script exhausted".to_string())))
        }
    }
}
