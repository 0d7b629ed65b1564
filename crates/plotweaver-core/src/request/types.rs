//! Request and response envelopes shared by transports and the client

use std::fmt;

use serde_json::Value;

use crate::cache::cache_key;

/// HTTP method of a backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a call changes server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Reads never invalidate the cache; only `GET` reads are cached
    Read,
    /// Successful mutations invalidate related cache entries
    Mutation,
}

/// One logical backend call
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/projects/p1/locks`
    pub endpoint: String,
    pub body: Option<Value>,
    pub kind: RequestKind,
}

impl ApiRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            endpoint: endpoint.into(),
            body: None,
            kind: RequestKind::Read,
        }
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self::mutation(Method::Post, endpoint, Some(body))
    }

    pub fn put(endpoint: impl Into<String>, body: Value) -> Self {
        Self::mutation(Method::Put, endpoint, Some(body))
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::mutation(Method::Delete, endpoint, None)
    }

    fn mutation(method: Method, endpoint: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body,
            kind: RequestKind::Mutation,
        }
    }

    /// Mark a non-GET call as side-effect free (e.g. a conflict pre-check)
    pub fn as_query(mut self) -> Self {
        self.kind = RequestKind::Read;
        self
    }

    /// Cache and deduplication key
    pub fn key(&self) -> String {
        cache_key(self.method.as_str(), &self.endpoint, self.body.as_ref())
    }

    pub fn is_cacheable(&self) -> bool {
        self.method == Method::Get
    }

    pub fn is_mutation(&self) -> bool {
        self.kind == RequestKind::Mutation
    }

    /// Paths whose cached reads a successful mutation makes stale:
    /// the resource itself, its parent path and the project collection.
    pub fn invalidation_paths(&self) -> Vec<String> {
        let endpoint = self.endpoint.trim_end_matches('/');
        let mut paths = vec![endpoint.to_string()];

        if let Some((parent, _)) = endpoint.rsplit_once('/')
            && !parent.is_empty()
        {
            paths.push(parent.to_string());
        }

        let segments: Vec<&str> = endpoint.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() >= 2 && segments[0] == "projects" {
            paths.push(format!("/projects/{}", segments[1]));
        }

        paths.dedup();
        paths
    }
}

/// A settled 2xx response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub etag: Option<String>,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            etag: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
