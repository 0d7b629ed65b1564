//! End-to-end lock workflows against an in-memory backend
//!
//! The backend answers the same routes and payload shapes as the lock
//! server, so these tests drive the full stack: session, coordinator,
//! detector, request client (cache, dedup, retry) and the typed API.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plotweaver_core::api::LockApi;
use plotweaver_core::domain::locking::{
    BulkLockOperation, BulkOperationKind, ConflictResolution, LockLevel, LockOperation,
    LockSession, LockType, ProjectUpdate, ResolutionOutcome, Submission,
};
use plotweaver_core::request::{
    ApiRequest, ApiResponse, Method, RequestClient, RetryPolicy, Transport,
};
use plotweaver_core::{Error, RequestError};
use serde_json::{Value, json};

#[derive(Default)]
struct InMemoryBackend {
    locks: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    requests: Mutex<Vec<ApiRequest>>,
    failures: Mutex<VecDeque<u16>>,
    calls: AtomicUsize,
}

impl InMemoryBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seed_lock(&self, project: &str, component: &str, holder: &str, level: &str) {
        let lock = json!({
            "id": format!("lock-{component}"),
            "componentId": component,
            "level": level,
            "type": "personal",
            "reason": "drafting",
            "lockedBy": holder,
            "lockedAt": "2024-05-01T10:00:00Z",
            "canOverride": level != "frozen",
        });
        self.locks
            .lock()
            .unwrap()
            .entry(project.to_string())
            .or_default()
            .insert(component.to_string(), lock);
    }

    /// Answer the next `count` requests with HTTP `status`
    fn fail_next(&self, count: usize, status: u16) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(status);
        }
    }

    fn holder(&self, project: &str, component: &str) -> Option<String> {
        self.locks
            .lock()
            .unwrap()
            .get(project)
            .and_then(|locks| locks.get(component))
            .and_then(|lock| lock["lockedBy"].as_str().map(str::to_string))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requests_to(&self, method: Method, suffix: &str) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.endpoint.ends_with(suffix))
            .cloned()
            .collect()
    }

    fn route(&self, request: &ApiRequest) -> Result<Value, RequestError> {
        let segments: Vec<&str> = request
            .endpoint
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let mut locks = self.locks.lock().unwrap();

        match (request.method, segments.as_slice()) {
            (Method::Get, ["health"]) => {
                let total: usize = locks.values().map(BTreeMap::len).sum();
                Ok(json!({"status": "healthy", "total_locks": total, "total_conflicts": 0}))
            }
            (Method::Get, ["projects", project, "locks"]) => {
                let project_locks = locks.get(*project).cloned().unwrap_or_default();
                Ok(json!({
                    "locks": project_locks,
                    "timestamp": "2024-05-01T10:00:00Z",
                    "count": project_locks.len(),
                }))
            }
            (Method::Get, ["projects", _, "locks", "audit"]) => Ok(json!([])),
            (Method::Post, ["projects", project, "locks", "bulk"]) => {
                let project_locks = locks.entry(project.to_string()).or_default();
                let mut affected = Vec::new();
                for op in request.body.as_ref().and_then(|b| b["operations"].as_array()).into_iter().flatten() {
                    for component in op["componentIds"].as_array().into_iter().flatten() {
                        let component = component.as_str().unwrap_or_default().to_string();
                        match op["type"].as_str() {
                            Some("lock") => {
                                project_locks.insert(
                                    component.clone(),
                                    json!({
                                        "id": format!("bulk-lock-{component}"),
                                        "componentId": component,
                                        "level": op["lockLevel"],
                                        "type": op.get("lockType").cloned().unwrap_or_else(|| json!("personal")),
                                        "reason": op["reason"],
                                        "lockedBy": "current-user",
                                        "lockedAt": "2024-05-01T11:00:00Z",
                                        "canOverride": true,
                                    }),
                                );
                                affected.push(component);
                            }
                            Some("unlock") => {
                                if project_locks.remove(&component).is_some() {
                                    affected.push(component);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Ok(json!({"status": "bulk_updated", "affected_components": affected}))
            }
            (Method::Post, ["projects", project, "locks", "check-conflicts"]) => {
                let project_locks = locks.get(*project).cloned().unwrap_or_default();
                let conflicts: Vec<Value> = request
                    .body
                    .as_ref()
                    .and_then(|b| b["components"].as_array())
                    .into_iter()
                    .flatten()
                    .filter_map(|c| c.as_str())
                    .filter_map(|c| project_locks.get(c).map(|lock| (c, lock)))
                    .map(|(component, lock)| {
                        json!({
                            "component_id": component,
                            "conflict_type": "already_locked",
                            "existing_lock": lock,
                            "can_override": lock["canOverride"].as_bool().unwrap_or(false)
                                && lock["level"] != "frozen",
                        })
                    })
                    .collect();
                let can_proceed = conflicts.is_empty();
                Ok(json!({
                    "success": true,
                    "data": {"conflicts": conflicts, "can_proceed": can_proceed},
                }))
            }
            (Method::Put, ["projects", project, "locks", component]) => {
                let lock = request.body.clone().unwrap_or(Value::Null);
                locks
                    .entry(project.to_string())
                    .or_default()
                    .insert(component.to_string(), lock.clone());
                Ok(lock)
            }
            (Method::Get, ["projects", _, "conflicts"]) => Ok(json!([])),
            (Method::Post, ["projects", _, "conflicts", _, "resolve"]) => {
                Ok(json!({"status": "resolved"}))
            }
            _ => Err(RequestError::Http {
                status: 404,
                body: format!("no route for {} {}", request.method.as_str(), request.endpoint),
            }),
        }
    }
}

#[async_trait]
impl Transport for InMemoryBackend {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(status) = self.failures.lock().unwrap().pop_front() {
            return Err(RequestError::Http {
                status,
                body: "injected failure".to_string(),
            });
        }
        self.route(request).map(ApiResponse::ok)
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

fn api(backend: &Arc<InMemoryBackend>) -> LockApi {
    let client = RequestClient::builder()
        .shared_transport(backend.clone())
        .retry(fast_retry())
        .cache_ttl(Duration::from_secs(30))
        .build()
        .unwrap();
    LockApi::new(client)
}

fn session(backend: &Arc<InMemoryBackend>, user: &str) -> LockSession {
    LockSession::new(api(backend), "p1", user)
}

fn sent_operations(request: &ApiRequest) -> Vec<Value> {
    request.body.as_ref().unwrap()["operations"]
        .as_array()
        .unwrap()
        .clone()
}

fn ids(op: &Value) -> BTreeSet<String> {
    op["componentIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_bulk_unlock_with_partial_conflict_skips_conflicting_component() {
    let backend = InMemoryBackend::new();
    backend.seed_lock("p1", "scene-1", "bob", "hard");
    let session = session(&backend, "alice");

    let operation = LockOperation::Unlock {
        component_ids: ["scene-1", "scene-2"].iter().map(|s| s.to_string()).collect(),
        reason: "restructure".to_string(),
    };
    let check = session.check(&operation).await.unwrap();
    assert!(check.has_conflicts);
    assert!(!check.can_proceed);
    assert!(!check.degraded);
    assert_eq!(check.conflicts.len(), 1);
    assert_eq!(check.conflicts[0].component_id, "scene-1");

    let Submission::NeedsResolution(mut resolver) = session.submit(operation).await.unwrap() else {
        panic!("expected conflicts");
    };
    assert!(!resolver.can_confirm());
    assert!(matches!(
        session.apply_resolution(&mut resolver).await,
        Err(Error::UnresolvedConflicts { unresolved: 1 })
    ));

    resolver.resolve("scene-1", ConflictResolution::skip()).unwrap();
    let outcome = session.apply_resolution(&mut resolver).await.unwrap();

    match outcome {
        ResolutionOutcome::Confirmed { submitted, skipped } => {
            assert_eq!(submitted, BTreeSet::from(["scene-2".to_string()]));
            assert_eq!(skipped, BTreeSet::from(["scene-1".to_string()]));
        }
        ResolutionOutcome::Cancelled => panic!("expected confirmation"),
    }

    let bulk = backend.requests_to(Method::Post, "/locks/bulk");
    assert_eq!(bulk.len(), 1);
    let operations = sent_operations(&bulk[0]);
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0]["type"], "unlock");
    assert_eq!(ids(&operations[0]), BTreeSet::from(["scene-2".to_string()]));

    // Skip is never reported and the existing lock survives
    assert!(backend.requests_to(Method::Post, "/resolve").is_empty());
    assert_eq!(backend.holder("p1", "scene-1").as_deref(), Some("bob"));
    assert!(session.snapshot().await.conflicts().is_empty());
}

#[tokio::test]
async fn test_unlock_resolution_clears_existing_lock_before_applying() {
    let backend = InMemoryBackend::new();
    backend.seed_lock("p1", "ch-a", "bob", "soft");
    backend.seed_lock("p1", "ch-b", "bob", "soft");
    let session = session(&backend, "alice");

    let op = BulkLockOperation::new(
        BulkOperationKind::Lock,
        ["ch-a", "ch-b"],
        Some(LockLevel::Hard),
        "final pass",
    );
    let Submission::NeedsResolution(mut resolver) = session.submit_bulk(op).await.unwrap() else {
        panic!("expected conflicts");
    };
    assert_eq!(resolver.unresolved_count(), 2);

    resolver.resolve("ch-a", ConflictResolution::unlock()).unwrap();
    resolver.resolve("ch-b", ConflictResolution::skip()).unwrap();
    session.apply_resolution(&mut resolver).await.unwrap();

    let bulk = backend.requests_to(Method::Post, "/locks/bulk");
    assert_eq!(bulk.len(), 1);
    let operations = sent_operations(&bulk[0]);
    assert_eq!(operations.len(), 2);
    assert_eq!(operations[0]["type"], "unlock");
    assert_eq!(ids(&operations[0]), BTreeSet::from(["ch-a".to_string()]));
    assert_eq!(operations[1]["type"], "lock");
    assert_eq!(operations[1]["lockLevel"], "hard");
    assert_eq!(ids(&operations[1]), BTreeSet::from(["ch-a".to_string()]));

    assert_eq!(backend.holder("p1", "ch-a").as_deref(), Some("current-user"));
    assert_eq!(backend.holder("p1", "ch-b").as_deref(), Some("bob"));

    let mirrored = session.lock_for("ch-a").await.unwrap();
    assert_eq!(mirrored.level, LockLevel::Hard);
    assert_eq!(mirrored.locked_by, "alice");
}

#[tokio::test]
async fn test_cancelled_resolution_sends_nothing() {
    let backend = InMemoryBackend::new();
    backend.seed_lock("p1", "scene-1", "bob", "frozen");
    let session = session(&backend, "alice");

    let Submission::NeedsResolution(mut resolver) = session
        .change_level(["scene-1"], LockLevel::Soft, "loosen")
        .await
        .unwrap()
    else {
        panic!("expected conflicts");
    };
    assert_eq!(session.snapshot().await.conflicts().len(), 1);

    let outcome = session.cancel_resolution(&mut resolver).await;
    assert!(outcome.is_cancelled());
    assert!(backend.requests_to(Method::Post, "/locks/bulk").is_empty());
    assert!(session.snapshot().await.conflicts().is_empty());
}

#[tokio::test]
async fn test_lock_without_conflicts_is_applied_directly() {
    let backend = InMemoryBackend::new();
    let session = session(&backend, "alice");

    let submission = session
        .lock_component("scene-9", LockLevel::Soft, LockType::Editorial, "copy edit")
        .await
        .unwrap();
    assert!(submission.is_applied());
    assert_eq!(backend.holder("p1", "scene-9").as_deref(), Some("alice"));
    assert!(session.snapshot().await.is_locked("scene-9"));

    // A second attempt now conflicts with the recorded lock
    let again = session
        .lock_component("scene-9", LockLevel::Hard, LockType::Editorial, "tighten")
        .await
        .unwrap();
    assert!(!again.is_applied());
}

#[tokio::test]
async fn test_lock_type_survives_conflict_resolution() {
    let backend = InMemoryBackend::new();
    backend.seed_lock("p1", "scene-4", "bob", "soft");
    let session = session(&backend, "alice");

    let Submission::NeedsResolution(mut resolver) = session
        .lock_component("scene-4", LockLevel::Hard, LockType::Editorial, "line edit")
        .await
        .unwrap()
    else {
        panic!("expected conflicts");
    };
    resolver.resolve("scene-4", ConflictResolution::unlock()).unwrap();
    session.apply_resolution(&mut resolver).await.unwrap();

    let bulk = backend.requests_to(Method::Post, "/locks/bulk");
    let operations = sent_operations(&bulk[0]);
    assert_eq!(operations[1]["type"], "lock");
    assert_eq!(operations[1]["lockType"], "editorial");

    let mirrored = session.lock_for("scene-4").await.unwrap();
    assert_eq!(mirrored.lock_type, LockType::Editorial);
    assert_eq!(mirrored.locked_by, "alice");

    session.refresh().await.unwrap();
    assert_eq!(session.lock_for("scene-4").await.unwrap().lock_type, LockType::Editorial);
}

#[tokio::test]
async fn test_lock_reads_are_cached_within_ttl() {
    let backend = InMemoryBackend::new();
    backend.seed_lock("p1", "scene-1", "bob", "soft");
    let api = api(&backend);

    let first = api.get_locks("p1").await;
    let second = api.get_locks("p1").await;
    assert_eq!(first, second);
    assert_eq!(backend.requests_to(Method::Get, "/projects/p1/locks").len(), 1);

    // A mutation on the project invalidates the cached read
    let ops = [BulkLockOperation::new(BulkOperationKind::Unlock, ["scene-1"], None, "done")];
    api.bulk_update_locks("p1", &ops).await.unwrap();
    let third = api.get_locks("p1").await;
    assert!(third.is_empty());
    assert_eq!(backend.requests_to(Method::Get, "/projects/p1/locks").len(), 2);
}

#[tokio::test]
async fn test_concurrent_reads_share_one_call() {
    let backend = InMemoryBackend::new();
    let api = api(&backend);

    let (a, b, c) = tokio::join!(api.get_locks("p1"), api.get_locks("p1"), api.get_locks("p1"));
    assert!(a.is_empty() && b.is_empty() && c.is_empty());
    assert_eq!(backend.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_are_retried_until_success() {
    let backend = InMemoryBackend::new();
    backend.fail_next(2, 503);
    let api = api(&backend);

    let health = api.health().await.unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(backend.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_are_not_retried() {
    let backend = InMemoryBackend::new();
    backend.fail_next(1, 422);
    let api = api(&backend);

    let ops = [BulkLockOperation::new(
        BulkOperationKind::Lock,
        ["scene-1"],
        Some(LockLevel::Soft),
        "draft",
    )];
    let err = api.bulk_update_locks("p1", &ops).await.unwrap_err();
    assert_eq!(err.code(), "E300");
    assert!(!err.is_retryable());
    assert_eq!(backend.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_surface_last_error() {
    let backend = InMemoryBackend::new();
    backend.fail_next(3, 500);
    let api = api(&backend);

    let err = api.health().await.unwrap_err();
    assert_eq!(backend.calls(), 3);
    match err {
        Error::Request(RequestError::Exhausted { last, .. }) => assert_eq!(last.status(), Some(500)),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_conflict_check_fails_open_by_default() {
    let backend = InMemoryBackend::new();
    backend.seed_lock("p1", "scene-1", "bob", "hard");
    backend.fail_next(3, 503);
    let session = session(&backend, "alice");

    let op = LockOperation::Unlock {
        component_ids: BTreeSet::from(["scene-1".to_string()]),
        reason: "cleanup".to_string(),
    };
    let check = session.check(&op).await.unwrap();
    assert!(check.degraded);
    assert!(check.can_proceed);
    assert!(check.conflicts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_conflict_check_can_fail_closed() {
    let backend = InMemoryBackend::new();
    // Enough failures to exhaust both the pre-check and the submit's own check
    backend.fail_next(6, 503);
    let session = session(&backend, "alice").fail_closed();

    let op = LockOperation::Unlock {
        component_ids: BTreeSet::from(["scene-1".to_string()]),
        reason: "cleanup".to_string(),
    };
    assert!(session.check(&op).await.is_err());
    assert!(matches!(
        session.submit(op).await,
        Err(Error::Request(RequestError::Exhausted { .. }))
    ));
    assert!(backend.requests_to(Method::Post, "/locks/bulk").is_empty());
}

#[tokio::test]
async fn test_bulk_push_triggers_refresh() {
    let backend = InMemoryBackend::new();
    let session = session(&backend, "alice");
    session.refresh().await.unwrap();
    assert!(session.snapshot().await.is_empty());

    // Another client locks through the backend directly
    backend.seed_lock("p1", "scene-4", "carol", "soft");
    let message = json!({
        "channel": "locks:p1",
        "data": {"bulk_update": true, "affected_components": ["scene-4"]},
    });
    let update = ProjectUpdate::from_message(&message).unwrap().unwrap();
    session.apply_push(update).await;

    let lock = session.lock_for("scene-4").await.unwrap();
    assert_eq!(lock.locked_by, "carol");
}
