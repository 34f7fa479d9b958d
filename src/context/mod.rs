//! Ambient per-request scope.
//!
//! # Data Flow
//! ```text
//! context middleware
//!     → resolve request/trace ids (ids.rs)
//!     → begin(scope, downstream) installs the scope task-locally
//!     → authorization guard calls set(OrgId/UserId)
//!     → any code awaited inside the request reads current()
//!     → the same ScopeHandle rides on the response extensions
//! ```
//!
//! # Design Decisions
//! - The scope lives in a Tokio task-local, so it survives every `.await`
//!   inside the request future and is never visible to sibling requests
//! - Task-locals do not cross `tokio::spawn`; use [`propagate`] for work a
//!   request spawns
//! - request_id/trace_id are fixed at creation; only identity fields can be set

pub mod ids;

use std::future::Future;
use std::sync::{Arc, RwLock};

pub use ids::generate_id;

tokio::task_local! {
    static SCOPE: ScopeHandle;
}

/// Identifiers carried by a single inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub trace_id: String,
    pub request_id: String,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
}

impl RequestScope {
    pub fn new(request_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            request_id: request_id.into(),
            org_id: None,
            user_id: None,
        }
    }
}

/// The mutable fields of a [`RequestScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKey {
    OrgId,
    UserId,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("no request scope is active")]
    NoActiveScope,
}

/// Shared handle to one request's scope.
///
/// Clones observe the same underlying scope, which is how values set deep in
/// the call tree stay visible to code that runs after the handler returns.
#[derive(Debug, Clone)]
pub struct ScopeHandle {
    inner: Arc<RwLock<RequestScope>>,
}

impl ScopeHandle {
    pub fn new(scope: RequestScope) -> Self {
        Self {
            inner: Arc::new(RwLock::new(scope)),
        }
    }

    /// Copy of the scope as it is right now.
    pub fn snapshot(&self) -> RequestScope {
        self.inner.read().expect("request scope lock poisoned").clone()
    }

    pub fn set(&self, key: ScopeKey, value: impl Into<String>) {
        let mut scope = self.inner.write().expect("request scope lock poisoned");
        match key {
            ScopeKey::OrgId => scope.org_id = Some(value.into()),
            ScopeKey::UserId => scope.user_id = Some(value.into()),
        }
    }

    /// Run `fut` with this handle as the ambient scope.
    pub async fn enter<F: Future>(self, fut: F) -> F::Output {
        SCOPE.scope(self, fut).await
    }
}

/// Run `fut` with a fresh ambient scope.
pub async fn begin<F: Future>(scope: RequestScope, fut: F) -> F::Output {
    ScopeHandle::new(scope).enter(fut).await
}

/// Snapshot of the ambient scope, if any.
pub fn current() -> Option<RequestScope> {
    SCOPE.try_with(ScopeHandle::snapshot).ok()
}

/// Handle to the ambient scope, if any.
pub fn current_handle() -> Option<ScopeHandle> {
    SCOPE.try_with(ScopeHandle::clone).ok()
}

/// Mutate the ambient scope in place.
pub fn set(key: ScopeKey, value: impl Into<String>) -> Result<(), ContextError> {
    let value = value.into();
    SCOPE
        .try_with(|handle| handle.set(key, value))
        .map_err(|_| ContextError::NoActiveScope)
}

/// Carry the ambient scope (if any) into a future that will be spawned.
pub fn propagate<F>(fut: F) -> impl Future<Output = F::Output> + Send
where
    F: Future + Send,
    F::Output: Send,
{
    let handle = current_handle();
    async move {
        match handle {
            Some(handle) => handle.enter(fut).await,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_current_is_none_outside_scope() {
        assert!(current().is_none());
        assert_eq!(set(ScopeKey::OrgId, "acme"), Err(ContextError::NoActiveScope));
    }

    #[tokio::test]
    async fn test_scope_survives_await_points() {
        let seen = begin(RequestScope::new("r1", "t1"), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tokio::task::yield_now().await;
            current().unwrap()
        })
        .await;
        assert_eq!(seen.request_id, "r1");
        assert_eq!(seen.trace_id, "t1");
    }

    #[tokio::test]
    async fn test_set_is_visible_after_scope_exits() {
        let handle = ScopeHandle::new(RequestScope::new("r1", "t1"));
        handle
            .clone()
            .enter(async {
                set(ScopeKey::OrgId, "acme").unwrap();
                set(ScopeKey::UserId, "u1").unwrap();
            })
            .await;
        let scope = handle.snapshot();
        assert_eq!(scope.org_id.as_deref(), Some("acme"));
        assert_eq!(scope.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_do_not_share_scope() {
        let mut tasks = Vec::new();
        for i in 0..32 {
            tasks.push(tokio::spawn(begin(
                RequestScope::new(format!("req-{i}"), format!("trace-{i}")),
                async move {
                    set(ScopeKey::OrgId, format!("org-{i}")).unwrap();
                    for _ in 0..5 {
                        tokio::task::yield_now().await;
                        let scope = current().unwrap();
                        assert_eq!(scope.request_id, format!("req-{i}"));
                        assert_eq!(scope.org_id, Some(format!("org-{i}")));
                    }
                },
            )));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_propagate_carries_scope_into_spawned_task() {
        let seen = begin(RequestScope::new("r9", "t9"), async {
            tokio::spawn(propagate(async { current().map(|s| s.request_id) }))
                .await
                .unwrap()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("r9"));
    }
}
