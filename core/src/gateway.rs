//! Authenticated request gateway.
//!
//! # Design
//! The gateway attaches the session's bearer token to every request and
//! recovers from a 401 by refreshing the token once, no matter how many
//! requests were rejected at the same time. Its state is an owned value:
//!
//! ```text
//! Idle --(401)--> Refreshing(queue) --(refresh settles)--> Idle
//! ```
//!
//! The first rejected request becomes the leader and performs the refresh.
//! Requests rejected while the refresh is in flight join the queue and are
//! released in arrival order when it settles. On success every waiter gets
//! the new session and replays its own request; on failure the session is
//! cleared and every waiter is rejected with the same `RefreshFailed` error.
//!
//! The state mutex is only taken between suspension points and never held
//! across an `.await`. A drop guard settles the queue if the leader is
//! cancelled, so the gateway can never be stuck in `Refreshing`. A login or
//! logout that lands while the refresh is in flight is not overwritten by it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::TodoClient;
use crate::error::ApiError;
use crate::http::{HttpRequest, HttpResponse};
use crate::session::Session;
use crate::transport::Transport;

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// A request waiting for the in-flight refresh to settle.
struct QueuedRequest {
    label: String,
    reply: oneshot::Sender<Result<Session, ApiError>>,
}

enum RefreshState {
    Idle,
    Refreshing(VecDeque<QueuedRequest>),
}

struct GatewayState {
    session: Option<Session>,
    /// Bumped by every `set_session`. A refresh only installs its outcome if
    /// the epoch it started under still holds.
    epoch: u64,
    refresh: RefreshState,
}

/// What a rejected request has to do to obtain a usable token.
enum Recovery {
    /// The session changed after the request was sent; reuse it.
    Current(Session),
    /// No refresh in flight; this request performs it under the given epoch.
    Lead(u64),
    /// A refresh is in flight; wait for it.
    Wait(oneshot::Receiver<Result<Session, ApiError>>),
}

pub struct Gateway<T> {
    client: TodoClient,
    transport: T,
    state: Mutex<GatewayState>,
    refresh_timeout: Option<Duration>,
}

impl<T> Gateway<T> {
    pub fn new(client: TodoClient, transport: T) -> Self {
        Self {
            client,
            transport,
            state: Mutex::new(GatewayState {
                session: None,
                epoch: 0,
                refresh: RefreshState::Idle,
            }),
            refresh_timeout: Some(DEFAULT_REFRESH_TIMEOUT),
        }
    }

    /// `None` lets the refresh call run as long as the transport allows.
    pub fn with_refresh_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn client(&self) -> &TodoClient {
        &self.client
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    /// Replace the session. A refresh still in flight will not overwrite it.
    pub fn set_session(&self, session: Option<Session>) {
        let mut state = self.lock();
        state.session = session;
        state.epoch += 1;
    }

    pub fn clear_session(&self) {
        self.set_session(None);
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.lock().refresh, RefreshState::Refreshing(_))
    }

    fn current_token(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.access_token.clone())
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter_recovery(&self, sent_token: Option<&str>, label: String) -> Recovery {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(session) = &state.session {
            if Some(session.access_token.as_str()) != sent_token {
                return Recovery::Current(session.clone());
            }
        }
        match &mut state.refresh {
            RefreshState::Idle => {
                state.refresh = RefreshState::Refreshing(VecDeque::new());
                Recovery::Lead(state.epoch)
            }
            RefreshState::Refreshing(queue) => {
                let (reply, receiver) = oneshot::channel();
                debug!(request = %label, position = queue.len(), "refresh in flight, queueing");
                queue.push_back(QueuedRequest { label, reply });
                Recovery::Wait(receiver)
            }
        }
    }

    /// Install the refresh outcome, return to `Idle` and release the queue in
    /// arrival order. Returns what the leader and every waiter receive.
    ///
    /// If the session was replaced while the refresh was in flight, the
    /// outcome is discarded: the newer session stays and is handed out
    /// instead, or `RefreshAbandoned` if the user logged out.
    fn settle(&self, epoch: u64, outcome: Result<Session, ApiError>) -> Result<Session, ApiError> {
        let (outcome, queued) = {
            let mut state = self.lock();
            let outcome = if state.epoch == epoch {
                state.session = outcome.as_ref().ok().cloned();
                outcome
            } else {
                debug!("session changed during refresh, keeping it");
                state.session.clone().ok_or(ApiError::RefreshAbandoned)
            };
            let queued = match std::mem::replace(&mut state.refresh, RefreshState::Idle) {
                RefreshState::Refreshing(queue) => queue,
                RefreshState::Idle => VecDeque::new(),
            };
            (outcome, queued)
        };

        match &outcome {
            Ok(session) => info!(user = %session.email, queued = queued.len(), "access token refreshed"),
            Err(err) => warn!(%err, queued = queued.len(), "token refresh failed, session cleared"),
        }

        for (position, waiting) in queued.into_iter().enumerate() {
            debug!(request = %waiting.label, position, "releasing queued request");
            // The waiter may have been dropped; nothing to deliver then.
            let _ = waiting.reply.send(outcome.clone());
        }
        outcome
    }
}

impl<T: Transport> Gateway<T> {
    /// Send a request that does not need a bearer token.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.transport.execute(request).await
    }

    /// Send `request` with the session's bearer token, falling back to
    /// `token_override` when there is no session. A 401 triggers (or joins)
    /// the shared refresh and the request is replayed once with the new token.
    pub async fn request(
        &self,
        request: HttpRequest,
        token_override: Option<&str>,
    ) -> Result<HttpResponse, ApiError> {
        let Some(token) = self
            .current_token()
            .or_else(|| token_override.map(str::to_string))
        else {
            debug!(request = %request.label(), "no access token, refreshing first");
            return self.recover(request, None).await;
        };

        let request = request.with_bearer(&token);
        let response = self.transport.execute(request.clone()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(request = %request.label(), "access token rejected");
        self.recover(request, Some(token.as_str())).await
    }

    /// Refresh the session through the same single-flight path as a 401.
    /// Joins a refresh already in flight instead of starting another.
    pub async fn refresh_session(&self) -> Result<Session, ApiError> {
        let current = self.current_token();
        self.fresh_session(current.as_deref(), "session refresh".to_string())
            .await
    }

    async fn recover(
        &self,
        request: HttpRequest,
        sent_token: Option<&str>,
    ) -> Result<HttpResponse, ApiError> {
        let session = self.fresh_session(sent_token, request.label()).await?;
        let replay = request.with_bearer(&session.access_token);
        debug!(request = %replay.label(), "replaying with refreshed token");
        self.transport.execute(replay).await
    }

    async fn fresh_session(&self, sent_token: Option<&str>, label: String) -> Result<Session, ApiError> {
        match self.enter_recovery(sent_token, label) {
            Recovery::Current(session) => Ok(session),
            Recovery::Wait(receiver) => receiver
                .await
                .unwrap_or_else(|_| Err(ApiError::RefreshAbandoned)),
            Recovery::Lead(epoch) => self.lead_refresh(epoch).await,
        }
    }

    async fn lead_refresh(&self, epoch: u64) -> Result<Session, ApiError> {
        let mut guard = RefreshGuard {
            gateway: self,
            epoch,
            settled: false,
        };
        info!("refreshing access token");

        let outcome = self.call_refresh().await.map_err(ApiError::refresh_failed);
        guard.settle(outcome)
    }

    async fn call_refresh(&self) -> Result<Session, ApiError> {
        let call = async {
            let response = self
                .transport
                .execute(self.client.build_refresh_token())
                .await?;
            self.client.parse_session(response)
        };
        match self.refresh_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ApiError::Timeout("token refresh".to_string()))?,
            None => call.await,
        }
    }
}

/// Returns the gateway to `Idle` even if the leader is dropped mid-refresh.
struct RefreshGuard<'a, T> {
    gateway: &'a Gateway<T>,
    epoch: u64,
    settled: bool,
}

impl<T> RefreshGuard<'_, T> {
    fn settle(&mut self, outcome: Result<Session, ApiError>) -> Result<Session, ApiError> {
        self.settled = true;
        self.gateway.settle(self.epoch, outcome)
    }
}

impl<T> Drop for RefreshGuard<'_, T> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("token refresh abandoned before it settled");
            let _ = self.gateway.settle(self.epoch, Err(ApiError::RefreshAbandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use futures::future::join_all;

    use super::*;
    use crate::http::HttpMethod;
    use crate::session::tests::token_for;

    const BASE_URL: &str = "http://localhost:4000";

    /// Scripted API: accepts exactly one valid token, rotates it on refresh
    /// and records what it saw.
    struct FakeApi {
        valid_token: Mutex<String>,
        refresh_calls: AtomicUsize,
        fail_refresh: AtomicBool,
        log: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                valid_token: Mutex::new(token_for("Ada", "Lovelace", "ada+0@example.com")),
                refresh_calls: AtomicUsize::new(0),
                fail_refresh: AtomicBool::new(false),
                log: Mutex::new(Vec::new()),
            }
        }

        fn valid_token(&self) -> String {
            self.valid_token.lock().unwrap().clone()
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn replays(&self) -> Vec<String> {
            self.log()
                .into_iter()
                .filter(|entry| entry.ends_with(" ok"))
                .collect()
        }
    }

    fn response(status: u16, body: String) -> HttpResponse {
        HttpResponse {
            status,
            headers: Vec::new(),
            body,
        }
    }

    impl Transport for FakeApi {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
            let path = request.path.trim_start_matches(BASE_URL).to_string();
            if path == "/api/refresh-token" {
                let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
                self.record("refresh".to_string());
                tokio::task::yield_now().await;
                if self.fail_refresh.load(Ordering::SeqCst) {
                    return Ok(response(401, r#"{"error":"refresh token expired"}"#.to_string()));
                }
                let token = token_for("Ada", "Lovelace", &format!("ada+{n}@example.com"));
                *self.valid_token.lock().unwrap() = token.clone();
                return Ok(response(200, serde_json::json!({ "access_token": token }).to_string()));
            }

            let authorized = request.bearer_token() == Some(self.valid_token().as_str());
            if authorized {
                self.record(format!("{path} ok"));
                Ok(response(200, "[]".to_string()))
            } else {
                self.record(format!("{path} 401"));
                Ok(response(401, String::new()))
            }
        }
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Get,
            path: format!("{BASE_URL}{path}"),
            headers: Vec::new(),
            body: None,
        }
    }

    fn gateway() -> Gateway<FakeApi> {
        Gateway::new(TodoClient::new(BASE_URL), FakeApi::new())
    }

    fn stale_session() -> Session {
        Session::from_access_token(token_for("Ada", "Lovelace", "stale@example.com")).unwrap()
    }

    #[tokio::test]
    async fn valid_token_is_attached_and_no_refresh_happens() {
        let gateway = gateway();
        let token = gateway.transport().valid_token();
        gateway.set_session(Some(Session::from_access_token(token).unwrap()));

        let response = gateway.request(get("/api/todos"), None).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(gateway.transport().refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_override_is_used_without_session() {
        let gateway = gateway();
        let token = gateway.transport().valid_token();

        let response = gateway.request(get("/api/todos"), Some(token.as_str())).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(gateway.transport().refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn session_token_wins_over_override() {
        let gateway = gateway();
        let token = gateway.transport().valid_token();
        gateway.set_session(Some(Session::from_access_token(token).unwrap()));

        let response = gateway
            .request(get("/api/todos"), Some("not-a-real-token"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(gateway.transport().log(), vec!["/api/todos ok".to_string()]);
    }

    #[tokio::test]
    async fn missing_token_refreshes_before_first_attempt() {
        let gateway = gateway();

        let response = gateway.request(get("/api/todos"), None).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            gateway.transport().log(),
            vec!["refresh".to_string(), "/api/todos ok".to_string()]
        );
        assert_eq!(gateway.session().unwrap().email, "ada+1@example.com");
    }

    #[tokio::test]
    async fn single_401_refreshes_and_replays() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));

        let response = gateway.request(get("/api/todos"), None).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            gateway.transport().log(),
            vec![
                "/api/todos 401".to_string(),
                "refresh".to_string(),
                "/api/todos ok".to_string(),
            ]
        );
        let session = gateway.session().unwrap();
        assert_eq!(session.access_token, gateway.transport().valid_token());
        assert!(!gateway.is_refreshing());
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));

        let paths = ["/api/a", "/api/b", "/api/c", "/api/d"];
        let results = join_all(paths.iter().map(|p| gateway.request(get(p), None))).await;

        for result in results {
            assert_eq!(result.unwrap().status, 200);
        }
        assert_eq!(gateway.transport().refresh_calls.load(Ordering::SeqCst), 1);
        assert!(!gateway.is_refreshing());
    }

    #[tokio::test]
    async fn queued_requests_replay_in_arrival_order_after_refresh() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));

        let paths = ["/api/a", "/api/b", "/api/c", "/api/d"];
        join_all(paths.iter().map(|p| gateway.request(get(p), None))).await;

        let log = gateway.transport().log();
        let refresh_at = log.iter().position(|e| e == "refresh").unwrap();
        let first_replay = log.iter().position(|e| e.ends_with(" ok")).unwrap();
        assert!(refresh_at < first_replay);
        assert_eq!(
            gateway.transport().replays(),
            vec!["/api/a ok", "/api/b ok", "/api/c ok", "/api/d ok"]
        );
    }

    #[tokio::test]
    async fn failed_refresh_rejects_leader_and_queue_and_returns_to_idle() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));
        gateway.transport().fail_refresh.store(true, Ordering::SeqCst);

        let paths = ["/api/a", "/api/b", "/api/c"];
        let results = join_all(paths.iter().map(|p| gateway.request(get(p), None))).await;

        for result in results {
            match result.unwrap_err() {
                ApiError::RefreshFailed(cause) => assert!(matches!(*cause, ApiError::Unauthorized)),
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(!gateway.is_refreshing());
        assert!(gateway.session().is_none());
        assert!(gateway.transport().replays().is_empty());

        // A later request starts a fresh refresh instead of hanging.
        gateway.transport().fail_refresh.store(false, Ordering::SeqCst);
        let response = gateway.request(get("/api/todos"), None).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(gateway.transport().refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejection_after_refresh_settled_reuses_new_token() {
        let gateway = gateway();
        let token = gateway.transport().valid_token();
        gateway.set_session(Some(Session::from_access_token(token).unwrap()));

        let stale = stale_session().access_token;
        let response = gateway
            .recover(get("/api/todos"), Some(stale.as_str()))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(gateway.transport().refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replay_rejected_again_is_returned_as_is() {
        struct AlwaysUnauthorized;

        impl Transport for AlwaysUnauthorized {
            async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
                if request.path.ends_with("/api/refresh-token") {
                    let token = token_for("Ada", "Lovelace", "a@b.com");
                    return Ok(response(200, serde_json::json!({ "access_token": token }).to_string()));
                }
                Ok(response(401, String::new()))
            }
        }

        let gateway = Gateway::new(TodoClient::new(BASE_URL), AlwaysUnauthorized);
        gateway.set_session(Some(stale_session()));

        let response = gateway.request(get("/api/todos"), None).await.unwrap();
        assert_eq!(response.status, 401);
        assert!(!gateway.is_refreshing());
    }

    #[tokio::test]
    async fn explicit_refresh_installs_session() {
        let gateway = gateway();

        let session = gateway.refresh_session().await.unwrap();
        assert_eq!(session.email, "ada+1@example.com");
        assert_eq!(gateway.session(), Some(session));
    }

    #[tokio::test]
    async fn explicit_refresh_joins_in_flight_refresh() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));

        let (response, session) = tokio::join!(
            gateway.request(get("/api/todos"), None),
            gateway.refresh_session()
        );
        assert_eq!(response.unwrap().status, 200);
        assert_eq!(session.unwrap().email, "ada+1@example.com");
        assert_eq!(gateway.transport().refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_leader_releases_queue_and_returns_to_idle() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));

        let mut leader = Box::pin(gateway.request(get("/api/a"), None));
        assert!(futures::poll!(&mut leader).is_pending());
        assert!(gateway.is_refreshing());

        let mut waiter = Box::pin(gateway.request(get("/api/b"), None));
        assert!(futures::poll!(&mut waiter).is_pending());

        drop(leader);
        assert!(!gateway.is_refreshing());
        assert!(matches!(waiter.await, Err(ApiError::RefreshAbandoned)));
    }

    #[tokio::test]
    async fn logout_during_refresh_is_not_undone() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));

        let mut leader = Box::pin(gateway.request(get("/api/a"), None));
        assert!(futures::poll!(&mut leader).is_pending());
        let mut waiter = Box::pin(gateway.request(get("/api/b"), None));
        assert!(futures::poll!(&mut waiter).is_pending());

        gateway.clear_session();

        assert!(matches!(leader.await, Err(ApiError::RefreshAbandoned)));
        assert!(matches!(waiter.await, Err(ApiError::RefreshAbandoned)));
        assert!(gateway.session().is_none());
        assert!(!gateway.is_refreshing());
        assert!(gateway.transport().replays().is_empty());
    }

    #[tokio::test]
    async fn login_during_failed_refresh_keeps_new_session() {
        let gateway = gateway();
        gateway.set_session(Some(stale_session()));
        gateway.transport().fail_refresh.store(true, Ordering::SeqCst);

        let mut leader = Box::pin(gateway.refresh_session());
        assert!(futures::poll!(&mut leader).is_pending());

        let token = token_for("Grace", "Hopper", "grace@example.com");
        let fresh = Session::from_access_token(token).unwrap();
        gateway.set_session(Some(fresh.clone()));

        assert_eq!(leader.await.unwrap(), fresh);
        assert_eq!(gateway.session(), Some(fresh));
        assert!(!gateway.is_refreshing());
    }

    #[tokio::test]
    async fn refresh_timeout_fails_the_refresh() {
        struct HangingRefresh;

        impl Transport for HangingRefresh {
            async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
                if request.path.ends_with("/api/refresh-token") {
                    std::future::pending::<()>().await;
                }
                Ok(response(401, String::new()))
            }
        }

        let gateway = Gateway::new(TodoClient::new(BASE_URL), HangingRefresh)
            .with_refresh_timeout(Some(Duration::from_millis(20)));
        gateway.set_session(Some(stale_session()));

        let err = gateway.request(get("/api/todos"), None).await.unwrap_err();
        match err {
            ApiError::RefreshFailed(cause) => assert!(matches!(*cause, ApiError::Timeout(_))),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!gateway.is_refreshing());
    }
}
