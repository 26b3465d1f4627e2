use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub const REFRESH_COOKIE: &str = "refresh_token";
pub const DEFAULT_SECRET: &[u8] = b"mock-server-secret";
const ISSUER: &str = "todo-mock";
const ACCESS_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Todo {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub done: bool,
}

#[derive(Deserialize)]
pub struct CreateTodo {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Deserialize)]
pub struct UpdateTodo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUser {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Access token payload. `gen` lets tests expire every outstanding token at
/// once.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(rename = "gen")]
    pub generation: u64,
    pub exp: u64,
    pub iss: String,
}

#[derive(Clone)]
struct User {
    id: Uuid,
    first_name: String,
    last_name: String,
    email: String,
    password: String,
}

/// Shared server state: users, refresh credentials and per-user todos.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    secret: Vec<u8>,
    users: RwLock<HashMap<String, User>>,
    refresh_tokens: RwLock<HashMap<Uuid, String>>,
    todos: RwLock<HashMap<String, Vec<Todo>>>,
    next_todo_id: AtomicU64,
    generation: AtomicU64,
    refresh_calls: AtomicUsize,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET)
    }
}

impl AppState {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            inner: Arc::new(Inner {
                secret: secret.to_vec(),
                users: RwLock::new(HashMap::new()),
                refresh_tokens: RwLock::new(HashMap::new()),
                todos: RwLock::new(HashMap::new()),
                next_todo_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                refresh_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Invalidate every access token issued so far. Refresh cookies stay valid.
    pub fn expire_access_tokens(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of hits on `/api/refresh-token`, successful or not.
    pub fn refresh_calls(&self) -> usize {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    fn issue_access_token(&self, user: &User) -> Result<String, ApiFailure> {
        let claims = AccessClaims {
            id: user.id.to_string(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            email: user.email.clone(),
            generation: self.inner.generation.load(Ordering::SeqCst),
            exp: now_secs() + ACCESS_TOKEN_TTL_SECS,
            iss: ISSUER.to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.inner.secret),
        )
        .map_err(|e| {
            warn!(error = %e, "failed to sign access token");
            ApiFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate JWT")
        })
    }

    fn verify(&self, headers: &HeaderMap) -> Result<AccessClaims, ApiFailure> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiFailure::unauthorized("missing bearer token"))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        let claims = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(&self.inner.secret),
            &validation,
        )
        .map_err(|_| ApiFailure::unauthorized("invalid access token"))?
        .claims;

        if claims.generation < self.inner.generation.load(Ordering::SeqCst) {
            return Err(ApiFailure::unauthorized("access token expired"));
        }
        Ok(claims)
    }

    /// Issue an access token plus a fresh refresh cookie for `user`.
    async fn start_session(&self, user: &User) -> Result<Response, ApiFailure> {
        let access_token = self.issue_access_token(user)?;
        let refresh_id = Uuid::new_v4();
        self.inner
            .refresh_tokens
            .write()
            .await
            .insert(refresh_id, user.email.clone());

        let cookie = format!("{REFRESH_COOKIE}={refresh_id}; HttpOnly; Path=/; SameSite=Lax");
        Ok((
            StatusCode::OK,
            [(header::SET_COOKIE, cookie)],
            Json(json!({ "access_token": access_token })),
        )
            .into_response())
    }
}

/// Error body in the `{"error": ...}` shape the API uses.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiFailure {
    fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }

    fn unauthorized(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn missing_fields(fields: Vec<&'static str>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": "Todo is missing fields", "fields": fields }),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/refresh-token", post(refresh_token))
        .route("/api/todos", get(list_todos).post(create_todo))
        .route("/api/todos/{id}", put(update_todo))
        .route("/api/todos/{id}/status", patch(toggle_todo))
        .with_state(state)
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn refresh_cookie(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == REFRESH_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value).ok())
}

async fn register(
    State(state): State<AppState>,
    Json(input): Json<RegisterUser>,
) -> Result<Response, ApiFailure> {
    if input.email.is_empty() || input.password.is_empty() {
        return Err(ApiFailure::new(StatusCode::BAD_REQUEST, "Failed to register"));
    }

    let user = {
        let mut users = state.inner.users.write().await;
        if users.contains_key(&input.email) {
            return Err(ApiFailure::new(StatusCode::CONFLICT, "Failed to register"));
        }
        let user = User {
            id: Uuid::new_v4(),
            first_name: input.first_name,
            last_name: input.last_name,
            email: input.email,
            password: input.password,
        };
        users.insert(user.email.clone(), user.clone());
        user
    };

    info!(email = %user.email, "user registered");
    state.start_session(&user).await
}

async fn login(
    State(state): State<AppState>,
    Json(input): Json<Credentials>,
) -> Result<Response, ApiFailure> {
    let user = state
        .inner
        .users
        .read()
        .await
        .get(&input.email)
        .filter(|user| user.password == input.password)
        .cloned()
        .ok_or_else(|| ApiFailure::unauthorized("Failed to login"))?;

    // A new login revokes the user's older refresh credentials.
    state
        .inner
        .refresh_tokens
        .write()
        .await
        .retain(|_, email| *email != user.email);

    info!(email = %user.email, "user logged in");
    state.start_session(&user).await
}

async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiFailure> {
    state.inner.refresh_calls.fetch_add(1, Ordering::SeqCst);

    let refresh_id = refresh_cookie(&headers).ok_or_else(|| ApiFailure::unauthorized("missing refresh token"))?;
    let email = state
        .inner
        .refresh_tokens
        .read()
        .await
        .get(&refresh_id)
        .cloned()
        .ok_or_else(|| ApiFailure::unauthorized("unknown refresh token"))?;
    let user = state
        .inner
        .users
        .read()
        .await
        .get(&email)
        .cloned()
        .ok_or_else(|| ApiFailure::unauthorized("unknown user"))?;

    let access_token = state.issue_access_token(&user)?;
    info!(email = %user.email, "access token refreshed");
    Ok(Json(json!({ "access_token": access_token })).into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(refresh_id) = refresh_cookie(&headers) {
        state.inner.refresh_tokens.write().await.remove(&refresh_id);
    }
    let cookie = format!("{REFRESH_COOKIE}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0");
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "message": "Successfully logged out" })),
    )
        .into_response()
}

async fn list_todos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Todo>>, ApiFailure> {
    let claims = state.verify(&headers)?;
    let todos = state.inner.todos.read().await;
    Ok(Json(todos.get(&claims.email).cloned().unwrap_or_default()))
}

async fn create_todo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateTodo>,
) -> Result<Json<Vec<Todo>>, ApiFailure> {
    let claims = state.verify(&headers)?;
    if input.title.is_empty() {
        return Err(ApiFailure::missing_fields(vec!["title"]));
    }

    let todo = Todo {
        id: state.inner.next_todo_id.fetch_add(1, Ordering::SeqCst),
        title: input.title,
        body: input.body,
        done: false,
    };
    let mut todos = state.inner.todos.write().await;
    let list = todos.entry(claims.email).or_default();
    list.push(todo);
    Ok(Json(list.clone()))
}

async fn update_todo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(input): Json<UpdateTodo>,
) -> Result<Json<Vec<Todo>>, ApiFailure> {
    let claims = state.verify(&headers)?;

    let mut todos = state.inner.todos.write().await;
    let list = todos.entry(claims.email).or_default();
    let todo = list
        .iter_mut()
        .find(|todo| todo.id == id)
        .ok_or_else(|| ApiFailure::new(StatusCode::NOT_FOUND, "Todo not found"))?;

    let mut missing = Vec::new();
    if input.title.is_empty() {
        missing.push("title");
    }
    if input.body.is_empty() {
        missing.push("body");
    }
    if !missing.is_empty() {
        return Err(ApiFailure::missing_fields(missing));
    }

    todo.title = input.title;
    todo.body = input.body;
    Ok(Json(list.clone()))
}

async fn toggle_todo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Vec<Todo>>, ApiFailure> {
    let claims = state.verify(&headers)?;

    let mut todos = state.inner.todos.write().await;
    let list = todos.entry(claims.email).or_default();
    let todo = list
        .iter_mut()
        .find(|todo| todo.id == id)
        .ok_or_else(|| ApiFailure::new(StatusCode::NOT_FOUND, "Todo not found"))?;
    todo.done = !todo.done;
    Ok(Json(list.clone()))
}
