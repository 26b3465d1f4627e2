//! `TodoApp`: the logged-in user and their todo list.
//!
//! Auth calls go through the gateway unauthenticated and install the decoded
//! session; todo calls go through the authenticated path and replace the
//! cached list with whatever the server returns.

use tracing::{debug, info, warn};

use crate::client::TodoClient;
use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::gateway::Gateway;
use crate::http::{HttpRequest, HttpResponse};
use crate::session::Session;
use crate::store::TodoCache;
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{CreateTodo, LoginRequest, RegisterRequest, Todo, UpdateTodo};

type ParseTodos = fn(&TodoClient, HttpResponse) -> Result<Vec<Todo>, ApiError>;

pub struct TodoApp<T> {
    gateway: Gateway<T>,
    cache: TodoCache,
}

impl TodoApp<ReqwestTransport> {
    pub fn connect(config: &ClientConfig) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        let gateway = Gateway::new(TodoClient::new(&config.base_url), transport)
            .with_refresh_timeout(config.refresh_timeout);
        Ok(Self::new(gateway))
    }
}

impl<T> TodoApp<T> {
    pub fn new(gateway: Gateway<T>) -> Self {
        Self {
            gateway,
            cache: TodoCache::new(),
        }
    }

    pub fn gateway(&self) -> &Gateway<T> {
        &self.gateway
    }

    pub fn current_user(&self) -> Option<Session> {
        self.gateway.session()
    }

    pub fn cached_todos(&self) -> Option<Vec<Todo>> {
        self.cache.get()
    }

    fn client(&self) -> &TodoClient {
        self.gateway.client()
    }

    fn sign_in(&self, session: Session) -> Session {
        info!(user = %session.email, name = %session.display_name(), "signed in");
        self.cache.clear();
        self.gateway.set_session(Some(session.clone()));
        session
    }
}

impl<T: Transport> TodoApp<T> {
    pub async fn login(&self, input: &LoginRequest) -> Result<Session, ApiError> {
        let request = self.client().build_login(input)?;
        let response = self.gateway.execute(request).await?;
        let session = self.client().parse_session(response)?;
        Ok(self.sign_in(session))
    }

    pub async fn register(&self, input: &RegisterRequest) -> Result<Session, ApiError> {
        let request = self.client().build_register(input)?;
        let response = self.gateway.execute(request).await?;
        let session = self.client().parse_session(response)?;
        Ok(self.sign_in(session))
    }

    /// Revoke the refresh credential. The local session and cache are
    /// dropped even when the call fails.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = match self.gateway.execute(self.client().build_logout()).await {
            Ok(response) => self.client().parse_logout(response).map(|_| ()),
            Err(err) => Err(err),
        };
        self.gateway.clear_session();
        self.cache.clear();
        match &result {
            Ok(()) => info!("logged out"),
            Err(err) => warn!(%err, "logout call failed, session cleared locally"),
        }
        result
    }

    /// Pick up an existing login from the refresh cookie. A failed refresh
    /// means nobody is logged in.
    pub async fn restore_session(&self) -> Result<Option<Session>, ApiError> {
        match self.gateway.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(ApiError::RefreshFailed(cause)) => {
                debug!(%cause, "no session to restore");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The cached list if one is loaded, otherwise fetched from the server.
    /// Without a session the cache is never served.
    pub async fn todos(&self) -> Result<Vec<Todo>, ApiError> {
        match self.cache.get() {
            Some(todos) if self.current_user().is_some() => Ok(todos),
            _ => self.reload_todos().await,
        }
    }

    pub async fn reload_todos(&self) -> Result<Vec<Todo>, ApiError> {
        let request = self.client().build_list_todos();
        self.send_todos(request, "list", TodoClient::parse_list_todos)
            .await
    }

    pub async fn create_todo(&self, input: &CreateTodo) -> Result<Vec<Todo>, ApiError> {
        let request = self.client().build_create_todo(input)?;
        self.send_todos(request, "create", TodoClient::parse_todo_mutation)
            .await
    }

    pub async fn update_todo(&self, id: u64, input: &UpdateTodo) -> Result<Vec<Todo>, ApiError> {
        let request = self.client().build_update_todo(id, input)?;
        self.send_todos(request, "update", TodoClient::parse_todo_mutation)
            .await
    }

    pub async fn toggle_todo(&self, id: u64) -> Result<Vec<Todo>, ApiError> {
        let request = self.client().build_toggle_todo(id);
        self.send_todos(request, "toggle", TodoClient::parse_todo_mutation)
            .await
    }

    async fn send_todos(
        &self,
        request: HttpRequest,
        action: &'static str,
        parse: ParseTodos,
    ) -> Result<Vec<Todo>, ApiError> {
        let result = match self.gateway.request(request, None).await {
            Ok(response) => parse(self.client(), response),
            Err(err) => Err(err),
        };
        match result {
            Ok(todos) if self.current_user().is_none() => {
                debug!(action, "session ended while in flight, not caching");
                self.cache.clear();
                Ok(todos)
            }
            Ok(todos) => {
                debug!(action, count = todos.len(), "todo list updated");
                self.cache.replace(todos.clone());
                Ok(todos)
            }
            Err(err @ (ApiError::RefreshFailed(_) | ApiError::RefreshAbandoned)) => {
                warn!(%err, action, "session lost, dropping cached todos");
                self.cache.clear();
                Err(err)
            }
            Err(err) => {
                warn!(%err, action, "todo request failed");
                Err(err)
            }
        }
    }
}
