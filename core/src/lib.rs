//! Client core for the authenticated todo API.
//!
//! # Overview
//! `TodoClient` builds `HttpRequest` values and parses `HttpResponse` values
//! without touching the network. A `Transport` performs the round-trip, and
//! the `Gateway` sits between the two: it attaches the bearer token and, when
//! the server answers 401, refreshes the token once and replays every
//! request that was rejected in the meantime. `TodoApp` ties the login flow
//! and the cached todo list on top.
//!
//! # Design
//! - `TodoClient` is stateless; it holds only `base_url`.
//! - Gateway state (`Idle | Refreshing(queue)`) is owned by the gateway
//!   instance, never global.
//! - Access-token claims are decoded without signature verification and used
//!   for display only.
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use app::TodoApp;
pub use client::TodoClient;
pub use config::{ClientConfig, ConfigError};
pub use error::ApiError;
pub use gateway::Gateway;
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use session::{Session, TokenClaims};
pub use store::TodoCache;
pub use transport::{ReqwestTransport, Transport};
pub use types::{CreateTodo, LoginRequest, MessageResponse, RegisterRequest, Todo, TokenResponse, UpdateTodo};
