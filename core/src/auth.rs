//! Login, registration, logout and refresh-token endpoints.
//!
//! These calls carry no bearer token. Login, register and refresh answer with
//! `{access_token}`, which is decoded straight into a `Session`. The refresh
//! credential travels as an HTTP-only cookie handled by the transport.

use crate::client::{parse_json, TodoClient};
use crate::error::ApiError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::session::Session;
use crate::types::{LoginRequest, MessageResponse, RegisterRequest, TokenResponse};

impl TodoClient {
    pub fn build_login(&self, input: &LoginRequest) -> Result<HttpRequest, ApiError> {
        self.json_request(HttpMethod::Post, "/api/login", input)
    }

    pub fn build_register(&self, input: &RegisterRequest) -> Result<HttpRequest, ApiError> {
        self.json_request(HttpMethod::Post, "/api/register", input)
    }

    pub fn build_logout(&self) -> HttpRequest {
        self.request(HttpMethod::Post, "/api/logout")
    }

    pub fn build_refresh_token(&self) -> HttpRequest {
        self.request(HttpMethod::Post, "/api/refresh-token")
    }

    /// Parse a login, register or refresh-token response into a session.
    pub fn parse_session(&self, response: HttpResponse) -> Result<Session, ApiError> {
        let token: TokenResponse = parse_json(response, 200)?;
        Session::from_access_token(token.access_token)
    }

    pub fn parse_logout(&self, response: HttpResponse) -> Result<MessageResponse, ApiError> {
        parse_json(response, 200)
    }
}
