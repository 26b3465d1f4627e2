//! In-memory session decoded from the access token.
//!
//! The claims are read from the JWT payload without checking the signature.
//! They are only used to show who is logged in; the server verifies every
//! token it receives.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::error::ApiError;

/// Claims carried in the access token payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    #[serde(default)]
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub exp: Option<u64>,
}

impl TokenClaims {
    /// Decode the payload segment of a compact JWT. Unverified.
    pub fn decode_unverified(token: &str) -> Result<Self, ApiError> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(ApiError::InvalidToken("expected three segments".to_string())),
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ApiError::InvalidToken(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidToken(e.to_string()))
    }
}

/// The currently authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub access_token: String,
}

impl Session {
    pub fn from_access_token(access_token: String) -> Result<Self, ApiError> {
        let claims = TokenClaims::decode_unverified(&access_token)?;
        Ok(Self {
            first_name: claims.first_name,
            last_name: claims.last_name,
            email: claims.email,
            access_token,
        })
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}
