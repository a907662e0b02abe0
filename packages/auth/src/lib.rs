#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

//! Bearer credential verification and document access checks.
//!
//! Token issuance is the account service's concern; this crate only
//! verifies the HS256 access tokens it issues and resolves whether the
//! verified user may open a given document.

use async_trait::async_trait;
use codocs_session::Identity;
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by an access token.
///
/// Matches the shape the account service signs: the user's id and email,
/// optional role names, and the standard issued-at/expiry timestamps.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id the token was issued to.
    pub id: u64,
    /// Email of the user.
    pub email: String,
    /// Role names, when the issuer includes them.
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    /// Issued-at time (Unix timestamp).
    #[serde(default)]
    pub iat: u64,
    /// Expiration time (Unix timestamp).
    pub exp: u64,
}

/// Errors that can occur when verifying a credential.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,
}

/// Verifies bearer access tokens against the shared signing secret.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            validation: Validation::default(),
        }
    }

    /// Verifies a credential and yields the identity it was issued to.
    ///
    /// # Errors
    ///
    /// * [`AuthError::Unauthorized`] if the token is malformed, has an
    ///   invalid signature, or has expired
    pub fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let token_data = decode::<Claims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| {
                log::debug!("Token verification failed: {e:?}");
                AuthError::Unauthorized
            })?;

        Ok(Identity::new(token_data.claims.id, token_data.claims.email))
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{TokenVerifier}}")
    }
}

/// Handle to a document the user is permitted to open.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DocumentHandle {
    /// Id of the document.
    pub id: u64,
}

/// Errors that can occur while resolving document access.
#[derive(Debug, Error)]
pub enum DocumentLookupError {
    /// The document service could not be reached
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// The document service answered with an unexpected status
    #[error("Unexpected status {0}")]
    UnexpectedStatus(u16),
}

/// Decides whether a user may open a document.
///
/// `Ok(None)` means access was denied; errors mean the decision itself
/// could not be made.
#[async_trait]
pub trait DocumentAccess: Send + Sync {
    /// Resolves whether `user_id` may open `document_id`.
    ///
    /// # Errors
    ///
    /// * If the backend resolving the document fails
    async fn can_access(
        &self,
        user_id: u64,
        document_id: u64,
    ) -> Result<Option<DocumentHandle>, DocumentLookupError>;
}

/// [`DocumentAccess`] backed by the document service's HTTP API.
///
/// Authenticates service-to-service with a shared token, the same way the
/// account service is called.
#[derive(Debug, Clone)]
pub struct HttpDocumentAccess {
    host: String,
    service_token: String,
    client: reqwest::Client,
}

impl HttpDocumentAccess {
    #[must_use]
    pub fn new(host: impl Into<String>, service_token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service_token: service_token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DocumentAccess for HttpDocumentAccess {
    async fn can_access(
        &self,
        user_id: u64,
        document_id: u64,
    ) -> Result<Option<DocumentHandle>, DocumentLookupError> {
        let url = format!(
            "{}/document/{document_id}?userId={user_id}",
            self.host.trim_end_matches('/')
        );

        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.service_token.as_str())
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(Some(response.json::<DocumentHandle>().await?)),
            403 | 404 => Ok(None),
            status => Err(DocumentLookupError::UnexpectedStatus(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use jsonwebtoken::{EncodingKey, Header, encode};
    use pretty_assertions::assert_eq;

    use super::*;

    const SECRET: &str = "test-secret";

    fn token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_ref()),
        )
        .unwrap()
    }

    fn claims(exp_offset_secs: i64) -> Claims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        Claims {
            id: 10,
            email: "a@x.com".into(),
            roles: Some(vec!["user".into()]),
            iat: now,
            exp: now.saturating_add_signed(exp_offset_secs),
        }
    }

    #[test_log::test]
    fn valid_token_yields_identity() {
        let verifier = TokenVerifier::new(SECRET);

        let identity = verifier.verify(&token(&claims(3600), SECRET)).unwrap();

        assert_eq!(identity, Identity::new(10, "a@x.com"));
    }

    #[test_log::test]
    fn expired_token_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);

        assert_eq!(
            verifier.verify(&token(&claims(-3600), SECRET)),
            Err(AuthError::Unauthorized)
        );
    }

    #[test_log::test]
    fn token_signed_with_other_secret_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);

        assert_eq!(
            verifier.verify(&token(&claims(3600), "other-secret")),
            Err(AuthError::Unauthorized)
        );
    }

    #[test_log::test]
    fn garbage_credential_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);

        assert_eq!(
            verifier.verify("not-a-jwt"),
            Err(AuthError::Unauthorized)
        );
    }

    #[test_log::test]
    fn token_without_roles_still_verifies() {
        let verifier = TokenVerifier::new(SECRET);
        let mut claims = claims(3600);
        claims.roles = None;

        let identity = verifier.verify(&token(&claims, SECRET)).unwrap();

        assert_eq!(identity.user_id, 10);
    }
}
