//! Caller authentication
//!
//! Two kinds of privileged callers exist: administrators (HTTP admin API,
//! bearer token) and zone peers (internal gRPC, shared peer key). Both
//! checks are disabled when the corresponding secret is not configured.

use crate::common::config::AuthConfig;

/// Who is calling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    /// Another zone server or federation zone
    Peer,
    /// Authenticated administrator
    Admin,
    /// Anything else
    Anonymous,
}

/// Result of authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Ok(Principal),
    Missing,
    Invalid(String),
}

pub struct Authenticator {
    config: AuthConfig,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn admin_auth_enabled(&self) -> bool {
        self.config.admin_token.is_some()
    }

    /// Validate an `Authorization` header value
    pub fn authenticate_admin(&self, header: Option<&str>) -> AuthResult {
        let Some(expected) = self.config.admin_token.as_deref() else {
            return AuthResult::Ok(Principal::Admin);
        };
        let Some(header) = header else {
            return AuthResult::Missing;
        };
        match header.strip_prefix("Bearer ") {
            Some(token) if constant_time_eq(token.trim().as_bytes(), expected.as_bytes()) => {
                AuthResult::Ok(Principal::Admin)
            }
            Some(_) => AuthResult::Invalid("invalid admin token".into()),
            None => AuthResult::Invalid("expected 'Bearer <token>'".into()),
        }
    }

    /// Validate the peer key presented on an internal RPC
    pub fn authenticate_peer(&self, key: Option<&str>) -> AuthResult {
        let Some(expected) = self.config.peer_key.as_deref() else {
            return AuthResult::Ok(Principal::Peer);
        };
        match key {
            Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => {
                AuthResult::Ok(Principal::Peer)
            }
            Some(_) => AuthResult::Invalid("invalid peer key".into()),
            None => AuthResult::Missing,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_auth_disabled_without_token() {
        let auth = Authenticator::new(AuthConfig::default());
        assert!(!auth.admin_auth_enabled());
        assert_eq!(auth.authenticate_admin(None), AuthResult::Ok(Principal::Admin));
    }

    #[test]
    fn test_admin_bearer_token() {
        let auth = Authenticator::new(AuthConfig {
            admin_token: Some("s3cret".into()),
            peer_key: None,
        });
        assert_eq!(
            auth.authenticate_admin(Some("Bearer s3cret")),
            AuthResult::Ok(Principal::Admin)
        );
        assert_eq!(auth.authenticate_admin(None), AuthResult::Missing);
        assert!(matches!(
            auth.authenticate_admin(Some("Bearer nope")),
            AuthResult::Invalid(_)
        ));
        assert!(matches!(
            auth.authenticate_admin(Some("s3cret")),
            AuthResult::Invalid(_)
        ));
    }

    #[test]
    fn test_peer_key() {
        let auth = Authenticator::new(AuthConfig {
            admin_token: None,
            peer_key: Some("zone-key".into()),
        });
        assert_eq!(
            auth.authenticate_peer(Some("zone-key")),
            AuthResult::Ok(Principal::Peer)
        );
        assert_eq!(auth.authenticate_peer(None), AuthResult::Missing);
        assert!(matches!(
            auth.authenticate_peer(Some("other")),
            AuthResult::Invalid(_)
        ));
    }
}
