use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("invalid credentials for {0}")]
    InvalidCredentials(String),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("unauthorized operation")]
    Unauthorized,
}

/// AuthN inputs passed from protocol adapters.
#[derive(Debug, Clone)]
pub struct AuthContext<'a> {
    pub session_id: &'a str,
    pub protocol: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Per-session authentication state produced by a [`SecurityManager`].
pub trait SecurityContext: Send + Sync {
    fn username(&self) -> Option<&str>;
    fn is_logged_in(&self) -> bool;
    fn login(&mut self) -> Result<(), SecurityError>;
    fn logout(&mut self);
    /// Authorization check against a fully-qualified destination name.
    fn can_access(&self, _destination: &str, _access: Access) -> bool {
        true
    }
}

pub trait SecurityManager: Send + Sync {
    fn get_security_context(
        &self,
        auth: &AuthContext<'_>,
    ) -> Result<Box<dyn SecurityContext>, SecurityError>;
}

/// Accepts every connection; the supplied username (if any) is kept for namespace lookup.
#[derive(Debug, Clone, Default)]
pub struct AnonymousSecurityManager;

impl SecurityManager for AnonymousSecurityManager {
    fn get_security_context(
        &self,
        auth: &AuthContext<'_>,
    ) -> Result<Box<dyn SecurityContext>, SecurityError> {
        Ok(Box::new(BasicSecurityContext {
            username: auth.username.map(str::to_string),
            logged_in: false,
            denied: Vec::new(),
        }))
    }
}

/// Username/password table with optional per-user deny prefixes.
#[derive(Debug, Clone, Default)]
pub struct StaticSecurityManager {
    users: HashMap<String, UserEntry>,
}

#[derive(Debug, Clone)]
struct UserEntry {
    password: Vec<u8>,
    denied: Vec<String>,
}

impl StaticSecurityManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl AsRef<[u8]>) -> Self {
        self.users.insert(
            username.into(),
            UserEntry {
                password: password.as_ref().to_vec(),
                denied: Vec::new(),
            },
        );
        self
    }

    /// Deny `username` any access to destinations starting with `prefix`.
    pub fn deny(mut self, username: &str, prefix: impl Into<String>) -> Self {
        if let Some(entry) = self.users.get_mut(username) {
            entry.denied.push(prefix.into());
        }
        self
    }
}

impl SecurityManager for StaticSecurityManager {
    fn get_security_context(
        &self,
        auth: &AuthContext<'_>,
    ) -> Result<Box<dyn SecurityContext>, SecurityError> {
        let username = auth
            .username
            .ok_or_else(|| SecurityError::UnknownUser("<anonymous>".to_string()))?;
        let Some(entry) = self.users.get(username) else {
            warn!(session_id = %auth.session_id, user = %username, "unknown user");
            return Err(SecurityError::UnknownUser(username.to_string()));
        };
        if auth.password != Some(entry.password.as_slice()) {
            warn!(session_id = %auth.session_id, user = %username, "password mismatch");
            return Err(SecurityError::InvalidCredentials(username.to_string()));
        }
        Ok(Box::new(BasicSecurityContext {
            username: Some(username.to_string()),
            logged_in: false,
            denied: entry.denied.clone(),
        }))
    }
}

#[derive(Debug)]
struct BasicSecurityContext {
    username: Option<String>,
    logged_in: bool,
    denied: Vec<String>,
}

impl SecurityContext for BasicSecurityContext {
    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn login(&mut self) -> Result<(), SecurityError> {
        self.logged_in = true;
        debug!(user = ?self.username, "logged in");
        Ok(())
    }

    fn logout(&mut self) {
        if self.logged_in {
            self.logged_in = false;
            debug!(user = ?self.username, "logged out");
        }
    }

    fn can_access(&self, destination: &str, _access: Access) -> bool {
        !self.denied.iter().any(|prefix| destination.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth<'a>(username: Option<&'a str>, password: Option<&'a [u8]>) -> AuthContext<'a> {
        AuthContext {
            session_id: "c1",
            protocol: "mqtt",
            username,
            password,
        }
    }

    #[test]
    fn static_manager_checks_passwords() {
        let manager = StaticSecurityManager::new().with_user("alice", "secret");
        assert!(manager
            .get_security_context(&auth(Some("alice"), Some(b"secret".as_slice())))
            .is_ok());
        assert_eq!(
            manager
                .get_security_context(&auth(Some("alice"), Some(b"nope".as_slice())))
                .err(),
            Some(SecurityError::InvalidCredentials("alice".into()))
        );
        assert!(matches!(
            manager.get_security_context(&auth(Some("bob"), None)),
            Err(SecurityError::UnknownUser(_))
        ));
        assert!(manager.get_security_context(&auth(None, None)).is_err());
    }

    #[test]
    fn login_logout_and_acl() {
        let manager = StaticSecurityManager::new()
            .with_user("alice", "pw")
            .deny("alice", "private/");
        let mut ctx = manager
            .get_security_context(&auth(Some("alice"), Some(b"pw".as_slice())))
            .unwrap();
        assert!(!ctx.is_logged_in());
        ctx.login().unwrap();
        assert!(ctx.is_logged_in());
        assert!(ctx.can_access("room/1", Access::Read));
        assert!(!ctx.can_access("private/x", Access::Write));
        ctx.logout();
        assert!(!ctx.is_logged_in());
    }

    #[test]
    fn anonymous_manager_keeps_username() {
        let ctx = AnonymousSecurityManager
            .get_security_context(&auth(Some("guest"), None))
            .unwrap();
        assert_eq!(ctx.username(), Some("guest"));
    }
}
