//! Token → identity attribution for incoming connections.
//!
//! The sync core never makes authorization decisions: a token only tells us
//! *who* is editing. Whether an unauthenticated connection is admitted is
//! decided by [`AuthPolicy::allow_anonymous`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub type UserId = String;

/// Identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserIdentity {
    Authenticated(UserId),
    Anonymous,
}

impl UserIdentity {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            UserIdentity::Authenticated(id) => Some(id),
            UserIdentity::Anonymous => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, UserIdentity::Anonymous)
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserIdentity::Authenticated(id) => write!(f, "{id}"),
            UserIdentity::Anonymous => f.write_str("anonymous"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no token supplied")]
    MissingToken,
    #[error("token rejected")]
    InvalidToken,
}

/// Verifies a bearer token. Implementations must not block.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Static token table, usually loaded from the `[auth]` config section.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, UserId>,
}

impl TokenTable {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }

    pub fn insert(&mut self, token: impl Into<String>, user: impl Into<UserId>) {
        self.tokens.insert(token.into(), user.into());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenTable {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Authenticator plus the anonymous-admission policy.
#[derive(Clone)]
pub struct AuthPolicy {
    authenticator: Arc<dyn Authenticator>,
    allow_anonymous: bool,
}

impl AuthPolicy {
    pub fn new(authenticator: Arc<dyn Authenticator>, allow_anonymous: bool) -> Self {
        Self {
            authenticator,
            allow_anonymous,
        }
    }

    /// Admit everyone anonymously unless they carry a known token.
    pub fn open() -> Self {
        Self::new(Arc::new(TokenTable::default()), true)
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    /// Resolve the identity for an optional token.
    ///
    /// A missing or rejected token degrades to [`UserIdentity::Anonymous`]
    /// when anonymous connections are allowed; otherwise the error is returned
    /// and the connection must be refused.
    pub fn resolve(&self, token: Option<&str>) -> Result<UserIdentity, AuthError> {
        let verdict = match token.filter(|t| !t.is_empty()) {
            Some(token) => self.authenticator.authenticate(token),
            None => Err(AuthError::MissingToken),
        };
        match verdict {
            Ok(user) => Ok(UserIdentity::Authenticated(user)),
            Err(err) if self.allow_anonymous => {
                log::debug!("auth: {err}, admitting as anonymous");
                Ok(UserIdentity::Anonymous)
            }
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("allow_anonymous", &self.allow_anonymous)
            .finish_non_exhaustive()
    }
}
