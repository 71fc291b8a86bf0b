// Client authentication at CONNECT time.
//
// One mode is active per broker: open, a single user/password pair, a single
// token, or a users list with per-user permissions. A connection keeps the
// matcher it authenticated with; reloading the users list only affects
// connections made afterwards.
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use gmsg_authz::{PermissionMatcher, ResolvedUser, User, UserStore};
use gmsg_wire::ConnectInfo;

use crate::config::BrokerConfig;

pub const AUTHORIZATION_VIOLATION: &str = "Authorization Violation";

static UNRESTRICTED: LazyLock<PermissionMatcher> = LazyLock::new(PermissionMatcher::unrestricted);

/// Identity established for one connection.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub username: Option<String>,
    // Held for the connection's lifetime, so a reload never changes it.
    user: Option<Arc<ResolvedUser>>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    fn named(username: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            user: None,
        }
    }

    fn for_user(user: Arc<ResolvedUser>) -> Self {
        Self {
            username: Some(user.username().to_string()),
            user: Some(user),
        }
    }

    pub fn matcher(&self) -> &PermissionMatcher {
        match &self.user {
            Some(user) => user.matcher(),
            None => &UNRESTRICTED,
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_deref().map(ResolvedUser::user)
    }
}

/// Credentials presented by a connection.
#[derive(Debug, Default)]
pub struct AuthRequest<'a> {
    pub connect: Option<&'a ConnectInfo>,
    /// Name taken from a verified client certificate, when the transport
    /// provides one.
    pub tls_identity: Option<&'a str>,
}

#[derive(Debug)]
enum Mode {
    Open,
    Single { user: String, password: String },
    Token(String),
    Users,
}

#[derive(Debug)]
pub struct Authenticator {
    mode: Mode,
    users: UserStore,
}

impl Authenticator {
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let users = UserStore::new(&config.users).context("load users")?;
        let mode = if !config.users.is_empty() {
            Mode::Users
        } else if let Some(user) = &config.user {
            Mode::Single {
                user: user.clone(),
                password: config.password.clone().unwrap_or_default(),
            }
        } else if let Some(token) = &config.token {
            Mode::Token(token.clone())
        } else {
            Mode::Open
        };
        Ok(Self { mode, users })
    }

    pub fn auth_required(&self) -> bool {
        !matches!(self.mode, Mode::Open)
    }

    /// Check the credentials. `None` means the connection must be refused
    /// with [`AUTHORIZATION_VIOLATION`].
    pub fn authenticate(&self, request: &AuthRequest<'_>) -> Option<AuthContext> {
        let connect = request.connect;
        match &self.mode {
            Mode::Open => Some(AuthContext::anonymous()),
            Mode::Single { user, password } => {
                let connect = connect?;
                let matched = connect.user.as_deref() == Some(user.as_str())
                    && connect.pass.as_deref().unwrap_or_default() == password;
                matched.then(|| AuthContext::named(user))
            }
            Mode::Token(token) => {
                let presented = connect?.auth_token.as_deref();
                (presented == Some(token.as_str())).then(AuthContext::anonymous)
            }
            Mode::Users => {
                if let Some(identity) = request.tls_identity {
                    return self.users.lookup(identity).map(AuthContext::for_user);
                }
                let connect = connect?;
                let username = connect.user.as_deref()?;
                let user = self.users.lookup(username)?;
                let password = connect.pass.as_deref().unwrap_or_default();
                user.password_matches(password)
                    .then(|| AuthContext::for_user(user))
            }
        }
    }

    /// Swap in a fresh users list. Records held by live connections are left
    /// as they were. Only a broker started with a users list can reload one;
    /// the other modes never consult the store.
    pub fn reload_users(&self, users: &[User]) -> Result<()> {
        if !matches!(self.mode, Mode::Users) {
            anyhow::bail!("users reload needs a broker started with a users list");
        }
        self.users.reload(users).context("reload users")?;
        tracing::info!(users = self.users.len(), "users reloaded");
        Ok(())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
