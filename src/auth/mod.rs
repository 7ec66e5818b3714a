//! Authentication collaborator
//!
//! Turns a presented credential into a `UserContext`. The state engine treats
//! the result as pre-validated.

use crate::error::{Error, Result};
use crate::permission::{Permission, PermissionEngine, PermissionSet, UserContext};
use std::collections::HashMap;

/// Credential check
pub trait Authenticator: Send + Sync {
    /// Resolved requester, or `None` if the token is not accepted
    fn authenticate(&self, token: &str) -> Option<UserContext>;
}

/// Static bearer tokens from configuration
///
/// Format: `token=identity:role[:extra|extra],...`, e.g.
/// `s3cret=alice:operator,v13w=lobby:viewer:network_read`
#[derive(Debug, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, UserContext>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, ctx: UserContext) {
        self.tokens.insert(token.into(), ctx);
    }

    /// Parse the token list, resolving roles through the engine
    pub fn from_config(config: &str, engine: &PermissionEngine) -> Result<Self> {
        let mut auth = Self::new();

        for entry in config.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, principal) = entry
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("token entry without '=': {}", entry)))?;

            let mut parts = principal.split(':');
            let identity = parts.next().unwrap_or_default();
            let role = parts
                .next()
                .ok_or_else(|| Error::Config(format!("token entry without role: {}", entry)))?;
            if token.is_empty() || identity.is_empty() {
                return Err(Error::Config(format!("incomplete token entry: {}", entry)));
            }

            let extra = match parts.next() {
                Some(list) => parse_extra(list)?,
                None => PermissionSet::empty(),
            };

            let ctx = engine.resolve(identity, role, extra)?;
            auth.insert(token, ctx);
        }

        tracing::info!(tokens = auth.len(), "Bearer tokens loaded");
        Ok(auth)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn parse_extra(list: &str) -> Result<PermissionSet> {
    list.split('|')
        .filter(|p| !p.is_empty())
        .try_fold(PermissionSet::empty(), |set, name| -> Result<PermissionSet> {
            let permission: Permission = name.parse().map_err(Error::Config)?;
            Ok(set.with(permission))
        })
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<UserContext> {
        let ctx = self.tokens.get(token).cloned();
        if ctx.is_none() {
            tracing::debug!("Unknown bearer token presented");
        }
        ctx
    }
}
