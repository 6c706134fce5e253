//! Caller identification and subject access decisions.

use std::collections::{HashMap, HashSet};

use axum::http::{header, HeaderMap};
use beacon_types::SubjectId;

use crate::config::AuthConfig;

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    Token(String),
}

impl Caller {
    /// Reads `Authorization: Bearer <token>`, falling back to a `token`
    /// query parameter (browsers cannot set headers on websocket upgrades).
    pub fn from_request(headers: &HeaderMap, query_token: Option<&str>) -> Self {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        match bearer.or(query_token.filter(|t| !t.is_empty())) {
            Some(token) => Self::Token(token.to_string()),
            None => Self::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

/// Decides whether a caller may publish to or read from a subject.
pub trait AccessPolicy: Send + Sync {
    fn can_access(&self, caller: &Caller, subject: &SubjectId) -> bool;
}

/// Grants every caller every subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_access(&self, _caller: &Caller, _subject: &SubjectId) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
enum Grant {
    Any,
    Only(HashSet<SubjectId>),
}

/// Static token table.
#[derive(Debug, Clone, Default)]
pub struct TokenPolicy {
    allow_anonymous: bool,
    grants: HashMap<String, Grant>,
}

impl TokenPolicy {
    pub fn new(allow_anonymous: bool) -> Self {
        Self {
            allow_anonymous,
            grants: HashMap::new(),
        }
    }

    /// Grants `token` access to `subjects`. A `"*"` entry grants every
    /// subject; entries that are not valid subject ids are skipped.
    pub fn grant<I, S>(mut self, token: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let token = token.into();
        let mut only = HashSet::new();
        let mut any = false;
        for subject in subjects {
            let subject = subject.as_ref();
            if subject == "*" {
                any = true;
            } else {
                match subject.parse() {
                    Ok(id) => {
                        only.insert(id);
                    }
                    Err(e) => {
                        tracing::warn!(subject, error = %e, "ignoring invalid subject in token grant");
                    }
                }
            }
        }

        let grant = match (any, self.grants.remove(&token)) {
            (true, _) | (_, Some(Grant::Any)) => Grant::Any,
            (false, Some(Grant::Only(mut existing))) => {
                existing.extend(only);
                Grant::Only(existing)
            }
            (false, None) => Grant::Only(only),
        };
        self.grants.insert(token, grant);
        self
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        config
            .tokens
            .iter()
            .fold(Self::new(config.allow_anonymous), |policy, grant| {
                policy.grant(grant.token.clone(), &grant.subjects)
            })
    }
}

impl AccessPolicy for TokenPolicy {
    fn can_access(&self, caller: &Caller, subject: &SubjectId) -> bool {
        match caller {
            Caller::Anonymous => self.allow_anonymous,
            Caller::Token(token) => match self.grants.get(token) {
                Some(Grant::Any) => true,
                Some(Grant::Only(subjects)) => subjects.contains(subject),
                None => false,
            },
        }
    }
}
