use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize}; // Stored document shape
use serde_json::{Map, Value}; // Partial update bodies
use std::collections::BTreeSet;
use thiserror::Error;

// --- Domain Errors ---
#[derive(Error, Debug, PartialEq)]
pub enum DomainError {
    #[error("Username must not be empty")]
    EmptyUsername,
    #[error("Link must not be empty")]
    EmptyLink,
}

// --- Stored field names ---
// The account document keeps the names used by existing indices.
pub mod fields {
    pub const USERNAME: &str = "email";
    pub const ENCODED_PASSWORD: &str = "encodedPassword";
    pub const ENABLED: &str = "enabled";
    pub const LOGIN_ATTEMPTS_LEFT: &str = "loginAttemptsLeft";
    pub const PASSWORD_LAST_CHANGE_DATE: &str = "passwordLastChangeDate";
    pub const LINK: &str = "token";
    pub const LINK_DATE: &str = "tokenDate";
}

// --- Link ---

/// A one-time password-reset or activation link, always paired with its issue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLink {
    pub link: String,
    pub date: DateTime<Utc>,
}

impl AccountLink {
    pub fn new(link: impl Into<String>, date: DateTime<Utc>) -> Result<Self, DomainError> {
        let link = link.into();
        if link.is_empty() {
            return Err(DomainError::EmptyLink);
        }
        Ok(Self { link, date })
    }
}

// --- Account ---

/// A user account as persisted in the account index.
///
/// Values are never mutated in place by the repositories: every change is
/// expressed as an [`AccountPatch`] and produces a new value via [`Account::apply`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "email")]
    username: String,
    encoded_password: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    login_attempts_left: u32,
    password_last_change_date: DateTime<Utc>,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    authorities: BTreeSet<String>,
    // Kept as two nullable fields on the wire; read together through `link()`.
    #[serde(rename = "token", default)]
    link: Option<String>,
    #[serde(rename = "tokenDate", default)]
    link_date: Option<DateTime<Utc>>,
}

impl Account {
    /// Creates a disabled account with no profile, no authorities and no link.
    pub fn new(
        username: impl Into<String>,
        encoded_password: impl Into<String>,
        login_attempts_left: u32,
    ) -> Result<Self, DomainError> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(DomainError::EmptyUsername);
        }
        Ok(Self {
            username,
            encoded_password: encoded_password.into(),
            enabled: false,
            login_attempts_left,
            password_last_change_date: Utc::now(),
            first_name: String::new(),
            last_name: String::new(),
            authorities: BTreeSet::new(),
            link: None,
            link_date: None,
        })
    }

    pub fn with_profile(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = first_name.into();
        self.last_name = last_name.into();
        self
    }

    pub fn with_authorities<I, S>(mut self, authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorities = authorities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_link(mut self, link: AccountLink) -> Self {
        self.link = Some(link.link);
        self.link_date = Some(link.date);
        self
    }

    /// Builds the record written on registration: disabled, password change
    /// date set to `now`, everything else taken from `self`.
    pub fn registered(&self, now: DateTime<Utc>) -> Self {
        Self {
            enabled: false,
            password_last_change_date: now,
            ..self.clone()
        }
    }

    /// Returns a new account with the fields named by `patch` replaced and
    /// every other field carried over.
    pub fn apply(&self, patch: &AccountPatch) -> Self {
        let mut next = self.clone();
        if let Some(encoded_password) = &patch.encoded_password {
            next.encoded_password = encoded_password.clone();
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(attempts) = patch.login_attempts_left {
            next.login_attempts_left = attempts;
        }
        if let Some(date) = patch.password_last_change_date {
            next.password_last_change_date = date;
        }
        match &patch.link {
            Some(LinkChange::Set(link)) => {
                next.link = Some(link.link.clone());
                next.link_date = Some(link.date);
            }
            Some(LinkChange::Clear) => {
                next.link = None;
                next.link_date = None;
            }
            None => {}
        }
        next
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn encoded_password(&self) -> &str {
        &self.encoded_password
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn login_attempts_left(&self) -> u32 {
        self.login_attempts_left
    }

    pub fn password_last_change_date(&self) -> DateTime<Utc> {
        self.password_last_change_date
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn authorities(&self) -> &BTreeSet<String> {
        &self.authorities
    }

    /// The link and its issue date. A stored document holding only one half
    /// of the pair has no usable link.
    pub fn link(&self) -> Option<AccountLink> {
        match (&self.link, self.link_date) {
            (Some(link), Some(date)) => Some(AccountLink {
                link: link.clone(),
                date,
            }),
            _ => None,
        }
    }

    pub fn has_link(&self, link: &str) -> bool {
        self.link().is_some_and(|current| current.link == link)
    }
}

// --- Partial updates ---

#[derive(Debug, Clone, PartialEq)]
pub enum LinkChange {
    Set(AccountLink),
    Clear,
}

/// The set of fields a targeted update writes. Unlisted fields stay untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountPatch {
    pub encoded_password: Option<String>,
    pub enabled: Option<bool>,
    pub login_attempts_left: Option<u32>,
    pub password_last_change_date: Option<DateTime<Utc>>,
    pub link: Option<LinkChange>,
}

impl AccountPatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub fn attempts_left(attempts: u32) -> Self {
        Self {
            login_attempts_left: Some(attempts),
            ..Self::default()
        }
    }

    /// New password: stamps the change date and invalidates any outstanding link.
    pub fn password(encoded_password: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            encoded_password: Some(encoded_password.into()),
            password_last_change_date: Some(now),
            link: Some(LinkChange::Clear),
            ..Self::default()
        }
    }

    pub fn link(link: AccountLink) -> Self {
        Self {
            link: Some(LinkChange::Set(link)),
            ..Self::default()
        }
    }

    pub fn clear_link() -> Self {
        Self {
            link: Some(LinkChange::Clear),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Renders the patch as a partial document using the stored field names.
    /// A cleared link is written as explicit nulls so the store drops both halves.
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut doc = Map::new();
        if let Some(encoded_password) = &self.encoded_password {
            doc.insert(
                fields::ENCODED_PASSWORD.to_string(),
                Value::String(encoded_password.clone()),
            );
        }
        if let Some(enabled) = self.enabled {
            doc.insert(fields::ENABLED.to_string(), Value::Bool(enabled));
        }
        if let Some(attempts) = self.login_attempts_left {
            doc.insert(fields::LOGIN_ATTEMPTS_LEFT.to_string(), Value::from(attempts));
        }
        if let Some(date) = self.password_last_change_date {
            doc.insert(
                fields::PASSWORD_LAST_CHANGE_DATE.to_string(),
                Value::String(date.to_rfc3339()),
            );
        }
        match &self.link {
            Some(LinkChange::Set(link)) => {
                doc.insert(fields::LINK.to_string(), Value::String(link.link.clone()));
                doc.insert(
                    fields::LINK_DATE.to_string(),
                    Value::String(link.date.to_rfc3339()),
                );
            }
            Some(LinkChange::Clear) => {
                doc.insert(fields::LINK.to_string(), Value::Null);
                doc.insert(fields::LINK_DATE.to_string(), Value::Null);
            }
            None => {}
        }
        doc
    }
}
