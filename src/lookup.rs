//! User lookups.
//!
//! The pipeline asks a [`Lookup`] about the sender and every recipient
//! before modules run, so modules can check whether an address is local
//! without doing their own lookups.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config;

#[derive(Debug, Error)]
#[error("Lookup for {address} failed: {reason}")]
pub struct Error {
    pub address: String,
    pub reason: String,
}

/// What a backend knows about a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub address: String,
    pub attributes: BTreeMap<String, String>,
}

pub trait Lookup: Send + Sync {
    /// Fetch the record for `address`, or `None` if the user is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be asked.
    fn fetch_user(&self, address: &str) -> Result<Option<UserRecord>, Error>;
}

/// A backend that knows nobody.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLookup;

impl Lookup for NoLookup {
    fn fetch_user(&self, _address: &str) -> Result<Option<UserRecord>, Error> {
        Ok(None)
    }
}

/// A backend answering from the `[lookup]` section of the configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticLookup {
    users: BTreeMap<String, BTreeMap<String, String>>,
}

impl From<&config::Lookup> for StaticLookup {
    fn from(config: &config::Lookup) -> Self {
        Self {
            users: config
                .users
                .iter()
                .map(|(address, attributes)| (address.to_ascii_lowercase(), attributes.clone()))
                .collect(),
        }
    }
}

impl Lookup for StaticLookup {
    fn fetch_user(&self, address: &str) -> Result<Option<UserRecord>, Error> {
        Ok(self
            .users
            .get(&address.to_ascii_lowercase())
            .map(|attributes| UserRecord {
                address: address.to_string(),
                attributes: attributes.clone(),
            }))
    }
}
