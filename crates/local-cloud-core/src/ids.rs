//! Core identifier types for the local cloud provider.
//!
//! Template and instance identifiers are short opaque strings handed out by an
//! [`IdGenerator`]. They end up inside worker configuration files, worker
//! names (`img-<template>-<instance>`) and network identities
//! (`cloud.local.<template>.<instance>`), so the accepted alphabet is kept to
//! ASCII alphanumerics, `-` and `_`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if let Some(c) = s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(IdError::InvalidCharacter(c));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse an identifier, validating its alphabet.
            ///
            /// # Errors
            ///
            /// Returns an error if the string is empty or contains characters
            /// outside `[A-Za-z0-9_-]`.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                validate(s)?;
                Ok(Self(s.to_string()))
            }

            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                validate(&value)?;
                Ok(Self(value))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a template (image) within one provisioning client.
    TemplateId
);

string_id!(
    /// Identifier of an instance within its owning template.
    ///
    /// Only the pair ([`TemplateId`], [`InstanceId`]) is unique across the
    /// whole provider.
    InstanceId
);

/// Hands out increasing decimal identifiers, starting at `1`.
///
/// Each client owns one generator for its templates and each template owns
/// one for its instances.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first identifier is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next identifier.
    pub fn next_id<T: From<u64>>(&self) -> T {
        T::from(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier was empty.
    #[error("identifier must not be empty")]
    Empty,

    /// The identifier contained a character outside `[A-Za-z0-9_-]`.
    #[error("invalid character in identifier: {0:?}")]
    InvalidCharacter(char),
}
