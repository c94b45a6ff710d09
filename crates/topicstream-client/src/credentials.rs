//! Bearer token accessors.
//!
//! The engines never fetch tokens themselves. They read the current token
//! from a [`TokenProvider`] whenever they open a stream or write to one, and
//! the stream session sends an in-band token update when the value changed.

use std::sync::{Arc, RwLock};

/// Read-only accessor of the current bearer token.
///
/// A provider may be shared by any number of Reader and Writer engines.
pub trait TokenProvider: Send + Sync + 'static {
    /// The token to present right now, or `None` for anonymous access.
    fn token(&self) -> Option<String>;
}

/// Anonymous access.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl TokenProvider for NoCredentials {
    fn token(&self) -> Option<String> {
        None
    }
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A token that can be replaced at runtime, e.g. by a refresh task.
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct RotatingToken {
    current: Arc<RwLock<Option<String>>>,
}

impl RotatingToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(token.into()))),
        }
    }

    /// Replace the token. Streams pick it up on their next write.
    pub fn set(&self, token: impl Into<String>) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Some(token.into());
    }
}

impl TokenProvider for RotatingToken {
    fn token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
