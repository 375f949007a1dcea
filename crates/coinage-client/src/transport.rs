//! HTTP transport seam
//!
//! The engine never speaks HTTP itself. Callers plug in a [`Transport`]
//! that performs the request and hands back the status and JSON body.

use std::sync::Arc;

use async_trait::async_trait;
use coinage_core::Timestamp;
use serde_json::Value;

use crate::error::TransportError;

/// Status and decoded body of a reply
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
    /// Parsed `Expires` header, if any
    pub expires: Option<Timestamp>,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            expires: None,
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// One method per HTTP verb the protocol uses
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;

    async fn post(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError>;
}

/// Resolves an auditor's base URL to a transport for it
pub trait AuditorConnector: Send + Sync {
    fn connect(&self, auditor_url: &str) -> Option<Arc<dyn Transport>>;
}

/// Join a base URL and a path
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://ex.test/", "/keys"), "https://ex.test/keys");
        assert_eq!(join_url("https://ex.test", "keys"), "https://ex.test/keys");
    }
}
