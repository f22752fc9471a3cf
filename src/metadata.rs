//! A constrained HTTP client for the instance metadata service.
//!
//! The metadata service lives at a fixed link-local address and is the
//! source of truth for instance identity, the signer certificate chain, its
//! OCSP staples, attested-key blobs, and (for the publisher) instance
//! identity credentials. Every request this client makes is a plain HTTP
//! GET or HEAD, bounded by a short wall-clock timeout, with no redirects
//! and no proxy, following exactly what the specification requires and
//! nothing more.

use std::time::Duration;

use crate::error::Error;

/// A single-use HTTP client scoped to one metadata service base URL.
///
/// A fresh [`reqwest::Client`] is built for every [`MetadataClient`] so that
/// no connection is kept warm across process invocations — each
/// `AuthorizedKeysAgent` or `HostKeyPublisher` run is a short-lived process
/// in its own right, so there is nothing to reuse a connection for.
pub struct MetadataClient {
    base_url: String,
    client: reqwest::Client,
}

impl MetadataClient {
    /// Builds a client against `base_url` with the given per-request
    /// timeout. Redirects and proxies are disabled unconditionally.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetches the body at `path`. Returns `Ok(None)` for a 404 response
    /// (the metadata service's way of saying "this isn't present"), the
    /// body bytes for a 200, and a [`Error::MetadataError`] for anything
    /// else, including transport failures and timeouts.
    pub async fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>, Error> {
        let response = self
            .client
            .get(self.url_for(path))
            .send()
            .await
            .map_err(|e| Error::metadata(format!("GET {path}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(Error::metadata(format!(
                "GET {path}: unexpected status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::metadata(format!("GET {path}: {e}")))?;

        Ok(Some(bytes.to_vec()))
    }

    /// Fetches `path` and decodes the body as UTF-8 text, trimmed of
    /// trailing whitespace (the metadata service commonly terminates plain
    /// text responses with a trailing newline).
    pub async fn fetch_text(&self, path: &str) -> Result<Option<String>, Error> {
        match self.fetch(path).await? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| Error::metadata(format!("GET {path}: non-utf8 body: {e}")))?;
                Ok(Some(text.trim_end().to_string()))
            }
            None => Ok(None),
        }
    }

    /// Issues a HEAD request and returns only the status code. Used to
    /// check for the existence of a user's active-keys blob without
    /// transferring its body.
    pub async fn head_status(&self, path: &str) -> Result<u16, Error> {
        let response = self
            .client
            .head(self.url_for(path))
            .send()
            .await
            .map_err(|e| Error::metadata(format!("HEAD {path}: {e}")))?;

        Ok(response.status().as_u16())
    }
}
