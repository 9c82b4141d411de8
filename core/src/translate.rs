//! Request translation: plain `Request` data to substrate primitives.
//!
//! # Design
//! Translation is split in two. `translate` is pure: it parses the URI,
//! derives scheme, authority and path-with-query, and normalizes headers into
//! `RequestParts`. Every way a request can be malformed surfaces there,
//! before any substrate handle exists. `url` only validates the URI; the
//! authority and path are cut from the original string, so the server sees
//! what the caller wrote. `RequestParts::into_outgoing` then replays the
//! parts onto a fresh outgoing request and takes its body.

use url::Url;

use crate::error::ExchangeError;
use crate::http::{Method, Request, Scheme};
use crate::substrate::{OutgoingRequest, Substrate};

const CONTENT_LENGTH: &str = "content-length";

/// A request broken down into the pieces an outgoing request is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParts {
    pub method: Method,
    pub scheme: Scheme,
    /// Host plus optional port.
    pub authority: String,
    pub path_with_query: String,
    /// Header values encoded as UTF-8 bytes.
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Translate `request` without touching the substrate.
///
/// The URI must parse and carry a `//` network location. Authority and
/// path-with-query are taken from the URI as written: explicit default
/// ports, dot-segments and escapes are kept, userinfo and fragment are not.
///
/// Adds `content-length` with the body length (zero without a body) unless
/// the request already carries one, in any letter case.
pub fn translate(request: &Request) -> Result<RequestParts, ExchangeError> {
    let malformed = |reason: &dyn std::fmt::Display| {
        ExchangeError::InvalidRequest(format!("malformed uri {:?}: {reason}", request.uri))
    };
    let url = Url::parse(&request.uri).map_err(|e| malformed(&e))?;
    let (authority, path_with_query) =
        split_target(&request.uri).ok_or_else(|| malformed(&"no network location"))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(malformed(&"empty host"));
    }

    let mut headers: Vec<(String, Vec<u8>)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.as_bytes().to_vec()))
        .collect();
    if request.header_value(CONTENT_LENGTH).is_none() {
        let length = request.body.as_ref().map_or(0, Vec::len);
        headers.push((CONTENT_LENGTH.to_string(), length.to_string().into_bytes()));
    }

    Ok(RequestParts {
        method: request.method.clone(),
        scheme: Scheme::from(url.scheme()),
        authority: authority.to_string(),
        path_with_query,
        headers,
    })
}

/// Split `scheme://[userinfo@]authority[path][?query][#fragment]` into the
/// authority and path-with-query, without normalizing either.
///
/// A missing path becomes `/` and an empty query is dropped.
fn split_target(uri: &str) -> Option<(&str, String)> {
    let (_, rest) = uri.trim().split_once(':')?;
    let rest = rest.strip_prefix("//")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (netloc, tail) = rest.split_at(end);
    let authority = netloc.rsplit_once('@').map_or(netloc, |(_, host)| host);

    let tail = tail.split_once('#').map_or(tail, |(before, _)| before);
    let (path, query) = match tail.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (tail, None),
    };
    let mut path_with_query = if path.is_empty() { "/".to_string() } else { path.to_string() };
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        path_with_query.push('?');
        path_with_query.push_str(query);
    }
    Some((authority, path_with_query))
}

impl RequestParts {
    /// Build the outgoing request on `substrate` and take its writable body.
    ///
    /// A substrate refusing one of the parts is reported as
    /// `InvalidRequest`: nothing has been sent yet.
    pub fn into_outgoing<S: Substrate>(
        &self,
        substrate: &S,
    ) -> Result<(S::Request, S::Body), ExchangeError> {
        let invalid = |what: &str, e: crate::substrate::SubstrateError| {
            ExchangeError::InvalidRequest(format!("{what} rejected: {e}"))
        };

        let mut request = substrate
            .new_request(&self.headers)
            .map_err(|e| invalid("headers", e))?;
        request
            .set_method(&self.method)
            .map_err(|e| invalid("method", e))?;
        request
            .set_scheme(&self.scheme)
            .map_err(|e| invalid("scheme", e))?;
        request
            .set_authority(&self.authority)
            .map_err(|e| invalid("authority", e))?;
        request
            .set_path_with_query(&self.path_with_query)
            .map_err(|e| invalid("path", e))?;
        let body = request.body().map_err(|e| invalid("body", e))?;
        Ok((request, body))
    }
}
