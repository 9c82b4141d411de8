//! Substrate backed by the component's `wasi:http` and `wasi:io` imports.
//!
//! Resource handles are wrapped so that child resources are dropped before
//! their parents: every struct here declares the child field first.

use std::time::Duration;

use ::wasi::http::outgoing_handler;
use ::wasi::http::types as wasi_http;
use ::wasi::io::{poll, streams};

use crate::http::{Method, Scheme};
use crate::substrate::{
    IncomingResponse, InputStream, OutgoingBody, OutgoingRequest, PendingResponse, Pollable,
    StreamError, Substrate, SubstrateError,
};

/// Substrate that performs exchanges through the host's outgoing handler.
#[derive(Debug, Clone, Default)]
pub struct WasiSubstrate {
    connect_timeout: Option<Duration>,
}

impl WasiSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    fn options(&self) -> Option<wasi_http::RequestOptions> {
        let timeout = self.connect_timeout?;
        let options = wasi_http::RequestOptions::new();
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        // Hosts without timeout support reject the setter; the request still
        // goes out with the host default.
        if options.set_connect_timeout(Some(nanos)).is_err() {
            tracing::debug!("host does not support connect timeouts");
        }
        Some(options)
    }
}

fn stream_error(e: streams::StreamError) -> StreamError {
    match e {
        streams::StreamError::Closed => StreamError::Closed,
        streams::StreamError::LastOperationFailed(err) => {
            StreamError::Failed(err.to_debug_string())
        }
    }
}

fn wasi_method(method: &Method) -> wasi_http::Method {
    match method {
        Method::Get => wasi_http::Method::Get,
        Method::Head => wasi_http::Method::Head,
        Method::Post => wasi_http::Method::Post,
        Method::Put => wasi_http::Method::Put,
        Method::Delete => wasi_http::Method::Delete,
        Method::Connect => wasi_http::Method::Connect,
        Method::Options => wasi_http::Method::Options,
        Method::Trace => wasi_http::Method::Trace,
        Method::Patch => wasi_http::Method::Patch,
        Method::Other(token) => wasi_http::Method::Other(token.clone()),
    }
}

fn wasi_scheme(scheme: &Scheme) -> wasi_http::Scheme {
    match scheme {
        Scheme::Http => wasi_http::Scheme::Http,
        Scheme::Https => wasi_http::Scheme::Https,
        Scheme::Other(other) => wasi_http::Scheme::Other(other.clone()),
    }
}

pub struct WasiPollable(poll::Pollable);

impl Pollable for WasiPollable {
    fn ready(&self) -> bool {
        self.0.ready()
    }
}

pub struct WasiRequest(wasi_http::OutgoingRequest);

impl OutgoingRequest for WasiRequest {
    type Body = WasiBody;

    fn set_method(&mut self, method: &Method) -> Result<(), SubstrateError> {
        self.0
            .set_method(&wasi_method(method))
            .map_err(|()| SubstrateError::new(format!("method {method} not accepted")))
    }

    fn set_scheme(&mut self, scheme: &Scheme) -> Result<(), SubstrateError> {
        self.0
            .set_scheme(Some(&wasi_scheme(scheme)))
            .map_err(|()| SubstrateError::new(format!("scheme {scheme} not accepted")))
    }

    fn set_authority(&mut self, authority: &str) -> Result<(), SubstrateError> {
        self.0
            .set_authority(Some(authority))
            .map_err(|()| SubstrateError::new(format!("authority {authority:?} not accepted")))
    }

    fn set_path_with_query(&mut self, path_with_query: &str) -> Result<(), SubstrateError> {
        self.0
            .set_path_with_query(Some(path_with_query))
            .map_err(|()| SubstrateError::new(format!("path {path_with_query:?} not accepted")))
    }

    fn body(&mut self) -> Result<WasiBody, SubstrateError> {
        let body = self
            .0
            .body()
            .map_err(|()| SubstrateError::new("outgoing body already taken"))?;
        let stream = body
            .write()
            .map_err(|()| SubstrateError::new("outgoing body stream already taken"))?;
        Ok(WasiBody { stream, body })
    }
}

pub struct WasiBody {
    stream: streams::OutputStream,
    body: wasi_http::OutgoingBody,
}

impl OutgoingBody for WasiBody {
    type Pollable = WasiPollable;

    fn check_write(&mut self) -> Result<u64, StreamError> {
        self.stream.check_write().map_err(stream_error)
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        self.stream.write(chunk).map_err(stream_error)
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.stream.flush().map_err(stream_error)
    }

    fn subscribe(&self) -> WasiPollable {
        WasiPollable(self.stream.subscribe())
    }

    fn finish(self) -> Result<(), SubstrateError> {
        let WasiBody { stream, body } = self;
        drop(stream);
        wasi_http::OutgoingBody::finish(body, None)
            .map_err(|code| SubstrateError::new(format!("{code:?}")))
    }
}

pub struct WasiPending(wasi_http::FutureIncomingResponse);

impl PendingResponse for WasiPending {
    type Pollable = WasiPollable;
    type Response = WasiResponse;

    fn subscribe(&self) -> WasiPollable {
        WasiPollable(self.0.subscribe())
    }

    fn get(&mut self) -> Option<Result<WasiResponse, SubstrateError>> {
        let outcome = self.0.get()?;
        Some(match outcome {
            Ok(Ok(response)) => Ok(WasiResponse(response)),
            Ok(Err(code)) => Err(SubstrateError::new(format!("{code:?}"))),
            Err(()) => Err(SubstrateError::new("response already taken")),
        })
    }
}

pub struct WasiResponse(wasi_http::IncomingResponse);

impl IncomingResponse for WasiResponse {
    type Stream = WasiStream;

    fn status(&self) -> u16 {
        self.0.status()
    }

    fn headers(&self) -> Vec<(String, Vec<u8>)> {
        self.0.headers().entries()
    }

    fn consume(&mut self) -> Result<WasiStream, SubstrateError> {
        let body = self
            .0
            .consume()
            .map_err(|()| SubstrateError::new("incoming body already consumed"))?;
        let stream = body
            .stream()
            .map_err(|()| SubstrateError::new("incoming body stream already taken"))?;
        Ok(WasiStream { stream, _body: body })
    }
}

pub struct WasiStream {
    stream: streams::InputStream,
    _body: wasi_http::IncomingBody,
}

impl InputStream for WasiStream {
    type Pollable = WasiPollable;

    fn read(&mut self, len: u64) -> Result<Vec<u8>, StreamError> {
        self.stream.read(len).map_err(stream_error)
    }

    fn subscribe(&self) -> WasiPollable {
        WasiPollable(self.stream.subscribe())
    }
}

impl Substrate for WasiSubstrate {
    type Pollable = WasiPollable;
    type Body = WasiBody;
    type Request = WasiRequest;
    type Stream = WasiStream;
    type Response = WasiResponse;
    type Pending = WasiPending;

    fn new_request(&self, headers: &[(String, Vec<u8>)]) -> Result<WasiRequest, SubstrateError> {
        let fields = wasi_http::Fields::from_list(headers)
            .map_err(|e| SubstrateError::new(format!("headers rejected: {e:?}")))?;
        Ok(WasiRequest(wasi_http::OutgoingRequest::new(fields)))
    }

    fn handle(&self, request: WasiRequest) -> Result<WasiPending, SubstrateError> {
        outgoing_handler::handle(request.0, self.options())
            .map(WasiPending)
            .map_err(|code| SubstrateError::new(format!("{code:?}")))
    }

    fn poll(&self, pollables: &[&WasiPollable]) -> Vec<usize> {
        let handles: Vec<&poll::Pollable> = pollables.iter().map(|p| &p.0).collect();
        poll::poll(&handles)
            .into_iter()
            .map(|index| index as usize)
            .collect()
    }
}
