//! The low-level I/O primitives the adapter is written against.
//!
//! # Design
//! Each trait mirrors one resource of the WASI 0.2 HTTP and I/O interfaces:
//! an outgoing request with setters, a flow-controlled output body, a
//! pending-response token, an incoming response, an input stream, and the
//! pollable that all of them hand out for readiness. `Substrate` ties the
//! associated types together and owns the two free functions of those
//! interfaces: submitting a request and polling a set of pollables.
//!
//! Keeping the adapter generic over these traits lets the same exchange
//! logic run against the real component imports (`crate::wasi`), against a
//! thread-backed emulation on a developer machine (`crate::native`), and
//! against a scripted substrate in unit tests.
//!
//! Child resources must be released before their parents: a pollable before
//! the stream or body it came from, an input stream before the response it
//! was consumed from. The adapter guarantees that ordering; implementations
//! may rely on it.

use crate::http::{Method, Scheme};

/// Failure reported by a substrate call that is not a stream operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SubstrateError(pub String);

impl SubstrateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outcome of a failed stream read or write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream has ended. For an input stream this is the ordinary end of
    /// the body.
    #[error("stream closed")]
    Closed,

    /// The last operation failed; the stream is unusable.
    #[error("stream failed: {0}")]
    Failed(String),
}

/// A readiness source.
pub trait Pollable {
    /// Non-blocking readiness check.
    fn ready(&self) -> bool;
}

/// An outgoing request under construction.
pub trait OutgoingRequest {
    type Body;

    fn set_method(&mut self, method: &Method) -> Result<(), SubstrateError>;
    fn set_scheme(&mut self, scheme: &Scheme) -> Result<(), SubstrateError>;
    fn set_authority(&mut self, authority: &str) -> Result<(), SubstrateError>;
    fn set_path_with_query(&mut self, path_with_query: &str) -> Result<(), SubstrateError>;

    /// Take the writable body. Succeeds once per request.
    fn body(&mut self) -> Result<Self::Body, SubstrateError>;
}

/// Flow-controlled sink for an outgoing body.
pub trait OutgoingBody {
    type Pollable: Pollable;

    /// How many bytes may be written right now without blocking. Zero means
    /// wait on `subscribe()` first.
    fn check_write(&mut self) -> Result<u64, StreamError>;

    /// Write at most the amount last permitted by `check_write`.
    fn write(&mut self, chunk: &[u8]) -> Result<(), StreamError>;

    /// Start flushing buffered bytes. Completion is signalled through
    /// `subscribe()` and observed with `check_write`.
    fn flush(&mut self) -> Result<(), StreamError>;

    /// Ready when the sink accepts more bytes or has failed.
    fn subscribe(&self) -> Self::Pollable;

    /// Close the output and finalize the message. No trailers are sent.
    fn finish(self) -> Result<(), SubstrateError>;
}

/// Token for a request in flight.
pub trait PendingResponse {
    type Pollable: Pollable;
    type Response;

    /// Ready once `get` returns `Some`.
    fn subscribe(&self) -> Self::Pollable;

    /// The response, if it has arrived. Returns `Some` at most once.
    fn get(&mut self) -> Option<Result<Self::Response, SubstrateError>>;
}

/// Status and headers of a received response, plus its unread body.
pub trait IncomingResponse {
    type Stream;

    fn status(&self) -> u16;

    /// Header entries with raw byte values, in the order received.
    fn headers(&self) -> Vec<(String, Vec<u8>)>;

    /// Take the body stream. Succeeds once per response.
    fn consume(&mut self) -> Result<Self::Stream, SubstrateError>;
}

/// Readable stream for an incoming body.
pub trait InputStream {
    type Pollable: Pollable;

    /// Read up to `len` bytes. An empty chunk means no data is available
    /// yet; `Err(StreamError::Closed)` means the body has ended.
    fn read(&mut self, len: u64) -> Result<Vec<u8>, StreamError>;

    /// Ready when data, end of stream or an error can be observed.
    fn subscribe(&self) -> Self::Pollable;
}

/// An I/O substrate able to carry HTTP exchanges.
pub trait Substrate {
    type Pollable: Pollable;
    type Body: OutgoingBody<Pollable = Self::Pollable>;
    type Request: OutgoingRequest<Body = Self::Body>;
    type Stream: InputStream<Pollable = Self::Pollable>;
    type Response: IncomingResponse<Stream = Self::Stream>;
    type Pending: PendingResponse<Pollable = Self::Pollable, Response = Self::Response>;

    /// Create an outgoing request carrying `headers`.
    fn new_request(&self, headers: &[(String, Vec<u8>)]) -> Result<Self::Request, SubstrateError>;

    /// Submit a request. The body taken from it may still be written
    /// afterwards; the response can arrive before the body is finished.
    fn handle(&self, request: Self::Request) -> Result<Self::Pending, SubstrateError>;

    /// Block until at least one of `pollables` is ready and return the
    /// indices of the ready ones.
    fn poll(&self, pollables: &[&Self::Pollable]) -> Vec<usize>;
}
