//! Thread-backed substrate for running exchanges outside a component.
//!
//! # Design
//! The WASI primitives are emulated on top of a blocking `ureq` agent. The
//! outgoing body is buffered in memory; `handle` starts a worker thread that
//! waits for the body to be finished, performs the request and parks the
//! response in a slot. Consuming the response starts a second thread that
//! copies the body into an inbox one read at a time. Every completion bumps
//! a shared generation counter, so `poll` can sleep on a single condvar for
//! whichever pollable it is given.
//!
//! `ureq` frames the body itself, so a caller-supplied `content-length` is
//! dropped and replaced by the length of the bytes actually written. A
//! mismatched explicit length never reaches the server through this backend.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::http::{Method, Scheme};
use crate::stream::READ_CHUNK;
use crate::substrate::{
    IncomingResponse, InputStream, OutgoingBody, OutgoingRequest, PendingResponse, Pollable,
    StreamError, Substrate, SubstrateError,
};

/// Bytes accepted per `check_write` permit.
const WRITE_PERMIT: u64 = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Signal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Signal {
    fn notify(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }
}

/// Substrate that performs exchanges with `ureq` on helper threads.
#[derive(Clone)]
pub struct NativeSubstrate {
    agent: ureq::Agent,
    signal: Arc<Signal>,
}

impl NativeSubstrate {
    pub fn new() -> Self {
        Self::with_timeout(None)
    }

    /// `connect_timeout` bounds connection establishment only.
    pub fn with_timeout(connect_timeout: Option<Duration>) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .allow_non_standard_methods(true)
            .timeout_connect(connect_timeout)
            .build()
            .new_agent();
        Self {
            agent,
            signal: Arc::new(Signal::default()),
        }
    }
}

impl Default for NativeSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

type ResponseSlot = Arc<Mutex<Option<Result<NativeResponse, String>>>>;

pub struct NativePollable(Watch);

enum Watch {
    Always,
    Response(ResponseSlot),
    Inbox(Arc<Mutex<Inbox>>),
}

impl Pollable for NativePollable {
    fn ready(&self) -> bool {
        match &self.0 {
            Watch::Always => true,
            Watch::Response(slot) => lock(slot).is_some(),
            Watch::Inbox(inbox) => {
                let inbox = lock(inbox);
                !inbox.chunks.is_empty() || inbox.end.is_some()
            }
        }
    }
}

#[derive(Default)]
struct BodyState {
    bytes: Vec<u8>,
    finished: bool,
    abandoned: bool,
}

#[derive(Default)]
struct BodyBuffer {
    state: Mutex<BodyState>,
    changed: Condvar,
}

impl BodyBuffer {
    fn update(&self, f: impl FnOnce(&mut BodyState)) {
        f(&mut lock(&self.state));
        self.changed.notify_all();
    }

    /// Block until the body is finished and take it.
    fn wait_finished(&self) -> Result<Vec<u8>, String> {
        let mut state = lock(&self.state);
        while !state.finished && !state.abandoned {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.abandoned {
            return Err("request body abandoned before it was finished".to_string());
        }
        Ok(std::mem::take(&mut state.bytes))
    }
}

pub struct NativeRequest {
    method: Method,
    scheme: Scheme,
    authority: String,
    path_with_query: String,
    headers: Vec<(String, Vec<u8>)>,
    body: Option<Arc<BodyBuffer>>,
}

impl OutgoingRequest for NativeRequest {
    type Body = NativeBody;

    fn set_method(&mut self, method: &Method) -> Result<(), SubstrateError> {
        ureq::http::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| SubstrateError::new(format!("{method}: {e}")))?;
        self.method = method.clone();
        Ok(())
    }

    fn set_scheme(&mut self, scheme: &Scheme) -> Result<(), SubstrateError> {
        self.scheme = scheme.clone();
        Ok(())
    }

    fn set_authority(&mut self, authority: &str) -> Result<(), SubstrateError> {
        self.authority = authority.to_string();
        Ok(())
    }

    fn set_path_with_query(&mut self, path_with_query: &str) -> Result<(), SubstrateError> {
        self.path_with_query = path_with_query.to_string();
        Ok(())
    }

    fn body(&mut self) -> Result<NativeBody, SubstrateError> {
        if self.body.is_some() {
            return Err(SubstrateError::new("body already taken"));
        }
        let buffer = Arc::new(BodyBuffer::default());
        self.body = Some(buffer.clone());
        Ok(NativeBody { buffer })
    }
}

pub struct NativeBody {
    buffer: Arc<BodyBuffer>,
}

impl OutgoingBody for NativeBody {
    type Pollable = NativePollable;

    fn check_write(&mut self) -> Result<u64, StreamError> {
        Ok(WRITE_PERMIT)
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        if chunk.len() as u64 > WRITE_PERMIT {
            return Err(StreamError::Failed(format!(
                "write of {} bytes exceeds permit of {WRITE_PERMIT}",
                chunk.len()
            )));
        }
        self.buffer.update(|state| state.bytes.extend_from_slice(chunk));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn subscribe(&self) -> NativePollable {
        NativePollable(Watch::Always)
    }

    fn finish(self) -> Result<(), SubstrateError> {
        self.buffer.update(|state| state.finished = true);
        Ok(())
    }
}

impl Drop for NativeBody {
    fn drop(&mut self) {
        // Unblocks the worker if the body is dropped without `finish`.
        self.buffer.update(|state| state.abandoned = !state.finished);
    }
}

pub struct NativePending {
    slot: ResponseSlot,
}

impl PendingResponse for NativePending {
    type Pollable = NativePollable;
    type Response = NativeResponse;

    fn subscribe(&self) -> NativePollable {
        NativePollable(Watch::Response(self.slot.clone()))
    }

    fn get(&mut self) -> Option<Result<NativeResponse, SubstrateError>> {
        lock(&self.slot)
            .take()
            .map(|result| result.map_err(SubstrateError::new))
    }
}

pub struct NativeResponse {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    body: Option<ureq::Body>,
    signal: Arc<Signal>,
}

impl IncomingResponse for NativeResponse {
    type Stream = NativeStream;

    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> Vec<(String, Vec<u8>)> {
        self.headers.clone()
    }

    fn consume(&mut self) -> Result<NativeStream, SubstrateError> {
        let body = self
            .body
            .take()
            .ok_or_else(|| SubstrateError::new("body already consumed"))?;
        let inbox = Arc::new(Mutex::new(Inbox::default()));
        let cancelled = Arc::new(AtomicBool::new(false));

        let reader_inbox = inbox.clone();
        let reader_cancelled = cancelled.clone();
        let signal = self.signal.clone();
        thread::spawn(move || pump_body(body, &reader_inbox, &reader_cancelled, &signal));

        Ok(NativeStream { inbox, cancelled })
    }
}

#[derive(Default)]
struct Inbox {
    chunks: VecDeque<Vec<u8>>,
    end: Option<StreamError>,
}

fn pump_body(body: ureq::Body, inbox: &Mutex<Inbox>, cancelled: &AtomicBool, signal: &Signal) {
    let mut reader = body.into_reader();
    let mut buf = vec![0u8; READ_CHUNK as usize];
    while !cancelled.load(Ordering::SeqCst) {
        let end = match reader.read(&mut buf) {
            Ok(0) => Some(StreamError::Closed),
            Ok(n) => {
                lock(inbox).chunks.push_back(buf[..n].to_vec());
                None
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => None,
            Err(e) => Some(StreamError::Failed(e.to_string())),
        };
        let done = end.is_some();
        if let Some(end) = end {
            lock(inbox).end = Some(end);
        }
        signal.notify();
        if done {
            break;
        }
    }
}

pub struct NativeStream {
    inbox: Arc<Mutex<Inbox>>,
    cancelled: Arc<AtomicBool>,
}

impl InputStream for NativeStream {
    type Pollable = NativePollable;

    fn read(&mut self, len: u64) -> Result<Vec<u8>, StreamError> {
        let mut inbox = lock(&self.inbox);
        let Some(mut chunk) = inbox.chunks.pop_front() else {
            return match &inbox.end {
                Some(end) => Err(end.clone()),
                None => Ok(Vec::new()),
            };
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if chunk.len() > len {
            let rest = chunk.split_off(len);
            inbox.chunks.push_front(rest);
        }
        Ok(chunk)
    }

    fn subscribe(&self) -> NativePollable {
        NativePollable(Watch::Inbox(self.inbox.clone()))
    }
}

impl Drop for NativeStream {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// What the worker thread needs to perform a request.
struct Target {
    method: Method,
    uri: String,
    headers: Vec<(String, Vec<u8>)>,
}

fn execute(
    agent: &ureq::Agent,
    target: &Target,
    body: Vec<u8>,
    signal: Arc<Signal>,
) -> Result<NativeResponse, String> {
    let mut builder = ureq::http::Request::builder()
        .method(target.method.as_str())
        .uri(target.uri.as_str());
    for (name, value) in &target.headers {
        // ureq frames the body and sets its own content-length.
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_slice());
    }

    let response = if body.is_empty() {
        let request = builder.body(()).map_err(|e| e.to_string())?;
        agent.run(request)
    } else {
        let request = builder.body(body).map_err(|e| e.to_string())?;
        agent.run(request)
    }
    .map_err(|e| e.to_string())?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();
    Ok(NativeResponse {
        status,
        headers,
        body: Some(response.into_body()),
        signal,
    })
}

impl Substrate for NativeSubstrate {
    type Pollable = NativePollable;
    type Body = NativeBody;
    type Request = NativeRequest;
    type Stream = NativeStream;
    type Response = NativeResponse;
    type Pending = NativePending;

    fn new_request(&self, headers: &[(String, Vec<u8>)]) -> Result<NativeRequest, SubstrateError> {
        Ok(NativeRequest {
            method: Method::Get,
            scheme: Scheme::Https,
            authority: String::new(),
            path_with_query: "/".to_string(),
            headers: headers.to_vec(),
            body: None,
        })
    }

    fn handle(&self, request: NativeRequest) -> Result<NativePending, SubstrateError> {
        if request.authority.is_empty() {
            return Err(SubstrateError::new("request has no authority"));
        }
        let buffer = request
            .body
            .ok_or_else(|| SubstrateError::new("request body was never taken"))?;
        let target = Target {
            uri: format!(
                "{}://{}{}",
                request.scheme, request.authority, request.path_with_query
            ),
            method: request.method,
            headers: request.headers,
        };

        let slot: ResponseSlot = Arc::new(Mutex::new(None));
        let worker_slot = slot.clone();
        let agent = self.agent.clone();
        let signal = self.signal.clone();
        thread::spawn(move || {
            let outcome = buffer
                .wait_finished()
                .and_then(|body| execute(&agent, &target, body, signal.clone()));
            *lock(&worker_slot) = Some(outcome);
            signal.notify();
        });

        Ok(NativePending { slot })
    }

    fn poll(&self, pollables: &[&NativePollable]) -> Vec<usize> {
        let mut generation = lock(&self.signal.generation);
        loop {
            let ready: Vec<usize> = pollables
                .iter()
                .enumerate()
                .filter(|(_, p)| p.ready())
                .map(|(i, _)| i)
                .collect();
            if !ready.is_empty() || pollables.is_empty() {
                return ready;
            }
            generation = self
                .signal
                .changed
                .wait(generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
