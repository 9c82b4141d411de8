//! Scripted in-memory substrate for unit tests.
//!
//! Readiness is driven by a logical clock: every time `poll` finds nothing
//! ready it advances the clock by one tick. Each write, flush and read pushes
//! the next readiness of its resource one tick into the future, so the
//! order in which the write branch and the wait branch of an exchange
//! complete can be forced either way through `ResponseTiming`. Resources
//! append to an event log when they are released.

use std::cell::RefCell;
use std::rc::Rc;

use crate::http::{Method, Scheme};
use crate::substrate::{
    IncomingResponse, InputStream, OutgoingBody, OutgoingRequest, PendingResponse, Pollable,
    StreamError, Substrate, SubstrateError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Handle,
    Write,
    Finish,
    Response,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BodyEnd {
    #[default]
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseTiming {
    /// The response arrives one tick after the body is finished.
    #[default]
    AfterBody,
    /// The response arrives on the first tick, while the body is still
    /// being written.
    BeforeBody,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub chunks: Vec<Vec<u8>>,
    pub body_end: BodyEnd,
    pub write_permit: u64,
    pub response_timing: ResponseTiming,
    pub fail: Option<Failure>,
    pub reject_authority: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            chunks: Vec::new(),
            body_end: BodyEnd::Closed,
            write_permit: 1024,
            response_timing: ResponseTiming::AfterBody,
            fail: None,
            reject_authority: false,
        }
    }
}

/// What the adapter handed to the substrate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sent {
    pub method: Option<Method>,
    pub scheme: Option<Scheme>,
    pub authority: Option<String>,
    pub path_with_query: Option<String>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
    pub write_sizes: Vec<usize>,
    pub finished: bool,
}

struct State {
    script: Script,
    tick: u64,
    sent: Sent,
    submitted: bool,
    finished_at: u64,
    writable_at: u64,
    next_chunk: usize,
    chunk_offset: usize,
    chunk_ready_at: u64,
    reads: usize,
    events: Vec<&'static str>,
}

impl State {
    fn response_ready(&self) -> bool {
        if !self.submitted {
            return false;
        }
        if self.script.fail == Some(Failure::Response) {
            return self.tick >= 1;
        }
        match self.script.response_timing {
            ResponseTiming::BeforeBody => self.tick >= 1,
            ResponseTiming::AfterBody => self.sent.finished && self.tick > self.finished_at,
        }
    }
}

type Shared = Rc<RefCell<State>>;

pub struct MemorySubstrate {
    state: Shared,
}

impl MemorySubstrate {
    pub fn new(script: Script) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                script,
                tick: 0,
                sent: Sent::default(),
                submitted: false,
                finished_at: 0,
                writable_at: 0,
                next_chunk: 0,
                chunk_offset: 0,
                chunk_ready_at: 0,
                reads: 0,
                events: Vec::new(),
            })),
        }
    }

    pub fn sent(&self) -> Sent {
        self.state.borrow().sent.clone()
    }

    pub fn ticks(&self) -> u64 {
        self.state.borrow().tick
    }

    pub fn reads(&self) -> usize {
        self.state.borrow().reads
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.state.borrow().events.clone()
    }

    /// A pollable that becomes ready at tick `at`.
    pub fn timer(&self, at: u64) -> MemPollable {
        MemPollable {
            state: self.state.clone(),
            watch: Watch::Timer(at),
        }
    }

    /// A response that has already arrived, bypassing request submission.
    pub fn ready_response(&self) -> MemResponse {
        MemResponse {
            state: self.state.clone(),
            consumed: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Watch {
    Timer(u64),
    Output,
    Response,
    Input,
}

pub struct MemPollable {
    state: Shared,
    watch: Watch,
}

impl Pollable for MemPollable {
    fn ready(&self) -> bool {
        let state = self.state.borrow();
        match self.watch {
            Watch::Timer(at) => state.tick >= at,
            Watch::Output => state.tick >= state.writable_at,
            Watch::Response => state.response_ready(),
            Watch::Input => state.tick >= state.chunk_ready_at,
        }
    }
}

pub struct MemRequest {
    state: Shared,
    body_taken: bool,
}

impl OutgoingRequest for MemRequest {
    type Body = MemBody;

    fn set_method(&mut self, method: &Method) -> Result<(), SubstrateError> {
        self.state.borrow_mut().sent.method = Some(method.clone());
        Ok(())
    }

    fn set_scheme(&mut self, scheme: &Scheme) -> Result<(), SubstrateError> {
        self.state.borrow_mut().sent.scheme = Some(scheme.clone());
        Ok(())
    }

    fn set_authority(&mut self, authority: &str) -> Result<(), SubstrateError> {
        let mut state = self.state.borrow_mut();
        if state.script.reject_authority {
            return Err(SubstrateError::new("authority not allowed"));
        }
        state.sent.authority = Some(authority.to_string());
        Ok(())
    }

    fn set_path_with_query(&mut self, path_with_query: &str) -> Result<(), SubstrateError> {
        self.state.borrow_mut().sent.path_with_query = Some(path_with_query.to_string());
        Ok(())
    }

    fn body(&mut self) -> Result<MemBody, SubstrateError> {
        if self.body_taken {
            return Err(SubstrateError::new("body already taken"));
        }
        self.body_taken = true;
        Ok(MemBody {
            state: self.state.clone(),
            finished: false,
        })
    }
}

pub struct MemBody {
    state: Shared,
    finished: bool,
}

impl OutgoingBody for MemBody {
    type Pollable = MemPollable;

    fn check_write(&mut self) -> Result<u64, StreamError> {
        let state = self.state.borrow();
        if state.tick < state.writable_at {
            return Ok(0);
        }
        Ok(state.script.write_permit)
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        let mut state = self.state.borrow_mut();
        if state.script.fail == Some(Failure::Write) {
            return Err(StreamError::Failed("broken pipe".to_string()));
        }
        assert!(
            chunk.len() as u64 <= state.script.write_permit,
            "write of {} bytes exceeds permit",
            chunk.len()
        );
        state.sent.body.extend_from_slice(chunk);
        state.sent.write_sizes.push(chunk.len());
        state.writable_at = state.tick + 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        let mut state = self.state.borrow_mut();
        state.writable_at = state.tick + 1;
        Ok(())
    }

    fn subscribe(&self) -> MemPollable {
        MemPollable {
            state: self.state.clone(),
            watch: Watch::Output,
        }
    }

    fn finish(mut self) -> Result<(), SubstrateError> {
        let mut state = self.state.borrow_mut();
        if state.script.fail == Some(Failure::Finish) {
            return Err(SubstrateError::new("trailers rejected"));
        }
        self.finished = true;
        state.sent.finished = true;
        state.finished_at = state.tick;
        state.events.push("body finished");
        Ok(())
    }
}

impl Drop for MemBody {
    fn drop(&mut self) {
        if !self.finished {
            self.state.borrow_mut().events.push("body abandoned");
        }
    }
}

pub struct MemPending {
    state: Shared,
    delivered: bool,
}

impl PendingResponse for MemPending {
    type Pollable = MemPollable;
    type Response = MemResponse;

    fn subscribe(&self) -> MemPollable {
        MemPollable {
            state: self.state.clone(),
            watch: Watch::Response,
        }
    }

    fn get(&mut self) -> Option<Result<MemResponse, SubstrateError>> {
        if self.delivered || !self.state.borrow().response_ready() {
            return None;
        }
        self.delivered = true;
        let mut state = self.state.borrow_mut();
        if state.script.fail == Some(Failure::Response) {
            return Some(Err(SubstrateError::new("connection refused")));
        }
        state.events.push("response received");
        Some(Ok(MemResponse {
            state: self.state.clone(),
            consumed: false,
        }))
    }
}

impl Drop for MemPending {
    fn drop(&mut self) {
        self.state.borrow_mut().events.push("pending released");
    }
}

pub struct MemResponse {
    state: Shared,
    consumed: bool,
}

impl IncomingResponse for MemResponse {
    type Stream = MemStream;

    fn status(&self) -> u16 {
        self.state.borrow().script.status
    }

    fn headers(&self) -> Vec<(String, Vec<u8>)> {
        self.state.borrow().script.headers.clone()
    }

    fn consume(&mut self) -> Result<MemStream, SubstrateError> {
        if self.consumed {
            return Err(SubstrateError::new("body already consumed"));
        }
        self.consumed = true;
        let mut state = self.state.borrow_mut();
        state.chunk_ready_at = state.tick + 1;
        Ok(MemStream {
            state: self.state.clone(),
        })
    }
}

impl Drop for MemResponse {
    fn drop(&mut self) {
        self.state.borrow_mut().events.push("response released");
    }
}

pub struct MemStream {
    state: Shared,
}

impl InputStream for MemStream {
    type Pollable = MemPollable;

    fn read(&mut self, len: u64) -> Result<Vec<u8>, StreamError> {
        let mut state = self.state.borrow_mut();
        state.reads += 1;
        if state.tick < state.chunk_ready_at {
            return Ok(Vec::new());
        }
        let index = state.next_chunk;
        let Some(chunk) = state.script.chunks.get(index) else {
            return match &state.script.body_end {
                BodyEnd::Closed => Err(StreamError::Closed),
                BodyEnd::Failed(msg) => Err(StreamError::Failed(msg.clone())),
            };
        };
        let start = state.chunk_offset;
        let end = chunk.len().min(start + len as usize);
        let out = chunk[start..end].to_vec();
        if end == chunk.len() {
            state.next_chunk += 1;
            state.chunk_offset = 0;
        } else {
            state.chunk_offset = end;
        }
        state.chunk_ready_at = state.tick + 1;
        Ok(out)
    }

    fn subscribe(&self) -> MemPollable {
        MemPollable {
            state: self.state.clone(),
            watch: Watch::Input,
        }
    }
}

impl Drop for MemStream {
    fn drop(&mut self) {
        self.state.borrow_mut().events.push("stream released");
    }
}

impl Substrate for MemorySubstrate {
    type Pollable = MemPollable;
    type Body = MemBody;
    type Request = MemRequest;
    type Stream = MemStream;
    type Response = MemResponse;
    type Pending = MemPending;

    fn new_request(&self, headers: &[(String, Vec<u8>)]) -> Result<MemRequest, SubstrateError> {
        self.state.borrow_mut().sent.headers = headers.to_vec();
        Ok(MemRequest {
            state: self.state.clone(),
            body_taken: false,
        })
    }

    fn handle(&self, _request: MemRequest) -> Result<MemPending, SubstrateError> {
        let mut state = self.state.borrow_mut();
        if state.script.fail == Some(Failure::Handle) {
            return Err(SubstrateError::new("no route to host"));
        }
        state.submitted = true;
        state.events.push("submitted");
        Ok(MemPending {
            state: self.state.clone(),
            delivered: false,
        })
    }

    fn poll(&self, pollables: &[&MemPollable]) -> Vec<usize> {
        for _ in 0..10_000 {
            let ready: Vec<usize> = pollables
                .iter()
                .enumerate()
                .filter(|(_, p)| p.ready())
                .map(|(i, _)| i)
                .collect();
            if !ready.is_empty() {
                return ready;
            }
            self.state.borrow_mut().tick += 1;
        }
        panic!("scripted substrate: nothing became ready");
    }
}
