//! The exchange driver and its blocking entry point.
//!
//! # Design
//! One exchange runs as a single task on a [`PollLoop`]. After the request is
//! submitted, writing the body and waiting for the response are joined with
//! `try_join`: both branches are polled on every wake-up, whichever
//! pollable fires first resumes its branch, and the first failure drops the
//! other branch, which releases its pollable and handles.
//!
//! The incoming side lives in [`Incoming`], which owns the body stream and
//! the response it came from. Dropping it releases both, stream first, on
//! every exit path.

use futures::future::try_join;
use tracing::{debug, warn};

use crate::error::{ExchangeError, ExchangeState};
use crate::http::{Request, Response};
use crate::poll_loop::PollLoop;
use crate::sink::send_and_close;
use crate::stream::read_to_end;
use crate::substrate::{IncomingResponse, PendingResponse, Substrate};
use crate::translate::translate;

/// Send `request` on a fresh poll loop and block until the response body has
/// been read in full.
///
/// Must not be called from a future running on a [`PollLoop`]; that fails
/// with [`ExchangeError::Reentered`].
pub fn send<S: Substrate>(substrate: &S, request: &Request) -> Result<Response, ExchangeError> {
    let lp = PollLoop::new(substrate);
    let response = lp.run(send_async(&lp, request))??;
    Ok(response)
}

/// Drive one exchange on `lp`.
pub async fn send_async<S: Substrate>(
    lp: &PollLoop<'_, S>,
    request: &Request,
) -> Result<Response, ExchangeError> {
    let result = exchange(lp, request).await;
    if let Err(e) = &result {
        warn!(method = %request.method, uri = %request.uri, error = %e, "exchange failed");
    }
    result
}

async fn exchange<S: Substrate>(
    lp: &PollLoop<'_, S>,
    request: &Request,
) -> Result<Response, ExchangeError> {
    let substrate = lp.substrate();
    let parts = translate(request)?;
    let (outgoing, body) = parts.into_outgoing(substrate)?;

    debug!(
        method = %parts.method,
        authority = %parts.authority,
        path = %parts.path_with_query,
        state = ?ExchangeState::Sending,
        "submitting request"
    );
    let pending = substrate
        .handle(outgoing)
        .map_err(|e| ExchangeError::transport(ExchangeState::Sending, e.to_string()))?;

    let payload = request.body.as_deref().unwrap_or_default();
    let sending = async {
        send_and_close(lp, body, payload)
            .await
            .map_err(|message| ExchangeError::transport(ExchangeState::Sending, message))
    };
    let ((), response) = try_join(sending, wait_response(lp, pending)).await?;
    debug!(state = ?ExchangeState::BothDone, "request sent and response arrived");

    let mut incoming = Incoming::<S>::open(response)?;
    let status = incoming.response.status();
    let headers = decode_headers(incoming.response.headers())?;
    debug!(status, headers = headers.len(), state = ?ExchangeState::HeadersReceived, "response headers");

    debug!(state = ?ExchangeState::StreamingBody, "reading response body");
    let body = read_to_end(lp, &mut incoming.stream)
        .await
        .map_err(|message| ExchangeError::transport(ExchangeState::StreamingBody, message))?;
    drop(incoming);

    debug!(status, bytes = body.len(), state = ?ExchangeState::Complete, "exchange complete");
    Ok(Response {
        status,
        headers,
        body,
    })
}

async fn wait_response<S: Substrate>(
    lp: &PollLoop<'_, S>,
    mut pending: S::Pending,
) -> Result<S::Response, ExchangeError> {
    loop {
        if let Some(result) = pending.get() {
            return result
                .map_err(|e| ExchangeError::transport(ExchangeState::Waiting, e.to_string()));
        }
        lp.wait_for(pending.subscribe()).await;
    }
}

/// Received response and its body stream.
struct Incoming<S: Substrate> {
    // Declared first so it is dropped before the response it belongs to.
    stream: S::Stream,
    response: S::Response,
}

impl<S: Substrate> Incoming<S> {
    fn open(mut response: S::Response) -> Result<Self, ExchangeError> {
        let stream = response
            .consume()
            .map_err(|e| ExchangeError::transport(ExchangeState::BothDone, e.to_string()))?;
        Ok(Self { stream, response })
    }
}

impl<S: Substrate> Drop for Incoming<S> {
    fn drop(&mut self) {
        tracing::trace!("releasing incoming response");
    }
}

fn decode_headers(raw: Vec<(String, Vec<u8>)>) -> Result<Vec<(String, String)>, ExchangeError> {
    raw.into_iter()
        .map(|(name, value)| match String::from_utf8(value) {
            Ok(value) => Ok((name, value)),
            Err(_) => Err(ExchangeError::transport(
                ExchangeState::HeadersReceived,
                format!("value of header {name:?} is not valid UTF-8"),
            )),
        })
        .collect()
}
