//! Body sink writer: streams an outgoing body under flow control.

use crate::poll_loop::PollLoop;
use crate::substrate::{OutgoingBody, StreamError, Substrate};

/// Write `data` through `body`, flush it, then finish the message.
///
/// Every chunk waits for writability first and never exceeds the permit
/// returned by `check_write`. An empty payload writes nothing but is still
/// finished.
pub async fn send_and_close<S: Substrate>(
    lp: &PollLoop<'_, S>,
    mut body: S::Body,
    data: &[u8],
) -> Result<(), String> {
    let mut offset = 0;
    while offset < data.len() {
        let permit = writable(lp, &mut body).await?;
        let end = offset + permit.min(data.len() - offset);
        body.write(&data[offset..end])
            .map_err(|e| format!("write failed after {offset} bytes: {e}"))?;
        tracing::trace!(bytes = end - offset, offset, "body chunk written");
        offset = end;
    }

    body.flush().map_err(|e| format!("flush failed: {e}"))?;
    writable(lp, &mut body).await?;

    body.finish().map_err(|e| format!("finish failed: {e}"))
}

/// Wait until `body` accepts at least one byte and return how many.
async fn writable<S: Substrate>(lp: &PollLoop<'_, S>, body: &mut S::Body) -> Result<usize, String> {
    loop {
        lp.wait_for(body.subscribe()).await;
        match body.check_write() {
            Ok(0) => continue,
            Ok(permit) => return Ok(usize::try_from(permit).unwrap_or(usize::MAX)),
            Err(StreamError::Closed) => return Err("body closed by peer".to_string()),
            Err(e) => return Err(e.to_string()),
        }
    }
}
