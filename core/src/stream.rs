//! Incoming body reader.

use crate::poll_loop::PollLoop;
use crate::substrate::{InputStream, StreamError, Substrate};

/// Largest chunk requested from the input stream per read.
pub const READ_CHUNK: u64 = 16 * 1024;

/// Pull chunks from `stream` until it closes, appending them in order.
///
/// `StreamError::Closed` ends the loop successfully; any other stream error
/// is returned with the number of bytes read so far.
pub async fn read_to_end<S: Substrate>(
    lp: &PollLoop<'_, S>,
    stream: &mut S::Stream,
) -> Result<Vec<u8>, String> {
    let mut body = Vec::new();
    loop {
        lp.wait_for(stream.subscribe()).await;
        match stream.read(READ_CHUNK) {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(chunk) => {
                tracing::trace!(bytes = chunk.len(), total = body.len() + chunk.len(), "body chunk read");
                body.extend_from_slice(&chunk);
            }
            Err(StreamError::Closed) => return Ok(body),
            Err(e) => return Err(format!("read failed after {} bytes: {e}", body.len())),
        }
    }
}
