//! Connection Writer
//!
//! Every outbound frame goes through one bounded queue drained by this task,
//! so concurrent callers never interleave partial frames on the socket.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::Shared;
use crate::application::ports::FrameSink;
use crate::domain::error::CloseReason;

/// Drain `queue` into `sink` until cancelled or every sender is gone.
///
/// A failed write records the transport error and cancels the connection;
/// the reader then performs teardown.
pub(crate) async fn run_writer<K: FrameSink>(
    mut sink: K,
    mut queue: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut written: u64 = 0;
    loop {
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };

        trace!(bytes = text.len(), "writing frame");
        if let Err(e) = sink.write_frame(text).await {
            warn!(error = %e, "transport write failed");
            shared.fail(CloseReason::Transport(e.to_string()));
            break;
        }
        written += 1;
    }

    queue.close();
    if let Err(e) = sink.close().await {
        debug!(error = %e, "closing write half failed");
    }
    debug!(written, "writer stopped");
}
