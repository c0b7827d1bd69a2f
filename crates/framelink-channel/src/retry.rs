use framelink_frame::{ChannelError, ChannelResult};
use framelink_transport::Backoff;
use tracing::info;

/// Run `op` until the channel it opens exists.
///
/// Only `ChannelNotFound` is retried, so a consumer started before its
/// producer waits for it while every other failure surfaces at once.
pub fn retry_with_backoff<T>(
    backoff: &Backoff,
    mut op: impl FnMut() -> ChannelResult<T>,
) -> ChannelResult<T> {
    let mut waiting = false;
    backoff.retry(
        || op(),
        |err| {
            let retry = matches!(err, ChannelError::ChannelNotFound { .. });
            if retry && !waiting {
                info!(error = %err, max_wait = ?backoff.max_wait, "waiting for producer");
                waiting = true;
            }
            retry
        },
    )
}
