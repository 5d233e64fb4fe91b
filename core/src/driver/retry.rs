use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Runs `attempt` up to `max_attempts` times, sleeping `delay` between attempts
/// but not before the first one. Returns the last error once attempts run out.
pub(crate) async fn retry_with_delay<T, E, F, Fut>(
    action: &'static str,
    max_attempts: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = max_attempts.max(1);
    let mut current = 1;

    loop {
        match attempt(current).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    action,
                    attempt = current,
                    max_attempts,
                    error = %err,
                    "failed to create channel, retrying"
                );

                if current >= max_attempts {
                    error!(
                        action,
                        attempts = current,
                        error = %err,
                        "failed to create channel too many times"
                    );
                    return Err(err);
                }
            }
        }

        current += 1;
        tokio::time::sleep(delay).await;
    }
}
