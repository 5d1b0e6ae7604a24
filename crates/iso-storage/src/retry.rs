use std::time::Duration;

use iso_types::error::{ErrorKind, IsoError, Result};

use crate::RetryConfig;

/// Retry a closure on non-fatal errors with exponential backoff + jitter.
///
/// Both transient failures and "not found yet" answers from eventually
/// consistent stores are retried; [`ErrorKind::Fatal`] errors return at once.
pub fn retry_call<T>(
    config: &RetryConfig,
    op_name: &str,
    label: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.kind() != ErrorKind::Fatal && attempt < config.max_retries => {
                tracing::warn!(
                    "{label} {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| IsoError::Other(format!("{label} {op_name}: no attempt made"))))
}

/// Map a `ureq` failure onto the error taxonomy.
pub fn from_ureq(err: ureq::Error, context: &str) -> IsoError {
    match err {
        ureq::Error::Status(status, _) => IsoError::Http {
            status,
            context: context.to_string(),
        },
        ureq::Error::Transport(t) => IsoError::Transport(format!("{context}: {t}")),
    }
}
