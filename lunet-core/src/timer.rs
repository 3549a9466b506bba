use std::time::Duration;

use crate::error::CoreError;
use crate::value::Value;

/// One-shot sleep. The timer is transient: it exists only for the
/// duration of the suspension and is never script-visible.
pub async fn sleep(ms: u64) -> Result<Vec<Value>, CoreError> {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(vec![])
}
