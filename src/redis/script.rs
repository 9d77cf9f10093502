use crate::errors::{QuotaError, Result};
use redis::Script;
use tracing::{debug, info};

const TOKEN_BUCKET_SCRIPT: &str = include_str!("../../scripts/token_bucket.lua");

/// Register the token bucket script with Redis so later calls can use EVALSHA.
pub async fn load_script<C: redis::aio::ConnectionLike>(conn: &mut C) -> Result<String> {
    debug!("Loading token bucket script into Redis...");

    let sha = get_script()
        .prepare_invoke()
        .load_async(conn)
        .await
        .map_err(|e| QuotaError::ScriptExecutionError(format!("Failed to load Lua script: {}", e)))?;

    info!("Token bucket script loaded (SHA: {})", sha);
    Ok(sha)
}

/// Script handle; invocations fall back to EVAL when the SHA is unknown.
pub fn get_script() -> Script {
    Script::new(TOKEN_BUCKET_SCRIPT)
}
