pub mod client;
pub mod pool;
pub mod script;

use crate::check::Reason;
use crate::errors::{QuotaError, Result};
use crate::limiter::DistributedDecision;

pub use client::RedisBucketStore;
pub use pool::create_redis_pool;

/// Decode the script's `{allowed, remaining, reason}` reply.
pub fn parse_script_response(value: redis::Value) -> Result<DistributedDecision> {
    let items = match value {
        redis::Value::Array(items) => items,
        other => {
            return Err(QuotaError::ScriptExecutionError(format!(
                "Invalid script response: {:?}",
                other
            )))
        }
    };

    if items.len() != 3 {
        return Err(QuotaError::ScriptExecutionError(format!(
            "Invalid script response length: {}",
            items.len()
        )));
    }

    let allowed = match &items[0] {
        redis::Value::Int(v) => *v == 1,
        _ => {
            return Err(QuotaError::ScriptExecutionError(
                "Invalid allowed value type".to_string(),
            ))
        }
    };

    let remaining = match &items[1] {
        redis::Value::Int(v) => (*v).max(0) as u64,
        _ => {
            return Err(QuotaError::ScriptExecutionError(format!(
                "Invalid remaining value type: {:?}",
                items[1]
            )))
        }
    };

    let reason_text = match &items[2] {
        redis::Value::BulkString(bytes) => std::str::from_utf8(bytes)
            .map_err(|e| {
                QuotaError::ScriptExecutionError(format!("Invalid UTF-8 in reason: {}", e))
            })?
            .to_string(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::Nil => String::new(),
        other => {
            return Err(QuotaError::ScriptExecutionError(format!(
                "Invalid reason value type: {:?}",
                other
            )))
        }
    };

    let reason = reason_text.parse::<Reason>().map_err(|_| {
        QuotaError::ScriptExecutionError(format!("Unknown reason from script: {}", reason_text))
    })?;

    Ok(DistributedDecision {
        allowed,
        remaining,
        reason,
    })
}
