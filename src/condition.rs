//! Decides the truth of a `Condition` against current UI, platform, and
//! script state. Clauses are conjunctive; an empty condition is vacuously
//! true.

use std::time::Duration;

use crate::driver::Driver;
use crate::error::FlowError;
use crate::lookup;
use crate::protocol::Condition;

const NOT_VISIBLE_POLL: Duration = Duration::from_millis(500);

/// `evaluate(condition, commandOptional, timeoutMs?) → bool`. `timeout` is
/// the already-`adjustedToLatestInteraction` window to use for `visible`/
/// `notVisible` when the condition itself specifies no `timeoutMs`.
pub async fn evaluate(
    condition: &Condition,
    driver: &dyn Driver,
    timeout: Duration,
) -> Result<bool, FlowError> {
    if condition.is_empty() {
        return Ok(true);
    }

    if let Some(expected_platform) = &condition.platform {
        let info = driver.cached_device_info().await;
        if !info.platform.eq_ignore_ascii_case(expected_platform) {
            return Ok(false);
        }
    }

    if let Some(selector) = &condition.visible {
        match lookup::find_element_with_timeout(
            driver,
            selector,
            timeout,
            lookup::DEFAULT_POLL_INTERVAL,
        )
        .await
        {
            Ok(_) => {}
            Err(FlowError::Domain(crate::error::DomainError::ElementNotFound { .. })) => {
                return Ok(false);
            }
            Err(other) => return Err(other),
        }
    }

    if let Some(selector) = &condition.not_visible {
        if !evaluate_not_visible(selector, driver, timeout).await? {
            return Ok(false);
        }
    }

    if let Some(script_result) = &condition.script_expression {
        if !truthy(script_result) {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Polls with 500ms find attempts; succeeds the moment one reports
/// not-found. If the element stays visible for the entire window, the
/// clause is false.
async fn evaluate_not_visible(
    selector: &crate::protocol::ElementSelector,
    driver: &dyn Driver,
    timeout: Duration,
) -> Result<bool, FlowError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if lookup::try_find_once(driver, selector).await?.is_none() {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        tokio::time::sleep(NOT_VISIBLE_POLL.min(remaining)).await;
    }
}

/// `scriptExpression` truthiness: false iff empty, case-insensitive
/// "false"/"undefined"/"null", or numeric zero; anything else is true.
fn truthy(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_ascii_lowercase();
    if matches!(lower.as_str(), "false" | "undefined" | "null") {
        return false;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return n != 0.0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_rules() {
        assert!(!truthy(""));
        assert!(!truthy("  "));
        assert!(!truthy("false"));
        assert!(!truthy("FALSE"));
        assert!(!truthy("undefined"));
        assert!(!truthy("null"));
        assert!(!truthy("0"));
        assert!(!truthy("0.0"));
        assert!(truthy("0.5"));
        assert!(truthy("true"));
        assert!(truthy("anything else"));
    }
}
