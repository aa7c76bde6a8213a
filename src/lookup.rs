//! `findElementWithTimeout`: the one place the selector algebra's blocking
//! behavior lives — the algebra itself never blocks, blocking is done by
//! the caller. Polls the driver's view hierarchy until the selector
//! resolves or the timeout elapses.

use std::time::Duration;

use tokio::time::Instant;

use crate::driver::{Driver, ViewHierarchy, ViewNode};
use crate::error::{DomainError, FlowError};
use crate::protocol::ElementSelector;
use crate::selector;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// An element resolved from a (now possibly stale) hierarchy snapshot.
/// Owned rather than borrowed so it can outlive the polling loop that
/// produced it.
#[derive(Debug, Clone)]
pub struct ResolvedElement {
    pub node: ViewNode,
    pub hierarchy: ViewHierarchy,
}

/// Polls `driver.view_hierarchy()` at `poll_interval` until `selector`
/// resolves or `timeout` elapses, returning `DomainError::ElementNotFound`
/// on timeout. Driver failures and selector-compile errors (e.g. a bad
/// regex) propagate immediately instead of being retried.
pub async fn find_element_with_timeout(
    driver: &dyn Driver,
    selector_spec: &ElementSelector,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<ResolvedElement, FlowError> {
    let deadline = Instant::now() + timeout;
    loop {
        let hierarchy = driver.view_hierarchy().await?;
        match selector::resolve(selector_spec, &hierarchy) {
            Ok(node) => {
                let node = node.clone();
                return Ok(ResolvedElement { node, hierarchy });
            }
            Err(err @ DomainError::ElementNotFound { .. }) => {
                if Instant::now() >= deadline {
                    return Err(FlowError::Domain(err));
                }
                tokio::time::sleep(poll_interval.min(remaining(deadline))).await;
            }
            Err(other) => return Err(FlowError::Domain(other)),
        }
    }
}

/// A single, non-retrying probe: used by `notVisible` polling and by
/// `scrollUntilVisible`, both of which apply their own retry/backoff logic
/// around a bare attempt rather than this module's timeout loop.
pub async fn try_find_once(
    driver: &dyn Driver,
    selector_spec: &ElementSelector,
) -> Result<Option<ResolvedElement>, FlowError> {
    let hierarchy = driver.view_hierarchy().await?;
    match selector::resolve(selector_spec, &hierarchy) {
        Ok(node) => Ok(Some(ResolvedElement {
            node: node.clone(),
            hierarchy,
        })),
        Err(DomainError::ElementNotFound { .. }) => Ok(None),
        Err(other) => Err(FlowError::Domain(other)),
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
