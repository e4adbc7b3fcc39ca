//! Token lifecycle metrics
//!
//! - `storefront_auth_exchanges_total` (counter): labels `grant_type`, `outcome`
//! - `storefront_auth_invalidations_total` (counter): label `reason`
//! - `storefront_auth_persistence_failures_total` (counter): label `operation`
//!
//! Without an installed recorder these are no-ops.

use crate::grant::GrantType;

pub(crate) fn record_exchange(grant: GrantType, outcome: &'static str) {
    metrics::counter!(
        "storefront_auth_exchanges_total",
        "grant_type" => grant.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub(crate) fn record_invalidation(reason: &'static str) {
    metrics::counter!("storefront_auth_invalidations_total", "reason" => reason).increment(1);
}

pub(crate) fn record_persistence_failure(operation: &'static str) {
    metrics::counter!(
        "storefront_auth_persistence_failures_total",
        "operation" => operation
    )
    .increment(1);
}
