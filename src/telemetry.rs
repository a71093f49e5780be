use crate::types::SubscriptionId;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_subscription(name: &'static str, subscription_id: &SubscriptionId) {
    metrics::increment_counter!(name, "subscription" => subscription_id.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_subscription(_name: &'static str, _subscription_id: &SubscriptionId) {}
