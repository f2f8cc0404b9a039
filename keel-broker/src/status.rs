use keel_core::OrderStatus;
use tracing::warn;

/// Map an exchange status string onto the internal lifecycle vocabulary.
///
/// Unknown strings yield `None` and are logged; callers keep the last known status.
pub fn normalize_status(raw: &str) -> Option<OrderStatus> {
    let key = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    let status = match key.as_str() {
        "new" | "pending" | "pending_new" | "submitted" | "accepted" => OrderStatus::Submitted,
        "open" | "working" | "active" | "live" | "resting" => OrderStatus::Working,
        "partially_filled" | "partial" | "partial_fill" => OrderStatus::PartiallyFilled,
        "closed" | "filled" | "done" | "executed" => OrderStatus::Filled,
        "pending_cancel" | "cancel_pending" | "canceling" | "cancelling" => {
            OrderStatus::CancelPending
        }
        "canceled" | "cancelled" | "expired" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        "failed" | "error" => OrderStatus::Failed,
        _ => {
            warn!(status = raw, "unrecognized exchange order status");
            return None;
        }
    };
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_exchange_vocabulary() {
        assert_eq!(normalize_status("open"), Some(OrderStatus::Working));
        assert_eq!(normalize_status("pending"), Some(OrderStatus::Submitted));
        assert_eq!(normalize_status("closed"), Some(OrderStatus::Filled));
        assert_eq!(normalize_status("Canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(normalize_status("expired"), Some(OrderStatus::Cancelled));
        assert_eq!(
            normalize_status("partially filled"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(normalize_status("pending-cancel"), Some(OrderStatus::CancelPending));
    }

    #[test]
    fn unknown_status_is_ignored() {
        assert_eq!(normalize_status("suspended"), None);
    }
}
