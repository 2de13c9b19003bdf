// Admin writes
pub const FLAG_DEFAULT_UPDATES_COUNTER: &str = "flag_default_updates_total";
pub const FLAG_BULK_SKIPPED_COUNTER: &str = "flag_bulk_update_skipped_total";
pub const FLAG_STORE_ERRORS_COUNTER: &str = "flag_store_errors_total";

// Change notifications
pub const FLAG_NOTIFICATIONS_COUNTER: &str = "flag_notifications_total";
pub const FLAG_NOTIFICATION_DURATION_HISTOGRAM: &str = "flag_notification_duration_seconds";
pub const FLAG_NOTIFICATION_QUEUE_DEPTH_GAUGE: &str = "flag_notification_queue_depth";
