use crate::error::GatewayError;
use crate::types::{DeviceMetadata, NotificationReport};
use std::sync::Arc;

/// Server API for notification reports.
///
/// Calls may block on the network; the pipeline only ever invokes them from
/// its own background workers. Timeouts are the implementation's concern.
pub trait RemoteReportGateway: Send + Sync {
    /// Everything the server holds after `after_id`, possibly truncated.
    fn fetch_after(&self, after_id: i64) -> Result<NotificationReport, GatewayError>;

    /// Tells the server the client has processed everything up to `id`.
    fn confirm_up_to(&self, id: i64, device: &DeviceMetadata) -> Result<(), GatewayError>;
}

impl<T: RemoteReportGateway + ?Sized> RemoteReportGateway for Arc<T> {
    fn fetch_after(&self, after_id: i64) -> Result<NotificationReport, GatewayError> {
        (**self).fetch_after(after_id)
    }

    fn confirm_up_to(&self, id: i64, device: &DeviceMetadata) -> Result<(), GatewayError> {
        (**self).confirm_up_to(id, device)
    }
}

/// Source of the metadata attached to confirmations. Read on every
/// confirmation so values like the standby bucket stay current.
pub trait DeviceInfo: Send + Sync {
    fn metadata(&self) -> DeviceMetadata;

    fn standby_bucket(&self) -> String {
        self.metadata().standby_bucket
    }
}

impl DeviceInfo for DeviceMetadata {
    fn metadata(&self) -> DeviceMetadata {
        self.clone()
    }

    fn standby_bucket(&self) -> String {
        self.standby_bucket.clone()
    }
}
