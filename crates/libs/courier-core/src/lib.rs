pub mod cursor;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod report;
pub mod types;

pub use cursor::{CursorStore, MemoryCursorStore, SqliteCursorStore};
pub use error::{CourierError, GatewayError, HandlerError, SequenceError, StoreError};
pub use gateway::{DeviceInfo, RemoteReportGateway};
pub use registry::{HandlerRegistry, MessageHandler, Skippability};
pub use report::validate_report;
pub use types::{
    Cursor, DeviceMetadata, MessageKind, NotificationMessage, NotificationReport,
    ProcessingOutcome, ProcessingState,
};
