use serde::{Deserialize, Serialize};
use std::fmt;

/// A single server-originated event. `previous_id` is the id the server
/// expects to immediately precede this message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub id: i64,
    pub previous_id: i64,
    pub message_type: String,
    #[serde(default, with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(id: i64, previous_id: i64, message_type: impl Into<String>) -> Self {
        Self { id, previous_id, message_type: message_type.into(), payload: Vec::new() }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_wire(&self.message_type)
    }
}

/// A batch of notifications as returned by the server for a starting point.
///
/// `maximum_id` is the highest id known to the server when the report was
/// generated, so it may exceed the last message when the report was truncated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReport {
    pub previous_id: i64,
    pub maximum_id: i64,
    #[serde(default)]
    pub messages: Vec<NotificationMessage>,
}

impl NotificationReport {
    pub fn new(previous_id: i64, maximum_id: i64, messages: Vec<NotificationMessage>) -> Self {
        Self { previous_id, maximum_id, messages }
    }

    /// An empty report announcing that the server holds messages up to `maximum_id`.
    pub fn empty(previous_id: i64, maximum_id: i64) -> Self {
        Self::new(previous_id, maximum_id, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_id(&self) -> Option<i64> {
        self.messages.last().map(|message| message.id)
    }
}

/// Durable delivery marker owned by the sequential processor.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub last_processed_id: i64,
    pub processing_failures: u64,
}

impl Cursor {
    pub fn new(last_processed_id: i64, processing_failures: u64) -> Self {
        Self { last_processed_id, processing_failures }
    }

    /// Cursor after `id` reached a terminal outcome. Failures always reset.
    pub fn advanced_to(self, id: i64) -> Self {
        Self { last_processed_id: id.max(self.last_processed_id), processing_failures: 0 }
    }

    pub fn with_failure(self) -> Self {
        Self {
            last_processed_id: self.last_processed_id,
            processing_failures: self.processing_failures.saturating_add(1),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Applied,
    SkippedAfterRetryLimit,
    AlreadyProcessed,
}

impl ProcessingOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::SkippedAfterRetryLimit => "skipped_after_retry_limit",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    Started,
    Completed,
}

/// Client metadata attached to delivery confirmations. Opaque to the pipeline.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub model: String,
    pub os_version: String,
    pub standby_bucket: String,
}

impl DeviceMetadata {
    pub fn new(
        model: impl Into<String>,
        os_version: impl Into<String>,
        standby_bucket: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            os_version: os_version.into(),
            standby_bucket: standby_bucket.into(),
        }
    }
}

/// Discriminant of a notification's `message_type`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    NewContact,
    ContactUpdate,
    NewOperation,
    OperationUpdate,
    EmailVerified,
    AuthorizeSignin,
    AuthorizeRcSignin,
    AuthorizeChallengeUpdate,
    FulfillIncomingSwap,
    NoOp,
    EventCommunication,
    Unknown(String),
}

impl MessageKind {
    pub const KNOWN: [MessageKind; 11] = [
        MessageKind::NewContact,
        MessageKind::ContactUpdate,
        MessageKind::NewOperation,
        MessageKind::OperationUpdate,
        MessageKind::EmailVerified,
        MessageKind::AuthorizeSignin,
        MessageKind::AuthorizeRcSignin,
        MessageKind::AuthorizeChallengeUpdate,
        MessageKind::FulfillIncomingSwap,
        MessageKind::NoOp,
        MessageKind::EventCommunication,
    ];

    pub fn from_wire(raw: &str) -> Self {
        match raw.trim() {
            "contact/new" => Self::NewContact,
            "contact/update" => Self::ContactUpdate,
            "operation/new" => Self::NewOperation,
            "operation/update" => Self::OperationUpdate,
            "email/verified" => Self::EmailVerified,
            "signin/authorize" => Self::AuthorizeSignin,
            "signin/authorize-rc" => Self::AuthorizeRcSignin,
            "challenge/authorize-update" => Self::AuthorizeChallengeUpdate,
            "incoming-swap/fulfill" => Self::FulfillIncomingSwap,
            "noop" => Self::NoOp,
            "event/communication" => Self::EventCommunication,
            other => Self::Unknown(other.to_owned()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Self::NewContact => "contact/new",
            Self::ContactUpdate => "contact/update",
            Self::NewOperation => "operation/new",
            Self::OperationUpdate => "operation/update",
            Self::EmailVerified => "email/verified",
            Self::AuthorizeSignin => "signin/authorize",
            Self::AuthorizeRcSignin => "signin/authorize-rc",
            Self::AuthorizeChallengeUpdate => "challenge/authorize-update",
            Self::FulfillIncomingSwap => "incoming-swap/fulfill",
            Self::NoOp => "noop",
            Self::EventCommunication => "event/communication",
            Self::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}
