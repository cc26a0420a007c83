//! Conversation-level realtime features: typing indicators (volatile) and
//! read receipts (durable, idempotent).

pub mod receipts;
pub mod typing;

pub use receipts::{ReadReceipt, ReadReceiptTracker, ReadStatus};
pub use typing::TypingTracker;

use amoria_core::EventBusError;
use amoria_guard::BreakerError;
use amoria_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error(transparent)]
    Bus(#[from] EventBusError),

    #[error(transparent)]
    Store(#[from] BreakerError<StoreError>),

    #[error("unexpected store response: {0}")]
    BadResponse(String),
}
