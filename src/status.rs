//! Message lifecycle and the transition allow-list guarding every status write.
//!
//! ```text
//! pending ──► review ──► promoted
//!    ▲          │
//!    └──────────┘ (restore)
//! pending ─────────────► promoted
//! ```
//! Anything not in `ALLOWED` is rejected. New statuses must extend the table.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Review,
    Promoted,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Review => "review",
            MessageStatus::Promoted => "promoted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "review" => Some(MessageStatus::Review),
            "promoted" => Some(MessageStatus::Promoted),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALLOWED: &[(MessageStatus, MessageStatus)] = &[
    (MessageStatus::Pending, MessageStatus::Review),
    (MessageStatus::Review, MessageStatus::Pending),
    (MessageStatus::Review, MessageStatus::Promoted),
    (MessageStatus::Pending, MessageStatus::Promoted),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn validate(current: MessageStatus, proposed: MessageStatus) -> TransitionCheck {
    if ALLOWED.contains(&(current, proposed)) {
        return TransitionCheck {
            valid: true,
            error: None,
        };
    }
    let error = if current == proposed {
        format!("message is already '{current}'")
    } else {
        format!("transition '{current}' -> '{proposed}' is not allowed")
    };
    TransitionCheck {
        valid: false,
        error: Some(error),
    }
}
