//! Sync protocol message types.
//!
//! Peers exchange five kinds of messages, distinguished by their `action`
//! field on the wire. The set is closed: anything else fails to decode.

use serde::{Deserialize, Serialize};

use covalue_core::{CoId, KnownState, KnownStateSessions, NewContentMessage, SessionId, SessionNewContent};

use crate::error::{Result, SyncError};

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    /// "I have this much of `id`, send me the rest."
    Load(KnownState),

    /// Acknowledge or declare how much of a value the sender holds.
    Known(KnownMessage),

    /// New transactions per session, plus the header if the receiver lacks it.
    Content(NewContentMessage),

    /// The sender is done with `id`.
    Done(DoneMessage),

    /// The receiver's content could not be reconciled with the sender's.
    Error(ErrorMessage),
}

/// A `known` message. With `is_correction` set it tells the receiver that
/// its assumption about the sender was wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownMessage {
    pub id: CoId,
    pub header: bool,
    pub sessions: KnownStateSessions,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_correction: bool,
}

impl KnownMessage {
    pub fn new(known: KnownState) -> Self {
        Self {
            id: known.id,
            header: known.header,
            sessions: known.sessions,
            is_correction: false,
        }
    }

    pub fn correction(known: KnownState) -> Self {
        Self {
            is_correction: true,
            ..Self::new(known)
        }
    }

    /// "I do not have `id` at all."
    pub fn not_found(id: CoId) -> Self {
        Self::new(KnownState::empty(id))
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id.clone(),
            header: self.header,
            sessions: self.sessions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMessage {
    pub id: CoId,
}

/// Kinds of protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorType {
    /// A session's content failed verification against the receiver's copy.
    SignatureMismatch,
}

/// An `error` message, carrying the sender's authoritative content for the
/// session in question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub error_type: SyncErrorType,
    pub id: CoId,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub content: Vec<SessionNewContent>,
    pub reason: String,
}

impl ErrorMessage {
    pub fn signature_mismatch(
        id: CoId,
        session_id: SessionId,
        content: Vec<SessionNewContent>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error_type: SyncErrorType::SignatureMismatch,
            id,
            session_id,
            content,
            reason: reason.into(),
        }
    }
}

impl SyncMessage {
    /// The CoValue this message is about.
    pub fn id(&self) -> &CoId {
        match self {
            SyncMessage::Load(known) => &known.id,
            SyncMessage::Known(known) => &known.id,
            SyncMessage::Content(content) => &content.id,
            SyncMessage::Done(done) => &done.id,
            SyncMessage::Error(error) => &error.id,
        }
    }

    /// The wire name of the message kind, for logs.
    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known(_) => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done(_) => "done",
            SyncMessage::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| SyncError::InvalidMessage(e.to_string()))
    }
}
