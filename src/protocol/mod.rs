//! Tagged messages exchanged between controller and worker.
//!
//! Every transmission carries exactly one [`Message`]. The set is closed, and
//! both roles dispatch on it with exhaustive matches.

mod codec;
mod value;

pub use codec::{Decoder, Encoder, MAX_NESTING_DEPTH};
pub use value::{ArrayPayload, DType, Scalar, ScalarMap, ScalarValue};

/// Wire value meaning "no seed".
pub const SEED_NONE: i64 = -1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Request = 1,
    ResetArgs = 2,
    ResetReturn = 3,
    Action = 4,
    StepReturn = 5,
    Close = 6,
    Status = 7,
}

impl MessageTag {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let tag = match value {
            1 => MessageTag::Request,
            2 => MessageTag::ResetArgs,
            3 => MessageTag::ResetReturn,
            4 => MessageTag::Action,
            5 => MessageTag::StepReturn,
            6 => MessageTag::Close,
            7 => MessageTag::Status,
            _ => return None,
        };
        Some(tag)
    }
}

/// Result of one simulation step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepReturn {
    pub observation: ArrayPayload,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: ScalarMap,
}

impl From<StepReturn> for (ArrayPayload, f64, bool, bool, ScalarMap) {
    fn from(value: StepReturn) -> Self {
        (
            value.observation,
            value.reward,
            value.terminated,
            value.truncated,
            value.info,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Marker used by the handshake.
    Request,
    ResetArgs {
        seed: Option<i64>,
        options: ScalarMap,
    },
    ResetReturn {
        observation: ArrayPayload,
        info: ScalarMap,
    },
    Action(ArrayPayload),
    StepReturn(StepReturn),
    Close,
    /// Acknowledgement: handshake reply and close confirmation.
    Status,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Request => MessageTag::Request,
            Message::ResetArgs { .. } => MessageTag::ResetArgs,
            Message::ResetReturn { .. } => MessageTag::ResetReturn,
            Message::Action(_) => MessageTag::Action,
            Message::StepReturn(_) => MessageTag::StepReturn,
            Message::Close => MessageTag::Close,
            Message::Status => MessageTag::Status,
        }
    }
}
