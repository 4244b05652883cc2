use crate::model::SetError;
use std::fmt;

/// Outcome codes published on `<prefix>/plugins/<id>/error/code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeErrorCode {
    Success,
    /// Message addressed outside the known prefix.
    AttributeNotChangeable,
    /// Write on a missing, read-only or wrongly addressed element.
    MessageNotUnderstood,
    /// Payload could not be decoded or failed envelope validation.
    SetFormat,
    /// The model refused an otherwise well-formed value.
    SetError,
}

impl BridgeErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            BridgeErrorCode::Success => 0,
            BridgeErrorCode::AttributeNotChangeable => -1,
            BridgeErrorCode::MessageNotUnderstood => -2,
            BridgeErrorCode::SetFormat => -3,
            BridgeErrorCode::SetError => -4,
        }
    }

    pub fn is_success(self) -> bool {
        self == BridgeErrorCode::Success
    }
}

impl fmt::Display for BridgeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BridgeErrorCode::Success => "SUCCESS",
            BridgeErrorCode::AttributeNotChangeable => "ATTRIBUTE_NOT_CHANGEABLE",
            BridgeErrorCode::MessageNotUnderstood => "MESSAGE_NOT_UNDERSTOOD",
            BridgeErrorCode::SetFormat => "SET_FORMAT",
            BridgeErrorCode::SetError => "SET_ERROR",
        };
        f.write_str(name)
    }
}

impl From<&SetError> for BridgeErrorCode {
    fn from(err: &SetError) -> Self {
        match err {
            SetError::Format(_) => BridgeErrorCode::SetFormat,
            SetError::Rejected(_) => BridgeErrorCode::SetError,
        }
    }
}
