//! LDAP result codes (RFC 4511 section 4.1.9, RFC 3909 cancel codes and the
//! client-side codes backends use for transport failures).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LdapError;

/// Closed set of protocol status values. Each variant carries its
/// protocol-assigned numeric code, see [`ResultCode::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    SortControlMissing,
    OffsetRangeError,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    VirtualListViewError,
    Other,
    ServerDown,
    LocalError,
    EncodingError,
    DecodingError,
    Timeout,
    ConnectError,
    Canceled,
    NoSuchOperation,
    TooLate,
    CannotCancel,
    AssertionFailed,
    AuthorizationDenied,
}

const CODE_TABLE: &[(ResultCode, u32)] = &[
    (ResultCode::Success, 0),
    (ResultCode::OperationsError, 1),
    (ResultCode::ProtocolError, 2),
    (ResultCode::TimeLimitExceeded, 3),
    (ResultCode::SizeLimitExceeded, 4),
    (ResultCode::CompareFalse, 5),
    (ResultCode::CompareTrue, 6),
    (ResultCode::AuthMethodNotSupported, 7),
    (ResultCode::StrongAuthRequired, 8),
    (ResultCode::Referral, 10),
    (ResultCode::AdminLimitExceeded, 11),
    (ResultCode::UnavailableCriticalExtension, 12),
    (ResultCode::ConfidentialityRequired, 13),
    (ResultCode::SaslBindInProgress, 14),
    (ResultCode::NoSuchAttribute, 16),
    (ResultCode::UndefinedAttributeType, 17),
    (ResultCode::InappropriateMatching, 18),
    (ResultCode::ConstraintViolation, 19),
    (ResultCode::AttributeOrValueExists, 20),
    (ResultCode::InvalidAttributeSyntax, 21),
    (ResultCode::NoSuchObject, 32),
    (ResultCode::AliasProblem, 33),
    (ResultCode::InvalidDnSyntax, 34),
    (ResultCode::AliasDereferencingProblem, 36),
    (ResultCode::InappropriateAuthentication, 48),
    (ResultCode::InvalidCredentials, 49),
    (ResultCode::InsufficientAccessRights, 50),
    (ResultCode::Busy, 51),
    (ResultCode::Unavailable, 52),
    (ResultCode::UnwillingToPerform, 53),
    (ResultCode::LoopDetect, 54),
    (ResultCode::SortControlMissing, 60),
    (ResultCode::OffsetRangeError, 61),
    (ResultCode::NamingViolation, 64),
    (ResultCode::ObjectClassViolation, 65),
    (ResultCode::NotAllowedOnNonLeaf, 66),
    (ResultCode::NotAllowedOnRdn, 67),
    (ResultCode::EntryAlreadyExists, 68),
    (ResultCode::ObjectClassModsProhibited, 69),
    (ResultCode::AffectsMultipleDsas, 71),
    (ResultCode::VirtualListViewError, 76),
    (ResultCode::Other, 80),
    (ResultCode::ServerDown, 81),
    (ResultCode::LocalError, 82),
    (ResultCode::EncodingError, 83),
    (ResultCode::DecodingError, 84),
    (ResultCode::Timeout, 85),
    (ResultCode::ConnectError, 91),
    (ResultCode::Canceled, 118),
    (ResultCode::NoSuchOperation, 119),
    (ResultCode::TooLate, 120),
    (ResultCode::CannotCancel, 121),
    (ResultCode::AssertionFailed, 122),
    (ResultCode::AuthorizationDenied, 123),
];

impl ResultCode {
    /// Numeric code as carried on the wire.
    pub fn code(self) -> u32 {
        CODE_TABLE
            .iter()
            .find(|(rc, _)| *rc == self)
            .map(|(_, code)| *code)
            .unwrap_or(80)
    }

    /// Looks up the result code for a numeric value. `None` for values with
    /// no assigned meaning.
    pub fn from_code(code: u32) -> Option<Self> {
        CODE_TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(rc, _)| *rc)
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// compareTrue and compareFalse: the outcome of a processed compare, and
    /// a failure status for any other operation.
    pub fn is_compare_result(self) -> bool {
        matches!(self, ResultCode::CompareTrue | ResultCode::CompareFalse)
    }
}

impl TryFrom<u32> for ResultCode {
    type Error = LdapError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ResultCode::from_code(value)
            .ok_or_else(|| LdapError::decode(format!("Unknown result code {}", value)))
    }
}

impl TryFrom<i64> for ResultCode {
    type Error = LdapError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .ok()
            .and_then(ResultCode::from_code)
            .ok_or_else(|| LdapError::decode(format!("Unknown result code {}", value)))
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}
