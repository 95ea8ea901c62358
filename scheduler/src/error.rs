//! Low-level fetch failures and their translation into client-facing fetch errors.

use serde::{Deserialize, Serialize};
use std::{error::Error as StdError, fmt, sync::Arc};
use tracing::error;

/// Reason a single low-level fetch attempt failed.
///
/// Codes arrive as numbers from the dispatch layer. Numbers outside of the known set are kept as
/// [Code::Unknown] so that they can be reported rather than dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    DecodeFailed,
    DataNotFoundInStore,
    InternalError,
    DataNotFound,
    RouteNotFound,
    RejectedOverload,
    TransferFailed,
    VerifyFailed,
    Cancelled,
    RecentlyFailed,
    Unknown(u32),
}

/// How the scheduler reacts to a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    /// Retried after a cooldown, up to the retry limit.
    Transient,
    /// Reported to the parent immediately.
    Terminal,
    /// Logged as an error and reported to the parent immediately.
    Internal,
}

impl Code {
    /// Returns the wire number of the code.
    pub fn number(&self) -> u32 {
        match self {
            Code::DecodeFailed => 1,
            Code::DataNotFoundInStore => 2,
            Code::InternalError => 3,
            Code::DataNotFound => 4,
            Code::RouteNotFound => 5,
            Code::RejectedOverload => 6,
            Code::TransferFailed => 7,
            Code::VerifyFailed => 8,
            Code::Cancelled => 9,
            Code::RecentlyFailed => 10,
            Code::Unknown(n) => *n,
        }
    }

    /// Returns how a failure with this code is handled.
    pub fn class(&self) -> Class {
        match self {
            Code::RecentlyFailed
            | Code::RejectedOverload
            | Code::RouteNotFound
            | Code::TransferFailed => Class::Transient,
            Code::DataNotFound
            | Code::DataNotFoundInStore
            | Code::DecodeFailed
            | Code::VerifyFailed
            | Code::Cancelled => Class::Terminal,
            Code::InternalError | Code::Unknown(_) => Class::Internal,
        }
    }

    /// Returns a short label for the code, used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Code::DecodeFailed => "decode_failed",
            Code::DataNotFoundInStore => "data_not_found_in_store",
            Code::InternalError => "internal_error",
            Code::DataNotFound => "data_not_found",
            Code::RouteNotFound => "route_not_found",
            Code::RejectedOverload => "rejected_overload",
            Code::TransferFailed => "transfer_failed",
            Code::VerifyFailed => "verify_failed",
            Code::Cancelled => "cancelled",
            Code::RecentlyFailed => "recently_failed",
            Code::Unknown(_) => "unknown",
        }
    }
}

impl From<u32> for Code {
    fn from(number: u32) -> Self {
        match number {
            1 => Code::DecodeFailed,
            2 => Code::DataNotFoundInStore,
            3 => Code::InternalError,
            4 => Code::DataNotFound,
            5 => Code::RouteNotFound,
            6 => Code::RejectedOverload,
            7 => Code::TransferFailed,
            8 => Code::VerifyFailed,
            9 => Code::Cancelled,
            10 => Code::RecentlyFailed,
            n => Code::Unknown(n),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Unknown(n) => write!(f, "unknown ({n})"),
            code => f.write_str(code.label()),
        }
    }
}

/// A failed low-level fetch attempt.
#[derive(Clone, Debug)]
pub struct LowLevelGetError {
    code: Code,
    message: Option<String>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl LowLevelGetError {
    /// Create an error with no message.
    pub fn new(code: impl Into<Code>) -> Self {
        Self {
            code: code.into(),
            message: None,
            source: None,
        }
    }

    /// Create an error with a message.
    pub fn with_message(code: impl Into<Code>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
            source: None,
        }
    }

    /// Create an [Code::InternalError] caused by `source`.
    pub fn internal(source: Arc<dyn StdError + Send + Sync>) -> Self {
        Self {
            code: Code::InternalError,
            message: Some(source.to_string()),
            source: Some(source),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for LowLevelGetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl StdError for LowLevelGetError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

/// Kind of a client-facing fetch failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchKind {
    DataNotFound,
    RecentlyFailed,
    BlockDecodeError,
    InternalError,
    RejectedOverload,
    RouteNotFound,
    TransferFailed,
    Cancelled,
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchKind::DataNotFound => "data not found",
            FetchKind::RecentlyFailed => "recently failed",
            FetchKind::BlockDecodeError => "block decode error",
            FetchKind::InternalError => "internal error",
            FetchKind::RejectedOverload => "rejected overload",
            FetchKind::RouteNotFound => "route not found",
            FetchKind::TransferFailed => "transfer failed",
            FetchKind::Cancelled => "cancelled",
        })
    }
}

/// A client-facing fetch failure, reported to a [crate::Requester].
#[derive(Clone, Debug)]
pub struct FetchError {
    kind: FetchKind,
    detail: Option<String>,
    cause: Option<LowLevelGetError>,
}

impl FetchError {
    pub fn new(kind: FetchKind) -> Self {
        Self {
            kind,
            detail: None,
            cause: None,
        }
    }

    pub fn with_detail(kind: FetchKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
            cause: None,
        }
    }

    fn caused_by(mut self, cause: &LowLevelGetError) -> Self {
        self.cause = Some(cause.clone());
        self
    }

    pub fn kind(&self) -> FetchKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the low-level failure this error was translated from, if any.
    pub fn cause(&self) -> Option<&LowLevelGetError> {
        self.cause.as_ref()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Translate a low-level failure into the fetch error reported to the parent.
///
/// Every code maps to exactly one kind. Unknown codes become [FetchKind::InternalError] with the
/// code recorded in the detail, and are logged.
pub fn translate(error: &LowLevelGetError) -> FetchError {
    let kind = match error.code() {
        Code::DataNotFound | Code::DataNotFoundInStore => FetchKind::DataNotFound,
        Code::RecentlyFailed => FetchKind::RecentlyFailed,
        Code::DecodeFailed | Code::VerifyFailed => FetchKind::BlockDecodeError,
        Code::InternalError => FetchKind::InternalError,
        Code::RejectedOverload => FetchKind::RejectedOverload,
        Code::RouteNotFound => FetchKind::RouteNotFound,
        Code::TransferFailed => FetchKind::TransferFailed,
        Code::Cancelled => FetchKind::Cancelled,
        Code::Unknown(n) => {
            error!(code = n, "unknown low-level error code");
            return FetchError::with_detail(
                FetchKind::InternalError,
                format!("Unknown error code: {n}"),
            )
            .caused_by(error);
        }
    };
    FetchError::new(kind).caused_by(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Code::DataNotFound, FetchKind::DataNotFound; "data not found")]
    #[test_case(Code::DataNotFoundInStore, FetchKind::DataNotFound; "data not found in store")]
    #[test_case(Code::RecentlyFailed, FetchKind::RecentlyFailed; "recently failed")]
    #[test_case(Code::DecodeFailed, FetchKind::BlockDecodeError; "decode failed")]
    #[test_case(Code::VerifyFailed, FetchKind::BlockDecodeError; "verify failed")]
    #[test_case(Code::InternalError, FetchKind::InternalError; "internal error")]
    #[test_case(Code::RejectedOverload, FetchKind::RejectedOverload; "rejected overload")]
    #[test_case(Code::RouteNotFound, FetchKind::RouteNotFound; "route not found")]
    #[test_case(Code::TransferFailed, FetchKind::TransferFailed; "transfer failed")]
    #[test_case(Code::Cancelled, FetchKind::Cancelled; "cancelled")]
    fn test_translate(code: Code, kind: FetchKind) {
        let low = LowLevelGetError::with_message(code, "attempt failed");
        let translated = translate(&low);
        assert_eq!(translated.kind(), kind);
        assert!(translated.detail().is_none());
        assert_eq!(translated.cause().unwrap().code(), code);

        // Deterministic
        assert_eq!(translate(&low).kind(), kind);

        // Numbers round trip
        assert_eq!(Code::from(code.number()), code);
    }

    #[test]
    fn test_translate_unknown() {
        for number in [0, 11, 42, u32::MAX] {
            let code = Code::from(number);
            assert_eq!(code, Code::Unknown(number));
            assert_eq!(code.class(), Class::Internal);

            let translated = translate(&LowLevelGetError::new(number));
            assert_eq!(translated.kind(), FetchKind::InternalError);
            assert_eq!(
                translated.detail(),
                Some(format!("Unknown error code: {number}").as_str())
            );
        }
    }

    #[test]
    fn test_classes() {
        let transient = [
            Code::RecentlyFailed,
            Code::RejectedOverload,
            Code::RouteNotFound,
            Code::TransferFailed,
        ];
        for code in transient {
            assert_eq!(code.class(), Class::Transient);
        }
        let terminal = [
            Code::DataNotFound,
            Code::DataNotFoundInStore,
            Code::DecodeFailed,
            Code::VerifyFailed,
            Code::Cancelled,
        ];
        for code in terminal {
            assert_eq!(code.class(), Class::Terminal);
        }
        assert_eq!(Code::InternalError.class(), Class::Internal);
    }

    #[test]
    fn test_cause_chain() {
        #[derive(Debug)]
        struct Broken;
        impl fmt::Display for Broken {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "broken")
            }
        }
        impl StdError for Broken {}

        let low = LowLevelGetError::internal(Arc::new(Broken));
        assert_eq!(low.to_string(), "internal_error: broken");
        let translated = translate(&low);
        assert_eq!(translated.to_string(), "internal error");

        // FetchError -> LowLevelGetError -> Broken
        let source = translated.source().unwrap();
        assert_eq!(source.to_string(), "internal_error: broken");
        assert_eq!(source.source().unwrap().to_string(), "broken");
    }
}
