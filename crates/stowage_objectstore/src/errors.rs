//! ObjectStore errors

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

pub type Result<T> = std::result::Result<T, Error>;

/// General purpose [`super::ObjectStore`] error handling.
///
/// Backend calls fail in one of three ways that callers need to tell apart: the request never
/// got a usable answer ([`Error::Transport`]), the backend answered with a non-success status
/// ([`Error::Backend`]), or the backend answered successfully but left out something the
/// protocol requires ([`Error::ProtocolViolation`], [`Error::MissingETag`],
/// [`Error::MissingUploadId`]).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend error: {status} {code}: {message}")]
    Backend {
        status: u16,
        code: String,
        message: String,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("upload part response for part {0} is missing an etag")]
    MissingETag(i32),

    #[error("failed to initiate multipart upload: missing upload id")]
    MissingUploadId,

    #[error("http error")]
    HTTPError(#[from] http::Error),

    #[error("{0}")]
    ByteStreamError(#[from] aws_sdk_s3::primitives::ByteStreamError),

    #[error("aws sdk request build error")]
    AWSSDKBuildError(#[from] aws_sdk_s3::error::BuildError),

    #[error("aws sdk presigning config error")]
    AWSSDKPresigningConfigError(#[from] aws_sdk_s3::presigning::PresigningConfigError),

    #[error("aws sdk credentials error")]
    AWSSDKCredentialsError(#[from] aws_credential_types::provider::error::CredentialsError),

    #[error("key error: {0}")]
    KeyError(#[from] KeyError),
}

impl Error {
    pub(crate) fn backend(status: u16, code: &str, message: impl Into<String>) -> Self {
        Error::Backend {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status of a [`Error::Backend`] error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::MissingETag(_) | Error::MissingUploadId
        )
    }
}

impl<E> From<SdkError<E, HttpResponse>> for Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    fn from(e: SdkError<E, HttpResponse>) -> Error {
        match e {
            SdkError::ServiceError(se) => {
                let status = se.raw().status().as_u16();
                let err = se.err();
                Error::Backend {
                    status,
                    code: err.code().unwrap_or("Unknown").to_string(),
                    message: err.message().unwrap_or_default().to_string(),
                }
            }
            e @ SdkError::ResponseError(_) => {
                Error::ProtocolViolation(format!("{}", DisplayErrorContext(&e)))
            }
            e => Error::Transport(format!("{}", DisplayErrorContext(&e))),
        }
    }
}

/// Error type used when parsing [`super::Key`] from [`std::path::PathBuf`].
#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("empty key not allowed")]
    Empty,

    #[error("prefix not allowed")]
    PrefixNotAllowed,

    #[error("root dir not allowed")]
    RootDirNotAllowed,

    #[error("current dir (`.`) not allowed")]
    CurDirNotAllowed,

    #[error("parent dir (`..`) not allowed")]
    ParentDirNotAllowed,

    #[error("path components must be valid unicode")]
    PathComponentsMustBeValidUnicode,

    #[error("path components must match regex: {0}")]
    PathComponentsMustMatchRegex(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let not_found = Error::backend(404, "NoSuchKey", "gone");
        assert!(not_found.is_not_found());
        assert_eq!(not_found.status(), Some(404));
        assert!(!not_found.is_transport());

        let denied = Error::backend(403, "AccessDenied", "");
        assert!(!denied.is_not_found());

        assert!(Error::MissingETag(3).is_protocol_violation());
        assert!(Error::Transport(String::from("connection reset")).is_transport());
        assert_eq!(Error::Transport(String::from("x")).status(), None);
    }
}
