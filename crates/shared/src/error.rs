use serde::Serialize;
use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Serialize)]
pub enum CommonError {
    #[error("validation failed")]
    Validation {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("integrity check failed")]
    Integrity {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("transport failure")]
    Transport {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("could not find resource")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("resource is already deleted")]
    AlreadyDeleted { msg: String, lookup_id: String },
    #[error("batch item {index} failed")]
    PartialBatch {
        index: usize,
        #[serde(skip)]
        #[source]
        source: Box<CommonError>,
    },
    #[error("repository error")]
    Repository {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error")]
    Unknown(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
    #[error("sqlite database error")]
    SqliteError {
        #[serde(skip)]
        #[from]
        #[source]
        source: libsql::Error,
    },
    #[error("tokio channel error")]
    TokioChannelError {
        #[serde(skip)]
        #[source]
        source: DynError,
    },
    #[error("io error")]
    IoError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::io::Error,
    },
    #[error("url parse error")]
    UrlParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: url::ParseError,
    },
    #[error("serde json error")]
    SerdeSerializationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: serde_json::Error,
    },
    #[error("var error")]
    VarError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::env::VarError,
    },
}

impl CommonError {
    /// Whether a caller may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommonError::Transport { .. })
    }

    /// Attach a batch index to an error, preserving the underlying cause.
    pub fn at_batch_index(self, index: usize) -> Self {
        CommonError::PartialBatch {
            index,
            source: Box::new(self),
        }
    }
}

impl From<reqwest::Error> for CommonError {
    fn from(e: reqwest::Error) -> Self {
        CommonError::Transport {
            msg: e.to_string(),
            source: Some(anyhow::Error::from(e)),
        }
    }
}

impl<T: Send + Sync + 'static> From<tokio::sync::mpsc::error::SendError<T>> for CommonError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CommonError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl<T: Send + Sync + 'static + std::fmt::Debug> From<tokio::sync::broadcast::error::SendError<T>>
    for CommonError
{
    fn from(e: tokio::sync::broadcast::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for CommonError {
    fn from(e: tokio::sync::broadcast::error::RecvError) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::CommonError;

    #[test]
    fn test_transport_is_retryable() {
        let err = CommonError::Transport {
            msg: "connection refused".to_string(),
            source: None,
        };
        assert!(err.is_retryable());

        let err = CommonError::Validation {
            msg: "missing field".to_string(),
            source: None,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_batch_index_attribution() {
        let err = CommonError::Integrity {
            msg: "tag mismatch".to_string(),
            source: None,
        }
        .at_batch_index(3);

        match err {
            CommonError::PartialBatch { index, source } => {
                assert_eq!(index, 3);
                assert!(matches!(*source, CommonError::Integrity { .. }));
            }
            other => panic!("expected PartialBatch, got {other:?}"),
        }
    }
}
