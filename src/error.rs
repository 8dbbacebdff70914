use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OriginRejection {
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("exceeded max size ({0} bytes)")]
    ExceededMaxSize(u64),

    #[error("invalid content-type {0:?}")]
    InvalidContentType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("origin rejected: {0}")]
    OriginRejected(#[from] OriginRejection),

    #[error("recent failure: {0}")]
    RecentFailure(String),

    #[error("cache io: {0}")]
    CacheIo(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    NotFound,
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::BadRequest(_) => ErrorKind::BadRequest,
            ProxyError::Forbidden(_) => ErrorKind::Forbidden,
            ProxyError::OriginUnavailable(_)
            | ProxyError::OriginRejected(_)
            | ProxyError::RecentFailure(_)
            | ProxyError::CacheIo(_) => ErrorKind::NotFound,
        }
    }

    pub fn is_origin_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::OriginUnavailable(_) | ProxyError::OriginRejected(_)
        )
    }

    pub fn bad_request(msg: impl fmt::Display) -> Self {
        ProxyError::BadRequest(msg.to_string())
    }

    pub fn forbidden(msg: impl fmt::Display) -> Self {
        ProxyError::Forbidden(msg.to_string())
    }

    pub fn unavailable(msg: impl fmt::Display) -> Self {
        ProxyError::OriginUnavailable(msg.to_string())
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
        }
    }
}
