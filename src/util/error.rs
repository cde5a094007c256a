/// コアエラー分類とリトライ判定ユーティリティ。
use reqwest::StatusCode;
use sqlx::Error as SqlxError;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// コア全体で使うエラー種別。
///
/// API 層は `code()` を HTTP ステータスへ写像し、実行エンジンと
/// パブリッシュスケジューラは `retry_able()` で再試行可否を決める。
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// 不正なパラメータ、無効な cron 式、壊れた時間窓など。再試行しない。
    #[error("bad request: {0}")]
    BadRequest(String),
    /// 参照先エンティティが存在しない。
    #[error("not found: {0}")]
    NotFound(String),
    /// 許可されない状態遷移（重複キー、二重クレームなど）。再試行しない。
    #[error("conflict: {0}")]
    Conflict(String),
    /// ストア不達、トランスポート 5xx、タイムアウト。バックオフ付きで再試行する。
    #[error("transient failure: {0}")]
    Transient(String),
    /// 意味的な失敗（クォータ超過、審査落ちなど）。終端として記録する。
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CoreError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// 機械可読なエラーコード。
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }

    /// このエラーが再試行に値するかどうか。
    #[must_use]
    pub fn retry_able(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<SqlxError> for CoreError {
    fn from(error: SqlxError) -> Self {
        match &error {
            SqlxError::RowNotFound => Self::NotFound("row not found".to_string()),
            SqlxError::Database(db) if db.is_unique_violation() => {
                Self::Conflict(format!("unique violation: {db}"))
            }
            SqlxError::Database(db) if db.is_foreign_key_violation() => {
                Self::Conflict(format!("foreign key violation: {db}"))
            }
            SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
                Self::Transient(error.to_string())
            }
            SqlxError::Configuration(_) => Self::Permanent(error.to_string()),
            _ => Self::Transient(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            return Self::Transient(error.to_string());
        }

        if let Some(status) = error.status() {
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Self::Transient(error.to_string());
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Self::Permanent(error.to_string());
            }
            if status.is_client_error() {
                return Self::BadRequest(error.to_string());
            }
        }

        Self::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_the_only_retryable_kind() {
        assert!(CoreError::transient("pool timed out").retry_able());
        assert!(!CoreError::bad_request("bad cron").retry_able());
        assert!(!CoreError::not_found("no such config").retry_able());
        assert!(!CoreError::conflict("slot already bound").retry_able());
        assert!(!CoreError::permanent("quota exceeded").retry_able());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::bad_request("x").code(), "bad_request");
        assert_eq!(CoreError::not_found("x").code(), "not_found");
        assert_eq!(CoreError::conflict("x").code(), "conflict");
        assert_eq!(CoreError::transient("x").code(), "transient");
        assert_eq!(CoreError::permanent("x").code(), "permanent");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let error: CoreError = SqlxError::RowNotFound.into();
        assert_eq!(error.code(), "not_found");
    }
}
