use thiserror::Error;

pub type TipvaultResult<T> = Result<T, TipvaultError>;

#[derive(Debug, Error)]
pub enum TipvaultError {
    /// Wrong password or wrong recovery key. Carries no detail so that both
    /// failures look the same from the outside.
    #[error("authentication failed")]
    Authentication,

    #[error("the new password must differ from the current one")]
    PasswordReuse,

    /// An authenticated wrap failed to open although the caller proved
    /// knowledge of the unwrapping secret. Data at rest may be damaged.
    #[error("corrupt key material: {0}")]
    CorruptKey(String),

    /// The operation needs an unwrapped private key that no live session holds.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TipvaultError {
    /// Expected outcomes that the calling layer maps to a 4xx-style response.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            TipvaultError::Authentication
                | TipvaultError::PasswordReuse
                | TipvaultError::InputValidation(_)
        )
    }
}
