#[derive(thiserror::Error, Debug)]
pub enum DapsError {
    #[error("request to '{0}' failed: {1}")]
    Http(String, #[source] reqwest::Error),
    #[error("unusable DAPS response from '{0}': {1}")]
    UnexpectedResponse(String, String),
    #[error("invalid dat: {0}")]
    InvalidDat(String),
    #[error("local connector credentials unusable: {0}")]
    Credentials(String),
}

impl DapsError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        DapsError::InvalidDat(reason.into())
    }
}
