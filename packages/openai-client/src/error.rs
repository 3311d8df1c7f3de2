use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpenAIError>;

#[derive(Debug, Error)]
pub enum OpenAIError {
    /// Client could not be built
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection failed or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response, empty content or a refusal
    #[error("API error: {0}")]
    Api(String),

    /// Response body was not the JSON we expected
    #[error("Parse error: {0}")]
    Parse(String),
}
