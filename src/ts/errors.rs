use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeSitterError {
    #[error("failed to set language {language} for parser")]
    LanguageSet { language: String },

    #[error("failed to parse source code")]
    ParseFailed,
}
