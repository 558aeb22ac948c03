use thiserror::Error;

use crate::action::ActionError;
use crate::analyzer::RuleSyntaxError;
use crate::answer::AnswerError;
use crate::eval::EvalError;
use crate::master::FetchError;
use crate::schema::SchemaBuildError;
use crate::session::SessionError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaBuildError),
    #[error("Rule syntax error: {0}")]
    Syntax(#[from] RuleSyntaxError),
    // expression evaluation
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("Answer error: {0}")]
    Answer(#[from] AnswerError),
    #[error("Master data error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Action error: {0}")]
    Action(#[from] ActionError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
