use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug)]
pub enum ModelError {
    InvalidContent(String),
    InvalidScheduleTime(String),
    InvalidTransition { from: &'static str, to: &'static str },
    UnknownStatus(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidContent(msg) => write!(f, "invalid content: {msg}"),
            ModelError::InvalidScheduleTime(msg) => {
                write!(f, "invalid schedule time: {msg}")
            }
            ModelError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            ModelError::UnknownStatus(s) => write!(f, "unknown post status: {s}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
