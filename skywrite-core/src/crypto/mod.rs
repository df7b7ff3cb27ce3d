//! Confidentiality-at-rest for token material.

mod cipher;

pub use cipher::{Secret, TokenCipher};
