// src/transport/mod.rs

//! Concrete [`crate::core::transport::Transport`] implementations. The
//! engine core depends only on the trait; this module supplies the one real
//! implementation the binary ships with.

pub mod matrix_http;

pub use matrix_http::MatrixHttpTransport;
