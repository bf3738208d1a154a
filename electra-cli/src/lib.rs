//! Library target for the `electra` package.
//!
//! The primary deliverable of this package is the `electra` CLI binary
//! (`src/main.rs`). This library exists so CI can run `cargo test -p electra --doc`
//! for feature/doctype validation.

#[doc(hidden)]
pub use electra_engine;
