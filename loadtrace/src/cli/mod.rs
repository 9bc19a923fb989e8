//! Command-line interface of the `loadtrace` binary

mod args;

pub use args::Args;
