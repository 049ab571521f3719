//! Command-line interface of the `framescope` listener

pub mod args;

pub use args::Args;
