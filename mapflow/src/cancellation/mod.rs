//! Cooperative cancellation of running jobs.

mod token;

pub use token::CancellationToken;
