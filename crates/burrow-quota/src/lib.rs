//! Rate and stream quota accounting
//!
//! Every admission decision in the server funnels through this crate: the
//! token buckets answer "is this caller sending too fast", the limiter
//! tracks how many streams each agent and domain currently holds.

pub mod bucket;
pub mod limiter;

pub use bucket::TokenBucket;
pub use limiter::{AgentLimitSnapshot, DomainLimitSnapshot, QuotaError, QuotaLimiter};
