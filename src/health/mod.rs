pub mod breaker;
pub mod monitor;
pub mod notifications;
