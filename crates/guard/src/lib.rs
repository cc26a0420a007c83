pub mod breaker;
pub mod ratelimit;

pub use breaker::{
    with_circuit_breaker, BreakerConfig, BreakerError, BreakerRegistry, BreakerState,
    CircuitBreaker,
};
pub use ratelimit::{RateLimitConfig, RateLimitDecision, RateLimiter};
