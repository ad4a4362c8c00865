//! Compile-time node configuration.
//!
//! The `NodeConfig` trait fixes datastore capacities, search limits, timeouts
//! and the optional load-management policies for every node built with it.
//! Every constant has a default, so a custom configuration only overrides the
//! values it cares about:
//!
//! ```
//! use keyroute::NodeConfig;
//!
//! struct WithBackoff;
//! impl NodeConfig for WithBackoff {
//!     const USE_BACKOFF: bool = true;
//! }
//!
//! assert!(WithBackoff::USE_BACKOFF);
//! assert_eq!(WithBackoff::MAX_HTL, 10);
//! ```
//!
//! The three policies (backoff, flow tokens, throttle) are independent and
//! disabled by default.

use crate::time::Duration;

/// Configuration trait for compile-time node tuning.
///
/// Capacities must be non-zero.
pub trait NodeConfig {
    /// Capacity of each "store" tier (one per content kind).
    const STORE_SIZE: usize = 50;

    /// Capacity of each "cache" tier (one per content kind).
    const CACHE_SIZE: usize = 50;

    /// Hops-to-live granted to a fresh search, and on approaching the key.
    const MAX_HTL: u8 = 10;

    /// Concurrent search handlers before new searches are rejected as overloaded.
    const MAX_ACTIVE_SEARCHES: usize = 256;

    /// Recently seen search IDs remembered for loop detection.
    const MAX_RECENT_SEARCHES: usize = 4096;

    /// How long to wait for a next hop to accept a search.
    const ACCEPTED_TIMEOUT: Duration = Duration::from_secs(10);

    /// How long to wait for the outcome of an accepted search.
    const SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

    /// How long a data transfer may take before it is abandoned.
    const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

    /// Back off peers that reject searches as overloaded.
    const USE_BACKOFF: bool = false;
    const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_hours(3);

    /// Credit-based flow control of searches per connection.
    const USE_TOKENS: bool = false;
    const FLOW_TOKENS: u32 = 20;

    /// Rate-limit locally generated searches.
    const USE_THROTTLE: bool = false;
    const MIN_THROTTLE: Duration = Duration::from_millis(100);
    const MAX_THROTTLE: Duration = Duration::from_secs(60);
}

/// Default configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl NodeConfig for DefaultConfig {}

/// Configuration with small datastores, for exercising eviction.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl NodeConfig for SmallConfig {
    const STORE_SIZE: usize = 10;
    const CACHE_SIZE: usize = 10;
    const MAX_ACTIVE_SEARCHES: usize = 16;
    const MAX_RECENT_SEARCHES: usize = 256;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        assert_eq!(DefaultConfig::STORE_SIZE, 50);
        assert_eq!(DefaultConfig::CACHE_SIZE, 50);
        assert_eq!(DefaultConfig::MAX_HTL, 10);
        assert_eq!(DefaultConfig::ACCEPTED_TIMEOUT, Duration::from_secs(10));
        assert!(!DefaultConfig::USE_BACKOFF);
        assert!(!DefaultConfig::USE_TOKENS);
        assert!(!DefaultConfig::USE_THROTTLE);
    }

    #[test]
    fn test_small_config_smaller_than_default() {
        assert!(SmallConfig::STORE_SIZE < DefaultConfig::STORE_SIZE);
        assert!(SmallConfig::CACHE_SIZE < DefaultConfig::CACHE_SIZE);
        assert!(SmallConfig::MAX_ACTIVE_SEARCHES < DefaultConfig::MAX_ACTIVE_SEARCHES);
        assert!(SmallConfig::MAX_RECENT_SEARCHES < DefaultConfig::MAX_RECENT_SEARCHES);
    }

    #[test]
    fn test_backoff_bounds_ordered() {
        assert!(DefaultConfig::INITIAL_BACKOFF < DefaultConfig::MAX_BACKOFF);
        assert!(DefaultConfig::MIN_THROTTLE < DefaultConfig::MAX_THROTTLE);
        assert!(DefaultConfig::ACCEPTED_TIMEOUT < DefaultConfig::SEARCH_TIMEOUT);
    }
}
