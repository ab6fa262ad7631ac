//! Store-wide conventions.
//!
//! A [`Conventions`] value is attached to a store when it is created and
//! shared read-only with every session and request executor. It carries the
//! limits and toggles the driver consults before and during each request.

use std::time::Duration;

/// Tunable limits and behavior toggles for a document store.
///
/// All fields have defaults suitable for a single-node development server;
/// production callers usually only adjust `timeout` and
/// `use_optimistic_concurrency`.
///
/// # Example
///
/// ```
/// use vellum_common::Conventions;
/// use std::time::Duration;
///
/// let conventions = Conventions::default()
///     .with_timeout(Duration::from_secs(10))
///     .with_optimistic_concurrency(true);
/// assert_eq!(conventions.timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct Conventions {
    /// Number of requests a single session may issue before `save_changes`
    /// is refused.
    pub max_number_of_requests_per_session: u32,
    /// Sizing hint for batched document loads.
    pub max_ids_to_catch: usize,
    /// Wall-clock timeout applied to every request.
    pub timeout: Duration,
    /// When true, write commands carry the last known change-vector and the
    /// server rejects on mismatch.
    pub use_optimistic_concurrency: bool,
    /// GET requests whose URL exceeds this many characters are refused
    /// locally, without touching the network.
    pub max_length_of_query_using_get_url: usize,
    /// Separator joining an id prefix and its identifier parts.
    pub identity_parts_separator: String,
    /// When true, requests omit the `Topology-Etag` header and
    /// `Refresh-Topology` response headers are ignored.
    pub disable_topology_update: bool,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            max_number_of_requests_per_session: 30,
            max_ids_to_catch: 32,
            timeout: Duration::from_secs(30),
            use_optimistic_concurrency: false,
            max_length_of_query_using_get_url: 1536,
            identity_parts_separator: "/".to_string(),
            disable_topology_update: false,
        }
    }
}

impl Conventions {
    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-session request budget.
    pub fn with_max_requests_per_session(mut self, max: u32) -> Self {
        self.max_number_of_requests_per_session = max;
        self
    }

    /// Enables or disables optimistic concurrency for writes.
    pub fn with_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.use_optimistic_concurrency = enabled;
        self
    }

    /// Sets the local GET URL length guard.
    pub fn with_max_get_url_length(mut self, chars: usize) -> Self {
        self.max_length_of_query_using_get_url = chars;
        self
    }

    /// Sets the identity parts separator.
    pub fn with_identity_parts_separator(mut self, separator: impl Into<String>) -> Self {
        self.identity_parts_separator = separator.into();
        self
    }

    /// Disables topology etag exchange entirely.
    pub fn with_topology_updates_disabled(mut self, disabled: bool) -> Self {
        self.disable_topology_update = disabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conventions_defaults() {
        let c = Conventions::default();
        assert_eq!(c.max_number_of_requests_per_session, 30);
        assert_eq!(c.max_ids_to_catch, 32);
        assert_eq!(c.timeout, Duration::from_secs(30));
        assert!(!c.use_optimistic_concurrency);
        assert_eq!(c.max_length_of_query_using_get_url, 1536);
        assert_eq!(c.identity_parts_separator, "/");
        assert!(!c.disable_topology_update);
    }

    #[test]
    fn test_conventions_builders() {
        let c = Conventions::default()
            .with_timeout(Duration::from_millis(250))
            .with_max_requests_per_session(5)
            .with_optimistic_concurrency(true)
            .with_max_get_url_length(64)
            .with_identity_parts_separator("|")
            .with_topology_updates_disabled(true);

        assert_eq!(c.timeout, Duration::from_millis(250));
        assert_eq!(c.max_number_of_requests_per_session, 5);
        assert!(c.use_optimistic_concurrency);
        assert_eq!(c.max_length_of_query_using_get_url, 64);
        assert_eq!(c.identity_parts_separator, "|");
        assert!(c.disable_topology_update);
    }
}
