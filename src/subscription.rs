//! Subscription data model
//!
//! A subscription is identified by its [`SubscriptionKey`]: the table it
//! listens to plus the cache tokens it keeps fresh. The key survives every
//! reconnect; channel bindings underneath it come and go.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{RealtimeError, Result};

// ============================================================================
// Cache key descriptor
// ============================================================================

/// Ordered list of cache tokens invalidated when a subscription sees a change
///
/// A single token and a one-element list are the same descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKeyDescriptor(Vec<String>);

impl CacheKeyDescriptor {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    pub fn single(token: impl Into<String>) -> Self {
        Self(vec![token.into()])
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|t| t.trim().is_empty())
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.iter().any(|t| t == token)
    }
}

impl fmt::Display for CacheKeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

impl From<&str> for CacheKeyDescriptor {
    fn from(token: &str) -> Self {
        Self::single(token)
    }
}

impl From<String> for CacheKeyDescriptor {
    fn from(token: String) -> Self {
        Self::single(token)
    }
}

impl From<Vec<String>> for CacheKeyDescriptor {
    fn from(tokens: Vec<String>) -> Self {
        Self(tokens)
    }
}

impl From<Vec<&str>> for CacheKeyDescriptor {
    fn from(tokens: Vec<&str>) -> Self {
        Self::new(tokens)
    }
}

impl<const N: usize> From<[&str; N]> for CacheKeyDescriptor {
    fn from(tokens: [&str; N]) -> Self {
        Self::new(tokens)
    }
}

// ============================================================================
// Priority
// ============================================================================

/// Subscription priority
///
/// High-priority subscriptions have a stricter staleness bound and are
/// reconnected first. Variants are ordered most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(RealtimeError::invalid(format!(
                "unknown priority '{}' (expected high, medium or low)",
                other
            ))),
        }
    }
}

// ============================================================================
// Subscription key
// ============================================================================

/// Stable identity of a subscription: `(table, cache key descriptor)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    table: String,
    descriptor: CacheKeyDescriptor,
}

impl SubscriptionKey {
    pub fn new(table: impl Into<String>, descriptor: impl Into<CacheKeyDescriptor>) -> Self {
        Self {
            table: table.into(),
            descriptor: descriptor.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn descriptor(&self) -> &CacheKeyDescriptor {
        &self.descriptor
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.table, self.descriptor)
    }
}

impl Serialize for SubscriptionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Subscribe requests
// ============================================================================

/// A request to subscribe to one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub table: String,
    pub descriptor: CacheKeyDescriptor,
    /// Row filter passed through to the transport, e.g. `job_id=eq.42`
    pub filter: Option<String>,
    pub priority: Priority,
}

impl SubscriptionSpec {
    pub fn new(table: impl Into<String>, descriptor: impl Into<CacheKeyDescriptor>) -> Self {
        Self {
            table: table.into(),
            descriptor: descriptor.into(),
            filter: None,
            priority: Priority::default(),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.table.clone(), self.descriptor.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(RealtimeError::invalid("table name is empty"));
        }
        if self.descriptor.tokens().is_empty() || self.descriptor.is_empty() {
            return Err(RealtimeError::invalid(format!(
                "cache key descriptor for table '{}' is empty",
                self.table
            )));
        }
        Ok(())
    }
}

/// Parses `table:token[,token...][:priority]`
impl FromStr for SubscriptionSpec {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let table = parts.next().unwrap_or_default();
        let tokens = parts
            .next()
            .ok_or_else(|| RealtimeError::invalid(format!("'{}' is missing a cache key", s)))?;
        let mut spec = SubscriptionSpec::new(table, tokens.split(',').collect::<Vec<_>>());
        if let Some(priority) = parts.next() {
            spec.priority = priority.parse()?;
        }
        spec.validate()?;
        Ok(spec)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Global connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Point-in-time view of one subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub key: SubscriptionKey,
    pub connected: bool,
    pub priority: Priority,
    /// Last change, presence ping or successful bind
    #[serde(skip)]
    pub last_activity: Option<Instant>,
    /// Milliseconds since `last_activity` when the snapshot was taken
    pub idle_ms: Option<u64>,
    /// Number of outstanding handles
    pub holders: usize,
    pub routes: Vec<String>,
    pub filter: Option<String>,
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Leases
// ============================================================================

/// One caller's claim on a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell holders apart in logs
        let full = self.0.to_string();
        write!(f, "lease_{}", full.split('-').next().unwrap_or(&full))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_token_equals_one_element_list() {
        let a = SubscriptionKey::new("jobs", "jobs-list");
        let b = SubscriptionKey::new("jobs", ["jobs-list"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "jobs::jobs-list");
    }

    #[test]
    fn test_descriptor_order_matters() {
        let a = SubscriptionKey::new("jobs", ["a", "b"]);
        let b = SubscriptionKey::new("jobs", ["b", "a"]);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "jobs::a,b");
    }

    #[test]
    fn test_priority_ordering_and_parse() {
        let mut priorities = vec![Priority::Low, Priority::High, Priority::Medium];
        priorities.sort();
        assert_eq!(priorities, vec![Priority::High, Priority::Medium, Priority::Low]);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_spec_validation() {
        assert!(SubscriptionSpec::new("", "x").validate().is_err());
        assert!(SubscriptionSpec::new("jobs", Vec::<String>::new())
            .validate()
            .is_err());
        assert!(SubscriptionSpec::new("jobs", " ").validate().is_err());
        assert!(SubscriptionSpec::new("jobs", "jobs-list").validate().is_ok());
    }

    #[test]
    fn test_spec_from_str() {
        let spec: SubscriptionSpec = "timesheets:timesheets,crew-hours:high".parse().unwrap();
        assert_eq!(spec.table, "timesheets");
        assert_eq!(spec.descriptor.tokens(), ["timesheets", "crew-hours"]);
        assert_eq!(spec.priority, Priority::High);

        let spec: SubscriptionSpec = "jobs:jobs-list".parse().unwrap();
        assert_eq!(spec.priority, Priority::Medium);

        assert!("jobs".parse::<SubscriptionSpec>().is_err());
        assert!("jobs:list:urgent".parse::<SubscriptionSpec>().is_err());
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key = SubscriptionKey::new("jobs", ["jobs-list", "job-7"]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"jobs::jobs-list,job-7\"");
    }

    #[test]
    fn test_lease_ids_are_unique() {
        let a = LeaseId::new();
        let b = LeaseId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("lease_"));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
