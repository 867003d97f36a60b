//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Network identity of an endpoint.
///
/// Two endpoints with the same address are the same endpoint; the pool
/// never holds both at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`.
    ///
    /// # Examples
    /// ```
    /// use streamgate::domain::EndpointAddress;
    ///
    /// let addr = EndpointAddress::parse("10.0.0.1:50051").unwrap();
    /// assert_eq!(addr.port, 50051);
    /// assert!(EndpointAddress::parse("no-port").is_none());
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(host, port))
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Streaming pattern of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPattern {
    /// Single request, single response
    Unary,
    /// Single request, stream of responses
    ServerStreaming,
    /// Stream of requests, single aggregated response
    ClientStreaming,
    /// Both directions streaming concurrently
    Bidirectional,
}

impl StreamPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::Bidirectional => "bidirectional",
        }
    }
}

impl std::fmt::Display for StreamPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Active,
    /// Active, but the buffer just rejected an item
    Backpressure,
    Error,
    Closed,
}

impl StreamState {
    /// Position on the lifecycle; transitions never move to a lower rank.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Active | Self::Backpressure => 1,
            Self::Error => 2,
            Self::Closed => 3,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        if self == Self::Closed {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Backpressure => "backpressure",
            Self::Error => "error",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// What a bounded buffer does with a new item when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Evict the oldest buffered item
    DropOldest,
    /// Reject the new item
    DropNewest,
    /// Suspend the producer until space frees
    #[default]
    Block,
    /// Ignore the bound
    Unbounded,
}

impl BackpressureStrategy {
    /// Parse a strategy name (`drop_oldest`, `drop_newest`, `block`, `unbounded`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "drop_oldest" => Some(Self::DropOldest),
            "drop_newest" => Some(Self::DropNewest),
            "block" => Some(Self::Block),
            "unbounded" | "buffer_unlimited" => Some(Self::Unbounded),
            _ => None,
        }
    }
}

/// Endpoint selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    /// Random choice weighted by endpoint weight
    WeightedRoundRobin,
    /// Best success rate, then lowest response time
    HealthBased,
}

impl LoadBalancingStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "least_connections" => Some(Self::LeastConnections),
            "weighted_round_robin" | "weighted" => Some(Self::WeightedRoundRobin),
            "health_based" => Some(Self::HealthBased),
            _ => None,
        }
    }
}

/// Backoff growth strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl RetryStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== EndpointAddress Tests =====

    #[test]
    fn test_address_display_and_parse() {
        let addr = EndpointAddress::new("svc.local", 8443);
        assert_eq!(addr.to_string(), "svc.local:8443");
        assert_eq!(EndpointAddress::parse("svc.local:8443"), Some(addr));
    }

    #[test]
    fn test_address_parse_invalid() {
        assert!(EndpointAddress::parse(":80").is_none());
        assert!(EndpointAddress::parse("host:notaport").is_none());
        assert!(EndpointAddress::parse("host:70000").is_none());
    }

    // ===== StreamState Tests =====

    #[test]
    fn test_state_transitions_monotonic() {
        assert!(StreamState::Idle.can_transition_to(StreamState::Active));
        assert!(StreamState::Active.can_transition_to(StreamState::Backpressure));
        assert!(StreamState::Backpressure.can_transition_to(StreamState::Active));
        assert!(StreamState::Active.can_transition_to(StreamState::Error));
        assert!(StreamState::Error.can_transition_to(StreamState::Closed));

        assert!(!StreamState::Error.can_transition_to(StreamState::Active));
        assert!(!StreamState::Active.can_transition_to(StreamState::Idle));
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in [
            StreamState::Idle,
            StreamState::Active,
            StreamState::Error,
            StreamState::Closed,
        ] {
            assert!(!StreamState::Closed.can_transition_to(next));
        }
    }

    // ===== Strategy Parsing Tests =====

    #[test]
    fn test_backpressure_strategy_parse() {
        let tests = vec![
            ("drop_oldest", BackpressureStrategy::DropOldest),
            ("drop-newest", BackpressureStrategy::DropNewest),
            ("BLOCK", BackpressureStrategy::Block),
            ("buffer_unlimited", BackpressureStrategy::Unbounded),
        ];
        for (input, expected) in tests {
            assert_eq!(BackpressureStrategy::parse(input), Some(expected), "input: {}", input);
        }
        assert!(BackpressureStrategy::parse("spill").is_none());
    }

    #[test]
    fn test_lb_strategy_parse() {
        assert_eq!(
            LoadBalancingStrategy::parse("least-connections"),
            Some(LoadBalancingStrategy::LeastConnections)
        );
        assert_eq!(
            LoadBalancingStrategy::parse("weighted"),
            Some(LoadBalancingStrategy::WeightedRoundRobin)
        );
        assert!(LoadBalancingStrategy::parse("fastest").is_none());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&LoadBalancingStrategy::HealthBased).unwrap();
        assert_eq!(json, "\"health_based\"");
        let parsed: BackpressureStrategy = serde_json::from_str("\"drop_oldest\"").unwrap();
        assert_eq!(parsed, BackpressureStrategy::DropOldest);
    }

    #[test]
    fn test_pattern_display() {
        assert_eq!(StreamPattern::Bidirectional.to_string(), "bidirectional");
        assert_eq!(StreamPattern::Unary.to_string(), "unary");
    }
}
