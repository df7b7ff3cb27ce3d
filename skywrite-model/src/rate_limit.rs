use std::time::Duration;

/// Configuration for a single fixed-window rate limit.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RateLimitRule {
    /// Name of the rule for identification.
    pub name: String,
    /// Maximum number of requests allowed per window.
    pub limit: u32,
    /// Time window for the limit.
    pub window: Duration,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            limit: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Endpoint-class rate limits published by the network.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EndpointLimits {
    /// General XRPC API calls (record creation, session lookup).
    pub api: RateLimitRule,
    /// OAuth token endpoint calls.
    pub oauth: RateLimitRule,
}

impl Default for EndpointLimits {
    fn default() -> Self {
        Self {
            api: RateLimitRule {
                name: "api".to_string(),
                limit: 300,
                window: Duration::from_secs(300),
            },
            oauth: RateLimitRule {
                name: "oauth".to_string(),
                limit: 60,
                window: Duration::from_secs(60),
            },
        }
    }
}
