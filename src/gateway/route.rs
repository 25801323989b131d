//! Route table: method sets, path patterns, and specificity-based matching
//!
//! Path patterns are segment lists of literals and `{name}` placeholders.
//! When several enabled routes match a request, the highest specificity
//! score wins (literal segment = 2, parameter = 1); ties go to the earliest
//! registration.

use crate::config::RouteConfig;
use crate::error::ConfigError;
use crate::gateway::balancer::UpstreamSet;
use crate::gateway::rate_limit::TokenBucketLimiter;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Parsed path pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parses a pattern like `/api/orders/{id}`
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` for patterns not starting with `/` or with
    /// malformed placeholders.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if !pattern.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "route.path".to_string(),
                reason: format!("pattern '{pattern}' must start with '/'"),
            });
        }
        let mut segments = Vec::new();
        for part in pattern.split('/').skip(1) {
            if part.is_empty() {
                continue;
            }
            if let Some(name) = part.strip_prefix('{') {
                let name = name.strip_suffix('}').ok_or_else(|| ConfigError::Invalid {
                    field: "route.path".to_string(),
                    reason: format!("malformed placeholder in '{pattern}'"),
                })?;
                if name.is_empty() {
                    return Err(ConfigError::Invalid {
                        field: "route.path".to_string(),
                        reason: format!("empty placeholder in '{pattern}'"),
                    });
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The original pattern text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Specificity score: literal segments count 2, parameters 1
    #[must_use]
    pub fn specificity(&self) -> u32 {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(_) => 2,
                Segment::Param(_) => 1,
            })
            .sum()
    }

    /// Matches a concrete path, extracting parameter values
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').skip(1).filter(|p| !p.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

/// One gateway route with its balancer and rate limiter
pub struct Route {
    /// Route identity
    pub id: Uuid,
    /// Source configuration
    pub config: RouteConfig,
    /// Parsed path pattern
    pub pattern: PathPattern,
    /// Upstream set with the configured balancing strategy
    pub upstreams: UpstreamSet,
    /// Per-client token bucket, when rate limiting is configured
    pub limiter: Option<TokenBucketLimiter>,
    /// Registration index for tie-breaking
    pub registration: usize,
}

impl Route {
    /// Whether the route accepts the HTTP method
    #[must_use]
    pub fn allows_method(&self, method: &str) -> bool {
        self.config
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Ordered collection of routes with specificity-based lookup
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Builds the table from configuration, in registration order
    ///
    /// # Errors
    ///
    /// The first route validation or pattern parse failure.
    pub fn from_config(configs: &[RouteConfig]) -> Result<Self, ConfigError> {
        let mut routes = Vec::with_capacity(configs.len());
        for (registration, config) in configs.iter().enumerate() {
            config.validate()?;
            let pattern = PathPattern::parse(&config.path)?;
            let upstreams = UpstreamSet::new(&config.upstreams, config.strategy);
            let limiter = config.rate_limit.map(TokenBucketLimiter::new);
            routes.push(Arc::new(Route {
                id: Uuid::new_v4(),
                config: config.clone(),
                pattern,
                upstreams,
                limiter,
                registration,
            }));
        }
        Ok(Self { routes })
    }

    /// All routes in registration order
    #[must_use]
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Finds the best enabled route for a request.
    ///
    /// Highest specificity wins; ties go to the earliest registration.
    #[must_use]
    pub fn match_request(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<Route>, HashMap<String, String>)> {
        let mut best: Option<(u32, usize, Arc<Route>, HashMap<String, String>)> = None;
        for route in &self.routes {
            if !route.config.enabled || !route.allows_method(method) {
                continue;
            }
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };
            let score = route.pattern.specificity();
            let better = match &best {
                None => true,
                Some((best_score, best_reg, _, _)) => {
                    score > *best_score || (score == *best_score && route.registration < *best_reg)
                }
            };
            if better {
                best = Some((score, route.registration, route.clone(), params));
            }
        }
        best.map(|(_, _, route, params)| (route, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BalanceStrategy, RouteHeaders, UpstreamConfig};

    fn route_config(path: &str, methods: &[&str]) -> RouteConfig {
        RouteConfig {
            methods: methods.iter().map(ToString::to_string).collect(),
            path: path.to_string(),
            upstreams: vec![UpstreamConfig {
                url: "http://127.0.0.1:9000".to_string(),
                weight: 1,
            }],
            strategy: BalanceStrategy::RoundRobin,
            rate_limit: None,
            timeout: None,
            required_roles: vec![],
            enabled: true,
            headers: RouteHeaders::default(),
        }
    }

    #[test]
    fn pattern_extracts_parameters() {
        let pattern = PathPattern::parse("/api/orders/{id}/items/{item}").unwrap();
        let params = pattern.matches("/api/orders/42/items/7").unwrap();
        assert_eq!(params["id"], "42");
        assert_eq!(params["item"], "7");
        assert!(pattern.matches("/api/orders/42").is_none());
        assert!(pattern.matches("/api/users/42/items/7").is_none());
    }

    #[test]
    fn specificity_counts_literals_double() {
        assert_eq!(PathPattern::parse("/api/orders").unwrap().specificity(), 4);
        assert_eq!(
            PathPattern::parse("/api/{resource}").unwrap().specificity(),
            3
        );
    }

    #[test]
    fn malformed_placeholder_is_rejected() {
        assert!(PathPattern::parse("/api/{id").is_err());
        assert!(PathPattern::parse("/api/{}").is_err());
        assert!(PathPattern::parse("api/x").is_err());
    }

    #[test]
    fn most_specific_route_wins() {
        let table = RouteTable::from_config(&[
            route_config("/api/{resource}", &["GET"]),
            route_config("/api/orders", &["GET"]),
        ])
        .unwrap();

        let (route, _) = table.match_request("GET", "/api/orders").unwrap();
        assert_eq!(route.pattern.as_str(), "/api/orders");

        let (route, params) = table.match_request("GET", "/api/users").unwrap();
        assert_eq!(route.pattern.as_str(), "/api/{resource}");
        assert_eq!(params["resource"], "users");
    }

    #[test]
    fn specificity_tie_goes_to_earliest_registration() {
        let table = RouteTable::from_config(&[
            route_config("/api/{a}", &["GET"]),
            route_config("/api/{b}", &["GET"]),
        ])
        .unwrap();
        let (route, _) = table.match_request("GET", "/api/x").unwrap();
        assert_eq!(route.registration, 0);
    }

    #[test]
    fn method_and_enabled_are_respected() {
        let mut disabled = route_config("/api/orders", &["GET"]);
        disabled.enabled = false;
        let table =
            RouteTable::from_config(&[disabled, route_config("/api/orders", &["POST"])]).unwrap();

        assert!(table.match_request("GET", "/api/orders").is_none());
        assert!(table.match_request("POST", "/api/orders").is_some());
    }
}
