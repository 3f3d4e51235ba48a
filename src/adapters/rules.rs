//! Built-in Edge Rules Adapter
//!
//! Implements the `EdgeHook` port for the two rule kinds the node ships
//! with: `redirect` and `deny`. Other kinds are ignored.

use async_trait::async_trait;
use hyper::header::{HeaderValue, LOCATION};
use hyper::StatusCode;

use crate::domain::ports::{EdgeHook, EdgeRequest, EdgeRule, HookOutcome, HookPhase};
use crate::proxy::response;

/// Hook executing `redirect` and `deny` rules
#[derive(Debug, Clone, Default)]
pub struct BuiltinRules;

impl BuiltinRules {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EdgeHook for BuiltinRules {
    async fn run(&self, rule: &EdgeRule, request: &EdgeRequest, _phase: HookPhase) -> HookOutcome {
        match rule {
            EdgeRule::Redirect { from, to, status } if request.path == *from => {
                let status = StatusCode::from_u16(*status)
                    .ok()
                    .filter(StatusCode::is_redirection)
                    .unwrap_or(StatusCode::FOUND);
                let Ok(location) = HeaderValue::from_str(to) else {
                    tracing::warn!(hostname = %request.hostname, %to, "Ignoring redirect rule with invalid target");
                    return HookOutcome::Continue;
                };
                let mut resp = response::empty(status);
                resp.headers_mut().insert(LOCATION, location);
                HookOutcome::Respond(resp)
            }
            EdgeRule::Deny { prefix } if request.path.starts_with(prefix.as_str()) => {
                tracing::debug!(hostname = %request.hostname, path = %request.path, "Deny rule matched");
                HookOutcome::Respond(response::text(StatusCode::FORBIDDEN, "Forbidden"))
            }
            _ => HookOutcome::Continue,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hyper::{HeaderMap, Method};
    use std::net::IpAddr;

    fn request(path: &str) -> EdgeRequest {
        EdgeRequest {
            method: Method::GET,
            hostname: "example.com".into(),
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            client_ip: IpAddr::from([127, 0, 0, 1]),
        }
    }

    #[tokio::test]
    async fn test_redirect_rule() {
        let rule = EdgeRule::Redirect {
            from: "/old".into(),
            to: "/new".into(),
            status: 301,
        };
        let hooks = BuiltinRules::new();

        let outcome = hooks.run(&rule, &request("/old"), HookPhase::Request).await;
        assert_matches!(outcome, HookOutcome::Respond(resp) => {
            assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
            assert_eq!(resp.headers()[LOCATION], "/new");
        });

        let outcome = hooks.run(&rule, &request("/other"), HookPhase::Request).await;
        assert_matches!(outcome, HookOutcome::Continue);
    }

    #[tokio::test]
    async fn test_redirect_with_non_redirect_status_uses_302() {
        let rule = EdgeRule::Redirect {
            from: "/a".into(),
            to: "https://b.test/".into(),
            status: 200,
        };
        let outcome = BuiltinRules::new().run(&rule, &request("/a"), HookPhase::Request).await;
        assert_matches!(outcome, HookOutcome::Respond(resp) => {
            assert_eq!(resp.status(), StatusCode::FOUND);
        });
    }

    #[tokio::test]
    async fn test_deny_rule() {
        let rule = EdgeRule::Deny {
            prefix: "/private".into(),
        };
        let hooks = BuiltinRules::new();
        assert_matches!(
            hooks.run(&rule, &request("/private/data"), HookPhase::Request).await,
            HookOutcome::Respond(resp) if resp.status() == StatusCode::FORBIDDEN
        );
        assert_matches!(
            hooks.run(&rule, &request("/public"), HookPhase::Request).await,
            HookOutcome::Continue
        );
    }

    #[tokio::test]
    async fn test_unsupported_rule_is_ignored() {
        let outcome = BuiltinRules::new()
            .run(&EdgeRule::Unsupported, &request("/"), HookPhase::Request)
            .await;
        assert_matches!(outcome, HookOutcome::Continue);
    }
}
