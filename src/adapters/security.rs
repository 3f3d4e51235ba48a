//! Pattern Security Filter Adapter
//!
//! Implements the `SecurityFilter` port with a frozen set of signatures
//! matched case-insensitively against the percent-decoded request target
//! and the user agent. There is no rule syntax; tenants cannot change it.

use crate::domain::ports::{EdgeRequest, SecurityFilter, SecurityVerdict, TenantConfig};

#[derive(Debug, Clone, Copy)]
enum Field {
    Target,
    UserAgent,
}

#[derive(Debug, Clone, Copy)]
struct Signature {
    field: Field,
    needle: &'static str,
    reason: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature { field: Field::Target, needle: "../", reason: "Path Traversal Attempt" },
    Signature { field: Field::Target, needle: "..\\", reason: "Path Traversal Attempt" },
    Signature { field: Field::Target, needle: "/etc/passwd", reason: "Path Traversal Attempt" },
    Signature { field: Field::Target, needle: "<script", reason: "XSS Attempt" },
    Signature { field: Field::Target, needle: "javascript:", reason: "XSS Attempt" },
    Signature { field: Field::Target, needle: "onerror=", reason: "XSS Attempt" },
    Signature { field: Field::Target, needle: "union select", reason: "SQL Injection Attempt" },
    Signature { field: Field::Target, needle: "' or '1'='1", reason: "SQL Injection Attempt" },
    Signature { field: Field::Target, needle: "; drop table", reason: "SQL Injection Attempt" },
    Signature { field: Field::UserAgent, needle: "sqlmap", reason: "Malicious Scanner" },
    Signature { field: Field::UserAgent, needle: "nikto", reason: "Malicious Scanner" },
];

/// Fixed-signature request filter
#[derive(Debug, Clone, Default)]
pub struct PatternFilter;

impl PatternFilter {
    pub fn new() -> Self {
        Self
    }
}

impl SecurityFilter for PatternFilter {
    fn check(&self, request: &EdgeRequest, _tenant: &TenantConfig) -> SecurityVerdict {
        let raw = request.path_and_query();
        // `+` is a space in query strings
        let target = urlencoding::decode(&raw.replace('+', " "))
            .map(|s| s.into_owned())
            .unwrap_or(raw)
            .to_ascii_lowercase();
        let user_agent = request
            .header("user-agent")
            .unwrap_or_default()
            .to_ascii_lowercase();

        for sig in SIGNATURES {
            let hay = match sig.field {
                Field::Target => &target,
                Field::UserAgent => &user_agent,
            };
            if hay.contains(sig.needle) {
                tracing::warn!(
                    hostname = %request.hostname,
                    ip = %request.client_ip,
                    path = %request.path,
                    reason = sig.reason,
                    "Security filter blocked request"
                );
                return SecurityVerdict::block(sig.reason);
            }
        }
        SecurityVerdict::allow()
    }
}

// =============================================================================
// Tests
// =============================================================================
