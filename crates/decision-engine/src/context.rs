//! Request context and field resolution.

use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The immutable input to evaluation: an inbound request or security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub request_id: String,

    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub path: String,

    /// Header names are matched case-insensitively.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Query and path parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,

    #[serde(default)]
    pub body: Option<serde_json::Value>,

    #[serde(default)]
    pub client_ip: Option<String>,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    /// API the request targets, used by scope filters.
    #[serde(default)]
    pub api_id: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub data_factors: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub security_factors: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub context_factors: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Creates a context for `method path` stamped with the current time.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            parameters: HashMap::new(),
            body: None,
            client_ip: None,
            user_agent: None,
            user_id: None,
            roles: Vec::new(),
            api_id: None,
            endpoint: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            data_factors: HashMap::new(),
            security_factors: HashMap::new(),
            context_factors: HashMap::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_api(mut self, api_id: impl Into<String>) -> Self {
        self.api_id = Some(api_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_data_factor(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data_factors.insert(key.into(), value);
        self
    }

    pub fn with_security_factor(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.security_factors.insert(key.into(), value);
        self
    }

    pub fn with_context_factor(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_factors.insert(key.into(), value);
        self
    }

    /// Records a previously computed risk score so policies can test it.
    pub fn with_risk_score(self, score: f64) -> Self {
        self.with_metadata("risk_score", serde_json::json!(score))
    }

    /// Resolves a field to a value, or `None` when it is absent everywhere.
    ///
    /// Field forms:
    /// - fixed names: `method`, `path`, `client_ip`, `user_agent`, `user_id`,
    ///   `roles`, `api_id`, `endpoint`, `request_id`, `timestamp`, `body`
    /// - namespaced: `header.x`, `param.x` / `query.x`, `body.a.b`,
    ///   `metadata.x`, `data.x`, `security.x`, `context.x`
    /// - any other bare name falls back through headers, parameters,
    ///   metadata and the factor maps, in that order
    pub fn resolve_field(&self, field: &str) -> Option<Value> {
        let field = canonical_field(field.trim());

        if let Some((namespace, rest)) = field.split_once('.') {
            if let Some(value) = self.resolve_namespaced(namespace, rest) {
                return value;
            }
        }

        self.resolve_fixed(field)
            .or_else(|| self.header(field).map(Value::from))
            .or_else(|| self.parameters.get(field).map(|v| Value::from(v.as_str())))
            .or_else(|| self.metadata.get(field).map(Value::from))
            .or_else(|| self.factor(field).map(Value::from))
    }

    /// Looks up a namespaced field. The outer `None` means the namespace is
    /// unknown and the whole field should be treated as a bare name.
    fn resolve_namespaced(&self, namespace: &str, rest: &str) -> Option<Option<Value>> {
        let resolved = match namespace {
            "header" | "headers" => self.header(rest).map(Value::from),
            "param" | "params" | "parameters" | "query" => {
                self.parameters.get(rest).map(|v| Value::from(v.as_str()))
            }
            "body" => self.body.as_ref().and_then(|b| walk_json(b, rest)).map(Value::from),
            "metadata" | "meta" => self.metadata.get(rest).map(Value::from),
            "data" | "data_factors" => self.data_factors.get(rest).map(Value::from),
            "security" | "security_factors" => self.security_factors.get(rest).map(Value::from),
            "context" | "context_factors" => self.context_factors.get(rest).map(Value::from),
            _ => return None,
        };
        Some(resolved)
    }

    fn resolve_fixed(&self, field: &str) -> Option<Value> {
        let non_empty = |s: &str| (!s.is_empty()).then(|| Value::from(s));
        match field {
            "request_id" => non_empty(&self.request_id),
            "method" => non_empty(&self.method),
            "path" => non_empty(&self.path),
            "client_ip" => self.client_ip.as_deref().and_then(non_empty),
            "user_agent" => self.user_agent.as_deref().and_then(non_empty),
            "user_id" => self.user_id.as_deref().and_then(non_empty),
            "api_id" => self.api_id.as_deref().and_then(non_empty),
            "endpoint" => self.endpoint.as_deref().and_then(non_empty),
            "roles" => (!self.roles.is_empty()).then(|| Value::List(self.roles.clone())),
            "timestamp" => Some(Value::String(self.timestamp.to_rfc3339())),
            "body" => self.body.as_ref().map(|b| match b {
                serde_json::Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            }),
            _ => None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// Looks a factor up in the data, security and context maps, in order.
    pub fn factor(&self, name: &str) -> Option<&serde_json::Value> {
        self.data_factors
            .get(name)
            .or_else(|| self.security_factors.get(name))
            .or_else(|| self.context_factors.get(name))
    }

    /// Every factor across the three factor maps.
    pub fn factors(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.data_factors
            .iter()
            .chain(self.security_factors.iter())
            .chain(self.context_factors.iter())
    }

    /// Returns true if the named factor is present and active.
    pub fn factor_active(&self, name: &str) -> bool {
        self.factor(name).map(|v| Value::from(v).is_active()).unwrap_or(false)
    }

    /// Numeric value of a factor, if it has one.
    pub fn factor_number(&self, name: &str) -> Option<f64> {
        self.factor(name).and_then(|v| Value::from(v).as_f64())
    }
}

fn canonical_field(field: &str) -> &str {
    match field {
        "ip" | "clientIP" | "client_ip_address" | "source_ip" => "client_ip",
        "url" | "uri" => "path",
        "ua" | "userAgent" => "user_agent",
        "userID" | "user" => "user_id",
        "requestId" | "request_id" => "request_id",
        other => other,
    }
}

fn walk_json<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
