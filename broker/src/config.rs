//! Construction surface: node specs, connection policy and declarative
//! exchange/queue topology.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::endpoint::{Endpoint, EndpointSpec};
use crate::error::BrokerError;

/// One or more broker nodes, in any of the accepted shapes: a connection
/// string (possibly comma-delimited), a partial endpoint struct, or a
/// sequence mixing both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    Url(String),
    Struct(EndpointSpec),
    List(Vec<NodeSpec>),
}

impl NodeSpec {
    fn flatten_into(&self, out: &mut Vec<Endpoint>) -> Result<(), BrokerError> {
        match self {
            NodeSpec::Url(raw) => {
                for chunk in raw.split(',') {
                    let chunk = chunk.trim();
                    if !chunk.is_empty() {
                        out.push(Endpoint::parse(chunk)?);
                    }
                }
            }
            NodeSpec::Struct(spec) => out.push(Endpoint::from_spec(spec)?),
            NodeSpec::List(items) => {
                for item in items {
                    item.flatten_into(out)?;
                }
            }
        }
        Ok(())
    }

    /// Flatten into an ordered, non-empty endpoint list. Empty input yields
    /// the single default `amqp://localhost` endpoint.
    pub fn resolve(&self) -> Result<Vec<Endpoint>, BrokerError> {
        let mut nodes = Vec::new();
        self.flatten_into(&mut nodes)?;
        if nodes.is_empty() {
            nodes.push(Endpoint::default());
        }
        Ok(nodes)
    }
}

impl From<&str> for NodeSpec {
    fn from(raw: &str) -> Self {
        NodeSpec::Url(raw.to_string())
    }
}

impl From<String> for NodeSpec {
    fn from(raw: String) -> Self {
        NodeSpec::Url(raw)
    }
}

impl From<EndpointSpec> for NodeSpec {
    fn from(spec: EndpointSpec) -> Self {
        NodeSpec::Struct(spec)
    }
}

impl From<Vec<NodeSpec>> for NodeSpec {
    fn from(items: Vec<NodeSpec>) -> Self {
        NodeSpec::List(items)
    }
}

/// Connection field of the broker configuration: either plain nodes or a
/// policy object carrying nodes plus retry tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConnectionSpec {
    Policy(PolicySpec),
    Nodes(NodeSpec),
}

/// `{ nodes, retry, frequency }` policy object. `retry` is the number of
/// additional cluster passes after the first (unset means unlimited);
/// `frequency` is the sleep between passes in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySpec {
    pub nodes: NodeSpec,
    #[serde(default)]
    pub retry: Option<u64>,
    #[serde(default)]
    pub frequency: Option<u64>,
}

/// Canonical connection policy every construction shape normalizes to.
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub nodes: Vec<Endpoint>,
    /// Additional cluster passes after the first; `None` means unlimited.
    pub retry: Option<u64>,
    /// Sleep between cluster passes.
    pub frequency: Duration,
}

impl ConnectionPolicy {
    pub fn normalize(spec: Option<&ConnectionSpec>) -> Result<Self, BrokerError> {
        match spec {
            None => Ok(Self { nodes: vec![Endpoint::default()], retry: None, frequency: Duration::ZERO }),
            Some(ConnectionSpec::Nodes(nodes)) => {
                Ok(Self { nodes: nodes.resolve()?, retry: None, frequency: Duration::ZERO })
            }
            Some(ConnectionSpec::Policy(policy)) => Ok(Self {
                nodes: policy.nodes.resolve()?,
                retry: policy.retry,
                frequency: Duration::from_millis(policy.frequency.unwrap_or(0)),
            }),
        }
    }
}

/// AMQP exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// A queue reference in a declarative binding: one name or several.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QueueRef {
    One(String),
    Many(Vec<String>),
}

impl QueueRef {
    pub fn names(&self) -> Vec<&str> {
        match self {
            QueueRef::One(name) => vec![name.as_str()],
            QueueRef::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Declarative exchange description.
///
/// The `fanout`/`topics`/`direct` extras both imply the exchange type and
/// describe the bindings the topology loader issues.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeSpec {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ExchangeKind>,
    pub durable: bool,
    pub internal: bool,
    pub auto_delete: bool,
    pub alternate_exchange: Option<String>,
    pub arguments: HashMap<String, Value>,
    pub fanout: Option<Vec<String>>,
    pub topics: Option<HashMap<String, QueueRef>>,
    pub direct: Option<HashMap<String, QueueRef>>,
}

impl Default for ExchangeSpec {
    fn default() -> Self {
        Self {
            name: None,
            kind: None,
            durable: true,
            internal: false,
            auto_delete: false,
            alternate_exchange: None,
            arguments: HashMap::new(),
            fanout: None,
            topics: None,
            direct: None,
        }
    }
}

impl ExchangeSpec {
    /// Exchange type, in precedence order: explicit, implied by `topics`,
    /// implied by `fanout`, implied by `direct`, else topic.
    pub fn effective_kind(&self) -> ExchangeKind {
        if let Some(kind) = self.kind {
            kind
        } else if self.topics.is_some() {
            ExchangeKind::Topic
        } else if self.fanout.is_some() {
            ExchangeKind::Fanout
        } else if self.direct.is_some() {
            ExchangeKind::Direct
        } else {
            ExchangeKind::Topic
        }
    }

    /// Bindings implied by the declarative extras, as `(routing key, queue)`
    /// pairs.
    pub(crate) fn bindings(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(topics) = &self.topics {
            for (routing_key, queues) in topics {
                for queue in queues.names() {
                    out.push((routing_key.clone(), queue.to_string()));
                }
            }
        } else if let Some(direct) = &self.direct {
            for (routing_key, queues) in direct {
                for queue in queues.names() {
                    out.push((routing_key.clone(), queue.to_string()));
                }
            }
        } else if let Some(fanout) = &self.fanout {
            for queue in fanout {
                out.push((String::new(), queue.clone()));
            }
        }
        out
    }

    /// Argument table handed to the declare call, with the typed extras
    /// lowered onto their AMQP `x-*` keys.
    pub(crate) fn declare_arguments(&self) -> HashMap<String, Value> {
        let mut arguments = self.arguments.clone();
        if let Some(alternate) = &self.alternate_exchange {
            arguments.insert("alternate-exchange".to_string(), Value::String(alternate.clone()));
        }
        arguments
    }
}

/// Declarative queue description.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueSpec {
    pub name: Option<String>,
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub message_ttl: Option<u64>,
    pub expires: Option<u64>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub max_length: Option<u64>,
    pub arguments: HashMap<String, Value>,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            name: None,
            exclusive: false,
            durable: true,
            auto_delete: false,
            message_ttl: None,
            expires: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            max_length: None,
            arguments: HashMap::new(),
        }
    }
}

impl QueueSpec {
    /// Argument table handed to the declare call, with the typed extras
    /// lowered onto their AMQP `x-*` keys.
    pub(crate) fn declare_arguments(&self) -> HashMap<String, Value> {
        let mut arguments = self.arguments.clone();
        if let Some(ttl) = self.message_ttl {
            arguments.insert("x-message-ttl".to_string(), Value::from(ttl));
        }
        if let Some(expires) = self.expires {
            arguments.insert("x-expires".to_string(), Value::from(expires));
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            arguments.insert("x-dead-letter-exchange".to_string(), Value::String(exchange.clone()));
        }
        if let Some(routing_key) = &self.dead_letter_routing_key {
            arguments.insert("x-dead-letter-routing-key".to_string(), Value::String(routing_key.clone()));
        }
        if let Some(max_length) = self.max_length {
            arguments.insert("x-max-length".to_string(), Value::from(max_length));
        }
        arguments
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub connection: Option<ConnectionSpec>,
    pub exchanges: HashMap<String, ExchangeSpec>,
    pub queues: HashMap<String, QueueSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_comma_delimited_string_splits_before_parsing() {
        let nodes = NodeSpec::from("amqp://foo,amqp://bar, amqp://baz").resolve().unwrap();
        let hosts: Vec<_> = nodes.iter().map(|n| n.hostname.as_str()).collect();
        assert_eq!(hosts, ["foo", "bar", "baz"]);
    }

    #[test]
    fn test_mixed_sequence_flattens_in_order() {
        let spec = NodeSpec::List(vec![
            NodeSpec::from("amqp://one,amqp://two"),
            NodeSpec::Struct(EndpointSpec { hostname: Some("three".into()), ..Default::default() }),
        ]);
        let nodes = spec.resolve().unwrap();
        let hosts: Vec<_> = nodes.iter().map(|n| n.hostname.as_str()).collect();
        assert_eq!(hosts, ["one", "two", "three"]);
    }

    #[test]
    fn test_empty_spec_defaults_to_localhost() {
        let nodes = NodeSpec::from("").resolve().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hostname, "localhost");
    }

    #[test]
    fn test_invalid_node_fails_construction() {
        assert!(NodeSpec::from("amqp://ok,ftp://nope").resolve().is_err());
    }

    #[test]
    fn test_policy_normalization() {
        let spec: ConnectionSpec =
            serde_json::from_value(json!({ "nodes": "amqp://a,amqp://b", "retry": 5, "frequency": 100 })).unwrap();
        let policy = ConnectionPolicy::normalize(Some(&spec)).unwrap();
        assert_eq!(policy.nodes.len(), 2);
        assert_eq!(policy.retry, Some(5));
        assert_eq!(policy.frequency, Duration::from_millis(100));
    }

    #[test]
    fn test_policy_defaults_to_unlimited_retry() {
        let spec: ConnectionSpec = serde_json::from_value(json!({ "nodes": "amqp://a" })).unwrap();
        let policy = ConnectionPolicy::normalize(Some(&spec)).unwrap();
        assert_eq!(policy.retry, None);
        assert_eq!(policy.frequency, Duration::ZERO);
    }

    #[test]
    fn test_plain_nodes_connection_spec() {
        let spec: ConnectionSpec = serde_json::from_value(json!("amqp://solo")).unwrap();
        let policy = ConnectionPolicy::normalize(Some(&spec)).unwrap();
        assert_eq!(policy.nodes[0].hostname, "solo");
    }

    #[test]
    fn test_exchange_kind_inference_order() {
        let explicit: ExchangeSpec =
            serde_json::from_value(json!({ "type": "headers", "fanout": ["q"] })).unwrap();
        assert_eq!(explicit.effective_kind(), ExchangeKind::Headers);

        let topics: ExchangeSpec = serde_json::from_value(json!({ "topics": { "a.#": "q" } })).unwrap();
        assert_eq!(topics.effective_kind(), ExchangeKind::Topic);

        let fanout: ExchangeSpec = serde_json::from_value(json!({ "fanout": ["q"] })).unwrap();
        assert_eq!(fanout.effective_kind(), ExchangeKind::Fanout);

        let direct: ExchangeSpec = serde_json::from_value(json!({ "direct": { "k": "q" } })).unwrap();
        assert_eq!(direct.effective_kind(), ExchangeKind::Direct);

        assert_eq!(ExchangeSpec::default().effective_kind(), ExchangeKind::Topic);
    }

    #[test]
    fn test_exchange_bindings_from_extras() {
        let spec: ExchangeSpec =
            serde_json::from_value(json!({ "topics": { "a.b": ["q1", "q2"], "c.d": "q3" } })).unwrap();
        let mut bindings = spec.bindings();
        bindings.sort();
        assert_eq!(
            bindings,
            vec![
                ("a.b".to_string(), "q1".to_string()),
                ("a.b".to_string(), "q2".to_string()),
                ("c.d".to_string(), "q3".to_string()),
            ]
        );

        let fanout: ExchangeSpec = serde_json::from_value(json!({ "fanout": ["q1", "q2"] })).unwrap();
        let bindings = fanout.bindings();
        assert_eq!(bindings, vec![(String::new(), "q1".to_string()), (String::new(), "q2".to_string())]);
    }

    #[test]
    fn test_queue_spec_lowers_typed_arguments() {
        let spec: QueueSpec = serde_json::from_value(json!({
            "messageTtl": 60000,
            "deadLetterExchange": "dlx",
            "deadLetterRoutingKey": "dead",
            "maxLength": 1000,
        }))
        .unwrap();
        let arguments = spec.declare_arguments();
        assert_eq!(arguments["x-message-ttl"], json!(60000));
        assert_eq!(arguments["x-dead-letter-exchange"], json!("dlx"));
        assert_eq!(arguments["x-dead-letter-routing-key"], json!("dead"));
        assert_eq!(arguments["x-max-length"], json!(1000));
        assert!(!arguments.contains_key("x-expires"));
    }

    #[test]
    fn test_durable_defaults_to_true() {
        let exchange: ExchangeSpec = serde_json::from_value(json!({})).unwrap();
        assert!(exchange.durable);
        let queue: QueueSpec = serde_json::from_value(json!({})).unwrap();
        assert!(queue.durable);
        let queue: QueueSpec = serde_json::from_value(json!({ "durable": false })).unwrap();
        assert!(!queue.durable);
    }

    #[test]
    fn test_broker_config_deserializes_policy_connection() {
        let config: BrokerConfig = serde_json::from_value(json!({
            "connection": { "nodes": ["amqp://a", { "hostname": "b" }], "retry": 2 },
            "exchanges": { "events": { "topics": { "user.#": "audit" } } },
            "queues": { "audit": { "deadLetterExchange": "dlx" } },
        }))
        .unwrap();
        match config.connection {
            Some(ConnectionSpec::Policy(policy)) => assert_eq!(policy.retry, Some(2)),
            other => panic!("expected policy connection, got {other:?}"),
        }
        assert!(config.exchanges.contains_key("events"));
        assert!(config.queues.contains_key("audit"));
    }
}
