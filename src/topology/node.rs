use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topology::metrics::{NodeBenchmark, NodeMetricsSnapshot};

pub type NodeId = Uuid;

/// Wait-jobs threshold published by the stealing resolver.
pub const ATTR_WAIT_JOBS_THRESHOLD: &str = "grid.collision.wait.jobs.threshold";
/// Active-jobs threshold published by the stealing resolver.
pub const ATTR_ACTIVE_JOBS_THRESHOLD: &str = "grid.collision.active.jobs.threshold";
/// Maximum stealing attempts published by the stealing resolver.
pub const ATTR_MAX_STEALING_ATTEMPTS: &str = "grid.collision.max.stealing.attempts";
/// Steal message expiry (ms) published by the stealing resolver.
pub const ATTR_MESSAGE_EXPIRE_TIME: &str = "grid.collision.message.expire.time";
/// Number of affinity ring replicas a node wants.
pub const ATTR_AFFINITY_REPLICAS: &str = "grid.affinity.replicas";
/// Local micro-benchmark scores.
pub const ATTR_NODE_BENCHMARK: &str = "grid.node.benchmark";

/// Value of a published node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Benchmark(NodeBenchmark),
}

impl AttributeValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_benchmark(&self) -> Option<&NodeBenchmark> {
        match self {
            AttributeValue::Benchmark(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Str(v) => write!(f, "{}", v),
            AttributeValue::Benchmark(_) => write!(f, "<benchmark>"),
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(i64::from(v))
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}

/// A cluster member as seen through discovery: identity, published
/// attributes and the last metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridNode {
    pub id: NodeId,
    pub attributes: HashMap<String, AttributeValue>,
    pub metrics: NodeMetricsSnapshot,
}

impl GridNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            attributes: HashMap::new(),
            metrics: NodeMetricsSnapshot::default(),
        }
    }

    pub fn random() -> Self {
        Self::new(Uuid::new_v4())
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_attributes(mut self, attrs: HashMap<String, AttributeValue>) -> Self {
        self.attributes.extend(attrs);
        self
    }

    pub fn with_metrics(mut self, metrics: NodeMetricsSnapshot) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

impl PartialEq for GridNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GridNode {}

/// Attribute equality filter. A node passes when it publishes every listed
/// attribute with an equal value. An empty filter passes everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeFilter(HashMap<String, AttributeValue>);

impl AttributeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, node: &GridNode) -> bool {
        self.0
            .iter()
            .all(|(name, expected)| node.attribute(name) == Some(expected))
    }
}
