use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use shared_config::AppConfig;

use crate::SyncError;

/// Identity a sync session is scoped to, typically the logged-in user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Subject {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Subject {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A change as delivered by a source, before validation and sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub record: Value,
}

impl RawChange {
    pub fn new(kind: ChangeKind, record: Value) -> Self {
        Self { kind, record }
    }

    pub fn insert(record: Value) -> Self {
        Self::new(ChangeKind::Insert, record)
    }

    pub fn update(record: Value) -> Self {
        Self::new(ChangeKind::Update, record)
    }

    pub fn delete(record: Value) -> Self {
        Self::new(ChangeKind::Delete, record)
    }
}

/// A validated backend row. Always carries a non-empty `id`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Entity {
    id: String,
    record: Map<String, Value>,
}

impl Entity {
    /// Validates a row; integer ids are normalised to their decimal string.
    pub fn from_record(record: Value) -> Result<Self, SyncError> {
        let record = match record {
            Value::Object(map) => map,
            other => {
                return Err(SyncError::MalformedEvent(format!(
                    "expected an object record, got {}",
                    type_name(&other)
                )))
            }
        };

        let id = match record.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => n.to_string(),
            Some(other) => {
                return Err(SyncError::MalformedEvent(format!(
                    "unusable id of type {}",
                    type_name(other)
                )))
            }
            None => return Err(SyncError::MalformedEvent("record has no id".to_string())),
        };

        Ok(Self { id, record })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.record.get(name)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.record.get(name).and_then(Value::as_bool)
    }

    pub fn record(&self) -> &Map<String, Value> {
        &self.record
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.record.clone())
    }
}

impl TryFrom<Value> for Entity {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Entity::from_record(value)
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.serialize(serializer)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A validated change with its arrival sequence number.
///
/// `observed_at` is assigned by the owning session in arrival order and is
/// strictly increasing within a session. Two events can share a commit
/// timestamp but never a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity: Entity,
    pub observed_at: u64,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, entity: Entity, observed_at: u64) -> Self {
        Self { kind, entity, observed_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Live,
}

/// Which table a feed mirrors and how it is scoped to a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    pub schema: String,
    pub table: String,
    pub subject_column: String,
    pub order_column: Option<String>,
    pub read_flag: String,
}

impl FeedSpec {
    pub fn new(table: &str, subject_column: &str) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.to_string(),
            subject_column: subject_column.to_string(),
            order_column: None,
            read_flag: "is_read".to_string(),
        }
    }

    pub fn ordered_by(mut self, column: &str) -> Self {
        self.order_column = Some(column.to_string());
        self
    }

    pub fn with_read_flag(mut self, column: &str) -> Self {
        self.read_flag = column.to_string();
        self
    }

    /// Notifications addressed to the subject, newest first.
    pub fn notifications() -> Self {
        Self::new("notifications", "recipient_id").ordered_by("created_at")
    }

    /// The subject's own profile row.
    pub fn profiles() -> Self {
        Self::new("profiles", "id").ordered_by("updated_at")
    }

    pub fn filter_for(&self, subject: &Subject) -> SubscriptionFilter {
        SubscriptionFilter {
            schema: self.schema.clone(),
            table: self.table.clone(),
            column: self.subject_column.clone(),
            value: subject.as_str().to_string(),
            order_column: self.order_column.clone(),
        }
    }
}

/// Equality predicate shared by the snapshot query and the change subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionFilter {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub value: String,
    pub order_column: Option<String>,
}

impl SubscriptionFilter {
    pub fn predicate(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }

    pub fn topic(&self) -> String {
        format!("realtime:{}:{}:{}", self.schema, self.table, self.predicate())
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub snapshot_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub resubscribe_initial: Duration,
    pub resubscribe_max: Duration,
    /// Sessions without a read for this long are torn down by the idle sweep.
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            snapshot_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            resubscribe_initial: Duration::from_millis(250),
            resubscribe_max: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&AppConfig> for SyncSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            snapshot_timeout: config.snapshot_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            resubscribe_initial: config.resubscribe_initial_delay(),
            resubscribe_max: config.resubscribe_max_delay(),
            idle_ttl: config.session_idle_ttl(),
            sweep_interval: config.session_sweep_interval(),
        }
    }
}
