// src/message.rs
// Message encoding contract shared by publishers and consumers.

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::rabbitmq::errors::{HutchError, Result};

pub const CONTENT_APPLICATION_JSON: &str = "application/json";

pub type DataMap = Map<String, Value>;

/// Something that can be turned into bytes on the wire.
pub trait EncodableMessage {
    fn encode(&self) -> Result<Vec<u8>>;

    fn content_type(&self) -> &str;
}

/// A domain message that knows how to produce its raw form.
pub trait DeliverableMessage: Send + Sync {
    fn marshal_raw(&self) -> Result<RawMessage>;
}

/// The transport-neutral envelope: `{"meta": {...}, "data": {...}}` plus the
/// wire-level id and kind tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default, deserialize_with = "null_as_empty")]
    meta: DataMap,
    #[serde(default, deserialize_with = "null_as_empty")]
    data: DataMap,
    #[serde(skip)]
    raw: Vec<u8>,
    #[serde(skip)]
    kind: String,
    #[serde(skip)]
    id: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<DataMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<DataMap>::deserialize(deserializer)?.unwrap_or_default())
}

impl RawMessage {
    pub fn new(meta: DataMap, data: DataMap, kind: impl Into<String>) -> Self {
        RawMessage {
            meta,
            data,
            raw: Vec::new(),
            kind: kind.into(),
            id: String::new(),
        }
    }

    /// Decodes a delivery body. When the wire carries no type tag the kind
    /// falls back to `meta.kind`.
    pub fn decode(body: &[u8], id: impl Into<String>, kind: impl Into<String>) -> Result<Self> {
        let value: Value = raw_unmarshal(body)?;
        if !value.is_object() {
            return Err(object_expected("message body", &value));
        }
        let mut message: RawMessage = serde_json::from_value(value)?;
        message.raw = body.to_vec();
        message.id = id.into();

        let kind = kind.into();
        message.kind = if kind.is_empty() {
            message
                .meta
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            kind
        };
        Ok(message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta(&self) -> &DataMap {
        &self.meta
    }

    pub fn data(&self) -> &DataMap {
        &self.data
    }

    /// The undecoded body as received. Empty for outbound messages.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        json_data_unmarshal(&self.data)
    }
}

impl EncodableMessage for RawMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn content_type(&self) -> &str {
        CONTENT_APPLICATION_JSON
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub kind: String,
    pub version: String,
}

impl MessageMeta {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, version: impl Into<String>) -> Self {
        MessageMeta {
            id: id.into(),
            kind: kind.into(),
            version: version.into(),
        }
    }

    /// Meta with a freshly generated id.
    pub fn generate(kind: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), kind, version)
    }

    pub fn marshal_meta(&self) -> DataMap {
        let mut meta = DataMap::new();
        meta.insert("id".to_string(), Value::String(self.id.clone()));
        meta.insert("kind".to_string(), Value::String(self.kind.clone()));
        meta.insert("version".to_string(), Value::String(self.version.clone()));
        meta
    }
}

/// A typed message: meta plus any serializable payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<D> {
    pub meta: MessageMeta,
    pub data: D,
}

impl<D> Message<D> {
    pub fn new(meta: MessageMeta, data: D) -> Self {
        Message { meta, data }
    }
}

impl<D: Serialize + Send + Sync> DeliverableMessage for Message<D> {
    fn marshal_raw(&self) -> Result<RawMessage> {
        let data = json_data_marshal(&self.data)?;
        Ok(RawMessage::new(
            self.meta.marshal_meta(),
            data,
            self.meta.kind.clone(),
        ))
    }
}

impl DeliverableMessage for RawMessage {
    fn marshal_raw(&self) -> Result<RawMessage> {
        Ok(self.clone())
    }
}

/// Converts any serializable value into a data map, honouring serde attributes.
pub fn json_data_marshal<T: Serialize + ?Sized>(data: &T) -> Result<DataMap> {
    match serde_json::to_value(data)? {
        Value::Object(map) => Ok(map),
        other => Err(object_expected("message data", &other)),
    }
}

pub fn json_data_unmarshal<T: DeserializeOwned>(data: &DataMap) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(data.clone()))?)
}

pub fn raw_unmarshal<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

fn object_expected(what: &str, value: &Value) -> HutchError {
    HutchError::SerializationError(<serde_json::Error as serde::ser::Error>::custom(format!(
        "{} must be a JSON object, got {}",
        what,
        json_type_name(value)
    )))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
