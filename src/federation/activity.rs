//! Activity model
//!
//! Closed, typed representation of the activities and objects this server
//! understands. Untrusted JSON is parsed into these types (failing closed on
//! anything outside the supported set) and serialized back out for delivery
//! and collections. No I/O happens here.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::error::AppError;

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
/// The special "everyone" collection
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// ActivityPub Activity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Follow,
    Undo,
    Create,
    Update,
    Delete,
    Accept,
    Reject,
    Like,
    Announce,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Undo" => Some(Self::Undo),
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Like => "Like",
            Self::Announce => "Announce",
        }
    }
}

/// Content object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Note,
    Article,
    JobPosting,
}

impl ObjectType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Note" => Some(Self::Note),
            "Article" => Some(Self::Article),
            "JobPosting" => Some(Self::JobPosting),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "Note",
            Self::Article => "Article",
            Self::JobPosting => "JobPosting",
        }
    }
}

/// Either a bare IRI or the embedded thing itself
#[derive(Debug, Clone, PartialEq)]
pub enum Reference<T> {
    Iri(String),
    Embedded(Box<T>),
}

/// Anything with a canonical identifier
pub trait Identified {
    fn iri(&self) -> &str;
}

impl<T: Identified> Reference<T> {
    /// IRI of the referenced thing, embedded or not
    pub fn iri(&self) -> &str {
        match self {
            Reference::Iri(iri) => iri,
            Reference::Embedded(inner) => inner.iri(),
        }
    }

    pub fn embedded(&self) -> Option<&T> {
        match self {
            Reference::Iri(_) => None,
            Reference::Embedded(inner) => Some(inner),
        }
    }
}

/// A Note, Article or JobPosting
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub id: String,
    pub kind: ObjectType,
    pub attributed_to: String,
    /// HTML body (job description for a JobPosting)
    pub content: String,
    pub published: DateTime<Utc>,
    /// Title of an Article or JobPosting
    pub name: Option<String>,
    pub summary: Option<String>,
    pub in_reply_to: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    // JobPosting details
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub salary_range: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

impl Identified for Object {
    fn iri(&self) -> &str {
        &self.id
    }
}

/// Placeholder left behind by a Delete
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub id: String,
    pub former_type: Option<String>,
    pub deleted: Option<DateTime<Utc>>,
}

impl Identified for Tombstone {
    fn iri(&self) -> &str {
        &self.id
    }
}

/// Type-specific payload of an activity
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityBody {
    /// `object` is the followed actor
    Follow { object: String },
    Undo { object: Reference<Activity> },
    Create { object: Object },
    Update { object: Object },
    Delete { object: Reference<Tombstone> },
    Accept { object: Reference<Activity> },
    Reject { object: Reference<Activity> },
    Like { object: Reference<Object> },
    Announce { object: Reference<Object> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub id: String,
    pub actor: String,
    pub published: Option<DateTime<Utc>>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub body: ActivityBody,
}

impl Identified for Activity {
    fn iri(&self) -> &str {
        &self.id
    }
}

impl Activity {
    /// Parse an activity from raw request bytes
    pub fn parse(raw: &[u8]) -> Result<Self, AppError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Parse an activity from a JSON value
    pub fn from_value(value: &Value) -> Result<Self, AppError> {
        let map = value
            .as_object()
            .ok_or_else(|| AppError::Validation("Activity must be a JSON object".to_string()))?;

        let type_name = required_str(map, "type")?;
        let kind = ActivityType::from_str(type_name)
            .ok_or_else(|| AppError::UnsupportedType(type_name.to_string()))?;

        let id = required_iri(map, "id")?;
        let actor = required_id(map, "actor")?;
        let published = optional_timestamp(map, "published")?;
        let to = audience(map, "to")?;
        let cc = audience(map, "cc")?;

        let object = map
            .get("object")
            .ok_or_else(|| AppError::Validation(format!("{} is missing `object`", type_name)))?;

        let body = match kind {
            ActivityType::Follow => ActivityBody::Follow {
                object: id_of(object, "object")?,
            },
            ActivityType::Undo => ActivityBody::Undo {
                object: activity_reference(object)?,
            },
            ActivityType::Accept => ActivityBody::Accept {
                object: activity_reference(object)?,
            },
            ActivityType::Reject => ActivityBody::Reject {
                object: activity_reference(object)?,
            },
            ActivityType::Create => ActivityBody::Create {
                object: Object::from_value(object)?,
            },
            ActivityType::Update => ActivityBody::Update {
                object: Object::from_value(object)?,
            },
            ActivityType::Delete => ActivityBody::Delete {
                object: tombstone_reference(object)?,
            },
            ActivityType::Like => ActivityBody::Like {
                object: object_reference(object)?,
            },
            ActivityType::Announce => ActivityBody::Announce {
                object: object_reference(object)?,
            },
        };

        Ok(Self {
            id,
            actor,
            published,
            to,
            cc,
            body,
        })
    }

    pub fn kind(&self) -> ActivityType {
        match &self.body {
            ActivityBody::Follow { .. } => ActivityType::Follow,
            ActivityBody::Undo { .. } => ActivityType::Undo,
            ActivityBody::Create { .. } => ActivityType::Create,
            ActivityBody::Update { .. } => ActivityType::Update,
            ActivityBody::Delete { .. } => ActivityType::Delete,
            ActivityBody::Accept { .. } => ActivityType::Accept,
            ActivityBody::Reject { .. } => ActivityType::Reject,
            ActivityBody::Like { .. } => ActivityType::Like,
            ActivityBody::Announce { .. } => ActivityType::Announce,
        }
    }

    /// IRI of whatever `object` points at
    pub fn object_iri(&self) -> &str {
        match &self.body {
            ActivityBody::Follow { object } => object,
            ActivityBody::Undo { object }
            | ActivityBody::Accept { object }
            | ActivityBody::Reject { object } => object.iri(),
            ActivityBody::Create { object } | ActivityBody::Update { object } => &object.id,
            ActivityBody::Delete { object } => object.iri(),
            ActivityBody::Like { object } | ActivityBody::Announce { object } => object.iri(),
        }
    }

    /// Every addressed IRI (`to` then `cc`)
    pub fn audience(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(self.cc.iter()).map(String::as_str)
    }

    /// JSON document with `@context`, as sent over the wire
    pub fn to_value(&self) -> Value {
        let mut value = self.to_embedded_value();
        if let Value::Object(map) = &mut value {
            map.insert("@context".to_string(), json!(ACTIVITYSTREAMS_CONTEXT));
        }
        value
    }

    /// Serialized wire form
    pub fn serialize(&self) -> String {
        self.to_value().to_string()
    }

    fn to_embedded_value(&self) -> Value {
        let object = match &self.body {
            ActivityBody::Follow { object } => json!(object),
            ActivityBody::Undo { object }
            | ActivityBody::Accept { object }
            | ActivityBody::Reject { object } => match object {
                Reference::Iri(iri) => json!(iri),
                Reference::Embedded(inner) => inner.to_embedded_value(),
            },
            ActivityBody::Create { object } | ActivityBody::Update { object } => {
                object.to_embedded_value()
            }
            ActivityBody::Delete { object } => match object {
                Reference::Iri(iri) => json!(iri),
                Reference::Embedded(tombstone) => tombstone.to_embedded_value(),
            },
            ActivityBody::Like { object } | ActivityBody::Announce { object } => match object {
                Reference::Iri(iri) => json!(iri),
                Reference::Embedded(inner) => inner.to_embedded_value(),
            },
        };

        let mut map = Map::new();
        map.insert("id".to_string(), json!(self.id));
        map.insert("type".to_string(), json!(self.kind().as_str()));
        map.insert("actor".to_string(), json!(self.actor));
        map.insert("object".to_string(), object);
        if let Some(published) = self.published {
            map.insert("published".to_string(), json!(format_timestamp(published)));
        }
        insert_audience(&mut map, "to", &self.to);
        insert_audience(&mut map, "cc", &self.cc);
        Value::Object(map)
    }
}

impl Object {
    pub fn from_value(value: &Value) -> Result<Self, AppError> {
        let map = value
            .as_object()
            .ok_or_else(|| AppError::Validation("Object must be embedded, not a reference".to_string()))?;

        let type_name = required_str(map, "type")?;
        let kind = ObjectType::from_str(type_name)
            .ok_or_else(|| AppError::UnsupportedType(type_name.to_string()))?;

        let content = map
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation(format!("{} is missing `content`", type_name)))?
            .to_string();

        let published = optional_timestamp(map, "published")?
            .ok_or_else(|| AppError::Validation(format!("{} is missing `published`", type_name)))?;

        Ok(Self {
            id: required_iri(map, "id")?,
            kind,
            attributed_to: required_id(map, "attributedTo")?,
            content,
            published,
            name: optional_str(map, "name")?,
            summary: optional_str(map, "summary")?,
            in_reply_to: optional_id(map, "inReplyTo")?,
            updated: optional_timestamp(map, "updated")?,
            url: optional_id(map, "url")?,
            to: audience(map, "to")?,
            cc: audience(map, "cc")?,
            location: optional_str(map, "location")?,
            employment_type: optional_str(map, "employmentType")?,
            salary_range: optional_str(map, "salaryRange")?,
            expires: optional_timestamp(map, "expires")?,
        })
    }

    /// Standalone document with `@context`, as served from the object IRI
    pub fn to_value(&self) -> Value {
        let mut value = self.to_embedded_value();
        if let Value::Object(map) = &mut value {
            map.insert("@context".to_string(), json!(ACTIVITYSTREAMS_CONTEXT));
        }
        value
    }

    fn to_embedded_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), json!(self.id));
        map.insert("type".to_string(), json!(self.kind.as_str()));
        map.insert("attributedTo".to_string(), json!(self.attributed_to));
        map.insert("content".to_string(), json!(self.content));
        map.insert(
            "published".to_string(),
            json!(format_timestamp(self.published)),
        );

        let optional = [
            ("name", &self.name),
            ("summary", &self.summary),
            ("inReplyTo", &self.in_reply_to),
            ("url", &self.url),
            ("location", &self.location),
            ("employmentType", &self.employment_type),
            ("salaryRange", &self.salary_range),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.insert(key.to_string(), json!(value));
            }
        }
        if let Some(updated) = self.updated {
            map.insert("updated".to_string(), json!(format_timestamp(updated)));
        }
        if let Some(expires) = self.expires {
            map.insert("expires".to_string(), json!(format_timestamp(expires)));
        }

        insert_audience(&mut map, "to", &self.to);
        insert_audience(&mut map, "cc", &self.cc);
        Value::Object(map)
    }
}

impl Tombstone {
    fn from_map(map: &Map<String, Value>) -> Result<Self, AppError> {
        Ok(Self {
            id: required_iri(map, "id")?,
            former_type: optional_str(map, "formerType")?,
            deleted: optional_timestamp(map, "deleted")?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut value = self.to_embedded_value();
        if let Value::Object(map) = &mut value {
            map.insert("@context".to_string(), json!(ACTIVITYSTREAMS_CONTEXT));
        }
        value
    }

    fn to_embedded_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), json!(self.id));
        map.insert("type".to_string(), json!("Tombstone"));
        if let Some(former_type) = &self.former_type {
            map.insert("formerType".to_string(), json!(former_type));
        }
        if let Some(deleted) = self.deleted {
            map.insert("deleted".to_string(), json!(format_timestamp(deleted)));
        }
        Value::Object(map)
    }
}

/// RFC 3339 in UTC, keeping whatever sub-second precision the value has
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn activity_reference(value: &Value) -> Result<Reference<Activity>, AppError> {
    match value {
        Value::String(_) => Ok(Reference::Iri(id_of(value, "object")?)),
        Value::Object(_) => Ok(Reference::Embedded(Box::new(Activity::from_value(value)?))),
        _ => Err(AppError::Validation(
            "`object` must be an activity or its IRI".to_string(),
        )),
    }
}

fn tombstone_reference(value: &Value) -> Result<Reference<Tombstone>, AppError> {
    match value {
        Value::String(_) => Ok(Reference::Iri(id_of(value, "object")?)),
        Value::Object(map) => {
            let tombstone = if map.get("type").and_then(Value::as_str) == Some("Tombstone") {
                Tombstone::from_map(map)?
            } else {
                // Some servers embed the deleted object itself.
                Tombstone {
                    id: required_iri(map, "id")?,
                    former_type: optional_str(map, "type")?,
                    deleted: None,
                }
            };
            Ok(Reference::Embedded(Box::new(tombstone)))
        }
        _ => Err(AppError::Validation(
            "`object` must be an object or its IRI".to_string(),
        )),
    }
}

/// Like/Announce targets: our object types are parsed in full, anything else
/// is kept as a plain reference.
fn object_reference(value: &Value) -> Result<Reference<Object>, AppError> {
    match value {
        Value::String(_) => Ok(Reference::Iri(id_of(value, "object")?)),
        Value::Object(map) => {
            let supported = map
                .get("type")
                .and_then(Value::as_str)
                .and_then(ObjectType::from_str)
                .is_some();
            if supported {
                Ok(Reference::Embedded(Box::new(Object::from_value(value)?)))
            } else {
                Ok(Reference::Iri(required_iri(map, "id")?))
            }
        }
        _ => Err(AppError::Validation(
            "`object` must be an object or its IRI".to_string(),
        )),
    }
}

fn required_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str, AppError> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::Validation(format!("Missing `{}`", key)))
}

fn optional_str(map: &Map<String, Value>, key: &str) -> Result<Option<String>, AppError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(AppError::Validation(format!("`{}` must be a string", key))),
    }
}

/// An absolute http(s) IRI
fn check_iri(value: &str, key: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(value)
        .map_err(|_| AppError::Validation(format!("`{}` is not an IRI: {}", key, value)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(value.to_string()),
        _ => Err(AppError::Validation(format!(
            "`{}` must be an http(s) IRI: {}",
            key, value
        ))),
    }
}

fn required_iri(map: &Map<String, Value>, key: &str) -> Result<String, AppError> {
    check_iri(required_str(map, key)?, key)
}

/// IRI given directly or as the `id` of an embedded object
fn id_of(value: &Value, key: &str) -> Result<String, AppError> {
    match value {
        Value::String(iri) => check_iri(iri, key),
        Value::Object(map) => required_iri(map, "id"),
        Value::Array(items) if items.len() == 1 => id_of(&items[0], key),
        _ => Err(AppError::Validation(format!(
            "`{}` must be an IRI or an object with an id",
            key
        ))),
    }
}

fn required_id(map: &Map<String, Value>, key: &str) -> Result<String, AppError> {
    let value = map
        .get(key)
        .ok_or_else(|| AppError::Validation(format!("Missing `{}`", key)))?;
    id_of(value, key)
}

fn optional_id(map: &Map<String, Value>, key: &str) -> Result<Option<String>, AppError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => id_of(value, key).map(Some),
    }
}

fn optional_timestamp(
    map: &Map<String, Value>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, AppError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| AppError::Validation(format!("Malformed timestamp in `{}`: {}", key, raw))),
        Some(_) => Err(AppError::Validation(format!(
            "`{}` must be an RFC 3339 timestamp",
            key
        ))),
    }
}

/// Audience fields accept a single IRI or a list
fn audience(map: &Map<String, Value>, key: &str) -> Result<Vec<String>, AppError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(iri)) => Ok(vec![iri.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(iri) => Ok(iri.clone()),
                Value::Object(inner) => required_str(inner, "id").map(str::to_string),
                _ => Err(AppError::Validation(format!(
                    "`{}` entries must be IRIs",
                    key
                ))),
            })
            .collect(),
        Some(_) => Err(AppError::Validation(format!(
            "`{}` must be an IRI or a list of IRIs",
            key
        ))),
    }
}

fn insert_audience(map: &mut Map<String, Value>, key: &str, values: &[String]) {
    if !values.is_empty() {
        map.insert(key.to_string(), json!(values));
    }
}
