use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::error::{PushgError, Result};

/// Number of comma-separated fields in a serialized message's metadata line.
pub const METADATA_FIELDS: usize = 8;

/// Prefix for transport headers that are carried into a message's header
/// blob by ingress front-ends. The prefix itself is stripped.
pub const MESSAGE_HEADER_PREFIX: &str = "x-pushg-";

// Valid names for NotificationMessage.name
pub const SUCCESS_CONNECTED: &str = "connected";
pub const SUCCESS_SEND: &str = "send";
pub const SUCCESS_FETCH_START: &str = "fetch-start";
pub const SUCCESS_FETCH_END: &str = "fetch-end";
pub const SUCCESS_SUBSCRIBED_TO: &str = "subscribed-to";
pub const SUCCESS_CANCELED: &str = "canceled";
pub const ERROR_SUBSCRIBED_TO: &str = "error-subscribed-to";
pub const ERROR_BAD_REQUEST: &str = "error-bad-request";
pub const ERROR_INTERNAL_SERVER: &str = "error-server-internal";

/// A hierarchical topic path, e.g. `/notifications/user42/news`.
///
/// Paths are non-empty, begin with `/` and consist of `/`-separated
/// segments. The first non-empty segment is the path's *partition*, the unit
/// of message ordering and storage isolation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(String);

impl Path {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() || !path.starts_with('/') {
            return Err(PushgError::InvalidPath(path));
        }
        Ok(Path(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The partition of this path: its first non-empty segment.
    /// The root path `/` has the empty partition.
    pub fn partition(&self) -> &str {
        self.0
            .split('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("")
    }

    /// Whether a message published on `topic` is covered by a subscription
    /// on `self`: every segment of `self` must match the corresponding
    /// segment of `topic`. A route on `/foo` thus receives `/foo` and
    /// `/foo/bar`, but not `/foobar`.
    pub fn matches(&self, topic: &Path) -> bool {
        let mut route = self.0.split('/');
        let mut message = topic.0.split('/');
        loop {
            match (route.next(), message.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(r), Some(m)) => {
                    if r != m {
                        return false;
                    }
                }
            }
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Path {
    type Err = PushgError;

    fn from_str(s: &str) -> Result<Self> {
        Path::new(s)
    }
}

/// A broker message, immutable once it has been assigned an ID by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message identifier, strictly monotonically increasing within the
    /// partition of `path`. `0` until the store assigns one.
    pub id: u64,
    /// The topic path the message was published on
    pub path: Path,
    /// User id of the message sender
    pub user_id: String,
    /// Id of the sending application
    pub application_id: String,
    /// Filters applied to this message. The message is delivered only to
    /// routes whose params do not contradict these entries.
    pub filters: HashMap<String, String>,
    /// Until when the message is valid to be processed. Connectors treat an
    /// expired message as processed and only log the fact.
    pub expires: Option<DateTime<Utc>>,
    /// Time of publishing, unix seconds, captured when the ID is generated
    pub time: i64,
    /// Identifier of the originating cluster node; `0` in standalone mode
    pub node_id: u8,
    /// Optional header line; when set it must be a JSON object
    pub header_json: String,
    /// The message payload
    pub body: Bytes,
}

impl Message {
    pub fn new(path: Path, body: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            path,
            user_id: String::new(),
            application_id: String::new(),
            filters: HashMap::new(),
            expires: None,
            time: 0,
            node_id: 0,
            header_json: String::new(),
            body: body.into(),
        }
    }

    pub fn set_filter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.filters.insert(key.into(), value.into());
    }

    /// Whether the message's `expires` instant lies in the past.
    pub fn expired(&self) -> bool {
        match self.expires {
            Some(expires) => expires < Utc::now(),
            None => false,
        }
    }

    /// The `correlationId` field of the header blob, if present.
    pub fn correlation_id(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.header_json).ok()?;
        value
            .get("correlationId")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    }

    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The first line of the serialized form, without the trailing newline.
    pub fn metadata(&self) -> String {
        let mut line = String::with_capacity(64);
        self.write_metadata(&mut line);
        line
    }

    /// Serializes the message into its text-framed wire form.
    pub fn bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.header_json.len() + self.body.len());
        let mut meta = String::with_capacity(64);
        self.write_metadata(&mut meta);
        buf.put_slice(meta.as_bytes());

        if !self.header_json.is_empty() || !self.body.is_empty() {
            buf.put_u8(b'\n');
        }
        if !self.header_json.is_empty() {
            buf.put_slice(self.header_json.as_bytes());
        }
        if !self.body.is_empty() {
            buf.put_u8(b'\n');
            buf.put_slice(&self.body);
        }
        buf.freeze()
    }

    fn write_metadata(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = write!(
            out,
            "{},{},{},{},",
            self.path, self.id, self.user_id, self.application_id
        );
        if !self.filters.is_empty() {
            match serde_json::to_string(&self.filters) {
                Ok(json) => out.push_str(&json),
                Err(err) => warn!(error = %err, "could not encode message filters"),
            }
        }
        out.push(',');
        if let Some(expires) = self.expires {
            out.push_str(&expires.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        let _ = write!(out, ",{},{}", self.time, self.node_id);
    }
}

/// A status or error frame, sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotificationMessage {
    /// The name of the notification
    pub name: String,
    /// The argument line following the name
    pub arg: String,
    /// Optional JSON blob supplied with the notification
    pub json: String,
    /// Whether the notification is an error frame
    pub is_error: bool,
}

impl NotificationMessage {
    /// Serializes the notification into its wire form:
    /// `#name arg\njson` for success frames, `!` instead of `#` for errors.
    pub fn bytes(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(2 + self.name.len() + self.arg.len() + self.json.len());
        buf.put_u8(if self.is_error { b'!' } else { b'#' });
        buf.put_slice(self.name.as_bytes());
        if !self.arg.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(self.arg.as_bytes());
        }
        if !self.json.is_empty() {
            buf.put_u8(b'\n');
            buf.put_slice(self.json.as_bytes());
        }
        buf.freeze()
    }
}

/// Either kind of frame a server can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Box<Message>),
    Notification(NotificationMessage),
}

/// Decodes a server-to-client frame into a [`Message`] or a
/// [`NotificationMessage`], depending on the leading byte.
pub fn decode(data: &[u8]) -> Result<Decoded> {
    if data.first().map_or(false, |b| *b == b'#' || *b == b'!') {
        parse_notification(data).map(Decoded::Notification)
    } else {
        parse_message(data).map(|m| Decoded::Message(Box::new(m)))
    }
}

/// Parses a serialized message. The metadata line must carry exactly
/// [`METADATA_FIELDS`] comma-separated fields; the legacy 7-field form is
/// rejected.
pub fn parse_message(data: &[u8]) -> Result<Message> {
    if data.is_empty() {
        return Err(PushgError::InvalidMessage("empty message".into()));
    }

    let (meta, rest) = match memchr::memchr(b'\n', data) {
        Some(pos) => (&data[..pos], Some(&data[pos + 1..])),
        None => (data, None),
    };
    let meta = std::str::from_utf8(meta)
        .map_err(|_| PushgError::InvalidMessage("metadata is not valid utf-8".into()))?;

    let fields: Vec<&str> = meta.split(',').collect();
    if fields.len() != METADATA_FIELDS {
        return Err(PushgError::InvalidMessage(format!(
            "metadata must have {} fields, but was {:?}",
            METADATA_FIELDS, meta
        )));
    }

    let path = Path::new(fields[0])
        .map_err(|_| PushgError::InvalidMessage(format!("invalid topic, got {:?}", fields[0])))?;
    let id = fields[1]
        .parse::<u64>()
        .map_err(|_| PushgError::InvalidMessage(format!("invalid message id {:?}", fields[1])))?;
    let expires = if fields[5].is_empty() {
        None
    } else {
        let parsed = DateTime::parse_from_rfc3339(fields[5]).map_err(|_| {
            PushgError::InvalidMessage(format!("invalid expires timestamp {:?}", fields[5]))
        })?;
        Some(parsed.with_timezone(&Utc))
    };
    let time = fields[6].parse::<i64>().map_err(|_| {
        PushgError::InvalidMessage(format!("invalid publishing time {:?}", fields[6]))
    })?;
    let node_id = fields[7]
        .parse::<u8>()
        .map_err(|_| PushgError::InvalidMessage(format!("invalid node id {:?}", fields[7])))?;

    let (header_json, body) = match rest {
        None => (String::new(), Bytes::new()),
        Some(rest) => match memchr::memchr(b'\n', rest) {
            Some(pos) => {
                let header = std::str::from_utf8(&rest[..pos]).map_err(|_| {
                    PushgError::InvalidMessage("header line is not valid utf-8".into())
                })?;
                (header.to_owned(), Bytes::copy_from_slice(&rest[pos + 1..]))
            }
            None => {
                let header = std::str::from_utf8(rest).map_err(|_| {
                    PushgError::InvalidMessage("header line is not valid utf-8".into())
                })?;
                (header.to_owned(), Bytes::new())
            }
        },
    };

    let mut message = Message {
        id,
        path,
        user_id: fields[2].to_owned(),
        application_id: fields[3].to_owned(),
        filters: HashMap::new(),
        expires,
        time,
        node_id,
        header_json,
        body,
    };
    if !fields[4].is_empty() {
        match serde_json::from_str(fields[4]) {
            Ok(filters) => message.filters = filters,
            Err(err) => warn!(error = %err, data = fields[4], "could not decode message filters"),
        }
    }
    Ok(message)
}

/// Parses a notification frame (`#name arg\njson` or `!name ...`).
pub fn parse_notification(data: &[u8]) -> Result<NotificationMessage> {
    if data.len() < 2 || (data[0] != b'#' && data[0] != b'!') {
        return Err(PushgError::InvalidMessage(
            "notification has to start with '#' or '!' and a name".into(),
        ));
    }
    let is_error = data[0] == b'!';
    let text = std::str::from_utf8(&data[1..])
        .map_err(|_| PushgError::InvalidMessage("notification is not valid utf-8".into()))?;

    let (first_line, json) = match text.split_once('\n') {
        Some((line, json)) => (line, json),
        None => (text, ""),
    };
    let (name, arg) = match first_line.split_once(' ') {
        Some((name, arg)) => (name, arg),
        None => (first_line, ""),
    };

    Ok(NotificationMessage {
        name: name.to_owned(),
        arg: arg.to_owned(),
        json: json.to_owned(),
        is_error,
    })
}

/// Collects transport headers carrying the [`MESSAGE_HEADER_PREFIX`] into a
/// JSON object for [`Message::header_json`], with the prefix stripped.
/// Returns the empty string when no header matches.
pub fn collect_header_json<'a, I>(headers: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let lowered = name.to_ascii_lowercase();
        if let Some(stripped) = lowered.strip_prefix(MESSAGE_HEADER_PREFIX) {
            map.insert(
                stripped.to_owned(),
                serde_json::Value::String(value.to_owned()),
            );
        }
    }
    if map.is_empty() {
        String::new()
    } else {
        serde_json::Value::Object(map).to_string()
    }
}

/// Translates an ingress query parameter name of the form `filterCamelCase`
/// into the snake_case filter key it addresses (`filterUserId` →
/// `user_id`). Returns `None` for parameters that are not filters.
pub fn filter_key(param: &str) -> Option<String> {
    let rest = param.strip_prefix("filter")?;
    if rest.is_empty() || !rest.starts_with(|c: char| c.is_ascii_uppercase()) {
        return None;
    }
    let mut key = String::with_capacity(rest.len() + 2);
    for c in rest.chars() {
        if c.is_ascii_uppercase() {
            if !key.is_empty() {
                key.push('_');
            }
            key.push(c.to_ascii_lowercase());
        } else {
            key.push(c);
        }
    }
    Some(key)
}

/// Parses the value of an `Expires` ingress header (unix seconds).
pub fn parse_expires(value: &str) -> Option<DateTime<Utc>> {
    let seconds = value.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}
