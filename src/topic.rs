//! Translation between the MQTT topic tree and the internal bus subject tree.
//!
//! Devices speak `channels/<channel>/messages[/<seg>/<seg>...]`; the bus
//! speaks `channel.<channel>[.<seg>.<seg>...]`. Everything downstream of the
//! parse works with the typed [`ChannelId`]/[`Subtopic`] pair, never with the
//! raw topic string.

use std::fmt::{self, Display, Formatter};
use std::sync::OnceLock;

use regex::Regex;

/// Subjects the adapter publishes to and subscribes from on the internal bus
/// all live under this token.
pub const SUBJECT_PREFIX: &str = "channel";

/// The wildcard subject covering every channel, used by the inbound bridge.
pub const SUBJECT_ALL_CHANNELS: &str = "channel.>";

fn topic_regex() -> &'static Regex {
    static TOPIC_REGEX: OnceLock<Regex> = OnceLock::new();

    // The `messages` suffix boundary is load-bearing: `channels/x/messagesXY`
    // must not match.
    TOPIC_REGEX.get_or_init(|| {
        Regex::new(r"^channels/([^/.]+)/messages(/.*)?$").expect("topic regex must compile")
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic does not match channels/<channel>/messages[/...]: {0:?}")]
    Malformed(String),
    #[error("channel id may not contain wildcards: {0:?}")]
    WildcardChannel(String),
    #[error("subtopic segment may not contain wildcards: {0:?}")]
    WildcardSegment(String),
}

/// A channel identifier: non-empty, free of `/`, `.` and wildcard
/// characters. Compared byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    /// Validate an identifier coming off the wire (an MQTT topic segment or
    /// a bus envelope field).
    pub fn parse(s: &str) -> Result<ChannelId, TopicError> {
        if s.is_empty() || s.contains(['/', '.']) {
            return Err(TopicError::Malformed(s.into()));
        }

        if s.contains(['+', '#', '*', '>']) {
            return Err(TopicError::WildcardChannel(s.into()));
        }

        Ok(ChannelId(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Zero or more dot-separated segments below a channel.
///
/// Stored in the bus form (dots); [`Subtopic::from_path`] accepts the MQTT
/// slash form, tolerating leading, trailing and doubled separators. Wildcard
/// characters are refused in any segment, whole-segment included: this
/// adapter does not accept wildcard publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subtopic(String);

impl Subtopic {
    pub const EMPTY: Subtopic = Subtopic(String::new());

    /// Build a subtopic from the slash-separated remainder of an MQTT topic.
    pub fn from_path(path: &str) -> Result<Subtopic, TopicError> {
        Self::from_separated(path, '/')
    }

    /// Build a subtopic from the dot-separated suffix of a bus subject or an
    /// envelope field.
    pub fn from_dots(dotted: &str) -> Result<Subtopic, TopicError> {
        Self::from_separated(dotted, '.')
    }

    fn from_separated(raw: &str, separator: char) -> Result<Subtopic, TopicError> {
        let mut segments = Vec::new();

        // A literal `.` in an MQTT segment is indistinguishable from a
        // separator once on the bus, so both separators are honored here.
        for segment in raw.split([separator, '.']) {
            if segment.is_empty() {
                continue;
            }

            if segment.contains(['*', '>', '+', '#']) {
                return Err(TopicError::WildcardSegment(segment.into()));
            }

            segments.push(segment);
        }

        Ok(Subtopic(segments.join(".")))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The bus form: dot-separated segments.
    pub fn as_dots(&self) -> &str {
        &self.0
    }

    /// The MQTT form: slash-separated segments.
    pub fn to_path(&self) -> String {
        self.0.replace('.', "/")
    }
}

/// Parse a topic a device publishes to.
pub fn parse_publish_topic(topic: &str) -> Result<(ChannelId, Subtopic), TopicError> {
    let captures = topic_regex()
        .captures(topic)
        .ok_or_else(|| TopicError::Malformed(topic.into()))?;

    let channel = ChannelId::parse(&captures[1])?;
    let subtopic = match captures.get(2) {
        Some(rest) => Subtopic::from_path(rest.as_str())?,
        None => Subtopic::EMPTY,
    };

    Ok((channel, subtopic))
}

/// Extract the channel from a subscription filter.
///
/// The suffix below `messages` stays in MQTT-land (the broker matches it
/// against delivered topics), so MQTT wildcards are fine there; the channel
/// segment itself must be a literal id for authorization.
pub fn parse_subscribe_filter(filter: &str) -> Result<ChannelId, TopicError> {
    let captures = topic_regex()
        .captures(filter)
        .ok_or_else(|| TopicError::Malformed(filter.into()))?;

    ChannelId::parse(&captures[1])
}

/// Render the MQTT topic a bus message is delivered on.
pub fn render_topic(channel: &ChannelId, subtopic: &Subtopic) -> String {
    if subtopic.is_empty() {
        format!("channels/{channel}/messages")
    } else {
        format!("channels/{channel}/messages/{}", subtopic.to_path())
    }
}

/// Render the bus subject a device publish goes out on.
pub fn bus_subject(channel: &ChannelId, subtopic: &Subtopic) -> String {
    if subtopic.is_empty() {
        format!("{SUBJECT_PREFIX}.{channel}")
    } else {
        format!("{SUBJECT_PREFIX}.{channel}.{}", subtopic.as_dots())
    }
}
