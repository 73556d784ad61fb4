// Copyright 2023 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event filters derived from capability strings, and the compiled matcher
//! used on the event-forwarding hot path.
//!
//! A filter is a typed predicate over a single event. Filters are grouped by
//! the kind of event they can match (message-like, state, to-device); a
//! filter of one kind never matches an event of another. Independently of
//! any user-granted filter, events in the crypto denylist are never matched.

use std::collections::{HashMap, HashSet};

use ruma::{OwnedDeviceId, OwnedUserId};
use serde_json::Value as JsonValue;

/// The event type of `m.room.message` events.
pub(crate) const ROOM_MESSAGE_TYPE: &str = "m.room.message";

const CRYPTO_TYPES: &[&str] =
    &["m.room_key", "m.room_key_request", "m.forwarded_room_key", "m.room.encrypted"];

const CRYPTO_TYPE_PREFIXES: &[&str] =
    &["m.secret.", "m.room_key.", "m.room_key_request.", "m.forwarded_room_key."];

/// Whether events of the given type carry key material or ciphertext.
///
/// Such events must never cross the widget boundary in either direction, no
/// matter what capabilities the user approved.
pub fn is_crypto_event_type(event_type: &str) -> bool {
    CRYPTO_TYPES.contains(&event_type)
        || CRYPTO_TYPE_PREFIXES.iter().any(|prefix| event_type.starts_with(prefix))
}

/// Different kinds of event filters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    /// Filter for message-like events.
    MessageLike(MessageLikeEventFilter),
    /// Filter for state events.
    State(StateEventFilter),
    /// Filter for to-device events.
    ToDevice(ToDeviceEventFilter),
}

impl EventFilter {
    /// Whether the given event passes this filter.
    pub fn matches(&self, input: &FilterInput<'_>, context: &FilterContext) -> bool {
        match (self, input) {
            (EventFilter::MessageLike(filter), FilterInput::MessageLike { event_type, msgtype }) => {
                filter.matches(event_type, *msgtype)
            }
            (EventFilter::State(filter), FilterInput::State { event_type, state_key }) => {
                filter.matches(event_type, state_key, context)
            }
            (EventFilter::ToDevice(filter), FilterInput::ToDevice { event_type }) => {
                filter.matches_event_type(event_type)
            }
            _ => false,
        }
    }

    /// Whether this filter could match any event of the given type,
    /// disregarding state keys and message types.
    pub(crate) fn matches_event_type(&self, event_type: &str) -> bool {
        match self {
            EventFilter::MessageLike(filter) => filter.matches_event_type(event_type),
            EventFilter::State(filter) => filter.matches_event_type(event_type),
            EventFilter::ToDevice(filter) => filter.matches_event_type(event_type),
        }
    }
}

/// Filter for message-like events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageLikeEventFilter {
    /// Matches message-like events whose type starts with the given value.
    ///
    /// A trailing `*` in a capability string is equivalent; it is kept
    /// verbatim here and stripped at match time.
    WithType(String),
    /// Matches `m.room.message` events with the given `msgtype`.
    RoomMessageWithMsgtype(String),
}

impl MessageLikeEventFilter {
    fn matches(&self, event_type: &str, msgtype: Option<&str>) -> bool {
        match self {
            MessageLikeEventFilter::WithType(type_prefix) => {
                matches_type(type_prefix, event_type, true)
            }
            MessageLikeEventFilter::RoomMessageWithMsgtype(filter_msgtype) => {
                event_type == ROOM_MESSAGE_TYPE && msgtype == Some(filter_msgtype.as_str())
            }
        }
    }

    pub(crate) fn matches_event_type(&self, event_type: &str) -> bool {
        match self {
            MessageLikeEventFilter::WithType(type_prefix) => {
                matches_type(type_prefix, event_type, true)
            }
            MessageLikeEventFilter::RoomMessageWithMsgtype(_) => event_type == ROOM_MESSAGE_TYPE,
        }
    }
}

/// Filter for state events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateEventFilter {
    /// Matches state events with the given type, regardless of state key.
    WithType(String),
    /// Matches state events with the given type and state key.
    ///
    /// The state key is a pattern: `{userId}` and `{deviceId}` are replaced
    /// with the own user and device id before comparison.
    WithTypeAndStateKey(String, String),
}

impl StateEventFilter {
    pub(crate) fn matches(&self, event_type: &str, state_key: &str, context: &FilterContext) -> bool {
        match self {
            StateEventFilter::WithType(filter_type) => matches_type(filter_type, event_type, false),
            StateEventFilter::WithTypeAndStateKey(filter_type, key_pattern) => {
                matches_type(filter_type, event_type, false)
                    && state_key == context.expand(key_pattern)
            }
        }
    }

    pub(crate) fn matches_event_type(&self, event_type: &str) -> bool {
        match self {
            StateEventFilter::WithType(filter_type)
            | StateEventFilter::WithTypeAndStateKey(filter_type, _) => {
                matches_type(filter_type, event_type, false)
            }
        }
    }
}

/// Filter for to-device events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToDeviceEventFilter {
    /// The event type this filter matches.
    pub event_type: String,
}

impl ToDeviceEventFilter {
    /// Creates a filter for the given to-device event type.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self { event_type: event_type.into() }
    }

    pub(crate) fn matches_event_type(&self, event_type: &str) -> bool {
        matches_type(&self.event_type, event_type, false)
    }
}

/// Matches an event type against a filter pattern.
///
/// A trailing `*` always makes the pattern a prefix; message-like patterns
/// are prefixes even without it.
fn matches_type(pattern: &str, event_type: &str, prefix_semantics: bool) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        event_type.starts_with(prefix)
    } else if prefix_semantics {
        event_type.starts_with(pattern)
    } else {
        event_type == pattern
    }
}

/// Values substituted into templated state key patterns.
#[derive(Clone, Debug)]
pub struct FilterContext {
    /// The user on whose behalf the widget acts.
    pub user_id: OwnedUserId,
    /// The device the driver runs on.
    pub device_id: OwnedDeviceId,
}

impl FilterContext {
    /// Creates a context for the given user and device.
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        Self { user_id, device_id }
    }

    fn expand(&self, pattern: &str) -> String {
        pattern
            .replace("{userId}", self.user_id.as_str())
            .replace("{deviceId}", self.device_id.as_str())
    }
}

/// A view of an event, reduced to the fields filters inspect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterInput<'a> {
    /// A timeline event without a state key.
    MessageLike {
        /// The event type.
        event_type: &'a str,
        /// `content.msgtype`, when present.
        msgtype: Option<&'a str>,
    },
    /// A state event.
    State {
        /// The event type.
        event_type: &'a str,
        /// The state key.
        state_key: &'a str,
    },
    /// A to-device event.
    ToDevice {
        /// The event type.
        event_type: &'a str,
    },
}

impl<'a> FilterInput<'a> {
    /// The event type of the underlying event.
    pub fn event_type(&self) -> &'a str {
        match self {
            FilterInput::MessageLike { event_type, .. }
            | FilterInput::State { event_type, .. }
            | FilterInput::ToDevice { event_type } => event_type,
        }
    }

    /// Builds the input for a raw room event, classifying it as state or
    /// message-like by the presence of a `state_key`.
    ///
    /// Returns `None` if the JSON has no string `type` field.
    pub fn from_room_event(event: &'a JsonValue) -> Option<Self> {
        let event_type = event.get("type")?.as_str()?;
        match event.get("state_key").and_then(JsonValue::as_str) {
            Some(state_key) => Some(FilterInput::State { event_type, state_key }),
            None => {
                let msgtype = event
                    .get("content")
                    .and_then(|content| content.get("msgtype"))
                    .and_then(JsonValue::as_str);
                Some(FilterInput::MessageLike { event_type, msgtype })
            }
        }
    }

    /// Builds the input for a raw to-device message.
    pub fn from_to_device_event(event: &'a JsonValue) -> Option<Self> {
        let event_type = event.get("type")?.as_str()?;
        Some(FilterInput::ToDevice { event_type })
    }
}

/// A filter list compiled into lookup structures.
///
/// Matching tries an exact-type hit first, then the prefix list, then the
/// type-indexed second pass (msgtypes, expanded state keys), short-circuiting
/// on the first hit. The crypto denylist is evaluated before any of it.
#[derive(Clone, Debug, Default)]
pub struct FilterEngine {
    message_exact: HashSet<String>,
    message_prefixes: Vec<String>,
    room_msgtypes: HashSet<String>,
    state_exact: HashSet<String>,
    state_prefixes: Vec<String>,
    state_keyed: HashMap<String, Vec<String>>,
    to_device_exact: HashSet<String>,
    to_device_prefixes: Vec<String>,
}

impl FilterEngine {
    /// Compiles the given filters; state key patterns are expanded with
    /// `context` once, at build time.
    pub fn new(filters: &[EventFilter], context: &FilterContext) -> Self {
        let mut engine = FilterEngine::default();

        for filter in filters {
            match filter {
                EventFilter::MessageLike(MessageLikeEventFilter::WithType(event_type)) => {
                    // Message-like types are always prefixes.
                    let prefix = event_type.strip_suffix('*').unwrap_or(event_type);
                    engine.message_exact.insert(prefix.to_owned());
                    engine.message_prefixes.push(prefix.to_owned());
                }
                EventFilter::MessageLike(MessageLikeEventFilter::RoomMessageWithMsgtype(
                    msgtype,
                )) => {
                    engine.room_msgtypes.insert(msgtype.clone());
                }
                EventFilter::State(StateEventFilter::WithType(event_type)) => {
                    match event_type.strip_suffix('*') {
                        Some(prefix) => engine.state_prefixes.push(prefix.to_owned()),
                        None => {
                            engine.state_exact.insert(event_type.clone());
                        }
                    }
                }
                EventFilter::State(StateEventFilter::WithTypeAndStateKey(
                    event_type,
                    key_pattern,
                )) => {
                    engine
                        .state_keyed
                        .entry(event_type.clone())
                        .or_default()
                        .push(context.expand(key_pattern));
                }
                EventFilter::ToDevice(filter) => match filter.event_type.strip_suffix('*') {
                    Some(prefix) => engine.to_device_prefixes.push(prefix.to_owned()),
                    None => {
                        engine.to_device_exact.insert(filter.event_type.clone());
                    }
                },
            }
        }

        engine
    }

    /// Whether the given event may be forwarded to the widget.
    pub fn matches(&self, input: &FilterInput<'_>) -> bool {
        if is_crypto_event_type(input.event_type()) {
            return false;
        }

        match input {
            FilterInput::MessageLike { event_type, msgtype } => {
                self.message_exact.contains(*event_type)
                    || self.message_prefixes.iter().any(|prefix| event_type.starts_with(prefix.as_str()))
                    || (*event_type == ROOM_MESSAGE_TYPE
                        && msgtype.is_some_and(|m| self.room_msgtypes.contains(m)))
            }
            FilterInput::State { event_type, state_key } => {
                self.state_exact.contains(*event_type)
                    || self.state_prefixes.iter().any(|prefix| event_type.starts_with(prefix.as_str()))
                    || self
                        .state_keyed
                        .get(*event_type)
                        .is_some_and(|keys| keys.iter().any(|key| key == state_key))
            }
            FilterInput::ToDevice { event_type } => {
                self.to_device_exact.contains(*event_type)
                    || self.to_device_prefixes.iter().any(|prefix| event_type.starts_with(prefix.as_str()))
            }
        }
    }
}
