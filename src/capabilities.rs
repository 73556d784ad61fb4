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

//! Capabilities a widget may request, and the checks the driver runs
//! against the approved set.
//!
//! On the wire a capability is a string like
//! `org.matrix.msc2762.send.event:m.room.message#m.text`; parsing turns the
//! suffix after the first `:` into an [`EventFilter`]. Serialization
//! produces the canonical form again, so a set round-trips through its
//! string representation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::filter::{
    is_crypto_event_type, EventFilter, FilterContext, FilterInput, MessageLikeEventFilter,
    StateEventFilter, ToDeviceEventFilter, ROOM_MESSAGE_TYPE,
};

const SEND_EVENT: &str = "org.matrix.msc2762.send.event";
const READ_EVENT: &str = "org.matrix.msc2762.read.event";
const SEND_STATE_EVENT: &str = "org.matrix.msc2762.send.state_event";
const READ_STATE_EVENT: &str = "org.matrix.msc2762.read.state_event";
const SEND_TO_DEVICE: &str = "org.matrix.msc3819.send.to_device";
const READ_TO_DEVICE: &str = "org.matrix.msc3819.read.to_device";
const REQUIRES_CLIENT: &str = "require_client";
const REQUIRES_CLIENT_ELEMENT: &str = "io.element.require_client";
const SEND_DELAYED_EVENT: &str = "org.matrix.msc4157.send.delayed_event";
const UPDATE_DELAYED_EVENT: &str = "org.matrix.msc4157.update.delayed_event";

/// The set of capabilities a widget asked for or was granted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Filters for events the widget may observe.
    pub read: Vec<EventFilter>,
    /// Filters for events the widget may send.
    pub send: Vec<EventFilter>,
    /// The widget needs client-level operations, not just room-level ones.
    pub requires_client: bool,
    /// The widget may schedule delayed events (MSC4157).
    pub send_delayed_event: bool,
    /// The widget may update or cancel delayed events (MSC4157).
    pub update_delayed_event: bool,
}

impl Capabilities {
    /// Parses a list of capability strings.
    ///
    /// Unrecognized or malformed entries are skipped; the widget simply does
    /// not gain that capability.
    pub fn parse(capabilities: &[String]) -> Self {
        let mut caps = Capabilities::default();

        for capability in capabilities {
            match capability.as_str() {
                REQUIRES_CLIENT | REQUIRES_CLIENT_ELEMENT => caps.requires_client = true,
                SEND_DELAYED_EVENT => caps.send_delayed_event = true,
                UPDATE_DELAYED_EVENT => caps.update_delayed_event = true,
                other => match parse_filter_capability(other) {
                    Some((Operation::Send, filter)) => caps.send.push(filter),
                    Some((Operation::Read, filter)) => caps.read.push(filter),
                    None => {
                        debug!(capability = other, "Dropping unrecognized capability");
                    }
                },
            }
        }

        caps
    }

    /// Whether the approved set admits sending an event of the given type,
    /// with the given state key for state events.
    pub fn can_send(
        &self,
        event_type: &str,
        state_key: Option<&str>,
        context: &FilterContext,
    ) -> bool {
        if is_crypto_event_type(event_type) {
            return false;
        }

        match state_key {
            Some(state_key) => self.send.iter().any(|filter| match filter {
                EventFilter::State(filter) => filter.matches(event_type, state_key, context),
                _ => false,
            }),
            None => self.send.iter().any(|filter| match filter {
                EventFilter::MessageLike(filter) => filter.matches_event_type(event_type),
                _ => false,
            }),
        }
    }

    /// Whether the approved set admits sending a to-device message of the
    /// given type.
    pub fn can_send_to_device(&self, event_type: &str) -> bool {
        !is_crypto_event_type(event_type)
            && self.send.iter().any(|filter| match filter {
                EventFilter::ToDevice(filter) => filter.matches_event_type(event_type),
                _ => false,
            })
    }

    /// Whether any read filter matches the given event.
    pub fn can_read(&self, input: &FilterInput<'_>, context: &FilterContext) -> bool {
        !is_crypto_event_type(input.event_type())
            && self.read.iter().any(|filter| filter.matches(input, context))
    }

    /// Whether the approved set admits a read of events described by a
    /// `read_events` request.
    ///
    /// A request without an event type enumerates everything the read
    /// filters admit; it is allowed whenever any read filter is granted,
    /// since every returned event is still filtered individually.
    pub fn can_read_type(
        &self,
        event_type: Option<&str>,
        state_key: Option<&str>,
        context: &FilterContext,
    ) -> bool {
        let Some(event_type) = event_type else {
            return !self.read.is_empty();
        };

        if is_crypto_event_type(event_type) {
            return false;
        }

        match state_key {
            Some(state_key) => self.read.iter().any(|filter| match filter {
                EventFilter::State(filter) => filter.matches(event_type, state_key, context),
                _ => false,
            }),
            None => self.read.iter().any(|filter| filter.matches_event_type(event_type)),
        }
    }

    /// Returns the part of `self` also present in `bound`: filters that
    /// `bound` contains (by equality), flags that `bound` also has.
    pub fn intersect(&self, bound: &Capabilities) -> Capabilities {
        Capabilities {
            read: self.read.iter().filter(|f| bound.read.contains(f)).cloned().collect(),
            send: self.send.iter().filter(|f| bound.send.contains(f)).cloned().collect(),
            requires_client: self.requires_client && bound.requires_client,
            send_delayed_event: self.send_delayed_event && bound.send_delayed_event,
            update_delayed_event: self.update_delayed_event && bound.update_delayed_event,
        }
    }
}

enum Operation {
    Send,
    Read,
}

fn parse_filter_capability(capability: &str) -> Option<(Operation, EventFilter)> {
    // User ids contain `:`, so only the first one separates the prefix.
    let (prefix, spec) = capability.split_once(':')?;

    let (operation, class) = match prefix {
        SEND_EVENT => (Operation::Send, FilterClass::MessageLike),
        READ_EVENT => (Operation::Read, FilterClass::MessageLike),
        SEND_STATE_EVENT => (Operation::Send, FilterClass::State),
        READ_STATE_EVENT => (Operation::Read, FilterClass::State),
        SEND_TO_DEVICE => (Operation::Send, FilterClass::ToDevice),
        READ_TO_DEVICE => (Operation::Read, FilterClass::ToDevice),
        other if other.starts_with("io.element.") && other.contains(".send.") => {
            (Operation::Send, FilterClass::MessageLike)
        }
        other if other.starts_with("io.element.") && other.contains(".read.") => {
            (Operation::Read, FilterClass::MessageLike)
        }
        _ => return None,
    };

    let filter = match class {
        FilterClass::MessageLike => match spec.split_once('#') {
            Some((ROOM_MESSAGE_TYPE, msgtype)) => EventFilter::MessageLike(
                MessageLikeEventFilter::RoomMessageWithMsgtype(msgtype.to_owned()),
            ),
            // A msgtype on anything else is meaningless, keep the type only.
            Some((event_type, _)) => {
                EventFilter::MessageLike(MessageLikeEventFilter::WithType(event_type.to_owned()))
            }
            None => EventFilter::MessageLike(MessageLikeEventFilter::WithType(spec.to_owned())),
        },
        FilterClass::State => match spec.split_once('|') {
            Some((event_type, state_key)) => EventFilter::State(
                StateEventFilter::WithTypeAndStateKey(event_type.to_owned(), state_key.to_owned()),
            ),
            None => EventFilter::State(StateEventFilter::WithType(spec.to_owned())),
        },
        FilterClass::ToDevice => EventFilter::ToDevice(ToDeviceEventFilter::new(spec)),
    };

    Some((operation, filter))
}

enum FilterClass {
    MessageLike,
    State,
    ToDevice,
}

fn filter_spec(filter: &EventFilter) -> String {
    match filter {
        EventFilter::MessageLike(MessageLikeEventFilter::WithType(event_type)) => {
            event_type.clone()
        }
        EventFilter::MessageLike(MessageLikeEventFilter::RoomMessageWithMsgtype(msgtype)) => {
            format!("{ROOM_MESSAGE_TYPE}#{msgtype}")
        }
        EventFilter::State(StateEventFilter::WithType(event_type)) => event_type.clone(),
        EventFilter::State(StateEventFilter::WithTypeAndStateKey(event_type, state_key)) => {
            format!("{event_type}|{state_key}")
        }
        EventFilter::ToDevice(filter) => filter.event_type.clone(),
    }
}

fn operation_prefix(operation: Operation, filter: &EventFilter) -> &'static str {
    match (operation, filter) {
        (Operation::Send, EventFilter::MessageLike(_)) => SEND_EVENT,
        (Operation::Read, EventFilter::MessageLike(_)) => READ_EVENT,
        (Operation::Send, EventFilter::State(_)) => SEND_STATE_EVENT,
        (Operation::Read, EventFilter::State(_)) => READ_STATE_EVENT,
        (Operation::Send, EventFilter::ToDevice(_)) => SEND_TO_DEVICE,
        (Operation::Read, EventFilter::ToDevice(_)) => READ_TO_DEVICE,
    }
}

impl From<&Capabilities> for Vec<String> {
    fn from(caps: &Capabilities) -> Self {
        let mut strings = Vec::new();

        if caps.requires_client {
            strings.push(REQUIRES_CLIENT.to_owned());
        }
        if caps.send_delayed_event {
            strings.push(SEND_DELAYED_EVENT.to_owned());
        }
        if caps.update_delayed_event {
            strings.push(UPDATE_DELAYED_EVENT.to_owned());
        }
        for filter in &caps.read {
            strings
                .push(format!("{}:{}", operation_prefix(Operation::Read, filter), filter_spec(filter)));
        }
        for filter in &caps.send {
            strings
                .push(format!("{}:{}", operation_prefix(Operation::Send, filter), filter_spec(filter)));
        }

        strings
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Vec::<String>::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        Ok(Capabilities::parse(&strings))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{OwnedDeviceId, UserId};

    use super::Capabilities;
    use crate::filter::{
        EventFilter, FilterContext, MessageLikeEventFilter, StateEventFilter, ToDeviceEventFilter,
    };

    fn context() -> FilterContext {
        FilterContext::new(
            UserId::parse("@alice:example.org").unwrap(),
            OwnedDeviceId::from("ABCDEFGH"),
        )
    }

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn parse_canonical_forms() {
        let caps = Capabilities::parse(&strings(&[
            "org.matrix.msc2762.send.event:m.room.message#m.text",
            "org.matrix.msc2762.send.state_event:m.room.member|@u:x",
            "org.matrix.msc2762.read.event:m.reaction",
            "org.matrix.msc2762.read.state_event:m.room.topic",
            "org.matrix.msc3819.send.to_device:io.element.call.signal",
            "require_client",
            "org.matrix.msc4157.send.delayed_event",
        ]));

        assert_eq!(
            caps.send,
            vec![
                EventFilter::MessageLike(MessageLikeEventFilter::RoomMessageWithMsgtype(
                    "m.text".to_owned()
                )),
                EventFilter::State(StateEventFilter::WithTypeAndStateKey(
                    "m.room.member".to_owned(),
                    "@u:x".to_owned()
                )),
                EventFilter::ToDevice(ToDeviceEventFilter::new("io.element.call.signal")),
            ]
        );
        assert_eq!(
            caps.read,
            vec![
                EventFilter::MessageLike(MessageLikeEventFilter::WithType("m.reaction".to_owned())),
                EventFilter::State(StateEventFilter::WithType("m.room.topic".to_owned())),
            ]
        );
        assert!(caps.requires_client);
        assert!(caps.send_delayed_event);
        assert!(!caps.update_delayed_event);
    }

    #[test]
    fn state_key_splits_on_first_pipe_only_and_type_on_first_colon() {
        // The state key itself contains a colon (a user id).
        let caps = Capabilities::parse(&strings(&[
            "org.matrix.msc2762.send.state_event:m.room.member|@user:example.org",
        ]));
        assert_eq!(
            caps.send,
            vec![EventFilter::State(StateEventFilter::WithTypeAndStateKey(
                "m.room.member".to_owned(),
                "@user:example.org".to_owned()
            ))]
        );
    }

    #[test]
    fn msgtype_on_non_room_message_type_is_ignored() {
        let caps = Capabilities::parse(&strings(&["org.matrix.msc2762.send.event:m.sticker#m.text"]));
        assert_eq!(
            caps.send,
            vec![EventFilter::MessageLike(MessageLikeEventFilter::WithType("m.sticker".to_owned()))]
        );
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let caps = Capabilities::parse(&strings(&[
            "org.matrix.msc2762.send.event",
            "com.example.unknown:m.room.message",
            "",
            "org.matrix.msc2762.read.event:m.reaction",
        ]));
        assert!(caps.send.is_empty());
        assert_eq!(caps.read.len(), 1);
    }

    #[test]
    fn element_prefixed_capabilities_map_to_event_filters() {
        let caps = Capabilities::parse(&strings(&[
            "io.element.widget.send.event:io.element.ping",
            "io.element.widget.read.event:io.element.pong",
        ]));
        assert_eq!(
            caps.send,
            vec![EventFilter::MessageLike(MessageLikeEventFilter::WithType(
                "io.element.ping".to_owned()
            ))]
        );
        assert_eq!(
            caps.read,
            vec![EventFilter::MessageLike(MessageLikeEventFilter::WithType(
                "io.element.pong".to_owned()
            ))]
        );
    }

    #[test]
    fn serialization_round_trips() {
        let input = strings(&[
            "org.matrix.msc2762.send.event:m.room.message#m.text",
            "org.matrix.msc2762.send.state_event:m.room.member|@u:x",
            "require_client",
            "org.matrix.msc4157.send.delayed_event",
        ]);
        let caps = Capabilities::parse(&input);

        let mut serialized = Vec::<String>::from(&caps);
        serialized.sort();
        let mut expected = input.clone();
        expected.sort();
        assert_eq!(serialized, expected);

        // parse ∘ serialize is idempotent.
        assert_eq!(Capabilities::parse(&Vec::<String>::from(&caps)), caps);
    }

    #[test]
    fn can_send_distinguishes_state_and_message_like() {
        let ctx = context();
        let caps = Capabilities::parse(&strings(&[
            "org.matrix.msc2762.send.event:m.room.message",
            "org.matrix.msc2762.send.state_event:m.room.topic",
        ]));

        assert!(caps.can_send("m.room.message", None, &ctx));
        assert!(caps.can_send("m.room.topic", Some(""), &ctx));
        // No state grant for message types, no message grant for state types.
        assert!(!caps.can_send("m.room.message", Some(""), &ctx));
        assert!(!caps.can_send("m.room.topic", None, &ctx));
    }

    #[test]
    fn can_send_never_admits_crypto_events() {
        let ctx = context();
        let caps = Capabilities::parse(&strings(&["org.matrix.msc2762.send.event:m.room"]));

        assert!(caps.can_send("m.room.message", None, &ctx));
        assert!(!caps.can_send("m.room.encrypted", None, &ctx));
        assert!(!caps.can_send_to_device("m.room_key"));
    }

    #[test]
    fn can_read_type_without_type_needs_any_read_grant() {
        let ctx = context();
        let none = Capabilities::default();
        assert!(!none.can_read_type(None, None, &ctx));

        let caps = Capabilities::parse(&strings(&["org.matrix.msc2762.read.event:m.reaction"]));
        assert!(caps.can_read_type(None, None, &ctx));
        assert!(caps.can_read_type(Some("m.reaction"), None, &ctx));
        assert!(!caps.can_read_type(Some("m.room.topic"), None, &ctx));
    }

    #[test]
    fn intersect_keeps_only_shared_grants() {
        let requested = Capabilities::parse(&strings(&[
            "org.matrix.msc2762.send.event:m.room.message",
            "org.matrix.msc4157.send.delayed_event",
        ]));
        let granted = Capabilities::parse(&strings(&[
            "org.matrix.msc2762.send.event:m.room.message",
            "org.matrix.msc2762.send.event:m.sticker",
            "org.matrix.msc4157.update.delayed_event",
        ]));

        let approved = granted.intersect(&requested);
        assert_eq!(
            approved.send,
            vec![EventFilter::MessageLike(MessageLikeEventFilter::WithType(
                "m.room.message".to_owned()
            ))]
        );
        assert!(!approved.send_delayed_event);
        assert!(!approved.update_delayed_event);
    }
}
