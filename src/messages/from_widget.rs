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

//! Payloads of the requests a widget sends to the client.

use std::collections::BTreeMap;

use ruma::{OwnedEventId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Action names a widget may send.
pub mod action {
    /// Probe for the API versions the client implements.
    pub const SUPPORTED_API_VERSIONS: &str = "supported_api_versions";
    /// The widget finished loading its content.
    pub const CONTENT_LOADED: &str = "content_loaded";
    /// Request OpenID credentials for the acting user.
    pub const GET_OPENID: &str = "get_openid";
    /// Send a room or state event.
    pub const SEND_EVENT: &str = "send_event";
    /// Read room or state events.
    pub const READ_EVENTS: &str = "read_events";
    /// Send a to-device message (MSC3819).
    pub const SEND_TO_DEVICE: &str = "send_to_device";
    /// Update a scheduled delayed event (MSC4157).
    pub const UPDATE_DELAYED_EVENT: &str = "update_delayed_event";
    /// Ask the client to open a URI.
    pub const NAVIGATE: &str = "navigate";
}

/// The API versions this driver implements.
pub const SUPPORTED_API_VERSIONS: &[&str] =
    &["0.0.1", "0.0.2", "MSC2762", "MSC2871", "MSC3819", "MSC4157"];

/// Response to a `supported_api_versions` probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupportedApiVersionsResponse {
    /// The versions the client implements.
    pub supported_versions: Vec<String>,
}

impl Default for SupportedApiVersionsResponse {
    fn default() -> Self {
        Self {
            supported_versions: SUPPORTED_API_VERSIONS.iter().map(|v| (*v).to_owned()).collect(),
        }
    }
}

/// Body of a `send_event` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendEventRequest {
    /// The type of the event to send.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The state key; present makes this a state event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// The event content, opaque to the driver.
    pub content: JsonValue,
    /// Delay in milliseconds before the homeserver delivers the event
    /// (MSC4157). Requires the `send_delayed_event` capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

/// Response to a `send_event` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendEventResponse {
    /// Id of the sent event. Absent for delayed events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,
    /// The room the event was sent to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
    /// Id of the scheduled delayed event (MSC4157).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_id: Option<String>,
}

/// Body of a `read_events` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadEventsRequest {
    /// The type of events to read. Absent reads anything the approved
    /// filters admit.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Restricts a state read to one state key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Maximum number of events to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Response to a `read_events` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadEventsResponse {
    /// The matching events, raw.
    pub events: Vec<JsonValue>,
}

/// Body of a `send_to_device` request (MSC3819).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendToDeviceRequest {
    /// The type of the to-device message.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Whether the client should encrypt the payloads.
    pub encrypted: bool,
    /// Per-user, per-device message contents.
    pub messages: BTreeMap<String, BTreeMap<String, JsonValue>>,
}

/// What to do with a scheduled delayed event (MSC4157).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateDelayedEventAction {
    /// Drop the event without sending.
    Cancel,
    /// Restart the delay from now.
    Restart,
    /// Send the event immediately.
    Send,
}

/// Body of an `update_delayed_event` request (MSC4157).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateDelayedEventRequest {
    /// The operation to apply.
    pub action: UpdateDelayedEventAction,
    /// The delayed event to apply it to.
    pub delay_id: String,
}

/// Body of a `navigate` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigateRequest {
    /// The `matrix:` or `https://matrix.to` URI to open.
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ReadEventsRequest, SendEventRequest, SendToDeviceRequest, SupportedApiVersionsResponse,
        UpdateDelayedEventAction, UpdateDelayedEventRequest,
    };

    #[test]
    fn send_event_request_uses_wire_field_names() {
        let request: SendEventRequest = serde_json::from_value(json!({
            "type": "m.room.topic",
            "state_key": "",
            "content": { "topic": "hello" },
        }))
        .unwrap();
        assert_eq!(request.event_type, "m.room.topic");
        assert_eq!(request.state_key.as_deref(), Some(""));
        assert_eq!(request.delay, None);
    }

    #[test]
    fn read_events_request_fields_are_optional() {
        let request: ReadEventsRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request, ReadEventsRequest::default());
    }

    #[test]
    fn send_to_device_request_nests_messages_by_user_and_device() {
        let request: SendToDeviceRequest = serde_json::from_value(json!({
            "type": "io.element.call.signal",
            "encrypted": false,
            "messages": { "@u:x": { "DEV": { "k": "v" } } },
        }))
        .unwrap();
        assert_eq!(request.messages["@u:x"]["DEV"]["k"], "v");
    }

    #[test]
    fn update_delayed_event_action_is_lowercase() {
        let request: UpdateDelayedEventRequest =
            serde_json::from_value(json!({ "action": "cancel", "delay_id": "d1" })).unwrap();
        assert_eq!(request.action, UpdateDelayedEventAction::Cancel);
    }

    #[test]
    fn supported_versions_default_lists_implemented_mscs() {
        let response = SupportedApiVersionsResponse::default();
        assert_eq!(
            response.supported_versions,
            ["0.0.1", "0.0.2", "MSC2762", "MSC2871", "MSC3819", "MSC4157"]
        );
    }
}
