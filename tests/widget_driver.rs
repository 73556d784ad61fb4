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

//! End-to-end tests driving the widget API over its channels.

use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use matrix_widget_driver::{
    messages::{
        from_widget::{
            ReadEventsRequest, SendEventRequest, SendEventResponse, SendToDeviceRequest,
            UpdateDelayedEventRequest,
        },
        openid::OpenIdCredentials,
    },
    ruma::{EventId, OwnedDeviceId, OwnedUserId, RoomId, UserId},
    run_widget_driver, Capabilities, CapabilitiesProvider, Comm, Error, MatrixDriver,
    OpenIdStatus, SyncUpdate, Widget, WidgetSettings,
};
use serde_json::{json, Value as JsonValue};

struct StubMatrix {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    readable_events: Vec<JsonValue>,
    sent: Mutex<Vec<SendEventRequest>>,
}

impl StubMatrix {
    fn new() -> Self {
        Self {
            user_id: UserId::parse("@alice:example.org").unwrap(),
            device_id: OwnedDeviceId::from("ABCDEFGH"),
            readable_events: Vec::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn with_readable_events(events: Vec<JsonValue>) -> Self {
        Self { readable_events: events, ..Self::new() }
    }
}

#[async_trait]
impl MatrixDriver for StubMatrix {
    fn user_id(&self) -> OwnedUserId {
        self.user_id.clone()
    }

    fn device_id(&self) -> OwnedDeviceId {
        self.device_id.clone()
    }

    async fn send_event(&self, request: SendEventRequest) -> Result<SendEventResponse, Error> {
        self.sent.lock().unwrap().push(request);
        Ok(SendEventResponse {
            event_id: Some(EventId::parse("$event:example.org").unwrap()),
            room_id: Some(RoomId::parse("!room:example.org").unwrap()),
            delay_id: None,
        })
    }

    async fn read_events(&self, _request: ReadEventsRequest) -> Result<Vec<JsonValue>, Error> {
        Ok(self.readable_events.clone())
    }

    async fn send_to_device(&self, _request: SendToDeviceRequest) -> Result<(), Error> {
        Ok(())
    }

    async fn update_delayed_event(
        &self,
        _request: UpdateDelayedEventRequest,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn request_open_id(&self) -> Result<OpenIdStatus, Error> {
        Ok(OpenIdStatus::Allowed(OpenIdCredentials {
            access_token: "tok".to_owned(),
            expires_in: 3600,
            matrix_server_name: "example.org".to_owned(),
            token_type: "Bearer".to_owned(),
        }))
    }

    async fn navigate(&self, _uri: &str) -> Result<(), Error> {
        Ok(())
    }
}

struct ApproveEverything;

#[async_trait]
impl CapabilitiesProvider for ApproveEverything {
    async fn acquire_capabilities(&self, requested: Capabilities) -> Capabilities {
        requested
    }
}

struct Harness {
    widget_tx: async_channel::Sender<String>,
    client_rx: async_channel::Receiver<String>,
    sync_tx: async_channel::Sender<SyncUpdate>,
}

impl Harness {
    fn start(matrix: StubMatrix) -> Self {
        let (widget_tx, from_rx) = async_channel::unbounded();
        let (to_tx, client_rx) = async_channel::unbounded();
        let (sync_tx, sync_rx) = async_channel::unbounded();

        let widget = Widget {
            settings: WidgetSettings::new("w1".to_owned(), false, "https://widget.example.org/")
                .unwrap(),
            comm: Comm { from: from_rx, to: to_tx },
        };
        tokio::spawn(run_widget_driver(matrix, ApproveEverything, widget, sync_rx));

        Self { widget_tx, client_rx, sync_tx }
    }

    async fn send(&self, message: JsonValue) {
        self.widget_tx.send(message.to_string()).await.unwrap();
    }

    async fn recv(&self) -> JsonValue {
        let raw = tokio::time::timeout(Duration::from_secs(5), self.client_rx.recv())
            .await
            .expect("timed out waiting for a driver message")
            .expect("driver closed the transport");
        serde_json::from_str(&raw).unwrap()
    }

    /// Answers the driver's capability probe with the given ask and waits
    /// until the approval round-trip completed.
    async fn negotiate(&self, capabilities: &[&str]) {
        let probe = self.recv().await;
        assert_eq!(probe["api"], "ToWidget");
        assert_eq!(probe["action"], "capabilities");
        let request_id = probe["requestId"].as_str().unwrap().to_owned();

        self.send(json!({
            "api": "ToWidget",
            "requestId": request_id,
            "widgetId": "w1",
            "action": "capabilities",
            "data": { "capabilities": capabilities },
        }))
        .await;

        // A ping whose reply proves the approval was processed.
        self.send(json!({
            "api": "FromWidget",
            "requestId": "sync-ping",
            "widgetId": "w1",
            "action": "supported_api_versions",
            "data": {},
        }))
        .await;
        let pong = self.recv().await;
        assert_eq!(pong["requestId"], "sync-ping");
    }
}

#[tokio::test]
async fn send_event_round_trip() {
    let harness = Harness::start(StubMatrix::new());
    harness.negotiate(&["org.matrix.msc2762.send.event:m.room.message"]).await;

    harness
        .send(json!({
            "api": "FromWidget",
            "requestId": "r1",
            "widgetId": "w1",
            "action": "send_event",
            "data": { "type": "m.room.message", "content": { "body": "hi" } },
        }))
        .await;

    let reply = harness.recv().await;
    assert_eq!(reply["api"], "ToWidget");
    assert_eq!(reply["requestId"], "r1");
    assert_eq!(reply["action"], "send_event");
    assert_eq!(reply["data"]["event_id"], "$event:example.org");
    assert_eq!(reply["data"]["room_id"], "!room:example.org");
}

#[tokio::test]
async fn send_event_is_forbidden_before_negotiation() {
    let harness = Harness::start(StubMatrix::new());

    // The probe goes out first; leave it unanswered.
    let probe = harness.recv().await;
    assert_eq!(probe["action"], "capabilities");

    harness
        .send(json!({
            "api": "FromWidget",
            "requestId": "r1",
            "widgetId": "w1",
            "action": "send_event",
            "data": { "type": "m.room.message", "content": { "body": "hi" } },
        }))
        .await;

    let reply = harness.recv().await;
    assert_eq!(reply["action"], "error");
    assert_eq!(reply["requestId"], "r1");
    assert_eq!(reply["data"]["code"], "M_FORBIDDEN");
}

#[tokio::test]
async fn sync_events_are_filtered_before_forwarding() {
    let harness = Harness::start(StubMatrix::new());
    harness.negotiate(&["org.matrix.msc2762.read.event:m.room.message"]).await;

    let allowed = json!({
        "type": "m.room.message",
        "sender": "@bob:example.org",
        "content": { "msgtype": "m.text", "body": "hello" },
    });
    let crypto = json!({ "type": "m.room.encrypted", "content": {} });
    let unrelated = json!({ "type": "m.reaction", "content": {} });
    let trailing = json!({
        "type": "m.room.message",
        "sender": "@bob:example.org",
        "content": { "msgtype": "m.text", "body": "again" },
    });

    harness.sync_tx.send(SyncUpdate::NewEvent(allowed.clone())).await.unwrap();
    harness.sync_tx.send(SyncUpdate::NewEvent(crypto)).await.unwrap();
    harness.sync_tx.send(SyncUpdate::NewEvent(unrelated)).await.unwrap();
    harness.sync_tx.send(SyncUpdate::NewEvent(trailing.clone())).await.unwrap();

    let first = harness.recv().await;
    assert_eq!(first["action"], "notify_new_event");
    assert!(first.get("requestId").is_none());
    assert_eq!(first["data"], allowed);

    // The denied ones left no trace; the next frame is the trailing event.
    let second = harness.recv().await;
    assert_eq!(second["data"], trailing);
}

#[tokio::test]
async fn openid_flow_delivers_credentials() {
    let harness = Harness::start(StubMatrix::new());
    harness.negotiate(&[]).await;

    harness
        .send(json!({
            "api": "FromWidget",
            "requestId": "r1",
            "widgetId": "w1",
            "action": "get_openid",
            "data": {},
        }))
        .await;

    let reply = harness.recv().await;
    assert_eq!(reply["action"], "openid_credentials");
    assert_eq!(reply["requestId"], "r1");
    assert_eq!(reply["data"]["state"], "allowed");
    assert_eq!(reply["data"]["access_token"], "tok");
    assert_eq!(reply["data"]["matrix_server_name"], "example.org");
    assert_eq!(reply["data"]["original_request_id"], "r1");
}

#[tokio::test]
async fn read_events_results_are_filtered() {
    let matrix = StubMatrix::with_readable_events(vec![
        json!({ "type": "m.room.message", "content": { "msgtype": "m.text", "body": "ok" } }),
        json!({ "type": "m.room.encrypted", "content": {} }),
        json!({ "type": "m.reaction", "content": {} }),
    ]);
    let harness = Harness::start(matrix);
    harness.negotiate(&["org.matrix.msc2762.read.event:m.room.message"]).await;

    harness
        .send(json!({
            "api": "FromWidget",
            "requestId": "r1",
            "widgetId": "w1",
            "action": "read_events",
            "data": { "type": "m.room.message" },
        }))
        .await;

    let reply = harness.recv().await;
    assert_eq!(reply["action"], "read_events");
    let events = reply["data"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "m.room.message");
}

#[tokio::test]
async fn navigate_round_trip() {
    let harness = Harness::start(StubMatrix::new());

    // Ignore the capability probe, navigate needs no negotiation.
    let _probe = harness.recv().await;

    harness
        .send(json!({
            "api": "FromWidget",
            "requestId": "r1",
            "widgetId": "w1",
            "action": "navigate",
            "data": { "uri": "https://matrix.to/#/#room:example.org" },
        }))
        .await;

    let reply = harness.recv().await;
    assert_eq!(reply["action"], "navigate");
    assert_eq!(reply["requestId"], "r1");
    assert_eq!(reply["data"], json!({}));
}

#[tokio::test]
async fn unparseable_frames_are_dropped() {
    let harness = Harness::start(StubMatrix::new());
    let _probe = harness.recv().await;

    harness.widget_tx.send("this is not json".to_owned()).await.unwrap();

    // The driver is still alive and answers the next request.
    harness
        .send(json!({
            "api": "FromWidget",
            "requestId": "r1",
            "widgetId": "w1",
            "action": "supported_api_versions",
            "data": {},
        }))
        .await;
    let reply = harness.recv().await;
    assert_eq!(reply["action"], "supported_api_versions");
    assert_eq!(
        reply["data"]["supported_versions"],
        json!(["0.0.1", "0.0.2", "MSC2762", "MSC2871", "MSC3819", "MSC4157"])
    );
}

#[tokio::test]
async fn closing_the_widget_pipe_stops_the_driver() {
    let harness = Harness::start(StubMatrix::new());
    let _probe = harness.recv().await;

    harness.widget_tx.close();

    // The driver closes its side on the way out.
    let closed = tokio::time::timeout(Duration::from_secs(5), harness.client_rx.recv())
        .await
        .expect("timed out waiting for the transport to close");
    assert!(closed.is_err());
}
