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

//! Orchestration of the widget state machine.
//!
//! Everything impure lives here: the transport loop, the calls into the
//! embedding Matrix client, the capability prompt, and the forwarding of
//! sync updates. The reducer decides, this module executes.

use std::collections::VecDeque;

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedUserId};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    capabilities::Capabilities,
    error::{Error, ErrorBody},
    filter::{FilterEngine, FilterInput},
    machine::{Action, WidgetMachine},
    messages::{
        from_widget::{
            self, ReadEventsRequest, ReadEventsResponse, SendEventRequest, SendEventResponse,
            SendToDeviceRequest, UpdateDelayedEventRequest,
        },
        openid::{OpenIdCredentials, OpenIdResponse, OpenIdState},
        to_widget::{self, CapabilitiesPayload},
        Message, MessageKind,
    },
    Comm, Widget,
};

/// Update delivered by the client's sync loop.
#[derive(Clone, Debug)]
pub enum SyncUpdate {
    /// A new message-like event appeared in the room timeline.
    NewEvent(JsonValue),
    /// A state entry changed.
    StateUpdate(JsonValue),
    /// A to-device message arrived for this client.
    ToDevice(JsonValue),
}

/// The client's answer to an OpenID token request.
#[derive(Clone, Debug, PartialEq)]
pub enum OpenIdStatus {
    /// The user allowed it; here is the token.
    Allowed(OpenIdCredentials),
    /// The user declined.
    Blocked,
}

/// Matrix-side operations the driver needs from the embedding client.
#[async_trait]
pub trait MatrixDriver: Send + Sync + 'static {
    /// The user on whose behalf the widget acts.
    fn user_id(&self) -> OwnedUserId;

    /// The device this driver runs on.
    fn device_id(&self) -> OwnedDeviceId;

    /// Sends a room or state event and returns its id.
    async fn send_event(&self, request: SendEventRequest) -> Result<SendEventResponse, Error>;

    /// Reads room or state events, newest first.
    async fn read_events(&self, request: ReadEventsRequest) -> Result<Vec<JsonValue>, Error>;

    /// Sends a to-device message.
    async fn send_to_device(&self, request: SendToDeviceRequest) -> Result<(), Error>;

    /// Updates a scheduled delayed event (MSC4157).
    async fn update_delayed_event(&self, request: UpdateDelayedEventRequest) -> Result<(), Error>;

    /// Asks the homeserver for an OpenID token, prompting the user first if
    /// the client wants to.
    async fn request_open_id(&self) -> Result<OpenIdStatus, Error>;

    /// Opens a `matrix:` or `https://matrix.to` URI in the client.
    async fn navigate(&self, uri: &str) -> Result<(), Error>;
}

/// Asks the user to approve a widget's capability ask.
#[async_trait]
pub trait CapabilitiesProvider: Send + Sync + 'static {
    /// Returns the approved subset of `requested`.
    async fn acquire_capabilities(&self, requested: Capabilities) -> Capabilities;
}

/// Runs the widget API for the given widget until it disconnects.
///
/// Frames arriving on `widget.comm.from` are fed through the state machine;
/// sync updates that pass the approved read filters are forwarded as
/// notifications. The function returns once the incoming pipe closes, at
/// which point all subscriptions are dropped and the outgoing pipe is
/// closed.
pub async fn run_widget_driver(
    matrix: impl MatrixDriver,
    capabilities_provider: impl CapabilitiesProvider,
    widget: Widget,
    sync_updates: async_channel::Receiver<SyncUpdate>,
) {
    let Widget { settings, comm: Comm { from, to } } = widget;

    let machine = WidgetMachine::new(settings.id().clone(), matrix.user_id(), matrix.device_id());
    let mut driver = WidgetDriver {
        matrix,
        capabilities_provider,
        widget_id: settings.id().clone(),
        to_widget: to,
        machine: Some(machine),
        engine: FilterEngine::default(),
        capabilities_request_id: None,
        negotiation_started: false,
    };

    if !settings.init_after_content_load() {
        driver.start_negotiation().await;
    }

    let mut sync_open = true;
    loop {
        tokio::select! {
            raw = from.recv() => match raw {
                Ok(raw) => driver.handle_raw_message(&raw).await,
                Err(_) => break,
            },
            update = sync_updates.recv(), if sync_open => match update {
                Ok(update) => driver.handle_sync_update(update).await,
                Err(_) => sync_open = false,
            },
        }
    }

    driver.to_widget.close();
}

struct WidgetDriver<M, C> {
    matrix: M,
    capabilities_provider: C,
    widget_id: String,
    to_widget: async_channel::Sender<String>,
    machine: Option<WidgetMachine>,
    engine: FilterEngine,
    capabilities_request_id: Option<String>,
    negotiation_started: bool,
}

impl<M: MatrixDriver, C: CapabilitiesProvider> WidgetDriver<M, C> {
    /// Runs one reducer entry point, swapping the machine value atomically.
    fn with_machine(
        &mut self,
        f: impl FnOnce(WidgetMachine) -> (WidgetMachine, Vec<Action>),
    ) -> Vec<Action> {
        let machine = self.machine.take().expect("machine is always put back");
        let (machine, actions) = f(machine);
        self.machine = Some(machine);
        actions
    }

    async fn handle_raw_message(&mut self, raw: &str) {
        let message: Message = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(error) => {
                debug!(?error, "Dropping unparseable widget frame");
                return;
            }
        };

        match &message.kind {
            MessageKind::FromWidget { action, .. } => {
                if action == from_widget::action::CONTENT_LOADED && !self.negotiation_started {
                    self.start_negotiation().await;
                }
                let actions = self.with_machine(|machine| machine.process_from_widget(message));
                self.dispatch(actions).await;
            }
            MessageKind::ToWidget { .. } => self.handle_widget_response(message).await,
        }
    }

    /// Asks the widget which capabilities it wants.
    async fn start_negotiation(&mut self) {
        self.negotiation_started = true;
        let request_id = Uuid::new_v4().to_string();
        let message = Message::to_widget(
            Some(request_id.clone()),
            self.widget_id.clone(),
            to_widget::action::CAPABILITIES,
            json!({}),
        );
        self.capabilities_request_id = Some(request_id);
        self.send_to_widget(&message).await;
    }

    /// Handles the widget's answer to a request of ours. The capability
    /// probe is the only such request this driver sends.
    async fn handle_widget_response(&mut self, message: Message) {
        let MessageKind::ToWidget { action, data } = &message.kind else { return };

        if action != to_widget::action::CAPABILITIES {
            debug!(%action, "Ignoring widget response to an unknown request");
            return;
        }
        if self.capabilities_request_id.as_deref() != message.header.request_id.as_deref() {
            warn!("Widget response does not match the outstanding capability probe");
            return;
        }
        self.capabilities_request_id = None;

        let requested = match serde_json::from_value::<CapabilitiesPayload>(data.clone()) {
            Ok(payload) => payload.capabilities,
            Err(error) => {
                warn!(?error, "Widget sent a malformed capabilities response");
                return;
            }
        };

        let actions = self.with_machine(|machine| machine.process_capability_request(requested));
        self.dispatch(actions).await;
    }

    async fn handle_sync_update(&mut self, update: SyncUpdate) {
        if !self.passes_filters(&update) {
            return;
        }

        let (action, event) = match update {
            SyncUpdate::NewEvent(event) => (to_widget::action::NOTIFY_NEW_EVENT, event),
            SyncUpdate::StateUpdate(event) => (to_widget::action::NOTIFY_STATE_UPDATE, event),
            SyncUpdate::ToDevice(event) => (to_widget::action::NOTIFY_TO_DEVICE, event),
        };
        let message = Message::to_widget(None, self.widget_id.clone(), action, event);
        self.send_to_widget(&message).await;
    }

    fn passes_filters(&self, update: &SyncUpdate) -> bool {
        let input = match update {
            SyncUpdate::NewEvent(event) | SyncUpdate::StateUpdate(event) => {
                FilterInput::from_room_event(event)
            }
            SyncUpdate::ToDevice(event) => FilterInput::from_to_device_event(event),
        };
        match input {
            Some(input) => self.engine.matches(&input),
            None => false,
        }
    }

    /// Executes reducer actions in emission order. Actions produced by
    /// follow-up reducer calls are queued behind the current batch, never
    /// interleaved into it.
    async fn dispatch(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            let follow_up = self.execute(action).await;
            queue.extend(follow_up);
        }
    }

    async fn execute(&mut self, action: Action) -> Vec<Action> {
        match action {
            Action::SendToWidget(message) => {
                self.send_to_widget(&message).await;
                Vec::new()
            }

            Action::RequestCapabilities { requested } => {
                let approved =
                    self.capabilities_provider.acquire_capabilities(requested).await;
                let actions = self
                    .with_machine(|machine| machine.process_capability_approval(approved, None));
                self.rebuild_engine();
                actions
            }

            Action::RequestOpenId { request_id } => {
                let response = match self.matrix.request_open_id().await {
                    Ok(OpenIdStatus::Allowed(credentials)) => {
                        OpenIdResponse::Allowed(OpenIdState::new(request_id, credentials))
                    }
                    Ok(OpenIdStatus::Blocked) => OpenIdResponse::Blocked,
                    Err(error) => {
                        warn!(?error, "OpenID token request failed");
                        OpenIdResponse::Blocked
                    }
                };
                self.with_machine(|machine| machine.process_openid_response(response))
            }

            Action::SendMatrixEvent { request_id, request } => {
                match self.matrix.send_event(request).await {
                    Ok(response) => {
                        let data = serde_json::to_value(response)
                            .expect("send event response serializes");
                        self.reply(request_id, from_widget::action::SEND_EVENT, data).await;
                    }
                    Err(error) => self.reply_error(request_id, &error).await,
                }
                Vec::new()
            }

            Action::ReadMatrixEvents { request_id, request } => {
                match self.matrix.read_events(request).await {
                    Ok(events) => {
                        // The grant is type-level; each event is checked.
                        let events = events
                            .into_iter()
                            .filter(|event| {
                                FilterInput::from_room_event(event)
                                    .is_some_and(|input| self.engine.matches(&input))
                            })
                            .collect();
                        let data = serde_json::to_value(ReadEventsResponse { events })
                            .expect("read events response serializes");
                        self.reply(request_id, from_widget::action::READ_EVENTS, data).await;
                    }
                    Err(error) => self.reply_error(request_id, &error).await,
                }
                Vec::new()
            }

            Action::SendToDeviceMessage { request_id, request } => {
                match self.matrix.send_to_device(request).await {
                    Ok(()) => {
                        self.reply(request_id, from_widget::action::SEND_TO_DEVICE, json!({}))
                            .await
                    }
                    Err(error) => self.reply_error(request_id, &error).await,
                }
                Vec::new()
            }

            Action::UpdateDelayedEvent { request_id, request } => {
                match self.matrix.update_delayed_event(request).await {
                    Ok(()) => {
                        self.reply(
                            request_id,
                            from_widget::action::UPDATE_DELAYED_EVENT,
                            json!({}),
                        )
                        .await
                    }
                    Err(error) => self.reply_error(request_id, &error).await,
                }
                Vec::new()
            }

            Action::Navigate { request_id, uri } => {
                match self.matrix.navigate(&uri).await {
                    Ok(()) => self.reply(request_id, from_widget::action::NAVIGATE, json!({})).await,
                    Err(error) => self.reply_error(request_id, &error).await,
                }
                Vec::new()
            }
        }
    }

    fn rebuild_engine(&mut self) {
        let Some(machine) = &self.machine else { return };
        if let Some(approved) = machine.approved_capabilities() {
            self.engine = FilterEngine::new(&approved.read, machine.filter_context());
        }
    }

    async fn reply(&self, request_id: String, action: &str, data: JsonValue) {
        let message =
            Message::to_widget(Some(request_id), self.widget_id.clone(), action, data);
        self.send_to_widget(&message).await;
    }

    async fn reply_error(&self, request_id: String, error: &Error) {
        let data = serde_json::to_value(ErrorBody::from_error(error))
            .expect("error body serializes");
        self.reply(request_id, to_widget::action::ERROR, data).await;
    }

    async fn send_to_widget(&self, message: &Message) {
        let raw = match serde_json::to_string(message) {
            Ok(raw) => raw,
            Err(error) => {
                // Cannot be reported to the widget; it would need this very
                // serialization to work.
                warn!(?error, "Failed to serialize a message to the widget");
                return;
            }
        };
        if self.to_widget.send(raw).await.is_err() {
            debug!("Widget transport closed, dropping outgoing message");
        }
    }
}
