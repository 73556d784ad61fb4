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

//! The widget API state machine.
//!
//! [`WidgetMachine`] is a reducer: each entry point consumes the machine,
//! inspects one stimulus and returns the next machine value along with the
//! [`Action`]s the orchestrator must execute. It performs no I/O itself, so
//! the whole protocol can be tested without a Matrix client or a widget.

mod actions;
pub(crate) mod pending;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::warn;

pub use self::{
    actions::Action,
    pending::{PendingRequests, SystemClock, TimeSource, TooManyPending, MAX_PENDING, PENDING_TIMEOUT},
};
use crate::{
    capabilities::Capabilities,
    error::{ErrorBody, ErrorCode},
    filter::{is_crypto_event_type, FilterContext},
    messages::{
        from_widget::{
            self, NavigateRequest, ReadEventsRequest, SendEventRequest, SendToDeviceRequest,
            SupportedApiVersionsResponse, UpdateDelayedEventRequest,
        },
        openid::{OpenIdResponse, OpenIdState},
        to_widget::{self, CapabilitiesPayload},
        Header, Message, MessageKind,
    },
};

const OPENID_PENDING_PREFIX: &str = "openid:";

fn openid_pending_id(request_id: &str) -> String {
    format!("{OPENID_PENDING_PREFIX}{request_id}")
}

/// Where the capability negotiation stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityState {
    /// The widget has not asked for anything yet.
    Unset,
    /// The widget's ask is awaiting the user's decision.
    Negotiating,
    /// The user decided; the approved set is in force.
    Negotiated,
}

#[derive(Clone, Debug)]
enum Negotiation {
    Unset,
    Negotiating { requested: Capabilities },
    Negotiated { requested: Capabilities, approved: Capabilities },
}

#[derive(Clone, Debug)]
struct OpenIdSession {
    state: OpenIdState,
    acquired_at: Instant,
}

impl OpenIdSession {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.acquired_at + Duration::from_secs(self.state.expires_in_seconds)
    }
}

/// The pure core of the widget API driver.
#[derive(Clone, Debug)]
pub struct WidgetMachine {
    widget_id: String,
    context: FilterContext,
    negotiation: Negotiation,
    openid: Option<OpenIdSession>,
    pending: PendingRequests<String>,
    clock: Arc<dyn TimeSource>,
}

impl WidgetMachine {
    /// Creates a machine for the given widget, acting as the given user and
    /// device.
    pub fn new(widget_id: impl Into<String>, user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        Self::with_time_source(widget_id, user_id, device_id, Arc::new(SystemClock))
    }

    /// Creates a machine whose notion of time comes from `clock`.
    pub fn with_time_source(
        widget_id: impl Into<String>,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            widget_id: widget_id.into(),
            context: FilterContext::new(user_id, device_id),
            negotiation: Negotiation::Unset,
            openid: None,
            pending: PendingRequests::new(clock.clone()),
            clock,
        }
    }

    /// The widget this machine drives.
    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    /// Where the capability negotiation stands.
    pub fn capability_state(&self) -> CapabilityState {
        match &self.negotiation {
            Negotiation::Unset => CapabilityState::Unset,
            Negotiation::Negotiating { .. } => CapabilityState::Negotiating,
            Negotiation::Negotiated { .. } => CapabilityState::Negotiated,
        }
    }

    /// The widget's ask, once it made one.
    pub fn requested_capabilities(&self) -> Option<&Capabilities> {
        match &self.negotiation {
            Negotiation::Unset => None,
            Negotiation::Negotiating { requested } | Negotiation::Negotiated { requested, .. } => {
                Some(requested)
            }
        }
    }

    /// The approved capabilities, once negotiated.
    pub fn approved_capabilities(&self) -> Option<&Capabilities> {
        match &self.negotiation {
            Negotiation::Negotiated { approved, .. } => Some(approved),
            _ => None,
        }
    }

    /// Number of requests awaiting an asynchronous answer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The values substituted into templated state key patterns.
    pub fn filter_context(&self) -> &FilterContext {
        &self.context
    }

    /// Feeds one message from the widget through the reducer.
    pub fn process_from_widget(mut self, message: Message) -> (Self, Vec<Action>) {
        let mut actions = Vec::new();
        self.drain_expired(&mut actions);

        let Message { header, kind } = message;
        let MessageKind::FromWidget { action, data } = kind else {
            // Responses to client-initiated requests are routed by the
            // orchestrator, not the reducer.
            return (self, actions);
        };

        match action.as_str() {
            from_widget::action::SUPPORTED_API_VERSIONS => {
                self.handle_supported_api_versions(header.request_id, &mut actions);
            }
            from_widget::action::CONTENT_LOADED => {
                self.handle_content_loaded(header.request_id, &mut actions);
            }
            from_widget::action::GET_OPENID => {
                self.handle_get_openid(header.request_id, &mut actions);
            }
            from_widget::action::SEND_EVENT => {
                self.handle_send_event(header.request_id, data, &mut actions);
            }
            from_widget::action::READ_EVENTS => {
                self.handle_read_events(header.request_id, data, &mut actions);
            }
            from_widget::action::SEND_TO_DEVICE => {
                self.handle_send_to_device(header.request_id, data, &mut actions);
            }
            from_widget::action::UPDATE_DELAYED_EVENT => {
                self.handle_update_delayed_event(header.request_id, data, &mut actions);
            }
            from_widget::action::NAVIGATE => {
                self.handle_navigate(header.request_id, data, &mut actions);
            }
            unknown => {
                if let Some(request_id) = header.request_id {
                    actions.push(self.error_reply(
                        request_id,
                        ErrorCode::Unrecognized,
                        format!("unknown action: {unknown}"),
                    ));
                }
            }
        }

        (self, actions)
    }

    /// Records the widget's capability ask and asks the user to decide.
    ///
    /// Negotiation is one-shot; asks after the first are ignored.
    pub fn process_capability_request(mut self, requested: Capabilities) -> (Self, Vec<Action>) {
        let mut actions = Vec::new();
        self.drain_expired(&mut actions);

        match &self.negotiation {
            Negotiation::Unset => {
                self.negotiation = Negotiation::Negotiating { requested: requested.clone() };
                actions.push(Action::RequestCapabilities { requested });
            }
            _ => warn!("Capability negotiation already started, ignoring another ask"),
        }

        (self, actions)
    }

    /// Applies the user's capability decision, optionally together with an
    /// OpenID outcome acquired during the same prompt.
    ///
    /// The approval is clipped to the recorded ask, so the approved set is
    /// always a subset of the requested one. A widget request that waited
    /// for the decision (`content_loaded`) is answered here.
    pub fn process_capability_approval(
        mut self,
        approved: Capabilities,
        openid: Option<OpenIdResponse>,
    ) -> (Self, Vec<Action>) {
        let mut actions = Vec::new();
        self.drain_expired(&mut actions);

        match std::mem::replace(&mut self.negotiation, Negotiation::Unset) {
            Negotiation::Negotiated { requested, approved: in_force } => {
                warn!("Capabilities already negotiated, ignoring another approval");
                self.negotiation = Negotiation::Negotiated { requested, approved: in_force };
            }
            Negotiation::Negotiating { requested } => {
                let approved = approved.intersect(&requested);
                self.negotiation = Negotiation::Negotiated { requested, approved };
                self.answer_pending_capabilities(&mut actions);
            }
            Negotiation::Unset => {
                // A driver-initiated grant with no recorded ask bounds itself.
                self.negotiation =
                    Negotiation::Negotiated { requested: approved.clone(), approved };
                self.answer_pending_capabilities(&mut actions);
            }
        }

        if let Some(response) = openid {
            let (machine, mut openid_actions) = self.process_openid_response(response);
            self = machine;
            actions.append(&mut openid_actions);
        }

        (self, actions)
    }

    /// Feeds the outcome of an OpenID token request back into the machine.
    pub fn process_openid_response(mut self, response: OpenIdResponse) -> (Self, Vec<Action>) {
        let mut actions = Vec::new();
        self.drain_expired(&mut actions);

        match response {
            OpenIdResponse::Allowed(state) => {
                let waiting = self.pending.extract(&openid_pending_id(&state.id));
                self.openid =
                    Some(OpenIdSession { state: state.clone(), acquired_at: self.clock.now() });
                if let Some(request_id) = waiting {
                    let state = OpenIdState { id: request_id.clone(), ..state };
                    actions.push(self.openid_reply(request_id, OpenIdResponse::Allowed(state)));
                }
            }
            OpenIdResponse::Blocked => {
                self.openid = None;
                if let Some((_, request_id)) =
                    self.pending.extract_first(|id| id.starts_with(OPENID_PENDING_PREFIX))
                {
                    actions.push(self.openid_reply(request_id, OpenIdResponse::Blocked));
                }
            }
            OpenIdResponse::Pending => {
                // Interim notice; the final answer is still coming, so the
                // pending entry stays.
                if let Some((_, request_id)) =
                    self.pending.extract_first(|id| id.starts_with(OPENID_PENDING_PREFIX))
                {
                    let _ = self
                        .pending
                        .insert(openid_pending_id(&request_id), request_id.clone());
                    actions.push(self.openid_reply(request_id, OpenIdResponse::Pending));
                }
            }
        }

        (self, actions)
    }

    fn handle_supported_api_versions(
        &mut self,
        request_id: Option<String>,
        actions: &mut Vec<Action>,
    ) {
        let Some(request_id) = request_id else { return };
        let data = serde_json::to_value(SupportedApiVersionsResponse::default())
            .expect("version list serializes");
        actions.push(self.reply(request_id, from_widget::action::SUPPORTED_API_VERSIONS, data));
    }

    fn handle_content_loaded(&mut self, request_id: Option<String>, actions: &mut Vec<Action>) {
        let approved = match &self.negotiation {
            Negotiation::Negotiated { approved, .. } => Some(approved.clone()),
            _ => None,
        };
        match (approved, request_id) {
            (Some(approved), Some(request_id)) => {
                let data = serde_json::to_value(CapabilitiesPayload { capabilities: approved })
                    .expect("capabilities serialize");
                actions.push(self.reply(request_id, to_widget::action::CAPABILITIES, data));
            }
            (None, Some(request_id)) => {
                // Answered once the user decides.
                if self.pending.insert(request_id.clone(), request_id.clone()).is_err() {
                    actions.push(self.error_reply(
                        request_id,
                        ErrorCode::LimitExceeded,
                        "too many requests in flight",
                    ));
                }
            }
            // Without a request id this is a plain notification.
            (_, None) => {}
        }
    }

    fn handle_get_openid(&mut self, request_id: Option<String>, actions: &mut Vec<Action>) {
        let Some(request_id) = request_id else { return };

        let now = self.clock.now();
        if let Some(session) = self.openid.as_ref().filter(|session| !session.is_expired(now)) {
            let state = OpenIdState { id: request_id.clone(), ..session.state.clone() };
            actions.push(self.openid_reply(request_id, OpenIdResponse::Allowed(state)));
            return;
        }

        match self.pending.insert(openid_pending_id(&request_id), request_id.clone()) {
            Ok(()) => actions.push(Action::RequestOpenId { request_id }),
            Err(TooManyPending) => actions.push(self.error_reply(
                request_id,
                ErrorCode::LimitExceeded,
                "too many requests in flight",
            )),
        }
    }

    fn handle_send_event(
        &mut self,
        request_id: Option<String>,
        data: JsonValue,
        actions: &mut Vec<Action>,
    ) {
        let Some(request_id) = request_id else { return };
        let Some(request) = self.parse_body::<SendEventRequest>(&request_id, data, actions) else {
            return;
        };

        if !self.can_send(&request) {
            actions.push(self.forbidden(request_id, &request.event_type));
            return;
        }

        actions.push(Action::SendMatrixEvent { request_id, request });
    }

    fn can_send(&self, request: &SendEventRequest) -> bool {
        if is_crypto_event_type(&request.event_type) {
            return false;
        }
        let Some(approved) = self.approved_capabilities() else { return false };
        if request.delay.is_some() && !approved.send_delayed_event {
            return false;
        }
        approved.can_send(&request.event_type, request.state_key.as_deref(), &self.context)
    }

    fn handle_read_events(
        &mut self,
        request_id: Option<String>,
        data: JsonValue,
        actions: &mut Vec<Action>,
    ) {
        let Some(request_id) = request_id else { return };
        let Some(request) = self.parse_body::<ReadEventsRequest>(&request_id, data, actions) else {
            return;
        };

        let allowed = self.approved_capabilities().is_some_and(|approved| {
            approved.can_read_type(
                request.event_type.as_deref(),
                request.state_key.as_deref(),
                &self.context,
            )
        });
        if !allowed {
            let target = request.event_type.as_deref().unwrap_or("*");
            actions.push(self.forbidden(request_id, target));
            return;
        }

        actions.push(Action::ReadMatrixEvents { request_id, request });
    }

    fn handle_send_to_device(
        &mut self,
        request_id: Option<String>,
        data: JsonValue,
        actions: &mut Vec<Action>,
    ) {
        let Some(request_id) = request_id else { return };
        let Some(request) = self.parse_body::<SendToDeviceRequest>(&request_id, data, actions)
        else {
            return;
        };

        let allowed = !is_crypto_event_type(&request.event_type)
            && self
                .approved_capabilities()
                .is_some_and(|approved| approved.can_send_to_device(&request.event_type));
        if !allowed {
            actions.push(self.forbidden(request_id, &request.event_type));
            return;
        }

        actions.push(Action::SendToDeviceMessage { request_id, request });
    }

    fn handle_update_delayed_event(
        &mut self,
        request_id: Option<String>,
        data: JsonValue,
        actions: &mut Vec<Action>,
    ) {
        let Some(request_id) = request_id else { return };
        let Some(request) =
            self.parse_body::<UpdateDelayedEventRequest>(&request_id, data, actions)
        else {
            return;
        };

        let allowed =
            self.approved_capabilities().is_some_and(|approved| approved.update_delayed_event);
        if !allowed {
            actions.push(self.forbidden(request_id, "delayed events"));
            return;
        }

        actions.push(Action::UpdateDelayedEvent { request_id, request });
    }

    fn handle_navigate(
        &mut self,
        request_id: Option<String>,
        data: JsonValue,
        actions: &mut Vec<Action>,
    ) {
        let Some(request_id) = request_id else { return };
        let Some(request) = self.parse_body::<NavigateRequest>(&request_id, data, actions) else {
            return;
        };
        actions.push(Action::Navigate { request_id, uri: request.uri });
    }

    fn parse_body<T: DeserializeOwned>(
        &self,
        request_id: &str,
        data: JsonValue,
        actions: &mut Vec<Action>,
    ) -> Option<T> {
        match serde_json::from_value(data) {
            Ok(request) => Some(request),
            Err(error) => {
                actions.push(self.error_reply(
                    request_id.to_owned(),
                    ErrorCode::InvalidRequest,
                    error.to_string(),
                ));
                None
            }
        }
    }

    fn answer_pending_capabilities(&mut self, actions: &mut Vec<Action>) {
        let Some((_, request_id)) =
            self.pending.extract_first(|id| !id.starts_with(OPENID_PENDING_PREFIX))
        else {
            return;
        };
        let Some(approved) = self.approved_capabilities() else { return };
        let data = serde_json::to_value(CapabilitiesPayload { capabilities: approved.clone() })
            .expect("capabilities serialize");
        actions.push(self.reply(request_id, to_widget::action::CAPABILITIES, data));
    }

    fn drain_expired(&mut self, actions: &mut Vec<Action>) {
        for (_, request_id) in self.pending.remove_expired() {
            actions.push(self.error_reply(
                request_id,
                ErrorCode::Timeout,
                "the request expired before the client answered",
            ));
        }
    }

    fn reply(&self, request_id: String, action: &str, data: JsonValue) -> Action {
        Action::SendToWidget(Message {
            header: Header { request_id: Some(request_id), widget_id: self.widget_id.clone() },
            kind: MessageKind::ToWidget { action: action.to_owned(), data },
        })
    }

    fn openid_reply(&self, request_id: String, response: OpenIdResponse) -> Action {
        let data = serde_json::to_value(response).expect("openid response serializes");
        self.reply(request_id, to_widget::action::OPENID_CREDENTIALS, data)
    }

    fn error_reply(
        &self,
        request_id: String,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Action {
        let data =
            serde_json::to_value(ErrorBody::new(code, message)).expect("error body serializes");
        self.reply(request_id, to_widget::action::ERROR, data)
    }

    fn forbidden(&self, request_id: String, target: &str) -> Action {
        self.error_reply(
            request_id,
            ErrorCode::Forbidden,
            format!("not covered by the approved capabilities: {target}"),
        )
    }
}
