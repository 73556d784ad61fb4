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

//! Actions the state machine asks the orchestrator to perform.
//!
//! The reducer never touches the outside world; it returns a list of these
//! and the orchestrator executes them in emission order.

use crate::{
    capabilities::Capabilities,
    messages::{
        from_widget::{
            ReadEventsRequest, SendEventRequest, SendToDeviceRequest, UpdateDelayedEventRequest,
        },
        Message,
    },
};

/// A single side effect requested by the reducer.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Serialize the message and hand it to the widget transport.
    SendToWidget(Message),
    /// Ask the capability provider (the user) to approve the widget's ask.
    RequestCapabilities {
        /// What the widget asked for.
        requested: Capabilities,
    },
    /// Ask the Matrix client for a fresh OpenID token.
    RequestOpenId {
        /// The widget request awaiting the token.
        request_id: String,
    },
    /// Send a room or state event on behalf of the widget.
    SendMatrixEvent {
        /// The widget request to answer with the result.
        request_id: String,
        /// What to send.
        request: SendEventRequest,
    },
    /// Read room or state events on behalf of the widget.
    ReadMatrixEvents {
        /// The widget request to answer with the result.
        request_id: String,
        /// What to read.
        request: ReadEventsRequest,
    },
    /// Send a to-device message on behalf of the widget.
    SendToDeviceMessage {
        /// The widget request to answer with the result.
        request_id: String,
        /// What to send.
        request: SendToDeviceRequest,
    },
    /// Update a scheduled delayed event.
    UpdateDelayedEvent {
        /// The widget request to answer with the result.
        request_id: String,
        /// What to update.
        request: UpdateDelayedEventRequest,
    },
    /// Ask the client to open a URI.
    Navigate {
        /// The widget request to answer once done.
        request_id: String,
        /// The URI to open.
        uri: String,
    },
}

impl Action {
    /// The widget request this action answers, if any.
    ///
    /// The orchestrator uses this to address a best-effort error response
    /// when executing the action fails.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Action::SendToWidget(message) => message.header.request_id.as_deref(),
            Action::RequestCapabilities { .. } => None,
            Action::RequestOpenId { request_id }
            | Action::SendMatrixEvent { request_id, .. }
            | Action::ReadMatrixEvents { request_id, .. }
            | Action::SendToDeviceMessage { request_id, .. }
            | Action::UpdateDelayedEvent { request_id, .. }
            | Action::Navigate { request_id, .. } => Some(request_id),
        }
    }
}
