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

//! Payloads of the messages the client sends to a widget.

use serde::{Deserialize, Serialize};

use crate::capabilities::Capabilities;

/// Action names the client sends to a widget.
pub mod action {
    /// Ask the widget for its desired capabilities, or tell it the approved
    /// ones.
    pub const CAPABILITIES: &str = "capabilities";
    /// Deliver OpenID credentials, or the state of the request.
    pub const OPENID_CREDENTIALS: &str = "openid_credentials";
    /// Report an error for an earlier request.
    pub const ERROR: &str = "error";
    /// A new timeline event matched the widget's read filters.
    pub const NOTIFY_NEW_EVENT: &str = "notify_new_event";
    /// A state entry matching the widget's read filters changed.
    pub const NOTIFY_STATE_UPDATE: &str = "notify_state_update";
    /// A to-device message matched the widget's read filters.
    pub const NOTIFY_TO_DEVICE: &str = "notify_to_device";
}

/// Body of a `capabilities` exchange.
///
/// The widget fills this in when answering the client's probe; the client
/// fills it in when announcing the approved set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesPayload {
    /// The capabilities, in their string form.
    pub capabilities: Capabilities,
}
