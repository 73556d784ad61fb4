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

//! The postMessage envelope widgets and clients exchange.
//!
//! Every frame on the transport is a JSON object with an `api` direction
//! tag, an optional `requestId` (absent on notifications), a `widgetId`,
//! an `action` name and an `action`-specific `data` payload.

pub mod from_widget;
pub mod openid;
pub mod to_widget;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Fields common to all widget messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Correlates a response with its request. Absent on notifications.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The widget this message belongs to.
    #[serde(rename = "widgetId")]
    pub widget_id: String,
}

/// Direction and payload of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "api")]
pub enum MessageKind {
    /// A message sent by the widget.
    FromWidget {
        /// The requested operation.
        action: String,
        /// Operation-specific payload.
        #[serde(default)]
        data: JsonValue,
    },
    /// A message sent to the widget, or the widget's answer to one.
    ToWidget {
        /// The requested operation.
        action: String,
        /// Operation-specific payload.
        #[serde(default)]
        data: JsonValue,
    },
}

/// A complete framed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Request id and widget id.
    #[serde(flatten)]
    pub header: Header,
    /// Direction, action and payload.
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl Message {
    /// Builds a message addressed to the widget.
    pub fn to_widget(
        request_id: Option<String>,
        widget_id: impl Into<String>,
        action: impl Into<String>,
        data: JsonValue,
    ) -> Self {
        Self {
            header: Header { request_id, widget_id: widget_id.into() },
            kind: MessageKind::ToWidget { action: action.into(), data },
        }
    }
}
