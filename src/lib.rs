//! Client-side driver for the Matrix widget API.
//!
//! A widget is an untrusted application embedded in a Matrix client,
//! typically in an iframe or a webview. The widget and the client exchange
//! framed JSON messages; this crate mediates that exchange. Every request
//! the widget makes is gated against a capability set the user approved,
//! approved requests are translated into operations on the embedding
//! client, and room events matching the approved filters are forwarded
//! back to the widget. The protocol is described by MSC2762 and its
//! follow-ups (MSC2871, MSC3819, MSC4157, MSC2873, MSC4039).
//!
//! The crate splits into a pure state machine ([`WidgetMachine`]), which
//! turns incoming messages into typed [`Action`]s, and an orchestrator
//! ([`run_widget_driver`]) that executes those actions against the
//! embedding client. Events that carry key material or ciphertext never
//! cross the widget boundary, regardless of what was approved.

#![warn(missing_docs)]

use async_channel::{Receiver, Sender};

mod capabilities;
mod driver;
mod error;
mod filter;
mod machine;
pub mod messages;
mod widget_settings;

pub use ruma;

pub use self::{
    capabilities::Capabilities,
    driver::{run_widget_driver, CapabilitiesProvider, MatrixDriver, OpenIdStatus, SyncUpdate},
    error::{Error, ErrorBody, ErrorCode},
    filter::{
        is_crypto_event_type, EventFilter, FilterContext, FilterEngine, FilterInput,
        MessageLikeEventFilter, StateEventFilter, ToDeviceEventFilter,
    },
    machine::{
        Action, CapabilityState, PendingRequests, SystemClock, TimeSource, TooManyPending,
        WidgetMachine, MAX_PENDING, PENDING_TIMEOUT,
    },
    widget_settings::{ClientProperties, RoomProperties, WidgetSettings},
};

/// Describes a widget.
#[derive(Debug)]
pub struct Widget {
    /// Settings for the widget.
    pub settings: WidgetSettings,
    /// Communication channels with a widget.
    pub comm: Comm,
}

/// Communication "pipes" with a widget.
///
/// Users of this API are only supposed to forward raw messages between the
/// webview / iframe and these pipes; the driver takes care of what the
/// messages mean.
#[derive(Debug)]
pub struct Comm {
    /// Raw incoming messages from the widget, formatted as JSON.
    pub from: Receiver<String>,
    /// Raw outgoing messages from the client to the widget, formatted as
    /// JSON.
    pub to: Sender<String>,
}
