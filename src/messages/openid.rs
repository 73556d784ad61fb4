//! OpenID credential types of the widget API.

use serde::{Deserialize, Serialize};

fn default_token_type() -> String {
    "Bearer".to_owned()
}

/// Token data handed over by the Matrix client when the user allows an
/// OpenID request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenIdCredentials {
    /// The bearer token.
    pub access_token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
    /// The homeserver that issued the token.
    pub matrix_server_name: String,
    /// The token type, `Bearer` unless the server says otherwise.
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

/// OpenID credentials as delivered to the widget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenIdState {
    /// The request this answers.
    #[serde(rename = "original_request_id")]
    pub id: String,
    /// The bearer token.
    #[serde(rename = "access_token")]
    pub token: String,
    /// Seconds until the token expires.
    #[serde(rename = "expires_in")]
    pub expires_in_seconds: u64,
    /// The homeserver that issued the token.
    #[serde(rename = "matrix_server_name")]
    pub server: String,
    /// The token type.
    #[serde(rename = "token_type")]
    pub kind: String,
}

impl OpenIdState {
    /// Pairs credentials from the client with the widget request they
    /// answer.
    pub fn new(id: impl Into<String>, credentials: OpenIdCredentials) -> Self {
        Self {
            id: id.into(),
            token: credentials.access_token,
            expires_in_seconds: credentials.expires_in,
            server: credentials.matrix_server_name,
            kind: credentials.token_type,
        }
    }
}

/// Outcome of an OpenID token request, as reported to the widget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "state")]
pub enum OpenIdResponse {
    /// The user allowed the request; credentials attached.
    Allowed(OpenIdState),
    /// The user declined.
    Blocked,
    /// The decision is still up to the user.
    #[serde(rename = "request")]
    Pending,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{OpenIdCredentials, OpenIdResponse, OpenIdState};

    #[test]
    fn allowed_response_flattens_credentials() {
        let credentials = OpenIdCredentials {
            access_token: "tok".to_owned(),
            expires_in: 3600,
            matrix_server_name: "example.org".to_owned(),
            token_type: "Bearer".to_owned(),
        };
        let response = OpenIdResponse::Allowed(OpenIdState::new("r1", credentials));

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "state": "allowed",
                "original_request_id": "r1",
                "access_token": "tok",
                "expires_in": 3600,
                "matrix_server_name": "example.org",
                "token_type": "Bearer",
            })
        );
    }

    #[test]
    fn pending_serializes_as_request() {
        assert_eq!(
            serde_json::to_value(OpenIdResponse::Pending).unwrap(),
            json!({ "state": "request" })
        );
        assert_eq!(
            serde_json::to_value(OpenIdResponse::Blocked).unwrap(),
            json!({ "state": "blocked" })
        );
    }

    #[test]
    fn token_type_defaults_to_bearer() {
        let credentials: OpenIdCredentials = serde_json::from_value(json!({
            "access_token": "tok",
            "expires_in": 60,
            "matrix_server_name": "example.org",
        }))
        .unwrap();
        assert_eq!(credentials.token_type, "Bearer");
    }
}
