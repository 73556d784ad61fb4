//! Widget settings and the url a client loads a widget from.

use language_tags::LanguageTag;
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use url::{form_urlencoded::Serializer, Url, UrlQuery};

mod url_props {
    use url::Url;
    use urlencoding::encode;

    pub struct QueryProperties {
        pub(crate) widget_id: String,
        pub(crate) avatar_url: String,
        pub(crate) display_name: String,
        pub(crate) user_id: String,
        pub(crate) room_id: String,
        pub(crate) language: String,
        pub(crate) client_theme: String,
        pub(crate) client_id: String,
        pub(crate) device_id: String,
        pub(crate) base_url: String,
        pub(crate) font_scale: String,
        pub(crate) fonts: String,
    }

    pub fn replace_properties(url: &mut Url, props: QueryProperties) {
        if let Some(query) = url.query() {
            let query = query
                .replace(WIDGET_ID.placeholder, &encode(&props.widget_id))
                .replace(AVATAR_URL.placeholder, &encode(&props.avatar_url))
                .replace(DEVICE_ID.placeholder, &encode(&props.device_id))
                .replace(DISPLAY_NAME.placeholder, &encode(&props.display_name))
                .replace(BASE_URL.placeholder, &encode(&props.base_url))
                .replace(USER_ID.placeholder, &encode(&props.user_id))
                .replace(ROOM_ID.placeholder, &encode(&props.room_id))
                .replace(LANGUAGE.placeholder, &encode(&props.language))
                .replace(CLIENT_THEME.placeholder, &encode(&props.client_theme))
                .replace(CLIENT_ID.placeholder, &encode(&props.client_id))
                .replace(FONT_SCALE.placeholder, &encode(&props.font_scale))
                .replace(FONTS.placeholder, &encode(&props.fonts));
            url.set_query(Some(&query));
        }
    }

    pub struct Property {
        pub name: &'static str,
        pub placeholder: &'static str,
    }

    pub static USER_ID: Property = Property { name: "userId", placeholder: "$matrix_user_id" };
    pub static ROOM_ID: Property = Property { name: "roomId", placeholder: "$matrix_room_id" };
    pub static WIDGET_ID: Property =
        Property { name: "widgetId", placeholder: "$matrix_widget_id" };
    pub static AVATAR_URL: Property =
        Property { name: "avatarUrl", placeholder: "$matrix_avatar_url" };
    pub static DISPLAY_NAME: Property =
        Property { name: "displayname", placeholder: "$matrix_display_name" };
    pub static LANGUAGE: Property =
        Property { name: "lang", placeholder: "$org.matrix.msc2873.client_language" };
    pub static CLIENT_THEME: Property =
        Property { name: "theme", placeholder: "$org.matrix.msc2873.client_theme" };
    pub static CLIENT_ID: Property =
        Property { name: "clientId", placeholder: "$org.matrix.msc2873.client_id" };
    pub static DEVICE_ID: Property =
        Property { name: "deviceId", placeholder: "$org.matrix.msc2873.matrix_device_id" };
    pub static BASE_URL: Property =
        Property { name: "baseUrl", placeholder: "$org.matrix.msc4039.matrix_base_url" };
    pub static FONT_SCALE: Property =
        Property { name: "fontScale", placeholder: "$io.element.fontScale" };
    pub static FONTS: Property = Property { name: "fonts", placeholder: "$io.element.font" };
}

/// Settings of the widget.
#[derive(Debug, Clone)]
pub struct WidgetSettings {
    id: String,

    init_after_content_load: bool,

    raw_url: Url,
}

impl WidgetSettings {
    /// Widget's unique identifier.
    pub fn id(&self) -> &String {
        &self.id
    }

    /// Whether the widget should be initialized only once it sent
    /// `content_loaded`, or right when it is attached to the driver.
    pub fn init_after_content_load(&self) -> bool {
        self.init_after_content_load
    }

    /// The url from the widget state event, with its placeholders intact.
    ///
    /// Placeholders let the client pass information to the widget, e.g.
    /// `http://widget.domain?username=$matrix_user_id` becomes
    /// `http://widget.domain?username=@user:server.domain`.
    pub fn raw_url(&self) -> &Url {
        &self.raw_url
    }

    /// The base url of the widget, used as the target for postMessages.
    /// Contains only the scheme and the authority, e.g.
    /// `https://my.domain.org`.
    pub fn base_url(&self) -> Option<Url> {
        base_url(self.raw_url.clone())
    }

    /// Creates the url to load into the WebView or IFrame that hosts the
    /// widget, with all placeholders substituted and url-encoded.
    ///
    /// # Arguments
    ///
    /// * `room` - Values describing the room the widget is attached to and
    ///   the acting user's profile.
    /// * `client` - Properties of the embedding client a widget may adapt
    ///   to, e.g. language or theme.
    pub fn generate_webview_url(&self, room: &RoomProperties, client: &ClientProperties) -> Url {
        let props = url_props::QueryProperties {
            widget_id: self.id.clone(),
            avatar_url: room.avatar_url.clone(),
            display_name: room.display_name.clone(),
            user_id: room.user_id.to_string(),
            room_id: room.room_id.to_string(),
            language: client.language.to_string(),
            client_theme: client.theme.clone(),
            client_id: client.client_id.clone(),
            device_id: room.device_id.to_string(),
            base_url: room.homeserver_url.clone(),
            font_scale: client.font_scale.map(|scale| scale.to_string()).unwrap_or_default(),
            fonts: client.fonts.join(","),
        };
        let mut generated_url = self.raw_url.clone();
        url_props::replace_properties(&mut generated_url, props);
        generated_url
    }

    /// Creates the settings of a virtual Element Call widget, as a client
    /// would otherwise read them from a widget state event.
    ///
    /// # Arguments
    /// * `element_call_url` - the url of the app, e.g. `https://call.element.io`.
    /// * `widget_id` - the widget id.
    /// * `parent_url` - the target of the postMessages sent by the widget.
    ///   For web clients this is the client url; on other platforms the
    ///   widget usually posts to its own webview, which means the widget
    ///   also receives its own messages. Defaults to `element_call_url`.
    /// * `hide_header` - hides the branding header of Element Call
    ///   (default: `true`).
    /// * `preload` - skips the lobby; the widget joins the call on the
    ///   `io.element.join` action (default: `false`).
    /// * `font_scale` - the font scale used inside Element Call (default: `1`).
    /// * `app_prompt` - whether to prompt the user to open in browser or app
    ///   (default: `false`).
    /// * `skip_lobby` - joins the call immediately (default: `false`).
    /// * `confine_to_room` - hides the calls list in the webview
    ///   (default: `true`).
    /// * `fonts` - fonts to adapt to the system fonts (default: `[]`).
    /// * `analytics_id` - an optional PostHog id passed to Element Call.
    #[allow(clippy::too_many_arguments)]
    pub fn new_virtual_element_call_widget(
        element_call_url: String,
        widget_id: String,
        parent_url: Option<String>,
        hide_header: Option<bool>,
        preload: Option<bool>,
        font_scale: Option<f64>,
        app_prompt: Option<bool>,
        skip_lobby: Option<bool>,
        confine_to_room: Option<bool>,
        fonts: Option<Vec<String>>,
        analytics_id: Option<String>,
    ) -> Result<Self, url::ParseError> {
        let mut raw_url: Url = Url::parse(&format!("{element_call_url}/room"))?;
        {
            fn append_property(
                query: &mut Serializer<'_, UrlQuery<'_>>,
                prop: &url_props::Property,
            ) {
                query.append_pair(prop.name, prop.placeholder);
            }

            let mut query = raw_url.query_pairs_mut();

            // Default widget url template parameters:
            append_property(&mut query, &url_props::WIDGET_ID);
            append_property(&mut query, &url_props::USER_ID);
            append_property(&mut query, &url_props::DEVICE_ID);
            append_property(&mut query, &url_props::ROOM_ID);
            append_property(&mut query, &url_props::LANGUAGE);
            append_property(&mut query, &url_props::CLIENT_THEME);
            append_property(&mut query, &url_props::BASE_URL);
        }

        // Revert the encoding of the template parameters so one replace
        // logic covers them all.
        let mut raw_url =
            Url::parse(&raw_url.as_str().replace("%24", "$")).expect("could not re-parse the url");
        {
            let mut query = raw_url.query_pairs_mut();

            // Custom Element Call url parameters:
            query.append_pair("parentUrl", &parent_url.unwrap_or(element_call_url));
            if app_prompt.unwrap_or(false) {
                query.append_pair("embed", "true");
            }
            query.append_pair("hideHeader", &hide_header.unwrap_or(true).to_string());
            query.append_pair("preload", &preload.unwrap_or(false).to_string());
            if let Some(analytics_id) = analytics_id {
                query.append_pair("analyticsID", &analytics_id);
            }
            if let Some(scale) = font_scale {
                query.append_pair("fontScale", &scale.to_string());
            }
            query.append_pair("skipLobby", &skip_lobby.unwrap_or(false).to_string());
            query.append_pair("confineToRoom", &confine_to_room.unwrap_or(true).to_string());
            if let Some(fonts) = fonts {
                query.append_pair("fonts", &fonts.join(","));
            }
        }

        // Move all params into the fragment, so they never reach the server.
        if let Some(query) = raw_url.clone().query() {
            raw_url.set_query(None);
            raw_url.set_fragment(Some(&format!("?{query}")));
        }

        // Element Call always initializes on content load.
        Ok(Self { id: widget_id, init_after_content_load: true, raw_url })
    }

    /// Creates a new `WidgetSettings` instance.
    pub fn new(
        id: String,
        init_after_content_load: bool,
        raw_url: &str,
    ) -> Result<Self, url::ParseError> {
        Ok(Self { id, init_after_content_load, raw_url: Url::parse(raw_url)? })
    }
}

/// Per-room values a client substitutes into the widget url.
#[derive(Clone, Debug)]
pub struct RoomProperties {
    /// The user on whose behalf the widget acts.
    pub user_id: OwnedUserId,
    /// The room the widget is attached to.
    pub room_id: OwnedRoomId,
    /// The device the driver runs on.
    pub device_id: OwnedDeviceId,
    /// The user's avatar url, or empty.
    pub avatar_url: String,
    /// The user's display name, or empty.
    pub display_name: String,
    /// The homeserver base url (MSC4039).
    pub homeserver_url: String,
}

/// Properties of the embedding client that widgets may adapt to.
#[derive(Debug)]
pub struct ClientProperties {
    /// Lets a widget behave differently per client, e.g. `org.example.ios`.
    pub client_id: String,
    /// The language the client is set to, e.g. `en-us`.
    pub language: LanguageTag,
    /// A string describing the theme (`dark`, `light`, `org.example.dark`).
    pub theme: String,
    /// The font scale applied in the client.
    pub font_scale: Option<f64>,
    /// Fonts the widget should use to match the client.
    pub fonts: Vec<String>,
}

impl ClientProperties {
    /// Creates client properties. A malformed `language` falls back to
    /// `en-US`, a missing `theme` to `light`.
    pub fn new(client_id: &str, language: Option<String>, theme: Option<String>) -> Self {
        let default_language = LanguageTag::parse("en-us").expect("en-us is a valid language tag");
        ClientProperties {
            client_id: client_id.to_owned(),
            language: language
                .and_then(|l| LanguageTag::parse(&l).ok())
                .unwrap_or(default_language),
            theme: theme.unwrap_or_else(|| "light".to_owned()),
            font_scale: None,
            fonts: Vec::new(),
        }
    }
}

fn base_url(mut url: Url) -> Option<Url> {
    match url.path_segments_mut() {
        Ok(mut path) => {
            path.clear();
        }
        _ => return None,
    }

    url.set_query(None);
    url.set_fragment(None);

    Some(url)
}
