//! Content-type modifiers (`$script`, `$image`, ...).
//!
//! The request's content type is taken from the `Sec-Fetch-Dest` header
//! only. Requests without it never match, inverted or not.

use http::request;

/// Resource types a rule can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Document,
    XmlHttpRequest,
    Font,
    Subdocument,
    Image,
    Object,
    Script,
    Stylesheet,
    Media,
    /// Any destination not covered by the other variants.
    Other,
}

impl ContentType {
    /// Looks up a modifier name, including the `xhr`, `css` and `doc` aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        let content_type = match name {
            "document" | "doc" => ContentType::Document,
            "xmlhttprequest" | "xhr" => ContentType::XmlHttpRequest,
            "font" => ContentType::Font,
            "subdocument" => ContentType::Subdocument,
            "image" => ContentType::Image,
            "object" => ContentType::Object,
            "script" => ContentType::Script,
            "stylesheet" | "css" => ContentType::Stylesheet,
            "media" => ContentType::Media,
            "other" => ContentType::Other,
            _ => return None,
        };
        Some(content_type)
    }

    /// Maps a `Sec-Fetch-Dest` value to a content type.
    pub fn from_fetch_dest(dest: &str) -> Self {
        match dest {
            "document" => ContentType::Document,
            "empty" => ContentType::XmlHttpRequest,
            "font" => ContentType::Font,
            "frame" | "iframe" => ContentType::Subdocument,
            "image" => ContentType::Image,
            "object" | "embed" => ContentType::Object,
            "script" => ContentType::Script,
            "style" => ContentType::Stylesheet,
            "audio" | "track" | "video" => ContentType::Media,
            _ => ContentType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentTypeModifier {
    content_type: ContentType,
    inverted: bool,
}

impl ContentTypeModifier {
    pub(crate) fn new(content_type: ContentType, inverted: bool) -> Self {
        Self {
            content_type,
            inverted,
        }
    }

    pub(crate) fn should_match_req(&self, req: &request::Parts) -> bool {
        let Some(dest) = req
            .headers
            .get("sec-fetch-dest")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        (ContentType::from_fetch_dest(dest) == self.content_type) != self.inverted
    }
}
