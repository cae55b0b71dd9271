//! SOAP envelopes for the Viera control surface.
//!
//! The TV exposes two SOAP services: a Panasonic network-control service (remote keys, apps,
//! encryption bootstrap) and the standard UPnP rendering-control service (volume, mute).
//!
//! Replies from the TV are not always well-formed (some arrive with junk after the final closing
//! tag), so values are pulled out of replies with tolerant tag extraction rather than a strict
//! XML parser.

use std::fmt;

/// Encrypted command wrapper action.
pub(crate) const ENCRYPTED_COMMAND_ACTION: &str = "X_EncryptedCommand";
/// Session establishment action.
pub(crate) const SESSION_ID_ACTION: &str = "X_GetEncryptSessionId";
/// Asks the TV to display a pairing PIN.
pub(crate) const DISPLAY_PIN_CODE_ACTION: &str = "X_DisplayPinCode";
/// Submits an encrypted pairing PIN.
pub(crate) const REQUEST_AUTH_ACTION: &str = "X_RequestAuth";

// Bootstrap actions which exist to get a session going, so can never be encrypted.
const ALWAYS_IN_PLAIN_TEXT: [&str; 3] = [
    SESSION_ID_ACTION,
    DISPLAY_PIN_CODE_ACTION,
    REQUEST_AUTH_ACTION,
];

/// Parameters sent for actions which take none.
pub(crate) const NO_PARAMETERS: &str = "None";

/// The SOAP service a request is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Panasonic network control (remote keys, apps, pairing, sessions).
    Command,
    /// UPnP rendering control (volume, mute).
    Render,
}

impl RequestType {
    /// The service URN, without the `urn:` scheme prefix.
    pub fn urn(&self) -> &'static str {
        match self {
            RequestType::Command => "panasonic-com:service:p00NetworkControl:1",
            RequestType::Render => "schemas-upnp-org:service:RenderingControl:1",
        }
    }

    /// The control URL path on the TV.
    pub fn path(&self) -> &'static str {
        match self {
            RequestType::Command => "/nrc/control_0",
            RequestType::Render => "/dmr/control_0",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Whether `action` must be sent in plain text even to TVs which require encryption.
pub(crate) fn is_always_plain_text(action: &str) -> bool {
    ALWAYS_IN_PLAIN_TEXT.contains(&action)
}

/// The `SOAPACTION` header value for `action` on `urn`.
pub(crate) fn soap_action_header(urn: &str, action: &str) -> String {
    format!("\"urn:{urn}#{action}\"")
}

/// Render the SOAP 1.1 envelope wrapping a single `action` element.
pub(crate) fn render_envelope(action: &str, urn: &str, parameters: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?> ",
            " <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\"> ",
            "<s:Body> <u:{action} xmlns:u=\"urn:{urn}\"> {parameters} </u:{action}> </s:Body> ",
            "</s:Envelope>"
        ),
        action = action,
        urn = urn,
        parameters = parameters,
    )
}

/// Render the inner document which gets encrypted into an `X_EncryptedCommand`.
pub(crate) fn render_encrypted_inner(
    session_id: u32,
    seq_num: u32,
    action: &str,
    urn: &str,
    parameters: &str,
) -> String {
    format!(
        concat!(
            "<X_SessionId>{session_id}</X_SessionId>",
            "<X_SequenceNumber>{seq_num:08}</X_SequenceNumber>",
            "<X_OriginalCommand> <u:{action} xmlns:u=\"urn:{urn}\">{parameters}</u:{action}> ",
            "</X_OriginalCommand>"
        ),
        session_id = session_id,
        seq_num = seq_num,
        action = action,
        urn = urn,
        parameters = parameters,
    )
}

/// Parameters carrying an application id and an encrypted payload.
pub(crate) fn render_app_id_with_enc_info(app_id: &str, enc_info: &str) -> String {
    format!("<X_ApplicationId>{app_id}</X_ApplicationId> <X_EncInfo>{enc_info}</X_EncInfo>")
}

/// Extract the text content of the first `<tag>…</tag>` element in `xml`.
///
/// Namespace prefixes (`<u:tag>`) and attributes on the opening tag are tolerated. The document
/// does not need to be well-formed.
pub fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let mut search_from = 0;

    while let Some(found) = xml[search_from..].find(tag) {
        let name_start = search_from + found;
        let name_end = name_start + tag.len();
        search_from = name_end;

        // The tag name must be preceded by '<' or a namespace prefix and followed by '>' or
        // attributes.
        let before = &xml[..name_start];
        let is_opening = before.ends_with('<')
            || before
                .rfind('<')
                .map(|lt| {
                    let prefix = &before[lt + 1..];
                    prefix.ends_with(':')
                        && prefix[..prefix.len() - 1]
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                })
                .unwrap_or(false);

        if !is_opening {
            continue;
        }

        let rest = &xml[name_end..];
        let gt = match rest.chars().next() {
            Some('>') => 0,
            Some(c) if c.is_whitespace() => rest.find('>')?,
            _ => continue,
        };

        if rest[..gt].ends_with('/') {
            return Some("");
        }

        let content_start = name_end + gt + 1;
        let content = &xml[content_start..];

        let close_plain = format!("</{tag}>");
        let close_end = match content.find(&close_plain) {
            Some(pos) => Some(pos),
            None => {
                let close_suffix = format!(":{tag}>");
                content
                    .find(&close_suffix)
                    .and_then(|pos| content[..pos].rfind("</"))
            }
        }?;

        return Some(&content[..close_end]);
    }

    None
}

/// Strip anything after the final `>` (the TV occasionally appends junk to a reply).
pub(crate) fn strip_trailing_junk(xml: &str) -> &str {
    match xml.rfind('>') {
        Some(pos) => &xml[..=pos],
        None => xml,
    }
}

// ================================================================================================
// Tests
