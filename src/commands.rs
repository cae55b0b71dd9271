//! Viera TV control commands.
//!
//! Remote-control commands (key presses, input switching, app launching and app listing) go to
//! the Panasonic network-control service. Volume and mute commands go to the UPnP
//! rendering-control service. Each command converts into the [`VieraRequest`] which is sent to the
//! TV, and the `parse_*` functions decode the replies for the commands which return data.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use log::error;
use quick_xml::escape::unescape;
use regex::Regex;

use crate::error::{Outcome, VieraError};
use crate::soap::{extract_tag, strip_trailing_junk, RequestType, NO_PARAMETERS};
use crate::types::App;

const AUDIO_CHANNEL: &str = "<InstanceID>0</InstanceID><Channel>Master</Channel>";

// Product ids are always this long; anything else is launched as a resource id.
const PRODUCT_ID_LEN: usize = 16;

static VOLUME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<CurrentVolume>(\d*)</CurrentVolume>").expect("volume pattern"));

static MUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<CurrentMute>([0-1])</CurrentMute>").expect("mute pattern"));

static APP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'product_id=([0-9A-Z]+)'([^']+)").expect("app pattern"));

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]+|#x[0-9a-fA-F]+|[A-Za-z][A-Za-z0-9]*);").expect("entity pattern")
});

/// Viera control commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VieraCommand {
    /// Press a remote-control key, e.g. `"POWER"`, `"VOLUP"`, `"HOME"`.
    SendKey(String),
    /// Switch to the numbered HDMI input.
    SwitchToHdmi(u8),
    /// Launch an app by its product id (16 characters) or resource id.
    LaunchApp(String),
    /// Get the list of installed apps.
    GetAppList,
    /// Get the current volume level.
    GetVolume,
    /// Set the volume level.
    SetVolume(u8),
    /// Get the mute state.
    GetMute,
    /// Set the mute state (`true` is muted, `false` is not muted).
    SetMute(bool),
}

impl fmt::Display for VieraCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VieraCommand::SendKey(code) => write!(f, "SendKey({})", code),
            VieraCommand::SwitchToHdmi(input) => write!(f, "SwitchToHdmi({})", input),
            VieraCommand::LaunchApp(id) => write!(f, "LaunchApp({})", id),
            VieraCommand::SetVolume(val) => write!(f, "SetVolume({})", val),
            VieraCommand::SetMute(val) => write!(f, "SetMute({})", val),
            variant => write!(f, "{:?}", variant),
        }
    }
}

/// A SOAP action ready to be sent to the TV.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VieraRequest {
    pub request_type: RequestType,
    pub action: String,
    pub parameters: String,
}

impl VieraRequest {
    pub fn new(request_type: RequestType, action: &str, parameters: &str) -> Self {
        VieraRequest {
            request_type,
            action: action.into(),
            parameters: parameters.into(),
        }
    }
}

impl From<VieraCommand> for VieraRequest {
    fn from(val: VieraCommand) -> Self {
        match val {
            VieraCommand::SendKey(code) => VieraRequest::new(
                RequestType::Command,
                "X_SendKey",
                &format!("<X_KeyEvent>NRC_{}-ONOFF</X_KeyEvent>", code.to_uppercase()),
            ),
            VieraCommand::SwitchToHdmi(input) => VieraRequest::new(
                RequestType::Command,
                "X_SendKey",
                &format!("<X_KeyEvent>NRC_HDMI{}-ONOFF</X_KeyEvent>", input),
            ),
            VieraCommand::LaunchApp(id) => {
                let keyword = if id.chars().count() == PRODUCT_ID_LEN {
                    format!("product_id={id}")
                } else {
                    format!("resource_id={id}")
                };

                VieraRequest::new(
                    RequestType::Command,
                    "X_LaunchApp",
                    &format!(
                        "<X_AppType>vc_app</X_AppType><X_LaunchKeyword>{keyword}</X_LaunchKeyword>"
                    ),
                )
            }
            VieraCommand::GetAppList => {
                VieraRequest::new(RequestType::Command, "X_GetAppList", NO_PARAMETERS)
            }
            VieraCommand::GetVolume => {
                VieraRequest::new(RequestType::Render, "GetVolume", AUDIO_CHANNEL)
            }
            VieraCommand::SetVolume(volume) => VieraRequest::new(
                RequestType::Render,
                "SetVolume",
                &format!("{AUDIO_CHANNEL}<DesiredVolume>{volume}</DesiredVolume>"),
            ),
            VieraCommand::GetMute => {
                VieraRequest::new(RequestType::Render, "GetMute", AUDIO_CHANNEL)
            }
            VieraCommand::SetMute(mute) => VieraRequest::new(
                RequestType::Render,
                "SetMute",
                &format!(
                    "{AUDIO_CHANNEL}<DesiredMute>{}</DesiredMute>",
                    if mute { "1" } else { "0" }
                ),
            ),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Reply parsing
// ------------------------------------------------------------------------------------------------

/// Volume from a `GetVolume` reply. A reply without a volume reads as 0.
pub(crate) fn parse_volume(reply: &str) -> u8 {
    let volume = VOLUME_RE
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .unwrap_or(0);

    volume.min(u8::MAX as u16) as u8
}

/// Mute state from a `GetMute` reply. A reply without a mute state reads as muted.
pub(crate) fn parse_mute(reply: &str) -> bool {
    match MUTE_RE.captures(reply).and_then(|caps| caps.get(1)) {
        Some(m) => m.as_str() == "1",
        None => true,
    }
}

/// Decode each character entity in `raw` on its own. Entities which aren't recognized, and
/// ampersands which don't start an entity, are kept as they are.
fn decode_entities(raw: &str) -> Cow<'_, str> {
    ENTITY_RE.replace_all(raw, |caps: &regex::Captures| match unescape(&caps[0]) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => caps[0].to_string(),
    })
}

/// Apps from an `X_GetAppList` reply.
///
/// A list with no apps is what a TV in standby returns, and is reported as
/// [`VieraError::Standby`].
pub(crate) fn parse_app_list(reply: &str) -> Outcome<Vec<App>> {
    let clean = strip_trailing_junk(reply);

    let raw = extract_tag(clean, "X_AppList").ok_or_else(|| {
        error!("X_AppList missing from reply: {}", reply);
        VieraError::MalformedReply("Reply has no X_AppList".into())
    })?;

    let decoded = decode_entities(raw);

    let apps: Vec<App> = APP_RE
        .captures_iter(&decoded)
        .map(|caps| App {
            name: caps[2].to_string(),
            id: caps[1].to_string(),
            hidden: None,
        })
        .collect();

    if apps.is_empty() {
        return Err(VieraError::Standby("The TV returned no apps".into()));
    }

    Ok(apps)
}

// ================================================================================================
// Tests

#[cfg(test)]
mod tests {
    use super::{
        decode_entities, parse_app_list, parse_mute, parse_volume, VieraCommand, VieraRequest,
    };
    use crate::error::VieraError;
    use crate::soap::RequestType;

    fn request(command: VieraCommand) -> VieraRequest {
        command.into()
    }

    #[test]
    fn request_send_key() {
        assert_eq!(
            request(VieraCommand::SendKey("power".into())),
            VieraRequest::new(
                RequestType::Command,
                "X_SendKey",
                "<X_KeyEvent>NRC_POWER-ONOFF</X_KeyEvent>"
            )
        );
    }

    #[test]
    fn request_switch_to_hdmi() {
        assert_eq!(
            request(VieraCommand::SwitchToHdmi(2)),
            VieraRequest::new(
                RequestType::Command,
                "X_SendKey",
                "<X_KeyEvent>NRC_HDMI2-ONOFF</X_KeyEvent>"
            )
        );
    }

    #[test]
    fn request_launch_app() {
        assert_eq!(
            request(VieraCommand::LaunchApp("0010000200000001".into())).parameters,
            concat!(
                "<X_AppType>vc_app</X_AppType>",
                "<X_LaunchKeyword>product_id=0010000200000001</X_LaunchKeyword>"
            )
        );
        assert_eq!(
            request(VieraCommand::LaunchApp("12345".into())).parameters,
            "<X_AppType>vc_app</X_AppType><X_LaunchKeyword>resource_id=12345</X_LaunchKeyword>"
        );
    }

    #[test]
    fn request_get_app_list() {
        assert_eq!(
            request(VieraCommand::GetAppList),
            VieraRequest::new(RequestType::Command, "X_GetAppList", "None")
        );
    }

    #[test]
    fn request_volume() {
        assert_eq!(
            request(VieraCommand::GetVolume),
            VieraRequest::new(
                RequestType::Render,
                "GetVolume",
                "<InstanceID>0</InstanceID><Channel>Master</Channel>"
            )
        );
        assert_eq!(
            request(VieraCommand::SetVolume(25)).parameters,
            "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredVolume>25</DesiredVolume>"
        );
    }

    #[test]
    fn request_mute() {
        assert_eq!(request(VieraCommand::GetMute).action, "GetMute");
        assert_eq!(
            request(VieraCommand::SetMute(true)).parameters,
            "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredMute>1</DesiredMute>"
        );
        assert_eq!(
            request(VieraCommand::SetMute(false)).parameters,
            "<InstanceID>0</InstanceID><Channel>Master</Channel><DesiredMute>0</DesiredMute>"
        );
    }

    #[test]
    fn volume_parsing() {
        assert_eq!(
            parse_volume(
                "<u:GetVolumeResponse><CurrentVolume>17</CurrentVolume></u:GetVolumeResponse>"
            ),
            17
        );
        assert_eq!(parse_volume("<CurrentVolume></CurrentVolume>"), 0);
        assert_eq!(parse_volume("<nothing/>"), 0);
    }

    #[test]
    fn mute_parsing() {
        assert!(parse_mute("<CurrentMute>1</CurrentMute>"));
        assert!(!parse_mute("<CurrentMute>0</CurrentMute>"));
        assert!(parse_mute("<nothing/>"));
    }

    #[test]
    fn app_list_parsing() {
        let reply = concat!(
            "<s:Envelope><s:Body><u:X_GetAppListResponse><X_AppList>",
            "vc_app:1:&apos;product_id=0010000200000001&apos;Netflix&apos;",
            "http://x/netflix.png&apos;vc_app:2:&apos;product_id=0070000C00000001&apos;",
            "YouTube&apos;http://x/youtube.png&apos;",
            "</X_AppList></u:X_GetAppListResponse></s:Body></s:Envelope>",
            "\u{0}\u{0}garbage"
        );

        assert_eq!(
            parse_app_list(reply)
                .unwrap()
                .iter()
                .map(|app| (app.id.as_str(), app.name.as_str()))
                .collect::<Vec<_>>(),
            vec![
                ("0010000200000001", "Netflix"),
                ("0070000C00000001", "YouTube"),
            ]
        );
    }

    #[test]
    fn app_list_with_unknown_entities_and_bare_ampersands() {
        let reply = concat!(
            "<X_AppList>",
            "vc_app:1:&apos;product_id=0010000200000001&apos;Netflix & Chill&apos;icon&apos;",
            "vc_app:2:&apos;product_id=0070000C00000001&apos;Caf&eacute; TV&apos;icon&apos;",
            "vc_app:3:&apos;product_id=0387878700000003&apos;R&amp;B &#x263A;&apos;icon&apos;",
            "</X_AppList>"
        );

        assert_eq!(
            parse_app_list(reply)
                .unwrap()
                .iter()
                .map(|app| app.name.as_str())
                .collect::<Vec<_>>(),
            vec!["Netflix & Chill", "Caf&eacute; TV", "R&B \u{263A}"]
        );
    }

    #[test]
    fn entity_decoding() {
        assert_eq!(decode_entities("a &lt; b &amp;&amp; c"), "a < b && c");
        assert_eq!(decode_entities("&#65;&#x42;"), "AB");
        assert_eq!(decode_entities("&nbsp;& &;"), "&nbsp;& &;");
    }

    #[test]
    fn app_list_in_standby() {
        assert!(matches!(
            parse_app_list("<X_AppList></X_AppList>"),
            Err(VieraError::Standby(_))
        ));
        assert!(matches!(
            parse_app_list("<X_AppList>vc_app:garbage</X_AppList>junk"),
            Err(VieraError::Standby(_))
        ));
    }

    #[test]
    fn app_list_missing() {
        assert!(matches!(
            parse_app_list("<s:Envelope/>"),
            Err(VieraError::MalformedReply(_))
        ));
    }

    #[test]
    fn viera_command_display() {
        assert_eq!(VieraCommand::GetVolume.to_string(), "GetVolume");
        assert_eq!(VieraCommand::SetVolume(10).to_string(), "SetVolume(10)");
        assert_eq!(VieraCommand::SetMute(true).to_string(), "SetMute(true)");
        assert_eq!(
            VieraCommand::SendKey("MUTE".into()).to_string(),
            "SendKey(MUTE)"
        );
    }
}
