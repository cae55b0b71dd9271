use std::fmt;

use quick_xml::de::from_str as xml_from_str;
use serde::{Deserialize, Serialize};

use crate::error::{Outcome, VieraError};

/// Device specs for a Viera TV.
///
/// Fetched from the TV's unauthenticated description endpoints. Can be persisted by the caller
/// and passed back to [`crate::VieraClient::connect`] as a fallback for when the TV is not
/// answering description requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpecs {
    pub friendly_name: String,
    pub model_name: String,
    pub model_number: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub requires_encryption: bool,
}

impl fmt::Display for DeviceSpecs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}, model {}{})",
            self.friendly_name,
            self.model_name,
            self.model_number,
            if self.requires_encryption {
                ", requires encryption"
            } else {
                ""
            }
        )
    }
}

// Subset of the UPnP device description served at /nrc/ddd.xml.
#[derive(Deserialize)]
struct DescriptionRoot {
    device: DeviceDescription,
}

#[derive(Deserialize)]
struct DeviceDescription {
    #[serde(rename = "friendlyName", default)]
    friendly_name: String,
    #[serde(rename = "modelName", default)]
    model_name: String,
    #[serde(rename = "modelNumber", default)]
    model_number: String,
    #[serde(default)]
    manufacturer: String,
    #[serde(rename = "UDN")]
    udn: String,
}

impl DeviceSpecs {
    /// Build specs from a UPnP device description document.
    ///
    /// The serial number is the device UDN without its `uuid:` prefix.
    pub(crate) fn from_description(xml: &str, requires_encryption: bool) -> Outcome<Self> {
        let root: DescriptionRoot = xml_from_str(xml).map_err(|e| {
            VieraError::MalformedReply(format!("Unreadable device description: {e}"))
        })?;

        let device = root.device;
        let udn = device.udn.trim();

        Ok(DeviceSpecs {
            friendly_name: device.friendly_name,
            model_name: device.model_name,
            model_number: device.model_number,
            manufacturer: device.manufacturer,
            serial_number: udn.strip_prefix("uuid:").unwrap_or(udn).to_string(),
            requires_encryption,
        })
    }
}

/// Pairing credentials for a TV which requires encryption.
///
/// Produced by [`crate::PairingFlow`] and persisted by the caller.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    /// Application id issued by the TV during pairing.
    #[serde(rename = "appId")]
    pub app_id: String,
    /// Base64 session key seed issued by the TV during pairing.
    #[serde(rename = "encKey")]
    pub key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize)]
struct SampleTvConfig<'a> {
    #[serde(rename = "encKey", skip_serializing_if = "Option::is_none")]
    enc_key: Option<&'a str>,
    #[serde(rename = "appId", skip_serializing_if = "Option::is_none")]
    app_id: Option<&'a str>,
    #[serde(rename = "hdmiInputs")]
    hdmi_inputs: Vec<()>,
}

#[derive(Serialize)]
struct SampleConfig<'a> {
    platform: &'static str,
    tvs: Vec<SampleTvConfig<'a>>,
}

impl Credentials {
    pub fn new(app_id: &str, key: &str) -> Self {
        Credentials {
            app_id: app_id.into(),
            key: key.into(),
        }
    }

    /// Render a starting-point JSON configuration snippet for a home automation platform.
    ///
    /// `credentials` is `None` for TVs which don't require encryption.
    pub fn sample_config(credentials: Option<&Credentials>) -> Outcome<String> {
        let sample = SampleConfig {
            platform: "PanasonicVieraTV",
            tvs: vec![SampleTvConfig {
                enc_key: credentials.map(|c| c.key.as_str()),
                app_id: credentials.map(|c| c.app_id.as_str()),
                hdmi_inputs: vec![],
            }],
        };

        serde_json::to_string_pretty(&sample)
            .map_err(|e| VieraError::Internal(format!("Could not render sample config: {e}")))
    }
}

/// An application installed on the TV.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.id)
    }
}

// ================================================================================================
// Tests
