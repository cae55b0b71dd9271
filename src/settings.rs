use std::time::Duration;

/// Default TCP port of the Viera control surface.
pub const DEFAULT_PORT: u16 = 55000;

/// Settings to use when talking to a TV. Can be created with [`ClientSettingsBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// TV control port.
    pub port: u16,
    /// Timeout applied to each SOAP/HTTP request.
    pub request_timeout: Duration,
    /// Timeout for the TCP liveness probe.
    pub liveness_timeout: Duration,
    /// How long to wait for a power-state NOTIFY after subscribing.
    pub subscription_window: Duration,
    /// Power state assumed when the TV does not report one in time.
    pub power_state_default: bool,
    /// Name shown on the TV while pairing.
    pub device_name: String,
    /// How long discovery waits for SSDP responses.
    pub discovery_window: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettingsBuilder::new().build()
    }
}

/// Build a [`ClientSettings`] instance.
///
/// Examples:
/// ```
/// use std::time::Duration;
/// use viera_client::ClientSettingsBuilder;
///
/// // Default client settings
/// ClientSettingsBuilder::default();
///
/// // Client settings with overrides
/// ClientSettingsBuilder::new()
///     .with_request_timeout(Duration::from_secs(5))
///     .with_device_name("Living Room Remote")
///     .build();
/// ```
pub struct ClientSettingsBuilder {
    port: u16,
    request_timeout: Duration,
    liveness_timeout: Duration,
    subscription_window: Duration,
    power_state_default: bool,
    device_name: String,
    discovery_window: Duration,
}

impl Default for ClientSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSettingsBuilder {
    pub fn new() -> Self {
        Self {
            port: DEFAULT_PORT,
            request_timeout: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(2),
            subscription_window: Duration::from_secs(1),
            power_state_default: false,
            device_name: "MyRemote".into(),
            discovery_window: Duration::from_secs(5),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// How long to wait for the TV to report its power state. The subscription `TIMEOUT` sent to
    /// the TV is this window rounded up to whole seconds (at least one); the wait itself is not
    /// rounded.
    pub fn with_subscription_window(mut self, window: Duration) -> Self {
        self.subscription_window = window;
        self
    }

    /// Treat a TV which doesn't report its power state as turned on.
    pub fn with_power_state_default_on(mut self) -> Self {
        self.power_state_default = true;
        self
    }

    pub fn with_device_name(mut self, name: &str) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_discovery_window(mut self, window: Duration) -> Self {
        self.discovery_window = window;
        self
    }

    pub fn build(&mut self) -> ClientSettings {
        ClientSettings {
            port: self.port,
            request_timeout: self.request_timeout,
            liveness_timeout: self.liveness_timeout,
            subscription_window: self.subscription_window,
            power_state_default: self.power_state_default,
            device_name: self.device_name.clone(),
            discovery_window: self.discovery_window,
        }
    }
}

impl ClientSettings {
    /// Subscription window in whole seconds, as sent in the GENA `TIMEOUT` header.
    pub(crate) fn subscription_seconds(&self) -> u64 {
        let secs = self.subscription_window.as_secs();
        let has_fraction = self.subscription_window.subsec_nanos() > 0;

        (secs + u64::from(has_fraction)).max(1)
    }
}

// ================================================================================================
// Tests

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ClientSettings, ClientSettingsBuilder};

    #[test]
    fn client_settings_default() {
        assert_eq!(
            ClientSettings::default(),
            ClientSettings {
                port: 55000,
                request_timeout: Duration::from_secs(2),
                liveness_timeout: Duration::from_secs(2),
                subscription_window: Duration::from_secs(1),
                power_state_default: false,
                device_name: "MyRemote".into(),
                discovery_window: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn client_settings_builder() {
        assert_eq!(
            ClientSettingsBuilder::new()
                .with_port(8080)
                .with_request_timeout(Duration::from_millis(500))
                .with_liveness_timeout(Duration::from_millis(250))
                .with_subscription_window(Duration::from_secs(3))
                .with_power_state_default_on()
                .with_device_name("Den")
                .with_discovery_window(Duration::from_secs(1))
                .build(),
            ClientSettings {
                port: 8080,
                request_timeout: Duration::from_millis(500),
                liveness_timeout: Duration::from_millis(250),
                subscription_window: Duration::from_secs(3),
                power_state_default: true,
                device_name: "Den".into(),
                discovery_window: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn subscription_seconds_rounding() {
        let settings = |window| {
            ClientSettingsBuilder::new()
                .with_subscription_window(window)
                .build()
        };

        assert_eq!(settings(Duration::from_secs(1)).subscription_seconds(), 1);
        assert_eq!(settings(Duration::from_millis(1500)).subscription_seconds(), 2);
        assert_eq!(settings(Duration::ZERO).subscription_seconds(), 1);
    }
}
