use std::net::Ipv4Addr;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::commands::{parse_app_list, parse_mute, parse_volume, VieraCommand, VieraRequest};
use crate::error::{Outcome, VieraError};
use crate::network::liveness_probe_with;
use crate::power_state::is_turned_on_with;
use crate::session::SessionManager;
use crate::settings::ClientSettings;
use crate::soap::{is_always_plain_text, RequestType};
use crate::transport::{post_action, HttpTransport, Transport};
use crate::types::{App, Credentials, DeviceSpecs};

const DESCRIPTION_PATH: &str = "/nrc/ddd.xml";
const CAPABILITIES_PATH: &str = "/nrc/sdd_0.xml";
const ENCRYPTION_MARKER: &str = "X_GetEncryptSessionId";

/// Controls a single Panasonic Viera TV.
///
/// A client is created with [`VieraClient::probe`] (no credentials; enough for pairing and for
/// TVs which don't require encryption) or [`VieraClient::connect`] (establishes an encrypted
/// session when the TV requires one).
///
/// Encrypted commands are sent one at a time: the session is locked for the duration of each
/// encrypted exchange, so a client can be shared between tasks.
pub struct VieraClient<T: Transport = HttpTransport> {
    ip: Ipv4Addr,
    settings: ClientSettings,
    transport: T,
    specs: DeviceSpecs,
    session: Mutex<SessionManager>,
}

impl VieraClient<HttpTransport> {
    /// Probe a TV without credentials, using default settings.
    pub async fn probe(ip: Ipv4Addr) -> Outcome<Self> {
        VieraClient::probe_with(ip, ClientSettings::default()).await
    }

    /// Probe a TV without credentials.
    ///
    /// Checks the TV is reachable and fetches its specs. No encrypted session is established.
    pub async fn probe_with(ip: Ipv4Addr, settings: ClientSettings) -> Outcome<Self> {
        let transport = reachable_transport(ip, &settings).await?;
        let specs = fetch_specs(&transport).await?;

        info!("Probed {}: {}", &ip, &specs);

        Ok(VieraClient::from_parts(ip, transport, settings, specs, None))
    }

    /// Connect to a TV using default settings.
    ///
    /// See [`VieraClient::connect_with`].
    pub async fn connect(
        ip: Ipv4Addr,
        credentials: Option<Credentials>,
        cached_specs: Option<DeviceSpecs>,
    ) -> Outcome<Self> {
        VieraClient::connect_with(ip, credentials, cached_specs, ClientSettings::default()).await
    }

    /// Connect to a TV.
    ///
    /// `cached_specs` are used when the TV's specs can't be fetched. When the TV requires
    /// encryption, `credentials` must be provided and an encrypted session is established before
    /// returning.
    pub async fn connect_with(
        ip: Ipv4Addr,
        credentials: Option<Credentials>,
        cached_specs: Option<DeviceSpecs>,
        settings: ClientSettings,
    ) -> Outcome<Self> {
        let transport = reachable_transport(ip, &settings).await?;

        VieraClient::connect_over(ip, transport, settings, credentials, cached_specs).await
    }
}

impl<T: Transport> VieraClient<T> {
    /// Connect to a TV over the given `transport`.
    ///
    /// Same as [`VieraClient::connect_with`], without the reachability check.
    pub async fn connect_over(
        ip: Ipv4Addr,
        transport: T,
        settings: ClientSettings,
        credentials: Option<Credentials>,
        cached_specs: Option<DeviceSpecs>,
    ) -> Outcome<Self> {
        let specs = match fetch_specs(&transport).await {
            Ok(specs) => specs,
            Err(e) => match cached_specs {
                Some(cached_specs) => {
                    warn!("Using cached specs for {}: {}", &ip, e);
                    cached_specs
                }
                None => {
                    error!("Cannot fetch specs for {}: {}", &ip, e);
                    return Err(e);
                }
            },
        };

        if specs.requires_encryption && credentials.is_none() {
            let msg = format!(
                "{} ({}) requires encryption but no credentials were supplied",
                &ip, &specs.model_name
            );
            error!("{}", &msg);

            return Err(VieraError::Authentication(msg));
        }

        let client = VieraClient::from_parts(ip, transport, settings, specs, credentials);

        if client.specs.requires_encryption {
            client
                .session
                .lock()
                .await
                .ensure_session(&client.transport)
                .await?;
        }

        info!("Connected to {}: {}", &ip, &client.specs);

        Ok(client)
    }

    pub(crate) fn from_parts(
        ip: Ipv4Addr,
        transport: T,
        settings: ClientSettings,
        specs: DeviceSpecs,
        credentials: Option<Credentials>,
    ) -> Self {
        VieraClient {
            ip,
            settings,
            transport,
            specs,
            session: Mutex::new(SessionManager::new(credentials)),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn specs(&self) -> &DeviceSpecs {
        &self.specs
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// The credentials in use, if any.
    pub async fn credentials(&self) -> Option<Credentials> {
        self.session.lock().await.credentials().cloned()
    }

    /// Use new `credentials` (e.g. from pairing) and establish an encrypted session with them.
    pub async fn authenticate(&self, credentials: Credentials) -> Outcome<()> {
        let mut session = self.session.lock().await;
        session.set_credentials(Some(credentials));

        if self.specs.requires_encryption {
            session.ensure_session(&self.transport).await?;
        }

        Ok(())
    }

    /// Whether the TV currently advertises the encrypted session action.
    ///
    /// Any failure reads as `false`.
    pub async fn needs_crypto(&self) -> bool {
        needs_crypto(&self.transport).await
    }

    /// Whether the TV reports its screen as on.
    ///
    /// See [`crate::is_turned_on_with`].
    pub async fn is_turned_on(&self) -> bool {
        is_turned_on_with(self.ip, &self.settings).await
    }

    /// Send a request to the TV, returning the (decrypted) reply body.
    ///
    /// Remote-control requests to a TV which requires encryption are wrapped in an encrypted
    /// command, except for the session and pairing bootstrap actions.
    pub async fn send_request(&self, request: VieraRequest) -> Outcome<String> {
        debug!(
            "Sending {} request {} to {}",
            request.request_type, &request.action, &self.ip
        );

        if self.specs.requires_encryption
            && request.request_type == RequestType::Command
            && !is_always_plain_text(&request.action)
        {
            let mut session = self.session.lock().await;

            return session
                .send_encrypted(
                    &self.transport,
                    request.request_type,
                    &request.action,
                    &request.parameters,
                )
                .await;
        }

        let reply = post_action(
            &self.transport,
            request.request_type,
            &request.action,
            &request.parameters,
        )
        .await?
        .into_success(&request.action)?;

        Ok(reply.body)
    }

    /// Send a [`VieraCommand`] to the TV, returning the reply body.
    pub async fn send_command(&self, command: VieraCommand) -> Outcome<String> {
        debug!("Sending command {} to {}", &command, &self.ip);

        self.send_request(command.into()).await
    }

    /// Press a remote-control key, e.g. `"POWER"` or `"VOLUP"`.
    pub async fn send_key(&self, code: &str) -> Outcome<()> {
        self.send_command(VieraCommand::SendKey(code.into()))
            .await
            .map(|_| ())
    }

    pub async fn switch_to_hdmi(&self, input: u8) -> Outcome<()> {
        self.send_command(VieraCommand::SwitchToHdmi(input))
            .await
            .map(|_| ())
    }

    /// Launch an app by its id (see [`VieraClient::get_apps`]).
    pub async fn launch_app(&self, app_id: &str) -> Outcome<()> {
        self.send_command(VieraCommand::LaunchApp(app_id.into()))
            .await
            .map(|_| ())
    }

    pub async fn get_volume(&self) -> Outcome<u8> {
        Ok(parse_volume(
            &self.send_command(VieraCommand::GetVolume).await?,
        ))
    }

    pub async fn set_volume(&self, volume: u8) -> Outcome<()> {
        self.send_command(VieraCommand::SetVolume(volume))
            .await
            .map(|_| ())
    }

    pub async fn get_mute(&self) -> Outcome<bool> {
        Ok(parse_mute(
            &self.send_command(VieraCommand::GetMute).await?,
        ))
    }

    pub async fn set_mute(&self, mute: bool) -> Outcome<()> {
        self.send_command(VieraCommand::SetMute(mute))
            .await
            .map(|_| ())
    }

    /// The apps installed on the TV.
    ///
    /// A TV in standby reports no apps, which is returned as [`VieraError::Standby`].
    pub async fn get_apps(&self) -> Outcome<Vec<App>> {
        parse_app_list(&self.send_command(VieraCommand::GetAppList).await?)
    }
}

/// Create a transport to `ip`, failing if the TV isn't accepting connections.
async fn reachable_transport(ip: Ipv4Addr, settings: &ClientSettings) -> Outcome<HttpTransport> {
    if !liveness_probe_with(ip, settings.port, settings.liveness_timeout).await {
        let msg = format!(
            "{} is not reachable; make sure the TV is on and connected to the network",
            &ip
        );
        error!("{}", &msg);

        return Err(VieraError::Connectivity(msg));
    }

    HttpTransport::new(ip, settings)
}

/// Fetch a TV's specs from its description and capability documents.
async fn fetch_specs<T: Transport + ?Sized>(transport: &T) -> Outcome<DeviceSpecs> {
    let description = transport
        .get(DESCRIPTION_PATH)
        .await?
        .into_success("Device description request")?;

    let requires_encryption = needs_crypto(transport).await;

    DeviceSpecs::from_description(&description.body, requires_encryption)
}

async fn needs_crypto<T: Transport + ?Sized>(transport: &T) -> bool {
    match transport.get(CAPABILITIES_PATH).await {
        Ok(reply) if reply.is_success() => reply.body.contains(ENCRYPTION_MARKER),
        Ok(reply) => {
            warn!("Capability request failed with HTTP status {}", reply.status);
            false
        }
        Err(e) => {
            warn!("Capability request failed: {}", e);
            false
        }
    }
}

// ================================================================================================
// Tests
