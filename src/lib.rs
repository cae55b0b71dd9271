/*!
Asynchronous control client for Panasonic Viera TVs.

[`VieraClient`] controls Panasonic Viera TVs over their UPnP/SOAP network-control surface on port
55000, including the encrypted sessions required by 2018 and later models.

## Features

* SSDP discovery of Viera TVs.
* Liveness and power-state checks.
* PIN pairing for TVs which require encryption.
* Encrypted sessions, with transparent recovery when the TV forgets a session.
* Remote-control keys, HDMI input switching, app listing and launching.
* Volume and mute control.
* Wake-on-LAN support.
* A browser-based pairing form.

## Overview

Most TVs made since 2018 wrap every remote-control command in an AES-CBC encrypted, HMAC-signed
envelope. Talking to these TVs requires [`Credentials`] (an application id and a key seed), which
are issued by the TV once during PIN pairing and then persisted by the caller. Older TVs accept
plain SOAP requests and need no credentials.

Volume and mute go through the TV's UPnP rendering-control service and are never encrypted.

To view the full documentation, clone the repository and run `cargo doc --open`.

Run the examples with:

```sh
cargo run --example discover
cargo run --example control -- 192.168.1.20
cargo run --example pairing_form
```

## Common usage flow

1. **Discover** Viera TVs on the network with [`discover_viera_devices`].
2. **Probe** the TV with [`VieraClient::probe`] to learn whether it requires encryption.
3. **Pair** with a [`PairingFlow`] if it does, and persist the resulting [`Credentials`].
4. **Connect** with [`VieraClient::connect`], passing the credentials.
5. **Send** commands for as long as desired.

## Connecting

[`VieraClient::connect`] fetches the TV's [`DeviceSpecs`] and, when the TV requires encryption,
establishes an encrypted session. The specs can be persisted and passed back on later connects;
they are used when the TV doesn't answer description requests.

```no_run
use std::net::Ipv4Addr;
use viera_client::{Credentials, VieraClient};

# #[tokio::main]
# async fn main() -> Result<(), viera_client::VieraError> {
let credentials = Credentials::new("APPID", "S2V5U2VlZA==");
let tv = VieraClient::connect(Ipv4Addr::new(192, 168, 1, 20), Some(credentials), None).await?;

tv.send_key("VOLUP").await?;
println!("Volume is now {}", tv.get_volume().await?);
# Ok(())
# }
```

Settings such as timeouts and the TV port can be configured with the [`ClientSettingsBuilder`]
and passed to [`VieraClient::connect_with`].

### Pairing

Pairing requires the TV to be turned on. [`PairingFlow::request_pin_code`] asks the TV to display
a PIN, and [`PairingFlow::authorize_pin_code`] submits it. See [`PairingFlow`] for an example.

### Sessions

Encrypted commands are numbered within a session. When the TV no longer recognizes a session
(e.g. after it was restarted), the client establishes a new session and retries the command once.
A second rejection is returned as [`VieraError::SessionInvalidated`].

## Sending commands

Commands can be sent with the convenience methods on [`VieraClient`] (such as
[`VieraClient::send_key`]), or as a [`VieraCommand`] with [`VieraClient::send_command`]. Arbitrary
SOAP actions can be sent as a [`VieraRequest`] with [`VieraClient::send_request`].

A TV in standby is often still reachable. Listing apps on such a TV returns
[`VieraError::Standby`].

## Power state

[`is_turned_on`] briefly subscribes to the TV's event service and waits for it to report its
screen state. A TV which doesn't report in time is treated as off (configurable with
[`ClientSettingsBuilder::with_power_state_default_on`]).

## Limitations

Only IPv4 is supported. TV-specific extras (channel lists, EPG, media rendering) are not
implemented.
*/

mod commands;
mod crypto;
mod discovery;
mod error;
mod network;
mod pairing;
pub mod pairing_server;
mod power_state;
mod session;
mod settings;
mod soap;
mod transport;
mod types;
mod viera_client;

#[cfg(test)]
mod test_support;

pub use commands::{VieraCommand, VieraRequest};
pub use crypto::{
    decrypt, decrypt_raw, derive_challenge_keys, derive_session_key, encrypt, SessionKeys,
};
pub use discovery::{discover_viera_devices, discover_viera_devices_with};
pub use error::{Outcome, VieraError};
pub use macaddr::MacAddr6;
pub use network::{liveness_probe, liveness_probe_with, wake_on_lan};
pub use pairing::{PairingFlow, PairingState};
pub use power_state::{is_turned_on, is_turned_on_with};
pub use settings::{ClientSettings, ClientSettingsBuilder, DEFAULT_PORT};
pub use soap::{extract_tag, RequestType};
pub use transport::{HttpTransport, Transport, TransportReply};
pub use types::{App, Credentials, DeviceSpecs};
pub use viera_client::VieraClient;
