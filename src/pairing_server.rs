//! A minimal browser-based pairing helper.
//!
//! Serves a form on `GET /` which walks through pairing in three steps, driven by query
//! parameters:
//!
//! 1. No parameters: ask for the TV's IP address.
//! 2. `?ip=`: probe the TV, ask it to display a PIN code, and ask for the PIN. The challenge key is
//!    carried to the next step in a hidden field.
//! 3. `?pin=&tv=&challenge=`: submit the PIN and show the resulting credentials.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use log::{info, warn};
use quick_xml::escape::escape;
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::error::{Outcome, VieraError};
use crate::pairing::PairingFlow;
use crate::settings::ClientSettings;
use crate::types::Credentials;
use crate::viera_client::VieraClient;

/// Port the pairing form is conventionally served on.
pub const DEFAULT_PAIRING_PORT: u16 = 8973;

#[derive(Debug, Default, Deserialize)]
struct PairingQuery {
    ip: Option<String>,
    pin: Option<String>,
    tv: Option<String>,
    challenge: Option<String>,
}

type Page = (StatusCode, Html<String>);

/// Serve the pairing form on all interfaces on `port` until the process exits.
pub async fn serve(port: u16) -> Outcome<()> {
    serve_with(port, ClientSettings::default()).await
}

/// Serve the pairing form, talking to TVs with the given `settings`.
pub async fn serve_with(port: u16, settings: ClientSettings) -> Outcome<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| VieraError::Connectivity(format!("Cannot listen on {addr}: {e}")))?;

    info!("Pairing form available at http://localhost:{}/", port);

    axum::serve(listener, router(settings))
        .await
        .map_err(|e| VieraError::Connectivity(format!("Pairing form server failed: {e}")))
}

fn router(settings: ClientSettings) -> Router {
    Router::new().route("/", get(pairing_page)).with_state(settings)
}

async fn pairing_page(
    State(settings): State<ClientSettings>,
    Query(query): Query<PairingQuery>,
) -> Page {
    match (&query.pin, &query.ip) {
        (Some(pin), _) => submit_pin_page(settings, pin, &query).await,
        (None, Some(ip)) => request_pin_page(settings, ip).await,
        (None, None) => page(
            StatusCode::OK,
            concat!(
                "<form action=\"/\">",
                "<label for=\"ip\">Please enter your Panasonic Viera (2018 or later model) IP ",
                "address:</label><br />",
                "<input type=\"text\" id=\"ip\" name=\"ip\" />",
                "<input type=\"submit\" value=\"Submit\" />",
                "</form>"
            ),
        ),
    }
}

async fn request_pin_page(settings: ClientSettings, ip: &str) -> Page {
    let shown_ip = escape(ip);

    let Ok(ip) = ip.trim().parse::<Ipv4Addr>() else {
        return page(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("The supplied TV IP address ('{shown_ip}') is NOT a valid IPv4 address..."),
        );
    };

    let client = match VieraClient::probe_with(ip, settings).await {
        Ok(client) => client,
        Err(VieraError::Connectivity(_)) => {
            return page(
                StatusCode::OK,
                &format!("The supplied TV IP address '{ip}' is unreachable..."),
            )
        }
        Err(e) => {
            warn!("Cannot fetch specs from {}: {}", &ip, e);
            return page(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!(
                    "An unexpected error occurred: unable to fetch specs from the TV at {ip}."
                ),
            );
        }
    };

    let model = escape(&client.specs().model_number).into_owned();

    if !client.specs().requires_encryption {
        return page(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Found a <b>{model}</b> at {ip}! This model does not require encryption."),
        );
    }

    let mut pairing = PairingFlow::new(&client);

    match pairing.request_pin_code().await {
        Ok(()) => {
            let challenge = pairing.challenge().unwrap_or_default();

            page(
                StatusCode::OK,
                &format!(
                    concat!(
                        "Found a <b>{model}</b> at {ip}, which requires encryption.<br />",
                        "<form action=\"/\">",
                        "<label for=\"pin\">Please enter the PIN just displayed on the TV:</label>",
                        "<br /><input type=\"text\" id=\"pin\" name=\"pin\" />",
                        "<input type=\"hidden\" value=\"{ip}\" name=\"tv\" />",
                        "<input type=\"hidden\" value=\"{challenge}\" name=\"challenge\" />",
                        "<input type=\"submit\" value=\"Submit\" />",
                        "</form>"
                    ),
                    model = model,
                    ip = ip,
                    challenge = escape(&challenge),
                ),
            )
        }
        Err(VieraError::Standby(_)) => page(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!(
                "Found a <b>{model}</b> at {ip}, which requires encryption, but the TV seems to be \
                 in standby. <b>Please turn it ON</b> and try again..."
            ),
        ),
        Err(e) => {
            warn!("PIN code request to {} failed: {}", &ip, e);
            page(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!(
                    "Found a <b>{model}</b> at {ip}, which requires encryption, but an unexpected \
                     error occurred while requesting a PIN code. Please make sure that the TV is \
                     powered ON (and NOT in standby)."
                ),
            )
        }
    }
}

async fn submit_pin_page(settings: ClientSettings, pin: &str, query: &PairingQuery) -> Page {
    let (Some(tv), Some(challenge)) = (&query.tv, &query.challenge) else {
        return page(StatusCode::OK, "");
    };

    let Ok(ip) = tv.trim().parse::<Ipv4Addr>() else {
        return page(StatusCode::OK, "");
    };

    let client = match VieraClient::probe_with(ip, settings).await {
        Ok(client) if client.specs().requires_encryption => client,
        _ => return page(StatusCode::OK, ""),
    };

    let mut pairing = PairingFlow::new(&client);

    match pairing.authorize_pin_code(pin.trim(), Some(challenge)).await {
        Ok(credentials) => page(StatusCode::OK, &credentials_html(&credentials)),
        Err(_) => page(StatusCode::INTERNAL_SERVER_ERROR, "Wrong PIN code..."),
    }
}

fn credentials_html(credentials: &Credentials) -> String {
    let config = Credentials::sample_config(Some(credentials)).unwrap_or_default();

    format!(
        concat!(
            "Paired with your TV successfully!<br />",
            "<b>Encryption Key</b>: {key}<br />",
            "<b>AppId</b>: {app_id}<br />",
            "<pre>{config}</pre>"
        ),
        key = escape(&credentials.key),
        app_id = escape(&credentials.app_id),
        config = escape(&config),
    )
}

fn page(status: StatusCode, content: &str) -> Page {
    (
        status,
        Html(format!("<html><body>{content}</body></html>")),
    )
}

// ================================================================================================
// Tests
