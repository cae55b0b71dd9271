//! Power state of a TV, via a UPnP event subscription.
//!
//! The TV announces its screen state (`X_ScreenState`) to event subscribers as soon as they
//! subscribe. A short-lived local HTTP listener is started to receive that NOTIFY, the TV's event
//! URL is subscribed to, and the first screen state to arrive within the subscription window is
//! the answer. The listener and subscription are always torn down afterwards.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Router;
use log::{debug, info, warn};
use reqwest::{Client, Method};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Outcome, VieraError};
use crate::network::first_local_ipv4_address;
use crate::settings::ClientSettings;
use crate::soap::extract_tag;

const EVENT_PATH: &str = "/nrc/event_0";
const SCREEN_STATE_PROPERTY: &str = "X_ScreenState";
const LISTENER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Whether the TV at `ip` reports its screen as on, using default settings.
pub async fn is_turned_on(ip: Ipv4Addr) -> bool {
    is_turned_on_with(ip, &ClientSettings::default()).await
}

/// Whether the TV at `ip` reports its screen as on.
///
/// When the TV can't be subscribed to, or doesn't report a screen state within the subscription
/// window, `settings.power_state_default` is returned.
pub async fn is_turned_on_with(ip: Ipv4Addr, settings: &ClientSettings) -> bool {
    let callback_ip = match first_local_ipv4_address() {
        Ok(callback_ip) => callback_ip,
        Err(e) => {
            warn!("Cannot determine power state of {}: {}", &ip, e);
            return settings.power_state_default;
        }
    };

    match watch_power_state(ip, callback_ip, settings).await {
        Ok(Some(is_on)) => is_on,
        Ok(None) => {
            debug!(
                "{} did not report a screen state, assuming {}",
                &ip,
                describe(settings.power_state_default)
            );
            settings.power_state_default
        }
        Err(e) => {
            warn!("Cannot determine power state of {}: {}", &ip, e);
            settings.power_state_default
        }
    }
}

fn describe(is_on: bool) -> &'static str {
    if is_on {
        "on"
    } else {
        "off"
    }
}

/// Subscribe to the TV's events and wait for a screen state.
///
/// Returns `Ok(None)` when no unambiguous screen state arrived within the window.
pub(crate) async fn watch_power_state(
    ip: Ipv4Addr,
    callback_ip: Ipv4Addr,
    settings: &ClientSettings,
) -> Outcome<Option<bool>> {
    let client = Client::builder()
        .timeout(settings.request_timeout)
        .build()
        .map_err(|e| VieraError::Internal(format!("Could not create HTTP client: {e}")))?;

    let event_url = format!("http://{}:{}{}", ip, settings.port, EVENT_PATH);

    let (notify_tx, mut notify_rx) = mpsc::channel::<Notification>(8);
    let (mut guard, callback_addr) =
        SubscriptionGuard::start(callback_ip, client, &event_url, notify_tx).await?;

    let result: Outcome<Option<bool>> = async {
        guard.subscribe(callback_addr, settings.subscription_seconds()).await?;

        let sid = guard.sid.clone();

        let screen_state = tokio::time::timeout(settings.subscription_window, async {
            while let Some(notification) = notify_rx.recv().await {
                if !notification.is_for(sid.as_deref()) {
                    debug!("Ignoring event for SID {:?}", &notification.sid);
                    continue;
                }

                match parse_screen_state(&notification.body) {
                    Some(is_on) => return Some(is_on),
                    None => debug!("Ignoring event without a usable screen state"),
                }
            }

            None
        })
        .await
        .unwrap_or(None);

        Ok(screen_state)
    }
    .await;

    guard.close().await;

    if let Ok(Some(is_on)) = result {
        info!("{} reports screen {}", &ip, describe(is_on));
    }

    result
}

/// The screen state carried by a NOTIFY body. Values other than `on`/`off` are ambiguous.
pub(crate) fn parse_screen_state(body: &str) -> Option<bool> {
    match extract_tag(body, SCREEN_STATE_PROPERTY)?.trim() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

// ------------------------------------------------------------------------------------------------
// Subscription resources
// ------------------------------------------------------------------------------------------------

/// Owns the NOTIFY listener and the event subscription.
///
/// [`SubscriptionGuard::close`] unsubscribes and stops the listener. If the guard is dropped
/// without being closed, the listener is stopped and the unsubscribe is sent from a spawned
/// task.
struct SubscriptionGuard {
    client: Client,
    event_url: String,
    sid: Option<String>,
    shutdown: CancellationToken,
    listener_task: Option<JoinHandle<()>>,
}

/// An event delivered to the listener.
#[derive(Debug)]
struct Notification {
    sid: Option<String>,
    body: String,
}

impl Notification {
    /// Whether the event belongs to the subscription granted `sid`. Without a granted SID, every
    /// event is accepted.
    fn is_for(&self, sid: Option<&str>) -> bool {
        match sid {
            Some(sid) => self.sid.as_deref() == Some(sid),
            None => true,
        }
    }
}

async fn handle_notify(
    State(notify_tx): State<mpsc::Sender<Notification>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let notification = Notification {
        sid: headers
            .get("SID")
            .and_then(|sid| sid.to_str().ok())
            .map(|sid| sid.to_string()),
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    // The receiver only needs the first usable event
    let _ = notify_tx.try_send(notification);

    StatusCode::OK
}

impl SubscriptionGuard {
    /// Start the NOTIFY listener on an ephemeral port of `callback_ip`.
    async fn start(
        callback_ip: Ipv4Addr,
        client: Client,
        event_url: &str,
        notify_tx: mpsc::Sender<Notification>,
    ) -> Outcome<(Self, SocketAddr)> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(callback_ip), 0))
            .await
            .map_err(|e| {
                VieraError::Connectivity(format!("Could not start event listener: {e}"))
            })?;

        let callback_addr = listener.local_addr().map_err(|e| {
            VieraError::Connectivity(format!("Could not start event listener: {e}"))
        })?;

        debug!("Event listener started on {}", &callback_addr);

        // NOTIFY is not a method axum routes on, so everything goes to the fallback
        let app = Router::new().fallback(handle_notify).with_state(notify_tx);

        let shutdown = CancellationToken::new();
        let shutdown_signal = shutdown.clone();

        let listener_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
                .await
            {
                warn!("Event listener error: {}", e);
            }
        });

        Ok((
            SubscriptionGuard {
                client,
                event_url: event_url.into(),
                sid: None,
                shutdown,
                listener_task: Some(listener_task),
            },
            callback_addr,
        ))
    }

    async fn subscribe(&mut self, callback_addr: SocketAddr, timeout_secs: u64) -> Outcome<()> {
        let method = gena_method("SUBSCRIBE")?;

        let response = self
            .client
            .request(method, &self.event_url)
            .header("CALLBACK", format!("<http://{callback_addr}>"))
            .header("NT", "upnp:event")
            .header("TIMEOUT", format!("Second-{timeout_secs}"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VieraError::Connectivity(format!(
                "Event subscription failed with HTTP status {}",
                response.status().as_u16()
            )));
        }

        self.sid = response
            .headers()
            .get("SID")
            .and_then(|sid| sid.to_str().ok())
            .map(|sid| sid.to_string());

        debug!("Subscribed to {} (SID {:?})", &self.event_url, &self.sid);

        Ok(())
    }

    async fn close(mut self) {
        if let Some(sid) = self.sid.take() {
            unsubscribe(&self.client, &self.event_url, &sid).await;
        }

        self.shutdown.cancel();

        if let Some(mut listener_task) = self.listener_task.take() {
            if tokio::time::timeout(LISTENER_SHUTDOWN_GRACE, &mut listener_task)
                .await
                .is_err()
            {
                listener_task.abort();
            }
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.shutdown.cancel();

        if let Some(sid) = self.sid.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let client = self.client.clone();
                let event_url = self.event_url.clone();

                runtime.spawn(async move { unsubscribe(&client, &event_url, &sid).await });
            }
        }
    }
}

async fn unsubscribe(client: &Client, event_url: &str, sid: &str) {
    let method = match gena_method("UNSUBSCRIBE") {
        Ok(method) => method,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };

    match client
        .request(method, event_url)
        .header("SID", sid)
        .send()
        .await
    {
        Ok(_) => debug!("Unsubscribed from {} (SID {})", event_url, sid),
        Err(e) => warn!("Could not unsubscribe from {}: {}", event_url, e),
    }
}

fn gena_method(name: &str) -> Outcome<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| VieraError::Internal(format!("Invalid HTTP method {name}: {e}")))
}

// ================================================================================================
// Tests

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::{HeaderMap, Method, StatusCode};
    use axum::response::IntoResponse;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::{parse_screen_state, watch_power_state, Notification};
    use crate::settings::ClientSettingsBuilder;

    #[derive(Clone)]
    struct FakeTv {
        screen_state: Option<&'static str>,
        notify_sid: &'static str,
        requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    async fn fake_tv_handler(
        State(tv): State<FakeTv>,
        method: Method,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        match method.as_str() {
            "SUBSCRIBE" => {
                let callback = header("CALLBACK").unwrap();
                tv.requests
                    .lock()
                    .unwrap()
                    .push(("SUBSCRIBE".into(), Some(callback.clone())));

                if let Some(state) = tv.screen_state {
                    let url = callback.trim_matches(|c| c == '<' || c == '>').to_string();
                    let body = format!(
                        "<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\"><e:property>\
                         <X_ScreenState>{state}</X_ScreenState></e:property></e:propertyset>"
                    );
                    let notify_sid = tv.notify_sid;

                    tokio::spawn(async move {
                        let _ = reqwest::Client::new()
                            .request(reqwest::Method::from_bytes(b"NOTIFY").unwrap(), url)
                            .header("NT", "upnp:event")
                            .header("NTS", "upnp:propchange")
                            .header("SID", notify_sid)
                            .body(body)
                            .send()
                            .await;
                    });
                }

                (StatusCode::OK, [("SID", "uuid:fake-sid")]).into_response()
            }
            "UNSUBSCRIBE" => {
                tv.requests
                    .lock()
                    .unwrap()
                    .push(("UNSUBSCRIBE".into(), header("SID")));

                StatusCode::OK.into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    async fn start_fake_tv(screen_state: Option<&'static str>) -> (SocketAddr, FakeTv) {
        start_fake_tv_notifying(screen_state, "uuid:fake-sid").await
    }

    async fn start_fake_tv_notifying(
        screen_state: Option<&'static str>,
        notify_sid: &'static str,
    ) -> (SocketAddr, FakeTv) {
        let tv = FakeTv {
            screen_state,
            notify_sid,
            requests: Arc::new(Mutex::new(vec![])),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .fallback(fake_tv_handler)
            .with_state(tv.clone());

        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (addr, tv)
    }

    #[test]
    fn screen_state_parsing() {
        assert_eq!(
            parse_screen_state("<e:property><X_ScreenState>on</X_ScreenState></e:property>"),
            Some(true)
        );
        assert_eq!(
            parse_screen_state("<X_ScreenState>off</X_ScreenState>"),
            Some(false)
        );
        assert_eq!(parse_screen_state("<X_ScreenState>none</X_ScreenState>"), None);
        assert_eq!(parse_screen_state("<e:propertyset/>"), None);
    }

    #[tokio::test]
    async fn power_state_on() {
        let (addr, tv) = start_fake_tv(Some("on")).await;
        let settings = ClientSettingsBuilder::new()
            .with_port(addr.port())
            .with_subscription_window(Duration::from_secs(2))
            .build();

        let state = watch_power_state(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &settings)
            .await
            .unwrap();

        assert_eq!(state, Some(true));

        let requests = tv.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "SUBSCRIBE");
        assert!(requests[0].1.as_ref().unwrap().starts_with("<http://127.0.0.1:"));
        assert_eq!(
            requests[1],
            ("UNSUBSCRIBE".to_string(), Some("uuid:fake-sid".to_string()))
        );
    }

    #[tokio::test]
    async fn power_state_off() {
        let (addr, _) = start_fake_tv(Some("off")).await;
        let settings = ClientSettingsBuilder::new()
            .with_port(addr.port())
            .with_subscription_window(Duration::from_secs(2))
            .build();

        assert_eq!(
            watch_power_state(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &settings)
                .await
                .unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn power_state_ignores_events_for_other_subscriptions() {
        let (addr, _) = start_fake_tv_notifying(Some("on"), "uuid:someone-else").await;
        let settings = ClientSettingsBuilder::new()
            .with_port(addr.port())
            .with_subscription_window(Duration::from_millis(500))
            .build();

        assert_eq!(
            watch_power_state(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &settings)
                .await
                .unwrap(),
            None
        );
    }

    #[test]
    fn notification_subscription_matching() {
        let notification = Notification {
            sid: Some("uuid:a".into()),
            body: String::new(),
        };

        assert!(notification.is_for(Some("uuid:a")));
        assert!(!notification.is_for(Some("uuid:b")));
        assert!(notification.is_for(None));
        assert!(!Notification {
            sid: None,
            body: String::new()
        }
        .is_for(Some("uuid:a")));
    }

    #[tokio::test]
    async fn power_state_silent_tv_still_unsubscribes() {
        let (addr, tv) = start_fake_tv(None).await;
        let settings = ClientSettingsBuilder::new()
            .with_port(addr.port())
            .with_subscription_window(Duration::from_millis(200))
            .build();

        assert_eq!(
            watch_power_state(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &settings)
                .await
                .unwrap(),
            None
        );

        let requests = tv.requests.lock().unwrap().clone();
        assert_eq!(requests.last().unwrap().0, "UNSUBSCRIBE");
    }

    #[tokio::test]
    async fn power_state_unreachable_tv() {
        // Bind then drop to get a port with nothing listening on it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let settings = ClientSettingsBuilder::new().with_port(port).build();

        assert!(
            watch_power_state(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &settings)
                .await
                .is_err()
        );
    }
}
