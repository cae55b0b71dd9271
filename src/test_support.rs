//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::crypto::{derive_session_key, encrypt, SessionKeys};
use crate::error::{Outcome, VieraError};
use crate::transport::{Transport, TransportReply};

/// Credentials key seed used across tests.
pub(crate) const SEED: &str = "EBESExQVFhcYGRobHB0eHw==";

/// A request captured by [`StubTransport`]. `soap_action` is `None` for GETs.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub path: String,
    pub soap_action: Option<String>,
    pub body: String,
}

/// A [`Transport`] which replays scripted replies and records every request.
pub(crate) struct StubTransport {
    replies: Mutex<VecDeque<Outcome<TransportReply>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    stall_next: AtomicBool,
}

impl StubTransport {
    pub fn new(replies: Vec<Outcome<TransportReply>>) -> Self {
        StubTransport {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(vec![]),
            stall_next: AtomicBool::new(false),
        }
    }

    /// Make the next POST record its request and then never complete. No reply is consumed.
    pub fn stall_next(&self) {
        self.stall_next.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// The SOAP action of each POSTed request, without its URN.
    pub fn actions(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.soap_action.as_ref())
            .map(|a| {
                a.trim_matches('"')
                    .rsplit('#')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    fn next_reply(&self, request: RecordedRequest) -> Outcome<TransportReply> {
        self.requests.lock().unwrap().push(request);

        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(VieraError::Connectivity("no scripted reply".into())))
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn post_soap(
        &self,
        path: &str,
        soap_action: &str,
        body: String,
    ) -> Outcome<TransportReply> {
        let request = RecordedRequest {
            path: path.into(),
            soap_action: Some(soap_action.into()),
            body,
        };

        if self.stall_next.swap(false, Ordering::SeqCst) {
            self.requests.lock().unwrap().push(request);
            return std::future::pending().await;
        }

        self.next_reply(request)
    }

    async fn get(&self, path: &str) -> Outcome<TransportReply> {
        self.next_reply(RecordedRequest {
            path: path.into(),
            soap_action: None,
            body: String::new(),
        })
    }
}

pub(crate) fn seed_keys() -> SessionKeys {
    derive_session_key(SEED).unwrap()
}

/// A 200 reply carrying `plaintext` encrypted with the [`SEED`] session keys.
pub(crate) fn encrypted_reply(plaintext: &str) -> Outcome<TransportReply> {
    let keys = seed_keys();
    let encrypted = encrypt(plaintext, &keys.key, &keys.iv, &keys.hmac_key).unwrap();

    Ok(TransportReply::new(
        200,
        &format!(
            "<s:Envelope><s:Body><u:Response><X_EncResult>{encrypted}</X_EncResult>\
             </u:Response></s:Body></s:Envelope>"
        ),
    ))
}

/// The TV's reply to session establishment, granting `session_id`.
pub(crate) fn session_reply(session_id: u32) -> Outcome<TransportReply> {
    encrypted_reply(&format!(
        "<X_GetEncryptSessionIdResult><X_SessionId>{session_id}</X_SessionId>\
         </X_GetEncryptSessionIdResult>"
    ))
}

/// A successful encrypted command reply.
pub(crate) fn command_reply(action: &str) -> Outcome<TransportReply> {
    encrypted_reply(&format!(
        "<X_OriginalResult><u:{action}Response></u:{action}Response></X_OriginalResult>"
    ))
}

/// The TV's SOAP fault for a session it no longer recognizes.
pub(crate) fn session_invalid_reply() -> Outcome<TransportReply> {
    Ok(TransportReply::new(
        500,
        "<s:Envelope><s:Body><s:Fault><detail><UPnPError><errorCode>401</errorCode>\
         <errorDescription>Invalid Action</errorDescription></UPnPError></detail>\
         </s:Fault></s:Body></s:Envelope>",
    ))
}

/// Decrypt the inner document of a recorded `X_EncryptedCommand` request.
pub(crate) fn decrypt_request(request: &RecordedRequest) -> String {
    let keys = seed_keys();
    let enc_info = crate::soap::extract_tag(&request.body, "X_EncInfo").unwrap();

    crate::crypto::decrypt(enc_info, &keys.key, &keys.iv).unwrap()
}
