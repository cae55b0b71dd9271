use log::{debug, error, info, warn};

use crate::crypto::{decrypt, derive_session_key, encrypt, SessionKeys};
use crate::error::{Outcome, VieraError};
use crate::soap::{
    extract_tag, render_app_id_with_enc_info, render_encrypted_inner, RequestType,
    ENCRYPTED_COMMAND_ACTION, SESSION_ID_ACTION,
};
use crate::transport::{post_action, Transport, TransportReply};
use crate::types::Credentials;

// The sequence number is sent as 8 digits; larger values wrap.
const SEQ_NUM_MODULUS: u32 = 100_000_000;

// ------------------------------------------------------------------------------------------------
// Session state
// ------------------------------------------------------------------------------------------------

/// An encrypted session granted by the TV.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ActiveSession {
    pub keys: SessionKeys,
    pub id: u32,
    pub seq_num: u32,
}

/// Session life-cycle.
///
/// `Establishing` is only observable if an establishment exchange was abandoned part way
/// through, and is treated the same as `NoSession`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionState {
    NoSession,
    Establishing,
    Active(ActiveSession),
}

/// Owns the encrypted session with a single TV.
///
/// The session is established lazily on the first encrypted request. When the TV reports that it
/// no longer recognizes the session, it is re-established once and the request retried once.
#[derive(Debug)]
pub(crate) struct SessionManager {
    credentials: Option<Credentials>,
    state: SessionState,
}

impl SessionManager {
    pub fn new(credentials: Option<Credentials>) -> Self {
        SessionManager {
            credentials,
            state: SessionState::NoSession,
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Replace the credentials. Any existing session is dropped.
    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
        self.state = SessionState::NoSession;
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Establish a session unless one is already active.
    pub async fn ensure_session<T: Transport + ?Sized>(&mut self, transport: &T) -> Outcome<()> {
        match self.state {
            SessionState::Active(_) => Ok(()),
            SessionState::NoSession | SessionState::Establishing => self.establish(transport).await,
        }
    }

    async fn establish<T: Transport + ?Sized>(&mut self, transport: &T) -> Outcome<()> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            VieraError::Authentication("No credentials for a TV which requires encryption".into())
        })?;

        self.state = SessionState::Establishing;

        let keys = derive_session_key(&credentials.key)?;
        let enc_info = encrypt(
            &format!("<X_ApplicationId>{}</X_ApplicationId>", credentials.app_id),
            &keys.key,
            &keys.iv,
            &keys.hmac_key,
        )?;

        debug!("Requesting encrypted session");

        let reply = post_action(
            transport,
            RequestType::Command,
            SESSION_ID_ACTION,
            &render_app_id_with_enc_info(&credentials.app_id, &enc_info),
        )
        .await?
        .into_success("Session establishment")?;

        let decrypted = decrypt_enc_result(&reply.body, &keys)?;

        let id = extract_tag(&decrypted, "X_SessionId")
            .and_then(|id| id.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                let msg = "Session establishment reply has no numeric X_SessionId";
                error!("{}", msg);

                VieraError::MalformedReply(msg.into())
            })?;

        info!("Encrypted session {} established", id);

        self.state = SessionState::Active(ActiveSession {
            keys,
            id,
            seq_num: 1,
        });

        Ok(())
    }

    /// Send `action` inside an `X_EncryptedCommand`, returning the decrypted reply.
    pub async fn send_encrypted<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        request_type: RequestType,
        action: &str,
        parameters: &str,
    ) -> Outcome<String> {
        self.ensure_session(transport).await?;

        let reply = self
            .post_encrypted(transport, request_type, action, parameters)
            .await?;

        if !is_session_invalidated(&reply) {
            return self.decode_reply(reply, action);
        }

        warn!("TV no longer recognizes the session, re-establishing");
        self.state = SessionState::NoSession;

        if let Err(e) = self.establish(transport).await {
            self.state = SessionState::NoSession;

            return Err(VieraError::SessionInvalidated(format!(
                "Could not re-establish session: {e}"
            )));
        }

        let retry = self
            .post_encrypted(transport, request_type, action, parameters)
            .await?;

        if is_session_invalidated(&retry) {
            let msg = format!("Session rejected again after re-establishing ({action})");
            error!("{}", &msg);
            self.state = SessionState::NoSession;

            return Err(VieraError::SessionInvalidated(msg));
        }

        self.decode_reply(retry, action)
    }

    async fn post_encrypted<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        request_type: RequestType,
        action: &str,
        parameters: &str,
    ) -> Outcome<TransportReply> {
        let app_id = self
            .credentials
            .as_ref()
            .map(|c| c.app_id.clone())
            .ok_or_else(|| VieraError::Internal("Encrypted request without credentials".into()))?;

        let session = match &mut self.state {
            SessionState::Active(session) => session,
            _ => {
                return Err(VieraError::Internal(
                    "Encrypted request without an active session".into(),
                ))
            }
        };

        session.seq_num = (session.seq_num + 1) % SEQ_NUM_MODULUS;

        let inner = render_encrypted_inner(
            session.id,
            session.seq_num,
            action,
            request_type.urn(),
            parameters,
        );

        let enc_info = encrypt(
            &inner,
            &session.keys.key,
            &session.keys.iv,
            &session.keys.hmac_key,
        )?;

        post_action(
            transport,
            request_type,
            ENCRYPTED_COMMAND_ACTION,
            &render_app_id_with_enc_info(&app_id, &enc_info),
        )
        .await
    }

    fn decode_reply(&self, reply: TransportReply, action: &str) -> Outcome<String> {
        let reply = reply.into_success(action)?;

        match &self.state {
            SessionState::Active(session) => decrypt_enc_result(&reply.body, &session.keys),
            _ => Err(VieraError::Internal(
                "Encrypted reply without an active session".into(),
            )),
        }
    }
}

fn decrypt_enc_result(body: &str, keys: &SessionKeys) -> Outcome<String> {
    let enc_result = extract_tag(body, "X_EncResult").ok_or_else(|| {
        let msg = "Reply has no X_EncResult";
        error!("{}", msg);

        VieraError::MalformedReply(msg.into())
    })?;

    decrypt(enc_result, &keys.key, &keys.iv)
}

/// Whether the TV rejected a request because it doesn't recognize the session.
///
/// The TV answers with a SOAP fault carrying UPnP error code 401, or (on some firmware) an error
/// description mentioning the session.
pub(crate) fn is_session_invalidated(reply: &TransportReply) -> bool {
    if reply.is_success() {
        return false;
    }

    if reply.body.contains("<errorCode>401</errorCode>") {
        return true;
    }

    let body = reply.body.to_lowercase();

    body.contains("session")
        && ["invalid", "unknown", "expired", "not found"]
            .iter()
            .any(|reason| body.contains(reason))
}

// ================================================================================================
// Tests

#[cfg(test)]
mod tests {
    use super::{is_session_invalidated, SessionManager, SessionState};
    use crate::error::VieraError;
    use crate::soap::RequestType;
    use crate::test_support::{
        command_reply, decrypt_request, session_invalid_reply, session_reply, StubTransport, SEED,
    };
    use crate::transport::TransportReply;
    use crate::types::Credentials;

    const SEND_KEY_PARAMS: &str = "<X_KeyEvent>NRC_MUTE-ONOFF</X_KeyEvent>";

    fn credentials() -> Option<Credentials> {
        Some(Credentials::new("APPID", SEED))
    }

    fn session_id_and_seq(manager: &SessionManager) -> (u32, u32) {
        match manager.state() {
            SessionState::Active(session) => (session.id, session.seq_num),
            other => panic!("session not active: {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_establishment() {
        let stub = StubTransport::new(vec![session_reply(4242)]);
        let mut manager = SessionManager::new(credentials());

        manager.ensure_session(&stub).await.unwrap();

        assert_eq!(session_id_and_seq(&manager), (4242, 1));
        assert_eq!(stub.actions(), vec!["X_GetEncryptSessionId"]);

        let request = &stub.requests()[0];
        assert_eq!(request.path, "/nrc/control_0");
        assert!(request
            .body
            .contains("<X_ApplicationId>APPID</X_ApplicationId> <X_EncInfo>"));

        // Already active, so no further requests
        manager.ensure_session(&stub).await.unwrap();
        assert_eq!(stub.requests().len(), 1);
    }

    #[tokio::test]
    async fn session_requires_credentials() {
        let stub = StubTransport::new(vec![]);
        let mut manager = SessionManager::new(None);

        assert!(matches!(
            manager.ensure_session(&stub).await,
            Err(VieraError::Authentication(_))
        ));
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn session_rejects_non_numeric_id() {
        let stub = StubTransport::new(vec![crate::test_support::encrypted_reply(
            "<X_SessionId>abc</X_SessionId>",
        )]);
        let mut manager = SessionManager::new(credentials());

        assert!(matches!(
            manager.ensure_session(&stub).await,
            Err(VieraError::MalformedReply(_))
        ));
        assert_eq!(manager.state(), &SessionState::Establishing);
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_command() {
        let stub = StubTransport::new(vec![
            session_reply(7),
            command_reply("X_SendKey"),
            command_reply("X_SendKey"),
            command_reply("X_SendKey"),
        ]);
        let mut manager = SessionManager::new(credentials());

        for _ in 0..3 {
            let reply = manager
                .send_encrypted(&stub, RequestType::Command, "X_SendKey", SEND_KEY_PARAMS)
                .await
                .unwrap();

            assert!(reply.ends_with("</X_OriginalResult>"));
        }

        assert_eq!(session_id_and_seq(&manager), (7, 4));

        let requests = stub.requests();
        for (request, expected_seq) in requests[1..].iter().zip(2..) {
            let inner = decrypt_request(request);

            assert!(inner.starts_with("<X_SessionId>7</X_SessionId>"));
            assert!(inner.contains(&format!(
                "<X_SequenceNumber>{:08}</X_SequenceNumber>",
                expected_seq
            )));
            assert!(inner.contains(SEND_KEY_PARAMS));
        }
    }

    #[tokio::test]
    async fn invalidated_session_is_recovered_once() {
        let stub = StubTransport::new(vec![
            session_reply(1),
            command_reply("X_SendKey"),
            session_invalid_reply(),
            session_reply(2),
            command_reply("X_SendKey"),
        ]);
        let mut manager = SessionManager::new(credentials());

        manager
            .send_encrypted(&stub, RequestType::Command, "X_SendKey", SEND_KEY_PARAMS)
            .await
            .unwrap();
        assert_eq!(session_id_and_seq(&manager), (1, 2));

        manager
            .send_encrypted(&stub, RequestType::Command, "X_SendKey", SEND_KEY_PARAMS)
            .await
            .unwrap();

        // The new session restarts its sequence numbers
        assert_eq!(session_id_and_seq(&manager), (2, 2));
        assert_eq!(
            stub.actions(),
            vec![
                "X_GetEncryptSessionId",
                "X_EncryptedCommand",
                "X_EncryptedCommand",
                "X_GetEncryptSessionId",
                "X_EncryptedCommand",
            ]
        );

        let retried = decrypt_request(&stub.requests()[4]);
        assert!(retried.contains("<X_SessionId>2</X_SessionId>"));
        assert!(retried.contains("<X_SequenceNumber>00000002</X_SequenceNumber>"));
    }

    #[tokio::test]
    async fn repeated_invalidation_is_terminal() {
        let stub = StubTransport::new(vec![
            session_reply(1),
            session_invalid_reply(),
            session_reply(2),
            session_invalid_reply(),
            // Never consumed: no further retries
            command_reply("X_SendKey"),
        ]);
        let mut manager = SessionManager::new(credentials());

        assert!(matches!(
            manager
                .send_encrypted(&stub, RequestType::Command, "X_SendKey", SEND_KEY_PARAMS)
                .await,
            Err(VieraError::SessionInvalidated(_))
        ));
        assert_eq!(stub.requests().len(), 4);
        assert_eq!(manager.state(), &SessionState::NoSession);
    }

    #[tokio::test]
    async fn failed_reestablishment_is_terminal() {
        let stub = StubTransport::new(vec![
            session_reply(1),
            session_invalid_reply(),
            Err(VieraError::Connectivity("timed out".into())),
        ]);
        let mut manager = SessionManager::new(credentials());

        assert!(matches!(
            manager
                .send_encrypted(&stub, RequestType::Command, "X_SendKey", SEND_KEY_PARAMS)
                .await,
            Err(VieraError::SessionInvalidated(_))
        ));
        assert_eq!(stub.requests().len(), 3);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let stub = StubTransport::new(vec![
            session_reply(1),
            Ok(TransportReply::new(500, "<errorCode>602</errorCode>")),
        ]);
        let mut manager = SessionManager::new(credentials());

        assert!(matches!(
            manager
                .send_encrypted(&stub, RequestType::Command, "X_SendKey", SEND_KEY_PARAMS)
                .await,
            Err(VieraError::Connectivity(_))
        ));
        assert_eq!(stub.requests().len(), 2);
    }

    #[test]
    fn session_invalidation_detection() {
        assert!(is_session_invalidated(&session_invalid_reply().unwrap()));
        assert!(is_session_invalidated(&TransportReply::new(
            500,
            "<errorDescription>Session ID unknown</errorDescription>"
        )));
        assert!(!is_session_invalidated(&TransportReply::new(
            200,
            "<errorCode>401</errorCode>"
        )));
        assert!(!is_session_invalidated(&TransportReply::new(
            500,
            "<errorCode>602</errorCode>"
        )));
    }
}
