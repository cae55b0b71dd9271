//! Defines the PIN pairing flow for TVs which require encryption.
//!
//! Broadly, the pairing flow is as follows:
//!
//! 1. Ask the TV to display a PIN code. The TV replies with a challenge key.
//! 2. Encrypt the PIN the user read off the screen with keys derived from the challenge, and
//!    submit it.
//!      - If the PIN is correct, the TV replies with an application id and a session key seed.
//!        Together these are the [`Credentials`] needed for all future encrypted sessions.
//!      - If the PIN is wrong, the flow fails and a new PIN can be submitted against the same
//!        challenge, or a new PIN requested.

use std::fmt;
use std::sync::LazyLock;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, error, info, warn};
use regex::Regex;
use rust_fsm::*;

use crate::crypto::{decrypt, derive_challenge_keys, encrypt};
use crate::error::{Outcome, VieraError};
use crate::soap::{extract_tag, RequestType, DISPLAY_PIN_CODE_ACTION, REQUEST_AUTH_ACTION};
use crate::transport::{post_action, Transport};
use crate::types::Credentials;
use crate::viera_client::VieraClient;

static CHALLENGE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<X_ChallengeKey>(\S*)</X_ChallengeKey>").expect("challenge key pattern")
});

// ------------------------------------------------------------------------------------------------
// States, Inputs, Outputs

/// Pairing status.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingState {
    /// No PIN has been requested yet.
    Idle,
    /// The TV is displaying a PIN and a challenge key has been received.
    ChallengeRequested,
    /// A PIN has been submitted to the TV.
    Authorizing,
    /// The TV accepted the PIN and issued credentials.
    Paired,
    /// The TV rejected the PIN, or the exchange failed.
    Failed,
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Pairing transition inputs.
#[derive(Debug, Clone)]
pub(crate) enum PairingInput {
    ChallengeReceived,
    SubmitPin,
    Authorized,
    Error,
}

/// Pairing transition outputs.
#[derive(Debug)]
pub(crate) enum PairingOutput {
    AwaitPin,
    SendPin,
    IssueCredentials,
    ReportFailure,
}

// Mermaid format:
//
// ---
// title: Viera pairing state machine
// ---
// stateDiagram-v2
// [*] --> Idle
// Idle --> ChallengeRequested: ChallengeReceived
// Idle --> Authorizing: SubmitPin (challenge supplied by the caller)
//
// ChallengeRequested --> ChallengeRequested: ChallengeReceived
// ChallengeRequested --> Authorizing: SubmitPin
//
// Authorizing --> Paired: Authorized
// Authorizing --> Failed: Error
// Authorizing --> ChallengeRequested: ChallengeReceived (previous submission was cancelled)
// Authorizing --> Authorizing: SubmitPin (previous submission was cancelled)
//
// Failed --> ChallengeRequested: ChallengeReceived
// Failed --> Authorizing: SubmitPin
//
// PairingFlow::reset() restarts the machine in Idle from any state.

// ================================================================================================
// PairingStateMachine

#[derive(Debug)]
pub(crate) struct PairingStateMachine;

impl StateMachineImpl for PairingStateMachine {
    type Input = PairingInput;
    type State = PairingState;
    type Output = PairingOutput;

    const INITIAL_STATE: Self::State = PairingState::Idle;

    fn transition(state: &Self::State, input: &Self::Input) -> Option<Self::State> {
        match (state, input) {
            // Idle
            (PairingState::Idle, PairingInput::ChallengeReceived) => {
                Some(PairingState::ChallengeRequested)
            }
            (PairingState::Idle, PairingInput::SubmitPin) => Some(PairingState::Authorizing),

            // ChallengeRequested
            (PairingState::ChallengeRequested, PairingInput::ChallengeReceived) => {
                Some(PairingState::ChallengeRequested)
            }
            (PairingState::ChallengeRequested, PairingInput::SubmitPin) => {
                Some(PairingState::Authorizing)
            }

            // Authorizing
            (PairingState::Authorizing, PairingInput::Authorized) => Some(PairingState::Paired),
            (PairingState::Authorizing, PairingInput::Error) => Some(PairingState::Failed),
            (PairingState::Authorizing, PairingInput::ChallengeReceived) => {
                Some(PairingState::ChallengeRequested)
            }
            (PairingState::Authorizing, PairingInput::SubmitPin) => {
                Some(PairingState::Authorizing)
            }

            // Failed
            (PairingState::Failed, PairingInput::ChallengeReceived) => {
                Some(PairingState::ChallengeRequested)
            }
            (PairingState::Failed, PairingInput::SubmitPin) => Some(PairingState::Authorizing),

            _ => None,
        }
    }

    fn output(state: &Self::State, input: &Self::Input) -> Option<Self::Output> {
        match (state, input) {
            (_, PairingInput::ChallengeReceived) => Some(PairingOutput::AwaitPin),
            (_, PairingInput::SubmitPin) => Some(PairingOutput::SendPin),
            (PairingState::Authorizing, PairingInput::Authorized) => {
                Some(PairingOutput::IssueCredentials)
            }
            (PairingState::Authorizing, PairingInput::Error) => Some(PairingOutput::ReportFailure),

            _ => None,
        }
    }
}

// ================================================================================================
// PairingFlow

/// Pairs with a TV which requires encryption.
///
/// Created from a probed [`VieraClient`]:
///
/// ```no_run
/// # async fn pair() -> Result<(), viera_client::VieraError> {
/// use std::net::Ipv4Addr;
/// use viera_client::{PairingFlow, VieraClient};
///
/// let client = VieraClient::probe(Ipv4Addr::new(192, 168, 1, 20)).await?;
/// let mut pairing = PairingFlow::new(&client);
///
/// pairing.request_pin_code().await?;
/// let credentials = pairing.authorize_pin_code("1234", None).await?;
/// client.authenticate(credentials).await?;
/// # Ok(())
/// # }
/// ```
pub struct PairingFlow<'a, T: Transport> {
    client: &'a VieraClient<T>,
    fsm: StateMachine<PairingStateMachine>,
    challenge: Option<[u8; 16]>,
}

impl<'a, T: Transport> PairingFlow<'a, T> {
    pub fn new(client: &'a VieraClient<T>) -> Self {
        PairingFlow {
            client,
            fsm: StateMachine::new(),
            challenge: None,
        }
    }

    pub fn state(&self) -> &PairingState {
        self.fsm.state()
    }

    /// Forget the challenge and return to [`PairingState::Idle`].
    pub fn reset(&mut self) {
        self.challenge = None;
        self.fsm = StateMachine::new();
    }

    /// The most recent challenge key, base64 encoded.
    ///
    /// Useful when the PIN is collected in a different process (e.g. a web form) and passed back
    /// to [`PairingFlow::authorize_pin_code`].
    pub fn challenge(&self) -> Option<String> {
        self.challenge.map(|challenge| STANDARD.encode(challenge))
    }

    /// Ask the TV to display a PIN code.
    ///
    /// Only valid for TVs which require encryption, and only while the TV is turned on.
    pub async fn request_pin_code(&mut self) -> Outcome<()> {
        self.check_pairing_needed()?;
        self.check_input(&PairingInput::ChallengeReceived)?;
        let is_on = self.client.is_turned_on().await;

        self.request_pin_code_when(is_on).await
    }

    fn check_pairing_needed(&self) -> Outcome<()> {
        if self.client.specs().requires_encryption {
            Ok(())
        } else {
            Err(VieraError::Misuse(format!(
                "{} does not require encryption, so does not need pairing",
                self.client.ip()
            )))
        }
    }

    pub(crate) async fn request_pin_code_when(&mut self, is_on: bool) -> Outcome<()> {
        self.check_pairing_needed()?;
        self.check_input(&PairingInput::ChallengeReceived)?;

        if !is_on {
            return Err(VieraError::Standby(
                "The TV must be turned on to display a PIN code".into(),
            ));
        }

        let parameters = format!(
            "<X_DeviceName>{}</X_DeviceName>",
            self.client.settings().device_name
        );

        let reply = post_action(
            self.client.transport(),
            RequestType::Command,
            DISPLAY_PIN_CODE_ACTION,
            &parameters,
        )
        .await?
        .into_success("PIN code request")?;

        let challenge = parse_challenge(&reply.body)?;
        self.challenge = Some(challenge);
        self.consume(PairingInput::ChallengeReceived)?;

        info!("{} is displaying a PIN code", self.client.ip());

        Ok(())
    }

    /// Submit the `pin` displayed by the TV.
    ///
    /// `challenge` is a base64 challenge key from an earlier [`PairingFlow::challenge`]; when
    /// `None`, the challenge from [`PairingFlow::request_pin_code`] is used.
    ///
    /// A submission which was cancelled before the TV replied can be retried, or a new PIN
    /// requested, without calling [`PairingFlow::reset`].
    pub async fn authorize_pin_code(
        &mut self,
        pin: &str,
        challenge: Option<&str>,
    ) -> Outcome<Credentials> {
        self.check_input(&PairingInput::SubmitPin)?;

        let challenge = match challenge {
            Some(encoded) => decode_challenge(encoded)?,
            None => self.challenge.ok_or_else(|| {
                VieraError::Misuse("No challenge key: request a PIN code first".into())
            })?,
        };
        self.challenge = Some(challenge);

        self.consume(PairingInput::SubmitPin)?;

        match self.send_pin(pin, &challenge).await {
            Ok(credentials) => {
                self.consume(PairingInput::Authorized)?;
                info!("Paired with {}", self.client.ip());

                Ok(credentials)
            }
            Err(e) => {
                self.consume(PairingInput::Error)?;
                warn!("Pairing with {} failed: {}", self.client.ip(), e);

                Err(e)
            }
        }
    }

    async fn send_pin(&self, pin: &str, challenge: &[u8; 16]) -> Outcome<Credentials> {
        let (key, hmac_key) = derive_challenge_keys(challenge);
        let auth_info = encrypt(
            &format!("<X_PinCode>{pin}</X_PinCode>"),
            &key,
            challenge,
            &hmac_key,
        )?;

        let reply = post_action(
            self.client.transport(),
            RequestType::Command,
            REQUEST_AUTH_ACTION,
            &format!("<X_AuthInfo>{auth_info}</X_AuthInfo>"),
        )
        .await?;

        if !reply.is_success() {
            return Err(wrong_pin(&format!("HTTP status {}", reply.status)));
        }

        let auth_result =
            extract_tag(&reply.body, "X_AuthResult").ok_or_else(|| wrong_pin("no X_AuthResult"))?;

        let decrypted = decrypt(auth_result, &key, challenge)
            .map_err(|e| wrong_pin(&format!("unreadable X_AuthResult ({e})")))?;

        let app_id = extract_tag(&decrypted, "X_ApplicationId")
            .ok_or_else(|| wrong_pin("no X_ApplicationId"))?;
        let keyword =
            extract_tag(&decrypted, "X_Keyword").ok_or_else(|| wrong_pin("no X_Keyword"))?;

        Ok(Credentials::new(app_id, keyword))
    }

    /// Whether the flow can act on `input` in its current state, checked before any request is
    /// sent to the TV.
    fn check_input(&self, input: &PairingInput) -> Outcome<()> {
        match PairingStateMachine::transition(self.fsm.state(), input) {
            Some(_) => Ok(()),
            None => {
                let msg = format!(
                    "Pairing cannot act on input [{:?}] while in state '{:?}'",
                    input,
                    self.fsm.state()
                );
                error!("{}", &msg);

                Err(VieraError::Misuse(msg))
            }
        }
    }

    fn consume(&mut self, input: PairingInput) -> Outcome<()> {
        let entry_state = self.fsm.state().clone();

        match self.fsm.consume(&input) {
            Ok(output) => {
                debug!(
                    "Pairing FSM acting on input [{:?}]: {:?} -> {:?}, with output [{}]",
                    &input,
                    entry_state,
                    self.fsm.state(),
                    match &output {
                        Some(o) => format!("{:?}", o),
                        None => "none".into(),
                    }
                );

                Ok(())
            }
            Err(e) => {
                let msg = format!(
                    "Pairing cannot act on input [{:?}] while in state '{:?}': {:?}",
                    &input, entry_state, e
                );
                error!("{}", &msg);

                Err(VieraError::Misuse(msg))
            }
        }
    }
}

fn wrong_pin(detail: &str) -> VieraError {
    VieraError::Authentication(format!("Wrong PIN ({detail})"))
}

fn parse_challenge(reply: &str) -> Outcome<[u8; 16]> {
    let encoded = CHALLENGE_KEY_RE
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            VieraError::MalformedReply("Unexpected reply from TV when requesting a PIN".into())
        })?;

    decode_challenge(encoded).map_err(|e| VieraError::MalformedReply(e.to_string()))
}

fn decode_challenge(encoded: &str) -> Outcome<[u8; 16]> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| VieraError::Authentication(format!("Challenge key is not base64: {e}")))?;

    decoded.as_slice().try_into().map_err(|_| {
        VieraError::Authentication(format!(
            "Challenge key must decode to 16 bytes (got {})",
            decoded.len()
        ))
    })
}

// ================================================================================================
// Tests
