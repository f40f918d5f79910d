//! Challenge-response handshake over the auth characteristic.
//!
//! 1. enable notifications on the auth characteristic
//! 2. send the 16 byte key
//! 3. once the key is acknowledged, ask for a random number
//! 4. encrypt the number with AES-128-ECB under the key and send it back
//! 5. the band reports whether the answer matched

use tracing::{debug, info, warn};

use crate::crypto::{encrypt_ecb, SessionKey};
use crate::error::{AuthFailure, BandError, TransportError};
use crate::protocol::{
    auth_frame, parse_auth_notification, AuthStage, AUTH_CHARACTERISTIC_UUID, AUTH_REQUEST_RANDOM,
    AUTH_SEND_KEY, AUTH_SEND_RESPONSE, AUTH_SERVICE_UUID,
};
use crate::transport::{require_characteristic, Characteristic, DeviceHandle, Transport};

/// Where the key for a handshake comes from.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    /// Mi Band 2/3 accept any key, so a fresh one is generated per attempt.
    Generate,
    /// Mi Band 4/5 only accept the key they were paired with.
    PreShared(SessionKey),
}

impl KeyMaterial {
    fn session_key(&self) -> SessionKey {
        match self {
            KeyMaterial::Generate => SessionKey::generate(),
            KeyMaterial::PreShared(key) => key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    NotifyEnabled,
    KeySent,
    ChallengeRequested,
    ChallengeReceived,
    ResponseSent,
    Authenticated,
    Failed(AuthFailure),
}

impl AuthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Failed(_))
    }
}

/// Outcome of feeding one notification to the [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Frame consumed, handshake still running.
    Continue,
    /// Frame dropped without changing state.
    Ignored,
    Authenticated,
    Failed(AuthFailure),
}

pub struct Authenticator {
    state: AuthState,
    key: Option<SessionKey>,
    characteristic: Option<Characteristic>,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator {
    pub fn new() -> Self {
        Authenticator {
            state: AuthState::Idle,
            key: None,
            characteristic: None,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// The subscribed auth characteristic, once the handshake has started.
    pub fn characteristic(&self) -> Option<&Characteristic> {
        self.characteristic.as_ref()
    }

    /// Starts a handshake: subscribes to the auth characteristic and sends
    /// the key. The rest is driven by [`Authenticator::on_notification`].
    pub async fn authenticate(
        &mut self,
        transport: &dyn Transport,
        device: &DeviceHandle,
        key_material: &KeyMaterial,
    ) -> Result<(), BandError> {
        self.reset();

        let characteristic = require_characteristic(
            transport,
            device,
            AUTH_SERVICE_UUID,
            AUTH_CHARACTERISTIC_UUID,
        )
        .await?;

        if !transport.subscribe(device, &characteristic).await? {
            return Err(TransportError::SubscribeRefused(characteristic.uuid).into());
        }
        self.characteristic = Some(characteristic);
        self.state = AuthState::NotifyEnabled;

        let key = key_material.session_key();
        let frame = auth_frame(AUTH_SEND_KEY, key.as_bytes());
        self.key = Some(key);
        self.send(transport, device, &frame).await?;
        self.state = AuthState::KeySent;

        debug!(device = %device.address, "auth key sent");
        Ok(())
    }

    pub async fn on_notification(
        &mut self,
        transport: &dyn Transport,
        device: &DeviceHandle,
        value: &[u8],
    ) -> Result<AuthStep, BandError> {
        if self.state == AuthState::Idle || self.state.is_terminal() {
            return Ok(AuthStep::Ignored);
        }

        let Some(frame) = parse_auth_notification(value) else {
            warn!(?value, "dropping malformed auth notification");
            return Ok(AuthStep::Ignored);
        };

        match (frame.stage, self.state.clone()) {
            (AuthStage::Unknown(stage), _) => {
                debug!(stage, "ignoring unknown auth stage");
                Ok(AuthStep::Ignored)
            }
            (AuthStage::KeyAck, AuthState::KeySent) => {
                if !frame.succeeded() {
                    return Ok(self.fail(AuthFailure::KeyRejected));
                }
                self.send(transport, device, &AUTH_REQUEST_RANDOM).await?;
                self.state = AuthState::ChallengeRequested;
                Ok(AuthStep::Continue)
            }
            (AuthStage::Challenge, AuthState::ChallengeRequested) => {
                if !frame.succeeded() {
                    return Ok(self.fail(AuthFailure::ProtocolViolation(
                        "challenge was not delivered".to_string(),
                    )));
                }
                self.state = AuthState::ChallengeReceived;

                let Some(key) = self.key.as_ref() else {
                    return Ok(self.fail(AuthFailure::ProtocolViolation(
                        "no session key".to_string(),
                    )));
                };
                let answer = match encrypt_ecb(key, frame.payload) {
                    Ok(answer) => answer,
                    Err(e) => {
                        return Ok(self.fail(AuthFailure::ProtocolViolation(format!(
                            "bad challenge: {e}"
                        ))))
                    }
                };

                self.send(transport, device, &auth_frame(AUTH_SEND_RESPONSE, &answer))
                    .await?;
                self.state = AuthState::ResponseSent;
                Ok(AuthStep::Continue)
            }
            (AuthStage::Verification, AuthState::ResponseSent) => {
                if !frame.succeeded() {
                    return Ok(self.fail(AuthFailure::ChallengeRejected));
                }
                self.state = AuthState::Authenticated;
                self.key = None;
                info!(device = %device.address, "authenticated");
                Ok(AuthStep::Authenticated)
            }
            (stage, state) => {
                let reason = format!("{stage:?} frame while {state:?}");
                Ok(self.fail(AuthFailure::ProtocolViolation(reason)))
            }
        }
    }

    /// Drops the key and the characteristic handle.
    pub fn reset(&mut self) {
        self.state = AuthState::Idle;
        self.key = None;
        self.characteristic = None;
    }

    async fn send(
        &mut self,
        transport: &dyn Transport,
        device: &DeviceHandle,
        frame: &[u8],
    ) -> Result<(), BandError> {
        let Some(characteristic) = self.characteristic else {
            return Err(BandError::NotConnected);
        };

        if let Err(e) = transport.write(device, &characteristic, frame).await {
            self.reset();
            return Err(e.into());
        }
        Ok(())
    }

    fn fail(&mut self, reason: AuthFailure) -> AuthStep {
        warn!(%reason, "authentication failed");
        self.key = None;
        self.state = AuthState::Failed(reason.clone());
        AuthStep::Failed(reason)
    }
}
