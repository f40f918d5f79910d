//! GATT identifiers and frame layouts spoken by Mi Band 2/3/4/5.

use uuid::Uuid;

pub const AUTH_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fee100001000800000805f9b34fb);
pub const AUTH_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00000009000035122118_0009af100700);

pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fee000001000800000805f9b34fb);
pub const SENSOR_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00000001000035122118_0009af100700);
pub const BATTERY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00000006000035122118_0009af100700);

pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d00001000800000805f9b34fb);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x00002a3700001000800000805f9b34fb);
pub const HEART_RATE_CONTROL_UUID: Uuid = Uuid::from_u128(0x00002a3900001000800000805f9b34fb);

// auth characteristic writes
pub const AUTH_SEND_KEY: [u8; 2] = [0x01, 0x08];
pub const AUTH_REQUEST_RANDOM: [u8; 2] = [0x02, 0x08];
pub const AUTH_SEND_RESPONSE: [u8; 2] = [0x03, 0x08];

pub const AUTH_RESPONSE_MARKER: u8 = 0x10;
pub const AUTH_RESULT_SUCCESS: u8 = 0x01;
pub const AUTH_RESULT_FAILURE: u8 = 0x04;

// sensor characteristic writes
pub const SENSOR_ENABLE: [u8; 3] = [0x01, 0x03, 0x19];
pub const SENSOR_CONFIRM: [u8; 1] = [0x02];

// heart rate control point writes
pub const HEART_RATE_CONTINUOUS_ON: [u8; 3] = [0x15, 0x01, 0x01];
pub const HEART_RATE_CONTINUOUS_OFF: [u8; 3] = [0x15, 0x01, 0x00];
pub const HEART_RATE_SINGLE_ON: [u8; 3] = [0x15, 0x02, 0x01];
pub const HEART_RATE_SINGLE_OFF: [u8; 3] = [0x15, 0x02, 0x00];
pub const HEART_RATE_KEEP_ALIVE: [u8; 1] = [0x16];

/// Stage reported in byte 1 of an auth notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    KeyAck,
    Challenge,
    Verification,
    Unknown(u8),
}

impl From<u8> for AuthStage {
    fn from(value: u8) -> Self {
        match value {
            0x01 => AuthStage::KeyAck,
            0x02 => AuthStage::Challenge,
            0x03 => AuthStage::Verification,
            other => AuthStage::Unknown(other),
        }
    }
}

/// Decoded `[marker, stage, result, payload..]` auth notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthNotification<'a> {
    pub marker: u8,
    pub stage: AuthStage,
    pub result: u8,
    pub payload: &'a [u8],
}

impl AuthNotification<'_> {
    pub fn succeeded(&self) -> bool {
        self.result == AUTH_RESULT_SUCCESS
    }
}

pub fn parse_auth_notification(value: &[u8]) -> Option<AuthNotification<'_>> {
    let [marker, stage, result, payload @ ..] = value else {
        return None;
    };

    Some(AuthNotification {
        marker: *marker,
        stage: AuthStage::from(*stage),
        result: *result,
        payload,
    })
}

pub fn auth_frame(tag: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(tag.len() + payload.len());
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(payload);
    frame
}

/// Heart Rate Measurement: flags byte, then a u8 rate or, with flag bit 0
/// set, a little-endian u16 rate. Rates above 255 saturate.
pub fn parse_heart_rate(value: &[u8]) -> Option<u8> {
    let flags = *value.first()?;
    let rate = if flags & 0x01 != 0 {
        u16::from_le_bytes([*value.get(1)?, *value.get(2)?])
    } else {
        u16::from(*value.get(1)?)
    };

    Some(u8::try_from(rate).unwrap_or(u8::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    pub level: u8,
    pub charging: bool,
}

pub fn parse_battery(value: &[u8]) -> Option<BatteryReading> {
    let [_, level, charging, ..] = value else {
        return None;
    };

    Some(BatteryReading {
        level: *level,
        charging: *charging != 0,
    })
}
