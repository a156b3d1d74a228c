use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tracing::{debug, info};

use crate::{
    device::{DeviceProfile, ProfileDecoder},
    error::{AntError, Result},
};

/// ANT+ device type of bicycle power meters
pub const POWER_DEVICE_TYPE: u8 = 0x0B;

/// Channel period of bicycle power meters (about 4.00 Hz)
pub const POWER_CHANNEL_PERIOD: u16 = 8182;

/// Data page numbers of the bicycle power profile
pub mod pages {
    /// Calibration request and response
    pub const CALIBRATION: u8 = 0x01;
    /// Get/set bicycle parameters
    pub const PARAMETERS: u8 = 0x02;
    /// Standard power-only page
    pub const POWER_ONLY: u8 = 0x10;
    /// Standard wheel torque page
    pub const WHEEL_TORQUE: u8 = 0x11;
    /// Standard crank torque page
    pub const CRANK_TORQUE: u8 = 0x12;
    /// Torque effectiveness and pedal smoothness page
    pub const TORQUE_AND_PEDAL: u8 = 0x13;
    /// Crank torque frequency page
    pub const CRANK_TORQUE_FREQUENCY: u8 = 0x20;
}

/// Sub-page of the parameters page carrying crank parameters
pub const CRANK_PARAMETERS_SUBPAGE: u8 = 0x01;

/// Crank lengths the parameters page can express, in millimetres
pub const CRANK_LENGTH_RANGE: RangeInclusive<f64> = 110.0..=236.5;

const INVALID: u8 = 0xFF;
const COMBINED_SMOOTHNESS: u8 = 0xFE;

/// Standard power-only page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerData {
    /// Power event count, incremented with each new power calculation
    pub event_count: u8,
    /// Whether the meter can tell the left pedal from the right
    pub differentiation: bool,
    /// Share of power from the right pedal (or unknown pedal), 0.0 to 1.0
    pub pedal_power_ratio: Option<f64>,
    /// Crank cadence in rpm
    pub cadence: Option<u8>,
    /// Accumulated power in watts, rolls over at 65536
    pub accumulated_power: u16,
    /// Instantaneous power in watts
    pub instantaneous_power: u16,
}

/// Torque effectiveness and pedal smoothness page, values as 0.0 to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TorquePedalData {
    /// Event count
    pub event_count: u8,
    /// Left torque effectiveness
    pub left_torque: Option<f64>,
    /// Right torque effectiveness
    pub right_torque: Option<f64>,
    /// Left pedal smoothness, or combined smoothness when right is unknown
    pub left_smoothness: Option<f64>,
    /// Right pedal smoothness
    pub right_smoothness: Option<f64>,
}

/// Decoded bicycle power broadcast
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PowerEvent {
    /// Power-only page
    Power(PowerData),
    /// Torque effectiveness and pedal smoothness page
    TorquePedal(TorquePedalData),
}

/// Bicycle power telemetry accumulated since the profile was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerTelemetry {
    /// Event count of the last page
    pub event_count: Option<u8>,
    /// Pedal power ratio
    pub pedal_power_ratio: Option<f64>,
    /// Pedal differentiation flag
    pub differentiation: bool,
    /// Cadence in rpm
    pub cadence: Option<u8>,
    /// Accumulated power in watts
    pub accumulated_power: Option<u16>,
    /// Instantaneous power in watts
    pub instantaneous_power: Option<u16>,
    /// Left torque effectiveness
    pub left_torque: Option<f64>,
    /// Right torque effectiveness
    pub right_torque: Option<f64>,
    /// Left (or combined) pedal smoothness
    pub left_smoothness: Option<f64>,
    /// Right pedal smoothness
    pub right_smoothness: Option<f64>,
}

/// Decoder for the ANT+ bicycle power profile
#[derive(Debug, Default)]
pub struct PowerDecoder {
    telemetry: PowerTelemetry,
}

/// Half-percent field to a 0.0 to 1.0 ratio; 0xFF is unknown
fn half_percent(value: u8) -> Option<f64> {
    (value != INVALID).then(|| f64::from(value) / 200.0)
}

/// An unknown pedal power byte keeps the last known differentiation flag
fn decode_power_only(data: &[u8; 8], last_differentiation: bool) -> PowerData {
    let mut buf = &data[1..];
    let event_count = buf.get_u8();
    let pedal_power = buf.get_u8();
    let cadence = buf.get_u8();
    let accumulated_power = buf.get_u16_le();
    let instantaneous_power = buf.get_u16_le();

    let (differentiation, pedal_power_ratio) = if pedal_power == INVALID {
        (last_differentiation, None)
    } else {
        (
            pedal_power & 0x80 != 0,
            Some(f64::from(pedal_power & 0x7F) / 100.0),
        )
    };

    PowerData {
        event_count,
        differentiation,
        pedal_power_ratio,
        cadence: (cadence != INVALID).then_some(cadence),
        accumulated_power,
        instantaneous_power,
    }
}

fn decode_torque_pedal(data: &[u8; 8]) -> TorquePedalData {
    let [_, event_count, left_torque, right_torque, left_smoothness, right_smoothness, _, _] =
        *data;

    TorquePedalData {
        event_count,
        left_torque: half_percent(left_torque),
        right_torque: half_percent(right_torque),
        left_smoothness: half_percent(left_smoothness),
        right_smoothness: if right_smoothness == COMBINED_SMOOTHNESS {
            None
        } else {
            half_percent(right_smoothness)
        },
    }
}

impl ProfileDecoder for PowerDecoder {
    const NAME: &'static str = "Bicycle Power";
    const DEVICE_TYPE: u8 = POWER_DEVICE_TYPE;
    const CHANNEL_PERIOD: u16 = POWER_CHANNEL_PERIOD;

    type Event = PowerEvent;
    type Telemetry = PowerTelemetry;

    fn decode(&mut self, data: &[u8; 8]) -> Option<PowerEvent> {
        let telemetry = &mut self.telemetry;

        match data[0] {
            pages::POWER_ONLY => {
                let power = decode_power_only(data, telemetry.differentiation);
                telemetry.event_count = Some(power.event_count);
                telemetry.pedal_power_ratio = power.pedal_power_ratio;
                telemetry.differentiation = power.differentiation;
                telemetry.cadence = power.cadence;
                telemetry.accumulated_power = Some(power.accumulated_power);
                telemetry.instantaneous_power = Some(power.instantaneous_power);
                Some(PowerEvent::Power(power))
            }
            pages::TORQUE_AND_PEDAL => {
                let torque = decode_torque_pedal(data);
                telemetry.event_count = Some(torque.event_count);
                telemetry.left_torque = torque.left_torque;
                telemetry.right_torque = torque.right_torque;
                telemetry.left_smoothness = torque.left_smoothness;
                telemetry.right_smoothness = torque.right_smoothness;
                Some(PowerEvent::TorquePedal(torque))
            }
            page => {
                debug!("Ignoring bicycle power page 0x{:02X}", page);
                None
            }
        }
    }

    fn telemetry(&self) -> PowerTelemetry {
        self.telemetry
    }
}

/// ANT+ bicycle power meter profile
pub type BicyclePower = DeviceProfile<PowerDecoder>;

/// Get/set parameters page that sets the crank length
///
/// # Errors
///
/// Returns [`AntError::InvalidParameters`] if `millimetres` is outside
/// 110.0..=236.5.
pub fn crank_length_page(millimetres: f64) -> Result<[u8; 8]> {
    if !CRANK_LENGTH_RANGE.contains(&millimetres) {
        return Err(AntError::InvalidParameters(format!(
            "crank length {millimetres} mm is outside {}..={} mm",
            CRANK_LENGTH_RANGE.start(),
            CRANK_LENGTH_RANGE.end()
        )));
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let raw = ((millimetres - CRANK_LENGTH_RANGE.start()) / 0.5) as u8;

    Ok([
        pages::PARAMETERS,
        CRANK_PARAMETERS_SUBPAGE,
        0xFF,
        0xFF,
        raw,
        0x00,
        0x00,
        0xFF,
    ])
}

impl DeviceProfile<PowerDecoder> {
    /// Set the crank length of the power meter, in millimetres
    ///
    /// # Errors
    ///
    /// Returns [`AntError::InvalidParameters`] for a length outside
    /// 110.0..=236.5 mm, or [`AntError::InvalidState`] if the profile is not open.
    pub async fn set_crank_length(&self, millimetres: f64) -> Result<()> {
        let page = crank_length_page(millimetres)?;
        self.send_acknowledged(&page).await?;
        info!("Crank length set to {} mm", millimetres);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{ProfileCallbacks, DEFAULT_SEARCH_TIMEOUT},
        node::Node,
        protocol::{ChannelData, Message, MessageId},
        testing::{eventually, MockTransport},
        types::{Network, NodeConfig},
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn power_page(pedal_power: u8, cadence: u8) -> [u8; 8] {
        let accumulated = 1_000u16.to_le_bytes();
        let instantaneous = 250u16.to_le_bytes();
        [
            pages::POWER_ONLY,
            7,
            pedal_power,
            cadence,
            accumulated[0],
            accumulated[1],
            instantaneous[0],
            instantaneous[1],
        ]
    }

    fn decode_power(data: [u8; 8]) -> PowerData {
        match PowerDecoder::default().decode(&data) {
            Some(PowerEvent::Power(power)) => power,
            other => panic!("expected power data, got {other:?}"),
        }
    }

    fn decode_torque(data: [u8; 8]) -> TorquePedalData {
        match PowerDecoder::default().decode(&data) {
            Some(PowerEvent::TorquePedal(torque)) => torque,
            other => panic!("expected torque data, got {other:?}"),
        }
    }

    #[test]
    fn test_power_only_page() {
        let power = decode_power(power_page(0x32, 90));
        assert_eq!(power.event_count, 7);
        assert_eq!(power.pedal_power_ratio, Some(0.5));
        assert!(!power.differentiation);
        assert_eq!(power.cadence, Some(90));
        assert_eq!(power.accumulated_power, 1_000);
        assert_eq!(power.instantaneous_power, 250);
    }

    #[test]
    fn test_pedal_power_differentiation_bit() {
        let power = decode_power(power_page(0xB2, 90));
        assert!(power.differentiation);
        assert_eq!(power.pedal_power_ratio, Some(0.5));
    }

    #[test]
    fn test_power_only_sentinels() {
        let power = decode_power(power_page(0xFF, 0xFF));
        assert_eq!(power.pedal_power_ratio, None);
        assert!(!power.differentiation);
        assert_eq!(power.cadence, None);
    }

    #[test]
    fn test_unknown_pedal_power_keeps_differentiation() {
        let mut decoder = PowerDecoder::default();
        decoder.decode(&power_page(0xB2, 90));
        assert!(decoder.telemetry.differentiation);

        let Some(PowerEvent::Power(power)) = decoder.decode(&power_page(0xFF, 90)) else {
            panic!("expected power data");
        };
        assert!(power.differentiation);
        assert_eq!(power.pedal_power_ratio, None);
        assert!(decoder.telemetry.differentiation);
        assert_eq!(decoder.telemetry.pedal_power_ratio, None);

        decoder.decode(&power_page(0x32, 90));
        assert!(!decoder.telemetry.differentiation);
    }

    #[test]
    fn test_torque_and_pedal_page() {
        let torque = decode_torque([pages::TORQUE_AND_PEDAL, 3, 200, 100, 0xFF, 50, 0xFF, 0xFF]);
        assert_eq!(torque.event_count, 3);
        assert_eq!(torque.left_torque, Some(1.0));
        assert_eq!(torque.right_torque, Some(0.5));
        assert_eq!(torque.left_smoothness, None);
        assert_eq!(torque.right_smoothness, Some(0.25));
    }

    #[test]
    fn test_combined_pedal_smoothness() {
        let torque = decode_torque([pages::TORQUE_AND_PEDAL, 3, 0xFF, 0xFF, 90, 0xFE, 0xFF, 0xFF]);
        assert_eq!(torque.left_torque, None);
        assert_eq!(torque.right_torque, None);
        assert_eq!(torque.left_smoothness, Some(0.45));
        assert_eq!(torque.right_smoothness, None);
    }

    #[test]
    fn test_other_pages_are_ignored() {
        let mut decoder = PowerDecoder::default();
        assert!(decoder.decode(&[pages::CRANK_TORQUE, 0, 0, 0, 0, 0, 0, 0]).is_none());
        assert_eq!(decoder.telemetry(), PowerTelemetry::default());
    }

    #[test]
    fn test_telemetry_keeps_both_pages() {
        let mut decoder = PowerDecoder::default();
        decoder.decode(&power_page(0x32, 85));
        decoder.decode(&[pages::TORQUE_AND_PEDAL, 8, 160, 150, 60, 70, 0xFF, 0xFF]);

        let telemetry = decoder.telemetry();
        assert_eq!(telemetry.event_count, Some(8));
        assert_eq!(telemetry.cadence, Some(85));
        assert_eq!(telemetry.instantaneous_power, Some(250));
        assert_eq!(telemetry.left_torque, Some(0.8));
        assert_eq!(telemetry.right_smoothness, Some(0.35));
    }

    #[test]
    fn test_crank_length_page() {
        assert_eq!(
            crank_length_page(172.5).unwrap(),
            [0x02, 0x01, 0xFF, 0xFF, 125, 0x00, 0x00, 0xFF]
        );
        assert_eq!(crank_length_page(110.0).unwrap()[4], 0);
        assert_eq!(crank_length_page(236.5).unwrap()[4], 253);
        assert!(matches!(
            crank_length_page(109.5),
            Err(AntError::InvalidParameters(_))
        ));
        assert!(matches!(
            crank_length_page(237.0),
            Err(AntError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_power_profile_end_to_end() {
        let mock = MockTransport::new();
        let node = Arc::new(Node::new(
            Box::new(mock.clone()),
            NodeConfig {
                ack_timeout_ms: 200,
                message_timeout_ms: 200,
                ..NodeConfig::default()
            },
        ));
        node.start().await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let power = BicyclePower::new(
            node.clone(),
            Network::ant_plus(),
            ProfileCallbacks::default().on_data(move |event: &PowerEvent| sink.lock().push(*event)),
        );

        assert!(matches!(
            power.set_crank_length(172.5).await,
            Err(AntError::InvalidState(_))
        ));

        power.open(None, DEFAULT_SEARCH_TIMEOUT).await.unwrap();
        let channel = power.channel().unwrap();
        assert_eq!(channel.config().period, Some(POWER_CHANNEL_PERIOD));
        assert_eq!(
            channel.config().id.map(|id| id.device_type),
            Some(POWER_DEVICE_TYPE)
        );

        mock.broadcast(channel.number(), power_page(0x32, 90));
        assert!(eventually(|| events.lock().len() == 1).await);
        assert_eq!(power.telemetry().cadence, Some(90));

        power.set_crank_length(172.5).await.unwrap();
        assert_eq!(
            mock.written_of_type(MessageId::AcknowledgedData),
            vec![Message::AcknowledgedData(ChannelData {
                channel: channel.number(),
                data: [0x02, 0x01, 0xFF, 0xFF, 125, 0x00, 0x00, 0xFF],
            })]
        );

        power.close().await.unwrap();
        node.stop().await.unwrap();
    }
}
