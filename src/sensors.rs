use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
    device::ProfileCallbacks,
    error::Result,
    heart_rate::{HeartRate, HeartRateData},
    node::Node,
    power::{BicyclePower, PowerEvent},
    transport::{SerialTransport, Transport, UsbTransport},
    types::{
        ChannelId, ConnectionState, Network, NodeConfig, SerialParams, UsbParams,
        NETWORK_NUMBER_PUBLIC,
    },
};

/// Configuration of the sensor pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorsConfig {
    /// Node timing and buffering
    pub node: NodeConfig,
    /// How long each sensor search runs before giving up
    pub search_timeout_ms: u64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            search_timeout_ms: 120_000,
        }
    }
}

impl SensorsConfig {
    /// Search timeout as a duration
    #[must_use]
    pub const fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

/// Link status of one sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorStatus {
    /// Whether the sensor is paired
    pub state: ConnectionState,
    /// Channel ID of the paired sensor
    pub channel_id: Option<ChannelId>,
    /// When the sensor last delivered new data
    ///
    /// Repeated pages with an unchanged event time or event count do not
    /// move it.
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

impl Default for SensorStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::NotConnected,
            channel_id: None,
            last_update: None,
        }
    }
}

impl SensorStatus {
    fn paired(&mut self, id: ChannelId) {
        self.state = ConnectionState::Connected;
        self.channel_id = Some(id);
    }

    fn updated(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_update = Some(Instant::now());
    }

    fn lost(&mut self) {
        self.state = ConnectionState::NotConnected;
    }
}

/// Last values reported by the sensors
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorReadings {
    /// Heart rate in beats per minute
    pub heart_rate: Option<u8>,
    /// RR interval in milliseconds
    pub rr_interval: Option<f64>,
    /// Instantaneous power in watts
    pub power: Option<u16>,
    /// Accumulated power in watts
    pub accumulated_power: Option<u16>,
    /// Power event count
    pub power_event_count: Option<u8>,
    /// Cadence in rpm
    pub cadence: Option<u8>,
    /// Heart rate monitor link
    pub heart_rate_status: SensorStatus,
    /// Power meter link
    pub power_status: SensorStatus,
}

/// Heart rate monitor and power meter on one dongle
///
/// Opening starts the node, installs the ANT+ network key and searches for
/// both sensors. Readings are cached as they arrive, so every getter returns
/// immediately. Deciding when a reading is too old is left to the caller,
/// which can compare [`SensorStatus::last_update`] against its own deadline.
pub struct Sensors {
    node: Arc<Node>,
    heart_rate: HeartRate,
    power: BicyclePower,
    readings: Arc<RwLock<SensorReadings>>,
}

impl Sensors {
    /// Start a node on `transport` and search for both sensors
    ///
    /// # Errors
    ///
    /// Returns the error of the step that failed; the node is stopped again
    /// if it had been started.
    pub async fn open(transport: Box<dyn Transport>, config: SensorsConfig) -> Result<Self> {
        let search_timeout = config.search_timeout();
        let node = Arc::new(Node::new(transport, config.node));
        node.start().await?;

        match Self::search(node.clone(), search_timeout).await {
            Ok(sensors) => Ok(sensors),
            Err(e) => {
                warn!("Sensor search failed: {}", e);
                if let Err(stop_error) = node.stop().await {
                    warn!("Stopping node also failed: {}", stop_error);
                }
                Err(e)
            }
        }
    }

    /// Open a USB-serial dongle and search for both sensors
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub async fn serial(params: SerialParams, config: SensorsConfig) -> Result<Self> {
        Self::open(Box::new(SerialTransport::new(params)), config).await
    }

    /// Open an ANT USB stick over its bulk endpoints and search for both sensors
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub async fn usb(params: UsbParams, config: SensorsConfig) -> Result<Self> {
        Self::open(Box::new(UsbTransport::new(params)), config).await
    }

    async fn search(node: Arc<Node>, search_timeout: Duration) -> Result<Self> {
        let mut network = Network::ant_plus();
        node.set_network_key(NETWORK_NUMBER_PUBLIC, &mut network)
            .await?;

        let readings = Arc::new(RwLock::new(SensorReadings::default()));
        let heart_rate = HeartRate::new(
            node.clone(),
            network.clone(),
            heart_rate_callbacks(&readings),
        );
        let power = BicyclePower::new(node.clone(), network, power_callbacks(&readings));

        heart_rate.open(None, search_timeout).await?;
        if let Err(e) = power.open(None, search_timeout).await {
            if let Err(close_error) = heart_rate.close().await {
                warn!("Closing heart rate after failed search: {}", close_error);
            }
            return Err(e);
        }

        info!("Searching for heart rate monitor and power meter");
        Ok(Self {
            node,
            heart_rate,
            power,
            readings,
        })
    }

    /// Last heart rate in beats per minute
    #[must_use]
    pub fn heart_rate(&self) -> Option<u8> {
        self.readings.read().heart_rate
    }

    /// Last instantaneous power in watts
    #[must_use]
    pub fn power(&self) -> Option<u16> {
        self.readings.read().power
    }

    /// Last cadence in rpm
    #[must_use]
    pub fn cadence(&self) -> Option<u8> {
        self.readings.read().cadence
    }

    /// Heart rate monitor link status
    #[must_use]
    pub fn heart_rate_status(&self) -> SensorStatus {
        self.readings.read().heart_rate_status
    }

    /// Power meter link status
    #[must_use]
    pub fn power_status(&self) -> SensorStatus {
        self.readings.read().power_status
    }

    /// Snapshot of every cached value
    #[must_use]
    pub fn readings(&self) -> SensorReadings {
        *self.readings.read()
    }

    /// Heart rate profile
    #[must_use]
    pub const fn heart_rate_monitor(&self) -> &HeartRate {
        &self.heart_rate
    }

    /// Bicycle power profile
    #[must_use]
    pub const fn power_meter(&self) -> &BicyclePower {
        &self.power
    }

    /// Node the sensors share
    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Close both profiles and stop the node
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; every step is attempted.
    pub async fn close(&self) -> Result<()> {
        let heart_rate = self.heart_rate.close().await;
        let power = self.power.close().await;
        let node = self.node.stop().await;

        {
            let mut readings = self.readings.write();
            readings.heart_rate_status.lost();
            readings.power_status.lost();
        }

        info!("Sensors closed");
        heart_rate.and(power).and(node)
    }
}

fn heart_rate_callbacks(readings: &Arc<RwLock<SensorReadings>>) -> ProfileCallbacks<HeartRateData> {
    let paired = readings.clone();
    let closed = readings.clone();
    let timeout = readings.clone();
    let data = readings.clone();
    let last_event_time = Mutex::new(None::<f64>);

    ProfileCallbacks::default()
        .on_device_paired(move |_, id| paired.write().heart_rate_status.paired(id))
        .on_channel_closed(move |_| closed.write().heart_rate_status.lost())
        .on_search_timeout(move |_| timeout.write().heart_rate_status.lost())
        .on_data(move |reading: &HeartRateData| {
            let mut readings = data.write();
            readings.heart_rate = Some(reading.heart_rate);
            readings.rr_interval = reading.rr_interval;

            let mut last = last_event_time.lock();
            if last.is_none_or(|time| reading.elapsed_time > time) {
                *last = Some(reading.elapsed_time);
                readings.heart_rate_status.updated();
            }
        })
}

fn power_callbacks(readings: &Arc<RwLock<SensorReadings>>) -> ProfileCallbacks<PowerEvent> {
    let paired = readings.clone();
    let closed = readings.clone();
    let timeout = readings.clone();
    let data = readings.clone();

    ProfileCallbacks::default()
        .on_device_paired(move |_, id| paired.write().power_status.paired(id))
        .on_channel_closed(move |_| closed.write().power_status.lost())
        .on_search_timeout(move |_| timeout.write().power_status.lost())
        .on_data(move |event: &PowerEvent| {
            let PowerEvent::Power(power) = event else {
                return;
            };
            let mut readings = data.write();
            let fresh = readings.power_event_count != Some(power.event_count);
            readings.power = Some(power.instantaneous_power);
            readings.accumulated_power = Some(power.accumulated_power);
            readings.power_event_count = Some(power.event_count);
            readings.cadence = power.cadence;
            if fresh {
                readings.power_status.updated();
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AntError,
        protocol::{Message, MessageId},
        testing::{eventually, MockTransport},
        types::{ChannelState, EventCode, ANT_PLUS_NETWORK_KEY},
    };
    use tokio_test::assert_ok;

    fn config() -> SensorsConfig {
        SensorsConfig {
            node: NodeConfig {
                ack_timeout_ms: 200,
                message_timeout_ms: 200,
                ..NodeConfig::default()
            },
            ..SensorsConfig::default()
        }
    }

    async fn opened(mock: &MockTransport) -> Sensors {
        Sensors::open(Box::new(mock.clone()), config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_installs_key_and_searches() {
        let mock = MockTransport::new();
        let sensors = opened(&mock).await;

        assert_eq!(
            mock.written_of_type(MessageId::NetworkKey),
            vec![Message::NetworkKey {
                network: 0,
                key: ANT_PLUS_NETWORK_KEY,
            }]
        );
        assert_eq!(mock.written_of_type(MessageId::ChannelOpen).len(), 2);
        assert_eq!(sensors.heart_rate_monitor().state(), ChannelState::Searching);
        assert_eq!(sensors.power_meter().state(), ChannelState::Searching);

        assert_eq!(sensors.heart_rate(), None);
        assert_eq!(sensors.power(), None);
        assert_eq!(sensors.cadence(), None);
        assert_eq!(sensors.heart_rate_status().state, ConnectionState::NotConnected);
        assert_eq!(sensors.power_status().state, ConnectionState::NotConnected);

        assert_ok!(sensors.close().await);
        assert!(!sensors.node().is_running());
    }

    #[tokio::test]
    async fn test_readings_follow_broadcasts() {
        let mock = MockTransport::new();
        let sensors = opened(&mock).await;
        let hr_channel = sensors.heart_rate_monitor().channel().unwrap().number();
        let power_channel = sensors.power_meter().channel().unwrap().number();
        assert_ne!(hr_channel, power_channel);

        mock.broadcast(hr_channel, [0x00, 0xFF, 0, 0, 0x88, 0x06, 130, 72]);
        mock.broadcast(power_channel, [0x10, 4, 0xFF, 88, 0x10, 0x27, 0xF0, 0x00]);

        assert!(eventually(|| sensors.heart_rate() == Some(72)).await);
        assert!(eventually(|| sensors.power() == Some(240)).await);
        assert_eq!(sensors.cadence(), Some(88));
        assert_eq!(sensors.readings().accumulated_power, Some(10_000));
        assert_eq!(sensors.readings().power_event_count, Some(4));

        assert!(eventually(|| sensors.heart_rate_status().channel_id.is_some()).await);
        let status = sensors.heart_rate_status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.last_update.is_some());

        assert_ok!(sensors.close().await);
        assert_eq!(sensors.power_status().state, ConnectionState::NotConnected);
    }

    #[tokio::test]
    async fn test_search_timeout_marks_sensor_not_connected() {
        let mock = MockTransport::new();
        let sensors = opened(&mock).await;
        let power_channel = sensors.power_meter().channel().unwrap().number();

        mock.broadcast(power_channel, [0x10, 1, 0xFF, 90, 0, 0, 100, 0]);
        assert!(eventually(|| sensors.power_status().state == ConnectionState::Connected).await);

        mock.event(power_channel, EventCode::RxSearchTimeout);
        assert!(
            eventually(|| sensors.power_status().state == ConnectionState::NotConnected).await
        );
        assert_eq!(sensors.power(), Some(100));

        assert_ok!(sensors.close().await);
    }

    fn search_timeouts(mock: &MockTransport) -> Vec<u8> {
        mock.written_of_type(MessageId::ChannelSearchTimeout)
            .into_iter()
            .filter_map(|message| match message {
                Message::ChannelSearchTimeout { timeout, .. } => Some(timeout),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_default_search_timeout_is_two_minutes() {
        let mock = MockTransport::new();
        let sensors = opened(&mock).await;

        assert_eq!(SensorsConfig::default().search_timeout(), Duration::from_secs(120));
        assert_eq!(search_timeouts(&mock), vec![48, 48]);

        assert_ok!(sensors.close().await);
    }

    #[tokio::test]
    async fn test_search_timeout_is_configurable() {
        let mock = MockTransport::new();
        let config = SensorsConfig {
            search_timeout_ms: 10_000,
            ..config()
        };
        let sensors = Sensors::open(Box::new(mock.clone()), config).await.unwrap();

        assert_eq!(search_timeouts(&mock), vec![4, 4]);

        assert_ok!(sensors.close().await);
    }

    #[tokio::test]
    async fn test_repeated_power_page_does_not_refresh_status() {
        let mock = MockTransport::new();
        let sensors = opened(&mock).await;
        let power_channel = sensors.power_meter().channel().unwrap().number();

        mock.broadcast(power_channel, [0x10, 4, 0xFF, 90, 0, 0, 200, 0]);
        assert!(eventually(|| sensors.power() == Some(200)).await);
        let first = sensors.power_status().last_update;
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        mock.broadcast(power_channel, [0x10, 4, 0xFF, 90, 0, 0, 210, 0]);
        assert!(eventually(|| sensors.power() == Some(210)).await);
        assert_eq!(sensors.power_status().last_update, first);

        mock.broadcast(power_channel, [0x10, 5, 0xFF, 90, 0, 0, 220, 0]);
        assert!(eventually(|| sensors.power_status().last_update > first).await);

        assert_ok!(sensors.close().await);
    }

    #[tokio::test]
    async fn test_repeated_heart_rate_event_time_does_not_refresh_status() {
        let mock = MockTransport::new();
        let sensors = opened(&mock).await;
        let hr_channel = sensors.heart_rate_monitor().channel().unwrap().number();

        mock.broadcast(hr_channel, [0x00, 0xFF, 0, 0, 0x00, 0x04, 10, 70]);
        assert!(eventually(|| sensors.heart_rate() == Some(70)).await);
        let first = sensors.heart_rate_status().last_update;
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        mock.broadcast(hr_channel, [0x00, 0xFF, 0, 0, 0x00, 0x04, 10, 71]);
        assert!(eventually(|| sensors.heart_rate() == Some(71)).await);
        assert_eq!(sensors.heart_rate_status().last_update, first);

        mock.broadcast(hr_channel, [0x00, 0xFF, 0, 0, 0x00, 0x08, 11, 72]);
        assert!(eventually(|| sensors.heart_rate_status().last_update > first).await);

        assert_ok!(sensors.close().await);
    }

    #[tokio::test]
    async fn test_usb_sensors_fail_without_stick() {
        let params = UsbParams {
            vendor_id: 0xFFFF,
            product_id: 0xFFFE,
            ..UsbParams::default()
        };
        assert!(Sensors::usb(params, config()).await.is_err());
    }

    #[tokio::test]
    async fn test_open_fails_without_free_channels() {
        let mock = MockTransport::new().with_channels(1);
        let result = Sensors::open(Box::new(mock.clone()), config()).await;

        assert!(matches!(result, Err(AntError::NoFreeChannel)));
        assert!(!mock.is_open());
        assert_eq!(mock.written_of_type(MessageId::ChannelUnassign).len(), 1);
    }
}
