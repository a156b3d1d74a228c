use serde::{Deserialize, Serialize};

use crate::device::{DeviceProfile, ProfileDecoder};

/// ANT+ device type of heart rate monitors
pub const HEART_RATE_DEVICE_TYPE: u8 = 0x78;

/// Channel period of heart rate monitors (about 4.06 Hz)
pub const HEART_RATE_CHANNEL_PERIOD: u16 = 8070;

/// Page carrying the previous heart beat event time
pub const PREVIOUS_HEART_BEAT_PAGE: u8 = 4;

const PAGE_MASK: u8 = 0x7F;
const TOGGLE_BIT: u8 = 0x80;
const TICKS_PER_SECOND: f64 = 1024.0;

/// One decoded heart rate broadcast
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateData {
    /// Heart rate computed by the monitor, in beats per minute
    pub heart_rate: u8,
    /// Seconds of event time accumulated since the profile was opened
    pub elapsed_time: f64,
    /// Time between the last two beats in milliseconds, when it can be trusted
    pub rr_interval: Option<f64>,
}

/// Heart rate telemetry accumulated since the profile was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartRateTelemetry {
    /// Last computed heart rate
    pub heart_rate: Option<u8>,
    /// Accumulated event time in seconds
    pub elapsed_time: f64,
    /// Last RR interval in milliseconds
    pub rr_interval: Option<f64>,
    /// Beat count of the last broadcast
    pub previous_beat_count: u8,
    /// Event time (1/1024 s ticks) of the last broadcast
    pub previous_event_time: u16,
    /// Whether the page toggle bit has flipped since open
    pub page_toggle_observed: bool,
}

/// Decoder for the ANT+ heart rate profile
///
/// The RR interval comes from the previous-beat time on page 4 once the page
/// toggle bit has flipped, otherwise from a single-beat increment between two
/// consecutive broadcasts. The first broadcast after the decoder is created
/// never carries an RR interval, since there is no earlier beat to measure
/// from.
#[derive(Debug, Default)]
pub struct HeartRateDecoder {
    telemetry: HeartRateTelemetry,
    first_toggle: Option<bool>,
    seen_broadcast: bool,
}

fn ticks_to_millis(ticks: u16) -> f64 {
    f64::from(ticks) * 1000.0 / TICKS_PER_SECOND
}

impl HeartRateDecoder {
    fn observe_toggle(&mut self, toggle: bool) {
        if self.telemetry.page_toggle_observed {
            return;
        }
        match self.first_toggle {
            None => self.first_toggle = Some(toggle),
            Some(first) if first != toggle => self.telemetry.page_toggle_observed = true,
            Some(_) => {}
        }
    }
}

impl ProfileDecoder for HeartRateDecoder {
    const NAME: &'static str = "Heart Rate";
    const DEVICE_TYPE: u8 = HEART_RATE_DEVICE_TYPE;
    const CHANNEL_PERIOD: u16 = HEART_RATE_CHANNEL_PERIOD;

    type Event = HeartRateData;
    type Telemetry = HeartRateTelemetry;

    fn decode(&mut self, data: &[u8; 8]) -> Option<HeartRateData> {
        let page = data[0] & PAGE_MASK;
        self.observe_toggle(data[0] & TOGGLE_BIT != 0);

        let previous_event_time = u16::from_le_bytes([data[2], data[3]]);
        let event_time = u16::from_le_bytes([data[4], data[5]]);
        let beat_count = data[6];
        let heart_rate = data[7];

        let beats = beat_count.wrapping_sub(self.telemetry.previous_beat_count);
        let elapsed_ticks = event_time.wrapping_sub(self.telemetry.previous_event_time);

        let rr_interval = if page == PREVIOUS_HEART_BEAT_PAGE && self.telemetry.page_toggle_observed
        {
            Some(ticks_to_millis(
                event_time.wrapping_sub(previous_event_time),
            ))
        } else if beats == 1 && self.seen_broadcast {
            Some(ticks_to_millis(elapsed_ticks))
        } else {
            None
        };

        let telemetry = &mut self.telemetry;
        telemetry.heart_rate = Some(heart_rate);
        telemetry.rr_interval = rr_interval;
        telemetry.previous_beat_count = beat_count;
        telemetry.previous_event_time = event_time;
        telemetry.elapsed_time += f64::from(elapsed_ticks) / TICKS_PER_SECOND;
        self.seen_broadcast = true;

        Some(HeartRateData {
            heart_rate,
            elapsed_time: telemetry.elapsed_time,
            rr_interval,
        })
    }

    fn telemetry(&self) -> HeartRateTelemetry {
        self.telemetry
    }
}

/// ANT+ heart rate monitor profile
pub type HeartRate = DeviceProfile<HeartRateDecoder>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{ProfileCallbacks, DEFAULT_SEARCH_TIMEOUT},
        node::Node,
        testing::{eventually, MockTransport},
        types::{ChannelState, Network, NodeConfig},
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn page(page: u8, toggle: bool, previous_time: u16, time: u16, beats: u8, bpm: u8) -> [u8; 8] {
        let previous = previous_time.to_le_bytes();
        let current = time.to_le_bytes();
        [
            page | if toggle { TOGGLE_BIT } else { 0 },
            0xFF,
            previous[0],
            previous[1],
            current[0],
            current[1],
            beats,
            bpm,
        ]
    }

    fn standard(time: u16, beats: u8) -> [u8; 8] {
        page(0, false, 0xFFFF, time, beats, 0xB4)
    }

    #[test]
    fn test_decodes_computed_heart_rate() {
        let mut decoder = HeartRateDecoder::default();
        let data = decoder.decode(&page(0, false, 0, 0, 0, 100)).unwrap();
        assert_eq!(data.heart_rate, 100);
        assert_eq!(decoder.telemetry().heart_rate, Some(100));
    }

    #[test]
    fn test_consecutive_beats_give_rr_interval() {
        let mut decoder = HeartRateDecoder::default();
        decoder.decode(&standard(1672, 130));
        let data = decoder.decode(&standard(2013, 131)).unwrap();

        assert_eq!(data.rr_interval, Some(333.007_812_5));
        assert!((data.elapsed_time - 1.965_820_312_5).abs() < 1e-12);
    }

    #[test]
    fn test_skipped_beat_gives_no_rr_interval() {
        let mut decoder = HeartRateDecoder::default();
        decoder.decode(&standard(1672, 129));
        let data = decoder.decode(&standard(2013, 131)).unwrap();

        assert_eq!(data.rr_interval, None);
        assert!((data.elapsed_time - 1.965_820_312_5).abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_broadcast_gives_no_rr_interval() {
        let mut decoder = HeartRateDecoder::default();
        decoder.decode(&standard(1672, 130));
        let data = decoder.decode(&standard(1672, 130)).unwrap();
        assert_eq!(data.rr_interval, None);
    }

    #[test]
    fn test_first_broadcast_never_has_rr_interval() {
        let mut decoder = HeartRateDecoder::default();
        let data = decoder.decode(&standard(1024, 1)).unwrap();
        assert_eq!(data.rr_interval, None);
        assert!((data.elapsed_time - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_counters_wrap_around() {
        let mut decoder = HeartRateDecoder::default();
        decoder.decode(&standard(65535, 255));
        let data = decoder.decode(&standard(341, 0)).unwrap();

        assert_eq!(data.rr_interval, Some(333.984_375));
        assert!((data.elapsed_time - 64.333_007_812_5).abs() < 1e-12);
    }

    #[test]
    fn test_previous_beat_page_needs_toggle_flip() {
        let mut decoder = HeartRateDecoder::default();

        let first = decoder
            .decode(&page(PREVIOUS_HEART_BEAT_PAGE, false, 1672, 2013, 131, 0xB4))
            .unwrap();
        assert_eq!(first.rr_interval, None);
        assert!(!decoder.telemetry().page_toggle_observed);

        let second = decoder
            .decode(&page(PREVIOUS_HEART_BEAT_PAGE, true, 1672, 2013, 131, 0xB4))
            .unwrap();
        assert!(decoder.telemetry().page_toggle_observed);
        assert_eq!(second.rr_interval, Some(333.007_812_5));
    }

    #[test]
    fn test_other_extended_pages_use_beat_count() {
        let mut decoder = HeartRateDecoder::default();
        let times = [2000u16, 2500, 3000, 3500];
        let mut intervals = Vec::new();

        for (index, time) in times.iter().enumerate() {
            let toggle = index % 2 == 1;
            let page_number = if index % 2 == 0 { 2 } else { 3 };
            let beats = 131 + u8::try_from(index).unwrap();
            let data = decoder
                .decode(&page(page_number, toggle, 0xFFFF, *time, beats, 0xB4))
                .unwrap();
            intervals.push(data.rr_interval);
        }

        assert_eq!(
            intervals,
            vec![None, Some(488.281_25), Some(488.281_25), Some(488.281_25)]
        );
    }

    #[tokio::test]
    async fn test_heart_rate_profile_end_to_end() {
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

        let readings = Arc::new(Mutex::new(Vec::new()));
        let sink = readings.clone();
        let hr = HeartRate::new(
            node.clone(),
            Network::ant_plus(),
            ProfileCallbacks::default().on_data(move |data: &HeartRateData| sink.lock().push(*data)),
        );
        hr.open(None, DEFAULT_SEARCH_TIMEOUT).await.unwrap();
        let channel = hr.channel().unwrap();
        assert_eq!(channel.config().period, Some(HEART_RATE_CHANNEL_PERIOD));
        assert_eq!(channel.config().search_timeout, Some(12));

        mock.broadcast(channel.number(), standard(1672, 130));
        mock.broadcast(channel.number(), standard(2013, 131));

        assert!(eventually(|| readings.lock().len() == 2).await);
        assert_eq!(readings.lock()[1].rr_interval, Some(333.007_812_5));
        assert!(eventually(|| hr.state() == ChannelState::Open).await);

        hr.close().await.unwrap();
        node.stop().await.unwrap();
    }
}
