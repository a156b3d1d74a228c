use ant_sensors::{
    ConnectionState, Result, SensorStatus, Sensors, SensorsConfig, SerialParams, UsbParams,
};
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info};

fn link(status: &SensorStatus) -> String {
    match (status.state, status.channel_id) {
        (ConnectionState::Connected, Some(id)) => format!("paired with {id}"),
        (ConnectionState::Connected, None) => "receiving".to_string(),
        (ConnectionState::Stale, _) => "stale".to_string(),
        (ConnectionState::NotConnected, _) => "searching".to_string(),
    }
}

fn show<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "--".to_string(), |value| value.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let target = std::env::args().nth(1);

    info!("📡 ANT+ Sensor Monitor");

    let opened = match target.as_deref() {
        Some("usb") => {
            info!("Opening ANT USB stick");
            Sensors::usb(UsbParams::default(), SensorsConfig::default()).await
        }
        path => {
            let params = SerialParams {
                path: path.map_or_else(|| SerialParams::default().path, str::to_string),
                ..SerialParams::default()
            };
            info!("Opening dongle at {}", params.path);
            Sensors::serial(params, SensorsConfig::default()).await
        }
    };

    let sensors = match opened {
        Ok(sensors) => sensors,
        Err(e) => {
            error!("❌ Failed to open dongle: {}", e);
            return Err(e);
        }
    };

    if let Ok(version) = sensors.node().version().await {
        info!("Dongle firmware {}", version);
    }
    info!("Press Ctrl+C to stop monitoring");

    let mut ticker = interval(Duration::from_millis(250));
    let start_time = Instant::now();
    let mut max_power = 0u16;
    let mut max_heart_rate = 0u8;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let readings = sensors.readings();
        max_power = max_power.max(readings.power.unwrap_or(0));
        max_heart_rate = max_heart_rate.max(readings.heart_rate.unwrap_or(0));

        let elapsed = start_time.elapsed().as_secs();
        println!(
            "[{:02}:{:02}] heart rate: {:>3} bpm  power: {:>4} W  cadence: {:>3} rpm",
            elapsed / 60,
            elapsed % 60,
            show(readings.heart_rate),
            show(readings.power),
            show(readings.cadence)
        );

        if elapsed % 10 == 0 && start_time.elapsed().subsec_millis() < 250 {
            println!(
                "  heart rate monitor: {}  power meter: {}",
                link(&readings.heart_rate_status),
                link(&readings.power_status)
            );
        }
    }

    info!("🔌 Closing sensors...");
    if let Err(e) = sensors.close().await {
        error!("❌ Failed to close cleanly: {}", e);
    }

    println!("\n📊 Session Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        start_time.elapsed().as_secs() / 60,
        start_time.elapsed().as_secs() % 60
    );
    println!("  Max Heart Rate: {max_heart_rate} bpm");
    println!("  Max Power: {max_power} W");

    Ok(())
}
