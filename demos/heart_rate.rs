use std::error::Error;

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use std::time::Duration;

    use tracing::info;
    use tracing::metadata::LevelFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};
    use webble::events::EventKind;
    use webble::{Backend, Bluetooth, BluetoothOptions, RequestDeviceOptions, ScanFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let _teardown = webble::bluez::teardown_guard();
    let stack = webble::bluez::stack().await?;
    let bluetooth = Bluetooth::new(Backend::event_stream(stack), BluetoothOptions::default()).await?;
    if !bluetooth.get_availability().await {
        return Err("Bluetooth adapter is off".into());
    }

    info!("looking for a heart rate sensor");
    let options = RequestDeviceOptions::with_filters(vec![ScanFilter::services(["heart_rate"])])
        .with_optional_services(["battery_service"]);
    let device = bluetooth.request_device(options).await?;
    info!("found {} ({})", device.name(), device.id());

    device.add_event_listener(EventKind::GattServerDisconnected, |_| info!("disconnected"));
    let server = device.gatt();
    server.connect().await?;
    info!("connected!");

    if let Ok(battery) = server.get_primary_service("battery_service").await {
        let level = battery.get_characteristic("battery_level").await?.read_value().await?;
        info!("battery level {:?}%", level.first());
    }

    let service = server.get_primary_service("heart_rate").await?;
    let measurement = service.get_characteristic("heart_rate_measurement").await?;
    measurement.add_event_listener(EventKind::CharacteristicValueChanged, |event| {
        if let webble::events::EventTarget::Characteristic(characteristic) = event.target() {
            info!("measurement {:?}", characteristic.value());
        }
    });
    measurement.start_notifications().await?;

    tokio::time::sleep(Duration::from_secs(30)).await;

    measurement.stop_notifications().await?;
    server.disconnect().await?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<(), Box<dyn Error>> {
    Err("the BlueZ stack is only available on Linux".into())
}
