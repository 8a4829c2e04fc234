//! Scans for a (simulated) battery powered sensor, connects and then
//! reports its battery level until it drops below 40%, or Ctrl-C.

use std::pin::Pin;
use std::time::Duration;

use futures::FutureExt;
use gatt_sync::fake::FakeDevice;
use gatt_sync::uuid::{uuid_from_u16, BATTERY_LEVEL, BATTERY_SERVICE};
use gatt_sync::{Characteristic, Handle, PeripheralState, ScanCriteria, SessionConfig, Value};
use tokio::signal;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::{Stream, StreamExt, StreamMap};
use uuid::Uuid;

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum EventSource {
    Bluetooth,
    Interrupt, // Ctrl-C handling
    Drain,     // Simulated battery discharge
}

#[derive(Debug, Clone)]
enum Event {
    BtEvent(gatt_sync::Event),
    Interrupt,
    Drain,
}

const SENSOR_ID: Uuid = uuid_from_u16(0xBA77);
const SENSOR_HANDLE: Handle = Handle(0);
const LOW_BATTERY: u8 = 40;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn) // Default Log Level
        .parse_default_env()
        .init();

    let (session, transport) = SessionConfig::new().start_fake().await?;
    transport.add_device(FakeDevice::battery_sensor(SENSOR_HANDLE, SENSOR_ID, 50));

    let mut mainloop = StreamMap::new();

    let ctrl_c_stream: Pin<Box<dyn Stream<Item = Event>>> = Box::pin(signal::ctrl_c().into_stream().map(|_| {
        println!("Ctrl-C");
        Event::Interrupt
    }));
    mainloop.insert(EventSource::Interrupt, ctrl_c_stream);

    let bt_event_stream: Pin<Box<dyn Stream<Item = Event>>> = Box::pin(session.events()?.map(Event::BtEvent));
    mainloop.insert(EventSource::Bluetooth, bt_event_stream);

    session.start_scanning(ScanCriteria::new().with_service(BATTERY_SERVICE))?;

    let mut level = 50u8;
    let mut level_characteristic: Option<Characteristic> = None;

    while let Some((_, event)) = mainloop.next().await {
        match event {
            Event::BtEvent(event) => match event {
                gatt_sync::Event::PeripheralDiscovered { peripheral, name, rssi } => {
                    println!("Discovered peripheral: {:?} ({} dBm)", name, rssi);
                    session.stop_scanning();
                    if let Some(peripheral) = session.peripheral(peripheral) {
                        peripheral.connect()?;
                    }
                }
                gatt_sync::Event::PeripheralStateChanged { peripheral, state } => {
                    println!("Peripheral {} is now {:?}", peripheral, state);
                    if state != PeripheralState::Ready {
                        continue;
                    }
                    let characteristic = session
                        .peripheral(peripheral)
                        .and_then(|peripheral| peripheral.service(BATTERY_SERVICE))
                        .and_then(|service| service.characteristic(BATTERY_LEVEL));
                    if let Some(characteristic) = characteristic {
                        println!("Initial battery level: {:?}", characteristic.read_value().await?);
                        characteristic.subscribe().await?;

                        let interval = IntervalStream::new(tokio::time::interval(Duration::from_millis(250)));
                        let drain: Pin<Box<dyn Stream<Item = Event>>> = Box::pin(interval.map(|_| Event::Drain));
                        mainloop.insert(EventSource::Drain, drain);
                        level_characteristic = Some(characteristic);
                    }
                }
                gatt_sync::Event::CharacteristicValueChanged {
                    decoded: Some(Value::BatteryLevel(percent)),
                    ..
                } => {
                    println!("Battery: {}%", percent);
                    if percent < LOW_BATTERY {
                        println!("Battery low, disconnecting");
                        if let Some(characteristic) = &level_characteristic {
                            characteristic.unsubscribe().await?;
                            characteristic.service().peripheral().disconnect()?;
                        }
                        break;
                    }
                }
                gatt_sync::Event::Error { scope, error } => {
                    println!("Error ({:?}): {}", scope, error);
                }
                _ => {}
            },
            Event::Drain => {
                if let Some(characteristic) = &level_characteristic {
                    level = level.saturating_sub(1);
                    let handle = session.with_engine(|engine| {
                        engine
                            .characteristic(&characteristic.path())
                            .map(|node| node.handle())
                    });
                    if let Some(handle) = handle {
                        transport.notify(handle, &[level]);
                    }
                }
            }
            Event::Interrupt => {
                println!("Interrupt received!");
                break;
            }
        }
    }

    Ok(())
}
