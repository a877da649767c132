use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::{timeout_at, Instant};

use gatt_central::bluetooth::{
    list_adapters, receiver_to_stream, BleEvent, BleManager, BtleplugTransport, EventBroker,
    EventFilter, EventType,
};
use gatt_central::config::AppConfig;
use gatt_central::error::{AppError, ErrorContext, Result};
use gatt_central::logging::{configure_logging, log_error, parse_debug_flags, set_debug_flags};

type EventStream = Pin<Box<dyn Stream<Item = BleEvent> + Send>>;

/// Time allowed for connecting and for each GATT step of `read`
const STEP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration, using defaults: {}", e);
            AppConfig::default()
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("{}", e);
    }

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("adapters");

    let result = match command {
        "adapters" => show_adapters().await,
        "scan" => {
            let duration = args
                .get(2)
                .and_then(|secs| secs.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.scan_duration());
            scan(&config, duration).await
        }
        "read" if args.len() == 5 => read(&config, &args[2], &args[3], &args[4]).await,
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        let ctx = ErrorContext::new("main", command).with_user_message("Check that Bluetooth is enabled");
        log_error(&e, &ctx);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` hands logging to env_logger; otherwise the configured logger is used
fn init_logging(config: &AppConfig) -> Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
        return Ok(());
    }
    if let Ok(categories) = std::env::var("GATT_CENTRAL_DEBUG") {
        set_debug_flags(parse_debug_flags(&categories));
    }
    configure_logging(config.log_level, config.log_file.clone(), true).map_err(AppError::Logging)
}

async fn show_adapters() -> Result<()> {
    println!("Discovering Bluetooth adapters...");
    let adapters = list_adapters().await?;
    if adapters.is_empty() {
        println!("No Bluetooth adapters found");
    }
    for adapter in adapters {
        println!("  {}", adapter);
    }
    Ok(())
}

/// Manager over the default adapter plus a stream of the event types wanted
async fn start_manager(config: &AppConfig, wanted: Vec<EventType>) -> Result<(BleManager, EventBroker, EventStream)> {
    let (transport, transport_events) = BtleplugTransport::new().await?;
    let (manager, events) = BleManager::new(Arc::new(transport), transport_events, config.to_manager_config());

    let mut broker = EventBroker::new(config.event_channel_capacity);
    broker.start(events);
    let (_, rx) = broker.subscribe(EventFilter::event_types(wanted));
    Ok((manager, broker, Box::pin(receiver_to_stream(rx))))
}

/// Next event accepted by `pick`, or `None` once `deadline` passes
async fn next_event<T>(
    stream: &mut EventStream,
    deadline: Instant,
    mut pick: impl FnMut(BleEvent) -> Option<T>,
) -> Option<T> {
    loop {
        match timeout_at(deadline, stream.next()).await {
            Ok(Some(event)) => {
                if let Some(picked) = pick(event) {
                    return Some(picked);
                }
            }
            Ok(None) | Err(_) => return None,
        }
    }
}

async fn scan(config: &AppConfig, duration: Duration) -> Result<()> {
    println!("Scanning for {} seconds...", duration.as_secs());
    let (manager, mut broker, mut stream) =
        start_manager(config, vec![EventType::Scan, EventType::ScanState, EventType::RadioState]).await?;

    manager.scan(config.scan_services.as_slice(), config.allow_duplicates)?;
    let deadline = Instant::now() + duration;
    while let Some(event) = next_event(&mut stream, deadline, Some).await {
        match event {
            BleEvent::Scan { device_id, rssi, info } => println!(
                "  {} {} rssi {} {}",
                device_id,
                info.address,
                rssi,
                info.advertisement.local_name.as_deref().unwrap_or("(unnamed)")
            ),
            BleEvent::ScanState(Err(e)) => return Err(e.into()),
            other => println!("  {}", other),
        }
    }

    manager.stop_scan()?;
    println!("Found {} devices", manager.devices().len());
    broker.shutdown();
    Ok(())
}

async fn read(config: &AppConfig, device_id: &str, service: &str, characteristic: &str) -> Result<()> {
    let (manager, mut broker, mut stream) = start_manager(config, vec![EventType::Scan, EventType::Connected, EventType::Read])
        .await?;

    println!("Looking for {}...", device_id);
    manager.scan(config.scan_services.as_slice(), false)?;
    let deadline = Instant::now() + config.scan_duration();
    let seen = next_event(&mut stream, deadline, |event| match event {
        BleEvent::Scan { device_id: id, .. } if id == device_id => Some(()),
        _ => None,
    })
    .await;
    manager.stop_scan()?;
    if seen.is_none() && !manager.is_known(device_id) {
        println!("Device {} not seen", device_id);
        return Ok(());
    }

    manager.connect(device_id)?;
    let connected = next_event(&mut stream, Instant::now() + STEP_TIMEOUT, |event| match event {
        BleEvent::Connected { device_id: id, result } if id == device_id => Some(result),
        _ => None,
    })
    .await;
    match connected {
        Some(result) => result?,
        None => {
            println!("Timed out connecting to {}", device_id);
            return Ok(());
        }
    }

    manager.read(device_id, service, characteristic)?;
    let value = next_event(&mut stream, Instant::now() + STEP_TIMEOUT, |event| match event {
        BleEvent::Read { device_id: id, result, is_notification: false, .. } if id == device_id => Some(result),
        _ => None,
    })
    .await;
    match value {
        Some(Ok(bytes)) => println!("{} {}: {}", service, characteristic, hex(&bytes)),
        Some(Err(e)) => println!("Read failed: {}", e),
        None => println!("Timed out reading {} {}", service, characteristic),
    }

    manager.disconnect(device_id)?;
    broker.shutdown();
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

fn print_usage() {
    println!("\nUsage:");
    println!("  gatt_central adapters                          - List Bluetooth adapters");
    println!("  gatt_central scan [seconds]                    - Scan and print advertising devices");
    println!("  gatt_central read <device-id> <service> <char> - Connect and read one characteristic");
}
