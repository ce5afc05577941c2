//! # Card Reader Simulator
//!
//! Runs one full reader session against the simulated terminal and prints
//! every event as a JSON line.
//!
//! ## Session
//! 1. Initialize tracing (stderr) and load the config
//! 2. Build the manager over the simulated terminal and backend
//! 3. Discover readers and connect to the first one found
//! 4. Collect a payment for the amount given on the command line
//! 5. Refund it as an Interac charge
//! 6. Install the pending reader update
//! 7. Disconnect and shut down
//!
//! ## Usage
//! ```text
//! cardreader-sim [AMOUNT] [CURRENCY]
//! cardreader-sim 12.50 USD
//! ```
//! `CARDREADER_CONFIG` points at an alternate config file.

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use cardreader::{
    CardReaderManager, CardReaderManagerBuilder, ReaderConfig, SimulatedBackend,
    SimulatedTerminal,
};
use cardreader_core::{
    DiscoveryEvent, Money, PaymentInfo, Reader, ReaderSoftwareUpdate, ReaderType, RefundParams,
    UpdateTimeEstimate,
};

const DEFAULT_LOCATION: &str = "tml_simulated";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let amount: Money = args.next().unwrap_or_else(|| "12.50".to_string()).parse()?;
    let currency = args.next().unwrap_or_else(|| "USD".to_string());

    let config_path = std::env::var("CARDREADER_CONFIG").ok().map(PathBuf::from);
    let config = ReaderConfig::load_or_default(config_path);
    if !config.discovery.mode.is_simulated() {
        warn!(mode = %config.discovery.mode, "Only simulated readers are available here");
    }
    let location_id = config
        .discovery
        .location_id
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCATION.to_string());

    let backend = Arc::new(SimulatedBackend::new());
    let manager = CardReaderManagerBuilder::new(config)
        .with_terminal(Arc::new(simulated_terminal()))
        .with_credential_store(backend.clone())
        .with_capturer(backend)
        .build()?;

    manager.initialize().await?;
    spawn_observers(&manager);

    // Discover
    let mut discovery = manager.discover_configured_readers().await;
    let mut found: Option<Reader> = None;
    while let Some(event) = discovery.next().await {
        if let DiscoveryEvent::ReadersFound(readers) = &event {
            found = found.or_else(|| readers.first().cloned());
        }
        emit("discovery", &event);
    }
    let reader = match found {
        Some(reader) => reader,
        None => {
            warn!("No readers found");
            manager.shutdown().await;
            return Ok(());
        }
    };

    // Connect
    let connected = manager
        .start_connection_to_reader(reader, &location_id)
        .await?;
    info!(reader = %connected.display_name(), "Connected");

    // Pay
    let order_id = 1001;
    let mut attempt = manager
        .collect_payment(PaymentInfo {
            payment_description: format!("Order #{}", order_id),
            order_id,
            amount,
            currency: currency.clone(),
            customer_email: None,
            customer_name: None,
            store_name: Some("Simulated Store".to_string()),
            site_url: None,
            order_key: None,
            statement_descriptor: None,
            country_code: None,
            fee_amount: None,
            plugin_can_send_receipt: false,
        })
        .await;
    while let Some(status) = attempt.next().await {
        emit("payment", &status);
    }

    // Refund
    let mut refund = manager
        .refund_interac_payment(RefundParams {
            charge_id: format!("ch_sim_{}", order_id),
            amount,
            currency,
        })
        .await;
    while let Some(status) = refund.next().await {
        emit("interac_refund", &status);
    }

    // Update
    let outcome = manager.start_async_software_update().await.outcome().await;
    emit("software_update_outcome", &outcome);

    manager.disconnect_reader().await;
    // Let the observers print the final states.
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.shutdown().await;
    Ok(())
}

/// Initializes the tracing subscriber for logging.
///
/// Logs go to stderr so stdout stays pure JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cardreader=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .with_writer(std::io::stderr)
        .init();
}

fn simulated_terminal() -> SimulatedTerminal {
    let now = chrono::Utc::now();
    SimulatedTerminal::builder()
        .readers(vec![
            Reader::new(Some("CHB204909005931".to_string()), ReaderType::Chipper2X, now)
                .with_battery_level(0.74)
                .with_firmware_version("2.00.00.12"),
            Reader::new(Some("STRM26138003393".to_string()), ReaderType::StripeM2, now)
                .with_battery_level(0.31),
        ])
        .step_delay(Duration::from_millis(300))
        .pending_update(ReaderSoftwareUpdate {
            version: "2.01.00.17".to_string(),
            time_estimate: UpdateTimeEstimate::LessThanOneMinute,
            has_config_update: true,
            has_firmware_update: true,
            has_key_update: false,
        })
        .install_progress(vec![0.1, 0.25, 0.5, 0.75, 1.0])
        .install_step_delay(Duration::from_millis(200))
        .build()
}

fn spawn_observers(manager: &CardReaderManager) {
    spawn_printer("reader_status", manager.reader_status_stream());
    spawn_printer("battery_status", manager.battery_status_stream());
    spawn_printer("reader_message", manager.reader_messages_stream());
    spawn_printer(
        "software_update_availability",
        manager.software_update_availability_stream(),
    );
    spawn_printer("software_update_status", manager.software_update_status_stream());
}

fn emit<T: Serialize>(event: &str, data: &T) {
    let line = serde_json::json!({ "event": event, "data": data });
    println!("{}", line);
}

/// Prints every value of an observable until it closes.
fn spawn_printer<S>(event: &'static str, stream: S)
where
    S: Stream + Send + 'static,
    S::Item: Serialize + Send,
{
    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        while let Some(value) = stream.next().await {
            emit(event, &value);
        }
    });
}
