use std::env;

use iotwatch_sdk::api::ApiClient;
use iotwatch_sdk::stream::client::RealtimeClient;
use iotwatch_sdk::stream::session::{BoardEvent, DeviceBoard};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base_url = env::var("IOTWATCH_URL").unwrap_or_else(|_| "http://localhost:8000".into());
    let token = SecretString::from(env::var("IOTWATCH_TOKEN").unwrap_or_else(|_| "REPLACE_ME".into()));

    let api = ApiClient::new(&base_url, token.clone())?;
    let profile = api.me().await?;
    let summaries = api.devices().await?;
    println!(
        "signed in as {} with {} readable devices",
        profile.email,
        profile.readable_device_ids().len()
    );

    let connection = RealtimeClient::new(base_url, token).connect()?;
    let mut board = DeviceBoard::attach(connection);
    board.seed(&summaries);
    board.watch_devices(profile.readable_device_ids());

    while let Some(event) = board.recv().await {
        match event {
            BoardEvent::Reading { device_id, .. } => {
                if let Some(device) = board.device(&device_id) {
                    println!(
                        "{device_id}: temperature={:?} humidity={:?}",
                        device.temperature, device.humidity
                    );
                }
            }
            BoardEvent::Status { device_id, status } => {
                println!("{device_id}: status {status:?}");
            }
            BoardEvent::Disconnected { device_id } => {
                println!("{device_id}: disconnected");
            }
            BoardEvent::Alarm { device_id, .. } => {
                println!("alarm for {device_id:?}");
            }
        }
    }

    Ok(())
}
