use anyhow::Context;
use braille_link::domain::braille::first_cell;
use braille_link::domain::models::{DeviceEvent, MessageSeverity};
use braille_link::domain::settings::{Settings, SettingsService};
use braille_link::infrastructure::device::{DeviceService, Transport};
use braille_link::infrastructure::logging;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)?;
    info!(
        settings = %settings_service.path().display(),
        "Starting braille link"
    );

    run(settings_service.get()).await
}

#[cfg(windows)]
async fn run(settings: &Settings) -> anyhow::Result<()> {
    use braille_link::infrastructure::device::winrt::WinRtTransport;
    session(WinRtTransport::new(&settings.device)).await
}

#[cfg(not(windows))]
async fn run(_settings: &Settings) -> anyhow::Result<()> {
    anyhow::bail!("no Bluetooth LE transport is available on this platform")
}

/// Connect, then send the first cell of every word read from stdin.
#[cfg_attr(not(windows), allow(dead_code))]
async fn session<T: Transport>(transport: T) -> anyhow::Result<()> {
    let (service, mut events) = DeviceService::spawn(transport);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DeviceEvent::StateChanged(state) => info!("Device is {}", state),
                DeviceEvent::Status(status) => match status.severity {
                    MessageSeverity::Error => error!("{}", status.message),
                    MessageSeverity::Warning => warn!("{}", status.message),
                    _ => info!("{}", status.message),
                },
            }
        }
    });

    service.connect().await.context("could not connect")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.eq_ignore_ascii_case("quit") {
            break;
        }
        for word in line.split_whitespace() {
            let pattern = first_cell(word);
            match service.send_pattern(pattern).await {
                Ok(()) => info!(%word, %pattern, "Cell sent"),
                Err(e) if e.is_disconnect() || !service.is_connected() => {
                    error!("{}; re-run to pair again", e);
                    return Err(e.into());
                }
                Err(e) => warn!(%word, "Send failed: {}", e),
            }
        }
    }

    service.disconnect().await;
    Ok(())
}
