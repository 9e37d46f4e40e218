use clap::Parser;
use icom_wlan_rs::{Controller, RadioConfig, RadioEvent};
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = RadioConfig::parse();
    info!(host = %config.host, port = config.port, "icom-wlan-rs starting");

    let controller = Controller::new(config).await.map_err(std::io::Error::other)?;
    let mut events = controller.events();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RadioEvent::Login { ok, error_code, connection_string }) => {
                    info!(ok, error_code, connection_string, "login");
                }
                Ok(RadioEvent::Status { civ_port, audio_port, auth_ok, connected }) => {
                    info!(civ_port, audio_port, auth_ok, connected, "status");
                }
                Ok(RadioEvent::Capabilities { civ_address, audio_name, support_tx }) => {
                    info!(civ_address, audio_name, support_tx, "capabilities");
                }
                Ok(RadioEvent::CivFrame { frame }) => {
                    info!(len = frame.len(), "civ frame");
                }
                Ok(RadioEvent::PhaseChanged { from, to }) => {
                    info!(%from, %to, "phase changed");
                }
                Ok(RadioEvent::ConnectionLost { session, elapsed_ms }) => {
                    info!(?session, elapsed_ms, "connection lost");
                }
                Ok(RadioEvent::ConnectionRestored { downtime_ms }) => {
                    info!(downtime_ms, "connection restored");
                }
                Ok(RadioEvent::ReconnectAttempting { attempt, delay_ms }) => {
                    info!(attempt, delay_ms, "reconnecting");
                }
                Ok(RadioEvent::ReconnectFailed { attempt, error, will_retry, next_delay_ms }) => {
                    info!(attempt, error, will_retry, ?next_delay_ms, "reconnect failed");
                }
                Ok(RadioEvent::Error { message }) => {
                    info!(message, "error event");
                }
                Ok(RadioEvent::Civ { .. }) | Ok(RadioEvent::Audio { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    controller.connect().await.map_err(std::io::Error::other)?;
    info!("connected — press ctrl-c to disconnect");

    tokio::signal::ctrl_c().await?;
    controller.disconnect(None, false).await;
    Ok(())
}
