use rtc_loopback::media::{LogDisplay, SyntheticCapture};
use rtc_loopback::transport::{MemoryTransport, TransportProvider, WebRtcTransport};
use rtc_loopback::{logger, LoopbackConfig, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> rtc_loopback::Result<()> {
    let config = LoopbackConfig::from_env()?;
    logger::init(&config.logging);

    // `--memory` runs the call without sockets
    let transport: Arc<dyn TransportProvider> = if std::env::args().any(|a| a == "--memory") {
        info!("Using in-memory transport");
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(WebRtcTransport::new())
    };

    let orchestrator = Orchestrator::new(
        config,
        transport,
        Arc::new(SyntheticCapture::new()),
        Arc::new(LogDisplay::new()),
    );
    orchestrator.on_message(|msg| {
        info!(endpoint = %msg.endpoint, label = %msg.label, "Received: {}", msg.data);
    });

    orchestrator.start().await?;
    if let Err(e) = orchestrator.wait_connected(CONNECT_TIMEOUT).await {
        error!("Call did not connect: {}", e);
        orchestrator.hangup().await;
        return Err(e);
    }

    let mut controls = orchestrator.controls();
    let ready = tokio::time::timeout(CONNECT_TIMEOUT, controls.wait_for(|c| c.send)).await;
    if matches!(ready, Ok(Ok(_))) {
        orchestrator.send("hello from the local endpoint").await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    } else {
        error!("Send channel never opened");
    }

    orchestrator.hangup().await;
    Ok(())
}
