use clap::Parser;
use footbridge::{
    config::ReaderArgs, logging, shutdown, BtleplugTransport, Result, TracingSink,
    TreadmillReader, VERSION,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let (filter, config) = ReaderArgs::parse().into_config()?;

    info!("🏃 Footbridge treadmill reader {}", VERSION);
    if !filter.addresses.is_empty() || !filter.names.is_empty() {
        info!(
            "Restricting to addresses {:?} and names {:?}",
            filter.addresses, filter.names
        );
    }

    let transport = BtleplugTransport::new().await?;
    let mut reader = TreadmillReader::new(transport, TracingSink, filter, config)?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Stopping treadmill reader");
        trigger.trigger();
    });

    if let Err(e) = reader.run(shutdown).await {
        error!("❌ Treadmill reader stopped: {}", e);
        return Err(e);
    }
    Ok(())
}
