#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> footbridge::Result<()> {
    use clap::Parser;
    use footbridge::{
        config::FootpodArgs, logging, shutdown, BluezFootpod, SensorEmulator, TracingSink, VERSION,
    };
    use tracing::{error, info};

    logging::init_tracing();
    let config = FootpodArgs::parse().into_config()?;

    info!("🏃 Footbridge foot-pod {}", VERSION);
    info!(
        "Reporting {:.1} km/h at {} spm every {}ms",
        config.footpod.pace_kmh, config.footpod.cadence_spm, config.tick_ms
    );

    let transport = BluezFootpod::new(&config.local_name).await?;
    let mut emulator = SensorEmulator::new(transport, TracingSink, &config)?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Stopping foot-pod");
        trigger.trigger();
    });

    if let Err(e) = emulator.run(shutdown).await {
        error!("❌ Foot-pod stopped: {}", e);
        return Err(e);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("footpod serves GATT through BlueZ and only runs on Linux");
    std::process::exit(1);
}
