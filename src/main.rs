use aa_headunit_rs::config::{EngineConfig, TransportConfig};
use aa_headunit_rs::engine::Engine;
use aa_headunit_rs::event::{EngineEvent, EventSink};
use aa_headunit_rs::transport::{Transport, UsbTransport};

use clap::Parser;
use nusb::MaybeFuture;
use simplelog::*;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

const NAME: &str = "<i><bright-black> main: </>";

/// AndroidAuto head-unit protocol engine
#[derive(Parser, Debug)]
#[clap(version, long_about = None, about = "aa-headunit-rs")]
struct Args {
    /// Config file path
    #[clap(short, long, value_parser, default_value = "/etc/aa-headunit-rs/config.toml")]
    config: PathBuf,
}

fn logging_init(debug: bool, log_path: &PathBuf) {
    let conf = ConfigBuilder::new()
        .set_time_format("%F, %H:%M:%S%.3f".to_string())
        .set_write_log_enable_colors(true)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![];

    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };

    loggers.push(TermLogger::new(level, conf.clone(), TerminalMode::Mixed, ColorChoice::Auto));

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(logfile) => loggers.push(WriteLogger::new(level, conf, logfile)),
        Err(e) => eprintln!("{} could not open log file {}: {}", NAME, log_path.display(), e),
    }

    CombinedLogger::init(loggers).expect("cannot initialize logging subsystem");
}

/// Opens a transport per `config.transport` (spec.md §6). The USB variant's
/// `fd` is reserved for future descriptor-passing; the pinned `nusb` rev has
/// no raw-fd constructor, so this picks the first device already switched to
/// USB accessory mode (accessory-mode switching itself is out of scope).
fn open_transport(config: &EngineConfig) -> Result<Box<dyn Transport>, anyhow::Error> {
    match &config.transport {
        TransportConfig::Usb { fd } => {
            debug!("{} usb transport requested (fd hint {}), enumerating devices", NAME, fd);
            let info = nusb::list_devices()
                .wait()?
                .find(|d| d.in_accessory_mode())
                .ok_or_else(|| anyhow::anyhow!("no USB device in accessory mode found"))?;
            let device = info.open().wait()?;
            let configuration = device.active_configuration()?;
            let iface = device.detach_and_claim_interface(0).wait()?;
            let endpoints = configuration.find_endpoints()?;
            let transport = UsbTransport::open(&iface, endpoints.endpoint_in().address, endpoints.endpoint_out().address)?;
            Ok(Box::new(transport))
        }
        TransportConfig::Socket { host, port } => {
            info!("{} connecting to {}:{}", NAME, host, port);
            let transport = aa_headunit_rs::transport::SocketTransport::connect(host, *port)?;
            Ok(Box::new(transport))
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let config = EngineConfig::load(&args.config)?;
    logging_init(config.debug, &config.log_path);

    info!("{} aa-headunit-rs starting, config: {}", NAME, args.config.display());
    debug!("{} startup configuration: {:#?}", NAME, config);

    let (tx, rx) = mpsc::channel();
    let events = EventSink::new(tx);

    let transport = open_transport(&config)?;
    let engine = Engine::start(&config, transport, events)?;

    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(EngineEvent::Connected) => info!("{} session connected", NAME),
            Ok(EngineEvent::Disconnected { reason }) => {
                warn!("{} session disconnected: {}", NAME, reason);
                break;
            }
            Ok(EngineEvent::Stats(stats)) => debug!("{} drop stats: {:?}", NAME, stats),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    engine.stop();
    info!("{} aa-headunit-rs terminated", NAME);
    Ok(())
}
