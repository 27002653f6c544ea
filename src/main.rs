use std::error::Error;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use kvcan::{
    interfaces, load_canlib, BusSession, BusStatus, CanFrame, CanlibDriver,
    ConfigurationParameter, SessionEvent,
};

fn supported_bit_rate(s: &str) -> Result<u32, String> {
    let rate = s.parse::<u32>().map_err(|_| "Invalid number")?;
    if kvcan::session::config::bit_rate_code(rate).is_some() {
        Ok(rate)
    } else {
        Err(format!("unsupported bit rate {rate}"))
    }
}

fn supported_data_bit_rate(s: &str) -> Result<u32, String> {
    let rate = s.parse::<u32>().map_err(|_| "Invalid number")?;
    if kvcan::session::config::data_bit_rate_code(rate).is_some() {
        Ok(rate)
    } else {
        Err(format!("unsupported data bit rate {rate}"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "kvcan", about, long_about = None)]
struct Cli {
    /// Path to the CANlib shared library; defaults to KVASER_CANLIB_PATH or
    /// the platform library name.
    #[arg(long, global = true)]
    library: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every channel the driver reports
    List,
    /// Print received frames until interrupted
    Dump {
        name: String,
        #[command(flatten)]
        bus: BusArgs,
    },
    /// Send one frame, e.g. `123#DEADBEEF`, `1F334455#R` or `123##1AABB`
    Send {
        name: String,
        frame: CanFrame,
        #[command(flatten)]
        bus: BusArgs,
    },
    /// Print the controller state
    Status {
        name: String,
        #[command(flatten)]
        bus: BusArgs,
    },
}

#[derive(Args, Debug)]
struct BusArgs {
    #[arg(short, long, default_value_t = 500_000, value_parser = supported_bit_rate)]
    bitrate: u32,

    #[arg(short, long, value_parser = supported_data_bit_rate)]
    data_bitrate: Option<u32>,

    #[arg(long, default_value_t = false)]
    fd: bool,

    #[arg(long, default_value_t = false)]
    loopback: bool,

    #[arg(long, default_value_t = false)]
    receive_own: bool,
}

impl BusArgs {
    fn parameters(&self) -> Vec<ConfigurationParameter> {
        let mut parameters = vec![
            ConfigurationParameter::BitRate(self.bitrate),
            ConfigurationParameter::CanFd(self.fd || self.data_bitrate.is_some()),
        ];
        parameters.extend(self.data_bitrate.map(ConfigurationParameter::DataBitRate));
        if self.loopback {
            parameters.push(ConfigurationParameter::Loopback(true));
        }
        if self.receive_own {
            parameters.push(ConfigurationParameter::ReceiveOwn(true));
        }
        parameters
    }
}

fn open(
    driver: CanlibDriver,
    name: &str,
    bus: &BusArgs,
) -> Result<BusSession<CanlibDriver>, Box<dyn Error>> {
    let mut builder = BusSession::builder(driver, name);
    for parameter in bus.parameters() {
        builder = builder.with_parameter(parameter);
    }
    let mut session = builder.build()?;
    session.open()?;
    if !session.has_init_access() {
        log::warn!("{} is opened without init access, bus settings were not applied", name);
    }
    Ok(session)
}

async fn dump(mut session: BusSession<CanlibDriver>) {
    let mut events = session.subscribe();
    loop {
        tokio::select! {
            frame = session.recv() => match frame {
                Some(frame) => {
                    let echo = if frame.is_local_echo() { "  TX" } else { "" };
                    println!(
                        "{} ({:>12}us)  {}  {}{}",
                        Local::now().format("%H:%M:%S%.3f"),
                        frame.timestamp().as_micros(),
                        session.name(),
                        frame,
                        echo
                    );
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::ErrorOccurred(e) => eprintln!("{}: {}", session.name(), e),
                SessionEvent::BusOff => eprintln!("{}: bus off", session.name()),
                SessionEvent::DeviceRemoved => return,
                _ => {}
            }
        }
    }
}

fn print_status(status: BusStatus) {
    let text = match status {
        BusStatus::Unknown => "unknown",
        BusStatus::Good => "error active",
        BusStatus::Warning => "error warning",
        BusStatus::Error => "error passive",
        BusStatus::BusOff => "bus off",
    };
    println!("{text}");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let driver = load_canlib(cli.library.as_deref())?;

    match cli.command {
        Command::List => {
            for info in interfaces(&driver) {
                let mut flags = Vec::new();
                if info.is_virtual {
                    flags.push("virtual");
                }
                if info.is_fd_capable {
                    flags.push("fd");
                }
                println!(
                    "{:<6} {:<28} {:<32} {} [{}]",
                    info.name,
                    info.identity,
                    info.description,
                    info.alias,
                    flags.join(",")
                );
            }
        }
        Command::Dump { name, bus } => {
            let session = open(driver, &name, &bus)?;
            dump(session).await;
        }
        Command::Send { name, frame, bus } => {
            let mut session = open(driver, &name, &bus)?;
            session.write_frame(&frame)?;
            log::info!("sent {}", frame);
        }
        Command::Status { name, bus } => {
            let mut session = open(driver, &name, &bus)?;
            print_status(session.bus_status());
        }
    }
    Ok(())
}
