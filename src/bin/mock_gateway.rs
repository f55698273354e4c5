/// Mock Modbus gateway
///
/// Serves six simulated units for trying out `modbus-scan` without hardware:
///
/// | unit | behaviour |
/// |------|-----------|
/// | 1 | value 1111 |
/// | 2 | exception 0x02 |
/// | 3 | never answers |
/// | 4 | exception 0x0B |
/// | 5 | value 5555 after 200 ms |
/// | 6 | value 123, first request ignored |

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use voltage_modbus_scan::{Framing, GatewaySimulator};

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated Modbus gateway with six test units")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "5020")]
    port: u16,

    /// Speak RTU frames over TCP instead of MBAP
    #[arg(long)]
    rtu_over_tcp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    let args = Args::parse();

    let framing = if args.rtu_over_tcp { Framing::Rtu } else { Framing::Mbap };
    let mut simulator = GatewaySimulator::mock_gateway(framing);
    let address = format!("{}:{}", args.bind, args.port);
    let local_addr = simulator.start(&address).await.with_context(|| format!("binding {}", address))?;

    info!("Mock gateway ready on {}, press Ctrl-C to stop", local_addr);
    tokio::signal::ctrl_c().await?;

    simulator.stop();
    let stats = simulator.stats();
    info!(
        "Served {} connection(s), {} request(s), {} answered",
        stats.connections, stats.requests, stats.responses
    );
    Ok(())
}
