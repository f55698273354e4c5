/// Modbus unit discovery CLI
///
/// Scans a range of unit ids on a Modbus TCP gateway or a serial RTU bus and
/// prints which units answered. Trace lines are printed live; Ctrl-C cancels
/// the scan.
///
/// ```text
/// modbus-scan --host 192.168.1.50 --end 32 --timeout 0.5 --concurrency 8
/// modbus-scan --serial /dev/ttyUSB0 --baudrate 19200 --parity E --input
/// modbus-scan --config scan.yaml --json
/// ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use voltage_modbus_scan::config::{DEFAULT_BAUDRATE, DEFAULT_BYTESIZE, DEFAULT_PARITY, DEFAULT_STOPBITS};
use voltage_modbus_scan::utils::format::format_duration;
use voltage_modbus_scan::{RegisterKind, ScanReport, ScanRequest, Scanner, TransportConfig, DEFAULT_TCP_PORT};

/// Discover responding Modbus unit ids
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Scan description file (YAML or JSON); other scan flags are ignored
    #[arg(long)]
    config: Option<PathBuf>,

    /// Modbus TCP gateway host
    #[arg(long, conflicts_with = "serial")]
    host: Option<String>,

    /// Modbus TCP gateway port
    #[arg(long, default_value_t = DEFAULT_TCP_PORT)]
    port: u16,

    /// Tunnel RTU frames over the TCP connection
    #[arg(long)]
    rtu_over_tcp: bool,

    /// Serial port path
    #[arg(long)]
    serial: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baudrate: u32,

    /// N, E or O
    #[arg(long, default_value_t = DEFAULT_PARITY)]
    parity: char,

    #[arg(long, default_value_t = DEFAULT_STOPBITS)]
    stopbits: u8,

    #[arg(long, default_value_t = DEFAULT_BYTESIZE)]
    bytesize: u8,

    /// First unit id
    #[arg(long, default_value = "1")]
    start: u8,

    /// Last unit id
    #[arg(long, default_value = "247")]
    end: u8,

    /// Register address to read
    #[arg(long, default_value = "0")]
    register: u16,

    /// Read input registers (0x04) instead of holding registers (0x03)
    #[arg(long)]
    input: bool,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value = "3.0")]
    timeout: f64,

    /// Extra attempts per unit
    #[arg(long, default_value = "1")]
    retries: u32,

    /// Units probed in parallel (TCP only)
    #[arg(long, default_value = "1")]
    concurrency: usize,

    /// Abort the whole scan after this many seconds
    #[arg(long)]
    deadline: Option<f64>,

    /// Print the report as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn scan_request(&self) -> Result<ScanRequest> {
        if let Some(path) = &self.config {
            return ScanRequest::from_file(path).with_context(|| format!("loading {}", path.display()));
        }

        let transport = match (&self.host, &self.serial) {
            (Some(host), None) => TransportConfig::Tcp {
                host: host.clone(),
                port: self.port,
                rtu_over_tcp: self.rtu_over_tcp,
            },
            (None, Some(port)) => TransportConfig::Serial {
                port: port.clone(),
                baudrate: self.baudrate,
                parity: self.parity.to_ascii_uppercase(),
                stopbits: self.stopbits,
                bytesize: self.bytesize,
            },
            _ => bail!("exactly one of --host or --serial is required"),
        };

        let timeout = Duration::try_from_secs_f64(self.timeout).context("invalid --timeout")?;
        let kind = if self.input { RegisterKind::Input } else { RegisterKind::Holding };
        let mut request = ScanRequest::with_transport(transport)
            .with_units(self.start, self.end)
            .with_register(self.register, kind)
            .with_timeout(timeout)
            .with_retries(self.retries)
            .with_concurrency(self.concurrency);
        if let Some(deadline) = self.deadline {
            request = request.with_scan_deadline(Duration::try_from_secs_f64(deadline).context("invalid --deadline")?);
        }
        Ok(request)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();
}

fn print_summary(report: &ScanReport) {
    println!();
    println!(
        "Scanned units {}-{} in {} ({})",
        report.scanned_range.start(),
        report.scanned_range.end(),
        format_duration(report.duration),
        report.strategy.name()
    );
    if report.found_devices.is_empty() {
        println!("No devices found");
        return;
    }
    println!("{:>5}  {:>8}  {:>8}  {}", "Unit", "Value", "Hex", "Note");
    for device in &report.found_devices {
        println!(
            "{:>5}  {:>8}  {:>8}  {}",
            device.unit_id,
            device.value.map(|value| value.to_string()).unwrap_or_else(|| "-".into()),
            device.hex.as_deref().unwrap_or("-"),
            device.error.as_deref().unwrap_or("")
        );
    }
    println!("{} device(s) found", report.count);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let request = args.scan_request()?;
    let cancel = CancellationToken::new();
    let (trace_tx, mut trace_rx) = mpsc::unbounded_channel::<String>();
    let scanner = Scanner::new(request)?
        .with_trace_channel(trace_tx)
        .with_cancellation(cancel.clone());

    let live = !args.json;
    let printer = tokio::spawn(async move {
        while let Some(line) = trace_rx.recv().await {
            if live {
                println!("{}", line);
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling scan...");
            cancel.cancel();
        }
    });

    let result = scanner.scan().await;
    drop(scanner);
    let _ = printer.await;
    let report = result.context("scan failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}
