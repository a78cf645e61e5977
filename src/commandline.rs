use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Probe all 62 bus addresses and list the modules that respond
    Find,
    /// Assign addresses to any unconfigured boards answering at address 0
    Setup,
    /// Broadcast a reset and renumber every board from scratch
    Renumber,
    /// Clear the latched alert/fault registers on all boards (required after a reset)
    ClearFaults,
    /// Put all boards into sleep mode
    Sleep,
    /// Wake all boards and clear the sleep alert
    Wake,
    /// Show decoded fault and alert status for every module
    Status,
    /// Run one telemetry sweep and print the pack and module readings
    Telemetry,
    /// Run one telemetry sweep and print the outbound summary records
    Reports {
        /// Battery identifier used in the report keys
        #[clap(long, default_value = "0")]
        battery_id: u8,
    },
    /// Periodically sweep telemetry and drive cell balancing
    Monitor {
        /// Interval between sweeps (e.g., "1s", "500ms")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
        /// Cell voltage above which balancing is switched on
        #[clap(long, default_value = "3.9")]
        balance_voltage: f32,
        /// Voltage dip below the balance voltage before balancing stops
        #[clap(long, default_value = "0.04")]
        balance_hysteresis: f32,
        /// Battery identifier used in outbound report keys
        #[clap(long, default_value = "0")]
        battery_id: u8,
        /// Print pack status as JSON instead of plain text
        #[clap(long, action)]
        json: bool,
    },
}

const fn about_text() -> &'static str {
    "daisy-chained battery module coordinator"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations (e.g., "100ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "100ms")]
    pub timeout: Duration,
}
