mod commandline;

use anyhow::{Context, Result};
use chainbms_lib::{
    module::Module,
    pack::{NoFaultLine, Pack, PackConfig},
    protocol::{faulted_cells, AlertCode, FaultCode, CELL_COUNT},
    report,
    serial::SerialBus,
    transport::BusMaster,
};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_pack_status(pack: &Pack) {
    let status = pack.status();
    println!();
    println!("                Pack Status:");
    if status.faulted {
        println!("                  FAULTED!");
    } else {
        println!("              All systems go!");
    }
    println!(
        "Modules: {}    Voltage: {:.3}V   Avg Cell Voltage: {:.3}V   Avg Temp: {:.2}C",
        status.modules, status.pack_voltage, status.average_cell_voltage, status.average_temperature
    );
    for module in pack.existing_modules() {
        println!();
        println!("                Module #{}", module.address());
        println!(
            "  Voltage: {:.3}V ({:.3}V-{:.3}V)   Temperatures: ({:.2}C-{:.2}C)",
            module.module_voltage(),
            module.low_cell_voltage(),
            module.high_cell_voltage(),
            module.low_temperature(),
            module.high_temperature()
        );
        for cell in 0..CELL_COUNT {
            println!(
                "  Cell {}: {:.3}V ({:.3}V-{:.3}V){}",
                cell + 1,
                module.cell_voltage(cell),
                module.lowest_cell_voltage(cell),
                module.highest_cell_voltage(cell),
                if module.is_balancing(cell) {
                    "  balancing"
                } else {
                    ""
                }
            );
        }
        println!(
            "  Packets: {} good / {} bad",
            module.good_packets(),
            module.bad_packets()
        );
    }
}

fn print_module_faults(module: &Module) {
    println!();
    println!("Module #{}", module.address());
    let faults = FaultCode::decode(module.faults());
    let alerts = AlertCode::decode(module.alerts());
    if faults.is_empty() && alerts.is_empty() {
        println!("  No faults or alerts active");
        return;
    }
    for fault in faults {
        match fault {
            FaultCode::CellOvervoltage => println!(
                "  Fault: {} - cells {:?}",
                fault,
                faulted_cells(module.cov_faults())
            ),
            FaultCode::CellUndervoltage => println!(
                "  Fault: {} - cells {:?}",
                fault,
                faulted_cells(module.cuv_faults())
            ),
            _ => println!("  Fault: {}", fault),
        }
    }
    for alert in alerts {
        println!("  Alert: {}", alert);
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let serial = SerialBus::new(&args.device, args.timeout)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    let mut bus = BusMaster::new(serial);
    let mut pack = Pack::new();

    match args.command {
        CliCommands::Find => {
            let found = pack
                .find_boards(&mut bus)
                .with_context(|| "Cannot probe the bus")?;
            println!("Found {} modules:", found);
            for module in pack.existing_modules() {
                println!("  address {}", module.address());
            }
        }
        CliCommands::Setup => {
            // Re-validate first so already addressed boards keep theirs.
            pack.find_boards(&mut bus)
                .with_context(|| "Cannot probe the bus")?;
            let found = pack
                .setup_boards(&mut bus)
                .with_context(|| "Cannot assign addresses")?;
            println!("{} modules addressed", found);
        }
        CliCommands::Renumber => {
            let found = pack
                .renumber_board_ids(&mut bus)
                .with_context(|| "Cannot renumber boards")?;
            println!("{} modules renumbered", found);
        }
        CliCommands::ClearFaults => {
            pack.clear_faults(&mut bus)
                .with_context(|| "Cannot clear faults")?;
            println!("Cleared alert and fault registers on all boards");
        }
        CliCommands::Sleep => {
            pack.sleep_boards(&mut bus)
                .with_context(|| "Cannot sleep boards")?;
            println!("All boards put to sleep");
        }
        CliCommands::Wake => {
            pack.wake_boards(&mut bus)
                .with_context(|| "Cannot wake boards")?;
            println!("All boards woken");
        }
        CliCommands::Status => {
            pack.find_boards(&mut bus)
                .with_context(|| "Cannot probe the bus")?;
            // The hardware fault line is a GPIO on the controller board,
            // out of reach over the serial link, hence NoFaultLine here
            // and below.
            // One sweep so the status registers are current.
            if pack.num_found_modules() > 0 {
                pack.read_all(&mut bus, &mut NoFaultLine)
                    .with_context(|| "Cannot read module status")?;
            }
            for module in pack.existing_modules() {
                print_module_faults(module);
            }
        }
        CliCommands::Telemetry => {
            pack.find_boards(&mut bus)
                .with_context(|| "Cannot probe the bus")?;
            pack.read_all(&mut bus, &mut NoFaultLine)
                .with_context(|| "Cannot read telemetry")?;
            print_pack_status(&pack);
        }
        CliCommands::Reports { battery_id } => {
            pack.set_battery_id(battery_id);
            pack.find_boards(&mut bus)
                .with_context(|| "Cannot probe the bus")?;
            pack.read_all(&mut bus, &mut NoFaultLine)
                .with_context(|| "Cannot read telemetry")?;
            let summary = report::battery_summary(&pack);
            println!("{:08X}: {:02X?}", summary.id, summary.data);
            for module in pack.existing_modules() {
                if let Some(summary) = report::module_summary(&pack, module.address()) {
                    println!("{:08X}: {:02X?}", summary.id, summary.data);
                }
                for cell in 0..CELL_COUNT as u8 {
                    if let Some(detail) = report::cell_detail(&pack, module.address(), cell) {
                        println!("{:08X}: {:02X?}", detail.id, detail.data);
                    }
                }
            }
        }
        CliCommands::Monitor {
            interval,
            balance_voltage,
            balance_hysteresis,
            battery_id,
            json,
        } => {
            let config = PackConfig {
                balance_voltage,
                balance_hysteresis,
                battery_id,
            };
            pack.set_battery_id(battery_id);
            pack.find_boards(&mut bus)
                .with_context(|| "Cannot probe the bus")?;
            info!("Monitoring {} modules", pack.num_found_modules());
            loop {
                pack.read_all(&mut bus, &mut NoFaultLine)
                    .with_context(|| "Cannot read telemetry")?;
                pack.balance_all(&mut bus, &config)
                    .with_context(|| "Cannot drive balancing")?;
                if json {
                    println!("{}", serde_json::to_string(&pack.status())?);
                } else {
                    print_pack_status(&pack);
                }
                std::thread::sleep(interval);
            }
        }
    }

    Ok(())
}
