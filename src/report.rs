//! Outward report encoding.
//!
//! Summary records are keyed by `(battery_id, module, cell)` where `0xFF`
//! in the module or cell position means "all modules" or "summary, not
//! per-cell". The byte layout is consumed verbatim by downstream frame
//! encoders and must stay bit-exact.

use crate::module::Module;
use crate::pack::Pack;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Base of the 29-bit outbound report identifier space.
pub const REPORT_ID_BASE: u32 = 0x1BA0_0000;
/// Wildcard meaning "all modules" in the module position of a key.
pub const ALL_MODULES: u8 = 0xFF;
/// Wildcard meaning "summary, not per-cell" in the cell position.
pub const SUMMARY: u8 = 0xFF;
/// State of charge is not measured in this core; reports always carry
/// this placeholder.
pub const SOC_PLACEHOLDER: u8 = 50;

/// One outward record: identifier plus 8 payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Report {
    pub id: u32,
    pub data: [u8; 8],
}

fn report_id(battery_id: u8, module: u8, cell: u8) -> u32 {
    REPORT_ID_BASE | ((battery_id as u32 & 0xF) << 16) | ((module as u32) << 8) | cell as u32
}

fn centivolts(volts: f32) -> [u8; 2] {
    ((volts * 100.0) as u16).to_le_bytes()
}

/// Temperatures are shifted by +40 and clamped at a floor of 0 so the
/// byte never goes negative.
fn temperature_byte(celsius: f32) -> u8 {
    (celsius as i32 + 40).max(0) as u8
}

/// Whole-pack summary: voltage, placeholder current and SOC, then
/// average/lowest/highest pack temperature.
pub fn battery_summary(pack: &Pack) -> Report {
    let volts = centivolts(pack.pack_voltage());
    Report {
        id: report_id(pack.battery_id(), ALL_MODULES, SUMMARY),
        data: [
            volts[0],
            volts[1],
            0, // instantaneous current, not measured in this core
            0,
            SOC_PLACEHOLDER,
            temperature_byte(pack.average_temperature()),
            temperature_byte(pack.lowest_pack_temperature()),
            temperature_byte(pack.highest_pack_temperature()),
        ],
    }
}

/// Single-module summary in the same layout as the pack summary.
pub fn module_summary(pack: &Pack, address: u8) -> Option<Report> {
    let module = pack.module(address).filter(|m| m.is_existing())?;
    let volts = centivolts(module.module_voltage());
    Some(Report {
        id: report_id(pack.battery_id(), address, SUMMARY),
        data: [
            volts[0],
            volts[1],
            0,
            0,
            SOC_PLACEHOLDER,
            temperature_byte(module.average_temperature()),
            temperature_byte(module.low_temperature()),
            temperature_byte(module.high_temperature()),
        ],
    })
}

/// Per-cell detail: current, historical highest and historical lowest
/// voltage, plus the nearest temperature reading.
pub fn cell_detail(pack: &Pack, address: u8, cell: u8) -> Option<Report> {
    let module = pack.module(address).filter(|m| m.is_existing())?;
    Some(cell_detail_for(pack.battery_id(), module, cell))
}

fn cell_detail_for(battery_id: u8, module: &Module, cell: u8) -> Report {
    let current = centivolts(module.cell_voltage(cell as usize));
    let highest = centivolts(module.highest_cell_voltage(cell as usize));
    let lowest = centivolts(module.lowest_cell_voltage(cell as usize));
    Report {
        id: report_id(battery_id, module.address(), cell),
        data: [
            current[0],
            current[1],
            highest[0],
            highest[1],
            lowest[0],
            lowest[1],
            temperature_byte(module.high_temperature()),
            0, // bit-encoded fault data, no definitions yet
        ],
    }
}

/// Expands an inbound request key into the records to emit.
pub fn dispatch(pack: &Pack, module: u8, cell: u8) -> Vec<Report> {
    if module == ALL_MODULES {
        if cell == SUMMARY {
            return vec![battery_summary(pack)];
        }
        return pack
            .existing_modules()
            .map(|m| cell_detail_for(pack.battery_id(), m, cell))
            .collect();
    }
    if cell == SUMMARY {
        return module_summary(pack, module).into_iter().collect();
    }
    cell_detail(pack, module, cell).into_iter().collect()
}
