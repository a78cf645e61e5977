use crate::module::Module;
use crate::protocol::{
    self, ADDR_MARKER, BROADCAST_ADDR, IO_CTRL_SLEEP, MAX_MODULE_ADDR, REG_ADDR_CTRL,
    REG_ALERT_STATUS, REG_DEV_STATUS, REG_FAULT_STATUS, REG_IO_CTRL, REG_RESET, RESET_MAGIC,
    WRITE_REPLY_LEN,
};
use crate::transport::{Bus, BusMaster};
use crate::Error;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Read-only per-cycle configuration, supplied by an external settings
/// store and passed explicitly instead of living in ambient global state.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PackConfig {
    /// Cell voltage above which balancing is switched on.
    pub balance_voltage: f32,
    /// How far the voltage must dip below `balance_voltage` before
    /// balancing is switched off again.
    pub balance_hysteresis: f32,
    /// Namespaces outbound report identifiers.
    pub battery_id: u8,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            balance_voltage: 3.9,
            balance_hysteresis: 0.04,
            battery_id: 0,
        }
    }
}

/// The collective hardware fault line across all modules, active low at
/// the pin. Implementations return `true` when the fault condition is
/// asserted.
pub trait FaultLine {
    fn is_asserted(&mut self) -> bool;
}

/// Stand-in for a wired fault line; never asserts.
#[derive(Debug, Default)]
pub struct NoFaultLine;

impl FaultLine for NoFaultLine {
    fn is_asserted(&mut self) -> bool {
        false
    }
}

/// Roll-up of the whole pack for reporting collaborators.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PackStatus {
    pub modules: usize,
    pub pack_voltage: f32,
    pub lowest_pack_voltage: f32,
    pub highest_pack_voltage: f32,
    pub lowest_pack_temperature: f32,
    pub highest_pack_temperature: f32,
    pub average_cell_voltage: f32,
    pub average_temperature: f32,
    pub faulted: bool,
}

/// Consecutive failed address assignments tolerated before enumeration
/// gives up; keeps a board that echoes but never confirms from wedging
/// the loop forever.
const MAX_ASSIGN_MISSES: usize = 3;

/// The full series string of boards, aggregated into one logical battery.
///
/// Owns one slot per possible bus address; `exists` gates every
/// per-module operation. Slots are allocated once, up front, so there is
/// no ownership ambiguity and no allocation during the polling cycle.
pub struct Pack {
    modules: Vec<Module>,
    num_found: usize,
    pack_voltage: f32,
    lowest_pack_voltage: f32,
    highest_pack_voltage: f32,
    lowest_pack_temperature: f32,
    highest_pack_temperature: f32,
    is_faulted: bool,
    battery_id: u8,
}

impl Default for Pack {
    fn default() -> Self {
        Self::new()
    }
}

impl Pack {
    pub fn new() -> Self {
        Self {
            modules: (0..=MAX_MODULE_ADDR).map(Module::new).collect(),
            num_found: 0,
            pack_voltage: 0.0,
            lowest_pack_voltage: 1000.0,
            highest_pack_voltage: 0.0,
            lowest_pack_temperature: 200.0,
            highest_pack_temperature: -100.0,
            is_faulted: false,
            battery_id: 0,
        }
    }

    pub fn module(&self, address: u8) -> Option<&Module> {
        if address == 0 || address > MAX_MODULE_ADDR {
            return None;
        }
        Some(&self.modules[address as usize])
    }

    /// All modules currently marked as existing, in address order.
    pub fn existing_modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter().filter(|m| m.is_existing())
    }

    /// Probes every address 1..=62 directly to re-validate an already
    /// addressed bus. A reply of more than 4 bytes echoing the request
    /// with a non-zero value byte marks the module as present.
    pub fn find_boards<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<usize, Error> {
        self.num_found = 0;
        for address in 1..=MAX_MODULE_ADDR {
            self.modules[address as usize].set_exists(false);
            let probe = protocol::read_request(address, REG_DEV_STATUS, 1);
            let reply = bus.transact(&probe, 8)?;
            if reply.len() > 4
                && reply[0] == address << 1
                && reply[1] == REG_DEV_STATUS
                && reply[2] == 1
                && reply[3] > 0
            {
                self.modules[address as usize].set_exists(true);
                self.num_found += 1;
                log::debug!("Found module with address {:#04X}", address);
            }
        }
        Ok(self.num_found)
    }

    /// Assigns addresses to unconfigured boards.
    ///
    /// Any board without an address answers reads at address 0, and a
    /// newly addressed board stops forwarding zero-address traffic down
    /// the chain, so each iteration exposes exactly one more board. The
    /// loop terminates when a zero-address probe yields no reply or an
    /// unexpected one.
    ///
    /// Echo contract (verified against hardware, see DESIGN.md): an
    /// unconfigured board echoes the probe with address byte 0x80 and the
    /// assignment write with 0x81 plus the new address with its marker
    /// bit.
    pub fn setup_boards<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<usize, Error> {
        let probe = protocol::read_request(0, REG_DEV_STATUS, 1);
        let mut misses = 0;
        loop {
            let reply = bus.transact(&probe, 8)?;
            if reply.len() < 3 {
                break; // silence: every board has an address
            }
            if reply[0] != ADDR_MARKER || reply[1] != REG_DEV_STATUS || reply[2] != 1 {
                break;
            }
            log::debug!("Unconfigured board answered at address 0");

            // Lowest free address; exactly one assignment per response.
            let Some(address) =
                (1..=MAX_MODULE_ADDR).find(|&a| !self.modules[a as usize].is_existing())
            else {
                break;
            };

            let assign = protocol::write_request(0, REG_ADDR_CTRL, address | ADDR_MARKER);
            let reply = bus.transact(&assign, 8)?;
            if reply.len() > 2
                && reply[0] == (ADDR_MARKER | 1)
                && reply[1] == REG_ADDR_CTRL
                && reply[2] == (address | ADDR_MARKER)
            {
                self.modules[address as usize].set_exists(true);
                self.num_found += 1;
                misses = 0;
                log::debug!("Assigned address {} to new board", address);
            } else {
                misses += 1;
                log::warn!(
                    "Board did not confirm address {} (attempt {}/{})",
                    address,
                    misses,
                    MAX_ASSIGN_MISSES
                );
                if misses >= MAX_ASSIGN_MISSES {
                    break;
                }
            }
        }
        Ok(self.num_found)
    }

    /// Broadcasts a reset so every board forgets its address, then runs
    /// address assignment from scratch. The only way to recover from an
    /// inconsistent address map.
    pub fn renumber_board_ids<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<usize, Error> {
        for module in &mut self.modules {
            module.set_exists(false);
        }
        self.num_found = 0;

        bus.send(&protocol::write_request(BROADCAST_ADDR, REG_RESET, RESET_MAGIC))?;
        std::thread::sleep(Duration::from_millis(200));
        bus.get_reply(8)?;

        self.setup_boards(bus)
    }

    /// Clears the latched alert and fault registers on every board.
    /// Needed after a reset or first power-on, which latch spurious
    /// faults.
    pub fn clear_faults<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<(), Error> {
        for (register, value) in [
            (REG_ALERT_STATUS, 0xFF),
            (REG_ALERT_STATUS, 0x00),
            (REG_FAULT_STATUS, 0xFF),
            (REG_FAULT_STATUS, 0x00),
        ] {
            bus.transact(
                &protocol::write_request(BROADCAST_ADDR, register, value),
                WRITE_REPLY_LEN,
            )?;
        }
        self.is_faulted = false;
        Ok(())
    }

    /// Puts every board on the bus into sleep.
    pub fn sleep_boards<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<(), Error> {
        bus.transact(
            &protocol::write_request(BROADCAST_ADDR, REG_IO_CTRL, IO_CTRL_SLEEP),
            WRITE_REPLY_LEN,
        )?;
        Ok(())
    }

    /// Wakes every board and clears the latched sleep alert bit.
    pub fn wake_boards<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<(), Error> {
        bus.transact(
            &protocol::write_request(BROADCAST_ADDR, REG_IO_CTRL, 0x00),
            WRITE_REPLY_LEN,
        )?;
        // Sleep-mode alert bit, latched while the boards were asleep.
        for value in [0x04, 0x00] {
            bus.transact(
                &protocol::write_request(BROADCAST_ADDR, REG_ALERT_STATUS, value),
                WRITE_REPLY_LEN,
            )?;
        }
        Ok(())
    }

    /// The per-cycle sweep: refresh telemetry on every existing module,
    /// recompute the pack voltage, widen the pack extrema and sample the
    /// fault line.
    ///
    /// One bad module never blocks the rest of the sweep; its errors are
    /// logged and its previous values carried forward. A faulted pack
    /// keeps being polled so operators can see why it is faulted.
    pub fn read_all<B: Bus, F: FaultLine>(
        &mut self,
        bus: &mut BusMaster<B>,
        fault_line: &mut F,
    ) -> Result<(), Error> {
        self.pack_voltage = 0.0;
        for address in 1..=MAX_MODULE_ADDR {
            let module = &mut self.modules[address as usize];
            if !module.is_existing() {
                continue;
            }
            match module.read_values(bus) {
                Ok(true) => {}
                Ok(false) => log::debug!("Module {}: keeping previous telemetry", address),
                // A bus error is handled like a rejected reply: the module's
                // stale-but-valid voltage still counts toward the pack sum,
                // otherwise one flaky cycle dents the lifetime low-water mark.
                Err(err) => {
                    log::warn!("Module {}: bus error during refresh: {}", address, err);
                }
            }
            self.pack_voltage += module.module_voltage();
            // Modules that have never produced a validated reading carry
            // zeroed temperatures; do not let them pollute the extrema.
            if module.good_packets() > 0 {
                self.lowest_pack_temperature =
                    self.lowest_pack_temperature.min(module.low_temperature());
                self.highest_pack_temperature =
                    self.highest_pack_temperature.max(module.high_temperature());
            }
        }

        self.lowest_pack_voltage = self.lowest_pack_voltage.min(self.pack_voltage);
        self.highest_pack_voltage = self.highest_pack_voltage.max(self.pack_voltage);

        let asserted = fault_line.is_asserted();
        if asserted && !self.is_faulted {
            log::error!("One or more modules have entered the fault state");
        }
        if !asserted && self.is_faulted {
            log::info!("All modules have exited the fault state");
        }
        self.is_faulted = asserted;
        Ok(())
    }

    /// Runs the balancing controller over every existing module. Call
    /// after a sweep so decisions use fresh voltages.
    pub fn balance_all<B: Bus>(
        &mut self,
        bus: &mut BusMaster<B>,
        config: &PackConfig,
    ) -> Result<(), Error> {
        for address in 1..=MAX_MODULE_ADDR {
            let module = &mut self.modules[address as usize];
            if !module.is_existing() {
                continue;
            }
            if let Err(err) = module.balance(bus, config) {
                log::warn!("Module {}: bus error during balancing: {}", address, err);
            }
        }
        Ok(())
    }

    pub fn pack_voltage(&self) -> f32 {
        self.pack_voltage
    }

    pub fn lowest_pack_voltage(&self) -> f32 {
        self.lowest_pack_voltage
    }

    pub fn highest_pack_voltage(&self) -> f32 {
        self.highest_pack_voltage
    }

    pub fn lowest_pack_temperature(&self) -> f32 {
        self.lowest_pack_temperature
    }

    pub fn highest_pack_temperature(&self) -> f32 {
        self.highest_pack_temperature
    }

    pub fn is_faulted(&self) -> bool {
        self.is_faulted
    }

    pub fn num_found_modules(&self) -> usize {
        self.num_found
    }

    pub fn battery_id(&self) -> u8 {
        self.battery_id
    }

    pub fn set_battery_id(&mut self, id: u8) {
        self.battery_id = id;
    }

    pub fn average_temperature(&self) -> f32 {
        if self.num_found == 0 {
            return 0.0;
        }
        let sum: f32 = self.existing_modules().map(Module::average_temperature).sum();
        sum / self.num_found as f32
    }

    pub fn average_cell_voltage(&self) -> f32 {
        if self.num_found == 0 {
            return 0.0;
        }
        let sum: f32 = self.existing_modules().map(Module::average_cell_voltage).sum();
        sum / self.num_found as f32
    }

    pub fn status(&self) -> PackStatus {
        PackStatus {
            modules: self.num_found,
            pack_voltage: self.pack_voltage,
            lowest_pack_voltage: self.lowest_pack_voltage,
            highest_pack_voltage: self.highest_pack_voltage,
            lowest_pack_temperature: self.lowest_pack_temperature,
            highest_pack_temperature: self.highest_pack_temperature,
            average_cell_voltage: self.average_cell_voltage(),
            average_temperature: self.average_temperature(),
            faulted: self.is_faulted,
        }
    }

    #[cfg(test)]
    pub(crate) fn module_mut(&mut self, address: u8) -> &mut Module {
        &mut self.modules[address as usize]
    }
}
