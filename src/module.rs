use crate::pack::PackConfig;
use crate::protocol::{
    self, StatusRegisters, Telemetry, ADC_CTRL_ALL_CHANNELS, BALANCE_TIME, CELL_COUNT,
    IO_CTRL_TEMP_SENSE, REG_ADC_CONV, REG_ADC_CTRL, REG_BAL_CTRL, REG_BAL_TIME, REG_IO_CTRL,
    TEMP_COUNT, WRITE_REPLY_LEN,
};
use crate::transport::{Bus, BusMaster};
use crate::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One board on the chain: six cells, two thermistors, one bus address.
///
/// Telemetry fields are meaningful only while `exists` is true; accessors
/// fail soft and return a zero sentinel for out-of-range indices rather
/// than panicking.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Module {
    address: u8,
    exists: bool,
    cell_voltage: [f32; CELL_COUNT],
    lowest_cell_voltage: [f32; CELL_COUNT],
    highest_cell_voltage: [f32; CELL_COUNT],
    module_voltage: f32,
    lowest_module_voltage: f32,
    highest_module_voltage: f32,
    temperature: [f32; TEMP_COUNT],
    balance_state: [bool; CELL_COUNT],
    status: StatusRegisters,
    good_packets: u32,
    bad_packets: u32,
}

impl Module {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            exists: false,
            cell_voltage: [0.0; CELL_COUNT],
            lowest_cell_voltage: [10.0; CELL_COUNT],
            highest_cell_voltage: [0.0; CELL_COUNT],
            module_voltage: 0.0,
            lowest_module_voltage: 1000.0,
            highest_module_voltage: 0.0,
            temperature: [0.0; TEMP_COUNT],
            balance_state: [false; CELL_COUNT],
            status: StatusRegisters::default(),
            good_packets: 0,
            bad_packets: 0,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_existing(&self) -> bool {
        self.exists
    }

    pub fn set_exists(&mut self, exists: bool) {
        self.exists = exists;
    }

    /// Refreshes the alert/fault/COV/CUV registers.
    ///
    /// A reply that fails validation leaves the previous snapshot in place.
    pub fn read_status<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<(), Error> {
        let reply = bus.send_with_reply(
            &StatusRegisters::request(self.address),
            StatusRegisters::reply_size(),
        )?;
        match StatusRegisters::decode(self.address, &reply) {
            Ok(status) => self.status = status,
            Err(err) => log::debug!("Module {}: status reply rejected: {}", self.address, err),
        }
        Ok(())
    }

    /// Runs the full per-cycle register sequence: refresh status, arm the
    /// ADC for all channels, enable the thermistor bias pins, trigger a
    /// conversion, then read back the 18 data bytes.
    ///
    /// Returns `Ok(true)` when a validated reading was decoded. A rejected
    /// reply keeps the prior telemetry (stale-but-valid beats corrupt) and
    /// bumps the bad-packet counter.
    pub fn read_values<B: Bus>(&mut self, bus: &mut BusMaster<B>) -> Result<bool, Error> {
        self.read_status(bus)?;

        let addr = self.address;
        bus.send_with_reply(
            &protocol::write_request(addr, REG_ADC_CTRL, ADC_CTRL_ALL_CHANNELS),
            WRITE_REPLY_LEN,
        )?;
        bus.send_with_reply(
            &protocol::write_request(addr, REG_IO_CTRL, IO_CTRL_TEMP_SENSE),
            WRITE_REPLY_LEN,
        )?;
        bus.send_with_reply(
            &protocol::write_request(addr, REG_ADC_CONV, 1),
            WRITE_REPLY_LEN,
        )?;

        let reply = bus.send_with_reply(&Telemetry::request(addr), Telemetry::reply_size())?;
        match Telemetry::decode(addr, &reply) {
            Ok(telemetry) => {
                self.apply_reading(&telemetry);
                self.good_packets += 1;
                log::debug!("Module {}: got voltage and temperature readings", addr);
                Ok(true)
            }
            Err(err) => {
                self.bad_packets += 1;
                log::debug!("Module {}: telemetry reply rejected: {}", addr, err);
                Ok(false)
            }
        }
    }

    /// Stores a validated reading and widens the running extrema.
    pub(crate) fn apply_reading(&mut self, telemetry: &Telemetry) {
        self.module_voltage = telemetry.module_voltage;
        self.lowest_module_voltage = self.lowest_module_voltage.min(telemetry.module_voltage);
        self.highest_module_voltage = self.highest_module_voltage.max(telemetry.module_voltage);
        for i in 0..CELL_COUNT {
            self.cell_voltage[i] = telemetry.cell_voltage[i];
            self.lowest_cell_voltage[i] = self.lowest_cell_voltage[i].min(self.cell_voltage[i]);
            self.highest_cell_voltage[i] = self.highest_cell_voltage[i].max(self.cell_voltage[i]);
        }
        self.temperature = telemetry.temperature;
    }

    /// Per-cell hysteresis decision and register write.
    ///
    /// A cell starts balancing above `balance_voltage` and stops once it
    /// drops below `balance_voltage - balance_hysteresis`; inside the band
    /// its state is left alone to prevent chatter. A non-zero mask first
    /// clears the balance control register to reset the board's balance
    /// timer, then re-arms the timer and writes the mask. An all-zero mask
    /// sends nothing this cycle.
    pub fn balance<B: Bus>(
        &mut self,
        bus: &mut BusMaster<B>,
        config: &PackConfig,
    ) -> Result<(), Error> {
        let mut mask: u8 = 0;
        for i in 0..CELL_COUNT {
            if !self.balance_state[i] && self.cell_voltage[i] > config.balance_voltage {
                self.balance_state[i] = true;
            }
            if self.cell_voltage[i] < config.balance_voltage - config.balance_hysteresis {
                self.balance_state[i] = false;
            }
            if self.balance_state[i] {
                mask |= 1 << i;
            }
        }

        if mask == 0 {
            return Ok(());
        }

        let addr = self.address;
        bus.send_with_reply(&protocol::write_request(addr, REG_BAL_CTRL, 0), WRITE_REPLY_LEN)?;
        bus.send_with_reply(
            &protocol::write_request(addr, REG_BAL_TIME, BALANCE_TIME),
            WRITE_REPLY_LEN,
        )?;
        bus.send_with_reply(
            &protocol::write_request(addr, REG_BAL_CTRL, mask),
            WRITE_REPLY_LEN,
        )?;

        if log::log_enabled!(log::Level::Debug) {
            self.verify_balance_registers(bus, mask)?;
        }
        Ok(())
    }

    /// Reads both balance registers back after a settle delay. Mismatches
    /// are logged, not retried; the next cycle re-arms anyway.
    fn verify_balance_registers<B: Bus>(
        &self,
        bus: &mut BusMaster<B>,
        mask: u8,
    ) -> Result<(), Error> {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let addr = self.address;

        let reply = bus.transact(&protocol::read_request(addr, REG_BAL_TIME, 1), 5)?;
        if reply.len() < 4 || reply[3] != BALANCE_TIME {
            log::warn!("Module {}: balance timer readback mismatch: {:02X?}", addr, reply);
        }
        let reply = bus.transact(&protocol::read_request(addr, REG_BAL_CTRL, 1), 5)?;
        if reply.len() < 4 || reply[3] != mask {
            log::warn!("Module {}: balance control readback mismatch: {:02X?}", addr, reply);
        }
        Ok(())
    }

    pub fn module_voltage(&self) -> f32 {
        self.module_voltage
    }

    pub fn lowest_module_voltage(&self) -> f32 {
        self.lowest_module_voltage
    }

    pub fn highest_module_voltage(&self) -> f32 {
        self.highest_module_voltage
    }

    pub fn cell_voltage(&self, cell: usize) -> f32 {
        if cell >= CELL_COUNT {
            return 0.0;
        }
        self.cell_voltage[cell]
    }

    pub fn lowest_cell_voltage(&self, cell: usize) -> f32 {
        if cell >= CELL_COUNT {
            return 0.0;
        }
        self.lowest_cell_voltage[cell]
    }

    pub fn highest_cell_voltage(&self, cell: usize) -> f32 {
        if cell >= CELL_COUNT {
            return 0.0;
        }
        self.highest_cell_voltage[cell]
    }

    pub fn low_cell_voltage(&self) -> f32 {
        self.cell_voltage.iter().copied().fold(10.0, f32::min)
    }

    pub fn high_cell_voltage(&self) -> f32 {
        self.cell_voltage.iter().copied().fold(0.0, f32::max)
    }

    pub fn average_cell_voltage(&self) -> f32 {
        self.cell_voltage.iter().sum::<f32>() / CELL_COUNT as f32
    }

    pub fn temperature(&self, sensor: usize) -> f32 {
        if sensor >= TEMP_COUNT {
            return 0.0;
        }
        self.temperature[sensor]
    }

    pub fn low_temperature(&self) -> f32 {
        self.temperature[0].min(self.temperature[1])
    }

    pub fn high_temperature(&self) -> f32 {
        self.temperature[0].max(self.temperature[1])
    }

    pub fn average_temperature(&self) -> f32 {
        (self.temperature[0] + self.temperature[1]) / 2.0
    }

    pub fn is_balancing(&self, cell: usize) -> bool {
        if cell >= CELL_COUNT {
            return false;
        }
        self.balance_state[cell]
    }

    pub fn alerts(&self) -> u8 {
        self.status.alerts
    }

    pub fn faults(&self) -> u8 {
        self.status.faults
    }

    pub fn cov_faults(&self) -> u8 {
        self.status.cov_faults
    }

    pub fn cuv_faults(&self) -> u8 {
        self.status.cuv_faults
    }

    pub fn good_packets(&self) -> u32 {
        self.good_packets
    }

    pub fn bad_packets(&self) -> u32 {
        self.bad_packets
    }
}
