use crate::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// Register map of the cell supervisor ASIC on each board.
pub const REG_DEV_STATUS: u8 = 0x00;
pub const REG_GPAI: u8 = 0x01;
pub const REG_VCELL1: u8 = 0x03;
pub const REG_VCELL2: u8 = 0x05;
pub const REG_VCELL3: u8 = 0x07;
pub const REG_VCELL4: u8 = 0x09;
pub const REG_VCELL5: u8 = 0x0B;
pub const REG_VCELL6: u8 = 0x0D;
pub const REG_TEMPERATURE1: u8 = 0x0F;
pub const REG_TEMPERATURE2: u8 = 0x11;
pub const REG_ALERT_STATUS: u8 = 0x20;
pub const REG_FAULT_STATUS: u8 = 0x21;
pub const REG_COV_FAULT: u8 = 0x22;
pub const REG_CUV_FAULT: u8 = 0x23;
pub const REG_ADC_CTRL: u8 = 0x30;
pub const REG_IO_CTRL: u8 = 0x31;
pub const REG_BAL_CTRL: u8 = 0x32;
pub const REG_BAL_TIME: u8 = 0x33;
pub const REG_ADC_CONV: u8 = 0x34;
pub const REG_ADDR_CTRL: u8 = 0x3B;
pub const REG_RESET: u8 = 0x3C;

/// Highest assignable bus address.
pub const MAX_MODULE_ADDR: u8 = 0x3E;
/// All boards listen on this address regardless of their own.
pub const BROADCAST_ADDR: u8 = 0x3F;
/// Magic byte that triggers a board reset when written to `REG_RESET`.
pub const RESET_MAGIC: u8 = 0xA5;
/// Marker bit a board sets when echoing a freshly assigned address.
pub const ADDR_MARKER: u8 = 0x80;

/// ADC auto mode, convert both temperatures, module voltage and all 6 cells.
pub const ADC_CTRL_ALL_CHANNELS: u8 = 0b0011_1101;
/// Enable the thermistor bias pins.
pub const IO_CTRL_TEMP_SENSE: u8 = 0b0000_0011;
/// Sleep bit in the I/O control register.
pub const IO_CTRL_SLEEP: u8 = 0b0000_0100;
/// Balance timer value: balancing stops on its own after 5 seconds unless
/// re-armed by the next cycle.
pub const BALANCE_TIME: u8 = 0x05;

/// Number of cells supervised by one board.
pub const CELL_COUNT: usize = 6;
/// Thermistor channels per board.
pub const TEMP_COUNT: usize = 2;

/// A board echoes a write frame verbatim: 3 frame bytes plus the CRC.
pub const WRITE_REPLY_LEN: usize = 4;

fn raw16(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

/// Bit-serial CRC-8, polynomial 0x07, initial value 0, MSB first.
///
/// Appended to every outgoing write frame and to telemetry replies. For
/// write frames it is computed with the write bit already set in the
/// address byte.
pub fn crc8(input: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for b in input {
        crc ^= b;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Builds a 3-byte read request: address, start register, byte count.
pub fn read_request(address: u8, register: u8, count: u8) -> Vec<u8> {
    vec![address << 1, register, count]
}

/// Builds a write request with the write bit set and the trailing CRC.
pub fn write_request(address: u8, register: u8, value: u8) -> Vec<u8> {
    let mut frame = vec![(address << 1) | 1, register, value];
    frame.push(crc8(&frame));
    frame
}

fn validate_len(reply: &[u8], expected: usize) -> Result<(), Error> {
    if reply.len() != expected {
        log::warn!(
            "Invalid reply size - expected={} received={}",
            expected,
            reply.len()
        );
        return Err(Error::ReplyLength {
            expected,
            received: reply.len(),
        });
    }
    Ok(())
}

fn validate_crc(reply: &[u8]) -> Result<(), Error> {
    let calculated = crc8(&reply[..reply.len() - 1]);
    let received = reply[reply.len() - 1];
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:02X?} received={:02X?} reply={:02X?}",
            calculated,
            received,
            reply
        );
        return Err(Error::Checksum {
            calculated,
            received,
        });
    }
    Ok(())
}

fn validate_echo(reply: &[u8], address: u8, register: u8, length: u8) -> Result<(), Error> {
    if reply[0] != address << 1 || reply[1] != register || reply[2] != length {
        log::warn!(
            "Reply does not echo request - expected=[{:02X}, {:02X}, {:02X}] received={:02X?}",
            address << 1,
            register,
            length,
            &reply[..3]
        );
        return Err(Error::EchoMismatch);
    }
    Ok(())
}

/// One full telemetry reading: module voltage, six cell voltages and two
/// thermistor temperatures, already converted to physical units.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Telemetry {
    pub module_voltage: f32,
    pub cell_voltage: [f32; CELL_COUNT],
    pub temperature: [f32; TEMP_COUNT],
}

impl Telemetry {
    /// 18 data bytes requested starting at `REG_GPAI`.
    pub const DATA_LEN: u8 = 0x12;

    pub fn request(address: u8) -> Vec<u8> {
        read_request(address, REG_GPAI, Self::DATA_LEN)
    }

    /// Echoed address/register/length, 18 data bytes, trailing CRC.
    pub fn reply_size() -> usize {
        3 + Self::DATA_LEN as usize + 1
    }

    /// Validates and decodes a telemetry reply.
    ///
    /// Length, CRC and echo are all checked; any mismatch discards the
    /// entire reading so a stale-but-valid value is never replaced by a
    /// corrupt one.
    pub fn decode(address: u8, reply: &[u8]) -> Result<Self, Error> {
        validate_len(reply, Self::reply_size())?;
        validate_crc(reply)?;
        validate_echo(reply, address, REG_GPAI, Self::DATA_LEN)?;

        let mut cell_voltage = [0.0f32; CELL_COUNT];
        for (i, volt) in cell_voltage.iter_mut().enumerate() {
            *volt = raw16(reply[5 + i * 2], reply[6 + i * 2]) as f32 * 0.000_381_493;
        }
        Ok(Self {
            module_voltage: raw16(reply[3], reply[4]) as f32 * 0.002_034_609,
            cell_voltage,
            temperature: [
                thermistor(raw16(reply[17], reply[18]), 2.0, 33046.0),
                thermistor(raw16(reply[19], reply[20]), 9.0, 33068.0),
            ],
        })
    }
}

/// Converts a raw thermistor reading to degrees Celsius.
///
/// The raw value is first mapped to a resistance-proportional intermediate,
/// then run through the Steinhart-Hart cubic approximation. The two
/// channels carry slightly different calibration fits, hence the
/// per-channel offset and divisor.
fn thermistor(raw: u16, offset: f32, divisor: f32) -> f32 {
    let resistance = (1.78 / ((raw as f32 + offset) / divisor) - 3.57) * 1000.0;
    let ln_r = resistance.ln();
    let inv_t = 7.610_373_573e-4 + 2.728_524_832e-4 * ln_r + 1.022_822_735e-7 * ln_r.powi(3);
    1.0 / inv_t - 273.15
}

/// Raw status register snapshot: alert and fault bitfields plus the
/// per-cell over/undervoltage fault bits.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatusRegisters {
    pub alerts: u8,
    pub faults: u8,
    pub cov_faults: u8,
    pub cuv_faults: u8,
}

impl StatusRegisters {
    /// Alert status, fault status, COV fault and CUV fault registers.
    pub const DATA_LEN: u8 = 0x04;

    pub fn request(address: u8) -> Vec<u8> {
        read_request(address, REG_ALERT_STATUS, Self::DATA_LEN)
    }

    pub fn reply_size() -> usize {
        3 + Self::DATA_LEN as usize + 1
    }

    pub fn decode(address: u8, reply: &[u8]) -> Result<Self, Error> {
        validate_len(reply, Self::reply_size())?;
        validate_crc(reply)?;
        validate_echo(reply, address, REG_ALERT_STATUS, Self::DATA_LEN)?;
        Ok(Self {
            alerts: reply[3],
            faults: reply[4],
            cov_faults: reply[5],
            cuv_faults: reply[6],
        })
    }
}

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Lists the 1-based cell numbers flagged in a COV/CUV fault bitfield.
pub fn faulted_cells(mask: u8) -> Vec<u8> {
    (0..CELL_COUNT as u8)
        .filter(|cell| read_bit!(mask, cell))
        .map(|cell| cell + 1)
        .collect()
}

/// Decoded fault-status register bits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FaultCode {
    CellOvervoltage,
    CellUndervoltage,
    CrcError,
    PowerOnReset,
    TestFault,
    InternalRegisterError,
}

impl FaultCode {
    pub fn decode(faults: u8) -> Vec<Self> {
        let mut result = Vec::new();

        macro_rules! ck_and_add {
            ($position:expr,$enum_type:expr) => {
                if read_bit!(faults, $position) {
                    result.push($enum_type);
                }
            };
        }

        ck_and_add!(0, FaultCode::CellOvervoltage);
        ck_and_add!(1, FaultCode::CellUndervoltage);
        ck_and_add!(2, FaultCode::CrcError);
        ck_and_add!(3, FaultCode::PowerOnReset);
        ck_and_add!(4, FaultCode::TestFault);
        ck_and_add!(5, FaultCode::InternalRegisterError);

        result
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultCode::CellOvervoltage => write!(f, "One or more cells overvoltage"),
            FaultCode::CellUndervoltage => write!(f, "One or more cells undervoltage"),
            FaultCode::CrcError => write!(f, "CRC error in received packet"),
            FaultCode::PowerOnReset => write!(f, "Power on reset has occurred"),
            FaultCode::TestFault => write!(f, "Test fault active"),
            FaultCode::InternalRegisterError => write!(f, "Internal registers inconsistent"),
        }
    }
}

/// Decoded alert-status register bits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AlertCode {
    OverTemperature1,
    OverTemperature2,
    SleepModeActive,
    ThermalShutdown,
    TestAlert,
    OtpUncorrectableError,
    GroupRegistersInvalid,
    AddressNotRegistered,
}

impl AlertCode {
    pub fn decode(alerts: u8) -> Vec<Self> {
        let mut result = Vec::new();

        macro_rules! ck_and_add {
            ($position:expr,$enum_type:expr) => {
                if read_bit!(alerts, $position) {
                    result.push($enum_type);
                }
            };
        }

        ck_and_add!(0, AlertCode::OverTemperature1);
        ck_and_add!(1, AlertCode::OverTemperature2);
        ck_and_add!(2, AlertCode::SleepModeActive);
        ck_and_add!(3, AlertCode::ThermalShutdown);
        ck_and_add!(4, AlertCode::TestAlert);
        ck_and_add!(5, AlertCode::OtpUncorrectableError);
        ck_and_add!(6, AlertCode::GroupRegistersInvalid);
        ck_and_add!(7, AlertCode::AddressNotRegistered);

        result
    }
}

impl fmt::Display for AlertCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlertCode::OverTemperature1 => write!(f, "Over temperature on thermistor 1"),
            AlertCode::OverTemperature2 => write!(f, "Over temperature on thermistor 2"),
            AlertCode::SleepModeActive => write!(f, "Sleep mode active"),
            AlertCode::ThermalShutdown => write!(f, "Thermal shutdown active"),
            AlertCode::TestAlert => write!(f, "Test alert active"),
            AlertCode::OtpUncorrectableError => write!(f, "OTP EPROM uncorrectable error"),
            AlertCode::GroupRegistersInvalid => write!(f, "Group 3 registers invalid"),
            AlertCode::AddressNotRegistered => write!(f, "Address not registered"),
        }
    }
}
