use crate::{transport::Bus, Error};
use std::time::Duration;

/// Bus rate of the daisy-chained boards. The supervisor ASIC runs a fixed
/// 612.5 kbaud UART; host adapters that cannot match it exactly are the
/// reason the transport layer retries on short captures.
pub const BAUD_RATE: u32 = 612_500;

/// Synchronous [`Bus`] implementation on top of a serial port.
pub struct SerialBus {
    serial: Box<dyn serialport::SerialPort>,
}

impl SerialBus {
    pub fn new(port: &str, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            serial: serialport::new(port, BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(timeout)
                .open()?,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }
}

impl Bus for SerialBus {
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        std::io::Write::write_all(&mut self.serial, data)?;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, Error> {
        Ok(self.serial.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        std::io::Read::read_exact(&mut self.serial, &mut byte)?;
        Ok(byte[0])
    }
}
