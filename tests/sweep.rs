use chainbms_lib::{
    pack::{FaultLine, Pack, PackConfig},
    protocol::{self, REG_ALERT_STATUS, REG_DEV_STATUS, REG_GPAI},
    transport::{Bus, BusMaster},
    Error,
};
use std::collections::VecDeque;

/// Simulates a fully addressed chain: every board answers direct probes,
/// status reads, telemetry reads and echoes register writes.
struct BoardFarm {
    /// Address and GPAI raw value per board; cells and thermistors are
    /// derived from the address so boards are distinguishable.
    boards: Vec<(u8, u16)>,
    rx: VecDeque<u8>,
}

impl BoardFarm {
    fn new(boards: Vec<(u8, u16)>) -> Self {
        Self {
            boards,
            rx: VecDeque::new(),
        }
    }

    fn reply(&mut self, mut frame: Vec<u8>) {
        let crc = protocol::crc8(&frame);
        frame.push(crc);
        self.rx.extend(frame);
    }
}

impl Bus for BoardFarm {
    fn write_all(&mut self, frame: &[u8]) -> Result<(), Error> {
        if frame.len() == 4 {
            // Register write: boards echo the frame verbatim.
            let address = frame[0] >> 1;
            if self.boards.iter().any(|(a, _)| *a == address) {
                self.rx.extend(frame.iter().copied());
            }
            return Ok(());
        }
        let address = frame[0] >> 1;
        let Some(&(_, gpai_raw)) = self.boards.iter().find(|(a, _)| *a == address) else {
            return Ok(());
        };
        match frame[1] {
            REG_DEV_STATUS => self.reply(vec![address << 1, REG_DEV_STATUS, 1, 1]),
            REG_ALERT_STATUS => {
                self.reply(vec![address << 1, REG_ALERT_STATUS, 4, 0, 0, 0, 0]);
            }
            REG_GPAI => {
                let mut reply = vec![address << 1, REG_GPAI, 0x12];
                reply.extend_from_slice(&gpai_raw.to_be_bytes());
                for cell in 0..6u16 {
                    reply.extend_from_slice(&(9000 + address as u16 * 10 + cell).to_be_bytes());
                }
                reply.extend_from_slice(&19000u16.to_be_bytes());
                reply.extend_from_slice(&20000u16.to_be_bytes());
                self.reply(reply);
            }
            _ => {}
        }
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, Error> {
        Ok(self.rx.len())
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.rx.pop_front().unwrap_or(0))
    }
}

/// Wraps the farm and fails register writes to one address on demand,
/// like a host adapter dropping a frame mid-cycle.
struct FlakyBus {
    farm: BoardFarm,
    fail_address: Option<u8>,
}

impl Bus for FlakyBus {
    fn write_all(&mut self, frame: &[u8]) -> Result<(), Error> {
        if let Some(address) = self.fail_address {
            if frame.len() == 4 && frame[0] >> 1 == address {
                return Err(Error::Io(std::io::ErrorKind::TimedOut.into()));
            }
        }
        self.farm.write_all(frame)
    }

    fn bytes_to_read(&mut self) -> Result<usize, Error> {
        self.farm.bytes_to_read()
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        self.farm.read_byte()
    }
}

struct SwitchedFaultLine {
    asserted: bool,
}

impl FaultLine for SwitchedFaultLine {
    fn is_asserted(&mut self) -> bool {
        self.asserted
    }
}

#[test]
fn sweep_aggregates_pack_voltage_and_extrema() {
    let mut master = BusMaster::new(BoardFarm::new(vec![(1, 18000), (2, 18500), (5, 17500)]));
    let mut pack = Pack::new();
    let mut fault_line = SwitchedFaultLine { asserted: false };

    assert_eq!(pack.find_boards(&mut master).unwrap(), 3);
    pack.read_all(&mut master, &mut fault_line).unwrap();

    let expected: f32 = [18000u16, 18500, 17500]
        .iter()
        .map(|raw| *raw as f32 * 0.002_034_609)
        .sum();
    assert!((pack.pack_voltage() - expected).abs() < 1e-4);
    assert_eq!(pack.highest_pack_voltage(), pack.pack_voltage());
    assert_eq!(pack.lowest_pack_voltage(), pack.pack_voltage());
    assert!(!pack.is_faulted());

    // Temperatures come from the shared thermistor raws, so pack extrema
    // match any module's low/high readings.
    let module = pack.module(1).unwrap();
    assert_eq!(pack.lowest_pack_temperature(), module.low_temperature());
    assert_eq!(pack.highest_pack_temperature(), module.high_temperature());
}

#[test]
fn fault_line_is_edge_triggered_and_sticky_per_cycle() {
    let mut master = BusMaster::new(BoardFarm::new(vec![(1, 18000)]));
    let mut pack = Pack::new();

    assert_eq!(pack.find_boards(&mut master).unwrap(), 1);

    let mut fault_line = SwitchedFaultLine { asserted: true };
    pack.read_all(&mut master, &mut fault_line).unwrap();
    assert!(pack.is_faulted());

    // Polling continues while faulted and recovers once the line clears.
    fault_line.asserted = false;
    pack.read_all(&mut master, &mut fault_line).unwrap();
    assert!(!pack.is_faulted());
    assert_eq!(pack.module(1).unwrap().good_packets(), 2);
}

#[test]
fn bus_error_keeps_stale_voltage_in_the_pack_sum() {
    let farm = BoardFarm::new(vec![(1, 18000), (2, 18500)]);
    let mut master = BusMaster::new(FlakyBus {
        farm,
        fail_address: None,
    });
    let mut pack = Pack::new();
    let mut fault_line = SwitchedFaultLine { asserted: false };

    assert_eq!(pack.find_boards(&mut master).unwrap(), 2);
    pack.read_all(&mut master, &mut fault_line).unwrap();
    let full = pack.pack_voltage();
    assert_eq!(pack.lowest_pack_voltage(), full);

    // Module 2 drops off the bus for one cycle; its stale voltage must
    // still count, so the lifetime low-water mark stays intact.
    master.bus_mut().fail_address = Some(2);
    pack.read_all(&mut master, &mut fault_line).unwrap();
    assert_eq!(pack.pack_voltage(), full);
    assert_eq!(pack.lowest_pack_voltage(), full);
    assert_eq!(pack.module(2).unwrap().good_packets(), 1);

    master.bus_mut().fail_address = None;
    pack.read_all(&mut master, &mut fault_line).unwrap();
    assert_eq!(pack.pack_voltage(), full);
    assert_eq!(pack.module(2).unwrap().good_packets(), 2);
}

#[test]
fn balancing_commands_reach_only_high_cells() {
    let mut master = BusMaster::new(BoardFarm::new(vec![(1, 18000)]));
    let mut pack = Pack::new();
    let mut fault_line = SwitchedFaultLine { asserted: false };

    assert_eq!(pack.find_boards(&mut master).unwrap(), 1);
    pack.read_all(&mut master, &mut fault_line).unwrap();

    // Cell raws for address 1 are 9010..=9015, roughly 3.437 V to
    // 3.439 V; the threshold splits them in the middle.
    let config = PackConfig {
        balance_voltage: 3.4385,
        balance_hysteresis: 0.01,
        battery_id: 0,
    };
    pack.balance_all(&mut master, &config).unwrap();

    let module = pack.module(1).unwrap();
    let balancing: Vec<bool> = (0..6).map(|cell| module.is_balancing(cell)).collect();
    assert!(balancing.iter().any(|b| *b));
    assert!(!balancing.iter().all(|b| *b));
    for (cell, active) in balancing.iter().enumerate() {
        let volts = module.cell_voltage(cell);
        assert_eq!(*active, volts > config.balance_voltage);
    }
}
