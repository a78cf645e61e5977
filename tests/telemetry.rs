mod common;

use chainbms_lib::{
    module::Module,
    protocol::{
        self, StatusRegisters, Telemetry, ADC_CTRL_ALL_CHANNELS, IO_CTRL_TEMP_SENSE, REG_ADC_CONV,
        REG_ADC_CTRL, REG_ALERT_STATUS, REG_GPAI, REG_IO_CTRL,
    },
    transport::BusMaster,
};
use common::ScriptedBus;

const ADDRESS: u8 = 3;

fn status_reply(alerts: u8, faults: u8, cov: u8, cuv: u8) -> Vec<u8> {
    let mut reply = vec![
        ADDRESS << 1,
        REG_ALERT_STATUS,
        StatusRegisters::DATA_LEN,
        alerts,
        faults,
        cov,
        cuv,
    ];
    reply.push(protocol::crc8(&reply));
    reply
}

fn telemetry_reply(raws: &[u16; 9]) -> Vec<u8> {
    let mut reply = vec![ADDRESS << 1, REG_GPAI, Telemetry::DATA_LEN];
    for raw in raws {
        reply.extend_from_slice(&raw.to_be_bytes());
    }
    reply.push(protocol::crc8(&reply));
    reply
}

/// The register-write echoes a board produces during a refresh cycle.
fn write_echoes() -> [Vec<u8>; 3] {
    [
        protocol::write_request(ADDRESS, REG_ADC_CTRL, ADC_CTRL_ALL_CHANNELS),
        protocol::write_request(ADDRESS, REG_IO_CTRL, IO_CTRL_TEMP_SENSE),
        protocol::write_request(ADDRESS, REG_ADC_CONV, 1),
    ]
}

fn expected_temperature(raw: u16, offset: f32, divisor: f32) -> f32 {
    let resistance = (1.78f32 / ((raw as f32 + offset) / divisor) - 3.57) * 1000.0;
    let ln_r = resistance.ln();
    1.0 / (7.610_373_573e-4 + 2.728_524_832e-4 * ln_r + 1.022_822_735e-7 * ln_r.powi(3)) - 273.15
}

#[test]
fn refresh_decodes_a_valid_reading() {
    let raws = [18500u16, 9800, 9900, 10000, 10100, 10200, 10300, 19000, 20500];
    let [e1, e2, e3] = write_echoes();
    let bus = ScriptedBus::new(vec![
        status_reply(0x04, 0x08, 0, 0),
        e1,
        e2,
        e3,
        telemetry_reply(&raws),
    ]);
    let mut master = BusMaster::new(bus);

    let mut module = Module::new(ADDRESS);
    module.set_exists(true);
    assert!(module.read_values(&mut master).unwrap());

    assert_eq!(module.good_packets(), 1);
    assert_eq!(module.bad_packets(), 0);
    assert_eq!(module.alerts(), 0x04);
    assert_eq!(module.faults(), 0x08);
    assert!((module.module_voltage() - 18500.0 * 0.002_034_609).abs() < 1e-5);
    for (cell, raw) in raws[1..7].iter().enumerate() {
        assert!((module.cell_voltage(cell) - *raw as f32 * 0.000_381_493).abs() < 1e-6);
        assert_eq!(module.cell_voltage(cell), module.lowest_cell_voltage(cell));
        assert_eq!(module.cell_voltage(cell), module.highest_cell_voltage(cell));
    }
    assert!((module.temperature(0) - expected_temperature(19000, 2.0, 33046.0)).abs() < 1e-4);
    assert!((module.temperature(1) - expected_temperature(20500, 9.0, 33068.0)).abs() < 1e-4);

    // The refresh sequences the registers in the required order.
    let writes = &master.bus().writes;
    assert_eq!(writes[0][1], REG_ALERT_STATUS);
    assert_eq!(writes[1][1], REG_ADC_CTRL);
    assert_eq!(writes[2][1], REG_IO_CTRL);
    assert_eq!(writes[3][1], REG_ADC_CONV);
    assert_eq!(writes[4][1], REG_GPAI);
}

#[test]
fn corrupt_reply_preserves_previous_telemetry() {
    let raws = [18500u16, 9800, 9900, 10000, 10100, 10200, 10300, 19000, 20500];

    // First cycle succeeds, second returns a reply with a flipped bit.
    let mut corrupted = telemetry_reply(&[17000, 1, 2, 3, 4, 5, 6, 7, 8]);
    corrupted[4] ^= 0x10;

    let [e1, e2, e3] = write_echoes();
    let [e4, e5, e6] = write_echoes();
    let bus = ScriptedBus::new(vec![
        status_reply(0, 0, 0, 0),
        e1,
        e2,
        e3,
        telemetry_reply(&raws),
        status_reply(0, 0, 0, 0),
        e4,
        e5,
        e6,
        corrupted,
    ]);
    let mut master = BusMaster::new(bus);

    let mut module = Module::new(ADDRESS);
    module.set_exists(true);
    assert!(module.read_values(&mut master).unwrap());
    let voltage_before = module.module_voltage();

    assert!(!module.read_values(&mut master).unwrap());
    assert_eq!(module.good_packets(), 1);
    assert_eq!(module.bad_packets(), 1);
    assert_eq!(module.module_voltage(), voltage_before);
}

#[test]
fn short_reply_counts_as_bad_packet_after_retries() {
    // The transport retries three times; every capture stays short, so
    // the decoder rejects the final buffer and keeps zeroed telemetry.
    let [e1, e2, e3] = write_echoes();
    let bus = ScriptedBus::new(vec![
        status_reply(0, 0, 0, 0),
        e1,
        e2,
        e3,
        vec![ADDRESS << 1, REG_GPAI],
        vec![],
        vec![],
    ]);
    let mut master = BusMaster::new(bus);

    let mut module = Module::new(ADDRESS);
    module.set_exists(true);
    assert!(!module.read_values(&mut master).unwrap());
    assert_eq!(module.bad_packets(), 1);
    assert_eq!(module.module_voltage(), 0.0);
}
