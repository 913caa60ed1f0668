//! T-Balancer bigNG fan controller
//!
//! The controller sits behind an FTDI bridge and answers a single query byte
//! with a fixed 285-byte status record. The record carries its protocol
//! revision at byte 274; the revision seen during discovery is the device's
//! capability level and every later record must repeat it.

use std::sync::Arc;

use cw_sensor::{
    CapabilityLevel, Device, DeviceFamily, DeviceIdentity, DeviceStatus, SensorId, SensorKind,
    SensorSnapshot,
};
use tracing::{debug, info, trace};

use super::fail_cycle;
use crate::candidate::DeviceCandidate;
use crate::constants::timing;
use crate::transport::{exchange, read_exact_within, FtdiDriver, FtdiSession, SerialSettings, Transport};
use crate::validator::{validate_candidates, wait_for_bytes, ProbePolicy};
use crate::{CoolwatchError, Result};

// ============================================================================
// Wire Constants
// ============================================================================

pub const SETTINGS: SerialSettings = SerialSettings::eight_n_one(19200);

/// Status request
pub const QUERY: [u8; 1] = [0x38];

pub const FRAME_LEN: usize = 285;

/// Byte 0 of every status record
pub const START_FLAG: u8 = 100;

pub const VERSION_OFFSET: usize = 274;

/// Record field offsets
pub mod offsets {
    pub const ANALOG_TEMPERATURES: [usize; 4] = [7, 8, 9, 10];
    pub const FAN_DUTY: [usize; 4] = [88, 89, 90, 91];
    /// Bit `i` set when fan `i` is connected
    pub const FAN_PRESENT_MASK: usize = 136;
    /// Big-endian (high, low) pairs
    pub const FAN_RPM: [(usize, usize); 4] = [(150, 151), (152, 153), (154, 155), (156, 157)];
    /// Big-endian (high, low) pairs, revision 0x2C only
    pub const FLOW: [(usize, usize); 2] = [(228, 229), (230, 231)];
    pub const DIGITAL_TEMPERATURES: [usize; 4] = [238, 239, 240, 241];
}

/// Temperature byte meaning "no probe connected"
const TEMPERATURE_ABSENT: u8 = 0;

/// Flow word meaning "no meter connected"
const FLOW_ABSENT: u16 = 0xFFFF;

const TEMPERATURE_SCALE: f32 = 0.5;
const FLOW_DIVISOR: f32 = 10.0;
const MAX_DUTY: u8 = 100;

// ============================================================================
// Revisions
// ============================================================================

/// Known protocol revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TBalancerRevision {
    Rev2A,
    /// Adds the two flow meters
    Rev2C,
}

impl TBalancerRevision {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x2A => Some(TBalancerRevision::Rev2A),
            0x2C => Some(TBalancerRevision::Rev2C),
            _ => None,
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            TBalancerRevision::Rev2A => 0x2A,
            TBalancerRevision::Rev2C => 0x2C,
        }
    }

    pub fn level(&self) -> CapabilityLevel {
        match self {
            TBalancerRevision::Rev2A => CapabilityLevel::new(1, "protocol 0x2A"),
            TBalancerRevision::Rev2C => CapabilityLevel::new(2, "protocol 0x2C"),
        }
    }

    pub fn has_flow(&self) -> bool {
        *self == TBalancerRevision::Rev2C
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Typed contents of one status record
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TBalancerReadout {
    pub digital_temperatures: [Option<f32>; 4],
    pub analog_temperatures: [Option<f32>; 4],
    pub fan_rpm: [Option<f32>; 4],
    pub fan_duty: [Option<f32>; 4],
    /// Litres per hour, scaling unconfirmed
    pub flow: [Option<f32>; 2],
}

fn temperature(byte: u8) -> Option<f32> {
    (byte != TEMPERATURE_ABSENT).then(|| byte as f32 * TEMPERATURE_SCALE)
}

fn word(frame: &[u8], (high, low): (usize, usize)) -> u16 {
    u16::from_be_bytes([frame[high], frame[low]])
}

/// Decode a status record produced at `revision`.
///
/// Rejects records of the wrong length, without the start flag, or carrying
/// a different protocol revision.
pub fn decode(frame: &[u8], revision: TBalancerRevision) -> Result<TBalancerReadout> {
    if frame.len() != FRAME_LEN {
        return Err(CoolwatchError::ShortRead {
            expected: FRAME_LEN,
            actual: frame.len(),
        });
    }
    if frame[0] != START_FLAG {
        return Err(CoolwatchError::MalformedFrame(format!(
            "start flag {} (expected {})",
            frame[0], START_FLAG
        )));
    }
    if frame[VERSION_OFFSET] != revision.byte() {
        return Err(CoolwatchError::MalformedFrame(format!(
            "protocol revision {:#04X} (negotiated {:#04X})",
            frame[VERSION_OFFSET],
            revision.byte()
        )));
    }

    let mut readout = TBalancerReadout::default();
    let present = frame[offsets::FAN_PRESENT_MASK];

    for i in 0..4 {
        readout.digital_temperatures[i] = temperature(frame[offsets::DIGITAL_TEMPERATURES[i]]);
        readout.analog_temperatures[i] = temperature(frame[offsets::ANALOG_TEMPERATURES[i]]);

        if present & (1 << i) != 0 {
            readout.fan_rpm[i] = Some(word(frame, offsets::FAN_RPM[i]) as f32);
        }
        let duty = frame[offsets::FAN_DUTY[i]];
        readout.fan_duty[i] = (duty <= MAX_DUTY).then_some(duty as f32);
    }

    if revision.has_flow() {
        for (i, pair) in offsets::FLOW.iter().enumerate() {
            let raw = word(frame, *pair);
            readout.flow[i] = (raw != FLOW_ABSENT).then(|| raw as f32 / FLOW_DIVISOR);
        }
    }

    Ok(readout)
}

// ============================================================================
// Probe
// ============================================================================

/// Send the status query and check the reply's structure.
///
/// Returns the protocol revision the controller reports.
pub fn probe(transport: &mut dyn Transport, policy: ProbePolicy) -> Result<TBalancerRevision> {
    transport.purge()?;
    transport.write(&QUERY)?;
    wait_for_bytes(transport, FRAME_LEN, policy)?;

    let mut frame = [0u8; FRAME_LEN];
    read_exact_within(transport, &mut frame, policy.step.max(timing::FTDI_QUEUE_POLL))?;

    if frame[0] != START_FLAG {
        return Err(CoolwatchError::validation(
            transport.name(),
            format!("start flag {}", frame[0]),
        ));
    }
    TBalancerRevision::from_byte(frame[VERSION_OFFSET]).ok_or_else(|| {
        CoolwatchError::validation(
            transport.name(),
            format!("unknown protocol revision {:#04X}", frame[VERSION_OFFSET]),
        )
    })
}

// ============================================================================
// Device
// ============================================================================

struct Sensors {
    digital_temperatures: [SensorId; 4],
    analog_temperatures: [SensorId; 4],
    fan_rpm: [SensorId; 4],
    fan_duty: [SensorId; 4],
    flow: [SensorId; 2],
}

pub struct TBalancer {
    identity: DeviceIdentity,
    revision: TBalancerRevision,
    transport: Box<dyn Transport>,
    snapshot: SensorSnapshot,
    sensors: Sensors,
    status: DeviceStatus,
}

impl TBalancer {
    pub fn new(location: String, transport: Box<dyn Transport>, revision: TBalancerRevision) -> Self {
        let mut snapshot = SensorSnapshot::new();
        let declare = |snapshot: &mut SensorSnapshot, prefix: &str, kind: SensorKind, base: u32| {
            [0u32, 1, 2, 3].map(|i| snapshot.declare(format!("{} {}", prefix, i + 1), kind, base + i))
        };

        let digital_temperatures = declare(&mut snapshot, "Digital Sensor", SensorKind::Temperature, 0);
        let analog_temperatures = declare(&mut snapshot, "Analog Sensor", SensorKind::Temperature, 4);
        let fan_rpm = declare(&mut snapshot, "Fan", SensorKind::Fan, 0);
        let fan_duty = declare(&mut snapshot, "Fan Channel", SensorKind::Control, 0);
        let flow = [0u32, 1].map(|i| {
            let name = format!("Flowmeter {}", i + 1);
            if revision.has_flow() {
                snapshot.declare_unverified(name, SensorKind::Flow, i)
            } else {
                snapshot.declare_absent(name, SensorKind::Flow, i)
            }
        });

        Self {
            identity: DeviceIdentity {
                name: "T-Balancer bigNG".to_string(),
                family: DeviceFamily::TBalancer,
                location,
                firmware: Some(format!("{:#04X}", revision.byte())),
            },
            revision,
            transport,
            snapshot,
            sensors: Sensors {
                digital_temperatures,
                analog_temperatures,
                fan_rpm,
                fan_duty,
                flow,
            },
            status: DeviceStatus::Active,
        }
    }

    pub fn revision(&self) -> TBalancerRevision {
        self.revision
    }

    fn apply(&mut self, readout: &TBalancerReadout) {
        let s = &self.sensors;
        for i in 0..4 {
            self.snapshot.set(s.digital_temperatures[i], readout.digital_temperatures[i]);
            self.snapshot.set(s.analog_temperatures[i], readout.analog_temperatures[i]);
            self.snapshot.set(s.fan_rpm[i], readout.fan_rpm[i]);
            self.snapshot.set(s.fan_duty[i], readout.fan_duty[i]);
        }
        for i in 0..2 {
            self.snapshot.set(s.flow[i], readout.flow[i]);
        }
    }
}

impl Device for TBalancer {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capability(&self) -> CapabilityLevel {
        self.revision.level()
    }

    fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    fn update(&mut self) {
        if self.status != DeviceStatus::Active {
            return;
        }
        let result = exchange(self.transport.as_mut(), &QUERY, FRAME_LEN, timing::EXCHANGE_TIMEOUT)
            .and_then(|frame| decode(&frame, self.revision));
        match result {
            Ok(readout) => {
                self.apply(&readout);
                self.snapshot.mark_updated();
            }
            Err(e) => fail_cycle(&self.identity.name, &mut self.snapshot, &mut self.status, &e),
        }
    }

    fn close(&mut self) {
        if !self.transport.is_closed() {
            self.transport.close();
            debug!(device = %self.identity.location, "T-Balancer closed");
        }
        self.status = DeviceStatus::Closed;
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }
}

impl Drop for TBalancer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Probe every FTDI device for a T-Balancer
pub fn discover(driver: Arc<dyn FtdiDriver>, policy: ProbePolicy) -> Result<Vec<TBalancer>> {
    let count = driver
        .device_count()
        .map_err(|s| CoolwatchError::TransportUnavailable(format!("FTDI driver: {}", s)))?;
    trace!("FTDI driver reports {} device(s)", count);

    let candidates: Vec<DeviceCandidate> = (0..count)
        .filter_map(|index| match driver.describe(index) {
            Ok(info) => Some(DeviceCandidate::Ftdi(info)),
            Err(status) => {
                debug!("FTDI device {} not describable: {}", index, status);
                None
            }
        })
        .collect();

    let validated = validate_candidates(
        "T-Balancer",
        candidates,
        |candidate| match candidate {
            DeviceCandidate::Ftdi(info) => {
                let session = FtdiSession::open(Arc::clone(&driver), info, &SETTINGS)?;
                Ok(Box::new(session) as Box<dyn Transport>)
            }
            other => Err(CoolwatchError::NotSupported(other.to_string())),
        },
        |_, transport| probe(transport, policy),
    );

    Ok(validated
        .into_iter()
        .map(|v| {
            info!(
                "T-Balancer at {} (protocol {:#04X})",
                v.candidate.location(),
                v.probe.byte()
            );
            TBalancer::new(v.candidate.location(), v.transport, v.probe)
        })
        .collect())
}
