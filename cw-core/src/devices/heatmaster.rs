//! Heatmaster fan controller
//!
//! RS-232 at 38400 baud with an ASCII request/response protocol. A request
//! `[0:<device>]R<field>` is answered by a line `-[0:<device>]R<field>:<value>`;
//! device 0 is the controller itself and channel groups start at 32 (fans),
//! 48 (temperatures), 64 (flow meters) and 80 (relays).

use std::time::Duration;

use cw_sensor::{
    CapabilityLevel, Device, DeviceFamily, DeviceIdentity, DeviceStatus, SensorId, SensorKind,
    SensorSnapshot,
};
use tracing::{debug, info, trace};

use super::fail_cycle;
use crate::candidate::DeviceCandidate;
use crate::transport::{read_line, SerialBus, SerialSettings, Transport};
use crate::validator::{scan_for_marker, validate_candidates, wait_for_bytes, ProbePolicy};
use crate::{CoolwatchError, Result};

pub const SETTINGS: SerialSettings = SerialSettings::eight_n_one(38400);

/// Wake-up byte, echoed by the controller
pub const ECHO: u8 = 0xAA;

/// The only hardware revision this protocol table describes
pub const HARDWARE_REVISION: i64 = 770;

const CAPABILITY: CapabilityLevel = CapabilityLevel::new(1, "hardware 770");

/// Lines read while looking for a reply
const MAX_REPLY_LINES: usize = 5;

/// Wait per reply line
const LINE_TIMEOUT: Duration = Duration::from_millis(100);

/// Controller register block
const CONTROLLER: u8 = 0;

/// Register blocks of each channel group: (count device, channel base, max channels)
mod groups {
    pub const FANS: (u8, u8, i64) = (32, 33, 4);
    pub const TEMPERATURES: (u8, u8, i64) = (48, 49, 6);
    pub const FLOWS: (u8, u8, i64) = (64, 65, 1);
    pub const RELAYS: (u8, u8, i64) = (80, 81, 1);
}

/// Field answering a group's channel count
const COUNT_FIELD: char = '?';

// ============================================================================
// Line Protocol
// ============================================================================

fn request(device: u8, field: char) -> String {
    format!("[0:{}]R{}\r", device, field)
}

/// Extract the value of a reply to `[0:device]R<field>`, if `line` is one
pub fn parse_reply(line: &str, device: u8, field: char) -> Option<&str> {
    let prefix = format!("-[0:{}]R{}:", device, field);
    line.trim().strip_prefix(prefix.as_str())
}

/// Send a read request and return the raw value
fn read_field(transport: &mut dyn Transport, device: u8, field: char) -> Result<String> {
    transport.purge()?;
    transport.write(request(device, field).as_bytes())?;

    for _ in 0..MAX_REPLY_LINES {
        let line = read_line(transport, LINE_TIMEOUT)?;
        if let Some(value) = parse_reply(&line, device, field) {
            return Ok(value.to_string());
        }
        trace!("{}: ignoring line {:?}", transport.name(), line);
    }
    Err(CoolwatchError::MalformedFrame(format!(
        "{}: no reply to [0:{}]R{}",
        transport.name(),
        device,
        field
    )))
}

fn read_int(transport: &mut dyn Transport, device: u8, field: char) -> Result<i64> {
    let raw = read_field(transport, device, field)?;
    raw.trim().parse::<i64>().map_err(|_| {
        CoolwatchError::MalformedFrame(format!("[0:{}]R{} value {:?}", device, field, raw))
    })
}

// ============================================================================
// Probe
// ============================================================================

/// Wake the controller, wait for the echo, and check the hardware revision
pub fn probe(transport: &mut dyn Transport, policy: ProbePolicy) -> Result<i64> {
    transport.purge()?;
    transport.write(&[ECHO])?;
    wait_for_bytes(transport, 1, policy)?;
    scan_for_marker(transport, ECHO, policy)?;

    let revision = read_int(transport, CONTROLLER, 'H')?;
    if revision != HARDWARE_REVISION {
        return Err(CoolwatchError::validation(
            transport.name(),
            format!("hardware revision {}", revision),
        ));
    }
    Ok(revision)
}

// ============================================================================
// Device
// ============================================================================

/// One polled register and where its value goes
#[derive(Debug, Clone, Copy)]
struct Channel {
    device: u8,
    field: char,
    factor: f32,
    divisor: f32,
    sensor: SensorId,
}

/// Controller description read once at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatmasterLayout {
    pub hardware_revision: i64,
    pub firmware_revision: i64,
    pub firmware_crc: i64,
    pub fans: Vec<String>,
    pub temperatures: usize,
    pub flows: usize,
    pub relays: usize,
}

fn read_count(transport: &mut dyn Transport, (count_device, _, max): (u8, u8, i64)) -> Result<usize> {
    let count = read_int(transport, count_device, COUNT_FIELD)?;
    Ok(count.clamp(0, max) as usize)
}

/// Read revisions, channel counts and fan names
pub fn read_layout(transport: &mut dyn Transport, hardware_revision: i64) -> Result<HeatmasterLayout> {
    let firmware_revision = read_int(transport, CONTROLLER, 'V')?;
    let firmware_crc = read_int(transport, CONTROLLER, 'C')?;

    let fan_count = read_count(transport, groups::FANS)?;
    let mut fans = Vec::with_capacity(fan_count);
    for i in 0..fan_count {
        let device = groups::FANS.1 + i as u8;
        let name = match read_field(transport, device, 'N') {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            Ok(_) | Err(_) => format!("Fan {}", i + 1),
        };
        fans.push(name);
    }

    Ok(HeatmasterLayout {
        hardware_revision,
        firmware_revision,
        firmware_crc,
        fans,
        temperatures: read_count(transport, groups::TEMPERATURES)?,
        flows: read_count(transport, groups::FLOWS)?,
        relays: read_count(transport, groups::RELAYS)?,
    })
}

pub struct Heatmaster {
    identity: DeviceIdentity,
    layout: HeatmasterLayout,
    transport: Box<dyn Transport>,
    snapshot: SensorSnapshot,
    channels: Vec<Channel>,
    status: DeviceStatus,
}

impl Heatmaster {
    /// Read the controller layout; the transport is closed if that fails
    pub fn new(location: String, mut transport: Box<dyn Transport>, hardware_revision: i64) -> Result<Self> {
        let layout = match read_layout(transport.as_mut(), hardware_revision) {
            Ok(layout) => layout,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        Ok(Self::with_layout(location, transport, layout))
    }

    pub fn with_layout(location: String, transport: Box<dyn Transport>, layout: HeatmasterLayout) -> Self {
        let mut snapshot = SensorSnapshot::new();
        let mut channels = Vec::new();

        for (i, name) in layout.fans.iter().enumerate() {
            let device = groups::FANS.1 + i as u8;
            channels.push(Channel {
                device,
                field: 'R',
                factor: 1.0,
                divisor: 1.0,
                sensor: snapshot.declare(name.clone(), SensorKind::Fan, i as u32),
            });
            channels.push(Channel {
                device,
                field: 'P',
                factor: 1.0,
                divisor: 1.0,
                sensor: snapshot.declare(name.clone(), SensorKind::Control, i as u32),
            });
        }
        for i in 0..layout.temperatures {
            channels.push(Channel {
                device: groups::TEMPERATURES.1 + i as u8,
                field: 'T',
                factor: 1.0,
                divisor: 100.0,
                sensor: snapshot.declare(
                    format!("Temperature {}", i + 1),
                    SensorKind::Temperature,
                    i as u32,
                ),
            });
        }
        for i in 0..layout.flows {
            channels.push(Channel {
                device: groups::FLOWS.1 + i as u8,
                field: 'L',
                factor: 1.0,
                divisor: 10.0,
                sensor: snapshot.declare_unverified(
                    format!("Flowmeter {}", i + 1),
                    SensorKind::Flow,
                    i as u32,
                ),
            });
        }
        for i in 0..layout.relays {
            channels.push(Channel {
                device: groups::RELAYS.1 + i as u8,
                field: 'S',
                factor: 100.0,
                divisor: 1.0,
                sensor: snapshot.declare(
                    format!("Relay {}", i + 1),
                    SensorKind::Control,
                    (layout.fans.len() + i) as u32,
                ),
            });
        }

        Self {
            identity: DeviceIdentity {
                name: "Heatmaster".to_string(),
                family: DeviceFamily::Heatmaster,
                location,
                firmware: Some(format!(
                    "{} (CRC {})",
                    layout.firmware_revision, layout.firmware_crc
                )),
            },
            layout,
            transport,
            snapshot,
            channels,
            status: DeviceStatus::Active,
        }
    }

    pub fn layout(&self) -> &HeatmasterLayout {
        &self.layout
    }
}

impl Device for Heatmaster {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capability(&self) -> CapabilityLevel {
        CAPABILITY
    }

    fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    fn update(&mut self) {
        if self.status != DeviceStatus::Active {
            return;
        }
        for i in 0..self.channels.len() {
            let channel = self.channels[i];
            match read_int(self.transport.as_mut(), channel.device, channel.field) {
                Ok(raw) => self.snapshot.set(channel.sensor, Some(raw as f32 * channel.factor / channel.divisor)),
                Err(e) if e.is_fatal() => {
                    fail_cycle(&self.identity.name, &mut self.snapshot, &mut self.status, &e);
                    return;
                }
                Err(e) => {
                    trace!(
                        device = %self.identity.location,
                        "[0:{}]R{} failed: {}",
                        channel.device,
                        channel.field,
                        e
                    );
                    self.snapshot.set(channel.sensor, None);
                }
            }
        }
        self.snapshot.mark_updated();
    }

    fn close(&mut self) {
        if !self.transport.is_closed() {
            self.transport.close();
            debug!(device = %self.identity.location, "Heatmaster closed");
        }
        self.status = DeviceStatus::Closed;
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }
}

impl Drop for Heatmaster {
    fn drop(&mut self) {
        self.close();
    }
}

/// Probe every serial port not in `ignore_ports` for a Heatmaster
pub fn discover(bus: &dyn SerialBus, ignore_ports: &[String], policy: ProbePolicy) -> Result<Vec<Heatmaster>> {
    let candidates: Vec<DeviceCandidate> = bus
        .ports()?
        .into_iter()
        .filter(|port| {
            let ignored = ignore_ports.iter().any(|p| p == &port.name);
            if ignored {
                trace!("Skipping ignored port {}", port.name);
            }
            !ignored
        })
        .map(DeviceCandidate::Serial)
        .collect();

    let validated = validate_candidates(
        "Heatmaster",
        candidates,
        |candidate| match candidate {
            DeviceCandidate::Serial(port) => bus.open(&port.name, &SETTINGS),
            other => Err(CoolwatchError::NotSupported(other.to_string())),
        },
        |_, transport| probe(transport, policy),
    );

    let mut devices = Vec::new();
    for v in validated {
        let location = v.candidate.location();
        match Heatmaster::new(location.clone(), v.transport, v.probe) {
            Ok(device) => {
                info!(
                    "Heatmaster at {}: {} fan(s), {} temperature(s), firmware {}",
                    location,
                    device.layout.fans.len(),
                    device.layout.temperatures,
                    device.layout.firmware_revision
                );
                devices.push(device);
            }
            Err(e) => debug!("Heatmaster at {} failed to describe itself: {}", location, e),
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MemoryTransport;

    fn policy() -> ProbePolicy {
        ProbePolicy::new(Duration::from_millis(5), 10)
    }

    fn line(device: u8, field: char, value: &str) -> Vec<u8> {
        format!("-[0:{}]R{}:{}\r\n", device, field, value).into_bytes()
    }

    #[test]
    fn test_parse_reply_matches_request() {
        assert_eq!(parse_reply("-[0:0]RH:770", 0, 'H'), Some("770"));
        assert_eq!(parse_reply("-[0:33]RR:1450\r", 33, 'R'), Some("1450"));
        assert_eq!(parse_reply("-[0:33]RR:1450", 34, 'R'), None);
        assert_eq!(parse_reply("garbage", 0, 'H'), None);
    }

    #[test]
    fn test_probe_accepts_expected_revision() {
        let mut t = MemoryTransport::default()
            .reply(&[0x00, ECHO])
            .reply(&line(0, 'H', "770"));
        assert_eq!(probe(&mut t, policy()).unwrap(), 770);
        assert_eq!(t.written[1], b"[0:0]RH\r".to_vec());
    }

    #[test]
    fn test_probe_skips_noise_lines() {
        let mut reply = b"\r\n-[0:5]RX:1\r\n".to_vec();
        reply.extend(line(0, 'H', "770"));
        let mut t = MemoryTransport::default().reply(&[ECHO]).reply(&reply);
        assert_eq!(probe(&mut t, policy()).unwrap(), 770);
    }

    #[test]
    fn test_probe_rejects_other_revision() {
        let mut t = MemoryTransport::default()
            .reply(&[ECHO])
            .reply(&line(0, 'H', "512"));
        assert!(matches!(
            probe(&mut t, policy()),
            Err(CoolwatchError::ValidationFailure { .. })
        ));
    }

    #[test]
    fn test_probe_without_echo_times_out() {
        let mut t = MemoryTransport::default();
        assert!(matches!(probe(&mut t, policy()), Err(CoolwatchError::Timeout(_))));
    }

    #[test]
    fn test_layout_and_update() {
        let t = MemoryTransport::default()
            .reply(&line(0, 'V', "17"))
            .reply(&line(0, 'C', "4242"))
            .reply(&line(32, '?', "9"))
            .reply(&line(33, 'N', "Radiator"))
            .reply(&line(34, 'N', ""))
            .reply(&line(35, 'N', "Pump"))
            .reply(&line(36, 'N', "Rear"))
            .reply(&line(48, '?', "1"))
            .reply(&line(64, '?', "1"))
            .reply(&line(80, '?', "0"))
            // update cycle
            .reply(&line(33, 'R', "1200"))
            .reply(&line(33, 'P', "45"))
            .reply(&line(34, 'R', "900"))
            .reply(&line(34, 'P', "30"))
            .reply(&line(35, 'R', "2400"))
            .reply(&line(35, 'P', "80"))
            .reply(&b"junk\r\n".repeat(5))
            .reply(&line(36, 'P', "20"))
            .reply(&line(49, 'T', "3125"))
            .reply(&line(65, 'L', "1234"));

        let mut device = Heatmaster::new("/dev/ttyS0".into(), Box::new(t), 770).unwrap();
        assert_eq!(device.layout().fans, vec!["Radiator", "Fan 2", "Pump", "Rear"]);
        assert_eq!(device.layout().flows, 1);
        assert_eq!(device.layout().relays, 0);

        device.update();
        let snap = device.snapshot();
        assert_eq!(snap.get(SensorKind::Fan, 0).unwrap().value, Some(1200.0));
        assert_eq!(snap.get(SensorKind::Control, 2).unwrap().value, Some(80.0));
        assert_eq!(snap.get(SensorKind::Fan, 3).unwrap().value, None);
        assert_eq!(snap.get(SensorKind::Control, 3).unwrap().value, Some(20.0));
        assert_eq!(snap.find("Temperature 1").unwrap().value, Some(31.25));
        let flow = snap.find("Flowmeter 1").unwrap();
        assert_eq!(flow.value, Some(123.4));
        assert_eq!(flow.accuracy, cw_sensor::Accuracy::Unverified);
        assert_eq!(device.status(), DeviceStatus::Active);
    }
}
