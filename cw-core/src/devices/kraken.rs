//! Kraken X3 / Z3 liquid coolers
//!
//! The coolers stream a status report roughly once per second after a short
//! initialisation. Reports are collected by a [`BackgroundPoller`]; `update()`
//! decodes whatever frame arrived last. A pass that finds no new report leaves
//! the snapshot unrefreshed, and after `stale_cycles` such passes the values
//! are dropped.

use std::time::Duration;

use cw_sensor::{
    CapabilityLevel, Device, DeviceFamily, DeviceIdentity, DeviceStatus, SensorId, SensorKind,
    SensorSnapshot,
};
use tracing::{debug, info, trace, warn};

use super::fail_cycle;
use crate::candidate::DeviceCandidate;
use crate::poller::{BackgroundPoller, FrameReader, MAX_FRAME_LEN};
use crate::transport::{HidBus, Transport};
use crate::validator::{validate_candidates, ProbePolicy};
use crate::{CoolwatchError, Result};

// ============================================================================
// Wire Constants
// ============================================================================

pub const VENDOR_ID: u16 = 0x1E71;

/// Output reports are zero-padded to this length
pub const REPORT_LEN: usize = MAX_FRAME_LEN;

/// Stream a status report every second
pub const SET_INTERVAL: [u8; 5] = [0x70, 0x02, 0x01, 0xB8, 0x01];
pub const COMMIT_INTERVAL: [u8; 2] = [0x70, 0x01];
pub const FIRMWARE_REQUEST: [u8; 2] = [0x10, 0x01];

pub const FIRMWARE_REPLY: [u8; 2] = [0x11, 0x01];
pub const STATUS_REPORT: [u8; 2] = [0x75, 0x02];

/// Status report field offsets
pub mod offsets {
    pub const LIQUID_WHOLE: usize = 15;
    pub const LIQUID_TENTHS: usize = 16;
    /// Little-endian u16
    pub const PUMP_RPM: usize = 17;
    pub const PUMP_DUTY: usize = 19;
    /// Little-endian u16, Z3 only
    pub const FAN_RPM: usize = 23;
    pub const FAN_DUTY: usize = 25;
    /// Major, minor, patch bytes of the firmware reply
    pub const FIRMWARE: usize = 0x11;
}

const STATUS_MIN_LEN: usize = offsets::FAN_DUTY + 1;
const FIRMWARE_MIN_LEN: usize = offsets::FIRMWARE + 3;

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrakenModel {
    X3,
    /// Adds a fan channel
    Z3,
}

impl KrakenModel {
    pub fn from_product_id(product_id: u16) -> Option<Self> {
        match product_id {
            0x2007 | 0x2014 => Some(KrakenModel::X3),
            0x3008 => Some(KrakenModel::Z3),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KrakenModel::X3 => "Kraken X3",
            KrakenModel::Z3 => "Kraken Z3",
        }
    }

    pub fn level(&self) -> CapabilityLevel {
        match self {
            KrakenModel::X3 => CapabilityLevel::new(1, "X3 pump"),
            KrakenModel::Z3 => CapabilityLevel::new(2, "Z3 pump and fan"),
        }
    }

    pub fn has_fan(&self) -> bool {
        *self == KrakenModel::Z3
    }
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KrakenReadout {
    pub liquid: Option<f32>,
    pub pump_rpm: Option<f32>,
    pub pump_duty: Option<f32>,
    pub fan_rpm: Option<f32>,
    pub fan_duty: Option<f32>,
}

/// Keep only status reports
pub fn is_status_report(report: &[u8]) -> bool {
    report.starts_with(&STATUS_REPORT)
}

fn le_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([frame[offset], frame[offset + 1]])
}

pub fn decode(frame: &[u8], model: KrakenModel) -> Result<KrakenReadout> {
    if !is_status_report(frame) {
        return Err(CoolwatchError::MalformedFrame(format!(
            "not a status report: {:02X?}",
            &frame[..frame.len().min(2)]
        )));
    }
    if frame.len() < STATUS_MIN_LEN {
        return Err(CoolwatchError::ShortRead {
            expected: STATUS_MIN_LEN,
            actual: frame.len(),
        });
    }

    let mut readout = KrakenReadout {
        liquid: Some(
            frame[offsets::LIQUID_WHOLE] as f32 + frame[offsets::LIQUID_TENTHS] as f32 / 10.0,
        ),
        pump_rpm: Some(le_u16(frame, offsets::PUMP_RPM) as f32),
        pump_duty: Some(frame[offsets::PUMP_DUTY] as f32),
        ..Default::default()
    };
    if model.has_fan() {
        readout.fan_rpm = Some(le_u16(frame, offsets::FAN_RPM) as f32);
        readout.fan_duty = Some(frame[offsets::FAN_DUTY] as f32);
    }
    Ok(readout)
}

// ============================================================================
// Handshake
// ============================================================================

fn write_report(transport: &mut dyn Transport, payload: &[u8]) -> Result<()> {
    let mut report = [0u8; REPORT_LEN];
    report[..payload.len()].copy_from_slice(payload);
    transport.write(&report)
}

/// Start the status stream and ask for the firmware version.
///
/// Unsolicited reports are skipped while waiting; a cooler that never
/// answers the firmware request is still accepted with an unknown version.
pub fn handshake(transport: &mut dyn Transport, policy: ProbePolicy) -> Result<Option<String>> {
    write_report(transport, &SET_INTERVAL)?;
    write_report(transport, &COMMIT_INTERVAL)?;
    write_report(transport, &FIRMWARE_REQUEST)?;

    let mut report = [0u8; REPORT_LEN];
    for _ in 0..policy.retries {
        match transport.read(&mut report, policy.step) {
            Ok(n) if n >= FIRMWARE_MIN_LEN && report.starts_with(&FIRMWARE_REPLY) => {
                let v = &report[offsets::FIRMWARE..offsets::FIRMWARE + 3];
                return Ok(Some(format!("{}.{}.{}", v[0], v[1], v[2])));
            }
            Ok(_) => trace!("{}: skipping report {:#04X}", transport.name(), report[0]),
            Err(CoolwatchError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }
    }
    debug!("{}: no firmware reply", transport.name());
    Ok(None)
}

// ============================================================================
// Device
// ============================================================================

struct Sensors {
    liquid: SensorId,
    pump_rpm: SensorId,
    pump_duty: SensorId,
    fan_rpm: SensorId,
    fan_duty: SensorId,
}

/// Timeouts of the background reader
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    pub read_timeout: Duration,
    pub join_timeout: Duration,
    /// Quiet update passes tolerated before values become absent
    pub stale_cycles: u32,
}

pub struct Kraken {
    identity: DeviceIdentity,
    model: KrakenModel,
    poller: BackgroundPoller,
    frames: FrameReader,
    snapshot: SensorSnapshot,
    sensors: Sensors,
    status: DeviceStatus,
    /// Reader frame count at the last decoded pass
    seen_frames: u64,
    quiet_cycles: u32,
    stale_cycles: u32,
}

impl Kraken {
    /// Hand the initialised transport to a background reader
    pub fn new(
        location: String,
        transport: Box<dyn Transport>,
        model: KrakenModel,
        firmware: Option<String>,
        timing: StreamTiming,
    ) -> Result<Self> {
        let poller = BackgroundPoller::spawn(
            &location,
            transport,
            timing.read_timeout,
            timing.join_timeout,
            is_status_report,
        )?;
        let frames = poller.reader();

        let mut snapshot = SensorSnapshot::new();
        let sensors = Sensors {
            liquid: snapshot.declare("Liquid", SensorKind::Temperature, 0),
            pump_rpm: snapshot.declare("Pump", SensorKind::Fan, 0),
            pump_duty: snapshot.declare("Pump", SensorKind::Control, 0),
            fan_rpm: snapshot.declare_if(model.has_fan(), "Fan", SensorKind::Fan, 1),
            fan_duty: snapshot.declare_if(model.has_fan(), "Fan", SensorKind::Control, 1),
        };

        Ok(Self {
            identity: DeviceIdentity {
                name: model.name().to_string(),
                family: DeviceFamily::Kraken,
                location,
                firmware,
            },
            model,
            poller,
            frames,
            snapshot,
            sensors,
            status: DeviceStatus::Active,
            seen_frames: 0,
            quiet_cycles: 0,
            stale_cycles: timing.stale_cycles.max(1),
        })
    }

    pub fn model(&self) -> KrakenModel {
        self.model
    }

    pub fn frames_received(&self) -> u64 {
        self.frames.frames_received()
    }
}

impl Device for Kraken {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn capability(&self) -> CapabilityLevel {
        self.model.level()
    }

    fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    fn update(&mut self) {
        if self.status != DeviceStatus::Active {
            return;
        }
        if self.frames.is_disconnected() {
            let err = CoolwatchError::Disconnected(self.identity.location.clone());
            fail_cycle(&self.identity.name, &mut self.snapshot, &mut self.status, &err);
            return;
        }
        // Read the counter first; `latest()` is then at least that new
        let received = self.frames.frames_received();
        if received == self.seen_frames {
            self.quiet_cycles = self.quiet_cycles.saturating_add(1);
            if self.quiet_cycles == self.stale_cycles {
                debug!(
                    device = %self.identity.location,
                    "No status report for {} passes, dropping values", self.quiet_cycles
                );
                self.snapshot.clear_values();
            }
            return;
        }
        let Some(frame) = self.frames.latest() else {
            trace!(device = %self.identity.location, "No status report yet");
            return;
        };
        self.seen_frames = received;
        self.quiet_cycles = 0;

        match decode(frame.as_bytes(), self.model) {
            Ok(readout) => {
                let s = &self.sensors;
                self.snapshot.set(s.liquid, readout.liquid);
                self.snapshot.set(s.pump_rpm, readout.pump_rpm);
                self.snapshot.set(s.pump_duty, readout.pump_duty);
                self.snapshot.set(s.fan_rpm, readout.fan_rpm);
                self.snapshot.set(s.fan_duty, readout.fan_duty);
                self.snapshot.mark_updated();
            }
            Err(e) => fail_cycle(&self.identity.name, &mut self.snapshot, &mut self.status, &e),
        }
    }

    fn close(&mut self) {
        if self.poller.is_running() {
            self.poller.close();
            debug!(device = %self.identity.location, "{} closed", self.identity.name);
        }
        self.status = DeviceStatus::Closed;
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }
}

/// Open and initialise every supported Kraken on the HID bus
pub fn discover(bus: &dyn HidBus, policy: ProbePolicy, timing: StreamTiming) -> Result<Vec<Kraken>> {
    let candidates: Vec<DeviceCandidate> = bus
        .devices(VENDOR_ID)?
        .into_iter()
        .filter(|info| {
            let known = KrakenModel::from_product_id(info.product_id).is_some();
            if !known {
                trace!("Ignoring NZXT device {:04X} at {}", info.product_id, info.path);
            }
            known
        })
        .map(DeviceCandidate::Hid)
        .collect();

    let validated = validate_candidates(
        "Kraken",
        candidates,
        |candidate| match candidate {
            DeviceCandidate::Hid(info) => bus.open(info),
            other => Err(CoolwatchError::NotSupported(other.to_string())),
        },
        |_, transport| handshake(transport, policy),
    );

    let mut devices = Vec::new();
    for v in validated {
        let location = v.candidate.location();
        let Some(model) = v
            .candidate
            .usb_id()
            .and_then(|(_, pid)| KrakenModel::from_product_id(pid))
        else {
            continue;
        };
        match Kraken::new(location.clone(), v.transport, model, v.probe, timing) {
            Ok(device) => {
                info!(
                    "{} at {} (firmware {})",
                    model.name(),
                    location,
                    device.identity.firmware.as_deref().unwrap_or("unknown")
                );
                devices.push(device);
            }
            Err(e) => warn!("Could not start reader for {}: {}", location, e),
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MemoryTransport;

    fn status_frame(model_fan: bool) -> Vec<u8> {
        let mut frame = vec![0u8; REPORT_LEN];
        frame[..2].copy_from_slice(&STATUS_REPORT);
        frame[offsets::LIQUID_WHOLE] = 31;
        frame[offsets::LIQUID_TENTHS] = 5;
        frame[offsets::PUMP_RPM] = 0xC4;
        frame[offsets::PUMP_RPM + 1] = 0x09; // 2500
        frame[offsets::PUMP_DUTY] = 60;
        if model_fan {
            frame[offsets::FAN_RPM] = 0x20;
            frame[offsets::FAN_RPM + 1] = 0x03; // 800
            frame[offsets::FAN_DUTY] = 35;
        }
        frame
    }

    fn policy() -> ProbePolicy {
        ProbePolicy::new(Duration::from_millis(5), 4)
    }

    #[test]
    fn test_model_from_product_id() {
        assert_eq!(KrakenModel::from_product_id(0x2007), Some(KrakenModel::X3));
        assert_eq!(KrakenModel::from_product_id(0x2014), Some(KrakenModel::X3));
        assert_eq!(KrakenModel::from_product_id(0x3008), Some(KrakenModel::Z3));
        assert_eq!(KrakenModel::from_product_id(0x1714), None);
    }

    #[test]
    fn test_decode_z3_status() {
        let readout = decode(&status_frame(true), KrakenModel::Z3).unwrap();
        assert_eq!(readout.liquid, Some(31.5));
        assert_eq!(readout.pump_rpm, Some(2500.0));
        assert_eq!(readout.pump_duty, Some(60.0));
        assert_eq!(readout.fan_rpm, Some(800.0));
        assert_eq!(readout.fan_duty, Some(35.0));
    }

    #[test]
    fn test_decode_x3_ignores_fan_bytes() {
        let readout = decode(&status_frame(true), KrakenModel::X3).unwrap();
        assert_eq!(readout.fan_rpm, None);
        assert_eq!(readout.fan_duty, None);
    }

    #[test]
    fn test_decode_rejects_other_reports() {
        let mut frame = status_frame(false);
        frame[0] = 0x11;
        assert!(decode(&frame, KrakenModel::X3).is_err());
        assert!(decode(&STATUS_REPORT, KrakenModel::X3).is_err());
    }

    #[test]
    fn test_handshake_skips_status_and_reads_firmware() {
        let mut firmware = vec![0u8; REPORT_LEN];
        firmware[..2].copy_from_slice(&FIRMWARE_REPLY);
        firmware[offsets::FIRMWARE..offsets::FIRMWARE + 3].copy_from_slice(&[1, 2, 3]);

        let mut t = MemoryTransport::default();
        t.pending.extend(status_frame(false));
        let mut t = t.reply(&[]).reply(&[]).reply(&firmware);

        assert_eq!(handshake(&mut t, policy()).unwrap().as_deref(), Some("1.2.3"));
        assert_eq!(t.written.len(), 3);
        assert!(t.written.iter().all(|w| w.len() == REPORT_LEN));
        assert_eq!(&t.written[0][..5], &SET_INTERVAL);
    }

    #[test]
    fn test_handshake_without_reply_keeps_firmware_unknown() {
        let mut t = MemoryTransport::default();
        assert_eq!(handshake(&mut t, policy()).unwrap(), None);
    }
}
