//! Display outputs (connectors)
//!
//! Connector naming, connection detection, mode lists, EDID blob retrieval,
//! DPMS, and the range/enum connector properties exposed to the host.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use tracing::{debug, error, warn};

use super::display_pipe::{DisplayMode, ModeType};
use super::drm::{ConnectionStatus, ConnectorInfo, DrmDevice, DrmModeInfo, PropertyEnum, PropertyFlags, PropertyInfo};
use crate::util::{KResult, KmsError};

/// Connector type names indexed by DRM connector type
pub const OUTPUT_NAMES: [&str; 15] = [
    "None", "VGA", "DVI-I", "DVI-D", "DVI-A", "Composite", "SVIDEO", "LVDS", "CTV", "DIN", "DP", "HDMI", "HDMI",
    "TV", "eDP",
];

pub fn connector_name(connector_type: u32, type_id: u32) -> String {
    match OUTPUT_NAMES.get(connector_type as usize) {
        Some(name) => format!("{}-{}", name, type_id),
        None => format!("Unknown{}-{}", connector_type, type_id),
    }
}

/// DPMS power levels (values of the standard "DPMS" enum property)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DpmsMode {
    On = 0,
    Standby = 1,
    Suspend = 2,
    Off = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Range { min: u64, max: u64 },
    Enum(Vec<PropertyEnum>),
}

/// A connector property the host may read or change.
#[derive(Debug, Clone)]
pub struct OutputProperty {
    pub id: u32,
    pub name: String,
    pub kind: PropertyKind,
    pub immutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int(u64),
    Enum(String),
}

fn property_ignored(prop: &PropertyInfo) -> bool {
    prop.flags.contains(PropertyFlags::BLOB) || prop.name == "EDID" || prop.name == "DPMS"
}

#[derive(Debug)]
pub struct Output {
    pub connector_id: u32,
    pub name: String,
    pub status: ConnectionStatus,
    /// CRTC index this output is routed to
    pub crtc: Option<usize>,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    info: ConnectorInfo,
    properties: Vec<OutputProperty>,
}

impl Output {
    /// Reads a connector and its first encoder.
    pub fn probe(dev: &dyn DrmDevice, connector_id: u32) -> KResult<Self> {
        let info = dev.get_connector(connector_id)?;
        let encoder_id = info.encoders.first().copied().ok_or_else(|| KmsError::Property {
            name: connector_name(info.connector_type, info.connector_type_id),
            reason: "connector has no encoder",
        })?;
        let encoder = dev.get_encoder(encoder_id)?;
        let name = connector_name(info.connector_type, info.connector_type_id);

        let mut output = Self {
            connector_id,
            name,
            status: info.connection,
            crtc: None,
            possible_crtcs: encoder.possible_crtcs,
            possible_clones: encoder.possible_clones,
            mm_width: info.mm_width,
            mm_height: info.mm_height,
            info,
            properties: Vec::new(),
        };
        output.create_resources(dev);
        debug!("output: {} (connector {}) {:?}, possible crtcs {:#x}",
            output.name, connector_id, output.status, output.possible_crtcs);
        Ok(output)
    }

    fn create_resources(&mut self, dev: &dyn DrmDevice) {
        self.properties.clear();
        for &(prop_id, _) in &self.info.props {
            let prop = match dev.get_property(prop_id) {
                Ok(p) => p,
                Err(e) => {
                    warn!("output: {}: property {} unreadable: {}", self.name, prop_id, e);
                    continue;
                }
            };
            if property_ignored(&prop) {
                continue;
            }
            let kind = if prop.flags.contains(PropertyFlags::RANGE) {
                let min = prop.values.first().copied().unwrap_or(0);
                let max = prop.values.get(1).copied().unwrap_or(u64::MAX);
                PropertyKind::Range { min, max }
            } else if prop.flags.contains(PropertyFlags::ENUM) {
                PropertyKind::Enum(prop.enums.clone())
            } else {
                continue;
            };
            self.properties.push(OutputProperty {
                id: prop.id,
                name: prop.name,
                kind,
                immutable: prop.flags.contains(PropertyFlags::IMMUTABLE),
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn can_drive(&self, crtc_index: usize) -> bool {
        crtc_index < 32 && self.possible_crtcs & (1 << crtc_index) != 0
    }

    /// Re-reads the connector from the device.
    pub fn detect(&mut self, dev: &dyn DrmDevice) -> KResult<ConnectionStatus> {
        self.info = dev.get_connector(self.connector_id)?;
        self.status = self.info.connection;
        Ok(self.status)
    }

    pub fn modes(&self) -> Vec<DisplayMode> {
        self.info.modes.iter().map(DrmModeInfo::to_display_mode).collect()
    }

    pub fn preferred_mode(&self) -> Option<DisplayMode> {
        let modes = self.modes();
        modes
            .iter()
            .find(|m| m.mode_type.contains(ModeType::PREFERRED))
            .or_else(|| modes.first())
            .cloned()
    }

    /// Default (non-probed) modes are never offered for this hardware.
    pub fn mode_valid(&self, mode: &DisplayMode) -> bool {
        !mode.mode_type.contains(ModeType::DEFAULT)
    }

    fn find_prop(&self, dev: &dyn DrmDevice, name: &str, flag: PropertyFlags) -> Option<(u32, u64)> {
        self.info.props.iter().copied().find(|&(id, _)| match dev.get_property(id) {
            Ok(p) => p.flags.contains(flag) && p.name == name,
            Err(_) => false,
        })
    }

    /// Raw EDID blob, if the connector exposes one.
    pub fn edid(&self, dev: &dyn DrmDevice) -> KResult<Option<Vec<u8>>> {
        match self.find_prop(dev, "EDID", PropertyFlags::BLOB) {
            Some((_, blob_id)) if blob_id != 0 => Ok(Some(dev.get_property_blob(blob_id as u32)?)),
            _ => Ok(None),
        }
    }

    /// Sets the DPMS level. Connectors without the property are left alone.
    pub fn set_dpms(&self, dev: &dyn DrmDevice, mode: DpmsMode) -> KResult<()> {
        let Some((prop_id, _)) = self.find_prop(dev, "DPMS", PropertyFlags::ENUM) else {
            return Ok(());
        };
        dev.set_connector_property(self.connector_id, prop_id, mode as u64).map_err(|e| {
            error!("output: {}: DPMS {:?} failed: {}", self.name, mode, e);
            KmsError::from(e)
        })
    }

    pub fn properties(&self) -> &[OutputProperty] {
        &self.properties
    }

    fn property(&self, name: &str) -> KResult<&OutputProperty> {
        self.properties.iter().find(|p| p.name == name).ok_or_else(|| KmsError::Property {
            name: String::from(name),
            reason: "no such property",
        })
    }

    /// Writes a range value or an enum entry by name.
    pub fn set_property(&self, dev: &dyn DrmDevice, name: &str, value: &PropertyValue) -> KResult<()> {
        let prop = self.property(name)?;
        let bad = |reason| KmsError::Property { name: String::from(name), reason };

        let raw = match (&prop.kind, value) {
            (PropertyKind::Range { min, max }, PropertyValue::Int(v)) => {
                if v < min || v > max {
                    return Err(bad("value out of range"));
                }
                *v
            }
            (PropertyKind::Enum(enums), PropertyValue::Enum(s)) => {
                enums.iter().find(|e| e.name == *s).map(|e| e.value).ok_or_else(|| bad("unknown enum value"))?
            }
            _ => return Err(bad("value has the wrong type")),
        };

        dev.set_connector_property(self.connector_id, prop.id, raw)?;
        debug!("output: {}: {} = {:?}", self.name, name, value);
        Ok(())
    }

    /// Current value, re-read from the device.
    pub fn get_property(&mut self, dev: &dyn DrmDevice, name: &str) -> KResult<PropertyValue> {
        self.info = dev.get_connector(self.connector_id)?;
        let prop = self.property(name)?;
        let raw = self
            .info
            .props
            .iter()
            .find(|&&(id, _)| id == prop.id)
            .map(|&(_, v)| v)
            .ok_or_else(|| KmsError::Property { name: String::from(name), reason: "no longer on the connector" })?;

        match &prop.kind {
            PropertyKind::Range { .. } => Ok(PropertyValue::Int(raw)),
            PropertyKind::Enum(enums) => enums
                .iter()
                .find(|e| e.value == raw)
                .map(|e| PropertyValue::Enum(e.name.clone()))
                .ok_or_else(|| KmsError::Property { name: String::from(name), reason: "value matches no enum entry" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::vkms::{VirtualDrm, DPMS_PROP_ID, EDID_PROP_ID};

    #[test]
    fn test_connector_names() {
        assert_eq!(connector_name(11, 1), "HDMI-1");
        assert_eq!(connector_name(12, 2), "HDMI-2");
        assert_eq!(connector_name(14, 1), "eDP-1");
        assert_eq!(connector_name(0, 3), "None-3");
        assert_eq!(connector_name(20, 1), "Unknown20-1");
    }

    fn drm() -> VirtualDrm {
        VirtualDrm::builder().crtcs(2).connector(11, 1920, 1080).connector(14, 1280, 1024).build()
    }

    #[test]
    fn test_probe_and_properties() {
        let drm = drm();
        let conn = drm.connector_ids()[0];
        let out = Output::probe(&drm, conn).unwrap();
        assert_eq!(out.name, "HDMI-1");
        assert!(out.is_connected());
        assert!(out.can_drive(0) && out.can_drive(1));
        assert!(out.properties().iter().all(|p| p.name != "DPMS" && p.name != "EDID"));
        assert!(out.properties().iter().any(|p| p.name == "scaling mode"));
        assert_eq!(out.preferred_mode().unwrap().hdisplay, 1920);
    }

    #[test]
    fn test_mode_valid_rejects_default() {
        let drm = drm();
        let out = Output::probe(&drm, drm.connector_ids()[0]).unwrap();
        let mut mode = DisplayMode::new(800, 600, 60);
        assert!(out.mode_valid(&mode));
        mode.mode_type |= ModeType::DEFAULT;
        assert!(!out.mode_valid(&mode));
    }

    #[test]
    fn test_set_and_get_property() {
        let drm = drm();
        let mut out = Output::probe(&drm, drm.connector_ids()[0]).unwrap();
        out.set_property(&drm, "scaling mode", &PropertyValue::Enum(String::from("Full"))).unwrap();
        assert_eq!(out.get_property(&drm, "scaling mode").unwrap(), PropertyValue::Enum(String::from("Full")));

        out.set_property(&drm, "brightness", &PropertyValue::Int(40)).unwrap();
        assert_eq!(out.get_property(&drm, "brightness").unwrap(), PropertyValue::Int(40));

        assert!(out.set_property(&drm, "brightness", &PropertyValue::Int(1000)).is_err());
        assert!(out.set_property(&drm, "scaling mode", &PropertyValue::Int(1)).is_err());
        assert!(out.set_property(&drm, "scaling mode", &PropertyValue::Enum(String::from("Sideways"))).is_err());
        assert!(out.set_property(&drm, "missing", &PropertyValue::Int(1)).is_err());
    }

    #[test]
    fn test_dpms_and_edid() {
        let drm = drm();
        let conn = drm.connector_ids()[0];
        let mut out = Output::probe(&drm, conn).unwrap();
        out.set_dpms(&drm, DpmsMode::Off).unwrap();
        assert_eq!(drm.connector_property(conn, DPMS_PROP_ID), Some(DpmsMode::Off as u64));

        let edid = out.edid(&drm).unwrap().unwrap();
        assert_eq!(&edid[..8], &[0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00]);
        assert!(drm.connector_property(conn, EDID_PROP_ID).is_some());

        drm.set_connection(conn, ConnectionStatus::Disconnected);
        assert_eq!(out.detect(&drm).unwrap(), ConnectionStatus::Disconnected);
        assert!(out.modes().is_empty());
    }
}
