//! Sensor channel handler (spec.md §4.9, §6): only enabled sensor types
//! emit updates; everything else is dropped silently.

use std::collections::HashSet;

use crate::message::ChannelId;

/// spec.md §9's open question on sensor type codes is resolved here: the
/// enumerable set this engine recognizes by name, plus a wildcard so an
/// unrecognized id from a real peer doesn't panic the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorType {
    DrivingStatus,
    Location,
    Night,
    VehicleSpeed,
    Other(u16),
}

impl SensorType {
    pub fn from_u16(v: u16) -> SensorType {
        match v {
            1 => SensorType::Location,
            5 => SensorType::DrivingStatus,
            6 => SensorType::Night,
            10 => SensorType::VehicleSpeed,
            other => SensorType::Other(other),
        }
    }
}

pub struct SensorHandler {
    enabled: HashSet<SensorType>,
}

impl SensorHandler {
    pub fn new(enabled: impl IntoIterator<Item = SensorType>) -> Self {
        SensorHandler {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self, sensor: SensorType) -> bool {
        self.enabled.contains(&sensor)
    }

    /// Returns `Some(payload)` if the sensor update should be forwarded,
    /// `None` if it must be dropped silently (spec.md §4.9).
    pub fn filter_update(&self, sensor_type: u16, payload: Vec<u8>) -> Option<(ChannelId, Vec<u8>)> {
        let sensor = SensorType::from_u16(sensor_type);
        if self.is_enabled(sensor) {
            Some((ChannelId::SENSOR, payload))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sensor_is_dropped() {
        let handler = SensorHandler::new([SensorType::DrivingStatus]);
        assert!(handler.filter_update(1, vec![1, 2, 3]).is_none()); // Location disabled
        assert!(handler.filter_update(5, vec![1]).is_some()); // DrivingStatus enabled
    }

    #[test]
    fn unknown_sensor_id_does_not_panic() {
        let handler = SensorHandler::new([]);
        assert!(handler.filter_update(9999, vec![]).is_none());
    }
}
