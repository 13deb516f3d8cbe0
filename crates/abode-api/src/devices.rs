// Wire models for the device REST surface.
//
// The device list endpoint returns heterogeneous records discriminated by
// `type_tag`. Only the lock fields are modeled explicitly; everything else
// the service sends lands in `extra`.

use serde::{Deserialize, Serialize};

/// `type_tag` value identifying a door lock.
pub const DEVICE_TYPE_DOOR_LOCK: &str = "device_type.door_lock";

/// A device record from `GET /api/v1/devices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub type_tag: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Lock status string (`LockOpen` / `LockClosed`) when this is a lock.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub faults: Option<LockFaults>,
    /// Catch-all for undocumented fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    pub fn is_lock(&self) -> bool {
        self.type_tag == DEVICE_TYPE_DOOR_LOCK
    }

    /// Parse the status string for lock devices.
    pub fn lock_status(&self) -> Option<LockStatus> {
        match self.status.as_deref() {
            Some("LockOpen") => Some(LockStatus::Unlocked),
            Some("LockClosed") => Some(LockStatus::Locked),
            _ => None,
        }
    }
}

/// Reported lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    #[serde(rename = "LockOpen")]
    Unlocked,
    #[serde(rename = "LockClosed")]
    Locked,
}

/// Fault flags reported on lock devices. Non-zero means faulted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LockFaults {
    #[serde(default)]
    pub low_battery: i32,
    #[serde(default)]
    pub jammed: i32,
}

/// A lock control command. The control endpoint takes the integer form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Unlock,
    Lock,
}

impl LockAction {
    /// Integer status the control endpoint expects: 0 unlock, 1 lock.
    pub fn status_code(self) -> u8 {
        match self {
            Self::Unlock => 0,
            Self::Lock => 1,
        }
    }
}

/// Response from `PUT /api/v1/control/lock/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlLockResponse {
    pub id: String,
    /// Echo of the requested integer status.
    pub status: u8,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_lock_device() {
        let raw = json!({
            "id": "ZW:0000a1",
            "type_tag": "device_type.door_lock",
            "name": "Front Door",
            "status": "LockClosed",
            "faults": { "low_battery": 0, "jammed": 1 },
            "battery": 80
        });

        let device: Device = serde_json::from_value(raw).unwrap();
        assert!(device.is_lock());
        assert_eq!(device.lock_status(), Some(LockStatus::Locked));
        assert_eq!(device.faults.unwrap().jammed, 1);
        assert_eq!(device.extra["battery"], 80);
    }

    #[test]
    fn non_lock_device() {
        let raw = json!({
            "id": "RF:0000b2",
            "type_tag": "device_type.door_contact",
            "status": "Closed"
        });

        let device: Device = serde_json::from_value(raw).unwrap();
        assert!(!device.is_lock());
        assert_eq!(device.lock_status(), None);
    }

    #[test]
    fn lock_action_status_codes() {
        assert_eq!(LockAction::Unlock.status_code(), 0);
        assert_eq!(LockAction::Lock.status_code(), 1);
    }
}
