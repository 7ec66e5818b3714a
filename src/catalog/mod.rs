//! Catalog - Built-in Camera Cell Definitions
//!
//! The key set registered at startup. A JSON catalog file (a list of
//! `CellSpec`) replaces the built-in set when `CATALOG_PATH` is configured.

use crate::error::{Error, Result};
use crate::permission::{Permission, PermissionSet};
use crate::protocol;
use crate::state_store::CellSpec;
use crate::validator::Validator;
use crate::value::Value;
use serde_json::json;
use std::path::Path;

/// Key constants
pub mod keys {
    // Image
    pub const BRIGHTNESS: &str = "brightness";
    pub const CONTRAST: &str = "contrast";
    pub const SATURATION: &str = "saturation";
    pub const SHARPNESS: &str = "sharpness";
    pub const EXPOSURE_MODE: &str = "exposure_mode";
    pub const EXPOSURE_TIME_US: &str = "exposure_time_us";
    pub const GAIN: &str = "gain";
    pub const WHITE_BALANCE: &str = "white_balance";
    pub const IR_CUT_FILTER: &str = "ir_cut_filter";
    pub const LIGHT_ENABLED: &str = "light_enabled";
    // Stream / recording
    pub const STREAM_RESOLUTION: &str = "stream_resolution";
    pub const STREAM_FPS: &str = "stream_fps";
    pub const RECORDING_ENABLED: &str = "recording_enabled";
    // Storage
    pub const STORAGE_RETENTION_DAYS: &str = "storage_retention_days";
    pub const STORAGE_USED_PERCENT: &str = "storage_used_percent";
    // Network
    pub const HOSTNAME: &str = "hostname";
    pub const NETWORK_CONFIG: &str = "network_config";
    // System
    pub const FIRMWARE_VERSION: &str = "firmware_version";
    pub const DEVICE_NAME: &str = "device_name";
    pub const REBOOT_REQUESTED: &str = "reboot_requested";
}

fn pair(read: Permission, write: Permission) -> (PermissionSet, PermissionSet) {
    (PermissionSet::of(&[read, write]), PermissionSet::of(&[write]))
}

fn device(spec: CellSpec) -> CellSpec {
    let (read, write) = pair(Permission::DeviceRead, Permission::DeviceWrite);
    spec.readable_by(read).writable_by(write)
}

fn media(spec: CellSpec) -> CellSpec {
    let (read, write) = pair(Permission::MediaRead, Permission::MediaWrite);
    spec.readable_by(read).writable_by(write)
}

fn storage(spec: CellSpec) -> CellSpec {
    let (read, write) = pair(Permission::StorageRead, Permission::StorageWrite);
    spec.readable_by(read).writable_by(write)
}

fn network(spec: CellSpec) -> CellSpec {
    let (read, write) = pair(Permission::NetworkRead, Permission::NetworkWrite);
    spec.readable_by(read).writable_by(write)
}

/// Built-in camera controller cells, in registration order
pub fn builtin() -> Vec<CellSpec> {
    use keys::*;

    let network_default = match json!({"dhcp": true, "address": "", "gateway": "", "dns": []}) {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    vec![
        device(CellSpec::new(BRIGHTNESS, 50, Validator::int_range(0, 100)).persistent()),
        device(CellSpec::new(CONTRAST, 50, Validator::int_range(0, 100)).persistent()),
        device(CellSpec::new(SATURATION, 50, Validator::int_range(0, 100)).persistent()),
        device(CellSpec::new(SHARPNESS, 50, Validator::int_range(0, 100)).persistent()),
        device(
            CellSpec::new(EXPOSURE_MODE, "auto", Validator::one_of(&["auto", "manual", "shutter_priority"]))
                .persistent(),
        ),
        device(CellSpec::new(EXPOSURE_TIME_US, 10_000, Validator::int_range(30, 1_000_000)).persistent()),
        device(CellSpec::new(GAIN, 1.0, Validator::float_range(1.0, 16.0)).persistent()),
        device(
            CellSpec::new(
                WHITE_BALANCE,
                "auto",
                Validator::one_of(&["auto", "daylight", "cloudy", "tungsten", "fluorescent"]),
            )
            .persistent(),
        ),
        device(CellSpec::new(IR_CUT_FILTER, "auto", Validator::one_of(&["auto", "day", "night"])).persistent()),
        device(CellSpec::new(LIGHT_ENABLED, false, Validator::bool())),
        media(
            CellSpec::new(STREAM_RESOLUTION, "1920x1080", Validator::one_of(&["640x480", "1280x720", "1920x1080"]))
                .persistent(),
        ),
        media(CellSpec::new(STREAM_FPS, 30, Validator::int_range(1, 60)).persistent()),
        media(CellSpec::new(RECORDING_ENABLED, false, Validator::bool()).persistent()),
        storage(CellSpec::new(STORAGE_RETENTION_DAYS, 7, Validator::int_range(1, 365)).persistent()),
        // Reported by the storage monitor; nobody writes it over the wire
        CellSpec::new(STORAGE_USED_PERCENT, 0.0, Validator::float_range(0.0, 100.0))
            .readable_by(PermissionSet::of(&[Permission::StorageRead, Permission::SystemRead])),
        network(CellSpec::new(HOSTNAME, "camera", Validator::string().with_max_len(63)).persistent()),
        network(CellSpec::new(NETWORK_CONFIG, Value::Map(network_default), Validator::map()).persistent()),
        CellSpec::new(FIRMWARE_VERSION, env!("CARGO_PKG_VERSION"), Validator::string())
            .readable_by(PermissionSet::of(&[
                Permission::FirmwareRead,
                Permission::FirmwareWrite,
                Permission::SystemRead,
            ]))
            .writable_by(PermissionSet::of(&[Permission::FirmwareWrite])),
        CellSpec::new(DEVICE_NAME, "Camera", Validator::string().with_max_len(64))
            .persistent()
            .readable_by(PermissionSet::all_read())
            .writable_by(PermissionSet::of(&[Permission::DeviceWrite, Permission::SystemReboot])),
        CellSpec::new(REBOOT_REQUESTED, false, Validator::bool())
            .readable_by(PermissionSet::of(&[Permission::SystemRead, Permission::SystemReboot]))
            .writable_by(PermissionSet::of(&[Permission::SystemReboot])),
    ]
}

/// Load a catalog file (JSON list of cell specs)
pub async fn load_file(path: &Path) -> Result<Vec<CellSpec>> {
    let text = tokio::fs::read_to_string(path).await?;
    let specs: Vec<CellSpec> = serde_json::from_str(&text)?;
    if specs.is_empty() {
        return Err(Error::Config(format!("catalog {} defines no cells", path.display())));
    }
    if let Some(spec) = specs.iter().find(|spec| protocol::is_reserved(&spec.key)) {
        return Err(Error::Config(format!(
            "catalog {}: '{}' is a reserved reply key",
            path.display(),
            spec.key
        )));
    }

    tracing::info!(path = %path.display(), cells = specs.len(), "Catalog file loaded");
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::StateStore;
    use crate::value::ValueKind;
    use std::io::Write;

    #[test]
    fn test_builtin_registers() {
        let mut builder = StateStore::builder();
        builder.register_all(builtin()).unwrap();
        let store = builder.build();
        assert_eq!(store.len(), builtin().len());
        assert_eq!(store.keys()[0], keys::BRIGHTNESS);
    }

    #[test]
    fn test_builtin_avoids_reserved_keys() {
        assert!(builtin().iter().all(|spec| !protocol::is_reserved(&spec.key)));
    }

    #[test]
    fn test_brightness_definition() {
        let specs = builtin();
        let brightness = specs.iter().find(|s| s.key == keys::BRIGHTNESS).unwrap();

        assert!(brightness.persistent);
        assert_eq!(brightness.validator.kind, ValueKind::Int);
        assert!(brightness.validator.validate(&Value::Int(150)).is_err());
        assert!(brightness.read_permissions.contains(Permission::DeviceRead));
        assert!(brightness.read_permissions.contains(Permission::DeviceWrite));
        assert_eq!(
            brightness.write_permissions,
            PermissionSet::of(&[Permission::DeviceWrite])
        );
    }

    #[tokio::test]
    async fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{
                "key": "zoom",
                "default": 1,
                "persistent": true,
                "read_permissions": ["device_read"],
                "write_permissions": ["device_write"],
                "validator": {{"kind": "int", "min": 1, "max": 10}}
            }}]"#
        )
        .unwrap();

        let specs = load_file(file.path()).await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].default, Value::Int(1));
        assert!(specs[0].write_permissions.contains(Permission::DeviceWrite));
    }

    #[tokio::test]
    async fn test_load_empty_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[]").unwrap();
        assert!(matches!(load_file(file.path()).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_reserved_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"key": "subscribed", "default": true, "validator": {{"kind": "bool"}}}}]"#
        )
        .unwrap();
        assert!(matches!(load_file(file.path()).await, Err(Error::Config(_))));
    }
}
