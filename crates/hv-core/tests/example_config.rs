//! The shipped example settings stay loadable.

use hv_core::HvSettings;
use std::path::Path;

#[test]
fn example_settings_load_and_validate() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/hv.example.toml");
    let settings = HvSettings::load(&path).unwrap();

    assert_eq!(settings.devices.len(), 3);
    for device in &settings.devices {
        device.validate().unwrap();
    }

    let models: Vec<&str> = settings.devices.iter().map(|d| d.model.as_str()).collect();
    assert_eq!(models, ["2410", "6517B", "sim"]);
    assert!(!settings.devices[1].allow_detached);
    assert!(settings.devices[0].rear_output);
}
