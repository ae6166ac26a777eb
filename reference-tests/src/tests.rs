//! Reference tests runnable through cargo test.

use crate::{fof_recovery_test, fof_scenario, hop_recovery_test, round_trip_test};

#[test]
fn test_fof_clump_recovery() {
    let result = fof_recovery_test().run().expect("Test execution failed");
    result.print_summary();
    assert!(result.passed, "FOF clump recovery test failed");
}

#[test]
fn test_hop_clump_recovery() {
    let result = hop_recovery_test().run().expect("Test execution failed");
    result.print_summary();
    assert!(result.passed, "HOP clump recovery test failed");
}

#[test]
fn test_catalog_round_trip() {
    let result = round_trip_test().run().expect("Test execution failed");
    result.print_summary();
    assert!(result.passed, "Catalog round trip test failed");
}

#[test]
fn scenario_is_reproducible() {
    let a = fof_scenario().particles();
    let b = fof_scenario().particles();
    assert_eq!(a.len(), 920);
    assert_eq!(a.x, b.x);
    assert_eq!(a.index, b.index);
}

#[test]
fn missing_config_is_reported() {
    let mut test = fof_recovery_test();
    test.config_path = "configs/does-not-exist.json".to_string();
    assert!(test.run().is_err());
}
