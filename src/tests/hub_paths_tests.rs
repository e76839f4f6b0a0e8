//! Tests for hub_paths module.

use super::*;
use serial_test::serial;
use tempfile::tempdir;

#[test]
#[serial]
fn test_home_env_override() {
    let dir = tempdir().unwrap();
    let home = dir.path().join("nested").join("hub");
    std::env::set_var(HOME_ENV, &home);

    assert_eq!(loghub_home_dir().unwrap(), home);
    assert!(home.is_dir());
    assert_eq!(port_path().unwrap(), home.join("daemon.json"));
    assert_eq!(network_configs_path().unwrap(), home.join("network.json"));
    assert_eq!(daemon_log_path().unwrap(), home.join("daemon.log"));

    std::env::remove_var(HOME_ENV);
}

#[test]
#[serial]
fn test_default_home_ends_with_loghub() {
    std::env::remove_var(HOME_ENV);
    if dirs::home_dir().is_some() {
        assert!(loghub_home_dir().unwrap().ends_with(".loghub"));
    }
}

#[test]
fn test_seed_is_created_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seed");

    let first = load_or_create_seed(&path).unwrap();
    let second = load_or_create_seed(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(fs::read_to_string(&path).unwrap().len(), 64);
}

#[test]
fn test_corrupt_seed_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seed");
    fs::write(&path, "zz").unwrap();
    assert!(load_or_create_seed(&path).is_err());
}
