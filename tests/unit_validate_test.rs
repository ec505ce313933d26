// tests/unit_validate_test.rs

use latzero::core::protocol::validate::{
    validate_app_id, validate_pool_name, validate_trigger_name,
};

#[test]
fn test_app_id_charset() {
    assert!(validate_app_id("my.App_01-x").is_ok());
    assert!(validate_app_id("").is_err());
    assert!(validate_app_id("has space").is_err());
    assert!(validate_app_id("emoji🚀").is_err());
    assert!(validate_app_id("slash/name").is_err());
}

#[test]
fn test_app_id_length_boundary() {
    assert!(validate_app_id(&"a".repeat(128)).is_ok());
    assert!(validate_app_id(&"a".repeat(129)).is_err());
}

#[test]
fn test_pool_name_length_boundary() {
    assert!(validate_pool_name(&"p".repeat(64)).is_ok());
    assert!(validate_pool_name(&"p".repeat(65)).is_err());
    assert!(validate_pool_name("default").is_ok());
}

#[test]
fn test_trigger_name_length_boundary() {
    assert!(validate_trigger_name(&"t".repeat(128)).is_ok());
    assert!(validate_trigger_name(&"t".repeat(129)).is_err());
    assert!(validate_trigger_name("echo").is_ok());
    assert!(validate_trigger_name("ns.echo-v2_final").is_ok());
}
