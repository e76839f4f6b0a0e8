use super::*;

#[test]
fn test_port_file_parses() {
    let content = r#"{"port":4100,"events_port":4101,"pid":77,"started_at":"2026-01-02T03:04:05Z"}"#;
    let parsed: PortFileContent = serde_json::from_str(content).unwrap();
    assert_eq!(parsed.port, 4100);
    assert_eq!(parsed.events_port, 4101);
    assert_eq!(parsed.pid, 77);
    assert_eq!(parsed.started_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");
}

#[test]
fn test_port_file_missing_field_is_rejected() {
    let content = r#"{"port":4100,"pid":77}"#;
    assert!(serde_json::from_str::<PortFileContent>(content).is_err());
}
