use serde_json::json;

use super::*;

#[test]
fn result_builder_success() {
	let result: CommandResult<serde_json::Value> = ResultBuilder::new("send-message")
		.data(json!({ "id": "msg-0" }))
		.build();

	assert!(result.ok);
	assert_eq!(result.command, "send-message");
	assert_eq!(result.schema_version, Some(SCHEMA_VERSION));
	assert!(result.error.is_none());
	assert!(result.timings.is_some());
}

#[test]
fn result_builder_error() {
	let result: CommandResult<()> = ResultBuilder::new("send-file")
		.error(CommandError {
			code: ErrorCode::Timeout,
			message: "Transfer sid-1 did not complete within 30000ms".into(),
			details: None,
		})
		.build();

	assert!(!result.ok);
	assert!(result.data.is_none());
	assert_eq!(result.error.as_ref().unwrap().code, ErrorCode::Timeout);
}

#[test]
fn result_without_data_is_not_ok() {
	let result: CommandResult<()> = ResultBuilder::new("resolve").build();
	assert!(!result.ok);
}

#[test]
fn error_code_display_matches_serde() {
	for code in [ErrorCode::ConfigError, ErrorCode::RemoteError, ErrorCode::Interrupted] {
		let serialized = serde_json::to_value(code).unwrap();
		assert_eq!(serialized, json!(code.to_string()));
	}
}

#[test]
fn serialize_envelope_in_camel_case() {
	let result: CommandResult<serde_json::Value> = ResultBuilder::new("resolve")
		.data(json!({ "resolved": "bob@example.org/laptop" }))
		.build();

	let value = serde_json::to_value(&result).unwrap();
	assert_eq!(value["ok"], true);
	assert_eq!(value["schemaVersion"], 1);
	assert!(value["timings"]["durationMs"].is_u64());
	assert_eq!(value["data"]["resolved"], "bob@example.org/laptop");
	assert!(value.get("error").is_none());
}

#[test]
fn output_format_display() {
	assert_eq!(OutputFormat::Ndjson.to_string(), "ndjson");
	assert_eq!(OutputFormat::default(), OutputFormat::Json);
}
