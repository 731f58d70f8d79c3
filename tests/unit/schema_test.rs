//! Tests for parameter schemas and validation

use serde_json::json;

use task_balancer::core::{DefaultValidator, ParamSpec, ParamType, ParamsSchema, Validator};

fn rename_schema() -> ParamsSchema {
    ParamsSchema::new(vec![
        ParamSpec::required("dataset", ParamType::String),
        ParamSpec::required("new_name", ParamType::String),
        ParamSpec::optional("recursive", ParamType::Boolean),
    ])
}

#[test]
fn test_array_schema_bounds() {
    let rendered = rename_schema().to_array_schema();
    assert_eq!(rendered["type"], "array");
    assert_eq!(rendered["minItems"], 2);
    assert_eq!(rendered["maxItems"], 3);
    assert_eq!(rendered["items"][2]["type"], "boolean");
}

#[test]
fn test_schema_deserializes_from_list() {
    let schema: ParamsSchema = serde_json::from_value(json!([
        {"name": "pool", "type": "string", "mandatory": true},
        {"name": "force", "type": "boolean"}
    ]))
    .unwrap();
    assert_eq!(schema.min_items(), 1);
    assert_eq!(schema.max_items(), 2);
}

#[test]
fn test_valid_arguments() {
    let errors = DefaultValidator.validate(&rename_schema(), &[json!("tank/a"), json!("tank/b")]);
    assert!(errors.is_empty());
}

#[test]
fn test_missing_mandatory_argument() {
    let errors = DefaultValidator.validate(&rename_schema(), &[json!("tank/a")]);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "minItems");
    assert_eq!(errors[0].path, "1");
    assert!(errors[0].message.contains("new_name"));
}
