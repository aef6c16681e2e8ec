//! Catalog conversion: specs become OSB services with JSON schemas.
//!
//! Plan parameters are declared in the bundle's own vocabulary; here
//! they turn into draft-04 JSON schema documents for the instance
//! create/update and binding create operations. A spec whose parameters
//! cannot be expressed is left out of the catalog rather than failing
//! the whole response.

use serde_json::{Map, Value, json};

use qm_core::{ParameterDescriptor, Plan, Spec};

use crate::types::{Service, ServicePlan};

const SCHEMA_DRAFT: &str = "http://json-schema.org/draft-04/schema";

/// Convert a spec into a catalog service entry.
pub fn spec_to_service(spec: &Spec) -> Result<Service, String> {
    let mut plans = Vec::with_capacity(spec.plans.len());
    for plan in &spec.plans {
        plans.push(ServicePlan {
            id: plan.id.clone(),
            name: plan.name.clone(),
            description: plan.description.clone(),
            metadata: plan.metadata.clone(),
            free: plan.free,
            bindable: plan.bindable,
            updates_to: plan.updates_to.clone(),
            schemas: plan_schemas(plan)?,
        });
    }

    Ok(Service {
        name: spec.fq_name.clone(),
        id: spec.id.clone(),
        description: spec.description.clone(),
        tags: spec.tags.clone(),
        bindable: spec.bindable,
        metadata: spec.metadata.clone(),
        plan_updateable: spec.plans.iter().any(|p| !p.updates_to.is_empty()),
        plans,
    })
}

/// Schemas for one plan: instance create/update and binding create.
/// The update schema carries only the updatable subset.
pub fn plan_schemas(plan: &Plan) -> Result<Value, String> {
    Ok(json!({
        "service_instance": {
            "create": { "parameters": object_schema(&plan.parameters, false)? },
            "update": { "parameters": object_schema(&plan.parameters, true)? },
        },
        "service_binding": {
            "create": { "parameters": object_schema(&plan.bind_parameters, false)? },
        },
    }))
}

fn object_schema(params: &[ParameterDescriptor], updatable_only: bool) -> Result<Value, String> {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        if updatable_only && !param.updatable {
            continue;
        }
        properties.insert(param.name.clone(), property_schema(param)?);
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }
    Ok(json!({
        "$schema": SCHEMA_DRAFT,
        "type": "object",
        "properties": properties,
        "required": required,
    }))
}

fn property_schema(param: &ParameterDescriptor) -> Result<Value, String> {
    let mut schema = Map::new();
    if !param.title.is_empty() {
        schema.insert("title".to_string(), json!(param.title));
    }
    if !param.description.is_empty() {
        schema.insert("description".to_string(), json!(param.description));
    }
    schema.insert("type".to_string(), json!(json_type(&param.param_type)?));
    if let Some(default) = &param.default {
        schema.insert("default".to_string(), default.clone());
    }
    // The deprecated `maxlength` spelling still appears in old bundles.
    if let Some(max) = param.max_length.or(param.deprecated_maxlength) {
        schema.insert("maxLength".to_string(), json!(max));
    }
    if let Some(min) = param.min_length {
        schema.insert("minLength".to_string(), json!(min));
    }
    if !param.pattern.is_empty() {
        schema.insert("pattern".to_string(), json!(param.pattern));
    }
    if !param.enum_values.is_empty() {
        schema.insert("enum".to_string(), json!(param.enum_values));
    }
    if let Some(multiple_of) = param.multiple_of {
        schema.insert("multipleOf".to_string(), json!(multiple_of));
    }
    if let Some(max) = param.maximum {
        schema.insert("maximum".to_string(), json!(max));
    }
    if let Some(max) = param.exclusive_maximum {
        schema.insert("exclusiveMaximum".to_string(), json!(max));
    }
    if let Some(min) = param.minimum {
        schema.insert("minimum".to_string(), json!(min));
    }
    if let Some(min) = param.exclusive_minimum {
        schema.insert("exclusiveMinimum".to_string(), json!(min));
    }
    Ok(Value::Object(schema))
}

/// Map a bundle parameter type onto a JSON schema type.
fn json_type(param_type: &str) -> Result<&'static str, String> {
    match param_type.to_lowercase().as_str() {
        "string" | "enum" | "" => Ok("string"),
        "int" | "integer" => Ok("integer"),
        "object" => Ok("object"),
        "array" => Ok("array"),
        "bool" | "boolean" => Ok("boolean"),
        "number" | "float" => Ok("number"),
        "nil" | "null" => Ok("null"),
        unknown => Err(format!("unknown parameter type '{unknown}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> Plan {
        Plan {
            id: "plan-1".to_string(),
            name: "dev".to_string(),
            description: "dev plan".to_string(),
            parameters: vec![
                ParameterDescriptor {
                    name: "owner".to_string(),
                    title: "Owner".to_string(),
                    param_type: "string".to_string(),
                    required: true,
                    max_length: Some(63),
                    pattern: "^[a-z]+$".to_string(),
                    ..Default::default()
                },
                ParameterDescriptor {
                    name: "size".to_string(),
                    param_type: "int".to_string(),
                    default: Some(json!(1)),
                    minimum: Some(1.0),
                    maximum: Some(10.0),
                    updatable: true,
                    ..Default::default()
                },
                ParameterDescriptor {
                    name: "flavour".to_string(),
                    param_type: "enum".to_string(),
                    enum_values: vec!["small".to_string(), "large".to_string()],
                    ..Default::default()
                },
            ],
            bind_parameters: vec![ParameterDescriptor {
                name: "role".to_string(),
                param_type: "string".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn create_schema_carries_all_parameters() {
        let schemas = plan_schemas(&plan()).unwrap();
        let create = &schemas["service_instance"]["create"]["parameters"];
        assert_eq!(create["$schema"], SCHEMA_DRAFT);
        assert_eq!(create["properties"]["owner"]["type"], "string");
        assert_eq!(create["properties"]["owner"]["maxLength"], 63);
        assert_eq!(create["properties"]["owner"]["pattern"], "^[a-z]+$");
        assert_eq!(create["properties"]["size"]["type"], "integer");
        assert_eq!(create["properties"]["size"]["default"], 1);
        assert_eq!(create["properties"]["size"]["minimum"], 1.0);
        assert_eq!(create["properties"]["flavour"]["enum"], json!(["small", "large"]));
        assert_eq!(create["required"], json!(["owner"]));
    }

    #[test]
    fn update_schema_keeps_only_updatable_parameters() {
        let schemas = plan_schemas(&plan()).unwrap();
        let update = &schemas["service_instance"]["update"]["parameters"];
        let properties = update["properties"].as_object().unwrap();
        assert_eq!(properties.len(), 1);
        assert!(properties.contains_key("size"));
        assert_eq!(update["required"], json!([]));
    }

    #[test]
    fn binding_schema_uses_bind_parameters() {
        let schemas = plan_schemas(&plan()).unwrap();
        let create = &schemas["service_binding"]["create"]["parameters"];
        assert!(create["properties"].as_object().unwrap().contains_key("role"));
    }

    #[test]
    fn unknown_parameter_type_is_an_error() {
        let mut bad = plan();
        bad.parameters[0].param_type = "widget".to_string();
        assert!(plan_schemas(&bad).is_err());
    }

    #[test]
    fn service_conversion_flags_plan_updateability() {
        let spec = Spec {
            id: "spec-1".to_string(),
            fq_name: "dh-mediawiki-apb".to_string(),
            description: "wiki".to_string(),
            bindable: true,
            plans: vec![
                Plan {
                    updates_to: vec!["prod".to_string()],
                    ..plan()
                },
                Plan {
                    id: "plan-2".to_string(),
                    name: "prod".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let service = spec_to_service(&spec).unwrap();
        assert_eq!(service.id, "spec-1");
        assert_eq!(service.name, "dh-mediawiki-apb");
        assert!(service.plan_updateable);
        assert!(service.bindable);
        assert_eq!(service.plans.len(), 2);
    }
}
