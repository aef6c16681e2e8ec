//! Bidirectional conversion between domain types and wire resources.
//!
//! Structural failures (unparseable embedded JSON) are errors; unknown
//! enum strings are not. Enums degrade to a conservative default with
//! a warning, so one bad record can never wedge a whole list read:
//! unknown async policy reads as `required`, unknown job state as
//! `failed`, unknown method as `provision`.

use std::collections::BTreeSet;

use tracing::warn;

use qm_core::{
    AsyncType, BindInstance, Context, JobMethod, JobState, Parameters, ParameterDescriptor, Plan,
    ServiceInstance, Spec, State,
};

use crate::wire::{
    BindInstanceResource, JobStateResource, ParameterResource, PlanResource,
    ServiceInstanceResource, SpecResource,
};
use crate::{DaoError, DaoResult};

type Metadata = std::collections::HashMap<String, serde_json::Value>;

// ── Embedded JSON helpers ─────────────────────────────────────────

fn metadata_to_string(metadata: &Metadata) -> DaoResult<String> {
    if metadata.is_empty() {
        return Ok(String::new());
    }
    serde_json::to_string(metadata).map_err(|e| DaoError::Conversion(e.to_string()))
}

fn metadata_from_string(raw: &str) -> DaoResult<Metadata> {
    if raw.is_empty() {
        return Ok(Metadata::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| DaoError::Conversion(format!("invalid embedded metadata: {e}")))
}

fn parameters_to_string(parameters: &Option<Parameters>) -> DaoResult<String> {
    match parameters {
        Some(p) => serde_json::to_string(p).map_err(|e| DaoError::Conversion(e.to_string())),
        None => Ok(String::new()),
    }
}

fn parameters_from_string(raw: &str) -> DaoResult<Option<Parameters>> {
    if raw.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| DaoError::Conversion(format!("invalid embedded parameters: {e}")))
}

// ── Enum mappings ─────────────────────────────────────────────────

fn async_type_to_string(value: AsyncType) -> String {
    value.to_string()
}

fn async_type_from_string(raw: &str) -> AsyncType {
    match raw {
        "optional" => AsyncType::Optional,
        "required" => AsyncType::Required,
        "unsupported" => AsyncType::Unsupported,
        other => {
            warn!(value = other, "unknown async type, defaulting to required");
            AsyncType::Required
        }
    }
}

fn state_from_string(raw: &str) -> State {
    match raw {
        "not yet started" => State::NotYetStarted,
        "in progress" => State::InProgress,
        "succeeded" => State::Succeeded,
        "failed" => State::Failed,
        other => {
            warn!(value = other, "unknown job state, defaulting to failed");
            State::Failed
        }
    }
}

fn method_from_string(raw: &str) -> JobMethod {
    match raw {
        "provision" => JobMethod::Provision,
        "deprovision" => JobMethod::Deprovision,
        "bind" => JobMethod::Bind,
        "unbind" => JobMethod::Unbind,
        "update" => JobMethod::Update,
        other => {
            warn!(value = other, "unknown job method, defaulting to provision");
            JobMethod::Provision
        }
    }
}

// ── Parameters ────────────────────────────────────────────────────

/// Wrapper shape for persisted parameter defaults.
#[derive(serde::Serialize, serde::Deserialize)]
struct DefaultWrapper {
    default: serde_json::Value,
}

fn parameter_to_resource(param: &ParameterDescriptor) -> DaoResult<ParameterResource> {
    let default = match &param.default {
        Some(value) => serde_json::to_string(&DefaultWrapper {
            default: value.clone(),
        })
        .map_err(|e| DaoError::Conversion(e.to_string()))?,
        None => String::new(),
    };
    Ok(ParameterResource {
        name: param.name.clone(),
        title: param.title.clone(),
        kind: param.param_type.clone(),
        description: param.description.clone(),
        default,
        deprecated_maxlength: param.deprecated_maxlength,
        max_length: param.max_length,
        min_length: param.min_length,
        pattern: param.pattern.clone(),
        multiple_of: param.multiple_of,
        maximum: param.maximum,
        exclusive_maximum: param.exclusive_maximum,
        minimum: param.minimum,
        exclusive_minimum: param.exclusive_minimum,
        enum_values: param.enum_values.clone(),
        required: param.required,
        updatable: param.updatable,
        display_type: param.display_type.clone(),
        display_group: param.display_group.clone(),
    })
}

fn parameter_from_resource(resource: &ParameterResource) -> DaoResult<ParameterDescriptor> {
    let default = if resource.default.is_empty() {
        None
    } else {
        let wrapper: DefaultWrapper = serde_json::from_str(&resource.default)
            .map_err(|e| DaoError::Conversion(format!("invalid parameter default: {e}")))?;
        Some(wrapper.default)
    };
    Ok(ParameterDescriptor {
        name: resource.name.clone(),
        title: resource.title.clone(),
        param_type: resource.kind.clone(),
        description: resource.description.clone(),
        default,
        deprecated_maxlength: resource.deprecated_maxlength,
        max_length: resource.max_length,
        min_length: resource.min_length,
        pattern: resource.pattern.clone(),
        multiple_of: resource.multiple_of,
        maximum: resource.maximum,
        exclusive_maximum: resource.exclusive_maximum,
        minimum: resource.minimum,
        exclusive_minimum: resource.exclusive_minimum,
        enum_values: resource.enum_values.clone(),
        required: resource.required,
        updatable: resource.updatable,
        display_type: resource.display_type.clone(),
        display_group: resource.display_group.clone(),
    })
}

// ── Plans & specs ─────────────────────────────────────────────────

fn plan_to_resource(plan: &Plan) -> DaoResult<PlanResource> {
    Ok(PlanResource {
        id: plan.id.clone(),
        name: plan.name.clone(),
        description: plan.description.clone(),
        metadata: metadata_to_string(&plan.metadata)?,
        free: plan.free,
        bindable: plan.bindable,
        updates_to: plan.updates_to.clone(),
        parameters: plan
            .parameters
            .iter()
            .map(parameter_to_resource)
            .collect::<DaoResult<_>>()?,
        bind_parameters: plan
            .bind_parameters
            .iter()
            .map(parameter_to_resource)
            .collect::<DaoResult<_>>()?,
    })
}

fn plan_from_resource(resource: &PlanResource) -> DaoResult<Plan> {
    Ok(Plan {
        id: resource.id.clone(),
        name: resource.name.clone(),
        description: resource.description.clone(),
        metadata: metadata_from_string(&resource.metadata)?,
        free: resource.free,
        bindable: resource.bindable,
        updates_to: resource.updates_to.clone(),
        parameters: resource
            .parameters
            .iter()
            .map(parameter_from_resource)
            .collect::<DaoResult<_>>()?,
        bind_parameters: resource
            .bind_parameters
            .iter()
            .map(parameter_from_resource)
            .collect::<DaoResult<_>>()?,
    })
}

pub fn spec_to_resource(spec: &Spec) -> DaoResult<SpecResource> {
    Ok(SpecResource {
        runtime: spec.runtime,
        version: spec.version.clone(),
        fq_name: spec.fq_name.clone(),
        image: spec.image.clone(),
        tags: spec.tags.clone(),
        bindable: spec.bindable,
        description: spec.description.clone(),
        metadata: metadata_to_string(&spec.metadata)?,
        alpha: metadata_to_string(&spec.alpha)?,
        async_type: async_type_to_string(spec.async_policy),
        plans: spec
            .plans
            .iter()
            .map(plan_to_resource)
            .collect::<DaoResult<_>>()?,
    })
}

pub fn spec_from_resource(id: &str, resource: &SpecResource) -> DaoResult<Spec> {
    Ok(Spec {
        id: id.to_string(),
        runtime: resource.runtime,
        version: resource.version.clone(),
        fq_name: resource.fq_name.clone(),
        image: resource.image.clone(),
        tags: resource.tags.clone(),
        bindable: resource.bindable,
        description: resource.description.clone(),
        metadata: metadata_from_string(&resource.metadata)?,
        alpha: metadata_from_string(&resource.alpha)?,
        async_policy: async_type_from_string(&resource.async_type),
        plans: resource
            .plans
            .iter()
            .map(plan_from_resource)
            .collect::<DaoResult<_>>()?,
    })
}

// ── Instances & bindings ──────────────────────────────────────────

pub fn service_instance_to_resource(
    instance: &ServiceInstance,
) -> DaoResult<ServiceInstanceResource> {
    Ok(ServiceInstanceResource {
        spec_id: instance.spec_id.clone(),
        platform: instance.context.platform.clone(),
        namespace: instance.context.namespace.clone(),
        parameters: parameters_to_string(&instance.parameters)?,
        dashboard_url: instance.dashboard_url.clone(),
        binding_ids: instance.binding_ids.iter().cloned().collect(),
    })
}

pub fn service_instance_from_resource(
    id: &str,
    resource: &ServiceInstanceResource,
) -> DaoResult<ServiceInstance> {
    Ok(ServiceInstance {
        id: id.to_string(),
        spec_id: resource.spec_id.clone(),
        context: Context {
            platform: resource.platform.clone(),
            namespace: resource.namespace.clone(),
        },
        parameters: parameters_from_string(&resource.parameters)?,
        dashboard_url: resource.dashboard_url.clone(),
        binding_ids: resource.binding_ids.iter().cloned().collect::<BTreeSet<_>>(),
    })
}

pub fn bind_instance_to_resource(binding: &BindInstance) -> DaoResult<BindInstanceResource> {
    Ok(BindInstanceResource {
        service_id: binding.service_id.clone(),
        parameters: parameters_to_string(&binding.parameters)?,
        create_job_key: binding.create_job_key.clone(),
    })
}

pub fn bind_instance_from_resource(
    id: &str,
    resource: &BindInstanceResource,
) -> DaoResult<BindInstance> {
    Ok(BindInstance {
        id: id.to_string(),
        service_id: resource.service_id.clone(),
        parameters: parameters_from_string(&resource.parameters)?,
        create_job_key: resource.create_job_key.clone(),
    })
}

// ── Job states ────────────────────────────────────────────────────

pub fn job_state_to_resource(job: &JobState) -> JobStateResource {
    JobStateResource {
        token: job.token.clone(),
        state: job.state.to_string(),
        method: job.method.to_string(),
        podname: job.podname.clone(),
        description: job.description.clone(),
        error: job.error.clone(),
        last_modified: job.last_modified,
    }
}

pub fn job_state_from_resource(resource: &JobStateResource) -> JobState {
    JobState {
        token: resource.token.clone(),
        state: state_from_string(&resource.state),
        method: method_from_string(&resource.method),
        podname: resource.podname.clone(),
        description: resource.description.clone(),
        error: resource.error.clone(),
        last_modified: resource.last_modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_spec() -> Spec {
        Spec {
            id: "spec-1".to_string(),
            runtime: 2,
            version: "1.0".to_string(),
            fq_name: "dh-postgresql-apb".to_string(),
            image: "docker.io/org/postgresql-apb:latest".to_string(),
            tags: vec!["database".to_string()],
            bindable: true,
            description: "PostgreSQL".to_string(),
            metadata: [("displayName".to_string(), json!("PostgreSQL"))]
                .into_iter()
                .collect(),
            alpha: [("dashboard_redirect".to_string(), json!(true))]
                .into_iter()
                .collect(),
            async_policy: AsyncType::Optional,
            plans: vec![Plan {
                id: "plan-1".to_string(),
                name: "dev".to_string(),
                description: "dev plan".to_string(),
                metadata: [("cost".to_string(), json!(0))].into_iter().collect(),
                free: true,
                bindable: true,
                updates_to: vec!["prod".to_string()],
                parameters: vec![ParameterDescriptor {
                    name: "postgresql_user".to_string(),
                    param_type: "string".to_string(),
                    default: Some(json!("admin")),
                    maximum: Some(63.0),
                    minimum: None,
                    required: true,
                    ..Default::default()
                }],
                bind_parameters: vec![],
            }],
        }
    }

    #[test]
    fn spec_round_trip_preserves_everything() {
        let spec = full_spec();
        let resource = spec_to_resource(&spec).unwrap();

        // Open maps travel as embedded JSON strings.
        assert!(resource.metadata.contains("displayName"));
        assert_eq!(resource.async_type, "optional");

        let back = spec_from_resource("spec-1", &resource).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn parameter_default_wrapped_and_unwrapped() {
        let param = ParameterDescriptor {
            name: "flag".to_string(),
            param_type: "boolean".to_string(),
            default: Some(json!(false)),
            ..Default::default()
        };
        let resource = parameter_to_resource(&param).unwrap();
        assert_eq!(resource.default, r#"{"default":false}"#);

        let back = parameter_from_resource(&resource).unwrap();
        assert_eq!(back.default, Some(json!(false)));
    }

    #[test]
    fn parameter_without_default_stays_unset() {
        let param = ParameterDescriptor {
            name: "n".to_string(),
            ..Default::default()
        };
        let resource = parameter_to_resource(&param).unwrap();
        assert!(resource.default.is_empty());
        let back = parameter_from_resource(&resource).unwrap();
        assert_eq!(back.default, None);
    }

    #[test]
    fn nilable_bounds_never_collapse_to_zero() {
        let spec = full_spec();
        let back =
            spec_from_resource("spec-1", &spec_to_resource(&spec).unwrap()).unwrap();
        let param = &back.plans[0].parameters[0];
        assert_eq!(param.maximum, Some(63.0));
        assert_eq!(param.minimum, None);
    }

    #[test]
    fn unknown_async_type_defaults_to_required() {
        let mut resource = spec_to_resource(&full_spec()).unwrap();
        resource.async_type = "sometimes".to_string();
        let back = spec_from_resource("spec-1", &resource).unwrap();
        assert_eq!(back.async_policy, AsyncType::Required);
    }

    #[test]
    fn unknown_state_and_method_default_conservatively() {
        let resource = JobStateResource {
            token: "t1".to_string(),
            state: "exploded".to_string(),
            method: "reticulate".to_string(),
            ..Default::default()
        };
        let job = job_state_from_resource(&resource);
        assert_eq!(job.state, State::Failed);
        assert_eq!(job.method, JobMethod::Provision);
    }

    #[test]
    fn corrupt_embedded_metadata_is_an_error() {
        let mut resource = spec_to_resource(&full_spec()).unwrap();
        resource.metadata = "{not json".to_string();
        assert!(spec_from_resource("spec-1", &resource).is_err());
    }

    #[test]
    fn instance_binding_ids_round_trip_as_list() {
        let mut instance = ServiceInstance {
            id: "i1".to_string(),
            spec_id: "spec-1".to_string(),
            parameters: Some([("size".to_string(), json!("large"))].into_iter().collect()),
            ..Default::default()
        };
        instance.add_binding("b2");
        instance.add_binding("b1");

        let resource = service_instance_to_resource(&instance).unwrap();
        assert_eq!(resource.binding_ids, vec!["b1", "b2"]);

        let back = service_instance_from_resource("i1", &resource).unwrap();
        assert_eq!(back, instance);
    }

    #[test]
    fn empty_parameters_round_trip_as_none() {
        let binding = BindInstance {
            id: "b1".to_string(),
            service_id: "i1".to_string(),
            parameters: None,
            ..Default::default()
        };
        let resource = bind_instance_to_resource(&binding).unwrap();
        assert!(resource.parameters.is_empty());
        let back = bind_instance_from_resource("b1", &resource).unwrap();
        assert_eq!(back.parameters, None);
    }
}
