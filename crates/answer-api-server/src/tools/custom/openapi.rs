use anyhow::{anyhow, bail, Result};
use search_shared::llm::ToolDefinition;
use serde_json::Value;

/// Where a parameter is substituted into the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub schema: Value,
}

/// One path+method from an OpenAPI document, flattened into what the tool
/// runtime needs.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub summary: String,
    pub method: String,
    pub path: String,
    pub params: Vec<ParamSpec>,
    pub request_body_schema: Option<Value>,
}

/// Base URL from the document's `servers` entry.
pub fn openapi_to_url(spec: &Value) -> Result<String> {
    spec.get("servers")
        .and_then(|v| v.as_array())
        .and_then(|servers| servers.first())
        .and_then(|server| server.get("url"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim_end_matches('/').to_string())
        .ok_or_else(|| anyhow!("OpenAPI schema has no servers[0].url"))
}

/// Flatten every path+method into a MethodSpec. Operations without an
/// operationId get a name derived from the method and path.
pub fn openapi_to_method_specs(spec: &Value) -> Result<Vec<MethodSpec>> {
    let paths = spec
        .get("paths")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow!("OpenAPI schema has no paths"))?;

    let mut specs = Vec::new();
    for (path, operations) in paths {
        let Some(operations) = operations.as_object() else {
            continue;
        };
        for (method, operation) in operations {
            if !matches!(
                method.as_str(),
                "get" | "post" | "put" | "patch" | "delete"
            ) {
                continue;
            }
            let Some(operation) = operation.as_object() else {
                continue;
            };

            let name = operation
                .get("operationId")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| {
                    format!(
                        "{}_{}",
                        method,
                        path.trim_matches('/')
                            .replace(['/', '{', '}'], "_")
                            .trim_matches('_')
                    )
                });
            let summary = operation
                .get("summary")
                .or_else(|| operation.get("description"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();

            let mut params = Vec::new();
            for param in operation
                .get("parameters")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
            {
                let Some(param_name) = param.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let location = match param.get("in").and_then(|v| v.as_str()) {
                    Some("path") => ParamLocation::Path,
                    Some("query") => ParamLocation::Query,
                    _ => continue,
                };
                params.push(ParamSpec {
                    name: param_name.to_string(),
                    location,
                    required: param
                        .get("required")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(location == ParamLocation::Path),
                    schema: param
                        .get("schema")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({"type": "string"})),
                });
            }

            let request_body_schema = operation
                .get("requestBody")
                .and_then(|b| b.pointer("/content/application~1json/schema"))
                .cloned();

            specs.push(MethodSpec {
                name,
                summary,
                method: method.to_uppercase(),
                path: path.clone(),
                params,
                request_body_schema,
            });
        }
    }

    if specs.is_empty() {
        bail!("OpenAPI schema defines no usable operations");
    }
    Ok(specs)
}

impl MethodSpec {
    /// Function-calling definition mirroring the parameter schemas.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.params {
            properties.insert(param.name.clone(), param.schema.clone());
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        if let Some(ref body_schema) = self.request_body_schema {
            properties.insert("request_body".to_string(), body_schema.clone());
            required.push(Value::String("request_body".to_string()));
        }

        ToolDefinition {
            name: self.name.clone(),
            description: self.summary.clone(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Validate LLM-provided arguments against the parsed schema: unknown
    /// fields are rejected at the boundary, values are coerced to the
    /// declared types where that is unambiguous.
    pub fn validate_args(&self, args: &Value) -> Result<Value> {
        let Some(args_map) = args.as_object() else {
            bail!("tool arguments must be an object");
        };

        let known: Vec<&str> = self
            .params
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.request_body_schema.as_ref().map(|_| "request_body"))
            .collect();

        for key in args_map.keys() {
            if !known.contains(&key.as_str()) {
                bail!("unknown argument '{}' for tool '{}'", key, self.name);
            }
        }

        let mut validated = serde_json::Map::new();
        for param in &self.params {
            match args_map.get(&param.name) {
                Some(value) => {
                    validated.insert(
                        param.name.clone(),
                        coerce_to_schema(value, &param.schema)
                            .map_err(|e| anyhow!("argument '{}': {}", param.name, e))?,
                    );
                }
                None if param.required => {
                    bail!("missing required argument '{}'", param.name)
                }
                None => {}
            }
        }
        if self.request_body_schema.is_some() {
            match args_map.get("request_body") {
                Some(body) => {
                    validated.insert("request_body".to_string(), body.clone());
                }
                None => bail!("missing required argument 'request_body'"),
            }
        }

        Ok(Value::Object(validated))
    }
}

fn coerce_to_schema(value: &Value, schema: &Value) -> Result<Value> {
    let declared = schema.get("type").and_then(|v| v.as_str()).unwrap_or("string");
    match (declared, value) {
        ("string", Value::String(_)) => Ok(value.clone()),
        ("string", other) => Ok(Value::String(other.to_string())),
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        ("integer", Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| anyhow!("expected integer, got '{s}'")),
        ("number", Value::Number(_)) => Ok(value.clone()),
        ("number", Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("expected number, got '{s}'")),
        ("boolean", Value::Bool(_)) => Ok(value.clone()),
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(anyhow!("expected boolean, got '{s}'")),
        },
        ("array", Value::Array(_)) | ("object", Value::Object(_)) => Ok(value.clone()),
        (expected, got) => Err(anyhow!("expected {expected}, got {got}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> Value {
        serde_json::json!({
            "openapi": "3.0.0",
            "servers": [{"url": "https://api.example.com/v1/"}],
            "paths": {
                "/tickets/{ticket_id}": {
                    "get": {
                        "operationId": "get_ticket",
                        "summary": "Fetch one ticket",
                        "parameters": [
                            {"name": "ticket_id", "in": "path", "required": true,
                             "schema": {"type": "integer"}},
                            {"name": "include", "in": "query",
                             "schema": {"type": "string"}}
                        ]
                    }
                },
                "/tickets": {
                    "post": {
                        "summary": "Create a ticket",
                        "requestBody": {
                            "content": {"application/json": {"schema": {"type": "object"}}}
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn test_url_and_method_parsing() {
        let spec = sample_spec();
        assert_eq!(openapi_to_url(&spec).unwrap(), "https://api.example.com/v1");

        let methods = openapi_to_method_specs(&spec).unwrap();
        assert_eq!(methods.len(), 2);

        let get = methods.iter().find(|m| m.name == "get_ticket").unwrap();
        assert_eq!(get.method, "GET");
        assert_eq!(get.params.len(), 2);
        assert!(get.params[0].required);

        // Missing operationId falls back to method + path
        let post = methods.iter().find(|m| m.name == "post_tickets").unwrap();
        assert!(post.request_body_schema.is_some());
    }

    #[test]
    fn test_tool_definition_mirrors_schema() {
        let spec = sample_spec();
        let methods = openapi_to_method_specs(&spec).unwrap();
        let get = methods.iter().find(|m| m.name == "get_ticket").unwrap();

        let definition = get.to_tool_definition();
        assert_eq!(definition.name, "get_ticket");
        assert!(definition.parameters["properties"]["ticket_id"]["type"] == "integer");
        assert!(definition.parameters["required"]
            .as_array()
            .unwrap()
            .contains(&Value::String("ticket_id".to_string())));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let spec = sample_spec();
        let methods = openapi_to_method_specs(&spec).unwrap();
        let get = methods.iter().find(|m| m.name == "get_ticket").unwrap();

        let result = get.validate_args(&serde_json::json!({
            "ticket_id": 5,
            "bogus": "field",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_type_coercion_from_strings() {
        let spec = sample_spec();
        let methods = openapi_to_method_specs(&spec).unwrap();
        let get = methods.iter().find(|m| m.name == "get_ticket").unwrap();

        let validated = get
            .validate_args(&serde_json::json!({"ticket_id": "42"}))
            .unwrap();
        assert_eq!(validated["ticket_id"], serde_json::json!(42));

        let bad = get.validate_args(&serde_json::json!({"ticket_id": "not-a-number"}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_missing_required_argument_rejected() {
        let spec = sample_spec();
        let methods = openapi_to_method_specs(&spec).unwrap();
        let get = methods.iter().find(|m| m.name == "get_ticket").unwrap();
        assert!(get.validate_args(&serde_json::json!({})).is_err());
    }
}
