//! Decision tools: the callable descriptors offered to the decision
//! collaborator, each bound to one capability operation.

use dayline_chat::ToolSpec;
use serde_json::{json, Value};

use crate::plan::CapabilityPlan;
use crate::types::ToolCall;

type ArgumentMapper = fn(&Value) -> Result<Value, String>;

/// A tool the decision collaborator may call.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Name the collaborator uses.
    pub name: String,
    /// Capability (service) that serves it. Also its plan flag.
    pub capability: String,
    pub operation: String,
    pub description: String,
    /// JSON Schema of the collaborator-facing arguments.
    pub parameters: Value,
    map_arguments: ArgumentMapper,
}

impl ToolDescriptor {
    pub fn new(
        name: &str,
        capability: &str,
        operation: &str,
        description: &str,
        parameters: Value,
        map_arguments: ArgumentMapper,
    ) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            operation: operation.into(),
            description: description.into(),
            parameters,
            map_arguments,
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// Translate collaborator arguments into a service call.
    pub fn to_call(&self, arguments: &Value) -> Result<ToolCall, String> {
        let mapped = (self.map_arguments)(arguments)?;
        Ok(ToolCall::new(&self.capability, &self.operation, mapped))
    }
}

fn required_path(arguments: &Value) -> Result<String, String> {
    if let Value::String(raw) = arguments {
        return Err(format!("arguments are not a JSON object: {}", raw));
    }
    arguments["path"]
        .as_str()
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "missing string argument 'path'".to_string())
}

fn caption_arguments(arguments: &Value) -> Result<Value, String> {
    Ok(json!({ "input": { "path": required_path(arguments)? } }))
}

fn exif_arguments(arguments: &Value) -> Result<Value, String> {
    let path = required_path(arguments)?;
    let weather = arguments["weather"].as_bool().unwrap_or(true);
    let address = arguments["address"].as_bool().unwrap_or(true);

    let mut mapped = json!({ "input": { "path": path } });
    if weather {
        mapped["weather"] = json!({ "use_open_meteo": true });
    }
    mapped["address"] = json!(address);
    Ok(mapped)
}

/// Ordered set of tools. Order is the stable order results are recorded in.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    /// Caption and EXIF tools.
    pub fn standard() -> Self {
        Self::new(vec![
            ToolDescriptor::new(
                "caption_image_tool",
                "caption",
                "caption_image",
                "Generate a one-line caption and hashtags for the image at `path`.",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"],
                }),
                caption_arguments,
            ),
            ToolDescriptor::new(
                "exif_metadata_tool",
                "exif",
                "extract_image_metadata",
                "Extract EXIF time and GPS from the image at `path`, optionally with \
                 weather and reverse-geocoded address.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "weather": {"type": "boolean", "default": true},
                        "address": {"type": "boolean", "default": true},
                    },
                    "required": ["path"],
                }),
                exif_arguments,
            ),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Position of a capability in catalog order.
    pub fn rank(&self, capability: &str) -> usize {
        self.tools
            .iter()
            .position(|t| t.capability == capability)
            .unwrap_or(self.tools.len())
    }

    /// Tools whose capability the plan wants.
    pub fn enabled<'a>(&'a self, plan: &'a CapabilityPlan) -> impl Iterator<Item = &'a ToolDescriptor> {
        self.tools.iter().filter(move |t| plan.wants(&t.capability))
    }

    /// Capabilities the plan wants, in catalog order.
    pub fn required_capabilities(&self, plan: &CapabilityPlan) -> Vec<String> {
        self.enabled(plan).map(|t| t.capability.clone()).collect()
    }
}
