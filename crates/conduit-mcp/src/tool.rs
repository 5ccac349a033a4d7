//! Tool descriptors and call results as exchanged with MCP servers.

use conduit_types::ToolDefinition;
use serde::{Deserialize, Serialize};

/// A tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDescriptor {
    /// The definition offered to the model.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Payload of a `tools/list` response.
#[derive(Debug, Deserialize)]
pub(crate) struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// A content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContent,
    },
}

/// An embedded resource returned by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    pub uri: String,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Result of calling a tool. `is_error` means the tool itself failed; the
/// result is still fed back to the model as ordinary output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// A synthetic error-flagged result carrying `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// Flatten the content to text for the conversation.
    pub fn render_text(&self) -> String {
        self.content
            .iter()
            .map(|item| match item {
                ToolContent::Text { text } => text.clone(),
                ToolContent::Image { mime_type, .. } => format!("[image: {mime_type}]"),
                ToolContent::Resource { resource } => match &resource.text {
                    Some(text) => text.clone(),
                    None => format!("[resource: {}]", resource.uri),
                },
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_tool_descriptor() {
        let json = r#"{
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"}
                },
                "required": ["path"]
            }
        }"#;
        let tool: ToolDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.description, "Read a file");
        assert_eq!(tool.input_schema["required"][0], "path");
    }

    #[test]
    fn descriptor_defaults() {
        let tool: ToolDescriptor = serde_json::from_str(r#"{"name": "list"}"#).unwrap();
        assert!(tool.description.is_empty());
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn descriptor_to_definition() {
        let tool: ToolDescriptor =
            serde_json::from_str(r#"{"name": "echo", "description": "Echo back"}"#).unwrap();
        let def = tool.to_definition();
        assert_eq!(def.name, "echo");
        assert_eq!(def.description, "Echo back");
    }

    #[test]
    fn deserialize_tools_list_result() {
        let json = r#"{
            "tools": [
                {"name": "a", "description": "Tool A", "inputSchema": {"type": "object"}},
                {"name": "b", "inputSchema": {"type": "object"}}
            ]
        }"#;
        let result: ToolsListResult = serde_json::from_str(json).unwrap();
        let names: Vec<&str> = result.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn deserialize_call_result_mixed_content() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "file contents here"},
                {"type": "image", "data": "base64data", "mimeType": "image/png"},
                {"type": "resource", "resource": {"uri": "file:///a.txt", "text": "alpha"}}
            ]
        }"#;
        let result: ToolCallResult = serde_json::from_str(json).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 3);
        match &result.content[1] {
            ToolContent::Image { data, mime_type } => {
                assert_eq!(data, "base64data");
                assert_eq!(mime_type, "image/png");
            }
            other => panic!("Expected image content, got {other:?}"),
        }
    }

    #[test]
    fn deserialize_call_result_error_flag() {
        let json = r#"{"content": [{"type": "text", "text": "not found"}], "isError": true}"#;
        let result: ToolCallResult = serde_json::from_str(json).unwrap();
        assert!(result.is_error);
        assert_eq!(result.render_text(), "not found");
    }

    #[test]
    fn render_text_joins_items() {
        let result = ToolCallResult {
            content: vec![
                ToolContent::Text { text: "one".into() },
                ToolContent::Image {
                    data: "xx".into(),
                    mime_type: "image/jpeg".into(),
                },
                ToolContent::Resource {
                    resource: ResourceContent {
                        uri: "db://rows/1".into(),
                        mime_type: None,
                        text: None,
                    },
                },
                ToolContent::Resource {
                    resource: ResourceContent {
                        uri: "file:///b".into(),
                        mime_type: Some("text/plain".into()),
                        text: Some("bravo".into()),
                    },
                },
            ],
            is_error: false,
        };
        assert_eq!(
            result.render_text(),
            "one\n[image: image/jpeg]\n[resource: db://rows/1]\nbravo"
        );
    }

    #[test]
    fn error_result_is_flagged() {
        let result = ToolCallResult::error("No connected server provides tool 'x'");
        assert!(result.is_error);
        assert!(result.render_text().contains("'x'"));
    }
}
