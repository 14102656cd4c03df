//! Typed operations understood by the on-device component.
//!
//! Each [`Request`] variant serializes to the `type`/`args` pair of a request
//! envelope (see [`crate::protocol::RequestEnvelope`]). The `*Result` structs
//! describe the operation-specific fields of the matching response.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LogLevel;
use crate::node_tree::NodeDescriptor;

/// Starting point for a key path lookup on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BaseType {
    /// The global node (`m.global`).
    #[default]
    Global,
    /// The current scene.
    Scene,
    /// The node that currently has focus.
    FocusedNode,
    /// A node stored by `storeNodeReferences`, addressed by its ref.
    NodeRef,
    /// A node addressed by its `id` field.
    ElementId,
}

/// A node field addressed by base and dot-separated key path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePath {
    pub base: BaseType,
    pub key_path: String,
}

impl NodePath {
    pub fn new(base: BaseType, key_path: impl Into<String>) -> Self {
        Self {
            base,
            key_path: key_path.into(),
        }
    }
}

/// Condition a field change must satisfy for `onFieldChangeOnce` to fire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMatch {
    pub base: BaseType,
    pub key_path: String,
    pub value: Value,
}

/// Registry contents: section name to key/value pairs.
pub type RegistryValues = BTreeMap<String, BTreeMap<String, Value>>;

/// An operation sent to the on-device component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    // -- Node access --------------------------------------------------------
    GetValue {
        base: BaseType,
        key_path: String,
    },
    GetValues {
        requests: BTreeMap<String, NodePath>,
    },
    SetValue {
        base: BaseType,
        key_path: String,
        value: Value,
    },
    CallFunc {
        base: BaseType,
        key_path: String,
        func_name: String,
        func_params: Vec<Value>,
    },
    GetFocusedNode {
        include_ref: bool,
    },
    HasFocus {
        base: BaseType,
        key_path: String,
    },
    IsInFocusChain {
        base: BaseType,
        key_path: String,
    },
    FocusNode {
        base: BaseType,
        key_path: String,
        on: bool,
    },
    /// Resolves once the field changes (optionally to a matching value).
    OnFieldChangeOnce {
        base: BaseType,
        key_path: String,
        #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
        expected: Option<FieldMatch>,
    },

    // -- Scene graph --------------------------------------------------------
    StoreNodeReferences {
        include_node_count_info: bool,
        include_array_grid_children: bool,
    },
    DeleteNodeReferences {},
    GetAllCount {},
    GetRootsCount {},

    // -- Registry -----------------------------------------------------------
    ReadRegistry {},
    WriteRegistry {
        values: RegistryValues,
    },
    DeleteRegistrySections {
        sections: Vec<String>,
        allow_entire_registry_delete: bool,
    },
    DeleteEntireRegistry {},

    // -- File system --------------------------------------------------------
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        #[serde(skip)]
        binary_payload: Vec<u8>,
    },
    GetDirectoryListing {
        path: String,
    },
    StatPath {
        path: String,
    },
    CreateDirectory {
        path: String,
    },
    DeleteFile {
        path: String,
    },
    RenameFile {
        from_path: String,
        to_path: String,
    },
    GetVolumeList {},

    // -- Misc ---------------------------------------------------------------
    GetApplicationStartTime {},
    GetServerHost {},
    DisableScreenSaver {
        disable: bool,
    },
    SetSettings {
        log_level: LogLevel,
    },
}

impl Request {
    /// The wire name of this operation, also used in tracing spans and error
    /// messages.
    pub fn request_type(&self) -> &'static str {
        match self {
            Request::GetValue { .. } => "getValue",
            Request::GetValues { .. } => "getValues",
            Request::SetValue { .. } => "setValue",
            Request::CallFunc { .. } => "callFunc",
            Request::GetFocusedNode { .. } => "getFocusedNode",
            Request::HasFocus { .. } => "hasFocus",
            Request::IsInFocusChain { .. } => "isInFocusChain",
            Request::FocusNode { .. } => "focusNode",
            Request::OnFieldChangeOnce { .. } => "onFieldChangeOnce",
            Request::StoreNodeReferences { .. } => "storeNodeReferences",
            Request::DeleteNodeReferences {} => "deleteNodeReferences",
            Request::GetAllCount {} => "getAllCount",
            Request::GetRootsCount {} => "getRootsCount",
            Request::ReadRegistry {} => "readRegistry",
            Request::WriteRegistry { .. } => "writeRegistry",
            Request::DeleteRegistrySections { .. } => "deleteRegistrySections",
            Request::DeleteEntireRegistry {} => "deleteEntireRegistry",
            Request::ReadFile { .. } => "readFile",
            Request::WriteFile { .. } => "writeFile",
            Request::GetDirectoryListing { .. } => "getDirectoryListing",
            Request::StatPath { .. } => "statPath",
            Request::CreateDirectory { .. } => "createDirectory",
            Request::DeleteFile { .. } => "deleteFile",
            Request::RenameFile { .. } => "renameFile",
            Request::GetVolumeList {} => "getVolumeList",
            Request::GetApplicationStartTime {} => "getApplicationStartTime",
            Request::GetServerHost {} => "getServerHost",
            Request::DisableScreenSaver { .. } => "disableScreenSaver",
            Request::SetSettings { .. } => "setSettings",
        }
    }

    /// Bytes that travel in the frame's binary segment instead of `args`.
    pub fn binary_payload(&self) -> Option<&[u8]> {
        match self {
            Request::WriteFile { binary_payload, .. } => Some(binary_payload),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Result of `getValue`, and of each entry in `getValues`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValueResult {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GetValuesResult {
    pub results: BTreeMap<String, ValueResult>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallFuncResult {
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FocusedNodeResult {
    #[serde(default)]
    pub node: Option<Value>,
    #[serde(rename = "ref", default)]
    pub node_ref: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HasFocusResult {
    pub has_focus: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InFocusChainResult {
    pub is_in_focus_chain: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldChangeResult {
    #[serde(default)]
    pub value: Value,
}

/// Node totals reported by `getAllCount` and `getRootsCount`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCountResult {
    pub total_nodes: u64,
    #[serde(default)]
    pub node_count_by_type: BTreeMap<String, u64>,
}

/// Raw `storeNodeReferences` fields before tree reconstruction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreNodeReferencesFields {
    pub flat_tree: Vec<NodeDescriptor>,
    #[serde(default)]
    pub total_nodes: Option<u64>,
    #[serde(default)]
    pub node_count_by_type: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryResult {
    #[serde(default)]
    pub values: RegistryValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListResult {
    #[serde(default)]
    pub list: Vec<String>,
}

/// Result of `statPath`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PathStat {
    /// `file` or `directory`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTimeResult {
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerHostResult {
    pub host: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_args_serialize_as_object() {
        let value = serde_json::to_value(Request::ReadRegistry {}).unwrap();
        assert_eq!(value, json!({"type": "readRegistry", "args": {}}));
    }

    #[test]
    fn field_names_are_camel_case() {
        let value = serde_json::to_value(Request::CallFunc {
            base: BaseType::ElementId,
            key_path: "player".into(),
            func_name: "seek".into(),
            func_params: vec![json!(30)],
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "callFunc",
                "args": {
                    "base": "elementId",
                    "keyPath": "player",
                    "funcName": "seek",
                    "funcParams": [30]
                }
            })
        );
    }

    #[test]
    fn field_match_renamed_and_optional() {
        let without = serde_json::to_value(Request::OnFieldChangeOnce {
            base: BaseType::Global,
            key_path: "state".into(),
            expected: None,
        })
        .unwrap();
        assert!(without["args"].get("match").is_none());

        let with = serde_json::to_value(Request::OnFieldChangeOnce {
            base: BaseType::Global,
            key_path: "state".into(),
            expected: Some(FieldMatch {
                base: BaseType::FocusedNode,
                key_path: "id".into(),
                value: json!("play"),
            }),
        })
        .unwrap();
        assert_eq!(
            with["args"]["match"],
            json!({"base": "focusedNode", "keyPath": "id", "value": "play"})
        );
    }

    #[test]
    fn request_type_matches_serialized_tag() {
        let requests = vec![
            Request::GetFocusedNode { include_ref: true },
            Request::StoreNodeReferences {
                include_node_count_info: false,
                include_array_grid_children: true,
            },
            Request::RenameFile {
                from_path: "tmp:/a".into(),
                to_path: "tmp:/b".into(),
            },
            Request::SetSettings {
                log_level: LogLevel::Warn,
            },
            Request::GetApplicationStartTime {},
        ];
        for request in requests {
            let value = serde_json::to_value(&request).unwrap();
            assert_eq!(value["type"], request.request_type());
        }
    }

    #[test]
    fn only_write_file_carries_binary() {
        let write = Request::WriteFile {
            path: "tmp:/x".into(),
            binary_payload: vec![1, 2],
        };
        assert_eq!(write.binary_payload(), Some(&[1u8, 2][..]));
        assert_eq!(
            Request::ReadFile {
                path: "tmp:/x".into()
            }
            .binary_payload(),
            None
        );
    }

    #[test]
    fn path_stat_keeps_unknown_fields() {
        let stat: PathStat =
            serde_json::from_value(json!({"type": "file", "size": 12, "permissions": "rw"}))
                .unwrap();
        assert_eq!(stat.kind, "file");
        assert_eq!(stat.size, Some(12));
        assert_eq!(stat.extra["permissions"], "rw");
    }
}
