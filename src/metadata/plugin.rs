use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginUsage {
    Sensor,
    Actuator,
    Logic,
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    State,
    Action,
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemberType::State => write!(f, "state"),
            MemberType::Action => write!(f, "action"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub name: String,
    pub member_type: MemberType,
    #[serde(with = "value_type_text")]
    pub value_type: ValueType,
    #[serde(default)]
    pub description: Option<String>,
}

/// Type of a plugin configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    String,
    Bool,
    Integer,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    pub name: String,
    pub value_type: ConfigType,
    #[serde(default)]
    pub description: Option<String>,
}

/// Immutable description of a plugin: what its components expose.
///
/// Shared as `Arc<PluginDescriptor>` between the registry, the bus and the
/// components built from it. `id` is always `module.name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub id: String,
    pub module: String,
    pub name: String,
    pub version: String,
    pub usage: PluginUsage,
    #[serde(default)]
    pub description: Option<String>,
    pub members: Vec<Member>,
    #[serde(default)]
    pub config: Vec<ConfigItem>,
}

impl PluginDescriptor {
    pub fn new(module: &str, name: &str, version: &str, usage: PluginUsage) -> Self {
        Self {
            id: format!("{}.{}", module, name),
            module: module.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            usage,
            description: None,
            members: Vec::new(),
            config: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_state(self, name: &str, value_type: ValueType) -> Self {
        self.with_member(name, MemberType::State, value_type)
    }

    pub fn with_action(self, name: &str, value_type: ValueType) -> Self {
        self.with_member(name, MemberType::Action, value_type)
    }

    pub fn with_config(mut self, name: &str, value_type: ConfigType, description: &str) -> Self {
        self.config.push(ConfigItem {
            name: name.to_string(),
            value_type,
            description: Some(description.to_string()),
        });
        self
    }

    fn with_member(mut self, name: &str, member_type: MemberType, value_type: ValueType) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            member_type,
            value_type,
            description: None,
        });
        self
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.name == name)
    }

    pub fn members_of(&self, member_type: MemberType) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(move |member| member.member_type == member_type)
    }
}

/// Wire form of a component announced under `components/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub id: String,
    pub plugin: String,
}

mod value_type_text {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::metadata::types::ValueType;

    pub fn serialize<S: Serializer>(value: &ValueType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ValueType, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}
