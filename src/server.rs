use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One monitored dev server, as stored by the sidebar. The kill engine only
/// reads `start_command` and `url`; everything else is carried for the
/// store's benefit and never mutated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(alias = "startCommand")]
    pub start_command: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub status: Option<ServerStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Up,
    Down,
}

impl ServerEntry {
    pub fn new(name: &str, url: &str, start_command: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            url: url.to_string(),
            start_command: start_command.to_string(),
            group: None,
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_sidebar_camel_case() {
        let json = r#"{"id":"1","name":"web","url":"http://localhost:3000","startCommand":"npm run dev"}"#;
        let entry: ServerEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.start_command, "npm run dev");
        assert_eq!(entry.group, None);
        assert_eq!(entry.status, None);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ServerStatus::Up).unwrap(), "\"up\"");
        assert_eq!(serde_json::to_string(&ServerStatus::Down).unwrap(), "\"down\"");
    }
}
