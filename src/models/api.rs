use serde::{ Serialize, Deserialize };

pub const DEFAULT_USER_ID: &str = "defaultUser";

fn default_stream() -> bool {
    true
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub user_id: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Selects the event-stream response. `false` returns one JSON object.
    #[serde(default = "default_stream")]
    pub stream: bool,
}

impl ChatRequest {
    pub fn user_id(&self) -> &str {
        resolve_user_id(self.user_id.as_deref())
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub user_id: Option<String>,
}

impl StopRequest {
    pub fn user_id(&self) -> &str {
        resolve_user_id(self.user_id.as_deref())
    }
}

fn resolve_user_id(user_id: Option<&str>) -> &str {
    match user_id {
        Some(id) if !id.is_empty() => id,
        _ => DEFAULT_USER_ID,
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ChatResponse {
    pub response: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StopResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_defaults() {
        let req: ChatRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.user_id(), DEFAULT_USER_ID);
        assert_eq!(req.message, "");
        assert!(req.stream);
    }

    #[test]
    fn chat_request_reads_camel_case_user_id() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"userId":"alice","message":"hi","stream":false}"#
        ).unwrap();
        assert_eq!(req.user_id(), "alice");
        assert_eq!(req.message, "hi");
        assert!(!req.stream);
    }

    #[test]
    fn empty_user_id_falls_back_to_default() {
        let req: StopRequest = serde_json::from_str(r#"{"userId":""}"#).unwrap();
        assert_eq!(req.user_id(), DEFAULT_USER_ID);
    }
}
