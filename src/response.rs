use serde::Serialize;
use utoipa::ToSchema;

/// Pagination block attached to list responses.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct Meta {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub total: Option<i64>,
}

impl Meta {
    pub fn new(page: i64, per_page: i64, total: i64) -> Self {
        Self {
            page: Some(page),
            per_page: Some(per_page),
            total: Some(total),
        }
    }

    pub fn empty() -> Self {
        Self {
            page: None,
            per_page: None,
            total: None,
        }
    }
}

/// Uniform envelope for every endpoint: a human-readable message, the
/// payload, and optional pagination meta. Meta is dropped from the JSON
/// entirely when absent.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub message: String,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T, meta: Option<Meta>) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
            meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_is_omitted_when_absent() {
        let resp = ApiResponse::success("ok", 1, None);
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("meta").is_none());

        let resp = ApiResponse::success("ok", 1, Some(Meta::new(2, 20, 41)));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["meta"]["page"], 2);
        assert_eq!(json["meta"]["total"], 41);
    }
}
