use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A user as stored by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

/// Payload of `POST /users`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// Payload of `PATCH /users/:id`; absent fields stay unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Query of `GET /users`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    pub page: u64,
    pub limit: u64,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u64,
    pub limit: u64,
    pub total: usize,
}

pub fn new_user_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "minLength": 2, "maxLength": 64},
            "email": {"type": "string", "format": "email"},
            "role": {"type": "string", "enum": ["admin", "member"], "default": "member"}
        },
        "required": ["name", "email"]
    })
}

pub fn user_update_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "minLength": 2, "maxLength": 64},
            "email": {"type": "string", "format": "email"}
        },
        "minProperties": 1
    })
}

pub fn list_query_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "page": {"type": "integer", "minimum": 1, "default": 1},
            "limit": {"type": "integer", "minimum": 1, "maximum": 100, "default": 10},
            "search": {"type": "string"}
        }
    })
}

pub fn id_params_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": "integer", "minimum": 1}
        },
        "required": ["id"]
    })
}
