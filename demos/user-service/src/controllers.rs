use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use axum::http::StatusCode;
use route_kit::middleware::from_fn;
use route_kit::{controller, BoxError, Controller, HttpError, JsonSchema, Middleware, ResponseHandle, RouteRequest};
use serde_json::{json, Value};
use tracing::info;

use crate::dtos::{
    id_params_schema, list_query_schema, new_user_schema, user_update_schema, ListQuery, NewUser, Page,
    Role, User, UserUpdate,
};

/// Rejects the request unless it carries `x-role: admin`.
fn require_admin() -> impl Middleware {
    from_fn(|req: &mut RouteRequest| match req.header("x-role").as_deref() {
        Some("admin") => Ok(None),
        _ => Err(HttpError::new("Admin role required", 403)),
    })
}

pub struct Users {
    users: RwLock<Vec<User>>,
    next_id: AtomicU64,
}

impl Controller for Users {
    fn create() -> Result<Self, BoxError> {
        let seed = User {
            id: 1,
            name: "Ada".into(),
            email: "ada@example.com".into(),
            role: Role::Admin,
        };
        Ok(Self {
            users: RwLock::new(vec![seed]),
            next_id: AtomicU64::new(2),
        })
    }
}

impl Users {
    fn find(&self, id: u64) -> Result<User, HttpError> {
        self.users
            .read()
            .map_err(|_| HttpError::internal("user store poisoned"))?
            .iter()
            .find(|user| user.id == id)
            .cloned()
            .ok_or_else(|| HttpError::new(format!("User {} not found", id), 404))
    }
}

#[controller("/users")]
#[catch]
impl Users {
    #[get]
    #[validate_query(JsonSchema::new(list_query_schema())?)]
    async fn list(&self, #[query] query: ListQuery) -> Result<Value, HttpError> {
        let users = self
            .users
            .read()
            .map_err(|_| HttpError::internal("user store poisoned"))?;
        let matching: Vec<&User> = users
            .iter()
            .filter(|user| match &query.search {
                Some(term) => user.name.to_lowercase().contains(&term.to_lowercase()),
                None => true,
            })
            .collect();
        let start = ((query.page - 1) * query.limit) as usize;
        let page = Page {
            items: matching
                .iter()
                .skip(start)
                .take(query.limit as usize)
                .map(|user| (*user).clone())
                .collect(),
            page: query.page,
            limit: query.limit,
            total: matching.len(),
        };
        serde_json::to_value(page).map_err(HttpError::from_error)
    }

    #[get("/:id")]
    #[validate_params(JsonSchema::new(id_params_schema())?)]
    async fn show(&self, #[param("id")] id: u64) -> Result<axum::Json<User>, HttpError> {
        self.find(id).map(axum::Json)
    }

    #[post]
    #[validate_body(JsonSchema::new(new_user_schema())?, status = 422)]
    async fn register(&self, #[body] user: NewUser, #[res] res: ResponseHandle) -> Result<(), HttpError> {
        let mut users = self
            .users
            .write()
            .map_err(|_| HttpError::internal("user store poisoned"))?;
        if users.iter().any(|existing| existing.email == user.email) {
            return Err(HttpError::new("Email already registered", 409));
        }
        let user = User {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: user.name,
            email: user.email,
            role: user.role,
        };
        info!(id = user.id, email = %user.email, "user created");
        res.status(StatusCode::CREATED).json(&user)?;
        users.push(user);
        Ok(())
    }

    #[patch("/:id")]
    #[validate_params(JsonSchema::new(id_params_schema())?)]
    #[validate_body(JsonSchema::new(user_update_schema())?)]
    async fn update(&self, #[param("id")] id: u64, #[body] update: UserUpdate) -> Result<axum::Json<User>, HttpError> {
        let mut users = self
            .users
            .write()
            .map_err(|_| HttpError::internal("user store poisoned"))?;
        let user = users
            .iter_mut()
            .find(|user| user.id == id)
            .ok_or_else(|| HttpError::new(format!("User {} not found", id), 404))?;
        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        Ok(axum::Json(user.clone()))
    }

    #[delete(path = "/:id", middleware = [require_admin()])]
    #[validate_params(JsonSchema::new(id_params_schema())?)]
    async fn remove(&self, #[param("id")] id: u64) -> Result<(), HttpError> {
        let mut users = self
            .users
            .write()
            .map_err(|_| HttpError::internal("user store poisoned"))?;
        let before = users.len();
        users.retain(|user| user.id != id);
        if users.len() == before {
            return Err(HttpError::new(format!("User {} not found", id), 404));
        }
        info!(id, "user removed");
        Ok(())
    }
}

pub struct Health;

impl Controller for Health {
    fn create() -> Result<Self, BoxError> {
        Ok(Health)
    }
}

#[controller("/health")]
impl Health {
    #[get]
    fn status(&self, #[headers("user-agent")] agent: Option<String>) -> Value {
        json!({ "status": "ok", "agent": agent })
    }
}
