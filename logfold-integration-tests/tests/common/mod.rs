//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use logfold::prelude::*;
use logfold::registry::FnHandler;
use logfold_memory::InMemoryLog;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Users {
    pub users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl User {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            email: None,
        }
    }

    pub fn with_email(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: Some(email.to_string()),
        }
    }
}

/// Projects `UserAdded` by appending the user.
pub fn user_added() -> FnHandler<Users> {
    handler_fn(|ctx: &EventContext<'_, Users>| {
        let user: User = ctx.props_as()?;
        let mut next = ctx.state.clone();
        next.users.push(user);
        Ok(Some(next))
    })
}

/// An engine over a fresh ephemeral log with `UserAdded` registered.
pub async fn users_engine() -> (Arc<InMemoryLog>, Engine<Users>) {
    let log = InMemoryLog::ephemeral();
    let engine = Engine::start(log.clone(), Users::default())
        .await
        .expect("engine should start");
    engine
        .register("UserAdded", user_added())
        .expect("UserAdded should register");
    (log, engine)
}

/// Projects `Added` by adding `amount` to a counter; negative amounts fail.
pub fn counter_added() -> FnHandler<i64> {
    handler_fn(|ctx: &EventContext<'_, i64>| {
        let amount: i64 = ctx.props_as()?;
        if amount < 0 {
            return Err(HandlerError::new("Negative amounts are not allowed."));
        }
        Ok(Some(ctx.state + amount))
    })
}

/// Names from a user list, for compact assertions.
pub fn names(users: &Users) -> Vec<&str> {
    users.users.iter().map(|user| user.name.as_str()).collect()
}
