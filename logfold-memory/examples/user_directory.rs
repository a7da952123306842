//! A user directory kept consistent by two engines sharing one log.
//!
//! Run with `cargo run -p logfold-memory --example user_directory`.

use logfold::prelude::*;
use logfold_memory::InMemoryLog;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default)]
struct Directory {
    users: BTreeMap<String, User>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    name: String,
    email: String,
}

fn unique_email(ctx: &EventContext<'_, Directory>) -> HandlerResult<()> {
    let user: User = ctx.props_as()?;
    if ctx.state.users.contains_key(&user.email) {
        return Err(HandlerError::new(format!(
            "A user with email {} already exists.",
            user.email
        )));
    }
    Ok(())
}

fn register_handlers(engine: &Engine<Directory>) -> EngineResult<()> {
    engine.register(
        "UserAdded",
        handler_fn(|ctx: &EventContext<'_, Directory>| {
            let user: User = ctx.props_as()?;
            let mut next = ctx.state.clone();
            next.users.insert(user.email.clone(), user);
            Ok(Some(next))
        })
        .with_validator(unique_email),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let log = InMemoryLog::ephemeral();
    let frontend = Engine::start(log.clone(), Directory::default()).await?;
    let backend = Engine::start(InMemoryLog::open(log.handle().clone()), Directory::default()).await?;
    register_handlers(&frontend)?;
    register_handlers(&backend)?;

    let ada = User {
        name: "Ada Lovelace".to_string(),
        email: "ada@example.com".to_string(),
    };
    let event = frontend.submit("UserAdded", &ada).await?;
    println!("committed: {event}");

    match backend.submit("UserAdded", &ada).await {
        Ok(event) => println!("unexpectedly committed: {event}"),
        Err(err) => println!("rejected: {err}"),
    }

    backend.wait_for_position(frontend.position()).await?;
    for engine in [&frontend, &backend] {
        let names: Vec<_> = engine
            .state()
            .users
            .values()
            .map(|user| user.name.clone())
            .collect();
        println!("{} sees {names:?} at position {}", engine.log_handle(), engine.position());
    }

    frontend.stop().await;
    backend.stop().await;
    Ok(())
}
