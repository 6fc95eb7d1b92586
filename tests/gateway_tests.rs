//! Tests for the remote method gateway: name resolution, the per-method
//! secure flag and caller identity injection.

use std::sync::Arc;

use serde_json::{json, Value};

use taskmesh::error::MeshError;
use taskmesh::gateway::{RemoteRegistry, SessionGateway};

fn registry() -> Arc<RemoteRegistry> {
    let mut registry = RemoteRegistry::new();
    registry.register("whoami", |caller, _args| async move { Ok(json!(caller)) });
    registry.register("nothing", |_caller, _args| async move { Ok(Value::Null) });
    registry.register_open("probe", |_caller, _args| async move { Ok(json!("pong")) });
    Arc::new(registry)
}

#[tokio::test]
async fn unknown_method_is_an_error() {
    let gateway = SessionGateway::authenticated(registry(), "worker-1");
    let result = gateway.dispatch("no_such_method", json!({})).await;
    assert!(matches!(result, Err(MeshError::UnknownMethod(name)) if name == "no_such_method"));
}

#[tokio::test]
async fn secured_method_requires_authentication() {
    let gateway = SessionGateway::new(registry(), "worker-1");

    let denied = gateway.dispatch("nothing", json!({})).await;
    assert!(matches!(denied, Err(MeshError::Unauthorized(_))));

    // A refusal is distinguishable from a handler legitimately returning
    // null: the same call succeeds once the session authenticates.
    gateway.set_authenticated();
    let allowed = gateway.dispatch("nothing", json!({})).await.unwrap();
    assert_eq!(allowed, Value::Null);
}

#[tokio::test]
async fn open_method_works_before_authentication() {
    let gateway = SessionGateway::new(registry(), "worker-1");
    assert!(!gateway.is_authenticated());
    let result = gateway.dispatch("probe", json!({})).await.unwrap();
    assert_eq!(result, json!("pong"));
}

#[tokio::test]
async fn caller_identity_is_injected() {
    let gateway = SessionGateway::authenticated(registry(), "worker-7");
    let result = gateway.dispatch("whoami", json!({})).await.unwrap();
    assert_eq!(result, json!("worker-7"));
}
