mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use chrono::{DateTime, Utc};
use sandhive::{
    network::NetScope,
    slot::{KvStore, Slot},
};
use serde_json::json;

use common::{Node, NODE};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_create_list_delete_leaves_nothing_behind() -> anyhow::Result<()> {
    let node = Node::new().await;

    let created = node.create("key-t").await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.str("template_id"), "tpl_abc");
    assert_eq!(created.str("client_id"), NODE);
    assert_eq!(created.str("alias"), "python");
    let id = created.str("sandbox_id");
    assert!(!id.is_empty());

    let status = node.driver.inspect_task(&id).await?;
    let slot = Slot::new(NODE, status.slot_idx, &id)?;
    assert!(node.hosts().contains(&id));
    assert!(node.net.has_namespace(&slot.namespace_name()));

    let listed = node.request(Method::GET, "/sandboxes", Some("key-t"), None).await;
    assert_eq!(listed.status, StatusCode::OK);
    let ids: Vec<&str> = listed
        .body
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|s| s["sandbox_id"].as_str())
        .collect();
    assert_eq!(ids, [id.as_str()]);

    let deleted = node
        .request(Method::DELETE, &format!("/sandboxes/{id}"), Some("key-t"), None)
        .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    assert!(node.kv.get(&slot.kv_key()).await?.is_none());
    assert!(!node.net.has_namespace(&slot.namespace_name()));
    assert!(!node.net.has_link(&NetScope::Host, &slot.veth_name()));
    assert!(node.net.is_pristine());
    assert!(!node.has_instance_dir(&id));
    assert!(!node.hosts().contains(&id));
    assert!(node.hosts().contains("localhost"));
    Ok(())
}

#[tokio::test]
async fn test_third_create_hits_the_tier_cap() -> anyhow::Result<()> {
    let node = Node::new().await;

    assert_eq!(node.create("key-t").await.status, StatusCode::CREATED);
    assert_eq!(node.create("key-t").await.status, StatusCode::CREATED);

    let third = node.create("key-t").await;
    assert_eq!(third.status, StatusCode::FORBIDDEN);
    assert!(third.body.to_string().contains('2'));
    assert_eq!(third.str("error_type"), "forbidden");

    // The rejected request never reached the driver.
    assert_eq!(node.driver.list_tasks().await.len(), 2);
    assert_eq!(node.kv.len().await, 2);

    // Other teams have their own cap.
    assert_eq!(node.create("key-a").await.status, StatusCode::CREATED);
    Ok(())
}

#[tokio::test]
async fn test_keep_alive_is_clamped_to_the_lifetime() -> anyhow::Result<()> {
    let node = Node::new().await;
    let id = node.create("key-t").await.str("sandbox_id");
    let refresh = format!("/sandboxes/{id}/refreshes");

    let sandbox = node
        .request(Method::GET, &format!("/sandboxes/{id}"), Some("key-t"), None)
        .await;
    let t0 = DateTime::parse_from_rfc3339(&sandbox.str("started_at"))?.with_timezone(&Utc);

    // Keep the sandbox alive for as long as it may live.
    let timeout = node
        .request(
            Method::POST,
            &format!("/sandboxes/{id}/timeout"),
            Some("key-t"),
            Some(json!({ "timeout": 48 * 3600 })),
        )
        .await;
    assert_eq!(timeout.status, StatusCode::NO_CONTENT);

    node.clock.set(t0 + chrono::Duration::seconds(24 * 3600 - 5));
    let response = node
        .request(Method::POST, &refresh, Some("key-t"), Some(json!({ "duration": 60 })))
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(node.cache.ttl(&id).await, Some(Duration::from_secs(5)));

    node.clock.set(t0 + chrono::Duration::hours(24));
    let response = node
        .request(Method::POST, &refresh, Some("key-t"), Some(json!({ "duration": 60 })))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_refresh_accepts_an_empty_body() -> anyhow::Result<()> {
    let node = Node::new().await;
    let id = node.create("key-t").await.str("sandbox_id");

    let response = node
        .request(Method::POST, &format!("/sandboxes/{id}/refreshes"), Some("key-t"), None)
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(node.cache.ttl(&id).await, Some(Duration::from_secs(15)));

    // Durations below the minimum are raised to it.
    node.clock.advance(Duration::from_secs(10));
    let response = node
        .request(
            Method::POST,
            &format!("/sandboxes/{id}/refreshes"),
            Some("key-t"),
            Some(json!({ "duration": 1 })),
        )
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(node.cache.ttl(&id).await, Some(Duration::from_secs(15)));

    let missing = node
        .request(Method::POST, "/sandboxes/nope/refreshes", Some("key-t"), None)
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_crashed_vmm_frees_its_slot() -> anyhow::Result<()> {
    // Only slot 42 is free.
    let node = Node::with_slot_count(43).await;
    for idx in 0..42 {
        node.kv
            .put(&Slot::key_for(NODE, idx), &format!("other-{idx}"))
            .await;
    }

    let s1 = node.create("key-t").await.str("sandbox_id");
    let status = node.driver.inspect_task(&s1).await?;
    assert_eq!(status.slot_idx, 42);
    assert!(node.net.has_namespace("ns-42"));

    node.launcher.vmm(&s1).expect("launched").crash();
    let report = node.reconciler.reconcile_once().await;
    assert_eq!(report.evicted, vec![s1.clone()]);

    assert!(node.kv.get(&Slot::key_for(NODE, 42)).await?.is_none());
    assert!(!node.net.has_namespace("ns-42"));
    assert!(node.cache.get(&s1).await.is_none());

    let next = node.create("key-t").await;
    assert_eq!(next.status, StatusCode::CREATED);
    let status = node.driver.inspect_task(&next.str("sandbox_id")).await?;
    assert_eq!(status.slot_idx, 42);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_masquerade_rolls_back_the_network() -> anyhow::Result<()> {
    let node = Node::new().await;
    node.net.fail_when("-A POSTROUTING");

    let response = node.create("key-t").await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.body.get("details").is_none());

    assert!(node.net.is_pristine());
    assert!(node.kv.is_empty().await);
    assert!(node.driver.list_tasks().await.is_empty());
    assert_eq!(node.cache.count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_foreign_sandbox_cannot_be_deleted() -> anyhow::Result<()> {
    let node = Node::new().await;
    let x = node.create("key-a").await.str("sandbox_id");
    let uri = format!("/sandboxes/{x}");

    let foreign = node.request(Method::DELETE, &uri, Some("key-b"), None).await;
    assert_eq!(foreign.status, StatusCode::UNAUTHORIZED);
    assert!(node.cache.get(&x).await.is_some());

    let listed = node.request(Method::GET, "/sandboxes", Some("key-b"), None).await;
    assert_eq!(listed.body, json!([]));

    let own = node.request(Method::DELETE, &uri, Some("key-a"), None).await;
    assert_eq!(own.status, StatusCode::NO_CONTENT);

    let again = node.request(Method::DELETE, &uri, Some("key-a"), None).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_requests_need_a_known_api_key() -> anyhow::Result<()> {
    let node = Node::new().await;

    let missing = node.request(Method::GET, "/sandboxes", None, None).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

    let wrong = node.request(Method::GET, "/sandboxes", Some("nope"), None).await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.str("error_type"), "authentication_error");

    let health = node.request(Method::GET, "/health", None, None).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.str("status"), "ok");
    Ok(())
}

#[tokio::test]
async fn test_template_resolution_errors() -> anyhow::Result<()> {
    let node = Node::new().await;

    let unknown = node
        .request(
            Method::POST,
            "/sandboxes",
            Some("key-t"),
            Some(json!({ "template_id": "nope" })),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);

    let private = node
        .request(
            Method::POST,
            "/sandboxes",
            Some("key-a"),
            Some(json!({ "template_id": "tpl_private" })),
        )
        .await;
    assert_eq!(private.status, StatusCode::FORBIDDEN);

    let by_alias = node
        .request(
            Method::POST,
            "/sandboxes",
            Some("key-a"),
            Some(json!({ "template_id": "python" })),
        )
        .await;
    assert_eq!(by_alias.status, StatusCode::CREATED);
    assert_eq!(by_alias.str("template_id"), "tpl_abc");
    assert_eq!(by_alias.str("alias"), "python");
    Ok(())
}

#[tokio::test]
async fn test_negative_timeout_kills_the_sandbox() -> anyhow::Result<()> {
    let node = Node::new().await;
    let id = node.create("key-t").await.str("sandbox_id");

    let response = node
        .request(
            Method::POST,
            &format!("/sandboxes/{id}/timeout"),
            Some("key-t"),
            Some(json!({ "timeout": -1 })),
        )
        .await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(node.cache.get(&id).await.is_none());
    assert!(node.driver.list_tasks().await.is_empty());
    assert!(node.kv.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn test_expired_sandboxes_are_destroyed() -> anyhow::Result<()> {
    let node = Node::new().await;
    let id = node.create("key-t").await.str("sandbox_id");

    node.clock.advance(Duration::from_secs(15));
    assert_eq!(node.cache.evict_expired().await, vec![id.clone()]);
    assert!(node.driver.list_tasks().await.is_empty());
    assert!(node.net.is_pristine());
    assert!(!node.has_instance_dir(&id));
    Ok(())
}

#[tokio::test]
async fn test_build_logs_channel() -> anyhow::Result<()> {
    let node = Node::new().await;
    let logs = "/templates/tpl_abc/builds/b1/logs";

    let rejected = node
        .request(
            Method::POST,
            logs,
            None,
            Some(json!({ "api_secret": "wrong", "logs": ["x"] })),
        )
        .await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);

    for (lines, status) in [(json!(["one", "two"]), json!(null)), (json!(["three"]), json!("success"))] {
        let pushed = node
            .request(
                Method::POST,
                logs,
                None,
                Some(json!({ "api_secret": common::BUILD_SECRET, "logs": lines, "status": status })),
            )
            .await;
        assert_eq!(pushed.status, StatusCode::CREATED);
    }

    let status = node
        .request(
            Method::GET,
            "/templates/tpl_abc/builds/b1/status?logs_offset=1",
            Some("key-t"),
            None,
        )
        .await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.str("status"), "success");
    assert_eq!(status.body["logs"], json!(["two", "three"]));

    node.clock.advance(Duration::from_secs(300));
    let expired = node
        .request(
            Method::GET,
            "/templates/tpl_abc/builds/b1/status",
            Some("key-t"),
            None,
        )
        .await;
    assert_eq!(expired.status, StatusCode::NOT_FOUND);
    Ok(())
}
