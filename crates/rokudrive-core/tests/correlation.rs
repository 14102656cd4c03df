//! Response-to-request matching over a single shared socket.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;

use common::{bind, client_for, ok, read_request, write_response};

use rokudrive_core::protocol::ResponseEnvelope;
use rokudrive_core::request::BaseType;

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let first = read_request(&mut stream).await.unwrap();
        let second = read_request(&mut stream).await.unwrap();

        // Answer in reverse order, echoing the key path back as the value.
        for request in [second, first] {
            let value = request.args["keyPath"].clone();
            write_response(&mut stream, &ok(&request.id, json!({"found": true, "value": value})), &[])
                .await;
        }
        while read_request(&mut stream).await.is_some() {}
    });

    let client = client_for(addr);
    let (a, b) = tokio::join!(
        client.get_value(BaseType::Scene, "a"),
        client.get_value(BaseType::Scene, "b"),
    );

    assert_eq!(a.unwrap().value, json!("a"));
    assert_eq!(b.unwrap().value, json!("b"));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_many_concurrent_requests_share_one_socket() {
    const COUNT: usize = 20;
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        for _ in 0..COUNT {
            received.push(read_request(&mut stream).await.unwrap());
        }
        // Interleave: odd positions first, then even.
        let (odd, even): (Vec<_>, Vec<_>) = received
            .into_iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 1);
        for (_, request) in odd.into_iter().chain(even) {
            let value = request.args["keyPath"].clone();
            write_response(&mut stream, &ok(&request.id, json!({"found": true, "value": value})), &[])
                .await;
        }
        while read_request(&mut stream).await.is_some() {}
    });

    let client = Arc::new(client_for(addr));
    let mut tasks = JoinSet::new();
    for i in 0..COUNT {
        let client = client.clone();
        tasks.spawn(async move { (i, client.get_value(BaseType::Global, format!("key{i}")).await) });
    }

    let mut results = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (i, result) = joined.unwrap();
        results.insert(i, result.unwrap().value);
    }

    assert_eq!(results.len(), COUNT);
    for (i, value) in results {
        assert_eq!(value, json!(format!("key{i}")));
    }
}

#[tokio::test]
async fn test_duplicate_response_is_delivered_once() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let first = read_request(&mut stream).await.unwrap();
        write_response(&mut stream, &ok(&first.id, json!({"found": true, "value": 1})), &[]).await;
        write_response(&mut stream, &ok(&first.id, json!({"found": true, "value": 2})), &[]).await;

        let second = read_request(&mut stream).await.unwrap();
        write_response(&mut stream, &ok(&second.id, json!({"found": true, "value": 3})), &[]).await;
        while read_request(&mut stream).await.is_some() {}
    });

    let client = client_for(addr);
    let first = client.get_value(BaseType::Global, "x").await.unwrap();
    let second = client.get_value(BaseType::Global, "x").await.unwrap();

    assert_eq!(first.value, json!(1));
    // The stray duplicate must not be mistaken for the second answer.
    assert_eq!(second.value, json!(3));
}

#[tokio::test]
async fn test_response_with_unknown_id_is_ignored() {
    let (listener, addr) = bind().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await.unwrap();
        write_response(&mut stream, &ResponseEnvelope::failure("not-a-real-id", "boom"), &[]).await;
        write_response(&mut stream, &ok(&request.id, json!({"host": "10.0.0.2"})), &[]).await;
        while read_request(&mut stream).await.is_some() {}
    });

    let client = client_for(addr);
    assert_eq!(client.get_server_host().await.unwrap(), "10.0.0.2");
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let (listener, addr) = bind().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Some(request) = read_request(&mut stream).await {
            let _ = tx.send(request.id.clone());
            write_response(&mut stream, &ok(&request.id, json!({})), &[]).await;
        }
    });

    let client = client_for(addr);
    for _ in 0..5 {
        client.focus_node(BaseType::FocusedNode, "", true).await.unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(rx.recv().await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}
