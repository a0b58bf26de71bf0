//! End-to-end behavior of the HTTP composite over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use converge_core::error::Error;
use converge_core::resource::Resource;
use converge_resources::exec::ExecRes;
use converge_resources::http::{HttpFlagRes, HttpServerRes};
use converge_runtime::runner::Runner;

async fn request(addr: SocketAddr, raw: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn post(path: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: test\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
}

#[tokio::test]
async fn posted_form_values_flow_through_the_flag_child() {
    let server = HttpServerRes::new("srv");
    server
        .adopt_child(Arc::new(HttpFlagRes::new("flag", "/flag", "k")))
        .unwrap();
    let server = Arc::new(server);
    let mut runner = Runner::start(Arc::clone(&server) as Arc<dyn Resource>)
        .await
        .unwrap();
    let addr = server.bound_addr().unwrap();

    let response = request(addr, post("/flag", "k=v")).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    // The child's event bubbles up through the parent's multiplexer.
    assert_eq!(runner.next_event().await, Some(()));

    // First apply after the POST publishes the value and reports a change.
    assert!(!runner.converge().await.unwrap());
    assert_eq!(
        server.child_sends("flag").unwrap().value_str("value"),
        Some("v")
    );

    // No new POSTs: settled, and the value is re-sent from cache.
    assert!(runner.converge().await.unwrap());
    assert_eq!(
        server.child_sends("flag").unwrap().value_str("value"),
        Some("v")
    );

    // An empty field value is captured as the empty string, not unset.
    let response = request(addr, post("/flag", "k=")).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert_eq!(runner.next_event().await, Some(()));
    assert!(!runner.converge().await.unwrap());
    assert_eq!(
        server.child_sends("flag").unwrap().value_str("value"),
        Some("")
    );

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn non_post_and_unmatched_paths_get_rejected() {
    let server = HttpServerRes::new("srv");
    server
        .adopt_child(Arc::new(HttpFlagRes::new("flag", "/flag", "k")))
        .unwrap();
    let server = Arc::new(server);
    let runner = Runner::start(Arc::clone(&server) as Arc<dyn Resource>)
        .await
        .unwrap();
    let addr = server.bound_addr().unwrap();

    let response = request(addr, get("/flag")).await;
    assert!(response.starts_with("HTTP/1.1 405"), "{response}");

    let response = request(addr, get("/elsewhere")).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn the_root_serves_files_with_traversal_protection() {
    let docs = tempfile::tempdir().unwrap();
    std::fs::write(docs.path().join("hello.txt"), b"static content").unwrap();

    let mut server = HttpServerRes::new("files");
    server.root = Some(docs.path().to_path_buf());
    let server = Arc::new(server);
    let runner = Runner::start(Arc::clone(&server) as Arc<dyn Resource>)
        .await
        .unwrap();
    let addr = server.bound_addr().unwrap();

    let response = request(addr, get("/hello.txt")).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("static content"), "{response}");

    let response = request(addr, get("/missing.txt")).await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    let response = request(addr, get("/../secret")).await;
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn dyn_adoption_accepts_flags_and_rejects_other_kinds() {
    let server = HttpServerRes::new("srv");
    let parent = server.as_group_parent().unwrap();

    let flag = Arc::new(HttpFlagRes::new("flag", "/flag", "k"));
    assert!(parent.groups(flag.as_ref()));
    parent.adopt(flag).unwrap();

    let mut exec_res = ExecRes::default();
    exec_res.name = "e".into();
    exec_res.cmd = "true".into();
    let exec = Arc::new(exec_res);
    assert!(!parent.groups(exec.as_ref()));
    assert!(matches!(parent.adopt(exec), Err(Error::Validation(_))));
}

#[tokio::test]
async fn interrupt_closes_the_server_immediately() {
    let server = Arc::new(HttpServerRes::new("srv"));
    let mut runner = Runner::start(Arc::clone(&server) as Arc<dyn Resource>)
        .await
        .unwrap();
    assert!(server.bound_addr().is_some());

    server.as_interruptible().unwrap().interrupt();
    // The forcible close ends the watch; the event stream drains to None.
    let ended = tokio::time::timeout(std::time::Duration::from_secs(5), runner.next_event())
        .await
        .unwrap();
    assert_eq!(ended, None);
    runner.shutdown().await.unwrap();
}
