use std::collections::BTreeSet;
use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Bytes, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::network_client::NetworkClient;
use crate::node::ChordNode;

fn format_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn not_found() -> Response<Full<Bytes>> {
    format_response(
        StatusCode::NOT_FOUND,
        json!({ "error": "Not Found" }).to_string(),
    )
}

fn ping() -> Response<Full<Bytes>> {
    format_response(StatusCode::OK, json!({ "message": "pong" }).to_string())
}

pub(crate) fn state_json<T: NetworkClient>(node: &ChordNode<T>) -> Value {
    // Most fingers repeat; report each distinct node once
    let fingers: BTreeSet<String> = node
        .finger_table()
        .into_iter()
        .map(|finger| finger.address)
        .collect();

    json!({
        "id": hex::encode(node.id()),
        "address": node.address(),
        "predecessor": node.predecessor().map(|p| p.address),
        "successors": node
            .successor_list()
            .into_iter()
            .map(|s| s.address)
            .collect::<Vec<_>>(),
        "fingers": fingers,
        "keys": node.local_entries().len(),
    })
}

async fn handler<T: NetworkClient>(
    node: ChordNode<T>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/ping") => Ok(ping()),
        (&Method::GET, "/state") => Ok(format_response(
            StatusCode::OK,
            state_json(&node).to_string(),
        )),
        _ => Ok(not_found()),
    }
}

/// Serves the status API on localhost until the task is dropped.
pub async fn run<T: NetworkClient>(
    node: ChordNode<T>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await?;

    log_info!(node.address(), "API is listening on http://{}", addr);
    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let node = node.clone();
        tokio::task::spawn(async move {
            let address = node.address().to_string();
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handler(node.clone(), req)))
                .await
            {
                log_error!(address, "Error serving connection: {:?}", err);
            }
        });
    }
}
