//! REST handlers for the collector API.
//!
//! `POST /api/v1/upload` takes one `TrafficLog` as JSON and returns 204;
//! `GET /api/v1/query?ip=..|pid=..[&limit=N]` returns a JSON array,
//! newest first. Validation happens here so dirty records never reach
//! the store.

use std::net::Ipv4Addr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use tracing::warn;

use muninn_model::TrafficLog;

use crate::storage::Store;

const DEFAULT_LIMIT: usize = 200;
const MAX_LIMIT: usize = 2000;

pub async fn route<B>(req: Request<B>, store: Arc<dyn Store>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/api/v1/upload") => upload(req, store).await,
        (&Method::GET, "/api/v1/query") => query(&req, store),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn upload<B>(req: Request<B>, store: Arc<dyn Store>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("reading body: {err}"))
        }
    };

    let entry: TrafficLog = match serde_json::from_slice(&body) {
        Ok(entry) => entry,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {err}"))
        }
    };

    if let Err(reason) = validate(&entry) {
        return error_response(StatusCode::BAD_REQUEST, reason);
    }

    if let Err(err) = store.insert(&entry) {
        warn!(%err, "insert failed");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "insert failed");
    }

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

fn query<B>(req: &Request<B>, store: Arc<dyn Store>) -> Response<Full<Bytes>> {
    let raw_query = req.uri().query().unwrap_or("");
    let limit = query_param(raw_query, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0 && v <= MAX_LIMIT)
        .unwrap_or(DEFAULT_LIMIT);

    // pid takes precedence over ip when both are present.
    let rows = if let Some(pid) = query_param(raw_query, "pid").and_then(|v| v.parse::<u32>().ok())
    {
        store.query_by_pid(pid, limit)
    } else if let Some(ip) = query_param(raw_query, "ip").filter(|v| v.parse::<Ipv4Addr>().is_ok())
    {
        store.query_by_ip(ip, limit)
    } else {
        return error_response(StatusCode::BAD_REQUEST, "a valid ip or pid parameter is required");
    };

    match rows {
        Ok(rows) => match serde_json::to_vec(&rows) {
            Ok(body) => json_response(StatusCode::OK, Bytes::from(body)),
            Err(err) => {
                warn!(%err, "encoding rows failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
            }
        },
        Err(err) => {
            warn!(%err, "query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "query failed")
        }
    }
}

fn validate(entry: &TrafficLog) -> Result<(), &'static str> {
    if entry.src_ip.parse::<Ipv4Addr>().is_err() || entry.dst_ip.parse::<Ipv4Addr>().is_err() {
        return Err("src_ip/dst_ip must be IPv4 addresses");
    }
    if entry.src_port == 0 || entry.dst_port == 0 {
        return Err("src_port/dst_port must be in 1..=65535");
    }
    if entry.http_method.is_empty() || entry.http_path.is_empty() || entry.status_code == 0 {
        return Err("http_method/http_path/status_code must be set");
    }
    Ok(())
}

fn query_param<'a>(raw_query: &'a str, name: &str) -> Option<&'a str> {
    raw_query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = json!({ "error": message }).to_string();
    json_response(status, Bytes::from(body))
}
