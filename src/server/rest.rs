//! Minimal REST server for the library API.
//!
//! The route set is closed, so paths are matched by hand instead of
//! going through a routing framework. All responses are pretty-printed
//! JSON; enums serialize by name.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Error;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use qsl_api_types::{check_volume_tag, Operation};

use crate::api2;
use crate::tape::Library;

static JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Serves the library API until the shutdown future resolves.
pub async fn serve(
    library: Arc<Library>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let make_service = make_service_fn(move |_conn: &AddrStream| {
        let library = Arc::clone(&library);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let library = Arc::clone(&library);
                async move { Ok::<_, Infallible>(handle_request(library, request).await) }
            }))
        }
    });

    let server = hyper::Server::try_bind(&addr)?.serve(make_service);
    log::info!("listening on http://{}", addr);

    server.with_graceful_shutdown(shutdown).await?;
    Ok(())
}

fn json_response<T: Serialize>(data: &T) -> Response<Body> {
    let body = serde_json::to_string_pretty(data)
        .unwrap_or_else(|err| format!(r#"{{"error":"serialization failed: {}"}}"#, err));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(body.into())
        .unwrap_or_default()
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::to_string_pretty(&json!({ "error": message }))
        .unwrap_or_else(|_| String::from("{}"));
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(body.into())
        .unwrap_or_default()
}

/// Wrong method on a known route.
fn invalid_request() -> Response<Body> {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Invalid request")
}

fn bad_path(expected: &str) -> Response<Body> {
    error_response(
        StatusCode::BAD_REQUEST,
        &format!("invalid path - expected {}", expected),
    )
}

fn bad_volume_tag(tape: &str) -> Response<Body> {
    error_response(
        StatusCode::BAD_REQUEST,
        &format!("invalid volume tag '{}' - expected 8 characters", tape),
    )
}

fn parse_number(text: &str, expected: &str) -> Result<u64, Response<Body>> {
    text.parse().map_err(|_| bad_path(expected))
}

pub async fn handle_request(library: Arc<Library>, request: Request<Body>) -> Response<Body> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    // normalize: drop empty components, refuse hidden ones
    let components: Vec<&str> = path.split('/').filter(|name| !name.is_empty()).collect();
    if components.iter().any(|name| name.starts_with('.')) {
        return error_response(StatusCode::BAD_REQUEST, "Path contains illegal components.");
    }

    let response = match components.split_first() {
        Some((&"library", rest)) => route_library(&library, &method, rest).await,
        _ => error_response(StatusCode::NOT_FOUND, "Path not found."),
    };

    if !response.status().is_success() {
        log::error!(
            "{} {}: {} {}",
            method,
            path,
            response.status().as_str(),
            response.status().canonical_reason().unwrap_or("-"),
        );
    }
    response
}

async fn route_library(library: &Arc<Library>, method: &Method, rest: &[&str]) -> Response<Body> {
    match rest.first().copied() {
        Some("verify") => {
            if *method != Method::GET {
                return invalid_request();
            }
            json_response(&api2::verify(library).await)
        }
        Some("data") | Some("drives") | Some("tapes") | Some("slots") => {
            if *method != Method::GET {
                return invalid_request();
            }
            let name = rest[0];
            let force = match &rest[1..] {
                [] => false,
                ["force"] => true,
                _ => return bad_path(&format!("/library/{}[/force]", name)),
            };
            match name {
                "data" => json_response(&api2::library_data(library, force).await),
                "drives" => json_response(&api2::drives(library, force).await),
                "tapes" => json_response(&api2::tapes(library, force).await),
                _ => json_response(&api2::slots(library, force).await),
            }
        }
        Some("load") => {
            if *method != Method::POST {
                return invalid_request();
            }
            const SHAPE: &str = "/library/load/{drive}/{tape}";
            let (drive, tape) = match &rest[1..] {
                [drive, tape] => (*drive, *tape),
                _ => return bad_path(SHAPE),
            };
            let drive = match parse_number(drive, SHAPE) {
                Ok(drive) => drive,
                Err(response) => return response,
            };
            if check_volume_tag(tape).is_err() {
                return bad_volume_tag(tape);
            }
            json_response(&library.load(tape.to_string(), drive).await)
        }
        Some("unload") => {
            drive_operation(library, method, &rest[1..], "/library/unload/{drive}", |library, drive| {
                Box::pin(async move { library.unload(drive).await })
            })
            .await
        }
        Some("mount") => {
            drive_operation(library, method, &rest[1..], "/library/mount/{drive}", |library, drive| {
                Box::pin(async move { library.mount(drive).await })
            })
            .await
        }
        Some("unmount") => {
            drive_operation(library, method, &rest[1..], "/library/unmount/{drive}", |library, drive| {
                Box::pin(async move { library.unmount(drive).await })
            })
            .await
        }
        Some("format") => {
            if *method != Method::POST {
                return invalid_request();
            }
            const SHAPE: &str = "/library/format/{drive}[/force]";
            let (drive, force) = match &rest[1..] {
                [drive] => (*drive, false),
                [drive, "force"] => (*drive, true),
                _ => return bad_path(SHAPE),
            };
            match parse_number(drive, SHAPE) {
                Ok(drive) => json_response(&library.format(drive, force).await),
                Err(response) => response,
            }
        }
        Some("ltfsck") => {
            drive_operation(library, method, &rest[1..], "/library/ltfsck/{drive}", |library, drive| {
                Box::pin(async move { library.ltfsck(drive).await })
            })
            .await
        }
        Some("transfer") => {
            if *method != Method::POST {
                return invalid_request();
            }
            const SHAPE: &str = "/library/transfer/{tape}/{slot}";
            let (tape, slot) = match &rest[1..] {
                [tape, slot] => (*tape, *slot),
                _ => return bad_path(SHAPE),
            };
            if check_volume_tag(tape).is_err() {
                return bad_volume_tag(tape);
            }
            match parse_number(slot, SHAPE) {
                Ok(slot) => json_response(&library.transfer(tape.to_string(), slot).await),
                Err(response) => response,
            }
        }
        Some("release") => {
            if *method != Method::POST {
                return invalid_request();
            }
            if rest.len() != 1 {
                return bad_path("/library/release");
            }
            json_response(&library.release().await)
        }
        Some("operation") => {
            if *method != Method::GET {
                return invalid_request();
            }
            const SHAPE: &str = "/library/operation/{trace_id}[/{ticks}]";
            let (trace_id, since) = match &rest[1..] {
                [trace_id] => (*trace_id, None),
                [trace_id, ticks] => match ticks.parse::<i64>() {
                    Ok(ticks) => (*trace_id, Some(ticks)),
                    Err(_) => return bad_path(SHAPE),
                },
                _ => return bad_path(SHAPE),
            };
            json_response(&api2::operation(library, trace_id, since))
        }
        Some("help") => {
            if *method != Method::GET {
                return invalid_request();
            }
            json_response(&api2::help())
        }
        _ => error_response(StatusCode::NOT_FOUND, "Path not found."),
    }
}

/// Common shape of the POST `/library/{op}/{drive}` routes.
async fn drive_operation<F>(
    library: &Arc<Library>,
    method: &Method,
    args: &[&str],
    shape: &'static str,
    run: F,
) -> Response<Body>
where
    F: FnOnce(Arc<Library>, u64) -> Pin<Box<dyn Future<Output = Operation> + Send>>,
{
    if *method != Method::POST {
        return invalid_request();
    }
    let drive = match args {
        [drive] => *drive,
        _ => return bad_path(shape),
    };
    match parse_number(drive, shape) {
        Ok(drive) => json_response(&run(Arc::clone(library), drive).await),
        Err(response) => response,
    }
}
