//! The HTTP update API
//!
//! A single endpoint accepts `POST /` with a signed update body and feeds
//! it through admission. The caller learns nothing beyond success or "Not
//! Found" - rejection causes are logged server-side only.

use std::io::{Cursor, Read};
use std::sync::Arc;

use tiny_http::{Method, Request, Response, Server};

use crate::dns::context::ServerContext;
use crate::dns::update;
use crate::web::Result;

/// Updates are tiny; anything larger than this is not an update.
const MAX_BODY_BYTES: u64 = 4096;

type JsonResponse = Response<Cursor<Vec<u8>>>;

fn json_response(code: u16, message: &str) -> JsonResponse {
    let body = serde_json::json!({ "code": code, "message": message });

    Response::from_string(body.to_string())
        .with_status_code(code)
        .with_header::<tiny_http::Header>("Content-Type: application/json".parse().unwrap())
}

fn not_found_response() -> JsonResponse {
    json_response(404, "Not Found")
}

pub struct WebServer {
    pub context: Arc<ServerContext>,
}

impl WebServer {
    pub fn new(context: Arc<ServerContext>) -> WebServer {
        WebServer { context }
    }

    /// Route an HTTP request to the appropriate handler
    fn route_request(&self, request: &mut Request) -> Result<JsonResponse> {
        let url = request.url().to_string();
        let url_parts: Vec<&str> = url.split('/').filter(|x| !x.is_empty()).collect();

        match (request.method(), url_parts.as_slice()) {
            (Method::Post, []) => self.apply_update(request),
            (_, _) => Ok(not_found_response()),
        }
    }

    fn apply_update(&self, request: &mut Request) -> Result<JsonResponse> {
        let mut body = Vec::new();
        request
            .as_reader()
            .take(MAX_BODY_BYTES)
            .read_to_end(&mut body)?;

        match update::admit(&self.context, &body) {
            Ok(_) => Ok(json_response(200, "success")),
            Err(err) => {
                log::info!("update rejected: {}", err);
                Ok(not_found_response())
            }
        }
    }

    /// Handle a single HTTP request
    fn handle_request(&self, mut request: Request) {
        log::info!("HTTP {:?} {:?}", request.method(), request.url());

        let response = self.route_request(&mut request);

        let response_result = match response {
            Ok(response) => request.respond(response),
            Err(err) => {
                log::info!("Request failed: {}", err);
                request.respond(not_found_response())
            }
        };

        if let Err(err) = response_result {
            log::info!("Failed to write response to client: {:?}", err);
        }
    }

    /// Run the listener on the current thread; never returns under normal
    /// operation.
    pub fn run_webserver(self) {
        let webserver = match Server::http((self.context.http_api.host.as_str(), self.context.http_api.port)) {
            Ok(x) => x,
            Err(e) => {
                log::error!("Failed to start update API server: {:?}", e);
                return;
            }
        };

        log::info!("update API server listening on `{}`", self.context.http_api);

        for request in webserver.incoming_requests() {
            self.handle_request(request);
        }
    }
}
