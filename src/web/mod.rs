pub mod icon;
pub mod root_desc;
pub mod soap;
pub mod stream;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use crate::events;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_desc::presentation))
        .route("/rootDesc.xml", get(root_desc::root_desc))
        .route("/scpd/{service}", get(root_desc::scpd))
        .route("/ctl", post(soap::control))
        .route("/res", get(stream::serve_res).head(stream::serve_res))
        .route("/subtitle", get(stream::serve_subtitle))
        .route("/icon", get(icon::item_icon))
        .route("/deviceIcon/{index}", get(icon::device_icon))
        .route("/evt/ContentDirectory", axum::routing::any(evt_content_directory))
        .layer(middleware::from_fn_with_state(state.clone(), add_common_headers))
        .with_state(state)
}

/// Sets the two headers §4.6 requires on every response: an empty `EXT`
/// (device advertises UPnP 1.0 compliance) and `Server` identifying this
/// implementation.
async fn add_common_headers(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("EXT", HeaderValue::from_static(""));
    headers.insert(header::SERVER, HeaderValue::from_static(state.config.server_field()));
    response
}

async fn evt_content_directory(
    method: axum::http::Method,
    state: axum::extract::State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    if method.as_str() == "SUBSCRIBE" {
        events::handle_subscribe(state, headers).await
    } else {
        events::handle_unsubscribe(state, headers).await.into_response()
    }
}
