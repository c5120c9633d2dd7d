use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initializes the global tracing subscriber. JSON output in any non-local
/// environment (log aggregators expect structured lines); pretty output
/// locally.
pub fn init(environment: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("perry=info,tower_http=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);

    if environment == "local" {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    }
}

/// Opens a request span carrying path/host/query so every log line emitted
/// while handling the request carries them. The fields must be declared on
/// the span itself (`tracing::field::Empty` placeholders) — recording
/// against whatever span happens to be ambient, with no declared fields,
/// silently drops the values.
pub async fn enrich_current_span(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri().clone();
    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let span = tracing::info_span!(
        "http_request",
        http.uri = tracing::field::Empty,
        http.host = tracing::field::Empty,
        http.query = tracing::field::Empty,
    );
    span.record("http.uri", uri.path());
    span.record("http.host", host.as_str());
    if let Some(query) = uri.query() {
        span.record("http.query", query);
    }

    next.run(req).instrument(span).await
}
