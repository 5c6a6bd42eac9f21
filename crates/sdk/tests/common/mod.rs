//! Local collector for integration tests.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{Method, StatusCode};
use axum::routing::any;
use axum::Router;
use parking_lot::Mutex;
use pulse_core::PulseConfig;
use std::sync::Arc;
use url::form_urlencoded;

/// What the collector answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    SuccessUppercase,
    Rejected,
    Malformed,
    ServerError,
}

/// One request as the collector saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub method: Method,
    pub query: String,
    pub body: Vec<u8>,
}

impl Received {
    /// Looks the parameter up in the query string, then in a form body.
    pub fn param(&self, name: &str) -> Option<String> {
        let find = |raw: &[u8]| {
            form_urlencoded::parse(raw)
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        };
        find(self.query.as_bytes()).or_else(|| find(&self.body))
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone)]
struct CollectorState {
    reply: Arc<Mutex<Reply>>,
    received: Arc<Mutex<Vec<Received>>>,
}

pub struct Collector {
    pub url: String,
    state: CollectorState,
}

impl Collector {
    pub async fn start(reply: Reply) -> Self {
        let state = CollectorState {
            reply: Arc::new(Mutex::new(reply)),
            received: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/i", any(ingest))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.state.reply.lock() = reply;
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    /// Config pointing at this collector with app key `K` and device id `dev-1`.
    pub fn config(&self) -> PulseConfig {
        let mut config = PulseConfig::new(self.url.clone(), "K");
        config.device_id = Some("dev-1".to_string());
        config
    }
}

async fn ingest(
    State(state): State<CollectorState>,
    method: Method,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> (StatusCode, String) {
    state.received.lock().push(Received {
        method,
        query: query.unwrap_or_default(),
        body: body.to_vec(),
    });
    let reply = *state.reply.lock();
    match reply {
        Reply::Success => (StatusCode::OK, r#"{"result":"Success"}"#.to_string()),
        Reply::SuccessUppercase => (StatusCode::OK, r#"{"result":"SUCCESS"}"#.to_string()),
        Reply::Rejected => (StatusCode::OK, r#"{"result":"Error"}"#.to_string()),
        Reply::Malformed => (StatusCode::OK, "<html>ok</html>".to_string()),
        Reply::ServerError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"result":"Success"}"#.to_string(),
        ),
    }
}
