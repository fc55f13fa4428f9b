use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use log::debug;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

/// A request the site received
#[derive(Debug, Clone)]
pub struct Hit {
    pub path: String,
    pub at: Instant,
}

#[derive(Default)]
struct SiteState {
    hits: Mutex<Vec<Hit>>,
}

/// Local website with a robots policy, one listing page and a few items.
///
/// `/` links to `/list/1`, `/item/1`, the disallowed `/item/99`, an
/// external item and a fragment. `/list/1` links to `/item/2` and to
/// `/item/3` with a tracking parameter.
pub struct TestSite {
    addr: SocketAddr,
    state: Arc<SiteState>,
    // serves until dropped
    _runtime: Runtime,
}

const ROBOTS: &str = "User-agent: *\nDisallow: /item/99\n";

fn html(body: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
}

fn page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|l| format!("<a href=\"{}\">{}</a>\n", l, l))
        .collect();
    format!(
        "<html><head><title>{}</title></head><body>{}</body></html>",
        title, anchors
    )
}

async fn respond(State(state): State<Arc<SiteState>>, uri: Uri) -> Response {
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    debug!("site: {}", path);
    state
        .hits
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(Hit {
            path: path.clone(),
            at: Instant::now(),
        });

    match uri.path() {
        "/robots.txt" => (StatusCode::OK, ROBOTS).into_response(),
        "/" => html(page(
            "Index",
            &[
                "/list/1",
                "/item/1",
                "/item/99",
                "http://other.example/item/5",
                "#top",
            ],
        )),
        "/list/1" => html(page("List", &["/item/2", "/item/3?utm_source=list", "/item/1"])),
        p if p.starts_with("/item/") => {
            let id = &p["/item/".len()..];
            html(page(&format!("Item {}", id), &["/"]))
        }
        _ => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

impl TestSite {
    pub fn start() -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let state = Arc::new(SiteState::default());
        let app = Router::new().fallback(respond).with_state(state.clone());

        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0"))?;
        let addr = listener.local_addr()?;
        runtime.spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("test site failed: {}", e);
            }
        });
        Ok(Self {
            addr,
            state,
            _runtime: runtime,
        })
    }

    /// `http://127.0.0.1:<port>/`
    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.state
            .hits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of requests for `path`
    pub fn hits_for(&self, path: &str) -> usize {
        self.hits().iter().filter(|h| h.path == path).count()
    }

    /// Page requests in arrival order, robots lookups excluded
    pub fn page_hits(&self) -> Vec<Hit> {
        self.hits()
            .into_iter()
            .filter(|h| h.path != "/robots.txt")
            .collect()
    }
}
