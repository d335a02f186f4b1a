//! HTTPS request classifier.
//!
//! Implements the ordered classification: peer check, index page, static
//! assets, hash validation, local hit, and peer delegation. Built directly
//! on `hyper` as a bare `Service`, matching the teacher's habit of
//! hand-writing the transport layer rather than reaching for a REST
//! framework.

use std::net::IpAddr;
use std::sync::Arc;

use handlebars::Handlebars;
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION};
use hyper::{Body, Method, Request, Response, StatusCode};
use once_cell::sync::Lazy;
use serde_json::json;

use crate::daemon::Daemon;
use crate::lookup::{self, LookupResult};

const INDEX_TEMPLATE: &str = include_str!("../data/index.html.hbs");

static TEMPLATES: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hbs = Handlebars::new();
    hbs.register_template_string("index", INDEX_TEMPLATE)
        .expect("index template must be valid handlebars");
    hbs
});

fn is_loopback(addr: IpAddr) -> bool {
    addr.is_loopback()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn html_status(status: StatusCode, reason: &str) -> Response<Body> {
    let body = format!(
        "<html><head><title>{code}</title></head><body><h1>{code} {phrase}</h1><p>{reason}</p></body></html>",
        code = status.as_u16(),
        phrase = status.canonical_reason().unwrap_or(""),
        reason = escape_html(reason),
    );
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(body))
        .expect("static response is well-formed")
}

fn parse_sha256_query(query: Option<&str>) -> Result<Option<String>, ()> {
    let query = match query {
        Some(q) => q,
        None => return Ok(None),
    };
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "sha256" {
                if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Ok(Some(value.to_ascii_lowercase()));
                }
                return Err(());
            }
        }
    }
    Ok(None)
}

/// Handle one request; `peer` is the already-resolved remote socket
/// address of the accepted TLS connection.
pub async fn handle(daemon: Arc<Daemon>, req: Request<Body>, peer: IpAddr) -> Response<Body> {
    if req.method() != Method::GET {
        return html_status(StatusCode::FORBIDDEN, "only GET is accepted");
    }

    let loopback = is_loopback(peer);
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    if path == "/" {
        if !loopback {
            return html_status(StatusCode::FORBIDDEN, "index is loopback-only");
        }
        return render_index(&daemon).await;
    }

    if path == "/favicon.ico" || path == "/style.css" {
        if !loopback {
            return html_status(StatusCode::FORBIDDEN, "static assets are loopback-only");
        }
        return serve_static_asset(&path).await;
    }

    let hash = match parse_sha256_query(query.as_deref()) {
        Ok(Some(hash)) => hash,
        Ok(None) => return html_status(StatusCode::BAD_REQUEST, "missing sha256 query parameter"),
        Err(()) => {
            return html_status(
                StatusCode::NOT_ACCEPTABLE,
                "sha256 query parameter must be 64 hex characters",
            )
        }
    };

    let local_item = {
        let store = daemon.store.lock().await;
        store.get(&hash).cloned()
    };

    if let Some(item) = local_item {
        if item.flags.contains(crate::store::ItemFlags::DISABLED) {
            return html_status(StatusCode::LOCKED, "item is disabled");
        }
        return serve_item(&daemon, &item, loopback).await;
    }

    if loopback {
        // spec.md §4.4: the basename is the first path segment of the
        // request URL, never the whole trimmed path.
        let basename = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or("")
            .to_string();
        let backend = daemon.discovery.clone();
        return match lookup::resolve_redirect(backend.as_ref(), &hash, &basename).await {
            LookupResult::Redirect { location } => Response::builder()
                .status(StatusCode::SEE_OTHER)
                .header(LOCATION, location.clone())
                .header(CONTENT_TYPE, "text/html; charset=utf-8")
                .body(Body::from(format!(
                    "<html><body>redirecting to <a href=\"{0}\">{0}</a></body></html>",
                    location
                )))
                .expect("redirect response is well-formed"),
            LookupResult::NotFound => html_status(StatusCode::NOT_FOUND, "no peer has this item"),
        };
    }

    html_status(StatusCode::FORBIDDEN, "hash not held locally")
}

async fn serve_item(daemon: &Daemon, item: &crate::store::Item, loopback: bool) -> Response<Body> {
    let bytes = match tokio::fs::read(&item.storage_ref).await {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!("evicting {} after read failure: {}", item.hash, err);
            let mut store = daemon.store.lock().await;
            let _ = store.remove(&item.hash);
            return html_status(StatusCode::NOT_FOUND, "item is no longer available");
        }
    };

    let content_type = mime_guess::from_path(&item.basename)
        .first_or_octet_stream()
        .to_string();

    if !loopback {
        let evicted = {
            let mut store = daemon.store.lock().await;
            store.record_share(&item.hash).unwrap_or(false)
        };
        daemon.download_saving.fetch_add(bytes.len() as u64, std::sync::atomic::Ordering::Relaxed);
        if evicted {
            log::info!("{} reached its share limit and was evicted", item.hash);
        }
    }

    let mut builder = Response::builder().status(StatusCode::OK).header(CONTENT_TYPE, content_type);

    let disposition = format!("attachment; filename=\"{}\"", item.basename.replace('"', ""));
    match http::HeaderValue::from_str(&disposition) {
        Ok(value) => builder = builder.header(CONTENT_DISPOSITION, value),
        Err(_) => log::warn!(
            "basename for {} is not a valid header value, omitting Content-Disposition",
            item.hash
        ),
    }

    builder.body(Body::from(bytes)).expect("serve response is well-formed")
}

async fn render_index(daemon: &Daemon) -> Response<Body> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let store = daemon.store.lock().await;
    let items: Vec<_> = store
        .live_items()
        .map(|item| {
            let age = now.saturating_sub(item.ctime);
            let age_display = if item.max_age == crate::buildcfg::UNLIMITED {
                format!("{}/\u{221e}", age)
            } else {
                format!("{}/{}", age, item.max_age)
            };
            let share_display = if item.share_limit == crate::buildcfg::UNLIMITED {
                format!("{}/\u{221e}", item.share_count)
            } else {
                format!("{}/{}", item.share_count, item.share_limit)
            };
            json!({
                "basename": item.basename,
                "hash": item.hash,
                "cmdline": item.cmdline,
                "size": item.size,
                "age": age_display,
                "shares": share_display,
                "flags": item.flags.to_wire_string(),
            })
        })
        .collect();

    let data = json!({
        "name": daemon.instance_name,
        "version": env!("CARGO_PKG_VERSION"),
        "status": format!("{:?}", *daemon.status.lock().await),
        "items": items,
    });

    match TEMPLATES.render("index", &data) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(body))
            .expect("index response is well-formed"),
        Err(err) => html_status(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn serve_static_asset(path: &str) -> Response<Body> {
    let (bytes, content_type): (&[u8], &str) = match path {
        "/favicon.ico" => (
            include_bytes!("../data/favicon.ico"),
            "image/vnd.microsoft.icon",
        ),
        "/style.css" => (include_bytes!("../data/style.css"), "text/css"),
        _ => return html_status(StatusCode::NOT_FOUND, "no such asset"),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .expect("static asset response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sha256_is_ok_none() {
        assert_eq!(parse_sha256_query(None), Ok(None));
        assert_eq!(parse_sha256_query(Some("foo=bar")), Ok(None));
    }

    #[test]
    fn wrong_length_hash_is_rejected() {
        assert_eq!(parse_sha256_query(Some("sha256=deadbeef")), Err(()));
    }

    #[test]
    fn non_hex_hash_is_rejected() {
        let value = "z".repeat(64);
        assert_eq!(parse_sha256_query(Some(&format!("sha256={}", value))), Err(()));
    }

    #[test]
    fn well_formed_hash_is_accepted_and_lowercased() {
        let value = "A".repeat(64);
        assert_eq!(
            parse_sha256_query(Some(&format!("sha256={}", value))),
            Ok(Some("a".repeat(64)))
        );
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(!is_loopback("10.0.0.5".parse().unwrap()));
    }

    use crate::config::DaemonConfig;
    use crate::discovery::{FakeBackend, PeerAddr};
    use crate::store::{ContentStore, ItemFlags};

    const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
    const REMOTE: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 5));

    fn test_daemon() -> (tempfile::TempDir, Arc<Daemon>) {
        let (dir, daemon, _backend) = test_daemon_with_backend();
        (dir, daemon)
    }

    fn test_daemon_with_backend() -> (tempfile::TempDir, Arc<Daemon>, Arc<FakeBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let backend = Arc::new(FakeBackend::new());
        let daemon = Arc::new(Daemon::new(store, backend.clone(), DaemonConfig::default()));
        (dir, daemon, backend)
    }

    fn get(path_and_query: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .body(Body::empty())
            .unwrap()
    }

    // S1: a loopback caller requesting a hash held locally gets the bytes
    // back with the content-type and disposition headers set.
    #[tokio::test]
    async fn local_hit_serves_bytes_with_headers() {
        let (_dir, daemon) = test_daemon();
        let item = {
            let mut store = daemon.store.lock().await;
            store
                .add(b"hello world", "hello.txt", 86400, 5, 0, ItemFlags::empty(), "p")
                .unwrap()
        };

        let req = get(&format!("/hello.txt?sha256={}", item.hash));
        let resp = handle(daemon, req, LOOPBACK).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_DISPOSITION).unwrap().to_str().unwrap(),
            "attachment; filename=\"hello.txt\""
        );
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    // S2: a missing sha256 query parameter is rejected before any lookup.
    #[tokio::test]
    async fn missing_hash_is_bad_request() {
        let (_dir, daemon) = test_daemon();
        let resp = handle(daemon, get("/whatever"), LOOPBACK).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // S3: a malformed sha256 query parameter is rejected as not acceptable.
    #[tokio::test]
    async fn malformed_hash_is_not_acceptable() {
        let (_dir, daemon) = test_daemon();
        let resp = handle(daemon, get("/whatever?sha256=not-a-hash"), LOOPBACK).await;
        assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
    }

    // S4: a remote (non-loopback) peer asking for a hash this host doesn't
    // hold is refused outright, never redirected.
    #[tokio::test]
    async fn remote_peer_miss_is_forbidden_not_redirected() {
        let (_dir, daemon) = test_daemon();
        let hash = "a".repeat(64);
        let resp = handle(daemon, get(&format!("/x?sha256={}", hash)), REMOTE).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    // S5: a remote hit that reaches its share limit on this serve is
    // evicted from the store as part of the same request.
    #[tokio::test]
    async fn remote_hit_at_share_limit_is_evicted() {
        let (_dir, daemon) = test_daemon();
        let item = {
            let mut store = daemon.store.lock().await;
            store
                .add(b"payload", "f.bin", 86400, 1, 0, ItemFlags::empty(), "p")
                .unwrap()
        };

        let req = get(&format!("/f.bin?sha256={}", item.hash));
        let resp = handle(daemon.clone(), req, REMOTE).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let store = daemon.store.lock().await;
        assert!(store.get(&item.hash).is_none());
    }

    // A loopback miss resolves through the Lookup Coordinator to a peer
    // redirect when one is advertising the hash.
    #[tokio::test]
    async fn loopback_miss_redirects_to_advertising_peer() {
        let (_dir, daemon, backend) = test_daemon_with_backend();
        let hash = "b".repeat(64);
        backend.set_peers(&hash, vec![PeerAddr("10.0.0.9:27500".into())]);

        let req = get(&format!("/missing.bin?sha256={}", hash));
        let resp = handle(daemon, req, LOOPBACK).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let location = resp.headers().get(LOCATION).unwrap().to_str().unwrap();
        assert_eq!(location, format!("https://10.0.0.9:27500/missing.bin?sha256={}", hash));
    }
}
