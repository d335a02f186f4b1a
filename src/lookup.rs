//! Turns a "hash not found locally" event from a loopback peer into a
//! redirect to whichever LAN peer is advertising it.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use rand::seq::SliceRandom;

use crate::discovery::DiscoveryBackend;

/// Characters that must be percent-encoded within a single URL path segment,
/// beyond what `CONTROLS` already covers.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// Outcome of a lookup: either a peer to redirect to, or a reason there
/// wasn't one.
pub enum LookupResult {
    Redirect { location: String },
    NotFound,
}

/// Drive a browse→resolve→pick pipeline for `hash` and build the redirect
/// target for `basename`. The basename is the first path segment of the
/// original request URL, percent-encoded as a single path segment.
pub async fn resolve_redirect(
    backend: &dyn DiscoveryBackend,
    hash: &str,
    basename: &str,
) -> LookupResult {
    let candidates = match backend.find(hash).await {
        Ok(addrs) => addrs,
        Err(err) => {
            log::debug!("lookup for {} failed: {}", hash, err);
            return LookupResult::NotFound;
        }
    };

    let picked = match candidates.choose(&mut rand::thread_rng()) {
        Some(addr) => addr,
        None => return LookupResult::NotFound,
    };

    let basename = utf8_percent_encode(basename, PATH_SEGMENT).to_string();
    LookupResult::Redirect {
        location: format!("https://{}/{}?sha256={}", picked.0, basename, hash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{FakeBackend, PeerAddr};

    #[tokio::test]
    async fn empty_candidate_set_is_not_found() {
        let backend = FakeBackend::new();
        let result = resolve_redirect(&backend, "deadbeef", "HELLO.md").await;
        assert!(matches!(result, LookupResult::NotFound));
    }

    #[tokio::test]
    async fn single_candidate_is_always_picked() {
        let backend = FakeBackend::new();
        backend.set_peers("deadbeef", vec![PeerAddr("10.0.0.2:27500".into())]);
        let result = resolve_redirect(&backend, "deadbeef", "HELLO.md").await;
        match result {
            LookupResult::Redirect { location } => {
                assert_eq!(location, "https://10.0.0.2:27500/HELLO.md?sha256=deadbeef");
            }
            LookupResult::NotFound => panic!("expected a redirect"),
        }
    }

    #[tokio::test]
    async fn pick_is_drawn_from_the_full_candidate_set() {
        let backend = FakeBackend::new();
        let candidates = vec![
            PeerAddr("10.0.0.2:27500".into()),
            PeerAddr("10.0.0.3:27500".into()),
        ];
        backend.set_peers("deadbeef", candidates.clone());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            if let LookupResult::Redirect { location } =
                resolve_redirect(&backend, "deadbeef", "HELLO.md").await
            {
                seen.insert(location);
            }
        }
        assert!(seen.len() <= candidates.len());
        assert!(!seen.is_empty());
    }

    #[tokio::test]
    async fn basename_with_spaces_is_percent_encoded() {
        let backend = FakeBackend::new();
        backend.set_peers("deadbeef", vec![PeerAddr("10.0.0.2:27500".into())]);
        let result = resolve_redirect(&backend, "deadbeef", "my file.md").await;
        match result {
            LookupResult::Redirect { location } => {
                assert_eq!(
                    location,
                    "https://10.0.0.2:27500/my%20file.md?sha256=deadbeef"
                );
            }
            LookupResult::NotFound => panic!("expected a redirect"),
        }
    }
}
