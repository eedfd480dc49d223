#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use crackq_api::config::AppConfig;
use crackq_api::router::build_app_router;
use crackq_api::state::AppState;
use crackq_core::types::{DbId, Timestamp};
use crackq_db::memory::{MemoryQueue, MemoryStore};
use crackq_db::models::job::{Job, NewAttackJob};
use crackq_db::models::target::{NewTarget, Target};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

pub const WORDLIST: &str = "words.txt";
pub const HASH_INPUT: &str = "net.hc22000";

/// Application state on the in-memory store, with scratch directories for
/// captures, dictionaries and engine output.
pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub state: AppState,
    pub root: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_env(&[])
    }

    /// Build with extra environment overrides on top of fast test defaults.
    pub fn with_env(extra: &[(&str, String)]) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        for dir in ["work", "captures", "dictionaries"] {
            std::fs::create_dir_all(root.path().join(dir)).expect("create dir");
        }
        std::fs::write(root.path().join("dictionaries").join(WORDLIST), "hunter2\n")
            .expect("write wordlist");
        std::fs::write(root.path().join("captures").join(HASH_INPUT), "WPA*02*...\n")
            .expect("write hash input");

        let mut env: Vec<(String, String)> = vec![
            ("DATABASE_URL".into(), "postgres://unused".into()),
            ("ENGINE_WORK_DIR".into(), path_str(&root.path().join("work"))),
            ("CAPTURE_DIR".into(), path_str(&root.path().join("captures"))),
            ("DICTIONARY_DIR".into(), path_str(&root.path().join("dictionaries"))),
            ("CANCEL_POLL_MS".into(), "100".into()),
            ("TERMINATE_GRACE_SECS".into(), "1".into()),
            ("QUEUE_POLL_MS".into(), "50".into()),
            ("DEPENDENCY_RETRY_SECS".into(), "1".into()),
        ];
        for (key, value) in extra {
            env.retain(|(k, _)| k != key);
            env.push((key.to_string(), value.clone()));
        }

        let config = AppConfig::from_lookup(|var| {
            env.iter().find(|(k, _)| k == var).map(|(_, v)| v.clone())
        })
        .expect("test config");

        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let state = AppState::new(config, store.clone(), queue.clone(), None);

        Self {
            store,
            queue,
            state,
            root,
        }
    }

    pub fn router(&self) -> Router {
        build_app_router(self.state.clone(), &self.state.config.server)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.path().join("work")
    }

    pub async fn seed_target(&self, owner_id: DbId) -> Target {
        self.store
            .create_target(NewTarget {
                owner_id,
                name: "office-wifi".into(),
                capture_path: None,
                artifact_path: Some(HASH_INPUT.into()),
            })
            .await
    }

    pub async fn seed_job(
        &self,
        owner_id: DbId,
        depends_on: Vec<DbId>,
        scheduled_at: Option<Timestamp>,
    ) -> Job {
        let target = self.seed_target(owner_id).await;
        self.store
            .create_job(NewAttackJob {
                owner_id,
                target_id: target.id,
                wordlist_path: WORDLIST.into(),
                hash_mode: 22000,
                depends_on,
                scheduled_at,
            })
            .await
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Write an executable `/bin/sh` script standing in for the engine.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// Shell prologue that stores the `-o` argument in `$out`.
pub const PARSE_OUTPUT_ARG: &str = r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
  esac
  shift
done
"#;

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

pub async fn send(
    app: Router,
    method: Method,
    uri: &str,
    user_id: Option<DbId>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id.to_string());
    }
    app.oneshot(builder.body(Body::empty()).expect("request"))
        .await
        .expect("response")
}

pub async fn get(app: Router, uri: &str, user_id: Option<DbId>) -> Response<Body> {
    send(app, Method::GET, uri, user_id).await
}

pub async fn post(app: Router, uri: &str, user_id: Option<DbId>) -> Response<Body> {
    send(app, Method::POST, uri, user_id).await
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}
