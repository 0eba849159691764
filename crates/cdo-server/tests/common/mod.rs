// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use cdo_core::fakes::{self, FakeTransport, MemoryCompute, MemoryDns, StaticPackager, StaticSource};
use cdo_core::models::instance::{TAG_APP, TAG_BRANCH, TAG_COMMIT, TAG_STATUS};
use cdo_core::models::{InstanceDescription, InstanceState};
use cdo_core::services::build::Providers;
use cdo_core::services::deployer::Deployer;
use cdo_core::services::dispatcher::Dispatcher;
use cdo_core::services::notify::Notifier;
use cdo_core::services::remote::SessionOptions;
use cdo_server::{router, AppState};

pub struct Harness {
    pub app: Router,
    pub compute: Arc<MemoryCompute>,
    pub dns: Arc<MemoryDns>,
    pub log_dir: tempfile::TempDir,
    _source: tempfile::TempDir,
}

/// A server for the `shop` app backed entirely by in-memory providers.
pub fn harness() -> Harness {
    let source = tempfile::tempdir().unwrap();
    std::fs::create_dir(source.path().join("deploy")).unwrap();
    std::fs::write(
        source.path().join("deploy/lb.yml"),
        "enabled: true\ntype: endpoint\ndns_name: lb-1.elb.amazonaws.com\nhosted_zone_id: ZELB\n",
    )
    .unwrap();
    let log_dir = tempfile::tempdir().unwrap();

    let compute = Arc::new(MemoryCompute::new());
    let dns = Arc::new(MemoryDns::new("Z1", "example.com"));
    let app = fakes::app_config();
    let providers = Providers {
        compute: compute.clone(),
        dns: dns.clone(),
        transport: Arc::new(FakeTransport::new()),
        source: Arc::new(StaticSource::new(source.path()).with_ref(fakes::FAKE_REF)),
        packager: Arc::new(StaticPackager::new(source.path())),
        registry: Arc::new(fakes::recording_registry()),
        session_options: SessionOptions::default(),
        log_tx: None,
        app: Arc::new(app.clone()),
    };
    let deployer = Deployer::new(providers, Notifier::new(app.hooks));
    let state = AppState::new(deployer, Dispatcher::new(2), log_dir.path().to_path_buf());
    Harness {
        app: router(state),
        compute,
        dns,
        log_dir,
        _source: source,
    }
}

/// Record a finished ordinary deployment of `label` at the fake commit.
pub fn insert_done(compute: &MemoryCompute, id: &str, label: &str) {
    compute.insert(InstanceDescription {
        id: id.into(),
        public_dns_name: Some(format!("{id}.example.com")),
        state: InstanceState::Running,
        tags: BTreeMap::from([
            (TAG_APP.to_string(), "shop".to_string()),
            (TAG_BRANCH.to_string(), label.to_string()),
            (TAG_COMMIT.to_string(), fakes::FAKE_REF.to_string()),
            (TAG_STATUS.to_string(), "done".to_string()),
        ]),
    });
}

pub async fn send(app: &Router, request: Request<Body>) -> (u16, String) {
    let response: Response<Body> = app.clone().oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

/// Poll `check` until it holds; jobs run on the dispatcher in the background.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}
