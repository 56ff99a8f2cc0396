use crate::{
    metrics::Metrics,
    proxy::{Body, Proxy, ACCESS_TOKEN_HEADER, USER_HEADER},
    upstream::{ByteStream, MetricsUpstream},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use http::{header, Request, Response, StatusCode};
use http_body_util::BodyExt;
use metrics_proxy_core::{Error, NamespaceSet, ProxyTarget, Scheme, TargetAddr, TrustAnchor};
use metrics_proxy_k8s::{DestinationResolver, NamespaceResolver};
use std::sync::{Arc, Mutex};
use tower::Service;

const TOKEN: &str = "caller-token";

const JOBS_JSON: &str = r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{"job":"b"},"value":[1,"2"]},{"metric":{"job":"a"},"value":[1,"1"]},{"metric":{},"value":[1,"3"]}]}}"#;

const SCRAPE: &str = "\
# TYPE up gauge
up{namespace=\"team-a\"} 1
up{namespace=\"team-b\"} 1
up 1
";

enum StubAuth {
    Scoped(Vec<&'static str>),
    Unauthenticated,
    Unavailable,
}

#[async_trait]
impl NamespaceResolver for StubAuth {
    async fn resolve(&self, bearer_token: &str) -> Result<NamespaceSet, Error> {
        assert_eq!(bearer_token, TOKEN, "the forwarded token must reach the resolver");
        match self {
            Self::Scoped(namespaces) => Ok(namespaces.iter().copied().collect()),
            Self::Unauthenticated => Err(Error::Unauthenticated),
            Self::Unavailable => Err(Error::UpstreamUnavailable(
                "identity backend unreachable".to_string(),
            )),
        }
    }
}

#[derive(Default)]
struct StubDestinations {
    node: Option<ProxyTarget>,
    service: Option<ProxyTarget>,
}

#[async_trait]
impl DestinationResolver for StubDestinations {
    async fn resolve_node(&self, _addr: &TargetAddr, rest: &str) -> Result<ProxyTarget, Error> {
        match &self.node {
            Some(target) => Ok(ProxyTarget {
                path: rest.to_string(),
                ..target.clone()
            }),
            None => Err(Error::NotFound),
        }
    }

    async fn resolve_service(&self, _addr: &TargetAddr, rest: &str) -> Result<ProxyTarget, Error> {
        match &self.service {
            Some(target) => Ok(ProxyTarget {
                path: rest.to_string(),
                ..target.clone()
            }),
            None => Err(Error::NotFound),
        }
    }
}

#[derive(Default)]
struct StubUpstream {
    federate_rsp: Option<(StatusCode, &'static str)>,
    query_rsp: Option<(StatusCode, &'static str)>,
    scrape_rsp: Option<(StatusCode, &'static str)>,
    calls: Arc<Mutex<Calls>>,
}

#[derive(Default)]
struct Calls {
    federate: Vec<Vec<(String, String)>>,
    queries: Vec<String>,
    scrapes: Vec<String>,
}

#[async_trait]
impl MetricsUpstream for StubUpstream {
    async fn federate(
        &self,
        query: &[(String, String)],
    ) -> Result<(StatusCode, ByteStream), Error> {
        let (status, body) = self.federate_rsp.expect("unexpected federate call");
        self.calls.lock().unwrap().federate.push(query.to_vec());
        let chunks: Vec<Result<Bytes, Error>> = vec![Ok(Bytes::from_static(body.as_bytes()))];
        Ok((status, Box::pin(stream::iter(chunks)) as ByteStream))
    }

    async fn query(&self, promql: &str) -> Result<(StatusCode, Bytes), Error> {
        let (status, body) = self.query_rsp.expect("unexpected query call");
        self.calls.lock().unwrap().queries.push(promql.to_string());
        Ok((status, Bytes::from_static(body.as_bytes())))
    }

    async fn scrape(&self, target: &ProxyTarget) -> Result<(StatusCode, Bytes), Error> {
        let (status, body) = self.scrape_rsp.expect("unexpected scrape call");
        self.calls.lock().unwrap().scrapes.push(target.url());
        Ok((status, Bytes::from_static(body.as_bytes())))
    }
}

struct Harness {
    proxy: Proxy<StubAuth, StubDestinations, StubUpstream>,
    calls: Arc<Mutex<Calls>>,
}

impl Harness {
    fn new(auth: StubAuth, destinations: StubDestinations, upstream: StubUpstream) -> Self {
        let calls = upstream.calls.clone();
        let proxy = Proxy::new(auth, destinations, upstream, Metrics::default());
        Self { proxy, calls }
    }

    async fn get(&self, uri: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .method("GET")
                .uri(uri)
                .header(ACCESS_TOKEN_HEADER, TOKEN)
                .body(())
                .unwrap(),
        )
        .await
    }

    async fn request(&self, req: Request<()>) -> Response<Body> {
        let mut svc = self.proxy.clone();
        svc.call(req).await.expect("the proxy is infallible")
    }
}

async fn body_string(rsp: Response<Body>) -> String {
    let bytes = rsp
        .into_body()
        .collect()
        .await
        .expect("body must collect")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("body must be UTF-8")
}

fn team_a() -> StubAuth {
    StubAuth::Scoped(vec!["team-a"])
}

fn federate_uri(matches: &[&str]) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for m in matches {
        query.append_pair("match[]", m);
    }
    format!("/federate?{}", query.finish())
}

fn node_target() -> ProxyTarget {
    ProxyTarget {
        scheme: Scheme::Https,
        host: "10.0.0.7".to_string(),
        port: 10250,
        path: String::new(),
        trust: TrustAnchor::Insecure,
    }
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let harness = Harness::new(team_a(), Default::default(), Default::default());
    let rsp = harness
        .request(
            Request::builder()
                .method("GET")
                .uri("/federate")
                .body(())
                .unwrap(),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let harness = Harness::new(
        StubAuth::Unauthenticated,
        Default::default(),
        Default::default(),
    );
    let rsp = harness.get("/jobs").await;
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn identity_backend_outage_is_bad_gateway() {
    let harness = Harness::new(
        StubAuth::Unavailable,
        Default::default(),
        Default::default(),
    );
    let rsp = harness.get("/jobs").await;
    assert_eq!(rsp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn empty_scope_is_forbidden_naming_the_user() {
    let harness = Harness::new(StubAuth::Scoped(vec![]), Default::default(), Default::default());
    let rsp = harness
        .request(
            Request::builder()
                .method("GET")
                .uri(federate_uri(&["up"]))
                .header(ACCESS_TOKEN_HEADER, TOKEN)
                .header(USER_HEADER, "alice@example.com")
                .body(())
                .unwrap(),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        body_string(rsp).await,
        "Account 'alice@example.com' doesn't have access to any namespaces!\n"
    );
    assert!(harness.calls.lock().unwrap().federate.is_empty());
}

#[tokio::test]
async fn empty_scope_without_a_user_header_names_the_sentinel() {
    let harness = Harness::new(StubAuth::Scoped(vec![]), Default::default(), Default::default());
    let rsp = harness.get("/jobs").await;
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert!(body_string(rsp).await.contains("'<unknown>'"));
}

#[tokio::test]
async fn federate_requires_match_arguments() {
    let harness = Harness::new(team_a(), Default::default(), Default::default());
    let rsp = harness.get("/federate").await;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(rsp).await, "Missing match[] parameter\n");
}

#[tokio::test]
async fn federate_rewrites_every_selector_in_order() {
    let harness = Harness::new(
        StubAuth::Scoped(vec!["team-a", "team-b"]),
        Default::default(),
        StubUpstream {
            federate_rsp: Some((StatusCode::OK, "up{namespace=\"team-a\"} 1\n")),
            ..Default::default()
        },
    );

    let rsp = harness
        .get(&federate_uri(&["up", "process_cpu{job=\"x\"}"]))
        .await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(
        rsp.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain"
    );
    assert_eq!(body_string(rsp).await, "up{namespace=\"team-a\"} 1\n");

    let calls = harness.calls.lock().unwrap();
    assert_eq!(
        calls.federate,
        vec![vec![
            (
                "match[]".to_string(),
                "up{namespace=~\"team-a|team-b\"}".to_string()
            ),
            (
                "match[]".to_string(),
                "process_cpu{job=\"x\",namespace=~\"team-a|team-b\"}".to_string()
            ),
        ]]
    );
}

#[tokio::test]
async fn federate_forwards_other_query_parameters() {
    let harness = Harness::new(
        team_a(),
        Default::default(),
        StubUpstream {
            federate_rsp: Some((StatusCode::OK, "")),
            ..Default::default()
        },
    );

    let uri = format!("{}&debug=1", federate_uri(&["up"]));
    let rsp = harness.get(&uri).await;
    assert_eq!(rsp.status(), StatusCode::OK);

    let calls = harness.calls.lock().unwrap();
    assert_eq!(
        calls.federate[0],
        vec![
            (
                "match[]".to_string(),
                "up{namespace=~\"team-a\"}".to_string()
            ),
            ("debug".to_string(), "1".to_string()),
        ]
    );
}

#[tokio::test]
async fn one_malformed_selector_rejects_the_whole_request() {
    let harness = Harness::new(team_a(), Default::default(), Default::default());
    let rsp = harness.get(&federate_uri(&["up", "up{"])).await;
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(rsp).await, "Not a valid vector selector: 'up{'!\n");
    assert!(harness.calls.lock().unwrap().federate.is_empty());
}

#[tokio::test]
async fn federate_mirrors_upstream_failures() {
    let harness = Harness::new(
        team_a(),
        Default::default(),
        StubUpstream {
            federate_rsp: Some((StatusCode::INTERNAL_SERVER_ERROR, "storage exploded")),
            ..Default::default()
        },
    );
    let rsp = harness.get(&federate_uri(&["up"])).await;
    assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(rsp).await, "storage exploded");
}

#[tokio::test]
async fn jobs_are_sorted_and_quoted() {
    let harness = Harness::new(
        team_a(),
        Default::default(),
        StubUpstream {
            query_rsp: Some((StatusCode::OK, JOBS_JSON)),
            ..Default::default()
        },
    );

    let rsp = harness.get("/jobs").await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(body_string(rsp).await, "''\n'a'\n'b'\n");

    let calls = harness.calls.lock().unwrap();
    assert_eq!(
        calls.queries,
        vec![r#"count({namespace=~"team-a"}) by (job)"#.to_string()]
    );
}

#[tokio::test]
async fn jobs_mirror_upstream_failures() {
    let harness = Harness::new(
        team_a(),
        Default::default(),
        StubUpstream {
            query_rsp: Some((StatusCode::SERVICE_UNAVAILABLE, "busy")),
            ..Default::default()
        },
    );
    let rsp = harness.get("/jobs").await;
    assert_eq!(rsp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_string(rsp).await, "busy");
}

#[tokio::test]
async fn jobs_reject_malformed_query_responses() {
    let harness = Harness::new(
        team_a(),
        Default::default(),
        StubUpstream {
            query_rsp: Some((StatusCode::OK, "surprise!")),
            ..Default::default()
        },
    );
    let rsp = harness.get("/jobs").await;
    assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn node_scrapes_are_filtered_to_the_caller_scope() {
    let harness = Harness::new(
        team_a(),
        StubDestinations {
            node: Some(node_target()),
            ..Default::default()
        },
        StubUpstream {
            scrape_rsp: Some((StatusCode::OK, SCRAPE)),
            ..Default::default()
        },
    );

    let rsp = harness.get("/nodes/node-1/proxy/metrics").await;
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(
        body_string(rsp).await,
        "# TYPE up gauge\nup{namespace=\"team-a\"} 1\n"
    );
    assert_eq!(
        harness.calls.lock().unwrap().scrapes,
        vec!["https://10.0.0.7:10250/metrics".to_string()]
    );
}

#[tokio::test]
async fn missing_services_are_not_found_without_an_outbound_call() {
    let harness = Harness::new(team_a(), Default::default(), Default::default());
    let rsp = harness.get("/services/foo:9100/proxy/metrics").await;
    assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    assert!(harness.calls.lock().unwrap().scrapes.is_empty());
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let harness = Harness::new(team_a(), Default::default(), Default::default());
    for uri in ["/api/v1/query", "/nodes/n1/metrics", "/services/svc"] {
        let rsp = harness.get(uri).await;
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn non_get_methods_are_rejected() {
    let harness = Harness::new(team_a(), Default::default(), Default::default());
    let rsp = harness
        .request(
            Request::builder()
                .method("POST")
                .uri("/federate")
                .header(ACCESS_TOKEN_HEADER, TOKEN)
                .body(())
                .unwrap(),
        )
        .await;
    assert_eq!(rsp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn the_caller_content_type_is_echoed() {
    let harness = Harness::new(
        team_a(),
        Default::default(),
        StubUpstream {
            query_rsp: Some((StatusCode::OK, JOBS_JSON)),
            ..Default::default()
        },
    );
    let rsp = harness
        .request(
            Request::builder()
                .method("GET")
                .uri("/jobs")
                .header(ACCESS_TOKEN_HEADER, TOKEN)
                .header(header::CONTENT_TYPE, "application/openmetrics-text")
                .body(())
                .unwrap(),
        )
        .await;
    assert_eq!(
        rsp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/openmetrics-text"
    );
}
