use super::*;
use crate::backend::reason;
use crate::informer::Delta;
use anyhow::anyhow;
use async_trait::async_trait;
use bigip_controller_core::{irules, names, ConfigWriter, Member, ServiceKey};
use bigip_controller_k8s_api::ResourceExt;
use chrono::TimeZone;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct TestBackend {
    pub secrets: Mutex<HashMap<(String, String), k8s::Secret>>,
    pub events: Mutex<Vec<(String, String, String)>>,
    pub updated_config_maps: Mutex<Vec<k8s::ConfigMap>>,
    pub updated_ingress_statuses: Mutex<Vec<k8s::Ingress>>,
    pub ca: String,
    pub ca_reads: AtomicUsize,
}

impl TestBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            secrets: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            updated_config_maps: Mutex::new(Vec::new()),
            updated_ingress_statuses: Mutex::new(Vec::new()),
            ca: "-----BEGIN CERTIFICATE-----\ndefault\n-----END CERTIFICATE-----".to_string(),
            ca_reads: AtomicUsize::new(0),
        })
    }

    pub fn add_secret(&self, secret: k8s::Secret) {
        let key = (
            k8s::ResourceExt::namespace(&secret).unwrap_or_default(),
            k8s::ResourceExt::name_unchecked(&secret),
        );
        self.secrets.lock().insert(key, secret);
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(r, _, _)| r.clone()).collect()
    }
}

#[async_trait]
impl Backend for TestBackend {
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<k8s::Secret> {
        self.secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("secrets \"{name}\" not found"))
    }

    async fn update_config_map(&self, cm: &k8s::ConfigMap) -> anyhow::Result<()> {
        self.updated_config_maps.lock().push(cm.clone());
        Ok(())
    }

    async fn update_ingress_status(&self, ing: &k8s::Ingress) -> anyhow::Result<()> {
        self.updated_ingress_statuses.lock().push(ing.clone());
        Ok(())
    }

    fn read_default_ca(&self) -> anyhow::Result<String> {
        self.ca_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.ca.clone())
    }

    fn record_ingress_event(
        &self,
        _ingress: Option<&k8s::Ingress>,
        reason: &str,
        message: &str,
        rs_name: &str,
    ) {
        self.events
            .lock()
            .push((reason.to_string(), message.to_string(), rs_name.to_string()));
    }
}

pub(crate) struct TestWriter {
    pub writes: Mutex<Vec<Vec<u8>>>,
}

impl TestWriter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn last(&self) -> Option<Vec<u8>> {
        self.writes.lock().last().cloned()
    }
}

impl ConfigWriter for TestWriter {
    fn write_config(&self, document: &[u8]) -> anyhow::Result<()> {
        self.writes.lock().push(document.to_vec());
        Ok(())
    }
}

pub(crate) fn test_manager(
    is_node_port: bool,
    initial_state: bool,
) -> (Arc<Manager>, Arc<TestBackend>, Arc<TestWriter>) {
    let backend = TestBackend::new();
    let writer = TestWriter::new();
    let mgr = Manager::new(Params {
        backend: backend.clone(),
        writer: writer.clone(),
        streams: None,
        use_node_internal: true,
        is_node_port,
        route_config: Some(RouteConfig {
            vs_addr: "10.1.1.1".to_string(),
            label: None,
        }),
        initial_state,
    });
    // The registrations `run` would perform at startup.
    mgr.add_irule(
        irules::HTTP_REDIRECT_IRULE_NAME,
        DEFAULT_PARTITION,
        irules::http_redirect_irule(DEFAULT_HTTPS_PORT),
    );
    mgr.add_irule(
        irules::SSL_PASSTHROUGH_IRULE_NAME,
        DEFAULT_PARTITION,
        irules::ssl_passthrough_irule(),
    );
    mgr.add_internal_data_group(irules::PASSTHROUGH_HOSTS_DG_NAME, DEFAULT_PARTITION);
    mgr.add_internal_data_group(irules::REENCRYPT_HOSTS_DG_NAME, DEFAULT_PARTITION);
    (mgr, backend, writer)
}

async fn drain_vs(mgr: &Arc<Manager>) {
    while !mgr.vs_queue.is_empty() {
        assert!(mgr.process_next_virtual_server().await);
    }
}

// === fixtures ===

fn meta(ns: &str, name: &str) -> k8s::ObjectMeta {
    k8s::ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

pub(crate) fn mk_node(name: &str, ip: &str) -> k8s::Node {
    k8s::Node {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(k8s::NodeStatus {
            addresses: Some(vec![k8s::NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.to_string(),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_service(
    ns: &str,
    name: &str,
    type_: &str,
    ports: &[(i32, Option<i32>, Option<&str>)],
) -> k8s::Service {
    k8s::Service {
        metadata: meta(ns, name),
        spec: Some(k8s::ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, node_port, port_name)| k8s::ServicePort {
                        port: *port,
                        node_port: *node_port,
                        name: port_name.map(str::to_string),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_endpoints(
    ns: &str,
    name: &str,
    ips: &[&str],
    port_name: Option<&str>,
    port: i32,
) -> k8s::Endpoints {
    k8s::Endpoints {
        metadata: meta(ns, name),
        subsets: Some(vec![k8s::EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| k8s::EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![k8s::EndpointPort {
                name: port_name.map(str::to_string),
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

pub(crate) fn mk_configmap(ns: &str, name: &str, blob: &str) -> k8s::ConfigMap {
    k8s::ConfigMap {
        metadata: meta(ns, name),
        data: Some(BTreeMap::from([("data".to_string(), blob.to_string())])),
        ..Default::default()
    }
}

fn nodeport_cm_blob(service: &str, port: i32) -> String {
    format!(
        r#"{{"virtualServer": {{
            "frontend": {{"virtualAddress": {{"bindAddr": "10.0.0.1", "port": 80}}}},
            "backend": {{"serviceName": "{service}", "servicePort": {port}}}
        }}}}"#
    )
}

pub(crate) fn mk_ingress_single(
    ns: &str,
    name: &str,
    service: &str,
    port: i32,
    tls_secret: Option<&str>,
) -> k8s::Ingress {
    let mut metadata = meta(ns, name);
    metadata.annotations = Some(BTreeMap::from([(
        BIND_ADDR_ANNOTATION.to_string(),
        "10.0.0.2".to_string(),
    )]));
    k8s::Ingress {
        metadata,
        spec: Some(k8s::IngressSpec {
            default_backend: Some(k8s::IngressBackend {
                service: Some(k8s::IngressServiceBackend {
                    name: service.to_string(),
                    port: Some(k8s::ServiceBackendPort {
                        number: Some(port),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            tls: tls_secret.map(|secret| {
                vec![k8s::IngressTLS {
                    secret_name: Some(secret.to_string()),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_ingress_multi(
    ns: &str,
    name: &str,
    rules: &[(&str, &str, &str, i32)],
) -> k8s::Ingress {
    let mut metadata = meta(ns, name);
    metadata.annotations = Some(BTreeMap::from([(
        BIND_ADDR_ANNOTATION.to_string(),
        "10.0.0.2".to_string(),
    )]));
    k8s::Ingress {
        metadata,
        spec: Some(k8s::IngressSpec {
            rules: Some(
                rules
                    .iter()
                    .map(|(host, path, service, port)| k8s::IngressRule {
                        host: Some(host.to_string()),
                        http: Some(k8s::HTTPIngressRuleValue {
                            paths: vec![k8s::HTTPIngressPath {
                                path: Some(path.to_string()),
                                path_type: "Prefix".to_string(),
                                backend: k8s::IngressBackend {
                                    service: Some(k8s::IngressServiceBackend {
                                        name: service.to_string(),
                                        port: Some(k8s::ServiceBackendPort {
                                            number: Some(*port),
                                            ..Default::default()
                                        }),
                                    }),
                                    ..Default::default()
                                },
                            }],
                        }),
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn mk_secret(ns: &str, name: &str) -> k8s::Secret {
    k8s::Secret {
        metadata: meta(ns, name),
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), k8s::ByteString(b"CERT".to_vec())),
            ("tls.key".to_string(), k8s::ByteString(b"KEY".to_vec())),
        ])),
        ..Default::default()
    }
}

pub(crate) fn mk_route(
    ns: &str,
    name: &str,
    host: &str,
    service: &str,
    port: i32,
    termination: Option<k8s::TlsTermination>,
    created_secs: i64,
) -> k8s::Route {
    let mut route = k8s::Route::new(
        name,
        k8s::RouteSpec {
            host: host.to_string(),
            path: None,
            to: k8s::RouteTargetReference {
                kind: "Service".to_string(),
                name: service.to_string(),
                weight: None,
            },
            port: Some(k8s::RoutePort {
                target_port: port.to_string(),
            }),
            tls: termination.map(|termination| k8s::TlsConfig {
                termination,
                certificate: None,
                key: None,
                ca_certificate: None,
                destination_ca_certificate: None,
                insecure_edge_termination_policy: None,
            }),
        },
    );
    route.metadata.namespace = Some(ns.to_string());
    route.metadata.creation_timestamp = Some(k8s::Time(
        chrono::Utc.timestamp_opt(created_secs, 0).unwrap(),
    ));
    route
}

fn mk_namespace(name: &str) -> k8s::Namespace {
    k8s::Namespace {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn passthrough_dg(mgr: &Manager) -> bigip_controller_core::InternalDataGroup {
    mgr.int_dg
        .lock()
        .get(&NameRef::new(
            irules::PASSTHROUGH_HOSTS_DG_NAME,
            DEFAULT_PARTITION,
        ))
        .cloned()
        .unwrap()
}

// === scenarios ===

/// Scenario: a NodePort ConfigMap resolves to one virtual with a member per
/// node at the service's node port.
#[tokio::test]
async fn nodeport_configmap_builds_members_from_nodes() {
    let (mgr, _backend, writer) = test_manager(true, false);
    let inf = mgr.add_namespace("ns1").unwrap();

    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1"), mk_node("n2", "2.2.2.2")]);

    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "foo",
        "NodePort",
        &[(80, Some(31080), None)],
    )));
    inf.configmaps.handle_delta(Delta::Apply(mk_configmap(
        "ns1",
        "foo-vs",
        &nodeport_cm_blob("foo", 80),
    )));
    drain_vs(&mgr).await;

    let key = ServiceKey {
        namespace: "ns1".to_string(),
        service_name: "foo".to_string(),
        service_port: 80,
    };
    let resources = mgr.resources.lock();
    let cfg = resources.get(&key, "ns1_foo-vs").expect("config must be stored");
    assert!(cfg.meta_data.active);
    assert_eq!(cfg.meta_data.node_port, 31080);
    assert_eq!(
        cfg.pools[0].members,
        vec![Member::new("1.1.1.1", 31080), Member::new("2.2.2.2", 31080)]
    );
    drop(resources);
    assert!(writer.count() >= 1);
}

/// Scenario: node churn rewrites node-port members for every stored config
/// and emits exactly once per change.
#[tokio::test]
async fn node_update_rewrites_pool_members() {
    let (mgr, _backend, writer) = test_manager(true, false);
    let inf = mgr.add_namespace("ns1").unwrap();
    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1"), mk_node("n2", "2.2.2.2")]);
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "foo",
        "NodePort",
        &[(80, Some(31080), None)],
    )));
    inf.configmaps.handle_delta(Delta::Apply(mk_configmap(
        "ns1",
        "foo-vs",
        &nodeport_cm_blob("foo", 80),
    )));
    drain_vs(&mgr).await;
    let emitted = writer.count();

    // An unschedulable node is excluded; a new schedulable one is added.
    let mut cordoned = mk_node("n2", "2.2.2.2");
    cordoned.spec = Some(k8s::NodeSpec {
        unschedulable: Some(true),
        ..Default::default()
    });
    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1"), cordoned, mk_node("n3", "3.3.3.3")]);

    let key = ServiceKey {
        namespace: "ns1".to_string(),
        service_name: "foo".to_string(),
        service_port: 80,
    };
    {
        let resources = mgr.resources.lock();
        let cfg = resources.get(&key, "ns1_foo-vs").unwrap();
        assert_eq!(
            cfg.pools[0].members,
            vec![Member::new("1.1.1.1", 31080), Member::new("3.3.3.3", 31080)]
        );
    }
    assert_eq!(writer.count(), emitted + 1);

    // The same list again is a no-op.
    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1"), mk_node("n3", "3.3.3.3")]);
    assert_eq!(writer.count(), emitted + 1);
}

/// Scenario: a multi-service Ingress in cluster mode produces one virtual
/// with two pools; the emission is held back until every backing service
/// has synced.
#[tokio::test]
async fn multi_service_ingress_waits_for_all_pools() {
    let (mgr, backend, writer) = test_manager(false, true);
    let inf = mgr.add_namespace("ns1").unwrap();

    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcA",
        "ClusterIP",
        &[(8080, None, Some("web"))],
    )));
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcB",
        "ClusterIP",
        &[(8081, None, Some("api"))],
    )));
    inf.endpoints.handle_delta(Delta::Apply(mk_endpoints(
        "ns1",
        "svcA",
        &["10.2.0.1", "10.2.0.2"],
        Some("web"),
        8080,
    )));
    inf.endpoints.handle_delta(Delta::Apply(mk_endpoints(
        "ns1",
        "svcB",
        &["10.2.0.3", "10.2.0.4"],
        Some("api"),
        8081,
    )));
    let before = writer.count();
    inf.ingresses.handle_delta(Delta::Apply(mk_ingress_multi(
        "ns1",
        "app",
        &[
            ("a.example", "/foo", "svcA", 8080),
            ("b.example", "/bar", "svcB", 8081),
        ],
    )));
    drain_vs(&mgr).await;

    let rs_name = names::format_ingress_vs_name("ns1", "app", "http");
    let resources = mgr.resources.lock();
    let copies = resources.get_all_with_name(&rs_name);
    assert_eq!(copies.len(), 2, "one stored copy per backing service");
    for (_, cfg) in &copies {
        assert_eq!(cfg.pools.len(), 2);
        assert_eq!(cfg.policies.len(), 1);
        assert_eq!(cfg.policies[0].rules.len(), 2);
    }
    // Each copy carries its own pool's members.
    let members: usize = copies
        .iter()
        .flat_map(|(key, cfg)| {
            cfg.pools
                .iter()
                .filter(|p| p.service_name == key.service_name)
                .map(|p| p.members.len())
        })
        .sum();
    assert_eq!(members, 4);
    drop(resources);

    // The build-up emits exactly once, after the second service completes.
    assert_eq!(writer.count(), before + 1);
    assert!(backend
        .reasons()
        .iter()
        .any(|r| r == reason::RESOURCE_CONFIGURED));
}

/// Scenario: a TLS Ingress with the default annotations yields an HTTP
/// virtual carrying the redirect iRule and an HTTPS virtual carrying the
/// client-SSL profile from the Secret.
#[tokio::test]
async fn tls_ingress_builds_redirect_and_ssl_virtuals() {
    let (mgr, backend, _writer) = test_manager(false, true);
    let inf = mgr.add_namespace("ns1").unwrap();
    backend.add_secret(mk_secret("ns1", "a-secret"));

    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcA",
        "ClusterIP",
        &[(8080, None, None)],
    )));
    inf.endpoints.handle_delta(Delta::Apply(mk_endpoints(
        "ns1",
        "svcA",
        &["10.2.0.1"],
        None,
        8080,
    )));
    inf.ingresses.handle_delta(Delta::Apply(mk_ingress_single(
        "ns1",
        "app",
        "svcA",
        8080,
        Some("a-secret"),
    )));
    drain_vs(&mgr).await;

    let key = ServiceKey {
        namespace: "ns1".to_string(),
        service_name: "svcA".to_string(),
        service_port: 8080,
    };
    let resources = mgr.resources.lock();

    let http = resources
        .get(&key, &names::format_ingress_vs_name("ns1", "app", "http"))
        .expect("http virtual");
    assert_eq!(
        http.virtual_server.irules,
        vec![format!("/{}/{}", DEFAULT_PARTITION, irules::HTTP_REDIRECT_IRULE_NAME)]
    );
    assert!(http.virtual_server.ssl_profiles.is_empty());

    let https = resources
        .get(&key, &names::format_ingress_vs_name("ns1", "app", "https"))
        .expect("https virtual");
    assert_eq!(
        https.virtual_server.ssl_profiles,
        vec![format!("{DEFAULT_PARTITION}/a-secret")]
    );
    assert!(https.virtual_server.irules.is_empty());
    drop(resources);

    let profiles = mgr.custom_profiles.lock();
    let skey = SecretKey {
        name: "a-secret".to_string(),
        namespace: "ns1".to_string(),
        resource_name: names::format_ingress_vs_name("ns1", "app", "https"),
    };
    let profile = profiles.get(&skey).expect("client-ssl profile");
    assert_eq!(profile.cert, "CERT");
    assert_eq!(profile.key, "KEY");
}

/// Scenario: deleting the Ingress that referenced a Secret garbage-collects
/// the materialized profile on the next sync of the same key.
#[tokio::test]
async fn deleting_tls_ingress_collects_its_profile() {
    let (mgr, backend, _writer) = test_manager(false, true);
    let inf = mgr.add_namespace("ns1").unwrap();
    backend.add_secret(mk_secret("ns1", "a-secret"));
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcA",
        "ClusterIP",
        &[(8080, None, None)],
    )));
    let ing = mk_ingress_single("ns1", "app", "svcA", 8080, Some("a-secret"));
    inf.ingresses.handle_delta(Delta::Apply(ing.clone()));
    drain_vs(&mgr).await;
    assert!(!mgr.custom_profiles.lock().is_empty());

    inf.ingresses.handle_delta(Delta::Delete(ing));
    drain_vs(&mgr).await;
    assert!(mgr.custom_profiles.lock().is_empty());
    assert_eq!(mgr.resources.lock().count(), 0);
}

/// Scenario: a passthrough route publishes its hostname in the passthrough
/// data group; deleting the route removes both the record and everything
/// the route contributed to the shared virtuals.
#[tokio::test]
async fn passthrough_route_lifecycle() {
    let (mgr, _backend, writer) = test_manager(false, true);
    let inf = mgr.add_namespace("ns1").unwrap();

    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcA",
        "ClusterIP",
        &[(443, None, Some("https"))],
    )));
    inf.endpoints.handle_delta(Delta::Apply(mk_endpoints(
        "ns1",
        "svcA",
        &["10.2.0.1"],
        Some("https"),
        443,
    )));
    let route = mk_route(
        "ns1",
        "web",
        "a.example",
        "svcA",
        443,
        Some(k8s::TlsTermination::Passthrough),
        100,
    );
    inf.routes
        .as_ref()
        .unwrap()
        .handle_delta(Delta::Apply(route.clone()));
    drain_vs(&mgr).await;

    let dg = passthrough_dg(&mgr);
    assert_eq!(dg.records.len(), 1);
    assert_eq!(dg.records[0].name, "a.example");
    assert_eq!(
        dg.records[0].data,
        format!("/{DEFAULT_PARTITION}/openshift_ns1_svcA")
    );
    {
        let resources = mgr.resources.lock();
        let key = ServiceKey {
            namespace: "ns1".to_string(),
            service_name: "svcA".to_string(),
            service_port: 443,
        };
        let https = resources.get(&key, "openshift_route_https").expect("https virtual");
        assert!(https.meta_data.active);
        assert_eq!(https.pools[0].name, "openshift_ns1_svcA");
        assert!(https.policies.is_empty(), "passthrough routes use SNI, not rules");
        assert!(https
            .virtual_server
            .irules
            .iter()
            .any(|r| r.contains(irules::SSL_PASSTHROUGH_IRULE_NAME)));
    }
    let emitted = writer.count();

    inf.routes
        .as_ref()
        .unwrap()
        .handle_delta(Delta::Delete(route));
    drain_vs(&mgr).await;

    let dg = passthrough_dg(&mgr);
    assert!(dg.records.is_empty());
    let resources = mgr.resources.lock();
    assert!(resources.get_all_with_name("openshift_route_https").is_empty());
    assert!(resources.get_all_with_name("openshift_route_http").is_empty());
    drop(resources);
    assert!(writer.count() > emitted);
}

/// Scenario: precedence among routes claiming the same hostname follows
/// creation time, then name.
#[tokio::test]
async fn route_ordering_decides_hostname_ties() {
    let (mgr, _backend, _writer) = test_manager(false, true);
    let inf = mgr.add_namespace("ns1").unwrap();
    let routes = inf.routes.as_ref().unwrap();

    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcA",
        "ClusterIP",
        &[(443, None, None)],
    )));
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcB",
        "ClusterIP",
        &[(443, None, None)],
    )));

    let older = mk_route(
        "ns1",
        "older",
        "a.example",
        "svcA",
        443,
        Some(k8s::TlsTermination::Passthrough),
        100,
    );
    let newer = mk_route(
        "ns1",
        "newer",
        "a.example",
        "svcB",
        443,
        Some(k8s::TlsTermination::Passthrough),
        200,
    );
    routes.handle_delta(Delta::Apply(older.clone()));
    routes.handle_delta(Delta::Apply(newer.clone()));
    drain_vs(&mgr).await;
    let dg = passthrough_dg(&mgr);
    assert_eq!(dg.records[0].data, format!("/{DEFAULT_PARTITION}/openshift_ns1_svcB"));

    // Swapping the timestamps swaps the winner.
    let mut older = older;
    older.metadata.creation_timestamp =
        Some(k8s::Time(chrono::Utc.timestamp_opt(300, 0).unwrap()));
    routes.handle_delta(Delta::Apply(older));
    drain_vs(&mgr).await;
    let dg = passthrough_dg(&mgr);
    assert_eq!(dg.records[0].data, format!("/{DEFAULT_PARTITION}/openshift_ns1_svcA"));

    // Equal timestamps: name order decides; "older" sorts after "newer".
    let tied = mk_route(
        "ns1",
        "newer",
        "a.example",
        "svcB",
        443,
        Some(k8s::TlsTermination::Passthrough),
        300,
    );
    routes.handle_delta(Delta::Apply(tied));
    drain_vs(&mgr).await;
    let dg = passthrough_dg(&mgr);
    assert_eq!(dg.records[0].data, format!("/{DEFAULT_PARTITION}/openshift_ns1_svcA"));
}

/// Scenario: a re-encrypt route without a destination CA reads the cluster
/// default CA exactly once and registers the default server-ssl profile;
/// re-syncing neither re-reads nor re-emits.
#[tokio::test]
async fn reencrypt_route_reads_default_ca_once() {
    let (mgr, backend, writer) = test_manager(false, true);
    let inf = mgr.add_namespace("ns1").unwrap();

    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcA",
        "ClusterIP",
        &[(443, None, None)],
    )));
    inf.endpoints.handle_delta(Delta::Apply(mk_endpoints(
        "ns1",
        "svcA",
        &["10.2.0.1"],
        None,
        8443,
    )));
    let route = mk_route(
        "ns1",
        "secure",
        "s.example",
        "svcA",
        443,
        Some(k8s::TlsTermination::Reencrypt),
        100,
    );
    inf.routes
        .as_ref()
        .unwrap()
        .handle_delta(Delta::Apply(route.clone()));
    drain_vs(&mgr).await;

    assert_eq!(backend.ca_reads.load(Ordering::SeqCst), 1);
    {
        let profiles = mgr.custom_profiles.lock();
        let profile = profiles
            .values()
            .find(|p| p.name == "openshift_route_cluster_default-server-ssl")
            .expect("default server-ssl profile");
        assert_eq!(profile.cert, backend.ca);
        assert!(profile.key.is_empty());
    }
    let emitted = writer.count();

    inf.routes
        .as_ref()
        .unwrap()
        .handle_delta(Delta::Apply(route));
    drain_vs(&mgr).await;
    assert_eq!(backend.ca_reads.load(Ordering::SeqCst), 1, "CA is read once");
    assert_eq!(writer.count(), emitted, "a quiescent re-sync does not emit");
}

/// Scenario: de-labeling a namespace stops its informers, deletes its
/// resources, and emits once.
#[tokio::test]
async fn namespace_dewatch_deletes_resources() {
    let (mgr, _backend, writer) = test_manager(true, true);
    let ns_inf = mgr.add_namespace_label_informer().unwrap();

    ns_inf.handle_delta(Delta::Apply(mk_namespace("ns1")));
    assert!(mgr.process_next_namespace().await);
    let inf = mgr.get_namespace_informer("ns1").expect("bundle created");

    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1")]);
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "foo",
        "NodePort",
        &[(80, Some(31080), None)],
    )));
    inf.configmaps.handle_delta(Delta::Apply(mk_configmap(
        "ns1",
        "foo-vs",
        &nodeport_cm_blob("foo", 80),
    )));
    drain_vs(&mgr).await;
    assert_eq!(mgr.resources.lock().count(), 1);
    let emitted = writer.count();

    ns_inf.handle_delta(Delta::Delete(mk_namespace("ns1")));
    assert!(mgr.process_next_namespace().await);

    assert!(mgr.get_namespace_informer("ns1").is_none());
    assert_eq!(mgr.resources.lock().count(), 0);
    assert_eq!(writer.count(), emitted + 1);

    // De-watching again is idempotent.
    ns_inf.handle_delta(Delta::Delete(mk_namespace("ns1")));
    assert!(mgr.process_next_namespace().await);
    assert_eq!(writer.count(), emitted + 1);
}

/// Mutual exclusion of the informer topologies.
#[tokio::test]
async fn informer_topologies_are_mutually_exclusive() {
    let (mgr, _, _) = test_manager(false, true);
    mgr.add_namespace("").unwrap();
    assert!(mgr.add_namespace("ns1").is_err());
    assert!(mgr.add_namespace_label_informer().is_err());

    let (mgr, _, _) = test_manager(false, true);
    mgr.add_namespace("ns1").unwrap();
    assert!(mgr.add_namespace("").is_err());
    assert!(mgr.add_namespace_label_informer().is_err());
    // Re-adding an existing namespace is fine.
    mgr.add_namespace("ns1").unwrap();

    let (mgr, _, _) = test_manager(false, true);
    mgr.add_namespace_label_informer().unwrap();
    assert!(mgr.add_namespace_label_informer().is_err());
}

/// Idempotence and convergence: the same object twice stores an identical
/// config and produces no further emission once quiescent.
#[tokio::test]
async fn resync_of_unchanged_state_is_a_noop() {
    let (mgr, _backend, writer) = test_manager(true, false);
    let inf = mgr.add_namespace("ns1").unwrap();
    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1")]);
    let cm = mk_configmap("ns1", "foo-vs", &nodeport_cm_blob("foo", 80));
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "foo",
        "NodePort",
        &[(80, Some(31080), None)],
    )));
    inf.configmaps.handle_delta(Delta::Apply(cm.clone()));
    drain_vs(&mgr).await;

    let key = ServiceKey {
        namespace: "ns1".to_string(),
        service_name: "foo".to_string(),
        service_port: 80,
    };
    let stored = mgr.resources.lock().get(&key, "ns1_foo-vs").cloned().unwrap();
    let emitted = writer.count();
    let last = writer.last();

    inf.configmaps.handle_delta(Delta::Apply(cm));
    drain_vs(&mgr).await;
    assert_eq!(
        mgr.resources.lock().get(&key, "ns1_foo-vs").cloned().unwrap(),
        stored
    );
    assert_eq!(writer.count(), emitted);
    assert_eq!(writer.last(), last);

    // Re-running the sync worker directly on the key is also a no-op.
    mgr.sync_virtual_server(&ServiceQueueKey::new("ns1", "foo"))
        .await
        .unwrap();
    assert_eq!(writer.count(), emitted);
}

/// A service that disappears deactivates its virtual and clears members.
#[tokio::test]
async fn service_deletion_deactivates_the_virtual() {
    let (mgr, _backend, _writer) = test_manager(true, false);
    let inf = mgr.add_namespace("ns1").unwrap();
    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1")]);
    let svc = mk_service("ns1", "foo", "NodePort", &[(80, Some(31080), None)]);
    inf.services.handle_delta(Delta::Apply(svc.clone()));
    inf.configmaps.handle_delta(Delta::Apply(mk_configmap(
        "ns1",
        "foo-vs",
        &nodeport_cm_blob("foo", 80),
    )));
    drain_vs(&mgr).await;

    inf.services.handle_delta(Delta::Delete(svc));
    drain_vs(&mgr).await;

    let key = ServiceKey {
        namespace: "ns1".to_string(),
        service_name: "foo".to_string(),
        service_port: 80,
    };
    let resources = mgr.resources.lock();
    let cfg = resources.get(&key, "ns1_foo-vs").expect("config survives, inactive");
    assert!(!cfg.meta_data.active);
    assert!(cfg.pools[0].members.is_empty());
}

/// A non-NodePort backend in node-port mode surfaces the event and stays
/// inactive.
#[tokio::test]
async fn wrong_backend_type_reports_event() {
    let (mgr, backend, _writer) = test_manager(true, true);
    let inf = mgr.add_namespace("ns1").unwrap();
    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1")]);
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "svcA",
        "ClusterIP",
        &[(8080, None, None)],
    )));
    inf.ingresses.handle_delta(Delta::Apply(mk_ingress_single(
        "ns1", "app", "svcA", 8080, None,
    )));
    drain_vs(&mgr).await;

    assert!(backend
        .reasons()
        .iter()
        .any(|r| r == reason::INCORRECT_BACKEND_SERVICE_TYPE));
    let resources = mgr.resources.lock();
    let key = ServiceKey {
        namespace: "ns1".to_string(),
        service_name: "svcA".to_string(),
        service_port: 8080,
    };
    let cfg = resources
        .get(&key, &names::format_ingress_vs_name("ns1", "app", "http"))
        .unwrap();
    assert!(!cfg.meta_data.active);
}

/// A ConfigMap that turns invalid has its virtual deleted and the status
/// annotation cleared.
#[tokio::test]
async fn invalidated_configmap_deletes_its_virtual() {
    let (mgr, backend, _writer) = test_manager(true, true);
    let inf = mgr.add_namespace("ns1").unwrap();
    mgr.process_node_update(vec![mk_node("n1", "1.1.1.1")]);
    inf.services.handle_delta(Delta::Apply(mk_service(
        "ns1",
        "foo",
        "NodePort",
        &[(80, Some(31080), None)],
    )));
    inf.configmaps.handle_delta(Delta::Apply(mk_configmap(
        "ns1",
        "foo-vs",
        &nodeport_cm_blob("foo", 80),
    )));
    drain_vs(&mgr).await;
    assert_eq!(mgr.resources.lock().count(), 1);

    // The annotation written by the first sync is carried on the update.
    let mut broken = mk_configmap("ns1", "foo-vs", "{not json");
    broken.metadata.annotations = Some(BTreeMap::from([(
        VS_BIND_ADDR_ANNOTATION.to_string(),
        "10.0.0.1".to_string(),
    )]));
    inf.configmaps.handle_delta(Delta::Apply(broken));
    // An unparseable ConfigMap emits no queue key; re-sync via the service.
    mgr.vs_queue.add(ServiceQueueKey::new("ns1", "foo"));
    drain_vs(&mgr).await;

    assert_eq!(mgr.resources.lock().count(), 0);
    let cleared = backend
        .updated_config_maps
        .lock()
        .iter()
        .any(|cm| !cm.annotations().contains_key(VS_BIND_ADDR_ANNOTATION));
    assert!(cleared, "annotation must be cleared on the invalid ConfigMap");
}
