//! Pure projection from the view inventory to an xDS snapshot
//!
//! Everything here is a function of the view list and the configured base
//! hostname; the builder keeps no state between rebuilds. Resource names
//! (`main`, `local_route`, `local`, `sidecar_api`, `view-<name>`) are part
//! of the contract with the proxy's bootstrap config.

use std::collections::HashSet;

use envoy_types::pb::envoy::config::cluster::v3 as cluster;
use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::config::endpoint::v3 as endpoint;
use envoy_types::pb::envoy::config::listener::v3 as listener;
use envoy_types::pb::envoy::config::route::v3 as route;
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3 as ext_authz;
use envoy_types::pb::envoy::extensions::filters::http::router::v3 as router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3 as hcm;
use envoy_types::pb::google::protobuf::{Any, Duration, UInt32Value};
use prost::Message;

use crate::config::VIEW_NAME_PREFIX;
use crate::error::{Error, Result};
use crate::view::ViewState;
use crate::xds::cache::{
    NamedResource, Snapshot, TYPE_CLUSTER, TYPE_ENDPOINT, TYPE_LISTENER, TYPE_ROUTE,
};

const TYPE_HCM: &str = "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TYPE_EXT_AUTHZ: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
const TYPE_EXT_AUTHZ_PER_ROUTE: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthzPerRoute";
const TYPE_ROUTER: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

const EXT_AUTHZ_FILTER: &str = "envoy.filters.http.ext_authz";
const ROUTER_FILTER: &str = "envoy.filters.http.router";

/// ext_authz call timeout; strictly above the 60s cold-start deadline so
/// the proxy never gives up on a check the sidecar is still waiting on
const EXT_AUTHZ_TIMEOUT_SECS: i64 = 65;

/// Build a complete snapshot for one configuration version
///
/// View ordering in the output is by name so equal inventories produce
/// identical snapshots.
pub fn build_snapshot(version: u64, views: &[ViewState], base_hostname: &str) -> Result<Snapshot> {
    let mut views: Vec<&ViewState> = views.iter().collect();
    views.sort_by(|a, b| a.name.cmp(&b.name));

    let listeners = vec![build_listener()];
    let route_config = build_route_config(&views, base_hostname);
    let clusters = build_clusters(&views);
    let assignments = build_endpoints(&views);

    validate_consistency(&clusters, &route_config, &assignments)?;

    let mut snapshot = Snapshot::new(version.to_string());
    snapshot.set_resources(
        TYPE_LISTENER,
        listeners
            .iter()
            .map(|l| NamedResource {
                name: l.name.clone(),
                resource: any_of(TYPE_LISTENER, l),
            })
            .collect(),
    );
    snapshot.set_resources(
        TYPE_ROUTE,
        vec![NamedResource {
            name: route_config.name.clone(),
            resource: any_of(TYPE_ROUTE, &route_config),
        }],
    );
    snapshot.set_resources(
        TYPE_CLUSTER,
        clusters
            .iter()
            .map(|c| NamedResource {
                name: c.name.clone(),
                resource: any_of(TYPE_CLUSTER, c),
            })
            .collect(),
    );
    snapshot.set_resources(
        TYPE_ENDPOINT,
        assignments
            .iter()
            .map(|a| NamedResource {
                name: a.cluster_name.clone(),
                resource: any_of(TYPE_ENDPOINT, a),
            })
            .collect(),
    );

    Ok(snapshot)
}

/// The single static listener: HCM with RDS, ext_authz ahead of the router
pub fn build_listener() -> listener::Listener {
    let ext_authz_filter = ext_authz::ExtAuthz {
        services: Some(ext_authz::ext_authz::Services::GrpcService(
            core::GrpcService {
                target_specifier: Some(core::grpc_service::TargetSpecifier::EnvoyGrpc(
                    core::grpc_service::EnvoyGrpc {
                        cluster_name: "xds_cluster".to_string(),
                        ..Default::default()
                    },
                )),
                timeout: Some(Duration {
                    seconds: EXT_AUTHZ_TIMEOUT_SECS,
                    nanos: 0,
                }),
                ..Default::default()
            },
        )),
        transport_api_version: core::ApiVersion::V3 as i32,
        failure_mode_allow: false,
        ..Default::default()
    };

    let manager = hcm::HttpConnectionManager {
        stat_prefix: "ingress_http".to_string(),
        codec_type: hcm::http_connection_manager::CodecType::Auto as i32,
        route_specifier: Some(hcm::http_connection_manager::RouteSpecifier::Rds(hcm::Rds {
            config_source: Some(ads_config_source()),
            route_config_name: "local_route".to_string(),
        })),
        http_filters: vec![
            hcm::HttpFilter {
                name: EXT_AUTHZ_FILTER.to_string(),
                config_type: Some(hcm::http_filter::ConfigType::TypedConfig(any_of(
                    TYPE_EXT_AUTHZ,
                    &ext_authz_filter,
                ))),
                ..Default::default()
            },
            hcm::HttpFilter {
                name: ROUTER_FILTER.to_string(),
                config_type: Some(hcm::http_filter::ConfigType::TypedConfig(any_of(
                    TYPE_ROUTER,
                    &router::Router::default(),
                ))),
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    listener::Listener {
        name: "main".to_string(),
        address: Some(socket_address("0.0.0.0", 8080)),
        filter_chains: vec![listener::FilterChain {
            filters: vec![listener::Filter {
                name: "envoy.filters.network.http_connection_manager".to_string(),
                config_type: Some(listener::filter::ConfigType::TypedConfig(any_of(
                    TYPE_HCM, &manager,
                ))),
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// `local_route`: the default virtual host followed by one per view
pub fn build_route_config(views: &[&ViewState], base_hostname: &str) -> route::RouteConfiguration {
    let mut vhosts = vec![build_default_virtual_host()];

    for view in views {
        vhosts.push(route::VirtualHost {
            name: format!("{VIEW_NAME_PREFIX}{}", view.name),
            domains: vec![
                format!("{}.{base_hostname}", view.name),
                format!("{}.*", view.name),
            ],
            routes: vec![route::Route {
                r#match: Some(prefix_match("/")),
                action: Some(route::route::Action::Route(route::RouteAction {
                    cluster_specifier: Some(route::route_action::ClusterSpecifier::Cluster(
                        format!("{VIEW_NAME_PREFIX}{}", view.name),
                    )),
                    host_rewrite_specifier: Some(
                        route::route_action::HostRewriteSpecifier::HostRewriteLiteral(
                            "localhost".to_string(),
                        ),
                    ),
                    // Zero disables the stream timeout; view responses can
                    // be long-lived streams.
                    timeout: Some(Duration { seconds: 0, nanos: 0 }),
                    retry_policy: Some(route::RetryPolicy {
                        retry_on: "connect-failure,reset".to_string(),
                        num_retries: Some(UInt32Value { value: 3 }),
                        ..Default::default()
                    }),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        });
    }

    route::RouteConfiguration {
        name: "local_route".to_string(),
        virtual_hosts: vhosts,
        ..Default::default()
    }
}

/// Default virtual host: admin API passthrough and the liveness banner,
/// both exempt from ext_authz
fn build_default_virtual_host() -> route::VirtualHost {
    let disabled = ext_authz_disabled_per_route();

    route::VirtualHost {
        name: "local".to_string(),
        domains: vec!["*".to_string()],
        routes: vec![
            route::Route {
                r#match: Some(prefix_match("/_api/")),
                action: Some(route::route::Action::Route(route::RouteAction {
                    cluster_specifier: Some(route::route_action::ClusterSpecifier::Cluster(
                        "sidecar_api".to_string(),
                    )),
                    ..Default::default()
                })),
                typed_per_filter_config: disabled.clone(),
                ..Default::default()
            },
            route::Route {
                r#match: Some(prefix_match("/")),
                action: Some(route::route::Action::DirectResponse(
                    route::DirectResponseAction {
                        status: 200,
                        body: Some(core::DataSource {
                            specifier: Some(core::data_source::Specifier::InlineString(
                                "gateway ok\n".to_string(),
                            )),
                            ..Default::default()
                        }),
                    },
                )),
                typed_per_filter_config: disabled,
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

fn ext_authz_disabled_per_route() -> std::collections::HashMap<String, Any> {
    let per_route = ext_authz::ExtAuthzPerRoute {
        r#override: Some(ext_authz::ext_authz_per_route::Override::Disabled(true)),
    };
    std::collections::HashMap::from([(
        EXT_AUTHZ_FILTER.to_string(),
        any_of(TYPE_EXT_AUTHZ_PER_ROUTE, &per_route),
    )])
}

/// The static self cluster plus one EDS cluster per view
pub fn build_clusters(views: &[&ViewState]) -> Vec<cluster::Cluster> {
    let mut clusters = vec![cluster::Cluster {
        name: "sidecar_api".to_string(),
        connect_timeout: Some(Duration { seconds: 1, nanos: 0 }),
        cluster_discovery_type: Some(cluster::cluster::ClusterDiscoveryType::Type(
            cluster::cluster::DiscoveryType::Static as i32,
        )),
        load_assignment: Some(endpoint::ClusterLoadAssignment {
            cluster_name: "sidecar_api".to_string(),
            endpoints: vec![endpoint::LocalityLbEndpoints {
                lb_endpoints: vec![lb_endpoint("127.0.0.1", 18080)],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }];

    for view in views {
        clusters.push(cluster::Cluster {
            name: format!("{VIEW_NAME_PREFIX}{}", view.name),
            connect_timeout: Some(Duration { seconds: 5, nanos: 0 }),
            cluster_discovery_type: Some(cluster::cluster::ClusterDiscoveryType::Type(
                cluster::cluster::DiscoveryType::Eds as i32,
            )),
            eds_cluster_config: Some(cluster::cluster::EdsClusterConfig {
                eds_config: Some(ads_config_source()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    clusters
}

/// One assignment per view holding exactly the ready endpoints
///
/// A cold view still gets an assignment with an empty endpoint list so the
/// proxy keeps the cluster warm while the gate holds its requests.
pub fn build_endpoints(views: &[&ViewState]) -> Vec<endpoint::ClusterLoadAssignment> {
    views
        .iter()
        .map(|view| {
            let mut seen = HashSet::new();
            let lb_endpoints = view
                .ready_endpoints()
                .iter()
                .filter(|ep| seen.insert((ep.address.clone(), ep.port)))
                .map(|ep| lb_endpoint(&ep.address, ep.port as u32))
                .collect();

            endpoint::ClusterLoadAssignment {
                cluster_name: format!("{VIEW_NAME_PREFIX}{}", view.name),
                endpoints: vec![endpoint::LocalityLbEndpoints {
                    lb_endpoints,
                    ..Default::default()
                }],
                ..Default::default()
            }
        })
        .collect()
}

/// Reject snapshots that reference undefined clusters or leave an EDS
/// cluster without an assignment. Hitting this is a programming error; the
/// previous snapshot stays live.
fn validate_consistency(
    clusters: &[cluster::Cluster],
    route_config: &route::RouteConfiguration,
    assignments: &[endpoint::ClusterLoadAssignment],
) -> Result<()> {
    let cluster_names: HashSet<&str> = clusters.iter().map(|c| c.name.as_str()).collect();
    let assignment_names: HashSet<&str> =
        assignments.iter().map(|a| a.cluster_name.as_str()).collect();

    for vhost in &route_config.virtual_hosts {
        for r in &vhost.routes {
            if let Some(route::route::Action::Route(action)) = &r.action {
                if let Some(route::route_action::ClusterSpecifier::Cluster(name)) =
                    &action.cluster_specifier
                {
                    if !cluster_names.contains(name.as_str()) {
                        return Err(Error::snapshot(format!(
                            "route in {} references undefined cluster {name}",
                            vhost.name
                        )));
                    }
                }
            }
        }
    }

    for c in clusters {
        let is_eds = matches!(
            c.cluster_discovery_type,
            Some(cluster::cluster::ClusterDiscoveryType::Type(t))
                if t == cluster::cluster::DiscoveryType::Eds as i32
        );
        if is_eds && !assignment_names.contains(c.name.as_str()) {
            return Err(Error::snapshot(format!(
                "EDS cluster {} has no endpoint assignment",
                c.name
            )));
        }
    }

    for a in assignments {
        if !cluster_names.contains(a.cluster_name.as_str()) {
            return Err(Error::snapshot(format!(
                "assignment {} references undefined cluster",
                a.cluster_name
            )));
        }
    }

    Ok(())
}

fn prefix_match(prefix: &str) -> route::RouteMatch {
    route::RouteMatch {
        path_specifier: Some(route::route_match::PathSpecifier::Prefix(
            prefix.to_string(),
        )),
        ..Default::default()
    }
}

fn ads_config_source() -> core::ConfigSource {
    core::ConfigSource {
        config_source_specifier: Some(core::config_source::ConfigSourceSpecifier::Ads(
            core::AggregatedConfigSource::default(),
        )),
        resource_api_version: core::ApiVersion::V3 as i32,
        ..Default::default()
    }
}

fn socket_address(address: &str, port: u32) -> core::Address {
    core::Address {
        address: Some(core::address::Address::SocketAddress(core::SocketAddress {
            address: address.to_string(),
            port_specifier: Some(core::socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn lb_endpoint(address: &str, port: u32) -> endpoint::LbEndpoint {
    endpoint::LbEndpoint {
        host_identifier: Some(endpoint::lb_endpoint::HostIdentifier::Endpoint(
            endpoint::Endpoint {
                address: Some(socket_address(address, port)),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn any_of<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: message.encode_to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Subset, ViewEndpoint};

    fn view(name: &str, endpoints: Vec<ViewEndpoint>) -> ViewState {
        ViewState {
            name: name.to_string(),
            subset: Subset {
                cluster: "dev".to_string(),
                namespace: None,
            },
            endpoints,
        }
    }

    fn ready(address: &str) -> ViewEndpoint {
        ViewEndpoint {
            address: address.to_string(),
            port: 8080,
            ready: true,
        }
    }

    fn decode<M: Message + Default>(resource: &NamedResource) -> M {
        M::decode(resource.resource.value.as_slice()).expect("resource should decode")
    }

    #[test]
    fn empty_inventory_has_baseline_resources() {
        let snapshot = build_snapshot(1, &[], "gateway.test").unwrap();

        assert_eq!(snapshot.version(), "1");
        assert_eq!(snapshot.names_of(TYPE_LISTENER), vec!["main"]);
        assert_eq!(snapshot.names_of(TYPE_ROUTE), vec!["local_route"]);
        assert_eq!(snapshot.names_of(TYPE_CLUSTER), vec!["sidecar_api"]);
        assert!(snapshot.resources_of(TYPE_ENDPOINT).is_empty());
    }

    #[test]
    fn view_gets_eds_cluster_and_assignment() {
        let views = vec![view("test01", vec![ready("10.0.0.1")])];
        let snapshot = build_snapshot(1, &views, "gateway.test").unwrap();

        let names = snapshot.names_of(TYPE_CLUSTER);
        assert_eq!(names, vec!["sidecar_api", "view-test01"]);

        let view_cluster: cluster::Cluster = decode(&snapshot.resources_of(TYPE_CLUSTER)[1]);
        assert_eq!(
            view_cluster.cluster_discovery_type,
            Some(cluster::cluster::ClusterDiscoveryType::Type(
                cluster::cluster::DiscoveryType::Eds as i32
            ))
        );
        assert!(view_cluster.eds_cluster_config.is_some());

        let assignments = snapshot.resources_of(TYPE_ENDPOINT);
        assert_eq!(assignments.len(), 1);
        let cla: endpoint::ClusterLoadAssignment = decode(&assignments[0]);
        assert_eq!(cla.cluster_name, "view-test01");
        assert_eq!(cla.endpoints.len(), 1);
        assert_eq!(cla.endpoints[0].lb_endpoints.len(), 1);

        let ep = match &cla.endpoints[0].lb_endpoints[0].host_identifier {
            Some(endpoint::lb_endpoint::HostIdentifier::Endpoint(ep)) => ep,
            other => panic!("unexpected host identifier: {other:?}"),
        };
        let socket = match ep.address.as_ref().and_then(|a| a.address.as_ref()) {
            Some(core::address::Address::SocketAddress(sa)) => sa,
            other => panic!("unexpected address: {other:?}"),
        };
        assert_eq!(socket.address, "10.0.0.1");
        assert_eq!(
            socket.port_specifier,
            Some(core::socket_address::PortSpecifier::PortValue(8080))
        );
    }

    #[test]
    fn not_ready_endpoints_are_excluded() {
        let views = vec![view(
            "test01",
            vec![ready("10.0.0.1"), ViewEndpoint {
                address: "10.0.0.2".to_string(),
                port: 8080,
                ready: false,
            }],
        )];
        let snapshot = build_snapshot(1, &views, "gateway.test").unwrap();

        let cla: endpoint::ClusterLoadAssignment = decode(&snapshot.resources_of(TYPE_ENDPOINT)[0]);
        assert_eq!(cla.endpoints[0].lb_endpoints.len(), 1);
    }

    #[test]
    fn duplicate_addresses_collapse_in_assignment() {
        let views = vec![view("test01", vec![ready("10.0.0.1"), ready("10.0.0.1")])];
        let snapshot = build_snapshot(1, &views, "gateway.test").unwrap();

        let cla: endpoint::ClusterLoadAssignment = decode(&snapshot.resources_of(TYPE_ENDPOINT)[0]);
        assert_eq!(cla.endpoints[0].lb_endpoints.len(), 1);
    }

    #[test]
    fn cold_view_keeps_empty_assignment() {
        let views = vec![view("cold", vec![])];
        let snapshot = build_snapshot(1, &views, "gateway.test").unwrap();

        assert_eq!(snapshot.names_of(TYPE_ENDPOINT), vec!["view-cold"]);
        let cla: endpoint::ClusterLoadAssignment = decode(&snapshot.resources_of(TYPE_ENDPOINT)[0]);
        assert_eq!(cla.endpoints.len(), 1);
        assert!(cla.endpoints[0].lb_endpoints.is_empty());
    }

    #[test]
    fn view_virtual_host_domains_and_rewrite() {
        let views = vec![view("test01", vec![ready("10.0.0.1")])];
        let snapshot = build_snapshot(1, &views, "gateway.test").unwrap();

        let rc: route::RouteConfiguration = decode(&snapshot.resources_of(TYPE_ROUTE)[0]);
        assert_eq!(rc.virtual_hosts.len(), 2);

        let vh = rc
            .virtual_hosts
            .iter()
            .find(|vh| vh.name == "view-test01")
            .expect("view virtual host");
        assert_eq!(vh.domains, vec!["test01.gateway.test", "test01.*"]);

        let action = match &vh.routes[0].action {
            Some(route::route::Action::Route(a)) => a,
            other => panic!("unexpected action: {other:?}"),
        };
        assert_eq!(
            action.cluster_specifier,
            Some(route::route_action::ClusterSpecifier::Cluster(
                "view-test01".to_string()
            ))
        );
        assert_eq!(
            action.host_rewrite_specifier,
            Some(route::route_action::HostRewriteSpecifier::HostRewriteLiteral(
                "localhost".to_string()
            ))
        );
        assert_eq!(action.timeout, Some(Duration { seconds: 0, nanos: 0 }));
        let retry = action.retry_policy.as_ref().unwrap();
        assert_eq!(retry.retry_on, "connect-failure,reset");
        assert_eq!(retry.num_retries, Some(UInt32Value { value: 3 }));
    }

    #[test]
    fn default_virtual_host_bypasses_ext_authz() {
        let views = vec![view("abc", vec![])];
        let snapshot = build_snapshot(1, &views, "gateway.test").unwrap();

        let rc: route::RouteConfiguration = decode(&snapshot.resources_of(TYPE_ROUTE)[0]);
        let local = rc
            .virtual_hosts
            .iter()
            .find(|vh| vh.name == "local")
            .expect("default virtual host");
        assert_eq!(local.domains, vec!["*"]);
        assert_eq!(local.routes.len(), 2);

        let api_route = &local.routes[0];
        assert_eq!(
            api_route.r#match.as_ref().unwrap().path_specifier,
            Some(route::route_match::PathSpecifier::Prefix("/_api/".to_string()))
        );
        assert!(api_route.typed_per_filter_config.contains_key(EXT_AUTHZ_FILTER));

        let direct = &local.routes[1];
        let action = match &direct.action {
            Some(route::route::Action::DirectResponse(a)) => a,
            other => panic!("unexpected action: {other:?}"),
        };
        assert_eq!(action.status, 200);
        assert_eq!(
            action.body.as_ref().unwrap().specifier,
            Some(core::data_source::Specifier::InlineString(
                "gateway ok\n".to_string()
            ))
        );
        assert!(direct.typed_per_filter_config.contains_key(EXT_AUTHZ_FILTER));
    }

    #[test]
    fn listener_filter_chain_orders_ext_authz_before_router() {
        let snapshot = build_snapshot(1, &[], "gateway.test").unwrap();

        let l: listener::Listener = decode(&snapshot.resources_of(TYPE_LISTENER)[0]);
        let filter = &l.filter_chains[0].filters[0];
        let hcm_any = match &filter.config_type {
            Some(listener::filter::ConfigType::TypedConfig(any)) => any,
            other => panic!("unexpected filter config: {other:?}"),
        };
        let manager =
            hcm::HttpConnectionManager::decode(hcm_any.value.as_slice()).expect("hcm decodes");

        assert_eq!(manager.http_filters.len(), 2);
        assert_eq!(manager.http_filters[0].name, EXT_AUTHZ_FILTER);
        assert_eq!(manager.http_filters[1].name, ROUTER_FILTER);

        let authz_any = match &manager.http_filters[0].config_type {
            Some(hcm::http_filter::ConfigType::TypedConfig(any)) => any,
            other => panic!("unexpected authz config: {other:?}"),
        };
        let authz = ext_authz::ExtAuthz::decode(authz_any.value.as_slice()).unwrap();
        assert!(!authz.failure_mode_allow);
        let grpc = match authz.services {
            Some(ext_authz::ext_authz::Services::GrpcService(g)) => g,
            other => panic!("unexpected services: {other:?}"),
        };
        assert_eq!(
            grpc.timeout,
            Some(Duration { seconds: 65, nanos: 0 })
        );
    }

    #[test]
    fn output_is_sorted_by_view_name() {
        let views = vec![view("zzz", vec![]), view("aaa", vec![])];
        let snapshot = build_snapshot(1, &views, "gateway.test").unwrap();

        assert_eq!(
            snapshot.names_of(TYPE_CLUSTER),
            vec!["sidecar_api", "view-aaa", "view-zzz"]
        );
    }

    #[test]
    fn consistency_check_rejects_dangling_assignment() {
        let orphan = vec![endpoint::ClusterLoadAssignment {
            cluster_name: "view-ghost".to_string(),
            ..Default::default()
        }];
        let err = validate_consistency(&build_clusters(&[]), &build_route_config(&[], "g"), &orphan)
            .unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
    }
}
