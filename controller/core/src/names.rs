//! Name formatting for load-balancer objects derived from source resources.
//!
//! Several consumers parse these names back apart (event recording, route
//! garbage collection), so the formats are load-bearing.

/// Virtual-server name for a ConfigMap-defined virtual.
pub fn format_config_map_vs_name(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

/// Virtual-server name for an Ingress-defined virtual. One virtual exists
/// per required protocol, so the protocol is part of the name.
pub fn format_ingress_vs_name(namespace: &str, name: &str, protocol: &str) -> String {
    format!("{namespace}_{name}-ingress_{protocol}")
}

/// True if the virtual-server name was derived from an Ingress.
pub fn is_ingress_vs_name(rs_name: &str) -> bool {
    rs_name.contains("-ingress")
}

/// Recovers `(namespace, ingressName)` from an Ingress virtual-server name.
pub fn ingress_from_vs_name(rs_name: &str) -> Option<(&str, &str)> {
    let (namespace, rest) = rs_name.split_once('_')?;
    let name = rest.split("-ingress").next()?;
    if name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

pub fn format_ingress_pool_name(namespace: &str, service_name: &str) -> String {
    format!("ingress_{namespace}_{service_name}")
}

pub fn format_route_pool_name(namespace: &str, service_name: &str) -> String {
    format!("openshift_{namespace}_{service_name}")
}

/// Rule names embed the route namespace and name; `route_name_from_rule`
/// relies on this layout.
pub fn format_route_rule_name(namespace: &str, route_name: &str) -> String {
    format!("openshift_route_{namespace}_{route_name}")
}

pub fn route_name_from_rule(rule_name: &str) -> Option<&str> {
    rule_name.split('_').nth(3)
}

pub fn format_route_client_ssl_name(route_name: &str) -> String {
    format!("{route_name}-https-cert")
}

pub fn format_route_server_ssl_name(namespace: &str, route_name: &str) -> String {
    format!("{}-server-ssl", format_route_rule_name(namespace, route_name))
}

/// Normalizes a profile reference to a `partition/name` path; bare names are
/// passed through unchanged.
pub fn format_ingress_ssl_profile_name(secret_path: &str) -> String {
    secret_path.trim_start_matches('/').to_string()
}
