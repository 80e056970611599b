#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod route;

pub use self::route::{Route, RoutePort, RouteSpec, RouteTargetReference, TlsConfig, TlsTermination};
pub use k8s_openapi::{
    api::{
        core::v1::{
            ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, LoadBalancerIngress,
            LoadBalancerStatus, Namespace, Node, NodeAddress, NodeSpec, NodeStatus, Secret, Service,
            ServicePort, ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressStatus, IngressTLS, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::Time,
    ByteString, NamespaceResourceScope,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    runtime::{events, watcher},
    Client,
};
