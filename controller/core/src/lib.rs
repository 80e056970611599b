#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod irules;
pub mod names;
pub mod profile;
pub mod store;
pub mod writer;

pub use self::{
    config::{
        Action, Condition, Member, MetaData, Monitor, Policy, Pool, ResourceConfig, ResourceType,
        Rule, ServiceKey, ServiceQueueKey, Virtual, VirtualAddress, DEFAULT_HTTPS_PORT,
        DEFAULT_HTTP_PORT, DEFAULT_PARTITION,
    },
    irules::{DataGroupRecord, IRule, InternalDataGroup, NameRef},
    profile::{CustomProfile, CustomProfileContext, ProfileRef, SecretKey},
    store::Resources,
    writer::{ConfigDocument, ConfigWriter},
};
