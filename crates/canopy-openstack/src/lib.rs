//! OpenStack inventory tables for Canopy.
//!
//! Every table is named `openstack_<service>_<resource>_<installation>` so
//! several installations can be synced side by side. Enable services via
//! feature flags.
//!
//! # Features
//!
//! - `compute` (default) - instances, with metadata, security groups and
//!   flavor extra specs as relations
//! - `networking` (default) - networks (with tags), ports, security groups
//!   and security group rules
//! - `blockstorage` (default) - volumes (with backups), attachments (with
//!   hosts), snapshots, QoS specs and availability zones
//! - `identity` (default) - projects (with compute limits) and users
//! - `baremetal` (default) - allocations and drivers
//!
//! Listings go through any [`canopy::ResourceProvider`]; resource kinds are
//! `<service>.<resource>`, e.g. `compute.servers`. [`FixtureProvider`] serves
//! them from JSON documents.

#[cfg(feature = "baremetal")]
pub mod baremetal;
#[cfg(feature = "blockstorage")]
pub mod blockstorage;
#[cfg(feature = "compute")]
pub mod compute;
#[cfg(feature = "identity")]
pub mod identity;
#[cfg(feature = "networking")]
pub mod networking;

mod common;
mod fixture;

pub use common::Link;
pub use fixture::FixtureProvider;

use canopy::{Catalog, Table};

/// Installation suffix used when none is configured.
pub const DEFAULT_INSTALLATION: &str = "default";

/// Full table name for a resource of a service.
pub fn table_name(service: &str, resource: &str, installation: &str) -> String {
    format!("openstack_{service}_{resource}_{installation}")
}

/// Register all enabled tables with the catalog.
pub fn register_all(catalog: &mut Catalog, installation: &str) {
    for table in tables(installation) {
        catalog.register(table);
    }
}

/// A catalog holding every enabled table.
pub fn catalog(installation: &str) -> Catalog {
    let mut catalog = Catalog::new();
    register_all(&mut catalog, installation);
    catalog
}

/// All enabled root tables, in declaration order.
pub fn tables(installation: &str) -> Vec<Table> {
    #[allow(unused_mut)]
    let mut tables = Vec::new();

    #[cfg(feature = "compute")]
    tables.extend(compute::tables(installation));

    #[cfg(feature = "networking")]
    tables.extend(networking::tables(installation));

    #[cfg(feature = "blockstorage")]
    tables.extend(blockstorage::tables(installation));

    #[cfg(feature = "identity")]
    tables.extend(identity::tables(installation));

    #[cfg(feature = "baremetal")]
    tables.extend(baremetal::tables(installation));

    tables
}

/// List enabled services.
pub fn enabled_services() -> Vec<&'static str> {
    vec![
        #[cfg(feature = "compute")]
        "compute",
        #[cfg(feature = "networking")]
        "networking",
        #[cfg(feature = "blockstorage")]
        "blockstorage",
        #[cfg(feature = "identity")]
        "identity",
        #[cfg(feature = "baremetal")]
        "baremetal",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name() {
        assert_eq!(
            table_name("compute", "instances", "prod"),
            "openstack_compute_instances_prod"
        );
    }

    #[test]
    fn test_catalog_builds() {
        let tree = catalog(DEFAULT_INSTALLATION).build().unwrap();
        assert_eq!(tree.roots().len(), tables(DEFAULT_INSTALLATION).len());
        assert!(tree.names().all(|name| name.starts_with("openstack_")));
        assert!(tree.names().all(|name| name.ends_with("_default")));
    }

    #[test]
    #[cfg(all(feature = "compute", feature = "identity"))]
    fn test_installations_do_not_collide() {
        let mut catalog = catalog("east");
        register_all(&mut catalog, "west");
        let tree = catalog.build().unwrap();
        assert!(tree.find("openstack_compute_instances_east").is_some());
        assert!(tree.find("openstack_compute_instances_west").is_some());
    }
}
