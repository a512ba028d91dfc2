//! Bare metal (Ironic) tables.

use crate::{Link, table_name};
use canopy::{ColumnType, ListCollector, Record, Shape, Table};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ALLOCATIONS: &str = "baremetal.allocations";
pub const DRIVERS: &str = "baremetal.drivers";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Allocation {
    pub uuid: String,
    pub name: Option<String>,
    pub node_uuid: Option<String>,
    pub state: String,
    pub last_error: Option<String>,
    pub resource_class: String,
    pub traits: Vec<String>,
    pub candidate_nodes: Vec<String>,
    pub extra: IndexMap<String, Value>,
    pub owner: Option<String>,
    pub links: Vec<Link>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Record for Allocation {
    fn shape() -> Shape {
        Shape::new()
            .field("uuid", ColumnType::String)
            .field("name", ColumnType::String)
            .field("node_uuid", ColumnType::String)
            .field("state", ColumnType::String)
            .field("last_error", ColumnType::String)
            .field("resource_class", ColumnType::String)
            .field("traits", ColumnType::StringList)
            .field("candidate_nodes", ColumnType::StringList)
            .field("extra", ColumnType::Json)
            .field("owner", ColumnType::String)
            .field("links", ColumnType::Json)
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Driver {
    pub name: String,
    #[serde(rename = "type")]
    pub driver_type: String,
    pub hosts: Vec<String>,
    pub default_boot_interface: Option<String>,
    pub default_deploy_interface: Option<String>,
    pub default_management_interface: Option<String>,
    pub default_power_interface: Option<String>,
    pub enabled_boot_interfaces: Vec<String>,
    pub enabled_deploy_interfaces: Vec<String>,
    pub enabled_power_interfaces: Vec<String>,
    pub links: Vec<Link>,
    pub properties: Vec<Link>,
}

impl Record for Driver {
    fn shape() -> Shape {
        Shape::new()
            .field("name", ColumnType::String)
            .field_as("type", "driver_type", ColumnType::String)
            .field("hosts", ColumnType::StringList)
            .field("default_boot_interface", ColumnType::String)
            .field("default_deploy_interface", ColumnType::String)
            .field("default_management_interface", ColumnType::String)
            .field("default_power_interface", ColumnType::String)
            .field("enabled_boot_interfaces", ColumnType::StringList)
            .field("enabled_deploy_interfaces", ColumnType::StringList)
            .field("enabled_power_interfaces", ColumnType::StringList)
            .field("links", ColumnType::Json)
            .field("properties", ColumnType::Json)
    }
}

pub fn tables(installation: &str) -> Vec<Table> {
    vec![allocations(installation), drivers(installation)]
}

pub fn allocations(installation: &str) -> Table {
    Table::builder(
        table_name("baremetal", "allocations", installation),
        ListCollector::<Allocation>::new(ALLOCATIONS),
    )
    .primary_keys(["uuid"])
    .skip_fields(["links"])
    .build()
}

pub fn drivers(installation: &str) -> Table {
    Table::builder(
        table_name("baremetal", "drivers", installation),
        ListCollector::<Driver>::new(DRIVERS),
    )
    .primary_keys(["name"])
    .skip_fields(["links", "properties"])
    .build()
}
