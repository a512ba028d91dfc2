//! Networking (Neutron) tables.

use crate::table_name;
use canopy::{Column, ColumnType, FromParent, ListCollector, Record, Shape, Step, Table, TransformChain};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NETWORKS: &str = "networking.networks";
pub const PORTS: &str = "networking.ports";
pub const SECURITY_GROUPS: &str = "networking.security_groups";
pub const SECURITY_GROUP_RULES: &str = "networking.security_group_rules";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub admin_state_up: bool,
    pub shared: bool,
    #[serde(rename = "router:external")]
    pub external: bool,
    pub mtu: Option<i64>,
    pub tenant_id: String,
    pub project_id: String,
    pub subnets: Vec<String>,
    pub availability_zones: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub revision_number: i64,
}

impl Record for Network {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field("status", ColumnType::String)
            .field("admin_state_up", ColumnType::Bool)
            .field("shared", ColumnType::Bool)
            .field_as("router:external", "external", ColumnType::Bool)
            .field("mtu", ColumnType::Int)
            .field("tenant_id", ColumnType::String)
            .field("project_id", ColumnType::String)
            .field("subnets", ColumnType::StringList)
            .field("availability_zones", ColumnType::StringList)
            .field("tags", ColumnType::StringList)
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
            .field("revision_number", ColumnType::Int)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkTag {
    pub network_id: String,
    pub value: String,
}

impl Record for NetworkTag {
    fn shape() -> Shape {
        Shape::new()
            .field("network_id", ColumnType::String)
            .field("value", ColumnType::String)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    pub name: String,
    pub description: Option<String>,
    pub admin_state_up: bool,
    pub status: String,
    pub mac_address: String,
    pub fixed_ips: Vec<FixedIp>,
    pub tenant_id: String,
    pub project_id: String,
    pub device_owner: String,
    pub device_id: String,
    pub security_groups: Vec<String>,
    pub allowed_address_pairs: Vec<Value>,
    pub tags: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Record for Port {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("network_id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field("admin_state_up", ColumnType::Bool)
            .field("status", ColumnType::String)
            .field("mac_address", ColumnType::String)
            .field("fixed_ips", ColumnType::Json)
            .field("tenant_id", ColumnType::String)
            .field("project_id", ColumnType::String)
            .field("device_owner", ColumnType::String)
            .field("device_id", ColumnType::String)
            .field("security_groups", ColumnType::StringList)
            .field("allowed_address_pairs", ColumnType::Json)
            .field("tags", ColumnType::StringList)
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub security_group_rules: Vec<SecurityGroupRule>,
    pub stateful: bool,
    pub tenant_id: String,
    pub project_id: String,
    pub tags: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Record for SecurityGroup {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field_as("security_group_rules", "rules", ColumnType::Json)
            .field("stateful", ColumnType::Bool)
            .field("tenant_id", ColumnType::String)
            .field("project_id", ColumnType::String)
            .field("tags", ColumnType::StringList)
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroupRule {
    pub id: String,
    pub direction: String,
    pub description: String,
    pub ethertype: String,
    pub security_group_id: String,
    pub port_range_min: Option<i64>,
    pub port_range_max: Option<i64>,
    pub protocol: Option<String>,
    pub remote_group_id: Option<String>,
    pub remote_ip_prefix: Option<String>,
    pub tenant_id: String,
    pub project_id: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Record for SecurityGroupRule {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("direction", ColumnType::String)
            .field("description", ColumnType::String)
            .field("ethertype", ColumnType::String)
            .field("security_group_id", ColumnType::String)
            .field("port_range_min", ColumnType::Int)
            .field("port_range_max", ColumnType::Int)
            .field("protocol", ColumnType::String)
            .field("remote_group_id", ColumnType::String)
            .field("remote_ip_prefix", ColumnType::String)
            .field("tenant_id", ColumnType::String)
            .field("project_id", ColumnType::String)
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
    }
}

pub fn tables(installation: &str) -> Vec<Table> {
    vec![
        networks(installation),
        ports(installation),
        security_groups(installation),
        security_group_rules(installation),
    ]
}

pub fn networks(installation: &str) -> Table {
    Table::builder(
        table_name("networking", "networks", installation),
        ListCollector::<Network>::new(NETWORKS),
    )
    .primary_keys(["id"])
    .relation(Table::builder(
        table_name("networking", "network_tags", installation),
        FromParent::new(network_tags),
    ))
    .build()
}

pub fn ports(installation: &str) -> Table {
    let addresses = TransformChain::path("fixed_ips.ip_address");
    Table::builder(
        table_name("networking", "ports", installation),
        ListCollector::<Port>::new(PORTS),
    )
    .primary_keys(["id"])
    .column(
        Column::new("ip_addresses", ColumnType::StringList)
            .extract(addresses.clone().then(Step::NilIfZero))
            .description("The IP addresses associated with the port."),
    )
    .column(
        Column::new("ip_address", ColumnType::String)
            .extract(
                addresses
                    .then(Step::GetElementAt(0))
                    .then(Step::NilIfZero),
            )
            .description("The first IP address associated with the port."),
    )
    .build()
}

pub fn security_groups(installation: &str) -> Table {
    Table::builder(
        table_name("networking", "security_groups", installation),
        ListCollector::<SecurityGroup>::new(SECURITY_GROUPS),
    )
    .primary_keys(["id"])
    .column(
        Column::new("security_group_rule_ids", ColumnType::StringList)
            .extract(TransformChain::path("security_group_rules.id").then(Step::NilIfZero))
            .description("The rules of the security group."),
    )
    .build()
}

pub fn security_group_rules(installation: &str) -> Table {
    Table::builder(
        table_name("networking", "security_group_rules", installation),
        ListCollector::<SecurityGroupRule>::new(SECURITY_GROUP_RULES),
    )
    .primary_keys(["id"])
    .build()
}

fn network_tags(network: &Network) -> Vec<NetworkTag> {
    network
        .tags
        .iter()
        .map(|tag| NetworkTag {
            network_id: network.id.clone(),
            value: tag.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy::{Datum, TableTree};
    use serde_json::json;

    fn row_for(table: &str, item: Value) -> canopy::OutputRow {
        let tree = TableTree::new(tables("t")).unwrap();
        tree.find(table).unwrap().rows(&item).remove(0)
    }

    #[test]
    fn test_port_addresses() {
        let port: Port = serde_json::from_value(json!({
            "id": "p1",
            "fixed_ips": [
                { "subnet_id": "s1", "ip_address": "10.0.0.5" },
                { "subnet_id": "s2", "ip_address": "fd00::5" }
            ]
        }))
        .unwrap();
        let row = row_for("openstack_networking_ports_t", serde_json::to_value(port).unwrap());
        assert_eq!(
            row.get("ip_addresses"),
            Some(&Datum::StringList(vec!["10.0.0.5".into(), "fd00::5".into()]))
        );
        assert_eq!(row.get("ip_address").and_then(Datum::as_str), Some("10.0.0.5"));
    }

    #[test]
    fn test_port_without_addresses() {
        let port: Port = serde_json::from_value(json!({ "id": "p2" })).unwrap();
        let row = row_for("openstack_networking_ports_t", serde_json::to_value(port).unwrap());
        assert_eq!(row.get("ip_addresses"), Some(&Datum::Null));
        assert_eq!(row.get("ip_address"), Some(&Datum::Null));
    }

    #[test]
    fn test_security_group_rule_ids() {
        let group: SecurityGroup = serde_json::from_value(json!({
            "id": "g1",
            "security_group_rules": [{ "id": "r1" }, { "id": "r2" }]
        }))
        .unwrap();
        let row = row_for(
            "openstack_networking_security_groups_t",
            serde_json::to_value(group).unwrap(),
        );
        assert_eq!(
            row.get("security_group_rule_ids"),
            Some(&Datum::StringList(vec!["r1".into(), "r2".into()]))
        );
        assert!(matches!(row.get("rules"), Some(Datum::Json(_))));
    }

    #[test]
    fn test_network_external_flag_and_tags() {
        let network: Network = serde_json::from_value(json!({
            "id": "n1",
            "router:external": true,
            "tags": ["prod", "edge"]
        }))
        .unwrap();
        let row = row_for(
            "openstack_networking_networks_t",
            serde_json::to_value(&network).unwrap(),
        );
        assert_eq!(row.get("external"), Some(&Datum::Bool(true)));

        let tags = network_tags(&network);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[1].value, "edge");
        assert!(tags.iter().all(|t| t.network_id == "n1"));
    }
}
