//! Compute (Nova) tables.

use crate::{Link, table_name};
use canopy::{
    Column, ColumnType, FromParent, ListCollector, ListFilter, Record, Shape, Step, Table,
    TransformChain,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource kind of server listings.
pub const SERVERS: &str = "compute.servers";

/// A server, with the fields exposed by recent API microversions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub name: String,
    pub created: Option<String>,
    #[serde(rename = "OS-SRV-USG:launched_at")]
    pub launched_at: Option<String>,
    pub updated: Option<String>,
    #[serde(rename = "OS-SRV-USG:terminated_at")]
    pub terminated_at: Option<String>,
    #[serde(rename = "hostId")]
    pub host_id: String,
    pub status: String,
    pub progress: Option<i64>,
    #[serde(rename = "accessIPv4")]
    pub access_ipv4: String,
    #[serde(rename = "accessIPv6")]
    pub access_ipv6: String,
    /// `{"id": ...}`, or an empty string for servers booted from a volume.
    pub image: Value,
    pub flavor: Flavor,
    pub addresses: IndexMap<String, Vec<Address>>,
    pub metadata: IndexMap<String, String>,
    pub links: Vec<Link>,
    pub key_name: Option<String>,
    pub security_groups: Vec<SecurityGroupRef>,
    #[serde(rename = "os-extended-volumes:volumes_attached")]
    pub attached_volumes: Vec<AttachedVolume>,
    pub tags: Option<Vec<String>>,
    pub server_groups: Option<Vec<String>>,
    #[serde(rename = "OS-DCF:diskConfig")]
    pub disk_config: Option<String>,
    #[serde(rename = "OS-EXT-AZ:availability_zone")]
    pub availability_zone: Option<String>,
    #[serde(rename = "OS-EXT-SRV-ATTR:host")]
    pub host: Option<String>,
    #[serde(rename = "OS-EXT-SRV-ATTR:hypervisor_hostname")]
    pub hypervisor_hostname: Option<String>,
    #[serde(rename = "OS-EXT-SRV-ATTR:instance_name")]
    pub instance_name: Option<String>,
    #[serde(rename = "OS-EXT-STS:power_state")]
    pub power_state: Option<i64>,
    #[serde(rename = "OS-EXT-STS:vm_state")]
    pub vm_state: Option<String>,
    pub config_drive: Option<String>,
    pub description: Option<String>,
}

impl Record for Instance {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("tenant_id", ColumnType::String)
            .field("user_id", ColumnType::String)
            .field("name", ColumnType::String)
            .field_as("created", "created_at", ColumnType::Timestamp)
            .field_as("OS-SRV-USG:launched_at", "launched_at", ColumnType::Timestamp)
            .field_as("updated", "updated_at", ColumnType::Timestamp)
            .field_as("OS-SRV-USG:terminated_at", "terminated_at", ColumnType::Timestamp)
            .field_as("hostId", "host_id", ColumnType::String)
            .field("status", ColumnType::String)
            .field("progress", ColumnType::Int)
            .field_as("accessIPv4", "access_ipv4", ColumnType::String)
            .field_as("accessIPv6", "access_ipv6", ColumnType::String)
            .field("image", ColumnType::Json)
            .field("flavor", ColumnType::Json)
            .field("addresses", ColumnType::Json)
            .field("metadata", ColumnType::Json)
            .field("links", ColumnType::Json)
            .field("key_name", ColumnType::String)
            .field("security_groups", ColumnType::Json)
            .field_as(
                "os-extended-volumes:volumes_attached",
                "attached_volumes",
                ColumnType::Json,
            )
            .field("tags", ColumnType::StringList)
            .field("server_groups", ColumnType::StringList)
            .field_as("OS-DCF:diskConfig", "disk_config", ColumnType::String)
            .field_as("OS-EXT-AZ:availability_zone", "availability_zone", ColumnType::String)
            .field_as("OS-EXT-SRV-ATTR:host", "host", ColumnType::String)
            .field_as(
                "OS-EXT-SRV-ATTR:hypervisor_hostname",
                "hypervisor_hostname",
                ColumnType::String,
            )
            .field_as("OS-EXT-SRV-ATTR:instance_name", "instance_name", ColumnType::String)
            .field_as("OS-EXT-STS:power_state", "power_state_id", ColumnType::Int)
            .field_as("OS-EXT-STS:vm_state", "vm_state", ColumnType::String)
            .field("config_drive", ColumnType::String)
            .field("description", ColumnType::String)
    }
}

/// The flavor embedded in a server (microversion 2.47 and later).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Flavor {
    pub original_name: String,
    pub vcpus: i64,
    pub ram: i64,
    pub disk: i64,
    pub swap: i64,
    pub ephemeral: i64,
    pub extra_specs: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    #[serde(rename = "OS-EXT-IPS-MAC:mac_addr")]
    pub mac_address: Option<String>,
    #[serde(rename = "OS-EXT-IPS:type")]
    pub ip_type: Option<String>,
    pub addr: String,
    pub version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroupRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachedVolume {
    pub id: String,
    pub delete_on_termination: bool,
}

/// A key/value pair owned by an instance: a metadata entry or a flavor
/// extra spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceKeyValue {
    pub instance_id: String,
    pub key: String,
    pub value: String,
}

impl Record for InstanceKeyValue {
    fn shape() -> Shape {
        Shape::new()
            .field("instance_id", ColumnType::String)
            .field("key", ColumnType::String)
            .field("value", ColumnType::String)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSecurityGroup {
    pub instance_id: String,
    pub name: String,
}

impl Record for InstanceSecurityGroup {
    fn shape() -> Shape {
        Shape::new()
            .field("instance_id", ColumnType::String)
            .field("name", ColumnType::String)
    }
}

/// Nova power states; unknown codes pass through as numbers.
const POWER_STATES: [(i64, &str); 6] = [
    (0, "NOSTATE"),
    (1, "RUNNING"),
    (3, "PAUSED"),
    (4, "SHUTDOWN"),
    (6, "CRASHED"),
    (7, "SUSPENDED"),
];

pub fn tables(installation: &str) -> Vec<Table> {
    vec![instances(installation)]
}

pub fn instances(installation: &str) -> Table {
    let servers = ListCollector::<Instance>::new(SERVERS)
        .with_filter(ListFilter::new().with("all_tenants", true));

    Table::builder(table_name("compute", "instances", installation), servers)
        .description("Compute instances across all projects.")
        .primary_keys(["id"])
        .skip_fields(["links"])
        .column(
            flavor_column("flavor_name", "original_name", ColumnType::String)
                .description("The original name of the flavor used to start the instance."),
        )
        .column(
            flavor_column("flavor_vcpus", "vcpus", ColumnType::Int)
                .description("The number of virtual CPUs in the flavor used to start the instance."),
        )
        .column(
            extra_spec_count("flavor_vgpus", "resources:VGPU")
                .description("The number of virtual GPUs in the flavor used to start the instance."),
        )
        .column(
            extra_spec_count("flavor_cores", "hw:cpu_cores")
                .description("The number of virtual CPU cores in the flavor used to start the instance."),
        )
        .column(
            extra_spec_count("flavor_sockets", "hw:cpu_sockets")
                .description("The number of CPU sockets in the flavor used to start the instance."),
        )
        .column(
            flavor_column("flavor_ram", "ram", ColumnType::Int)
                .description("The amount of RAM in the flavor used to start the instance."),
        )
        .column(
            flavor_column("flavor_disk", "disk", ColumnType::Int)
                .description("The size of the disk in the flavor used to start the instance."),
        )
        .column(
            flavor_column("flavor_swap", "swap", ColumnType::Int)
                .description("The size of the swap disk in the flavor used to start the instance."),
        )
        .column(
            flavor_column("flavor_ephemeral", "ephemeral", ColumnType::Int)
                .description("The size of the ephemeral disk in the flavor used to start the instance."),
        )
        .column(
            Column::new("flavor_rng_allowed", ColumnType::Bool)
                .extract(extra_spec("hw_rng:allowed"))
                .description("Whether the RNG is allowed on the flavor used to start the instance."),
        )
        .column(
            Column::new("flavor_watchdog_action", ColumnType::String)
                .extract(extra_spec("hw:watchdog_action"))
                .description("The action taken when the watchdog detects the instance is not responding."),
        )
        .column(
            Column::new("image", ColumnType::String)
                .extract(
                    TransformChain::path("image")
                        .then(Step::get_map_entry("id"))
                        .then(Step::Trim)
                        .then(Step::NilIfZero),
                )
                .description("The image used to start the instance."),
        )
        .column(
            Column::new("attached_volume_ids", ColumnType::StringList)
                .extract(TransformChain::path("os-extended-volumes:volumes_attached.id"))
                .description("The volumes attached to the instance."),
        )
        .column(
            Column::new("power_state_name", ColumnType::String)
                .extract(
                    TransformChain::path("OS-EXT-STS:power_state")
                        .then(Step::remap(POWER_STATES)),
                )
                .description("The instance power state as a string."),
        )
        .relation(
            Table::builder(
                table_name("compute", "instance_metadata", installation),
                FromParent::new(metadata),
            )
            .description("Metadata key/value pairs of an instance."),
        )
        .relation(
            Table::builder(
                table_name("compute", "instance_security_groups", installation),
                FromParent::new(security_groups),
            )
            .description("Security groups an instance belongs to."),
        )
        .relation(
            Table::builder(
                table_name("compute", "instance_flavor_extra_specs", installation),
                FromParent::new(flavor_extra_specs),
            )
            .description("Extra specs of the flavor an instance was started with."),
        )
        .build()
}

fn flavor_column(name: &str, field: &str, ty: ColumnType) -> Column {
    Column::new(name, ty).extract(TransformChain::path(format!("flavor.{field}")))
}

fn extra_spec(key: &str) -> TransformChain {
    TransformChain::path("flavor.extra_specs").then(Step::get_map_entry(key))
}

/// Numeric extra spec, 0 when absent.
fn extra_spec_count(name: &str, key: &str) -> Column {
    Column::new(name, ColumnType::Int).extract(
        extra_spec(key)
            .then(Step::ToInt)
            .then(Step::or_default(0)),
    )
}

fn key_values(instance: &Instance, map: &IndexMap<String, String>) -> Vec<InstanceKeyValue> {
    map.iter()
        .map(|(key, value)| InstanceKeyValue {
            instance_id: instance.id.clone(),
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

fn metadata(instance: &Instance) -> Vec<InstanceKeyValue> {
    key_values(instance, &instance.metadata)
}

fn flavor_extra_specs(instance: &Instance) -> Vec<InstanceKeyValue> {
    key_values(instance, &instance.flavor.extra_specs)
}

fn security_groups(instance: &Instance) -> Vec<InstanceSecurityGroup> {
    instance
        .security_groups
        .iter()
        .map(|group| InstanceSecurityGroup {
            instance_id: instance.id.clone(),
            name: group.name.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy::{Datum, TableTree};
    use serde_json::json;

    fn server() -> Value {
        json!({
            "id": "9f1e",
            "tenant_id": "p1",
            "user_id": "u1",
            "name": "web-1",
            "created": "2024-03-01T09:30:00Z",
            "updated": "2024-03-02T10:00:00Z",
            "OS-SRV-USG:launched_at": "2024-03-01T09:31:12.000000",
            "OS-SRV-USG:terminated_at": null,
            "hostId": "abc",
            "status": "ACTIVE",
            "accessIPv4": "",
            "accessIPv6": "",
            "image": { "id": " img-1 ", "links": [] },
            "flavor": {
                "original_name": "m1.small",
                "vcpus": 2,
                "ram": 2048,
                "disk": 20,
                "swap": 0,
                "ephemeral": 0,
                "extra_specs": { "hw:cpu_cores": "2", "hw_rng:allowed": "True" }
            },
            "metadata": { "role": "web", "tier": "front" },
            "security_groups": [{ "name": "default" }, { "name": "web" }],
            "os-extended-volumes:volumes_attached": [{ "id": "v1" }, { "id": "v2" }],
            "OS-EXT-STS:power_state": 1,
            "links": [{ "href": "http://nova/servers/9f1e", "rel": "self" }]
        })
    }

    fn instance_rows(item: &Value) -> canopy::OutputRow {
        let tree = TableTree::new(tables("test")).unwrap();
        let node = tree.find("openstack_compute_instances_test").unwrap();
        let instance: Instance = serde_json::from_value(item.clone()).unwrap();
        let value = serde_json::to_value(&instance).unwrap();
        node.rows(&value).remove(0)
    }

    #[test]
    fn test_instance_columns() {
        let row = instance_rows(&server());
        assert_eq!(row.get("id").and_then(Datum::as_str), Some("9f1e"));
        assert_eq!(row.get("flavor_name").and_then(Datum::as_str), Some("m1.small"));
        assert_eq!(row.get("flavor_ram").and_then(Datum::as_int), Some(2048));
        assert_eq!(row.get("flavor_cores").and_then(Datum::as_int), Some(2));
        assert_eq!(row.get("flavor_vgpus").and_then(Datum::as_int), Some(0));
        assert_eq!(row.get("flavor_rng_allowed"), Some(&Datum::Bool(true)));
        assert_eq!(row.get("flavor_watchdog_action"), Some(&Datum::Null));
        assert_eq!(row.get("image").and_then(Datum::as_str), Some("img-1"));
        assert_eq!(row.get("power_state_name").and_then(Datum::as_str), Some("RUNNING"));
        assert_eq!(row.get("power_state_id").and_then(Datum::as_int), Some(1));
        assert_eq!(
            row.get("attached_volume_ids"),
            Some(&Datum::StringList(vec!["v1".into(), "v2".into()]))
        );
        assert!(matches!(row.get("launched_at"), Some(Datum::Timestamp(_))));
        assert_eq!(row.get("terminated_at"), Some(&Datum::Null));
        assert!(row.get("links").is_none());
    }

    #[test]
    fn test_unknown_power_state_passes_through() {
        let mut item = server();
        item["OS-EXT-STS:power_state"] = json!(2);
        item["image"] = json!("");
        let row = instance_rows(&item);
        assert_eq!(row.get("power_state_name").and_then(Datum::as_str), Some("2"));
        assert_eq!(row.get("image"), Some(&Datum::Null));
    }

    #[test]
    fn test_missing_power_state_is_null() {
        let mut item = server();
        item.as_object_mut().unwrap().remove("OS-EXT-STS:power_state");
        let row = instance_rows(&item);
        assert_eq!(row.get("power_state_id"), Some(&Datum::Null));
        assert_eq!(row.get("power_state_name"), Some(&Datum::Null));
    }

    #[test]
    fn test_relations_carry_instance_id() {
        let instance: Instance = serde_json::from_value(server()).unwrap();
        let pairs = metadata(&instance);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].key, "role");
        assert!(pairs.iter().all(|p| p.instance_id == "9f1e"));

        let specs = flavor_extra_specs(&instance);
        assert_eq!(specs[1].value, "True");

        let groups = security_groups(&instance);
        assert_eq!(
            groups.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
            vec!["default", "web"]
        );
    }

    #[test]
    fn test_relation_names() {
        let tree = TableTree::new(tables("prod")).unwrap();
        let root = tree.find("openstack_compute_instances_prod").unwrap();
        let children: Vec<_> = root
            .children()
            .iter()
            .map(|&id| tree.get(id).unwrap().name())
            .collect();
        assert_eq!(
            children,
            vec![
                "openstack_compute_instance_metadata_prod",
                "openstack_compute_instance_security_groups_prod",
                "openstack_compute_instance_flavor_extra_specs_prod",
            ]
        );
    }
}
