//! Block storage (Cinder) tables.

use crate::{Link, table_name};
use canopy::{
    CollectContext, Collector, Column, ColumnType, FromParent, ItemStream, ListCollector,
    ListFilter, Record, Shape, Table, TransformChain, list_as,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VOLUMES: &str = "blockstorage.volumes";
pub const BACKUPS: &str = "blockstorage.backups";
pub const ATTACHMENTS: &str = "blockstorage.attachments";
pub const SNAPSHOTS: &str = "blockstorage.snapshots";
pub const QOS: &str = "blockstorage.qos";
pub const AVAILABILITY_ZONES: &str = "blockstorage.availability_zones";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub size: i64,
    pub availability_zone: String,
    pub volume_type: Option<String>,
    pub bootable: String,
    pub encrypted: bool,
    pub multiattach: bool,
    pub snapshot_id: Option<String>,
    pub source_volid: Option<String>,
    pub backup_id: Option<String>,
    pub user_id: String,
    #[serde(rename = "os-vol-tenant-attr:tenant_id")]
    pub tenant_id: Option<String>,
    #[serde(rename = "os-vol-host-attr:host")]
    pub host: Option<String>,
    pub metadata: IndexMap<String, String>,
    pub attachments: Vec<Value>,
    pub links: Vec<Link>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Record for Volume {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field("status", ColumnType::String)
            .field("size", ColumnType::Int)
            .field("availability_zone", ColumnType::String)
            .field("volume_type", ColumnType::String)
            .field("bootable", ColumnType::Bool)
            .field("encrypted", ColumnType::Bool)
            .field("multiattach", ColumnType::Bool)
            .field("snapshot_id", ColumnType::String)
            .field("source_volid", ColumnType::String)
            .field("backup_id", ColumnType::String)
            .field("user_id", ColumnType::String)
            .field_as("os-vol-tenant-attr:tenant_id", "tenant_id", ColumnType::String)
            .field_as("os-vol-host-attr:host", "host", ColumnType::String)
            .field("metadata", ColumnType::Json)
            .field("attachments", ColumnType::Json)
            .field("links", ColumnType::Json)
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Backup {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub volume_id: String,
    pub snapshot_id: Option<String>,
    pub status: String,
    pub size: i64,
    pub object_count: i64,
    pub container: Option<String>,
    pub has_dependent_backups: bool,
    pub fail_reason: Option<String>,
    pub is_incremental: bool,
    pub data_timestamp: Option<String>,
    #[serde(rename = "os-backup-project-attr:project_id")]
    pub project_id: Option<String>,
    pub metadata: Option<IndexMap<String, String>>,
    pub availability_zone: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Record for Backup {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field("volume_id", ColumnType::String)
            .field("snapshot_id", ColumnType::String)
            .field("status", ColumnType::String)
            .field("size", ColumnType::Int)
            .field("object_count", ColumnType::Int)
            .field("container", ColumnType::String)
            .field("has_dependent_backups", ColumnType::Bool)
            .field("fail_reason", ColumnType::String)
            .field("is_incremental", ColumnType::Bool)
            .field("data_timestamp", ColumnType::Timestamp)
            .field_as("os-backup-project-attr:project_id", "project_id", ColumnType::String)
            .field("metadata", ColumnType::Json)
            .field("availability_zone", ColumnType::String)
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub id: String,
    pub volume_id: String,
    #[serde(rename = "instance")]
    pub instance_id: Option<String>,
    pub status: String,
    pub attach_mode: Option<String>,
    pub attached_at: Option<String>,
    pub detached_at: Option<String>,
    pub connection_info: ConnectionInfo,
}

impl Record for Attachment {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("volume_id", ColumnType::String)
            .field_as("instance", "instance_id", ColumnType::String)
            .field("status", ColumnType::String)
            .field("attach_mode", ColumnType::String)
            .field("attached_at", ColumnType::Timestamp)
            .field("detached_at", ColumnType::Timestamp)
            .field("connection_info", ColumnType::Json)
    }
}

/// The subset of attachment connection info describing storage endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    pub driver_volume_type: Option<String>,
    pub hosts: Vec<String>,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentHost {
    pub attachment_id: String,
    pub host: String,
    pub port: String,
}

impl Record for AttachmentHost {
    fn shape() -> Shape {
        Shape::new()
            .field("attachment_id", ColumnType::String)
            .field("host", ColumnType::String)
            .field("port", ColumnType::Int)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub volume_id: String,
    pub status: String,
    pub size: i64,
    pub metadata: IndexMap<String, String>,
    #[serde(rename = "os-extended-snapshot-attributes:project_id")]
    pub project_id: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Record for Snapshot {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field("volume_id", ColumnType::String)
            .field("status", ColumnType::String)
            .field("size", ColumnType::Int)
            .field("metadata", ColumnType::Json)
            .field_as(
                "os-extended-snapshot-attributes:project_id",
                "project_id",
                ColumnType::String,
            )
            .field("created_at", ColumnType::Timestamp)
            .field("updated_at", ColumnType::Timestamp)
    }
}

/// A QoS specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QoS {
    pub id: String,
    pub name: String,
    pub consumer: String,
    pub specs: IndexMap<String, String>,
}

impl Record for QoS {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("consumer", ColumnType::String)
            .field("specs", ColumnType::Json)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityZone {
    #[serde(rename = "zoneName")]
    pub zone_name: String,
    #[serde(rename = "zoneState")]
    pub zone_state: ZoneState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneState {
    pub available: bool,
}

impl Record for AvailabilityZone {
    fn shape() -> Shape {
        Shape::new()
            .field_as("zoneName", "zone_name", ColumnType::String)
            .field_as("zoneState", "zone_state", ColumnType::Json)
    }
}

/// Lists the backups of the parent volume and emits them as one batch.
///
/// The table unnests the batch into one row per backup.
pub struct VolumeBackups;

impl Collector for VolumeBackups {
    type Parent = Volume;
    type Item = Vec<Backup>;

    fn collect<'a>(&'a self, ctx: CollectContext<'a>, volume: &'a Volume) -> ItemStream<'a, Vec<Backup>> {
        Box::pin(async_stream::stream! {
            if !ctx.is_cancelled() {
                let filter = ListFilter::new().with("volume_id", volume.id.as_str());
                match list_as::<Backup>(ctx.provider, BACKUPS, &filter).await {
                    Ok(backups) => {
                        tracing::debug!(volume = %volume.id, count = backups.len(), "streaming volume backups");
                        yield Ok(backups);
                    }
                    Err(e) => {
                        tracing::error!(volume = %volume.id, error = %e, "listing backups failed");
                        yield Err(e);
                    }
                }
            }
        })
    }
}

pub fn tables(installation: &str) -> Vec<Table> {
    vec![
        volumes(installation),
        attachments(installation),
        snapshots(installation),
        qos(installation),
        availability_zones(installation),
    ]
}

pub fn volumes(installation: &str) -> Table {
    Table::builder(
        table_name("blockstorage", "volumes", installation),
        ListCollector::<Volume>::new(VOLUMES)
            .with_filter(ListFilter::new().with("all_tenants", true)),
    )
    .primary_keys(["id"])
    .skip_fields(["links"])
    .relation(
        Table::builder(
            table_name("blockstorage", "volumes_backups", installation),
            VolumeBackups,
        )
        .primary_keys(["id"])
        .unnest(TransformChain::new()),
    )
    .build()
}

pub fn attachments(installation: &str) -> Table {
    Table::builder(
        table_name("blockstorage", "attachments", installation),
        ListCollector::<Attachment>::new(ATTACHMENTS),
    )
    .primary_keys(["id"])
    .relation(Table::builder(
        table_name("blockstorage", "attachment_hosts", installation),
        FromParent::new(attachment_hosts),
    ))
    .build()
}

pub fn snapshots(installation: &str) -> Table {
    Table::builder(
        table_name("blockstorage", "snapshots", installation),
        ListCollector::<Snapshot>::new(SNAPSHOTS)
            .with_filter(ListFilter::new().with("all_tenants", true)),
    )
    .primary_keys(["id"])
    .build()
}

pub fn qos(installation: &str) -> Table {
    Table::builder(
        table_name("blockstorage", "qos", installation),
        ListCollector::<QoS>::new(QOS),
    )
    .primary_keys(["id"])
    .build()
}

pub fn availability_zones(installation: &str) -> Table {
    Table::builder(
        table_name("blockstorage", "availability_zones", installation),
        ListCollector::<AvailabilityZone>::new(AVAILABILITY_ZONES),
    )
    .column(
        Column::new("available", ColumnType::Bool)
            .extract(TransformChain::path("zoneState.available"))
            .description("Whether the zone accepts new volumes."),
    )
    .build()
}

/// Storage endpoints of an attachment, paired positionally.
///
/// Nothing is emitted when the host and port lists differ in length.
fn attachment_hosts(attachment: &Attachment) -> Vec<AttachmentHost> {
    let info = &attachment.connection_info;
    if info.hosts.len() != info.ports.len() {
        tracing::debug!(
            attachment = %attachment.id,
            hosts = info.hosts.len(),
            ports = info.ports.len(),
            "host and port lists differ, skipping"
        );
        return Vec::new();
    }
    info.hosts
        .iter()
        .zip(&info.ports)
        .map(|(host, port)| AttachmentHost {
            attachment_id: attachment.id.clone(),
            host: host.clone(),
            port: port.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy::{Datum, TableTree};
    use serde_json::json;

    fn attachment(hosts: &[&str], ports: &[&str]) -> Attachment {
        serde_json::from_value(json!({
            "id": "att-1",
            "volume_id": "vol-1",
            "instance": "srv-1",
            "connection_info": { "driver_volume_type": "rbd", "hosts": hosts, "ports": ports }
        }))
        .unwrap()
    }

    #[test]
    fn test_attachment_hosts_zip() {
        let hosts = attachment_hosts(&attachment(&["10.0.0.1", "10.0.0.2"], &["6789", "6790"]));
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[1].host, "10.0.0.2");
        assert_eq!(hosts[1].port, "6790");
        assert!(hosts.iter().all(|h| h.attachment_id == "att-1"));
    }

    #[test]
    fn test_attachment_hosts_mismatch_yields_nothing() {
        assert!(attachment_hosts(&attachment(&["10.0.0.1", "10.0.0.2"], &["6789"])).is_empty());
    }

    #[test]
    fn test_attachment_host_port_is_int() {
        let tree = TableTree::new(tables("t")).unwrap();
        let node = tree.find("openstack_blockstorage_attachment_hosts_t").unwrap();
        let host = AttachmentHost {
            attachment_id: "att-1".into(),
            host: "10.0.0.1".into(),
            port: "6789".into(),
        };
        let row = node.rows(&serde_json::to_value(host).unwrap()).remove(0);
        assert_eq!(row.get("port"), Some(&Datum::Int(6789)));
    }

    #[test]
    fn test_backups_unnest_into_rows() {
        let tree = TableTree::new(tables("t")).unwrap();
        let node = tree.find("openstack_blockstorage_volumes_backups_t").unwrap();
        let batch: Vec<Backup> = serde_json::from_value(json!([
            { "id": "b1", "volume_id": "vol-1", "size": 10, "created_at": "2024-05-01T10:00:00.000000" },
            { "id": "b2", "volume_id": "vol-1", "size": 20, "is_incremental": true }
        ]))
        .unwrap();
        let rows = node.rows(&serde_json::to_value(&batch).unwrap());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("size").and_then(Datum::as_int), Some(10));
        assert!(matches!(rows[0].get("created_at"), Some(Datum::Timestamp(_))));
        assert_eq!(rows[1].get("is_incremental"), Some(&Datum::Bool(true)));

        let empty: Vec<Backup> = Vec::new();
        assert!(node.rows(&serde_json::to_value(&empty).unwrap()).is_empty());
    }

    #[test]
    fn test_availability_zone_columns() {
        let tree = TableTree::new(tables("t")).unwrap();
        let node = tree.find("openstack_blockstorage_availability_zones_t").unwrap();
        let zone: AvailabilityZone =
            serde_json::from_value(json!({ "zoneName": "nova", "zoneState": { "available": true } }))
                .unwrap();
        let row = node.rows(&serde_json::to_value(zone).unwrap()).remove(0);
        assert_eq!(row.get("zone_name").and_then(Datum::as_str), Some("nova"));
        assert_eq!(row.get("available"), Some(&Datum::Bool(true)));
    }
}
