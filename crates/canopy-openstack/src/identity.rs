//! Identity (Keystone) tables.

use crate::table_name;
use canopy::{
    CollectContext, Collector, ColumnType, ItemStream, ListCollector, ListFilter, Record, Shape,
    Table, list_as,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const PROJECTS: &str = "identity.projects";
pub const USERS: &str = "identity.users";
/// Compute quota usage, listed per project.
pub const LIMITS: &str = "compute.limits";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub domain_id: String,
    pub parent_id: Option<String>,
    pub is_domain: bool,
    pub enabled: bool,
    pub tags: Vec<String>,
    pub links: IndexMap<String, String>,
}

impl Record for Project {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field("domain_id", ColumnType::String)
            .field("parent_id", ColumnType::String)
            .field("is_domain", ColumnType::Bool)
            .field("enabled", ColumnType::Bool)
            .field("tags", ColumnType::StringList)
            .field("links", ColumnType::Json)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub domain_id: String,
    pub default_project_id: Option<String>,
    pub enabled: bool,
    pub email: Option<String>,
    pub password_expires_at: Option<String>,
    pub links: IndexMap<String, String>,
}

impl Record for User {
    fn shape() -> Shape {
        Shape::new()
            .field("id", ColumnType::String)
            .field("name", ColumnType::String)
            .field("description", ColumnType::String)
            .field("domain_id", ColumnType::String)
            .field("default_project_id", ColumnType::String)
            .field("enabled", ColumnType::Bool)
            .field("email", ColumnType::String)
            .field("password_expires_at", ColumnType::Timestamp)
            .field("links", ColumnType::Json)
    }
}

/// Absolute compute limits of a project and its current usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectLimits {
    /// Set from the parent project; the limits listing does not carry it.
    pub project_id: String,
    #[serde(rename = "maxTotalCores")]
    pub max_total_cores: i64,
    #[serde(rename = "maxTotalInstances")]
    pub max_total_instances: i64,
    #[serde(rename = "maxTotalRAMSize")]
    pub max_total_ram_size: i64,
    #[serde(rename = "maxServerMeta")]
    pub max_server_meta: i64,
    #[serde(rename = "maxServerGroups")]
    pub max_server_groups: i64,
    #[serde(rename = "maxServerGroupMembers")]
    pub max_server_group_members: i64,
    #[serde(rename = "maxTotalKeypairs")]
    pub max_total_keypairs: i64,
    #[serde(rename = "totalCoresUsed")]
    pub total_cores_used: i64,
    #[serde(rename = "totalInstancesUsed")]
    pub total_instances_used: i64,
    #[serde(rename = "totalRAMUsed")]
    pub total_ram_used: i64,
    #[serde(rename = "totalServerGroupsUsed")]
    pub total_server_groups_used: i64,
}

impl Record for ProjectLimits {
    fn shape() -> Shape {
        Shape::new()
            .field("project_id", ColumnType::String)
            .field_as("maxTotalCores", "max_total_cores", ColumnType::Int)
            .field_as("maxTotalInstances", "max_total_instances", ColumnType::Int)
            .field_as("maxTotalRAMSize", "max_total_ram_size", ColumnType::Int)
            .field_as("maxServerMeta", "max_server_meta", ColumnType::Int)
            .field_as("maxServerGroups", "max_server_groups", ColumnType::Int)
            .field_as("maxServerGroupMembers", "max_server_group_members", ColumnType::Int)
            .field_as("maxTotalKeypairs", "max_total_keypairs", ColumnType::Int)
            .field_as("totalCoresUsed", "total_cores_used", ColumnType::Int)
            .field_as("totalInstancesUsed", "total_instances_used", ColumnType::Int)
            .field_as("totalRAMUsed", "total_ram_used", ColumnType::Int)
            .field_as("totalServerGroupsUsed", "total_server_groups_used", ColumnType::Int)
    }
}

/// Lists the compute limits scoped to the parent project.
pub struct ProjectLimitsCollector;

impl Collector for ProjectLimitsCollector {
    type Parent = Project;
    type Item = ProjectLimits;

    fn collect<'a>(&'a self, ctx: CollectContext<'a>, project: &'a Project) -> ItemStream<'a, ProjectLimits> {
        Box::pin(async_stream::stream! {
            if !ctx.is_cancelled() {
                let filter = ListFilter::new().with("tenant_id", project.id.as_str());
                match list_as::<ProjectLimits>(ctx.provider, LIMITS, &filter).await {
                    Ok(limits) => {
                        for mut limit in limits {
                            limit.project_id = project.id.clone();
                            yield Ok(limit);
                        }
                    }
                    Err(e) => {
                        tracing::error!(project = %project.id, error = %e, "listing limits failed");
                        yield Err(e);
                    }
                }
            }
        })
    }
}

pub fn tables(installation: &str) -> Vec<Table> {
    vec![projects(installation), users(installation)]
}

pub fn projects(installation: &str) -> Table {
    Table::builder(
        table_name("identity", "projects", installation),
        ListCollector::<Project>::new(PROJECTS),
    )
    .primary_keys(["id"])
    .skip_fields(["links"])
    .relation(
        Table::builder(
            table_name("compute", "project_limits", installation),
            ProjectLimitsCollector,
        )
        .description("Compute quota limits and usage of a project.")
        .primary_keys(["project_id"]),
    )
    .build()
}

pub fn users(installation: &str) -> Table {
    Table::builder(
        table_name("identity", "users", installation),
        ListCollector::<User>::new(USERS),
    )
    .primary_keys(["id"])
    .skip_fields(["links"])
    .build()
}
