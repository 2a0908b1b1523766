use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clusters")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: String, // "PENDING" | "ONLINE" | "OFFLINE"
    pub agent_token_hash: String, // SHA-256 hex; the raw token is never stored
    pub metadata: Option<String>, // JSON: {vpc_id, vpc_cidr, region, registered_at}
    pub last_heartbeat: Option<i64>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
