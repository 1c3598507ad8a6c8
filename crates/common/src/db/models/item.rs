//! Item entity: catalog record of one uploaded file

use crate::errors::AppError;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Ingestion status of an item. `Pending` moves to exactly one terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemStatus::Pending)
    }
}

impl FromStr for ItemStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "success" => Ok(ItemStatus::Success),
            "failed" => Ok(ItemStatus::Failed),
            "cancelled" => Ok(ItemStatus::Cancelled),
            other => Err(AppError::Internal {
                message: format!("unknown item status '{}'", other),
            }),
        }
    }
}

impl From<ItemStatus> for String {
    fn from(status: ItemStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "items")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(indexed)]
    pub storage_id: Uuid,

    pub name: String,

    pub mime_type: String,

    pub size: i64,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub chunk_count: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub uploaded_at: DateTimeWithTimeZone,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Get the status as an enum; unknown values read as failed
    pub fn item_status(&self) -> ItemStatus {
        self.status.parse().unwrap_or(ItemStatus::Failed)
    }

    /// Check if ingestion has finished one way or another
    pub fn is_terminal(&self) -> bool {
        self.item_status().is_terminal()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::storage::Entity",
        from = "Column::StorageId",
        to = "super::storage::Column::Id",
        on_delete = "Cascade"
    )]
    Storage,
}

impl Related<super::storage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Storage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
