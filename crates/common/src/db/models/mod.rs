//! SeaORM entity models
//!
//! Relationships are plain foreign-key columns with lookup indexes:
//! storage 1-n item, storage 1-n chat, chat 1-n chat_message, chat 1-1 checkpoint.

mod chat;
mod chat_message;
mod checkpoint;
mod item;
mod storage;

pub use storage::{
    ActiveModel as StorageActiveModel, Column as StorageColumn, Entity as StorageEntity,
    Model as Storage,
};

pub use item::{
    ActiveModel as ItemActiveModel, Column as ItemColumn, Entity as ItemEntity, ItemStatus,
    Model as Item,
};

pub use chat::{
    ActiveModel as ChatActiveModel, Column as ChatColumn, Entity as ChatEntity, Model as Chat,
};

pub use chat_message::{
    ActiveModel as ChatMessageActiveModel, Column as ChatMessageColumn,
    Entity as ChatMessageEntity, MessageRole, Model as ChatMessage,
};

pub use checkpoint::{
    ActiveModel as CheckpointActiveModel, Column as CheckpointColumn,
    Entity as CheckpointEntity, Model as Checkpoint,
};
