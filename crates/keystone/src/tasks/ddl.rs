use super::Services;
use crate::{
    authority::SchemaChange,
    error::{Error, Result},
    scheduler::{Task, TaskKind, TaskMeta, TaskOutput},
    schema::{DEFAULT_PARTITION, validate_name},
};
use std::sync::Arc;

/// A schema change, applied by the authority while the collection is held
/// exclusively.
pub struct DdlTask {
    services: Arc<Services>,
    change: SchemaChange,
}

impl DdlTask {
    pub fn new(services: Arc<Services>, change: SchemaChange) -> Self {
        Self { services, change }
    }
}

#[tonic::async_trait]
impl Task for DdlTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Ddl
    }

    fn target(&self) -> &str {
        self.change.collection()
    }

    fn name(&self) -> &'static str {
        self.change.op_name()
    }

    async fn pre_execute(&mut self, _meta: &TaskMeta) -> Result<()> {
        match &self.change {
            SchemaChange::CreateCollection { schema } => schema.validate(),
            SchemaChange::DropCollection { collection } => {
                self.services.meta.get(collection).await.map(drop)
            }
            SchemaChange::CreatePartition {
                collection,
                partition,
            } => {
                validate_name("partition", partition)?;
                let info = self.services.meta.get(collection).await?;
                if info.partitions.contains_key(partition) {
                    return Err(Error::invalid(format!(
                        "partition {partition} already exists in collection {collection}"
                    )));
                }
                Ok(())
            }
            SchemaChange::DropPartition {
                collection,
                partition,
            } => {
                if partition == DEFAULT_PARTITION {
                    return Err(Error::invalid("the default partition cannot be dropped"));
                }
                let info = self.services.meta.get(collection).await?;
                if !info.partitions.contains_key(partition) {
                    return Err(Error::invalid(format!(
                        "partition {partition} does not exist in collection {collection}"
                    )));
                }
                Ok(())
            }
        }
    }

    async fn execute(&mut self, meta: &TaskMeta) -> Result<TaskOutput> {
        let ack = self
            .services
            .authority
            .apply_schema_change(self.change.clone())
            .await?;
        tracing::info!(
            op = self.change.op_name(),
            collection = %ack.collection,
            collection_id = ack.collection_id,
            timestamp = %meta.timestamp,
            "Schema change applied"
        );
        Ok(TaskOutput::SchemaChanged {
            collection: ack.collection,
            collection_id: ack.collection_id,
            timestamp: meta.timestamp,
        })
    }

    async fn post_execute(&mut self, _meta: &TaskMeta, _outcome: &Result<TaskOutput>) -> Result<()> {
        // Even a failed change may have reached the authority.
        self.services.meta.invalidate(self.change.collection());
        Ok(())
    }
}
