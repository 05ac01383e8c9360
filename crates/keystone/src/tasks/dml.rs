use super::{DeleteRecord, InsertRecord, Services, partition_id, planned};
use crate::{
    allocator::{AllocationRange, SegmentAssignment},
    authority::CollectionInfo,
    bus::encode,
    error::{Error, Result},
    scheduler::{Task, TaskKind, TaskMeta, TaskOutput},
    schema::Row,
    types::UniqueId,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize)]
pub struct InsertRequest {
    pub collection: String,
    #[serde(default)]
    pub partition: Option<String>,
    pub rows: Vec<Row>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeleteRequest {
    pub collection: String,
    #[serde(default)]
    pub partition: Option<String>,
    pub primary_keys: Vec<i64>,
}

struct InsertPlan {
    collection_id: UniqueId,
    partition_id: UniqueId,
    row_ids: AllocationRange,
    segment: SegmentAssignment,
}

/// Inserts rows: one row identifier per row and a slot in a leased segment,
/// then a record on the collection's manipulation channel.
pub struct InsertTask {
    services: Arc<Services>,
    request: InsertRequest,
    plan: Option<InsertPlan>,
}

impl InsertTask {
    pub fn new(services: Arc<Services>, request: InsertRequest) -> Self {
        Self {
            services,
            request,
            plan: None,
        }
    }
}

fn row_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::invalid(format!("{len} rows exceed one request")))
}

#[tonic::async_trait]
impl Task for InsertTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Manipulation
    }

    fn target(&self) -> &str {
        &self.request.collection
    }

    fn name(&self) -> &'static str {
        "insert"
    }

    async fn pre_execute(&mut self, _meta: &TaskMeta) -> Result<()> {
        if self.request.rows.is_empty() {
            return Err(Error::invalid("insert carries no rows"));
        }
        let info = self.services.meta.get(&self.request.collection).await?;
        let partition_id = partition_id(&info, self.request.partition.as_deref())?;
        for row in &self.request.rows {
            info.schema.validate_row(row)?;
        }

        let rows = row_count(self.request.rows.len())?;
        let row_ids = self.services.ids.alloc(rows).await?;
        let channel = self.services.bus.manipulation_channel(info.id);
        let segment = self
            .services
            .segments
            .assign_segment(info.id, partition_id, &channel, u64::from(rows))
            .await?;
        self.plan = Some(InsertPlan {
            collection_id: info.id,
            partition_id,
            row_ids,
            segment,
        });
        Ok(())
    }

    async fn execute(&mut self, meta: &TaskMeta) -> Result<TaskOutput> {
        let plan = planned(self.plan.as_ref())?;
        let record = InsertRecord {
            collection_id: plan.collection_id,
            partition_id: plan.partition_id,
            segment_id: plan.segment.segment_id,
            row_offset: plan.segment.row_offset,
            first_row_id: plan.row_ids.start,
            timestamp: meta.timestamp,
            rows: self.request.rows.clone(),
        };
        let producer = self.services.producers.manipulation(plan.collection_id)?;
        let message_id = producer.publish(meta.timestamp, encode(&record)?).await?;
        tracing::debug!(
            task_id = meta.id,
            channel = producer.channel(),
            rows = plan.row_ids.len(),
            "Published insert"
        );
        Ok(TaskOutput::Inserted {
            first_row_id: plan.row_ids.start,
            row_count: plan.row_ids.len(),
            segment_id: plan.segment.segment_id,
            message_id,
            timestamp: meta.timestamp,
        })
    }
}

struct DeletePlan {
    collection_id: UniqueId,
    partition_id: UniqueId,
    segment: SegmentAssignment,
}

/// Deletes rows by primary key.
pub struct DeleteTask {
    services: Arc<Services>,
    request: DeleteRequest,
    plan: Option<DeletePlan>,
}

impl DeleteTask {
    pub fn new(services: Arc<Services>, request: DeleteRequest) -> Self {
        Self {
            services,
            request,
            plan: None,
        }
    }
}

fn require_primary_key(info: &CollectionInfo) -> Result<()> {
    if info.schema.fields.iter().any(|f| f.is_primary) {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "collection {} has no primary key to delete by",
            info.schema.name
        )))
    }
}

#[tonic::async_trait]
impl Task for DeleteTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Manipulation
    }

    fn target(&self) -> &str {
        &self.request.collection
    }

    fn name(&self) -> &'static str {
        "delete"
    }

    async fn pre_execute(&mut self, _meta: &TaskMeta) -> Result<()> {
        if self.request.primary_keys.is_empty() {
            return Err(Error::invalid("delete carries no primary keys"));
        }
        let info = self.services.meta.get(&self.request.collection).await?;
        require_primary_key(&info)?;
        let partition_id = partition_id(&info, self.request.partition.as_deref())?;

        let keys = u64::from(row_count(self.request.primary_keys.len())?);
        let channel = self.services.bus.manipulation_channel(info.id);
        let segment = self
            .services
            .segments
            .assign_segment(info.id, partition_id, &channel, keys)
            .await?;
        self.plan = Some(DeletePlan {
            collection_id: info.id,
            partition_id,
            segment,
        });
        Ok(())
    }

    async fn execute(&mut self, meta: &TaskMeta) -> Result<TaskOutput> {
        let plan = planned(self.plan.as_ref())?;
        let record = DeleteRecord {
            collection_id: plan.collection_id,
            partition_id: plan.partition_id,
            segment_id: plan.segment.segment_id,
            timestamp: meta.timestamp,
            primary_keys: self.request.primary_keys.clone(),
        };
        let producer = self.services.producers.manipulation(plan.collection_id)?;
        let message_id = producer.publish(meta.timestamp, encode(&record)?).await?;
        Ok(TaskOutput::Deleted {
            row_count: plan.segment.row_count,
            segment_id: plan.segment.segment_id,
            message_id,
            timestamp: meta.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authority::{Authority, LocalAuthority, SchemaChange},
        bus::InMemoryBus,
        schema::FieldValue,
        tasks::testing::{schema, services},
        types::Timestamp,
    };
    use tokio::time::Instant;

    fn meta(timestamp: u64) -> TaskMeta {
        TaskMeta {
            id: 7,
            timestamp: Timestamp::from_raw(timestamp),
            submitted_at: Instant::now(),
        }
    }

    fn row(pk: i64) -> Row {
        Row::from([
            ("pk".to_string(), FieldValue::Int64(pk)),
            ("embedding".to_string(), FieldValue::FloatVector(vec![0.5, 1.0])),
        ])
    }

    async fn setup() -> (Arc<Services>, InMemoryBus) {
        let authority = Arc::new(LocalAuthority::default());
        authority
            .apply_schema_change(SchemaChange::CreateCollection {
                schema: schema("docs"),
            })
            .await
            .unwrap();
        let bus = InMemoryBus::new();
        (services(&authority, &bus).await, bus)
    }

    #[tokio::test]
    async fn insert_publishes_a_timestamped_record() {
        let (services, bus) = setup().await;
        let mut task = InsertTask::new(
            services,
            InsertRequest {
                collection: "docs".into(),
                partition: None,
                rows: vec![row(1), row(2), row(3)],
            },
        );
        task.pre_execute(&meta(42)).await.unwrap();
        let output = task.execute(&meta(42)).await.unwrap();
        assert!(matches!(output, TaskOutput::Inserted { row_count: 3, .. }));

        let published = bus.messages("manipulation-0");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].timestamp, Timestamp::from_raw(42));
        let record: InsertRecord = published[0].decode().unwrap();
        assert_eq!(record.rows.len(), 3);
        assert_eq!(record.timestamp, Timestamp::from_raw(42));
    }

    #[tokio::test]
    async fn rows_not_matching_the_schema_are_rejected() {
        let (services, bus) = setup().await;
        let mut bad = row(1);
        bad.insert("embedding".into(), FieldValue::FloatVector(vec![1.0]));
        let mut task = InsertTask::new(
            services,
            InsertRequest {
                collection: "docs".into(),
                partition: None,
                rows: vec![bad],
            },
        );
        assert!(matches!(
            task.pre_execute(&meta(1)).await,
            Err(Error::ValidationFailed { .. })
        ));
        assert!(bus.messages("manipulation-0").is_empty());
    }

    #[tokio::test]
    async fn unknown_partitions_are_rejected() {
        let (services, _bus) = setup().await;
        let mut task = DeleteTask::new(
            services,
            DeleteRequest {
                collection: "docs".into(),
                partition: Some("nope".into()),
                primary_keys: vec![1],
            },
        );
        assert!(matches!(
            task.pre_execute(&meta(1)).await,
            Err(Error::ValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn delete_leases_slots_for_each_key() {
        let (services, bus) = setup().await;
        let mut task = DeleteTask::new(
            services,
            DeleteRequest {
                collection: "docs".into(),
                partition: None,
                primary_keys: vec![4, 5],
            },
        );
        task.pre_execute(&meta(9)).await.unwrap();
        let output = task.execute(&meta(9)).await.unwrap();
        assert!(matches!(output, TaskOutput::Deleted { row_count: 2, .. }));
        let record: DeleteRecord = bus.messages("manipulation-0")[0].decode().unwrap();
        assert_eq!(record.primary_keys, vec![4, 5]);
    }
}
