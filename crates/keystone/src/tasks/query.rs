use super::{SearchRecord, Services, planned};
use crate::{
    bus::encode,
    error::{Error, Result},
    scheduler::{Task, TaskKind, TaskMeta, TaskOutput},
    schema::DataType,
    types::UniqueId,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize)]
pub struct SearchRequest {
    pub collection: String,
    /// Partitions to search; all of them when empty.
    #[serde(default)]
    pub partitions: Vec<String>,
    pub field: String,
    pub vectors: Vec<Vec<f32>>,
    pub top_k: u32,
}

struct SearchPlan {
    collection_id: UniqueId,
    partition_ids: Vec<UniqueId>,
}

/// Validates a vector search and hands it to the query channel. Gathering
/// results is up to the consumers of that channel.
pub struct SearchTask {
    services: Arc<Services>,
    request: SearchRequest,
    plan: Option<SearchPlan>,
}

impl SearchTask {
    pub fn new(services: Arc<Services>, request: SearchRequest) -> Self {
        Self {
            services,
            request,
            plan: None,
        }
    }
}

#[tonic::async_trait]
impl Task for SearchTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Query
    }

    fn target(&self) -> &str {
        &self.request.collection
    }

    fn name(&self) -> &'static str {
        "search"
    }

    async fn pre_execute(&mut self, _meta: &TaskMeta) -> Result<()> {
        let request = &self.request;
        if request.top_k == 0 {
            return Err(Error::invalid("top_k must be positive"));
        }
        if request.vectors.is_empty() {
            return Err(Error::invalid("search carries no query vectors"));
        }

        let info = self.services.meta.get(&request.collection).await?;
        let dim = match info.schema.field(&request.field).map(|f| f.data_type) {
            Some(DataType::FloatVector { dim }) => dim as usize,
            Some(_) => {
                return Err(Error::invalid(format!(
                    "field {} is not a vector field",
                    request.field
                )));
            }
            None => {
                return Err(Error::invalid(format!(
                    "collection {} has no field {}",
                    request.collection, request.field
                )));
            }
        };
        if let Some(v) = request.vectors.iter().find(|v| v.len() != dim) {
            return Err(Error::invalid(format!(
                "query vector has dim {}, field {} expects {dim}",
                v.len(),
                request.field
            )));
        }

        let partition_ids = if request.partitions.is_empty() {
            info.partitions.values().copied().collect()
        } else {
            request
                .partitions
                .iter()
                .map(|name| {
                    info.partitions.get(name).copied().ok_or_else(|| {
                        Error::invalid(format!("partition {name} does not exist"))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        self.plan = Some(SearchPlan {
            collection_id: info.id,
            partition_ids,
        });
        Ok(())
    }

    async fn execute(&mut self, meta: &TaskMeta) -> Result<TaskOutput> {
        let plan = planned(self.plan.as_ref())?;
        let record = SearchRecord {
            request_id: meta.id,
            collection_id: plan.collection_id,
            partition_ids: plan.partition_ids.clone(),
            field: self.request.field.clone(),
            vectors: self.request.vectors.clone(),
            top_k: self.request.top_k,
            timestamp: meta.timestamp,
        };
        let message_id = self
            .services
            .producers
            .query()
            .publish(meta.timestamp, encode(&record)?)
            .await?;
        Ok(TaskOutput::SearchDispatched {
            message_id,
            timestamp: meta.timestamp,
        })
    }
}
