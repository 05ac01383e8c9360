//! Collection metadata cache.
//!
//! Tasks resolve collection names to ids, schemas and partitions here instead
//! of asking the authority on every request. DDL tasks invalidate the entry
//! they change; the next lookup re-describes the collection.

use crate::{
    authority::{Authority, CollectionInfo},
    error::{Error, Result},
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tonic::Code;

pub struct MetaCache {
    authority: Arc<dyn Authority>,
    entries: RwLock<HashMap<String, Arc<CollectionInfo>>>,
}

impl MetaCache {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self {
            authority,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Loads every collection the authority knows about. Returns how many
    /// were cached.
    pub async fn warm_up(&self) -> Result<usize> {
        let names = self.authority.show_collections().await?;
        let mut loaded = HashMap::with_capacity(names.len());
        for name in names {
            match self.authority.describe_collection(&name).await {
                Ok(info) => {
                    loaded.insert(name, Arc::new(info));
                }
                // Dropped between the listing and the describe.
                Err(Error::Authority {
                    code: Code::NotFound,
                    ..
                }) => {}
                Err(e) => return Err(e),
            }
        }
        let count = loaded.len();
        *self.entries.write() = loaded;
        tracing::info!(collections = count, "Metadata cache warmed up");
        Ok(count)
    }

    /// Resolves a collection, describing it on a miss.
    ///
    /// # Errors
    ///
    /// [`Error::ValidationFailed`] if the collection does not exist.
    pub async fn get(&self, name: &str) -> Result<Arc<CollectionInfo>> {
        if let Some(info) = self.entries.read().get(name) {
            return Ok(Arc::clone(info));
        }

        let info = match self.authority.describe_collection(name).await {
            Ok(info) => Arc::new(info),
            Err(Error::Authority {
                code: Code::NotFound,
                ..
            }) => {
                return Err(Error::invalid(format!("collection {name} does not exist")));
            }
            Err(e) => return Err(e),
        };
        self.entries
            .write()
            .insert(name.to_string(), Arc::clone(&info));
        Ok(info)
    }

    pub fn invalidate(&self, name: &str) {
        if self.entries.write().remove(name).is_some() {
            tracing::debug!(collection = name, "Invalidated cached metadata");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authority::{LocalAuthority, SchemaChange},
        schema::{CollectionSchema, DataType, FieldSchema},
    };

    fn schema(name: &str) -> CollectionSchema {
        CollectionSchema {
            name: name.into(),
            description: String::new(),
            fields: vec![FieldSchema {
                name: "pk".into(),
                data_type: DataType::Int64,
                is_primary: true,
            }],
        }
    }

    #[tokio::test]
    async fn warm_up_loads_existing_collections() {
        let authority = Arc::new(LocalAuthority::default());
        for name in ["a", "b"] {
            authority
                .apply_schema_change(SchemaChange::CreateCollection {
                    schema: schema(name),
                })
                .await
                .unwrap();
        }
        let cache = MetaCache::new(authority);
        assert_eq!(cache.warm_up().await.unwrap(), 2);
        assert_eq!(cache.get("a").await.unwrap().schema.name, "a");
    }

    #[tokio::test]
    async fn unknown_collections_fail_validation() {
        let cache = MetaCache::new(Arc::new(LocalAuthority::default()));
        assert!(matches!(
            cache.get("missing").await,
            Err(Error::ValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn invalidation_forces_a_fresh_describe() {
        let authority = Arc::new(LocalAuthority::default());
        authority
            .apply_schema_change(SchemaChange::CreateCollection {
                schema: schema("a"),
            })
            .await
            .unwrap();
        let cache = MetaCache::new(Arc::clone(&authority) as Arc<dyn Authority>);
        let before = cache.get("a").await.unwrap();
        assert!(!before.partitions.contains_key("p1"));

        authority
            .apply_schema_change(SchemaChange::CreatePartition {
                collection: "a".into(),
                partition: "p1".into(),
            })
            .await
            .unwrap();
        assert!(!cache.get("a").await.unwrap().partitions.contains_key("p1"));

        cache.invalidate("a");
        assert!(cache.get("a").await.unwrap().partitions.contains_key("p1"));
    }
}
