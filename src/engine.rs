//! Single entry point tying resolution, reading, writing, search and
//! projection together over one provider.

use crate::error::BindError;
use crate::filter::{FilterBuilder, FilterExpression, RawQuery};
use crate::project::{self, InclusionMap, InclusionOption};
use crate::provider::{Instance, PersistenceProvider};
use crate::read::Reader;
use crate::spec::resolved::{FieldDescriptor, FieldKind};
use crate::spec::transform::TransformerRegistry;
use crate::spec::types::FieldSpec;
use crate::spec::Resolver;
use crate::write::{BlobMap, WriteTarget, Writer, Written};
use serde::Serialize;
use serde_json::Value;

/// Schema plus its current data, as handed to a client.
#[derive(Debug, Serialize)]
pub struct Form {
    pub schema: FieldDescriptor,
    pub data: Value,
}

pub struct Engine<'a> {
    provider: &'a dyn PersistenceProvider,
    transformers: TransformerRegistry,
}

impl<'a> Engine<'a> {
    pub fn new(provider: &'a dyn PersistenceProvider) -> Self {
        Engine {
            provider,
            transformers: TransformerRegistry::default(),
        }
    }

    pub fn with_transformers(
        provider: &'a dyn PersistenceProvider,
        transformers: TransformerRegistry,
    ) -> Self {
        Engine {
            provider,
            transformers,
        }
    }

    /// Resolve a spec tree against an entity type.
    pub fn resolve(&self, spec: &FieldSpec, entity: &str) -> Result<FieldDescriptor, BindError> {
        Resolver::new(self.provider, &self.transformers).resolve(spec, entity)
    }

    /// Resolve, then read the instance into a complete form.
    pub fn resolve_and_read(&self, spec: &FieldSpec, instance: &Instance) -> Result<Form, BindError> {
        let schema = self.resolve(spec, &instance.entity)?;
        let data = Reader::new(self.provider).read(instance, &schema)?;
        Ok(Form { schema, data })
    }

    /// Resolve a collection root and read the whole collection.
    pub fn resolve_and_read_bulk(&self, spec: &FieldSpec) -> Result<Form, BindError> {
        let entity = spec
            .entity
            .clone()
            .ok_or(crate::error::ConfigurationError::MissingListEntity)?;
        let schema = self.resolve(spec, &entity)?;
        let data = Reader::new(self.provider).read_bulk(&schema)?;
        Ok(Form { schema, data })
    }

    /// Apply a submission transactionally.
    pub fn write(
        &self,
        spec: &FieldSpec,
        target: WriteTarget,
        data: &Value,
        blobs: &BlobMap,
    ) -> Result<Written, BindError> {
        let entity = match &target {
            WriteTarget::Instance(instance) => instance.entity.clone(),
            WriteTarget::Bulk => spec
                .entity
                .clone()
                .ok_or(crate::error::ConfigurationError::MissingListEntity)?,
        };
        let schema = self.resolve(spec, &entity)?;
        Writer::new(self.provider).write(&schema, target, data, blobs)
    }

    /// Resolve a spec as a search form over an entity: relaxed schema,
    /// echoed query data and the provider constraint set.
    pub fn build_search(
        &self,
        spec: &FieldSpec,
        entity: &str,
        raw: &RawQuery,
    ) -> Result<(Form, FilterExpression), BindError> {
        let schema = self.resolve(spec, entity)?;
        let (relaxed, data, filters) = FilterBuilder::new(&self.transformers).build(&schema, raw)?;
        Ok((
            Form {
                schema: relaxed,
                data,
            },
            filters,
        ))
    }

    /// Run a search end to end: build constraints, query the provider.
    pub fn search(
        &self,
        spec: &FieldSpec,
        entity: &str,
        raw: &RawQuery,
    ) -> Result<(Form, Vec<Instance>), BindError> {
        let (form, filters) = self.build_search(spec, entity, raw)?;
        let query_entity = match form.schema.kind {
            FieldKind::List => form
                .schema
                .entity
                .clone()
                .ok_or(crate::error::ConfigurationError::MissingListEntity)?,
            _ => entity.to_string(),
        };
        let rows = self.provider.query(&query_entity, &filters)?;
        Ok((form, rows))
    }

    /// Prune a resolved tree by a deployment inclusion map.
    pub fn project(
        &self,
        desc: &FieldDescriptor,
        included: &InclusionMap,
    ) -> Option<FieldDescriptor> {
        project::project(desc, included)
    }

    /// Tunable leaves of a resolved tree, for deployment configuration.
    pub fn inclusion_options(
        &self,
        desc: &FieldDescriptor,
    ) -> (Vec<InclusionOption>, Vec<String>) {
        project::inclusion_options(desc)
    }
}
