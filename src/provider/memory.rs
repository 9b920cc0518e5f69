//! In-memory provider: JSON rows in per-entity maps, relation links as
//! id pairs and snapshot-based transactions. Backs the test suites and
//! any embedding that does not bring a real store.

use crate::error::ProviderError;
use crate::filter::{Condition, FilterExpression};
use crate::provider::{AttrKind, EntityType, Instance, PersistenceProvider};
use crate::spec::resolved::CmpOp;
use chrono::{Datelike, NaiveDate};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Default)]
struct StoreState {
    rows: HashMap<String, BTreeMap<i64, Map<String, Value>>>,
    /// `(entity, attribute)` to `(owner id, related id)` pairs.
    links: HashMap<(String, String), BTreeSet<(i64, i64)>>,
    next_id: i64,
}

pub struct MemoryProvider {
    types: HashMap<String, EntityType>,
    state: RefCell<StoreState>,
    snapshot: RefCell<Option<StoreState>>,
    relation_ops: Cell<usize>,
}

impl MemoryProvider {
    pub fn new(types: Vec<EntityType>) -> Self {
        MemoryProvider {
            types: types.into_iter().map(|t| (t.name.clone(), t)).collect(),
            state: RefCell::new(StoreState {
                next_id: 1,
                ..StoreState::default()
            }),
            snapshot: RefCell::new(None),
            relation_ops: Cell::new(0),
        }
    }

    /// Insert a row directly, for fixtures.
    pub fn seed(&self, entity: &str, attrs: Value) -> Result<i64, ProviderError> {
        let mut instance = Instance::new(entity);
        if let Value::Object(m) = attrs {
            instance.attrs = m;
        }
        let saved = self.insert(&instance)?;
        Ok(saved.id.unwrap_or_default())
    }

    /// Relation calls issued so far; lets tests assert that untouched
    /// memberships cost nothing.
    pub fn relation_op_count(&self) -> usize {
        self.relation_ops.get()
    }

    fn row(&self, entity: &str, id: i64) -> Option<Map<String, Value>> {
        self.state
            .borrow()
            .rows
            .get(entity)
            .and_then(|rows| rows.get(&id))
            .cloned()
    }

    fn matches(&self, entity: &str, id: i64, attrs: &Map<String, Value>, c: &Condition) -> bool {
        self.eval_path(entity, id, attrs, &c.path, c.op, &c.value)
    }

    fn eval_path(
        &self,
        entity: &str,
        id: i64,
        attrs: &Map<String, Value>,
        path: &[String],
        op: CmpOp,
        expected: &Value,
    ) -> bool {
        let Some((head, rest)) = path.split_first() else {
            return false;
        };
        if rest.is_empty() {
            return self.eval_terminal(entity, id, attrs, head, op, expected);
        }
        let Some(ty) = self.types.get(entity) else {
            return false;
        };
        match ty.attribute(head).map(|a| a.kind.clone()) {
            Some(AttrKind::BelongsTo { target }) => {
                let Some(related_id) = attrs.get(head).and_then(Value::as_i64) else {
                    return false;
                };
                let Some(related) = self.row(&target, related_id) else {
                    return false;
                };
                self.eval_path(&target, related_id, &related, rest, op, expected)
            }
            Some(AttrKind::HasMany {
                target,
                foreign_key,
            }) => {
                let rows = self
                    .state
                    .borrow()
                    .rows
                    .get(&target)
                    .map(|rows| {
                        rows.iter()
                            .filter(|(_, r)| r.get(&foreign_key).and_then(Value::as_i64) == Some(id))
                            .map(|(cid, r)| (*cid, r.clone()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                rows.iter()
                    .any(|(cid, r)| self.eval_path(&target, *cid, r, rest, op, expected))
            }
            Some(AttrKind::ManyToMany { target }) => {
                let members: Vec<i64> = self
                    .state
                    .borrow()
                    .links
                    .get(&(entity.to_string(), head.clone()))
                    .map(|set| {
                        set.iter()
                            .filter(|(owner, _)| *owner == id)
                            .map(|(_, related)| *related)
                            .collect()
                    })
                    .unwrap_or_default();
                members.iter().any(|mid| {
                    self.row(&target, *mid)
                        .is_some_and(|r| self.eval_path(&target, *mid, &r, rest, op, expected))
                })
            }
            _ => false,
        }
    }

    fn eval_terminal(
        &self,
        entity: &str,
        id: i64,
        attrs: &Map<String, Value>,
        attr: &str,
        op: CmpOp,
        expected: &Value,
    ) -> bool {
        if attr == "id" {
            return op_matches(op, &Value::from(id), expected);
        }
        let kind = self.types.get(entity).and_then(|t| t.attribute(attr)).map(|a| &a.kind);
        if let Some(AttrKind::ManyToMany { .. }) = kind {
            let links = self.state.borrow();
            let members = links
                .links
                .get(&(entity.to_string(), attr.to_string()))
                .map(|set| {
                    set.iter()
                        .filter(|(owner, _)| *owner == id)
                        .map(|(_, related)| Value::from(*related))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            return members.iter().any(|m| op_matches(op, m, expected));
        }
        let actual = attrs.get(attr).cloned().unwrap_or(Value::Null);
        op_matches(op, &actual, expected)
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn op_matches(op: CmpOp, actual: &Value, expected: &Value) -> bool {
    match op {
        CmpOp::Eq => loose_eq(actual, expected),
        CmpOp::In => expected
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| loose_eq(actual, c))),
        CmpOp::Gte | CmpOp::Lte => {
            let ordering = match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (actual.as_str(), expected.as_str()) {
                    (Some(a), Some(b)) => Some(a.cmp(b)),
                    _ => None,
                },
            };
            match ordering {
                Some(ord) if op == CmpOp::Gte => ord.is_ge(),
                Some(ord) => ord.is_le(),
                None => false,
            }
        }
        CmpOp::Month => {
            let Some(date) = actual
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(&s.chars().take(10).collect::<String>(), "%Y-%m-%d").ok())
            else {
                return false;
            };
            if let Some(month) = expected.as_i64() {
                return i64::from(date.month()) == month;
            }
            expected
                .as_str()
                .is_some_and(|token| date.format("%Y-%m").to_string() == token || i64::from(date.month()).to_string() == token)
        }
    }
}

impl PersistenceProvider for MemoryProvider {
    fn entity_type(&self, name: &str) -> Result<&EntityType, ProviderError> {
        self.types
            .get(name)
            .ok_or_else(|| ProviderError::UnknownEntity(name.into()))
    }

    fn get(&self, entity: &str, id: i64) -> Result<Option<Instance>, ProviderError> {
        self.entity_type(entity)?;
        Ok(self.row(entity, id).map(|attrs| Instance {
            entity: entity.into(),
            id: Some(id),
            attrs,
        }))
    }

    fn query(
        &self,
        entity: &str,
        filter: &FilterExpression,
    ) -> Result<Vec<Instance>, ProviderError> {
        self.entity_type(entity)?;
        let rows: Vec<(i64, Map<String, Value>)> = self
            .state
            .borrow()
            .rows
            .get(entity)
            .map(|rows| rows.iter().map(|(id, r)| (*id, r.clone())).collect())
            .unwrap_or_default();
        tracing::debug!(entity, conditions = filter.len(), "memory query");
        Ok(rows
            .into_iter()
            .filter(|(id, attrs)| filter.iter().all(|c| self.matches(entity, *id, attrs, c)))
            .map(|(id, attrs)| Instance {
                entity: entity.into(),
                id: Some(id),
                attrs,
            })
            .collect())
    }

    fn insert(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        self.entity_type(&instance.entity)?;
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state
            .rows
            .entry(instance.entity.clone())
            .or_default()
            .insert(id, instance.attrs.clone());
        Ok(Instance {
            entity: instance.entity.clone(),
            id: Some(id),
            attrs: instance.attrs.clone(),
        })
    }

    fn update(&self, instance: &Instance) -> Result<Instance, ProviderError> {
        self.entity_type(&instance.entity)?;
        let id = instance.id.ok_or_else(|| ProviderError::NotFound {
            entity: instance.entity.clone(),
            id: 0,
        })?;
        let mut state = self.state.borrow_mut();
        let rows = state
            .rows
            .entry(instance.entity.clone())
            .or_default();
        if !rows.contains_key(&id) {
            return Err(ProviderError::NotFound {
                entity: instance.entity.clone(),
                id,
            });
        }
        rows.insert(id, instance.attrs.clone());
        Ok(instance.clone())
    }

    fn delete(&self, entity: &str, id: i64) -> Result<(), ProviderError> {
        self.entity_type(entity)?;
        let mut state = self.state.borrow_mut();
        if let Some(rows) = state.rows.get_mut(entity) {
            rows.remove(&id);
        }
        for ((owner_entity, _), pairs) in state.links.iter_mut() {
            if owner_entity == entity {
                pairs.retain(|(owner, _)| *owner != id);
            }
        }
        Ok(())
    }

    fn relation_ids(&self, entity: &str, id: i64, attribute: &str) -> Result<Vec<i64>, ProviderError> {
        self.entity_type(entity)?;
        Ok(self
            .state
            .borrow()
            .links
            .get(&(entity.to_string(), attribute.to_string()))
            .map(|set| {
                set.iter()
                    .filter(|(owner, _)| *owner == id)
                    .map(|(_, related)| *related)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn relation_add(
        &self,
        entity: &str,
        id: i64,
        attribute: &str,
        related_id: i64,
    ) -> Result<(), ProviderError> {
        self.entity_type(entity)?;
        self.relation_ops.set(self.relation_ops.get() + 1);
        self.state
            .borrow_mut()
            .links
            .entry((entity.to_string(), attribute.to_string()))
            .or_default()
            .insert((id, related_id));
        Ok(())
    }

    fn relation_remove(
        &self,
        entity: &str,
        id: i64,
        attribute: &str,
        related_id: i64,
    ) -> Result<(), ProviderError> {
        self.entity_type(entity)?;
        self.relation_ops.set(self.relation_ops.get() + 1);
        if let Some(set) = self
            .state
            .borrow_mut()
            .links
            .get_mut(&(entity.to_string(), attribute.to_string()))
        {
            set.remove(&(id, related_id));
        }
        Ok(())
    }

    fn begin(&self) -> Result<(), ProviderError> {
        let mut snapshot = self.snapshot.borrow_mut();
        if snapshot.is_some() {
            return Err(ProviderError::TransactionActive);
        }
        *snapshot = Some(self.state.borrow().clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), ProviderError> {
        self.snapshot
            .borrow_mut()
            .take()
            .map(|_| ())
            .ok_or(ProviderError::NoTransaction)
    }

    fn rollback(&self) -> Result<(), ProviderError> {
        let restored = self
            .snapshot
            .borrow_mut()
            .take()
            .ok_or(ProviderError::NoTransaction)?;
        *self.state.borrow_mut() = restored;
        Ok(())
    }
}
