//! Canonical entity linking.
//!
//! The linker maps mentions to canonical entities, creating new ones when no
//! existing entity is close enough. It is the only component that decides
//! entity creation and merging, but it performs no writes itself: the result
//! is a [`LinkPlan`] that the indexer applies inside the per-batch graph
//! transaction, keeping the stage pure and retryable.
//!
//! Matching, per mention:
//! 1. normalize the surface and compute the deterministic candidate id;
//! 2. exact id hit (in the plan so far or in the store) links at 1.0;
//! 3. otherwise score every same-type entity with
//!    `max(jaro_winkler, cosine-of-context-embeddings)` and apply the
//!    configured bands: ≥ exact threshold links and records an alias,
//!    fuzzy band links at a scaled confidence, below creates a new entity.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use strsim::jaro_winkler;
use tracing::debug;

use crate::error::EngineError;
use crate::ident;
use crate::model::{Entity, EntityType, Mention, Stage};
use crate::stores::{GraphQuery, GraphRow, labels};

use super::{IngestWork, PipelineStage, StageContext};

/// One planned `REFERS_TO` edge.
#[derive(Clone, Debug, PartialEq)]
pub struct RefersTo {
    pub mention_id: String,
    pub entity_id: String,
    pub confidence: f32,
}

/// Entity upserts plus mention links, applied atomically by the indexer.
#[derive(Clone, Debug, Default)]
pub struct LinkPlan {
    pub entities: Vec<Entity>,
    pub refers_to: Vec<RefersTo>,
    pub created: usize,
    pub linked_existing: usize,
}

/// Thresholds lifted out of the config for the pure matching path.
#[derive(Clone, Copy, Debug)]
pub struct LinkThresholds {
    pub exact: f32,
    pub fuzzy: f32,
}

pub struct EntityLinker;

impl Default for EntityLinker {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityLinker {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a mention batch against already-known entities.
    ///
    /// `existing` holds the store's current entities; the plan accumulates
    /// in-batch creations so later mentions in the same batch unify with them.
    pub fn resolve_batch(
        &self,
        mentions: &[Mention],
        existing: &[Entity],
        thresholds: LinkThresholds,
    ) -> LinkPlan {
        let mut plan = PlanBuilder::new(existing);
        for mention in mentions {
            self.link_one(mention, &mut plan, thresholds);
        }
        plan.finish()
    }

    fn link_one(&self, mention: &Mention, plan: &mut PlanBuilder<'_>, thresholds: LinkThresholds) {
        let normalized = ident::normalize_surface(&mention.surface_text);
        if normalized.is_empty() {
            return;
        }
        let candidate_id = ident::entity_id(&mention.surface_text, mention.entity_type);

        // Exact hit: the deterministic id already names a canonical entity.
        if plan.knows(&candidate_id) {
            plan.link(mention, &candidate_id, 1.0, None);
            return;
        }

        // Approximate match against same-type entities.
        let best = plan
            .same_type(mention.entity_type)
            .map(|entity| (entity.entity_id.clone(), entity_similarity(&normalized, entity, None)))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((winner_id, score)) if score >= thresholds.exact => {
                debug!(
                    target: "citeweave::linker",
                    surface = %mention.surface_text,
                    score,
                    "near-exact match; linking with alias"
                );
                plan.link(mention, &winner_id, scaled_confidence(score), Some(&normalized));
            }
            Some((winner_id, score)) if score >= thresholds.fuzzy => {
                plan.link(mention, &winner_id, scaled_confidence(score), None);
            }
            _ => {
                // The new entity is itself the ground truth.
                plan.create(mention, &candidate_id, &normalized);
            }
        }
    }
}

/// `max` of normalized-edit similarity (over the canonical name and every
/// alias) and context-embedding cosine when both sides carry one.
pub fn entity_similarity(
    normalized_surface: &str,
    entity: &Entity,
    surface_embedding: Option<&[f32]>,
) -> f32 {
    let mut best = jaro_winkler(
        normalized_surface,
        &ident::normalize_surface(&entity.canonical_name),
    ) as f32;
    for alias in &entity.aliases {
        best = best.max(jaro_winkler(normalized_surface, alias) as f32);
    }
    if let (Some(surface), Some(context)) = (surface_embedding, &entity.context_embedding) {
        best = best.max(cosine(surface, context));
    }
    best
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Confidence bands: similarity 0.90–0.99 rescales into [0.85, 0.99];
/// 0.70–0.90 rescales into [0.60, 0.85].
pub fn scaled_confidence(similarity: f32) -> f32 {
    if similarity >= 0.90 {
        (0.85 + (similarity - 0.90) / 0.09 * 0.14).clamp(0.85, 0.99)
    } else {
        (0.60 + (similarity - 0.70) / 0.20 * 0.25).clamp(0.60, 0.85)
    }
}

struct PlanBuilder<'a> {
    existing: &'a [Entity],
    existing_by_id: FxHashMap<&'a str, &'a Entity>,
    planned: Vec<Entity>,
    planned_index: FxHashMap<String, usize>,
    refers_to: Vec<RefersTo>,
    created: usize,
    linked_existing: usize,
}

impl<'a> PlanBuilder<'a> {
    fn new(existing: &'a [Entity]) -> Self {
        Self {
            existing,
            existing_by_id: existing
                .iter()
                .map(|entity| (entity.entity_id.as_str(), entity))
                .collect(),
            planned: Vec::new(),
            planned_index: FxHashMap::default(),
            refers_to: Vec::new(),
            created: 0,
            linked_existing: 0,
        }
    }

    fn knows(&self, entity_id: &str) -> bool {
        self.planned_index.contains_key(entity_id) || self.existing_by_id.contains_key(entity_id)
    }

    fn same_type(&self, entity_type: EntityType) -> impl Iterator<Item = &Entity> {
        let planned_index = &self.planned_index;
        self.planned
            .iter()
            .chain(self.existing.iter().filter(move |entity| {
                !planned_index.contains_key(entity.entity_id.as_str())
            }))
            .filter(move |entity| entity.entity_type == entity_type)
    }

    /// Ensure the target entity is staged in the plan, then record the link.
    fn link(&mut self, mention: &Mention, entity_id: &str, confidence: f32, alias: Option<&str>) {
        let idx = match self.planned_index.get(entity_id) {
            Some(&idx) => idx,
            None => {
                let base = self
                    .existing_by_id
                    .get(entity_id)
                    .map(|entity| (*entity).clone())
                    .expect("link target must exist in plan or store");
                self.planned.push(base);
                let idx = self.planned.len() - 1;
                self.planned_index.insert(entity_id.to_string(), idx);
                self.linked_existing += 1;
                idx
            }
        };
        let entity = &mut self.planned[idx];
        entity.mention_count += 1;
        if let Some(alias) = alias {
            let canonical = ident::normalize_surface(&entity.canonical_name);
            if alias != canonical && !entity.aliases.iter().any(|a| a == alias) {
                entity.aliases.push(alias.to_string());
            }
        }
        self.refers_to.push(RefersTo {
            mention_id: mention.mention_id.clone(),
            entity_id: entity_id.to_string(),
            confidence,
        });
    }

    fn create(&mut self, mention: &Mention, entity_id: &str, _normalized: &str) {
        let entity = Entity {
            entity_id: entity_id.to_string(),
            canonical_name: mention.surface_text.clone(),
            entity_type: mention.entity_type,
            aliases: Vec::new(),
            mention_count: 1,
            context_embedding: None,
        };
        self.planned.push(entity);
        self.planned_index
            .insert(entity_id.to_string(), self.planned.len() - 1);
        self.created += 1;
        self.refers_to.push(RefersTo {
            mention_id: mention.mention_id.clone(),
            entity_id: entity_id.to_string(),
            confidence: 1.0,
        });
    }

    fn finish(self) -> LinkPlan {
        LinkPlan {
            entities: self.planned,
            refers_to: self.refers_to,
            created: self.created,
            linked_existing: self.linked_existing,
        }
    }
}

/// Load every canonical entity currently in the graph store.
async fn load_store_entities(cx: &StageContext) -> Result<Vec<Entity>, EngineError> {
    let rows = cx
        .facade
        .graph
        .query(GraphQuery::NodesByLabel(labels::ENTITY.to_string()))
        .await?;
    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        if let GraphRow::Node { props, .. } = row {
            entities.push(serde_json::from_value::<Entity>(props).map_err(|err| {
                EngineError::integrity(format!("stored entity is malformed: {err}"))
            })?);
        }
    }
    Ok(entities)
}

#[async_trait]
impl PipelineStage for EntityLinker {
    fn stage(&self) -> Stage {
        Stage::Link
    }

    async fn run(
        &self,
        work: &mut IngestWork,
        cx: &StageContext,
    ) -> Result<Option<Value>, EngineError> {
        let thresholds = LinkThresholds {
            exact: cx.config.link_exact_threshold,
            fuzzy: cx.config.link_fuzzy_threshold,
        };
        let mut existing = load_store_entities(cx).await?;
        let mut combined = LinkPlan::default();

        for batch in work.mentions.chunks(cx.config.link_batch_size.max(1)) {
            cx.check_cancelled()?;
            let plan = self.resolve_batch(batch, &existing, thresholds);
            // Later batches must see this batch's decisions.
            for entity in &plan.entities {
                match existing.iter_mut().find(|e| e.entity_id == entity.entity_id) {
                    Some(slot) => *slot = entity.clone(),
                    None => existing.push(entity.clone()),
                }
            }
            merge_plans(&mut combined, plan);
        }

        let counters = serde_json::json!({
            "entities_found": combined.entities.len(),
            "entities_created": combined.created,
            "entities_linked": combined.linked_existing,
        });
        work.link_plan = Some(combined);
        Ok(Some(counters))
    }
}

fn merge_plans(into: &mut LinkPlan, from: LinkPlan) {
    for entity in from.entities {
        match into
            .entities
            .iter_mut()
            .find(|e| e.entity_id == entity.entity_id)
        {
            Some(slot) => *slot = entity,
            None => into.entities.push(entity),
        }
    }
    into.refers_to.extend(from.refers_to);
    into.created += from.created;
    into.linked_existing += from.linked_existing;
}
